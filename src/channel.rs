// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel over lapin
//!
//! This module is the production [`Transport`]: it opens lapin connections
//! with the configured heartbeat, locale and connection name, and adapts
//! lapin's error callbacks into [`CloseSignal`]s so the connector and the
//! consumer watchers can await broker-initiated closes.

use crate::{
    config::DialOptions,
    errors::AmqpError,
    transport::{AmqpChannel, AmqpConnection, CloseSignal, Transport},
};
use async_trait::async_trait;
use lapin::{
    options::BasicCancelOptions, types::LongString, uri::AMQPUri, Channel, ChannelState,
    Connection, ConnectionProperties, ConnectionState,
};
use std::ops::Deref;
use tracing::{debug, error};

/// Reply code sent with client-initiated closes.
const REPLY_SUCCESS: u16 = 200;

/// Converts a lapin error, recognising the conditions the failover logic
/// reacts to; anything else is wrapped by `wrap` with its message.
pub(crate) fn from_lapin(err: lapin::Error, wrap: impl FnOnce(String) -> AmqpError) -> AmqpError {
    match err {
        lapin::Error::InvalidChannelState(ChannelState::Closed)
        | lapin::Error::InvalidConnectionState(ConnectionState::Closed) => AmqpError::AlreadyClosed,
        lapin::Error::ChannelsLimitReached => AmqpError::ChannelsLimitReached,
        other => wrap(other.to_string()),
    }
}

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    type Connection = LapinConnection;

    async fn dial(&self, uri: &str, options: &DialOptions) -> Result<LapinConnection, AmqpError> {
        let mut amqp_uri: AMQPUri = uri.parse().map_err(AmqpError::ConnectionError)?;
        if amqp_uri.query.heartbeat.is_none() {
            let secs = options.heartbeat.as_secs().min(u64::from(u16::MAX));
            amqp_uri.query.heartbeat = Some(secs as u16);
        }

        let mut props = ConnectionProperties::default();
        props.locale = options.locale.clone();
        if let Some(name) = &options.connection_name {
            props = props.with_connection_name(LongString::from(name.clone()));
        }

        debug!("creating amqp connection...");
        let conn = match Connection::connect_uri(amqp_uri, props).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(from_lapin(err, AmqpError::ConnectionError))
            }
        }?;

        Ok(LapinConnection::new(conn))
    }
}

/// A lapin connection whose error callback feeds a [`CloseSignal`].
pub struct LapinConnection {
    conn: Connection,
    signal: CloseSignal,
}

impl LapinConnection {
    fn new(conn: Connection) -> Self {
        let signal = CloseSignal::new();
        let notifier = signal.clone();
        conn.on_error(move |err| {
            notifier.fire(AmqpError::BrokerClosed(err.to_string()));
        });

        LapinConnection { conn, signal }
    }

    /// The underlying lapin connection, e.g. to read its status.
    pub fn inner(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    type Channel = LapinChannel;

    async fn create_channel(&self) -> Result<LapinChannel, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!(id = c.id(), "channel created");
                Ok(LapinChannel::new(c))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(from_lapin(err, AmqpError::ChannelError))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let res = self
            .conn
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| from_lapin(err, AmqpError::CloseError));
        self.signal
            .fire(AmqpError::BrokerClosed("connection closed by client".to_owned()));
        res
    }

    async fn closed(&self) -> AmqpError {
        self.signal.closed().await
    }
}

/// A lapin channel; dereferences to [`lapin::Channel`] for declare/consume
/// calls made by consumers.
pub struct LapinChannel {
    channel: Channel,
    signal: CloseSignal,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        let signal = CloseSignal::new();
        let notifier = signal.clone();
        channel.on_error(move |err| {
            notifier.fire(AmqpError::BrokerClosed(err.to_string()));
        });

        LapinChannel { channel, signal }
    }
}

impl Deref for LapinChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn close(&self) -> Result<(), AmqpError> {
        let res = self
            .channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| from_lapin(err, AmqpError::CloseError));
        self.signal
            .fire(AmqpError::BrokerClosed("channel closed by client".to_owned()));
        res
    }

    async fn cancel_consumer(&self, tag: &str) -> Result<(), AmqpError> {
        debug!(tag, "cancelling consumer");
        self.channel
            .basic_cancel(tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), tag, "failure to cancel consumer");
                from_lapin(err, |_| AmqpError::CancelConsumerError(tag.to_owned()))
            })
    }

    async fn closed(&self) -> AmqpError {
        self.signal.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_states_map_to_already_closed() {
        let err = lapin::Error::InvalidChannelState(ChannelState::Closed);
        assert_eq!(from_lapin(err, AmqpError::CloseError), AmqpError::AlreadyClosed);

        let err = lapin::Error::InvalidConnectionState(ConnectionState::Closed);
        assert_eq!(from_lapin(err, AmqpError::CloseError), AmqpError::AlreadyClosed);
    }

    #[test]
    fn channel_limit_is_recognised() {
        let err = from_lapin(lapin::Error::ChannelsLimitReached, AmqpError::ChannelError);
        assert!(err.is_id_space_exhausted());
    }

    #[test]
    fn other_errors_keep_their_message() {
        let err = from_lapin(
            lapin::Error::InvalidChannelState(ChannelState::Initial),
            AmqpError::ChannelError,
        );
        assert!(matches!(err, AmqpError::ChannelError(msg) if !msg.is_empty()));
    }

    #[tokio::test]
    async fn rejects_malformed_uri() {
        let res = LapinTransport
            .dial("definitely not a uri", &DialOptions::default())
            .await;
        assert!(matches!(res, Err(AmqpError::ConnectionError(_))));
    }
}
