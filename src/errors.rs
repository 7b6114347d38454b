// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Failover Layer
//!
//! This module provides the single error type shared by the connector, the
//! consumer orchestrator and the lapin transport. Payloads are carried as
//! strings so errors can be cloned into events and aggregated across tasks.

use thiserror::Error;

/// Represents errors that can occur while keeping a RabbitMQ connection alive
/// and supervising consumers on top of it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The reconnect budget was exhausted; the connector can't dial anymore
    #[error("maximum attempts exceeded ({attempts}): {reason}")]
    MaxAttemptsExceeded { attempts: u32, reason: String },

    /// A live connection was required but none is currently offered
    #[error("no live connection")]
    NotConnected,

    /// The surrounding cancellation token fired
    #[error("operation canceled")]
    Canceled,

    /// The broker or the transport closed the connection or channel
    #[error("closed by broker: {0}")]
    BrokerClosed(String),

    /// The channel or connection had already been closed
    #[error("already closed")]
    AlreadyClosed,

    /// The connection ran out of channel identifiers
    #[error("channel id space exhausted")]
    ChannelsLimitReached,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error closing a channel or a connection
    #[error("failure to close: {0}")]
    CloseError(String),

    /// Consumer declaration failed
    #[error("failure to declare consumer: {0}")]
    DeclareError(String),

    /// Consumer run failed
    #[error("failed to consume: {0}")]
    ConsumeError(String),

    /// A consumer was started with zero workers
    #[error("consumer count must be at least 1")]
    InvalidConsumerCount,

    /// Error cancelling a consumer by tag
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Several tasks of one generation failed
    #[error("{} errors, first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Multiple(Vec<AmqpError>),
}

impl AmqpError {
    /// Closing something that is already closed is not a failure.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, AmqpError::AlreadyClosed)
    }

    /// Reports whether the broker side ran out of channel identifiers, in
    /// which case the connection has to be reopened.
    pub fn is_id_space_exhausted(&self) -> bool {
        match self {
            AmqpError::ChannelsLimitReached => true,
            AmqpError::ChannelError(msg) => msg.contains("id space exhausted"),
            _ => false,
        }
    }

    /// Wraps a channel acquisition failure, keeping cancellation and the
    /// id-space condition recognisable.
    pub(crate) fn channel(err: AmqpError) -> AmqpError {
        match err {
            AmqpError::Canceled | AmqpError::ChannelsLimitReached | AmqpError::ChannelError(_) => {
                err
            }
            other => AmqpError::ChannelError(other.to_string()),
        }
    }

    /// Turns a close result into the cleanup policy: `AlreadyClosed` is fine.
    pub(crate) fn tolerate_closed(res: Result<(), AmqpError>) -> Result<(), AmqpError> {
        match res {
            Err(err) if err.is_already_closed() => Ok(()),
            Err(AmqpError::CloseError(msg)) => Err(AmqpError::CloseError(msg)),
            Err(err) => Err(AmqpError::CloseError(err.to_string())),
            Ok(()) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_closed_is_tolerated() {
        assert_eq!(AmqpError::tolerate_closed(Err(AmqpError::AlreadyClosed)), Ok(()));
        assert_eq!(
            AmqpError::tolerate_closed(Err(AmqpError::InternalError)),
            Err(AmqpError::CloseError("internal error".to_owned()))
        );
    }

    #[test]
    fn id_space_detection() {
        assert!(AmqpError::ChannelsLimitReached.is_id_space_exhausted());
        assert!(AmqpError::ChannelError("channel id space exhausted".to_owned())
            .is_id_space_exhausted());
        assert!(!AmqpError::ChannelError("boom".to_owned()).is_id_space_exhausted());
    }

    #[test]
    fn channel_wrapping_keeps_cancellation() {
        assert_eq!(AmqpError::channel(AmqpError::Canceled), AmqpError::Canceled);
        assert_eq!(
            AmqpError::channel(AmqpError::AlreadyClosed),
            AmqpError::ChannelError("already closed".to_owned())
        );
    }

    #[test]
    fn multiple_reports_first() {
        let err = AmqpError::Multiple(vec![AmqpError::Canceled, AmqpError::InternalError]);
        assert_eq!(err.to_string(), "2 errors, first: operation canceled");
    }
}
