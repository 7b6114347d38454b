// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The connector and the consumer orchestrator never talk to `lapin`
//! directly; they go through these traits. [`crate::channel`] provides the
//! lapin implementation, tests provide in-memory ones.

use crate::{config::DialOptions, errors::AmqpError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

#[cfg(test)]
use mockall::automock;

/// Something able to open connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: AmqpConnection;

    /// Opens one connection; no retry happens here.
    async fn dial(&self, uri: &str, options: &DialOptions) -> Result<Self::Connection, AmqpError>;
}

/// One live broker connection multiplexing many channels.
#[async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    type Channel: AmqpChannel;

    async fn create_channel(&self) -> Result<Self::Channel, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Resolves once the connection is gone, with the reported reason.
    /// Client-initiated closes resolve it too.
    async fn closed(&self) -> AmqpError;
}

/// A logical channel owned by one worker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    async fn close(&self) -> Result<(), AmqpError>;

    /// Cancels the consumer registered under `tag` on this channel.
    async fn cancel_consumer(&self, tag: &str) -> Result<(), AmqpError>;

    /// Resolves once the channel is gone, with the reported reason.
    async fn closed(&self) -> AmqpError;
}

/// Channel type produced by a transport's connections.
pub type ChannelOf<T> = <<T as Transport>::Connection as AmqpConnection>::Channel;

/// Set-once close notification with any number of waiters.
///
/// The first reason fired is kept; later ones are ignored.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<AmqpError>>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        CloseSignal { tx: Arc::new(tx) }
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `reason`; returns false if the signal had already fired.
    pub fn fire(&self, reason: AmqpError) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits until the signal fires and returns the first reason.
    pub async fn closed(&self) -> AmqpError {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone(),
            Err(_) => None,
        };
        reason.unwrap_or(AmqpError::AlreadyClosed)
    }
}
