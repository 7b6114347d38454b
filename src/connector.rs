// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Connection Failover
//!
//! The [`Connector`] keeps exactly one broker connection alive and hands out
//! fresh channels from it.
//!
//! ```text
//! dial_config ─► dial (retry up to budget, Retried per failure)
//!      ▲             │
//!      │             ▼
//!      │        offer conn on hand-off ─► Dialed
//!      │             │
//!      │     ┌───────┴────────┐
//!      │     ▼                ▼
//!      └─ closed()        token cancelled
//!   (AmqpNotified)     (withdraw, close, Canceled)
//! ```
//!
//! The hand-off is a `watch` slot written only by the dial loop. Requesters
//! in [`Connector::channel`] wait until it holds a connection; the dial loop
//! empties it before closing or replacing the connection, so no requester
//! can pick up a connection the loop is done with.

use crate::{
    channel::LapinTransport,
    config::{ConnectorConfig, DialOptions},
    errors::AmqpError,
    events::{AmqpNotified, Dialed, Listeners, Retried},
    transport::{AmqpConnection, ChannelOf, Transport},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{select, sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type HandOff<C> = watch::Sender<Option<Arc<C>>>;

/// Keeps a RabbitMQ connection alive and serves channels from it.
///
/// Listeners must be registered before the connector is shared: the
/// `add_*_listener` methods take `&mut self`, emission only needs `&self`.
pub struct Connector<T: Transport = LapinTransport> {
    pub(crate) cfg: ConnectorConfig,
    transport: T,
    handoff: HandOff<T::Connection>,
    spent: AtomicBool,
    listeners: Listeners,
}

impl Connector<LapinTransport> {
    /// Creates a connector dialing RabbitMQ through lapin.
    ///
    /// Nothing is dialed until [`Connector::dial`] runs; register the
    /// listeners first.
    ///
    /// # Parameters
    /// * `cfg` - Reconnect policy used by the dial loop and the consumer generations
    ///
    /// # Returns
    /// * `Connector` - An idle connector without a connection
    pub fn new(cfg: ConnectorConfig) -> Self {
        Self::with_transport(cfg, LapinTransport)
    }
}

impl<T: Transport> Connector<T> {
    /// Creates a connector over any [`Transport`], such as an in-memory one
    /// in tests.
    ///
    /// # Parameters
    /// * `cfg` - Reconnect policy used by the dial loop and the consumer generations
    /// * `transport` - Opens the broker connections
    ///
    /// # Returns
    /// * `Connector<T>` - An idle connector without a connection
    pub fn with_transport(cfg: ConnectorConfig, transport: T) -> Self {
        let (handoff, _) = watch::channel(None);
        Connector {
            cfg,
            transport,
            handoff,
            spent: AtomicBool::new(false),
            listeners: Listeners::default(),
        }
    }

    /// The reconnect policy this connector was built with.
    pub fn config(&self) -> &ConnectorConfig {
        &self.cfg
    }

    /// Registers a listener of failed dial attempts.
    pub fn add_retried_listener(&mut self, h: impl Fn(Retried) + Send + Sync + 'static) {
        self.listeners.on_retried(h);
    }

    /// Registers a listener of successfully established connections.
    pub fn add_dialed_listener(&mut self, h: impl Fn(Dialed) + Send + Sync + 'static) {
        self.listeners.on_dialed(h);
    }

    /// Registers a listener of broker-initiated connection and channel closes.
    pub fn add_amqp_notified_listener(&mut self, h: impl Fn(AmqpNotified) + Send + Sync + 'static) {
        self.listeners.on_notified(h);
    }

    pub(crate) fn emit_notified(&self, n: AmqpNotified) {
        self.listeners.emit_notified(n);
    }

    /// Keeps a connection to `uri` alive with the default [`DialOptions`].
    ///
    /// See [`Connector::dial_config`].
    pub async fn dial(&self, token: &CancellationToken, uri: &str) -> Result<(), AmqpError> {
        self.dial_config(token, uri, &DialOptions::default()).await
    }

    /// Keeps a connection to `uri` alive until `token` is cancelled.
    ///
    /// Broker-initiated closes trigger a new dial cycle and are only visible
    /// through the `AmqpNotified` listeners. The call returns:
    /// - `Canceled` once `token` fires (after closing the connection),
    /// - `MaxAttemptsExceeded` when a dial cycle used up the whole budget.
    ///   The connector is spent afterwards and every further dial fails the
    ///   same way.
    pub async fn dial_config(
        &self,
        token: &CancellationToken,
        uri: &str,
        options: &DialOptions,
    ) -> Result<(), AmqpError> {
        if self.spent.load(Ordering::Acquire) {
            return Err(AmqpError::MaxAttemptsExceeded {
                attempts: self.cfg.attempts(),
                reason: "connector already exhausted its reconnect budget".to_owned(),
            });
        }

        loop {
            let conn = match self.dial_with_retry(token, uri, options).await {
                Ok(conn) => Arc::new(conn),
                Err(err) => {
                    if matches!(err, AmqpError::MaxAttemptsExceeded { .. }) {
                        self.spent.store(true, Ordering::Release);
                    }
                    error!(error = err.to_string(), "failed to dial");
                    return Err(err);
                }
            };

            self.handoff.send_replace(Some(conn.clone()));
            self.listeners.emit_dialed(Dialed);

            select! {
                _ = token.cancelled() => {
                    self.handoff.send_replace(None);
                    debug!("closing amqp connection");
                    AmqpError::tolerate_closed(conn.close().await)?;
                    return Err(AmqpError::Canceled);
                }
                reason = conn.closed() => {
                    self.handoff.send_replace(None);
                    self.listeners.emit_notified(AmqpNotified { error: reason });
                }
            }
        }
    }

    /// One dial cycle: up to `attempts` tries with a fixed wait in between.
    async fn dial_with_retry(
        &self,
        token: &CancellationToken,
        uri: &str,
        options: &DialOptions,
    ) -> Result<T::Connection, AmqpError> {
        let attempts = self.cfg.attempts();
        let mut last = AmqpError::InternalError;

        for attempt in 1..=attempts {
            debug!(attempt, "dialing amqp broker...");
            let res = select! {
                _ = token.cancelled() => return Err(AmqpError::Canceled),
                res = self.transport.dial(uri, options) => res,
            };

            let err = match res {
                Ok(conn) => return Ok(conn),
                Err(err) => err,
            };

            self.listeners.emit_retried(Retried {
                attempt,
                error: err.clone(),
            });
            last = err;

            if attempt == attempts {
                break;
            }

            select! {
                _ = token.cancelled() => return Err(AmqpError::Canceled),
                _ = time::sleep(self.cfg.wait) => {}
            }
        }

        Err(AmqpError::MaxAttemptsExceeded {
            attempts,
            reason: last.to_string(),
        })
    }

    /// Opens a new channel on the live connection, waiting for one to be
    /// established if needed.
    ///
    /// A failed channel should be dropped and a new one requested.
    ///
    /// # Parameters
    /// * `token` - Aborts the wait for a connection
    ///
    /// # Returns
    /// * `Result<ChannelOf<T>, AmqpError>` - A fresh channel owned by the caller,
    ///   `Canceled` if `token` fired first, or the channel open failure
    pub async fn channel(&self, token: &CancellationToken) -> Result<ChannelOf<T>, AmqpError> {
        let mut rx = self.handoff.subscribe();
        let conn = select! {
            _ = token.cancelled() => return Err(AmqpError::Canceled),
            conn = live_connection(&mut rx) => conn.ok_or(AmqpError::NotConnected)?,
        };

        conn.create_channel().await.map_err(AmqpError::channel)
    }

    /// Closes the live connection so the dial loop reconnects, then pauses
    /// for `reopen_pause` to let the close propagate.
    ///
    /// Used to recover from broker-side conditions that only a fresh
    /// connection clears, like an exhausted channel id space.
    pub async fn reopen_conn(&self) -> Result<(), AmqpError> {
        let conn = self.handoff.borrow().clone();
        let conn = conn.ok_or(AmqpError::NotConnected)?;

        warn!("closing amqp connection to force a reconnect");
        AmqpError::tolerate_closed(conn.close().await)?;

        time::sleep(self.cfg.reopen_pause).await;
        Ok(())
    }

    /// Whether a connection is currently offered to requesters.
    pub fn is_connected(&self) -> bool {
        self.handoff.borrow().is_some()
    }
}

/// Waits until the hand-off holds a connection and clones it out.
async fn live_connection<C>(rx: &mut watch::Receiver<Option<Arc<C>>>) -> Option<Arc<C>> {
    rx.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|slot| (*slot).clone())
}
