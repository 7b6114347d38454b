// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connector Events
//!
//! Steady-state conditions (reconnects, broker closes) are never returned to
//! the caller of a blocking entry point; they are reported through these
//! events instead. Listeners are plain callbacks invoked synchronously, in
//! registration order, on the task that raised the event.

use crate::errors::AmqpError;
use tracing::{debug, warn};

/// A dial attempt failed. `attempt` is 1-based and restarts at 1 after every
/// successful dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried {
    pub attempt: u32,
    pub error: AmqpError,
}

/// A connection was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialed;

/// The broker closed a connection or a consumer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpNotified {
    pub error: AmqpError,
}

type Listener<E> = Box<dyn Fn(E) + Send + Sync>;

/// Ordered listener lists owned by one connector.
///
/// Registration needs `&mut self`, emission only `&self`: once the connector
/// is shared between tasks the lists are frozen.
#[derive(Default)]
pub(crate) struct Listeners {
    retried: Vec<Listener<Retried>>,
    dialed: Vec<Listener<Dialed>>,
    notified: Vec<Listener<AmqpNotified>>,
}

impl Listeners {
    pub(crate) fn on_retried(&mut self, h: impl Fn(Retried) + Send + Sync + 'static) {
        self.retried.push(Box::new(h));
    }

    pub(crate) fn on_dialed(&mut self, h: impl Fn(Dialed) + Send + Sync + 'static) {
        self.dialed.push(Box::new(h));
    }

    pub(crate) fn on_notified(&mut self, h: impl Fn(AmqpNotified) + Send + Sync + 'static) {
        self.notified.push(Box::new(h));
    }

    pub(crate) fn emit_retried(&self, r: Retried) {
        warn!(attempt = r.attempt, error = r.error.to_string(), "dial attempt failed");
        for h in &self.retried {
            h(r.clone());
        }
    }

    pub(crate) fn emit_dialed(&self, d: Dialed) {
        debug!("amqp connected");
        for h in &self.dialed {
            h(d);
        }
    }

    pub(crate) fn emit_notified(&self, n: AmqpNotified) {
        warn!(error = n.error.to_string(), "amqp close notification");
        for h in &self.notified {
            h(n.clone());
        }
    }
}
