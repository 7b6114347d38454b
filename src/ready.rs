// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Readiness Signal
//!
//! A one-shot signal shared between a consumer (which announces that it is
//! ready, usually once `basic.consume` was accepted) and the orchestrator
//! (which reports an early failure or the end of the run). Only the first
//! transition out of `Pending` counts; any number of tasks can wait on it.

use crate::errors::AmqpError;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Failed(AmqpError),
    Finished,
}

/// Clonable one-shot readiness signal.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<ReadyState>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        let (tx, _) = watch::channel(ReadyState::Pending);
        ReadySignal { tx: Arc::new(tx) }
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces readiness. Returns false if the signal was already resolved.
    pub fn notify(&self) -> bool {
        self.resolve(ReadyState::Ready)
    }

    pub(crate) fn fail(&self, err: AmqpError) -> bool {
        self.resolve(ReadyState::Failed(err))
    }

    pub(crate) fn finish(&self) -> bool {
        self.resolve(ReadyState::Finished)
    }

    pub fn is_resolved(&self) -> bool {
        *self.tx.borrow() != ReadyState::Pending
    }

    /// Waits for the first resolution. Readiness and a finished run are
    /// `Ok`; an early failure is returned as is.
    pub async fn wait(&self) -> Result<(), AmqpError> {
        let mut rx = self.tx.subscribe();
        let state = match rx.wait_for(|s| *s != ReadyState::Pending).await {
            Ok(state) => (*state).clone(),
            Err(_) => ReadyState::Finished,
        };

        match state {
            ReadyState::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }

    fn resolve(&self, next: ReadyState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state != ReadyState::Pending {
                return false;
            }
            *state = next;
            true
        })
    }
}
