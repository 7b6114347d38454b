// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Capability
//!
//! The contract between the orchestrator and the application: declare the
//! topology a consumer needs, then consume from a channel until done.

use crate::{channel::LapinChannel, errors::AmqpError, ready::ReadySignal};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything one worker gets for a single `consume` run.
pub struct ConsumeTask<Ch> {
    /// Cancelled when the worker's generation ends; `consume` should return
    /// soon after.
    pub token: CancellationToken,
    pub channel: Arc<Ch>,
    /// Fire once the consumer is actually receiving (e.g. after
    /// `basic.consume` succeeded). Only the first worker ever started
    /// carries the caller's signal; the others get a private one.
    pub ready: ReadySignal,
}

/// A queue consumer supervised by the orchestrator.
///
/// `declare` runs once per generation on a dedicated channel that is closed
/// right after; `consume` runs once per worker, on the worker's own channel.
#[async_trait]
pub trait Consumer<Ch = LapinChannel>: Send + Sync + 'static {
    /// Declares any broker entity the consumer needs. Must be idempotent.
    async fn declare(&self, channel: &Ch) -> Result<(), AmqpError>;

    /// Consumes until the work is done, the channel dies or the token fires.
    /// Returning, with or without an error, ends the whole generation.
    async fn consume(&self, task: ConsumeTask<Ch>) -> Result<(), AmqpError>;

    /// Consumer tag used to cancel this consumer on stop.
    fn tag(&self) -> String;

    /// Best-effort hook called with every generation failure.
    fn on_error(&self, _err: &AmqpError) {}
}
