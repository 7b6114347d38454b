// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Orchestration
//!
//! Runs a [`Consumer`] on `count` parallel workers and restarts all of them
//! together whenever one fails, the connection breaks or the broker closes a
//! worker channel.
//!
//! ## Generation
//! ```text
//! loop {
//!   ├─► token cancelled → Canceled
//!   ├─► stop fired      → Ok
//!   ├─► previous generation failed → sleep(wait)
//!   ├─► channel → declare → close
//!   ├─► count × channel ─┬─► consume task ─► cancel generation, close channel
//!   │                    └─► watcher ───────► broker close / generation end,
//!   │                                         close channel; on stop: cancel consumer
//!   └─► join all tasks, keep the first error
//! }
//! ```
//!
//! ## Rules
//! - Any worker returning ends its whole generation.
//! - Each worker channel is closed exactly once, by whichever of its two
//!   tasks gets there first.
//! - Stop is checked between generations only. A running generation ends on
//!   its own; stop just asks the broker to cancel every live consumer, which
//!   normally makes `consume` return. Workers not yet spawned when stop
//!   fires are not started, and a cancel sent before a worker announced
//!   readiness is repeated once it does.
//! - The caller's ready signal is given to the first worker ever spawned and
//!   to no other.

use crate::{
    channel::LapinChannel,
    config::ErrorAggregation,
    connector::Connector,
    consumer::{ConsumeTask, Consumer},
    errors::AmqpError,
    events::AmqpNotified,
    ready::ReadySignal,
    transport::{AmqpChannel, ChannelOf, Transport},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{select, task::JoinHandle, task::JoinSet, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Request to run a consumer on `count` workers.
pub struct StartConsumersTask<Ch = LapinChannel> {
    /// Cancelling it ends everything, including a running generation.
    pub token: CancellationToken,
    pub consumer: Arc<dyn Consumer<Ch>>,
    pub count: usize,
    /// Level-triggered stop, honoured between generations.
    pub stop: CancellationToken,
    pub ready: Option<ReadySignal>,
}

impl<Ch> StartConsumersTask<Ch> {
    /// Creates a request without a caller ready signal.
    ///
    /// # Parameters
    /// * `token` - Ends the whole run, including a running generation
    /// * `consumer` - Consumer run by every worker
    /// * `count` - Number of parallel workers, at least 1
    /// * `stop` - Ends the run between generations
    ///
    /// # Returns
    /// * `StartConsumersTask<Ch>` - The request for [`Connector::start_consumers`]
    pub fn new(
        token: CancellationToken,
        consumer: Arc<dyn Consumer<Ch>>,
        count: usize,
        stop: CancellationToken,
    ) -> Self {
        StartConsumersTask {
            token,
            consumer,
            count,
            stop,
            ready: None,
        }
    }

    /// Hands `ready` to the first worker; see [`ConsumeTask::ready`].
    pub fn ready(mut self, ready: ReadySignal) -> Self {
        self.ready = Some(ready);
        self
    }
}

/// A worker's channel with its one-shot close guard.
pub(crate) struct WorkerChannel<Ch> {
    channel: Arc<Ch>,
    closed: AtomicBool,
}

impl<Ch: AmqpChannel> WorkerChannel<Ch> {
    pub(crate) fn new(channel: Ch) -> Self {
        WorkerChannel {
            channel: Arc::new(channel),
            closed: AtomicBool::new(false),
        }
    }

    /// Closes the channel on the first call; later calls are no-ops.
    pub(crate) async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        AmqpError::tolerate_closed(self.channel.close().await)
    }
}

impl<T: Transport> Connector<T> {
    /// Runs `task.consumer` on `task.count` workers until `task.stop` fires
    /// or `task.token` is cancelled. Blocks for the whole run.
    ///
    /// `declare` is called once per generation and `consume` once per worker.
    /// Failures only restart the generation (after the configured wait) and
    /// are reported to [`Consumer::on_error`]. Returns `Ok` after a stop and
    /// `Canceled` after cancellation.
    pub async fn start_consumers(
        self: &Arc<Self>,
        task: StartConsumersTask<ChannelOf<T>>,
    ) -> Result<(), AmqpError> {
        let StartConsumersTask {
            token,
            consumer,
            count,
            stop,
            mut ready,
        } = task;

        if count == 0 {
            return Err(AmqpError::InvalidConsumerCount);
        }

        let mut failed = false;
        let mut generation_no: u64 = 0;

        loop {
            if token.is_cancelled() {
                return Err(AmqpError::Canceled);
            }
            if stop.is_cancelled() {
                debug!(tag = %consumer.tag(), "consumers stopped");
                return Ok(());
            }

            if failed {
                select! {
                    _ = token.cancelled() => return Err(AmqpError::Canceled),
                    _ = stop.cancelled() => continue,
                    _ = time::sleep(self.cfg.wait) => {}
                }
            }

            generation_no += 1;
            debug!(generation = generation_no, count, "starting consumers");

            let res = self
                .run_generation(&token, &stop, &consumer, count, &mut ready)
                .await;

            failed = res.is_err();
            if let Err(err) = res {
                debug!(
                    generation = generation_no,
                    error = err.to_string(),
                    "consumers generation ended"
                );
                consumer.on_error(&err);
            }
        }
    }

    /// Starts the consumers in the background and waits until the first
    /// worker announces readiness, or the background run fails or ends first.
    ///
    /// On success the handle of the background run is returned; awaiting it
    /// yields the result of [`Connector::start_consumers`].
    pub async fn start_multiple_consumers(
        self: &Arc<Self>,
        mut task: StartConsumersTask<ChannelOf<T>>,
    ) -> Result<JoinHandle<Result<(), AmqpError>>, AmqpError> {
        let ready = task.ready.get_or_insert_with(ReadySignal::new).clone();

        let connector = self.clone();
        let signal = ready.clone();
        let handle = tokio::spawn(async move {
            let res = connector.start_consumers(task).await;
            match &res {
                Err(err) => signal.fail(err.clone()),
                Ok(()) => signal.finish(),
            };
            res
        });

        ready.wait().await?;
        Ok(handle)
    }

    /// Single-worker [`Connector::start_multiple_consumers`].
    pub async fn start_consumer(
        self: &Arc<Self>,
        token: CancellationToken,
        consumer: Arc<dyn Consumer<ChannelOf<T>>>,
        stop: CancellationToken,
    ) -> Result<JoinHandle<Result<(), AmqpError>>, AmqpError> {
        self.start_multiple_consumers(StartConsumersTask::new(token, consumer, 1, stop))
            .await
    }

    /// Declares on a dedicated channel, then closes it.
    async fn declare(
        &self,
        token: &CancellationToken,
        consumer: &dyn Consumer<ChannelOf<T>>,
    ) -> Result<(), AmqpError> {
        let channel = self.channel(token).await?;

        let declared = consumer.declare(&channel).await.map_err(|err| match err {
            AmqpError::DeclareError(_) => err,
            other => AmqpError::DeclareError(other.to_string()),
        });
        let closed = AmqpError::tolerate_closed(channel.close().await);

        declared.and(closed)
    }

    async fn run_generation(
        self: &Arc<Self>,
        token: &CancellationToken,
        stop: &CancellationToken,
        consumer: &Arc<dyn Consumer<ChannelOf<T>>>,
        count: usize,
        ready: &mut Option<ReadySignal>,
    ) -> Result<(), AmqpError> {
        self.declare(token, consumer.as_ref()).await?;

        let generation = token.child_token();
        let tag = consumer.tag();
        let mut errors = Vec::new();
        let mut tasks = JoinSet::new();

        for worker in 0..count {
            if stop.is_cancelled() {
                debug!(worker, "stop requested, not starting more workers");
                break;
            }

            let channel = match self.channel(&generation).await {
                Ok(channel) => Arc::new(WorkerChannel::new(channel)),
                Err(err) => {
                    error!(worker, error = err.to_string(), "failure to get consumer channel");
                    generation.cancel();

                    if err.is_id_space_exhausted() {
                        if let Err(reopen) = self.reopen_conn().await {
                            error!(error = reopen.to_string(), "failure to reopen connection");
                        }
                    }

                    errors.push(err);
                    break;
                }
            };

            let worker_ready = ready.take().unwrap_or_default();

            tasks.spawn(consume_worker(
                consumer.clone(),
                channel.clone(),
                generation.clone(),
                worker_ready.clone(),
            ));
            tasks.spawn(watch_worker(
                self.clone(),
                consumer.clone(),
                channel,
                generation.clone(),
                stop.clone(),
                worker_ready,
                tag.clone(),
            ));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => {
                    error!(error = join_err.to_string(), "consumer task panicked");
                    generation.cancel();
                    errors.push(AmqpError::InternalError);
                }
            }
        }
        generation.cancel();

        aggregate(self.cfg.errors, errors)
    }
}

/// Runs `consume` for one worker; its return ends the generation.
async fn consume_worker<Ch: AmqpChannel>(
    consumer: Arc<dyn Consumer<Ch>>,
    channel: Arc<WorkerChannel<Ch>>,
    generation: CancellationToken,
    ready: ReadySignal,
) -> Result<(), AmqpError> {
    let _cancel_on_exit = generation.clone().drop_guard();

    let consumed = consumer
        .consume(ConsumeTask {
            token: generation.clone(),
            channel: channel.channel.clone(),
            ready,
        })
        .await;
    generation.cancel();

    // The failure must reach the join set before the watcher's `Canceled`;
    // the watcher closes the channel in that case.
    if let Err(err) = consumed {
        return Err(match err {
            AmqpError::ConsumeError(_) => err,
            other => AmqpError::ConsumeError(other.to_string()),
        });
    }

    channel.close().await
}

/// Waits for the generation to end or the broker to close the worker's
/// channel; forwards a stop as a consumer cancel.
///
/// A stop seen before the worker announced readiness is forwarded again
/// once it does, since the consumer may not have been registered yet.
async fn watch_worker<T: Transport>(
    connector: Arc<Connector<T>>,
    consumer: Arc<dyn Consumer<ChannelOf<T>>>,
    channel: Arc<WorkerChannel<ChannelOf<T>>>,
    generation: CancellationToken,
    stop: CancellationToken,
    ready: ReadySignal,
    tag: String,
) -> Result<(), AmqpError> {
    let _cancel_on_exit = generation.clone().drop_guard();
    let mut stop_sent = false;
    let mut resend_on_ready = false;

    let reason = loop {
        select! {
            biased;

            _ = generation.cancelled() => break AmqpError::Canceled,
            reason = channel.channel.closed() => {
                connector.emit_notified(AmqpNotified { error: reason.clone() });
                break reason;
            }
            _ = stop.cancelled(), if !stop_sent => {
                stop_sent = true;
                resend_on_ready = !ready.is_resolved();
                cancel_consumer(consumer.as_ref(), &channel.channel, &tag).await;
            }
            _ = ready.wait(), if resend_on_ready => {
                resend_on_ready = false;
                cancel_consumer(consumer.as_ref(), &channel.channel, &tag).await;
            }
        }
    };

    generation.cancel();
    channel.close().await?;

    Err(reason)
}

async fn cancel_consumer<Ch: AmqpChannel>(consumer: &dyn Consumer<Ch>, channel: &Ch, tag: &str) {
    if let Err(err) = channel.cancel_consumer(tag).await {
        warn!(error = err.to_string(), tag, "failure to cancel consumer");
        consumer.on_error(&err);
    }
}

fn aggregate(mode: ErrorAggregation, mut errors: Vec<AmqpError>) -> Result<(), AmqpError> {
    match (mode, errors.len()) {
        (_, 0) => Ok(()),
        (ErrorAggregation::CollectAll, n) if n > 1 => Err(AmqpError::Multiple(errors)),
        _ => Err(errors.swap_remove(0)),
    }
}
