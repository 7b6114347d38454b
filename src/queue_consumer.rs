// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! A ready-made [`Consumer`] for the common case: declare an exchange, a
//! queue and the binding between them, then hand every delivery to a
//! [`DeliveryHandler`]. Successful deliveries are acked, failed ones nacked.
//! Each delivery runs inside an OpenTelemetry consumer span continuing the
//! publisher's trace.

use crate::{
    channel::{from_lapin, LapinChannel},
    consumer::{ConsumeTask, Consumer},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueBindOptions,
    },
    types::FieldTable,
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::borrow::Cow;
use tokio::select;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Business logic applied to each delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// `ctx` carries the trace context extracted from the message headers.
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Consumes one queue, optionally bound to an exchange.
pub struct QueueConsumer<H> {
    queue: QueueDefinition,
    binding: Option<(ExchangeDefinition, String)>,
    prefetch: u16,
    tag: String,
    requeue_on_error: bool,
    handler: H,
}

impl<H: DeliveryHandler> QueueConsumer<H> {
    /// Consumes `queue` one message at a time under a unique tag.
    ///
    /// # Parameters
    /// * `queue` - Queue declared every generation and consumed by every worker
    /// * `handler` - Business logic run for each delivery
    ///
    /// # Returns
    /// * `QueueConsumer<H>` - A consumer with prefetch 1 and tag `<queue>-<uuid>`
    pub fn new(queue: QueueDefinition, handler: H) -> Self {
        let tag = format!("{}-{}", queue.name, Uuid::new_v4());
        QueueConsumer {
            queue,
            binding: None,
            prefetch: 1,
            tag,
            requeue_on_error: false,
            handler,
        }
    }

    /// Declares `exchange` and binds the queue to it with `routing_key`.
    pub fn bind(mut self, exchange: ExchangeDefinition, routing_key: &str) -> Self {
        self.binding = Some((exchange, routing_key.to_owned()));
        self
    }

    /// Unacked deliveries the broker may push to each worker.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    /// Replaces the generated consumer tag; the tag is what stop cancels.
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_owned();
        self
    }

    /// Puts failed deliveries back on the queue instead of dead-lettering them.
    pub fn requeue_on_error(mut self) -> Self {
        self.requeue_on_error = true;
        self
    }

    async fn process(&self, tracer: &BoxedTracer, delivery: &Delivery) -> Result<(), AmqpError> {
        let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &self.queue.name);

        debug!(
            queue = self.queue.name.as_str(),
            exchange = delivery.exchange.to_string(),
            "received"
        );

        let Err(err) = self.handler.handle(&ctx, delivery).await else {
            debug!("message successfully processed");
            return match delivery.ack(BasicAckOptions { multiple: false }).await {
                Err(e) => {
                    error!("error whiling ack msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(AmqpError::AckMessageError)
                }
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            };
        };

        warn!(error = err.to_string(), "error whiling handling msg");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from(err.to_string()),
        });

        delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue: self.requeue_on_error,
            })
            .await
            .map_err(|e| {
                error!("error whiling nack msg");
                span.record_error(&e);
                AmqpError::NackMessageError
            })
    }
}

#[async_trait]
impl<H: DeliveryHandler> Consumer<LapinChannel> for QueueConsumer<H> {
    async fn declare(&self, channel: &LapinChannel) -> Result<(), AmqpError> {
        if let Some((exchange, _)) = &self.binding {
            debug!("creating exchange: {}", exchange.name);
            channel
                .exchange_declare(
                    &exchange.name,
                    exchange.kind.clone().into(),
                    exchange.options(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(
                        error = err.to_string(),
                        name = exchange.name.as_str(),
                        "error to declare the exchange"
                    );
                    AmqpError::DeclareExchangeError(exchange.name.clone())
                })?;
        }

        debug!("creating queue: {}", self.queue.name);
        channel
            .queue_declare(
                &self.queue.name,
                self.queue.options(),
                self.queue.arguments(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare queue");
                AmqpError::DeclareQueueError(self.queue.name.clone())
            })?;

        if let Some((exchange, routing_key)) = &self.binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                self.queue.name, exchange.name, routing_key
            );
            channel
                .queue_bind(
                    &self.queue.name,
                    &exchange.name,
                    routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        exchange.name.clone(),
                        self.queue.name.clone(),
                    )
                })?;
        }

        Ok(())
    }

    async fn consume(&self, task: ConsumeTask<LapinChannel>) -> Result<(), AmqpError> {
        let ConsumeTask {
            token,
            channel,
            ready,
        } = task;

        channel
            .basic_qos(self.prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to set qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        let mut deliveries = channel
            .basic_consume(
                &self.queue.name,
                &self.tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                from_lapin(err, AmqpError::ConsumeError)
            })?;

        ready.notify();
        let tracer = global::tracer("amqp consumer");

        loop {
            let next = select! {
                _ = token.cancelled() => return Err(AmqpError::Canceled),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(err) = self.process(&tracer, &delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Some(Err(err)) => return Err(from_lapin(err, AmqpError::ConsumeError)),
                None => {
                    debug!(tag = self.tag.as_str(), "delivery stream ended");
                    return Err(AmqpError::AlreadyClosed);
                }
            }
        }
    }

    fn tag(&self) -> String {
        self.tag.clone()
    }
}
