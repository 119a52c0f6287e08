// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Tasks
//!
//! Every registered consumer runs `concurrency` tasks per connection generation,
//! each on its own channel. A task drains its delivery stream until the channel
//! closes, which happens when the manager tears the connection down, so tasks
//! need no stop signal of their own.
//!
//! Per delivery the task extracts the propagated trace context, starts a
//! consumer span, runs the handler inside a fault boundary and, for manual-ack
//! consumers, acknowledges the delivery whatever the handler outcome was.
//! Failed deliveries are therefore not redelivered.

use crate::{
    errors::HandlerError,
    otel::{self, TraceContext},
    registry::ConsumerConfig,
    transport::{AmqpChannel, AmqpConnection, Delivery, DeliveryStream},
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Status, TraceContextExt},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Unacknowledged deliveries allowed per manual-ack consumer channel.
pub const CONSUMER_PREFETCH_COUNT: u16 = 1;

/// Name of the tracer used for consume spans.
pub const CONSUMER_TRACER_NAME: &str = "amqp consumer";

/// Launches the consumer tasks of `cfg` on `conn` into `tasks`.
///
/// An instance whose channel cannot be set up is logged and skipped; the other
/// instances are still launched. Returns how many instances started.
pub(crate) async fn launch(
    conn: &dyn AmqpConnection,
    generation: u64,
    cfg: &Arc<ConsumerConfig>,
    tasks: &mut JoinSet<()>,
) -> usize {
    let mut launched = 0;

    for instance in 0..cfg.concurrency {
        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = cfg.queue,
                    instance,
                    "failed to create channel for consumer"
                );
                continue;
            }
        };

        let Some(deliveries) = start_consuming(channel.as_ref(), cfg, generation).await else {
            continue;
        };

        tasks.spawn(run(channel, deliveries, cfg.clone(), generation));
        launched += 1;
    }

    launched
}

/// Applies the prefetch limit for manual-ack consumers and subscribes to the
/// queue. The channel is closed on failure.
async fn start_consuming(
    channel: &dyn AmqpChannel,
    cfg: &ConsumerConfig,
    generation: u64,
) -> Option<DeliveryStream> {
    if !cfg.auto_ack {
        if let Err(err) = channel.basic_qos(CONSUMER_PREFETCH_COUNT).await {
            error!(
                error = err.to_string(),
                queue = cfg.queue,
                "failed to set qos for consumer"
            );
            close_channel(channel, cfg).await;
            return None;
        }
    }

    let consumer_tag = format!("{}-{}-{}", cfg.queue, generation, Uuid::new_v4());
    match channel
        .basic_consume(&cfg.queue, &consumer_tag, cfg.auto_ack)
        .await
    {
        Ok(deliveries) => Some(deliveries),
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = cfg.queue,
                "failed to start consuming"
            );
            close_channel(channel, cfg).await;
            None
        }
    }
}

async fn close_channel(channel: &dyn AmqpChannel, cfg: &ConsumerConfig) {
    if let Err(err) = channel.close().await {
        debug!(
            error = err.to_string(),
            queue = cfg.queue,
            "failure to close consumer channel"
        );
    }
}

/// Receive loop of one consumer task. Deliveries are processed strictly in
/// receipt order.
async fn run(
    channel: Arc<dyn AmqpChannel>,
    mut deliveries: DeliveryStream,
    cfg: Arc<ConsumerConfig>,
    generation: u64,
) {
    info!(queue = cfg.queue, generation, "consumer started");
    let tracer = global::tracer(CONSUMER_TRACER_NAME);

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => process(&tracer, &cfg, delivery).await,
            Err(err) => error!(
                error = err.to_string(),
                queue = cfg.queue,
                "errors consume msg"
            ),
        }
    }

    drop(channel);
    info!(queue = cfg.queue, generation, "consumer stopped");
}

/// Processes one delivery: trace, handle, acknowledge.
pub(crate) async fn process(tracer: &BoxedTracer, cfg: &ConsumerConfig, delivery: Delivery) {
    let trace = otel::start_consume_span(&delivery, tracer);

    let scope = info_span!(
        "rabbitmq.consume",
        queue = cfg.queue.as_str(),
        trace_id = trace.trace_id.as_str(),
        span_id = trace.span_id.as_str(),
        request_id = trace.request_id.as_str(),
    );

    async {
        debug!(
            exchange = delivery.exchange,
            routing_key = delivery.routing_key,
            "received message"
        );

        if let Err(err) = exec_guarded(cfg, &trace, &delivery).await {
            error!(error = err.to_string(), queue = cfg.queue, "handler failure");
            let span = trace.cx.span();
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }

        if !cfg.auto_ack {
            if let Err(err) = delivery.ack().await {
                error!(
                    error = err.to_string(),
                    queue = cfg.queue,
                    "failed to ack rabbitmq message"
                );
            }
        }

        trace.cx.span().end();
    }
    .instrument(scope)
    .await
}

/// Runs the handler, converting a panic into [`HandlerError::Panicked`]. The
/// `exec` call itself sits inside the guarded future, so a handler panicking
/// before it returns its future is caught as well.
async fn exec_guarded(
    cfg: &ConsumerConfig,
    trace: &TraceContext,
    delivery: &Delivery,
) -> Result<(), HandlerError> {
    match AssertUnwindSafe(async { cfg.handler.exec(trace, delivery).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
