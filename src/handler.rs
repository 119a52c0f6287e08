// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Consumer handler abstraction.

use crate::{errors::HandlerError, otel::TraceContext, transport::Delivery};
use async_trait::async_trait;
use std::{future::Future, sync::Arc};

/// Processes deliveries of one registered consumer.
///
/// Returning an error, or panicking, is logged by the consumer task; the
/// delivery is still acknowledged unless the consumer runs in auto-ack mode.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &TraceContext, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(TraceContext, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, ctx: &TraceContext, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), delivery.clone()).await
    }
}

/// Wraps an async closure into a [`ConsumerHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(TraceContext, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
