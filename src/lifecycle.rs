// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Host lifecycle hooks.
//!
//! The host application calls `after_init` once its configuration is loaded
//! and `after_stop` when the process shuts down.

use crate::{errors::AmqpError, manager::ConnectionManager};
use async_trait::async_trait;

#[async_trait]
pub trait LifecycleListener: Send + Sync {
    /// Called once the host finished initializing.
    async fn after_init(&self) -> Result<(), AmqpError>;

    /// Called when the host stops; returns once the component is fully stopped.
    async fn after_stop(&self);
}

#[async_trait]
impl LifecycleListener for ConnectionManager {
    async fn after_init(&self) -> Result<(), AmqpError> {
        self.start().await
    }

    async fn after_stop(&self) {
        self.shutdown().await
    }
}
