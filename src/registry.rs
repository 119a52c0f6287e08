// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Append-only list of consumer registrations. The registry outlives every
//! connection generation: after each reconnect the manager relaunches every
//! entry with the same parameters.

use crate::{errors::AmqpError, handler::ConsumerHandler};
use std::{fmt, sync::Arc};

/// An immutable consumer registration.
pub struct ConsumerConfig {
    pub(crate) queue: String,
    pub(crate) auto_ack: bool,
    pub(crate) concurrency: usize,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl ConsumerConfig {
    /// Validates and creates a registration.
    ///
    /// `concurrency` is the number of consumer tasks launched for `queue` on
    /// every connection generation; it must be at least one.
    pub fn new(
        queue: impl Into<String>,
        auto_ack: bool,
        concurrency: usize,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Self, AmqpError> {
        let queue = queue.into();

        if queue.trim().is_empty() {
            return Err(AmqpError::InvalidConsumer("queue name is empty".to_owned()));
        }

        if concurrency == 0 {
            return Err(AmqpError::InvalidConsumer(format!(
                "concurrency for queue `{queue}` must be at least one"
            )));
        }

        Ok(ConsumerConfig {
            queue,
            auto_ack,
            concurrency,
            handler,
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    configs: Vec<Arc<ConsumerConfig>>,
}

impl ConsumerRegistry {
    /// Appends `cfg`, returning the shared handle stored in the registry.
    pub fn register(&mut self, cfg: ConsumerConfig) -> Arc<ConsumerConfig> {
        let cfg = Arc::new(cfg);
        self.configs.push(cfg.clone());
        cfg
    }

    /// Registrations in the order they were added.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ConsumerConfig>> {
        self.configs.iter()
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Total number of consumer tasks one generation runs.
    pub fn instances(&self) -> usize {
        self.configs.iter().map(|cfg| cfg.concurrency).sum()
    }
}
