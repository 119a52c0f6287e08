// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ connection manager.
//!
//! [`manager::ConnectionManager`] keeps one broker connection alive, relaunches
//! every registered consumer after each reconnect and hands out a serialized,
//! trace-propagating [`publisher::Producer`] for the live connection.

mod consumer;

pub mod channel;
pub mod configs;
pub mod errors;
pub mod handler;
pub mod lifecycle;
pub mod manager;
pub mod otel;
pub mod publisher;
pub mod registry;
pub mod transport;

pub use configs::RabbitMQConfigs;
pub use errors::{AmqpError, HandlerError};
pub use handler::{handler_fn, ConsumerHandler};
pub use manager::{ConnectionManager, ConnectionState, ManagerStatus};
pub use otel::TraceContext;
pub use publisher::{HeaderValues, Producer, PublishMessage, Publisher};
pub use transport::Delivery;
