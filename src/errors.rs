// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Connection Manager
//!
//! `AmqpError` covers every failure the manager can report: connecting, opening
//! channels, publishing, acknowledging, registering consumers and loading
//! configuration. `HandlerError` is what user consumer handlers return; the
//! consumer fault boundary also converts handler panics into it.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Transient connectivity errors never leave the manager; they are logged and
/// retried. The variants that callers do see are publish failures, registration
/// validation failures and lifecycle misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel, or use of a channel the broker closed
    #[error("failure to create a channel")]
    ChannelError,

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// No connection generation is currently live
    #[error("not connected")]
    NotConnected,

    /// The producer belongs to a connection generation that was torn down
    #[error("producer of generation `{0}` is no longer usable")]
    StaleProducer(u64),

    /// A consumer registration was rejected
    #[error("invalid consumer registration: {0}")]
    InvalidConsumer(String),

    /// The connection manager was already started
    #[error("connection manager already started")]
    AlreadyStarted,

    /// The connection manager is shutting down or was shut down
    #[error("connection manager shutdown requested")]
    ShutdownRequested,

    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

/// Failure reported by a consumer handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("handler failure: {0}")]
    Failed(String),

    /// The handler panicked while processing the delivery
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for building a `HandlerError::Failed`.
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}
