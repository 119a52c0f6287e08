// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! The producer owns the single publish channel of one connection generation.
//! Publishing is serialized through a mutex because an AMQP channel must not be
//! written by several callers at once. Every outgoing message is stamped with
//! the caller's OpenTelemetry context.
//!
//! A producer is only valid for the generation that created it. Once the
//! manager tears that generation down, every publish through the old handle
//! fails with [`AmqpError::StaleProducer`]; callers should fetch a fresh one
//! from the manager.

use crate::{errors::AmqpError, otel, transport::AmqpChannel};
use async_trait::async_trait;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header values accepted by [`PublishMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// An outbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    pub data: Vec<u8>,
    pub msg_type: Option<String>,
    pub content_type: Option<String>,
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl PublishMessage {
    /// Creates a message carrying `data` as its body.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        PublishMessage {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Creates a message whose body is `value` encoded as JSON.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, AmqpError> {
        let data = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to encode payload");
            AmqpError::ParsePayloadError
        })?;

        Ok(PublishMessage::new(data).content_type(JSON_CONTENT_TYPE))
    }

    /// Sets the message type property.
    pub fn msg_type(mut self, msg_type: impl Into<String>) -> Self {
        self.msg_type = Some(msg_type.into());
        self
    }

    /// Sets the content type property.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds an application header.
    pub fn header(mut self, key: impl Into<String>, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::default)
            .insert(key.into(), value);
        self
    }

    /// Builds the AMQP properties, merging the application headers over the
    /// already injected trace headers.
    fn properties(&self, mut btree: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        if let Some(headers) = &self.headers {
            for (key, value) in headers.clone() {
                btree.insert(ShortString::from(key), value.into());
            }
        }

        let content_type = self.content_type.as_deref().unwrap_or(JSON_CONTENT_TYPE);

        BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_type(ShortString::from(self.msg_type.clone().unwrap_or_default()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree))
    }
}

/// Publishing interface so callers can depend on an abstraction.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `msg` to `exchange` with `routing_key`, propagating `ctx`.
    async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        msg: &PublishMessage,
    ) -> Result<(), AmqpError>;
}

/// Thread-safe producer bound to one connection generation.
pub struct Producer {
    generation: u64,
    channel: Mutex<Arc<dyn AmqpChannel>>,
    retired: CancellationToken,
}

impl Producer {
    /// Wraps the publish `channel` of `generation`.
    ///
    /// # Parameters
    /// * `channel` - The publish channel of the generation
    /// * `generation` - Connection generation the channel belongs to
    /// * `retired` - Cancelled by the manager when the generation is torn down
    ///
    /// # Returns
    /// An Arc-wrapped Producer for thread-safe sharing
    pub(crate) fn new(
        channel: Arc<dyn AmqpChannel>,
        generation: u64,
        retired: CancellationToken,
    ) -> Arc<Producer> {
        Arc::new(Producer {
            generation,
            channel: Mutex::new(channel),
            retired,
        })
    }

    /// The connection generation this producer belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the generation of this producer was torn down.
    pub fn is_stale(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Closes the publish channel, waiting for any in-flight publish.
    pub(crate) async fn close(&self) {
        let channel = self.channel.lock().await;
        if let Err(err) = channel.close().await {
            debug!(
                error = err.to_string(),
                generation = self.generation,
                "failure to close producer channel"
            );
        }
    }
}

#[async_trait]
impl Publisher for Producer {
    /// Publishes a message to RabbitMQ.
    ///
    /// The channel lock is held for the whole call, so concurrent publishes
    /// reach the broker one at a time. The channel's result is returned as-is;
    /// no retry is attempted.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected into the message headers
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `msg` - Payload, properties and application headers
    ///
    /// # Returns
    /// Ok(()) on success, `StaleProducer` once the generation was torn down,
    /// `ChannelError` when the broker closed the publish channel of a live
    /// generation, or the channel's own error unmodified
    async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        msg: &PublishMessage,
    ) -> Result<(), AmqpError> {
        let channel = self.channel.lock().await;

        if self.is_stale() {
            warn!(
                generation = self.generation,
                "publish through a producer of a closed connection"
            );
            return Err(AmqpError::StaleProducer(self.generation));
        }

        if !channel.is_open() {
            warn!(
                generation = self.generation,
                "publish through a closed producer channel"
            );
            return Err(AmqpError::ChannelError);
        }

        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(ctx, &mut btree);

        channel
            .basic_publish(exchange, routing_key, &msg.data, msg.properties(btree))
            .await
    }
}
