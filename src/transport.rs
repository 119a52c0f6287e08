// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The connection manager talks to the broker only through the traits in this
//! module. `crate::channel` implements them on top of lapin; tests implement
//! them with an in-memory broker.
//!
//! A channel is derived from exactly one connection. Once the connection is
//! gone, every channel created from it is unusable and every delivery stream
//! it produced ends.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    types::{AMQPValue, ShortString},
    BasicProperties,
};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, sync::Arc};
use tracing::error;

/// Stream of inbound deliveries for one consumer. Ends when its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Dials the broker.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Opens a new connection to `uri`, advertising `connection_name`.
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A live session with the broker.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a new channel multiplexed over this connection.
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Resolves once the connection is gone, whatever closed it.
    async fn closed(&self);

    /// Closes the connection and every channel derived from it.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Whether the connection can still be used.
    fn is_open(&self) -> bool;
}

/// A logical pipe derived from one connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Caps the number of unacknowledged deliveries outstanding on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts consuming `queue` on this channel.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Publishes `payload` to `exchange` with `routing_key`.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Closes the channel.
    async fn close(&self) -> Result<(), AmqpError>;

    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;
}

/// Acknowledgment handle of a single delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
}

/// An inbound message together with its acknowledgment handle.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn AmqpAcker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn AmqpAcker>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            properties,
            data,
            acker,
        }
    }

    /// Marks the delivery as redelivered by the broker.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// The message headers, empty when the message carries none.
    pub fn headers(&self) -> BTreeMap<ShortString, AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .map(|table| table.inner().clone())
            .unwrap_or_default()
    }

    /// The message type property, empty when unset.
    pub fn msg_type(&self) -> String {
        self.properties
            .kind()
            .as_ref()
            .map(|kind| kind.to_string())
            .unwrap_or_default()
    }

    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    /// Acknowledges the delivery.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("data_len", &self.data.len())
            .finish()
    }
}
