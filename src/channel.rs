// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! lapin-backed implementation of the transport seam. It establishes
//! connections to the RabbitMQ server, derives channels from them and turns
//! lapin consumers into delivery streams.

use crate::{
    errors::AmqpError,
    transport::{AmqpAcker, AmqpChannel, AmqpConnection, AmqpConnector, Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions},
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// AMQP reply code used for client initiated closes.
const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl AmqpConnector for LapinConnector {
    /// Creates a new AMQP connection.
    ///
    /// The returned connection watches lapin's error callback so that
    /// [`AmqpConnection::closed`] resolves as soon as the broker goes away.
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                warn!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError {})
            }
        }?;
        debug!("amqp connected");

        let lost = CancellationToken::new();
        let on_error = lost.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            on_error.cancel();
        });

        Ok(Arc::new(LapinConnection { conn, lost }))
    }
}

/// A lapin connection plus the token tripped when it is lost.
pub struct LapinConnection {
    conn: Connection,
    lost: CancellationToken,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError {})
            }
        }
    }

    async fn closed(&self) {
        self.lost.cancelled().await
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let result = if self.conn.status().connected() {
            self.conn
                .close(REPLY_SUCCESS, "closing")
                .await
                .map_err(|err| AmqpError::CloseError(err.to_string()))
        } else {
            Ok(())
        };

        self.lost.cancel();
        result
    }

    fn is_open(&self) -> bool {
        !self.lost.is_cancelled() && self.conn.status().connected()
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    delivery.delivery_tag,
                    delivery.exchange.to_string(),
                    delivery.routing_key.to_string(),
                    delivery.properties,
                    delivery.data,
                    Arc::new(LapinAcker {
                        acker: delivery.acker,
                    }),
                )
                .redelivered(delivery.redelivered)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

/// Acknowledges a lapin delivery.
pub struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl AmqpAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }
}
