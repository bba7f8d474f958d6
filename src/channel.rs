// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of the AMQP connection and channel a
//! session owns, and implements the [`Transport`] primitives on top of them
//! with lapin.

use crate::{
    configs::Configs,
    envelope::{Envelope, HeaderValue, Headers, JSON_CONTENT_TYPE, UTF8_CONTENT_ENCODING},
    errors::BrokerError,
    exchange::ExchangeDefinition,
    queue::QueueDefinition,
    transport::{RawDelivery, Transport},
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;
/// Delivery mode marking a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Creates a new AMQP connection and a channel on it.
///
/// The connection is named after `cfg.app.name` so it can be told apart in the
/// broker's management UI.
///
/// # Example
/// ```ignore
/// let (conn, channel) = new_amqp_channel(&Configs::default()).await?;
/// ```
pub async fn new_amqp_channel(
    cfg: &Configs,
) -> Result<(Arc<Connection>, Arc<Channel>), BrokerError> {
    debug!(host = %cfg.rabbitmq.host, port = cfg.rabbitmq.port, "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app.name.clone()));

    let conn = match Connection::connect_uri(cfg.amqp_uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(BrokerError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(BrokerError::ChannelError(err.to_string()))
        }
    }
}

/// [`Transport`] over one lapin connection and one channel.
///
/// Dropping the transport without calling [`Transport::close`] still releases
/// the channel and the connection, in a background task on the current tokio
/// runtime.
pub struct LapinTransport {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
}

impl LapinTransport {
    /// Connects to the broker described by `cfg` and opens the channel.
    pub async fn connect(cfg: &Configs) -> Result<LapinTransport, BrokerError> {
        let (conn, channel) = new_amqp_channel(cfg).await?;
        Ok(LapinTransport { conn, channel })
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BrokerError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(BrokerError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), BrokerError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(BrokerError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(BrokerError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_content_encoding(ShortString::from(UTF8_CONTENT_ENCODING))
            .with_message_id(ShortString::from(envelope.id()))
            .with_timestamp(envelope.timestamp())
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(to_field_table(envelope.headers()));

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                envelope.payload(),
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(BrokerError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn pull(&self, queue: &str) -> Result<Option<RawDelivery>, BrokerError> {
        let message = match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error pulling message");
                Err(BrokerError::ConsumingError(err.to_string()))
            }
            Ok(m) => Ok(m),
        }?;

        let Some(message) = message else {
            return Ok(None);
        };

        let delivery = &message.delivery;
        Ok(Some(RawDelivery {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            message_id: delivery.properties.message_id().as_ref().map(|id| id.to_string()),
            timestamp: *delivery.properties.timestamp(),
            headers: from_properties(&delivery.properties),
            payload: delivery.data.clone(),
        }))
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error while ack msg");
                Err(BrokerError::AckError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error while nack msg");
                Err(BrokerError::NackError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        close_channel_and_connection(&self.channel, &self.conn).await
    }
}

impl Drop for LapinTransport {
    fn drop(&mut self) {
        if !self.conn.status().connected() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("amqp session dropped outside a runtime, connection left to the broker");
            return;
        };

        let conn = self.conn.clone();
        let channel = self.channel.clone();
        handle.spawn(async move {
            if let Err(err) = close_channel_and_connection(&channel, &conn).await {
                warn!(error = err.to_string(), "failure releasing dropped amqp session");
            }
        });
    }
}

async fn close_channel_and_connection(
    channel: &Channel,
    conn: &Connection,
) -> Result<(), BrokerError> {
    if channel.status().connected() {
        debug!("closing amqp channel...");
        channel.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the channel");
            BrokerError::CloseError(err.to_string())
        })?;
    }

    if conn.status().connected() {
        debug!("closing amqp connection...");
        conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the connection");
            BrokerError::CloseError(err.to_string())
        })?;
    }

    Ok(())
}

/// Converts envelope headers into an AMQP field table.
fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
        };

        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Reads the primitive headers of a delivery. Nested tables and arrays are skipped.
fn from_properties(props: &AMQPProperties) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = props.headers() else {
        return headers;
    };

    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(v) => {
                HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
            AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
            AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
            AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
            AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
            AMQPValue::Double(v) => HeaderValue::Float(*v),
            _ => continue,
        };

        headers.insert(key.to_string(), value);
    }

    headers
}
