// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Writes messages into the topology declared by `topology`. A publisher is bound to one
//! queue or topic name. Its topology is declared the first time it is needed and then
//! remembered for the lifetime of the publisher.
//!
//! Every message is published as persistent JSON with a message id and the caller's
//! headers, plus the OpenTelemetry context of the caller. A channel is opened from the
//! shared connection for each publish and closed right after.

use crate::{
    channel::{AmqpChannel, Connector, LapinConnector},
    connection::ConnectionManager,
    errors::AmqpError,
    message::{headers_into_table, HeaderValues},
    otel, topology,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Optional settings of a single publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub(crate) headers: Option<HashMap<String, HeaderValues>>,
    pub(crate) message_id: Option<String>,
    pub(crate) routing_key: Option<String>,
    pub(crate) exclusive: bool,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    pub fn headers(mut self, headers: HashMap<String, HeaderValues>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn header<V: Into<HeaderValues>>(mut self, key: &str, value: V) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value.into());
        self
    }

    /// Message id to publish with. An empty id gets a generated one.
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Declares the publisher's queue as exclusive, without a delay queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

/// Publisher bound to one queue or topic.
pub struct RabbitMQPublisher<C: Connector = LapinConnector> {
    connections: Arc<ConnectionManager<C>>,
    name: String,
    declared: Mutex<HashSet<String>>,
}

impl<C: Connector> RabbitMQPublisher<C> {
    /// Creates a publisher for `queue_or_topic` on the shared connection.
    pub fn new(connections: Arc<ConnectionManager<C>>, queue_or_topic: &str) -> Arc<Self> {
        Arc::new(RabbitMQPublisher {
            connections,
            name: queue_or_topic.to_owned(),
            declared: Mutex::new(HashSet::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declares the publisher's queue topology once, then publishes `body` to `exchange`.
    ///
    /// With an empty `exchange` the message goes through the default exchange straight
    /// to the publisher's queue. Returns the message id used.
    pub async fn write(
        &self,
        ctx: &Context,
        body: &[u8],
        exchange: &str,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        let routing_key = if exchange.is_empty() {
            self.name.clone()
        } else {
            options.routing_key.clone().unwrap_or_default()
        };

        let channel = self.connections.create_channel().await?;

        let result = async {
            if !self.is_declared(&self.name) {
                topology::declare_queue(&channel, &self.name, options.exclusive).await?;
                self.mark_declared(&self.name);
            }

            self.publish(&channel, ctx, body, exchange, &routing_key, options)
                .await
        }
        .await;

        close_channel(&channel).await;
        result
    }

    /// Serializes `msg` as JSON and writes it like `write`.
    pub async fn write_json<T: Serialize>(
        &self,
        ctx: &Context,
        msg: &T,
        exchange: &str,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        let body = serde_json::to_vec(msg).map_err(|err| {
            error!(error = err.to_string(), "error serializing message");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        self.write(ctx, &body, exchange, options).await
    }

    /// Publishes `body` through the default exchange to the publisher's queue. Nothing is
    /// declared.
    pub async fn write_default_exchange(
        &self,
        ctx: &Context,
        body: &[u8],
        headers: Option<HashMap<String, HeaderValues>>,
    ) -> Result<String, AmqpError> {
        let options = PublishOptions {
            headers,
            ..PublishOptions::default()
        };

        let channel = self.connections.create_channel().await?;
        let result = self
            .publish(&channel, ctx, body, "", &self.name, &options)
            .await;

        close_channel(&channel).await;
        result
    }

    /// Declares the publisher's topic exchange once and publishes `body` to it with
    /// `routing_key`.
    pub async fn write_topic(
        &self,
        ctx: &Context,
        body: &[u8],
        message_id: Option<&str>,
        routing_key: &str,
        headers: Option<HashMap<String, HeaderValues>>,
    ) -> Result<String, AmqpError> {
        let options = PublishOptions {
            headers,
            message_id: message_id.map(str::to_owned),
            ..PublishOptions::default()
        };
        let exchange = topology::topic_exchange_name(&self.name);

        let channel = self.connections.create_channel().await?;

        let result = async {
            if !self.is_declared(&exchange) {
                topology::declare_topic(&channel, &self.name).await?;
                self.mark_declared(&exchange);
            }

            self.publish(&channel, ctx, body, &exchange, routing_key, &options)
                .await
        }
        .await;

        close_channel(&channel).await;
        result
    }

    async fn publish<Ch: AmqpChannel + ?Sized>(
        &self,
        channel: &Ch,
        ctx: &Context,
        body: &[u8],
        exchange: &str,
        routing_key: &str,
        options: &PublishOptions,
    ) -> Result<String, AmqpError> {
        let message_id = match options.message_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => Uuid::new_v4().to_string(),
        };

        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut btree);

        if let Some(headers) = &options.headers {
            headers_into_table(headers, &mut btree);
        }

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(message_id.clone()))
            .with_headers(FieldTable::from(btree));

        if let Err(err) = channel
            .publish(exchange, routing_key, body, properties)
            .await
        {
            error!(
                error = err.to_string(),
                exchange, routing_key, "error publishing message"
            );
            return Err(err);
        }

        debug!(exchange, routing_key, message_id, "message published");

        Ok(message_id)
    }

    fn is_declared(&self, name: &str) -> bool {
        self.declared
            .lock()
            .map(|declared| declared.contains(name))
            .unwrap_or(false)
    }

    fn mark_declared(&self, name: &str) {
        if let Ok(mut declared) = self.declared.lock() {
            declared.insert(name.to_owned());
        }
    }
}

async fn close_channel<Ch: AmqpChannel>(channel: &Ch) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), "error closing publish channel");
    }
}
