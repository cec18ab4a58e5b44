// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Seams
//!
//! The rest of the crate talks to the broker only through three traits:
//!
//! - `Connector`: opens a connection from `ConnectionParameters`
//! - `AmqpConnection`: a live connection able to hand out channels
//! - `AmqpChannel`: the channel operations used by topology, dispatcher and publisher
//!
//! The `Lapin*` types implement them on top of `lapin`.

use crate::{
    config::ConnectionParameters,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::InboundDelivery,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error};

/// Reply code sent when closing channels and connections on purpose.
const REPLY_SUCCESS: u16 = 200;

/// Stream of deliveries for one consumer. It ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Channel operations needed by the helper.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries pushed to this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A broker connection handing out channels.
#[async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    type Channel: AmqpChannel;

    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Self::Channel, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Channel type handed out by the connections of connector `C`.
pub type ChannelOf<C> = <<C as Connector>::Connection as AmqpConnection>::Channel;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: AmqpConnection;

    async fn connect(&self, params: &ConnectionParameters) -> Result<Self::Connection, AmqpError>;
}

/// `Connector` backed by lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    type Connection = LapinConnection;

    async fn connect(&self, params: &ConnectionParameters) -> Result<LapinConnection, AmqpError> {
        debug!(host = params.host, port = params.port, "creating amqp connection...");

        let mut options = ConnectionProperties::default();
        if let Some(name) = &params.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match tokio::time::timeout(
            params.timeout(),
            Connection::connect_uri(params.uri(), options),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            Err(_) => {
                error!(timeout = ?params.timeout(), "timed out connecting");
                Err(AmqpError::ConnectionError(format!(
                    "timed out after {:?}",
                    params.timeout()
                )))
            }
        }?;

        debug!("amqp connected");

        Ok(LapinConnection(conn))
    }
}

/// `AmqpConnection` backed by a lapin connection.
pub struct LapinConnection(Connection);

#[async_trait]
impl AmqpConnection for LapinConnection {
    type Channel = LapinChannel;

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn create_channel(&self) -> Result<LapinChannel, AmqpError> {
        debug!("creating amqp channel...");
        match self.0.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(LapinChannel(c))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.0
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// `AmqpChannel` backed by a lapin channel.
pub struct LapinChannel(Channel);

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.0
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.0
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    ..QueueDeclareOptions::default()
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.0
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                AmqpError::BindingExchangeToQueueError(
                    binding.queue_name.clone(),
                    binding.exchange_name.clone(),
                    err.to_string(),
                )
            })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .0
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::BindingConsumerError(queue.to_owned(), err.to_string()))?;

        Ok(consumer
            .map(|result| {
                result
                    .map(InboundDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.0
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError(delivery_tag))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|_| AmqpError::RejectMessageError(delivery_tag))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.0
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
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.0
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
