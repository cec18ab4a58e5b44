// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the dead-letter topology every consumed queue relies on:
//!
//! - a durable direct master exchange `QUEUE/<queue>.master`
//! - the queue itself, bound to the master exchange with an empty key and
//!   dead-lettering into the master exchange with the `delay` key
//! - the delay queue `<queue>.delay`, bound with the `delay` key, whose messages expire
//!   after ten minutes and dead-letter back into the master exchange with an empty key
//!
//! A rejected message therefore parks in the delay queue and returns to the live queue
//! once its TTL runs out, which gives delayed retries without broker plugins.
//!
//! Topic consumption adds durable topic exchanges `TOPIC/<topic>.master` bound to the
//! queue. Exclusive queues get no dead-letter path at all.
//!
//! Every declaration is idempotent. Declaring against an existing entity with different
//! arguments fails on the broker and the error is returned as is.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// Routing key used to dead-letter a message from a queue into its delay queue.
pub const DELAY_ROUTING_KEY: &str = "delay";
/// Routing key used by the delay queue to send expired messages back to the queue.
pub const RETURN_ROUTING_KEY: &str = "";
/// How long a message waits in the delay queue, in milliseconds.
pub const DELAY_TTL_MS: i32 = 600_000;

/// `QUEUE/<queue>.master`
pub fn master_exchange_name(queue: &str) -> String {
    format!("QUEUE/{}.master", queue)
}

/// `<queue>.delay`
pub fn delay_queue_name(queue: &str) -> String {
    format!("{}.delay", queue)
}

/// `TOPIC/<lowercased topic>.master`
pub fn topic_exchange_name(topic: &str) -> String {
    format!("TOPIC/{}.master", topic.to_lowercase())
}

/// Collects exchanges, queues and bindings and declares them in that order.
pub struct AmqpTopology<'tp, Ch: AmqpChannel + ?Sized> {
    channel: &'tp Ch,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl<'tp, Ch: AmqpChannel + ?Sized> AmqpTopology<'tp, Ch> {
    pub fn new(channel: &'tp Ch) -> AmqpTopology<'tp, Ch> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Adds the master exchange, the queue and, unless `exclusive`, the delay queue.
    pub fn dead_letter_queue(self, queue: &str, exclusive: bool) -> Self {
        let master = master_exchange_name(queue);

        let mut main = QueueDefinition::new(queue)
            .durable()
            .dead_letter(&master, DELAY_ROUTING_KEY);
        if exclusive {
            main = main.exclusive();
        }

        let topology = self
            .exchange(ExchangeDefinition::new(&master).direct().durable())
            .queue(main)
            .queue_binding(
                QueueBinding::new(queue)
                    .exchange(&master)
                    .routing_key(RETURN_ROUTING_KEY),
            );

        if exclusive {
            return topology;
        }

        let delay = delay_queue_name(queue);
        topology
            .queue(
                QueueDefinition::new(&delay)
                    .durable()
                    .dead_letter(&master, RETURN_ROUTING_KEY)
                    .ttl(DELAY_TTL_MS),
            )
            .queue_binding(
                QueueBinding::new(&delay)
                    .exchange(&master)
                    .routing_key(DELAY_ROUTING_KEY),
            )
    }

    /// Declares everything collected so far.
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }

    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = self.channel.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = self.channel.declare_queue(def).await {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                return Err(err);
            }

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = self.channel.bind_queue(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        Ok(())
    }
}

/// Declares `queue` with its master exchange and, unless `exclusive`, its delay queue.
pub async fn declare_queue<Ch>(channel: &Ch, queue: &str, exclusive: bool) -> Result<(), AmqpError>
where
    Ch: AmqpChannel + ?Sized,
{
    AmqpTopology::new(channel)
        .dead_letter_queue(queue, exclusive)
        .install()
        .await
}

/// Declares `queue` with its dead-letter topology and binds it to one topic exchange per
/// topic using `routing_key`.
///
/// Topic names are lowercased to build the exchange name. The routing key is used as
/// given.
pub async fn declare_topic_queue<Ch, S>(
    channel: &Ch,
    queue: &str,
    topics: &[S],
    routing_key: &str,
) -> Result<(), AmqpError>
where
    Ch: AmqpChannel + ?Sized,
    S: AsRef<str>,
{
    let mut topology = AmqpTopology::new(channel).dead_letter_queue(queue, false);

    for topic in topics {
        let exchange = topic_exchange_name(topic.as_ref());
        topology = topology
            .exchange(ExchangeDefinition::new(&exchange).topic().durable())
            .queue_binding(
                QueueBinding::new(queue)
                    .exchange(&exchange)
                    .routing_key(routing_key),
            );
    }

    topology.install().await
}

/// Declares a durable exclusive queue with no retry path.
pub async fn declare_exclusive_queue<Ch>(channel: &Ch, queue: &str) -> Result<(), AmqpError>
where
    Ch: AmqpChannel + ?Sized,
{
    AmqpTopology::new(channel)
        .queue(QueueDefinition::new(queue).durable().exclusive())
        .install()
        .await
}

/// Declares the topic exchange for `topic` and returns its name.
pub async fn declare_topic<Ch>(channel: &Ch, topic: &str) -> Result<String, AmqpError>
where
    Ch: AmqpChannel + ?Sized,
{
    let exchange = topic_exchange_name(topic);

    AmqpTopology::new(channel)
        .exchange(ExchangeDefinition::new(&exchange).topic().durable())
        .install()
        .await?;

    Ok(exchange)
}

/// Checks whether `queue` exists with a passive declare.
///
/// A queue held exclusively by another connection counts as existing. A negative answer
/// leaves the channel closed by the broker, so the channel must not be reused.
pub async fn queue_exists<Ch>(channel: &Ch, queue: &str) -> bool
where
    Ch: AmqpChannel + ?Sized,
{
    match channel
        .declare_queue(&QueueDefinition::new(queue).passive())
        .await
    {
        Ok(()) => true,
        Err(err) if err.is_exclusive_lock() => true,
        Err(err) => {
            debug!(error = err.to_string(), queue, "queue does not exist");
            false
        }
    }
}
