// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builder types for the queues and bindings of the dead-letter topology. A
//! `QueueDefinition` knows how to render its AMQP `x-*` arguments, which is what makes
//! a re-declaration with identical settings idempotent on the broker.

use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Queue argument naming the dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the per-message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is non-durable, non-exclusive and carries no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists, without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Routes rejected and expired messages to `exchange` with `routing_key`.
    ///
    /// An empty routing key is still sent to the broker, it is not the same as omitting it.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }

    pub fn message_ttl(&self) -> Option<i32> {
        self.ttl
    }

    /// The `x-*` arguments sent with the declaration.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::<ShortString, AMQPValue>::new();

        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.as_str())),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        FieldTable::from(args)
    }
}

/// Binding of a queue to an exchange under a routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue`, with an empty exchange and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
