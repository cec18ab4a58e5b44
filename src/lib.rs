// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable RabbitMQ consumption and publishing on top of `lapin`.
//!
//! Queues are declared with a master exchange and a delay queue, so a message that keeps
//! failing is parked for a while and then sent back to its queue. Consumers share one
//! connection per `ConnectionManager` and apply a bounded retry policy per delivery.

mod consumer;
mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;

pub use config::ConnectionParameters;
pub use connection::ConnectionManager;
pub use dispatcher::{ConsumerDefinition, RabbitMQDispatcher};
pub use errors::AmqpError;
pub use handler::{handler_fn, DeliveryHandler};
pub use message::{ConsumerMessage, HeaderValues};
pub use publisher::{PublishOptions, RabbitMQPublisher};
