// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Helper
//!
//! The `AmqpError` enum covers every failure the helper can surface to its caller:
//! configuration, connection and channel establishment, topology declaration and the
//! acknowledgement calls issued by the dispatcher. Variants wrapping a broker failure
//! keep the broker's own error text so declaration conflicts reach the caller unchanged.
//!
//! Handler failures are not errors. A handler reports failure by returning `false` and
//! the dispatcher resolves it through the retry policy.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid connection parameters
    #[error("invalid configuration `{0}`: {1}")]
    ConfigError(String, String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or closing a channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error serializing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(u64),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the broker refused access because the resource is exclusive to another
    /// connection (`RESOURCE_LOCKED`).
    pub fn is_exclusive_lock(&self) -> bool {
        match self {
            AmqpError::DeclareQueueError(_, reason) => {
                let reason = reason.to_lowercase();
                reason.contains("exclusive") || reason.contains("resource_locked")
            }
            _ => false,
        }
    }
}
