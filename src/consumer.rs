// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Handles one delivery end to end:
//! 1. Decodes the JSON body and the headers
//! 2. Opens a consumer span parented on the propagated trace context
//! 3. Invokes the handler, turning a panic into a failure
//! 4. On success acks the tag and drops its retry counter
//! 5. On failure rejects the tag, requeuing it until the retry budget is spent and
//!    dead-lettering it afterwards

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    handler::DeliveryHandler,
    message::{headers_from_table, ConsumerMessage, InboundDelivery},
    otel,
    retry::{RetryDecision, RetryTracker},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::Value;
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// What happened to a processed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    Requeued { tries: u32 },
    DeadLettered { tries: u32 },
}

impl Outcome {
    /// Failures counted for the tag, `None` once it was acked.
    pub(crate) fn tries(&self) -> Option<u32> {
        match self {
            Outcome::Acked => None,
            Outcome::Requeued { tries } | Outcome::DeadLettered { tries } => Some(*tries),
        }
    }
}

/// Processes `delivery` received from `queue` on `channel`.
pub(crate) async fn consume<Ch>(
    tracer: &BoxedTracer,
    delivery: &InboundDelivery,
    queue: &str,
    handler: &Arc<dyn DeliveryHandler>,
    retries: &RetryTracker,
    channel: &Ch,
) -> Result<Outcome, AmqpError>
where
    Ch: AmqpChannel + ?Sized,
{
    let tag = delivery.delivery_tag;
    let (ctx, mut span) = otel::consumer_span(&delivery.properties, tracer, queue);

    debug!(
        queue,
        delivery_tag = tag,
        exchange = delivery.exchange,
        "received message"
    );

    let handled = match serde_json::from_slice::<Value>(&delivery.data) {
        Ok(payload) => {
            let headers = delivery.properties.headers().as_ref().map(headers_from_table);
            let message_id = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.to_string());
            let msg = ConsumerMessage::new(queue, tag, payload, headers).with_message_id(message_id);

            match AssertUnwindSafe(handler.exec(&ctx, &msg)).catch_unwind().await {
                Ok(handled) => handled,
                Err(_) => {
                    error!(queue, delivery_tag = tag, "handler panicked");
                    false
                }
            }
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                queue,
                delivery_tag = tag,
                "failure to parse payload"
            );
            span.record_error(&AmqpError::ParsePayloadError(err.to_string()));
            false
        }
    };

    if handled {
        if let Err(err) = channel.ack(tag).await {
            error!(error = err.to_string(), delivery_tag = tag, "error whiling ack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            return Err(err);
        }

        retries.forget(tag);
        span.set_status(Status::Ok);
        debug!(queue, delivery_tag = tag, "consumed message");

        return Ok(Outcome::Acked);
    }

    let decision = retries.record_failure(tag);

    if let Err(err) = channel.reject(tag, decision.requeue()).await {
        error!(error = err.to_string(), delivery_tag = tag, "error whiling reject msg");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error to reject msg"),
        });
        return Err(err);
    }

    span.set_status(Status::Error {
        description: Cow::from("handler failure"),
    });

    match decision {
        RetryDecision::Requeue { tries } => {
            warn!(
                queue,
                delivery_tag = tag,
                tries,
                "error on consume message, message was requeued"
            );
            Ok(Outcome::Requeued { tries })
        }
        RetryDecision::DeadLetter { tries } => {
            error!(
                queue,
                delivery_tag = tag,
                tries,
                "error on consume message, message was moved to delay queue"
            );
            Ok(Outcome::DeadLettered { tries })
        }
    }
}
