// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Handler capability invoked once per delivery.

use crate::message::ConsumerMessage;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use std::{future::Future, sync::Arc};

/// Processes one decoded message.
///
/// Returns `true` when the message was handled and can be acknowledged, `false` to hand
/// it to the retry policy. Expected failures should be reported with `false`; a panic is
/// caught by the dispatcher and treated as `false`.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> bool;
}

/// Adapter turning an async closure into a `DeliveryHandler`.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` as a shareable handler.
///
/// ```ignore
/// let handler = handler_fn(|msg: ConsumerMessage| async move { msg.payload["id"].is_u64() });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeliveryHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(FnHandler {
        f: move |msg: ConsumerMessage| -> BoxFuture<'static, bool> { Box::pin(f(msg)) },
    })
}

#[async_trait]
impl<F> DeliveryHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> BoxFuture<'static, bool> + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> bool {
        (self.f)(msg.clone()).await
    }
}
