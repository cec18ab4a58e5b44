// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Consumes one queue and hands every delivery to a registered `DeliveryHandler`.
//!
//! A subscription owns one channel taken from the shared `ConnectionManager`. Before
//! consuming, it sets the channel prefetch and declares the queue topology, so an
//! unknown queue is created and an existing one is left untouched. Each delivery runs in
//! its own task, so a slow handler never holds back the next delivery. The prefetch
//! count is the only bound on how many run at once.
//!
//! `subscribe` checks the current subscription first and rebuilds it only when the
//! consumer stopped or its channel closed. Retry counters live with the subscription,
//! so they are discarded together with the channel whose delivery tags they count.

use crate::{
    channel::{AmqpChannel, ChannelOf, Connector, LapinConnector},
    connection::ConnectionManager,
    consumer::consume,
    errors::AmqpError,
    handler::DeliveryHandler,
    retry::RetryTracker,
    topology,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Prefetch applied when a definition does not set one.
pub const DEFAULT_PREFETCH_COUNT: u16 = 100;

/// Queue and options of one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    pub(crate) topics: Vec<String>,
    pub(crate) routing_key: String,
    pub(crate) prefetch_count: u16,
    pub(crate) exclusive: bool,
}

impl ConsumerDefinition {
    pub fn new(queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            queue: queue.to_owned(),
            topics: vec![],
            routing_key: String::new(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            exclusive: false,
        }
    }

    /// Binds the queue to the topic exchange of each topic.
    pub fn topics<S: AsRef<str>>(mut self, topics: &[S]) -> Self {
        self.topics = topics.iter().map(|t| t.as_ref().to_owned()).collect();
        self
    }

    /// Routing key used for the topic bindings.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Consumes from an exclusive queue, which has no delay queue behind it.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch_count
    }

    /// Declares the topology this consumer reads from.
    async fn declare<Ch: AmqpChannel + ?Sized>(&self, channel: &Ch) -> Result<(), AmqpError> {
        if !self.topics.is_empty() {
            return topology::declare_topic_queue(
                channel,
                &self.queue,
                &self.topics,
                &self.routing_key,
            )
            .await;
        }

        if self.exclusive {
            return topology::declare_exclusive_queue(channel, &self.queue).await;
        }

        topology::declare_queue(channel, &self.queue, false).await
    }
}

struct Subscription<Ch> {
    channel: Arc<Ch>,
    running: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    done: watch::Receiver<bool>,
}

impl<Ch: AmqpChannel> Subscription<Ch> {
    fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.channel.is_open()
    }

    async fn shutdown(self) {
        self.pump.abort();
        self.running.store(false, Ordering::SeqCst);

        if self.channel.is_open() {
            if let Err(err) = self.channel.close().await {
                warn!(error = err.to_string(), "error closing stale channel");
            }
        }
    }
}

/// Consumer of one queue dispatching deliveries to a handler.
pub struct RabbitMQDispatcher<C: Connector = LapinConnector> {
    connections: Arc<ConnectionManager<C>>,
    def: ConsumerDefinition,
    handler: Arc<dyn DeliveryHandler>,
    subscription: Mutex<Option<Subscription<ChannelOf<C>>>>,
}

impl<C: Connector> RabbitMQDispatcher<C> {
    pub fn new(
        connections: Arc<ConnectionManager<C>>,
        def: ConsumerDefinition,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        RabbitMQDispatcher {
            connections,
            def,
            handler,
            subscription: Mutex::new(None),
        }
    }

    pub fn definition(&self) -> &ConsumerDefinition {
        &self.def
    }

    /// Whether the consumer is running on an open channel.
    pub async fn is_running(&self) -> bool {
        self.subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.is_alive())
    }

    /// Starts consuming, or does nothing when the current subscription is alive.
    ///
    /// A stopped subscription is torn down and rebuilt on a fresh channel: topology is
    /// declared again, the prefetch is set again and a new consumer is registered.
    pub async fn subscribe(&self) -> Result<(), AmqpError> {
        self.ensure_subscribed().await.map(|_| ())
    }

    /// Subscribes and waits until the consumer stops, either because its channel closed
    /// or because `close` was called.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let mut done = self.ensure_subscribed().await?;

        if done.wait_for(|stopped| *stopped).await.is_err() {
            debug!(queue = self.def.queue, "consumer task dropped");
        }

        Ok(())
    }

    /// Stops consuming and closes the subscription channel.
    pub async fn close(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            info!(queue = self.def.queue, "closing consumer");
            subscription.shutdown().await;
        }
    }

    async fn ensure_subscribed(&self) -> Result<watch::Receiver<bool>, AmqpError> {
        let mut current = self.subscription.lock().await;

        if let Some(subscription) = current.as_ref() {
            if subscription.is_alive() {
                return Ok(subscription.done.clone());
            }
        }

        if let Some(stale) = current.take() {
            warn!(
                queue = self.def.queue,
                "consumer is not running, subscribing again"
            );
            stale.shutdown().await;
        }

        let channel = Arc::new(self.connections.create_channel().await?);

        let subscription = match self.start(channel.clone()).await {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.def.queue,
                    "failure to subscribe"
                );
                if channel.is_open() {
                    if let Err(close_err) = channel.close().await {
                        warn!(
                            error = close_err.to_string(),
                            queue = self.def.queue,
                            "error closing channel after failed subscribe"
                        );
                    }
                }
                return Err(err);
            }
        };

        let done = subscription.done.clone();
        *current = Some(subscription);

        Ok(done)
    }

    async fn start(
        &self,
        channel: Arc<ChannelOf<C>>,
    ) -> Result<Subscription<ChannelOf<C>>, AmqpError> {
        let queue = self.def.queue.clone();

        channel.qos(self.def.prefetch_count).await?;
        self.def.declare(channel.as_ref()).await?;

        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());
        let mut deliveries = channel.consume(&queue, &consumer_tag).await?;

        info!(
            queue,
            consumer_tag,
            prefetch = self.def.prefetch_count,
            "consumer subscribed"
        );

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done) = watch::channel(false);
        let retries = Arc::new(RetryTracker::default());

        let pump = tokio::spawn({
            let channel = channel.clone();
            let running = running.clone();
            let handler = self.handler.clone();

            async move {
                while let Some(result) = deliveries.next().await {
                    let delivery = match result {
                        Ok(delivery) => delivery,
                        Err(err) => {
                            error!(error = err.to_string(), queue, "errors consume msg");
                            continue;
                        }
                    };

                    let channel = channel.clone();
                    let handler = handler.clone();
                    let retries = retries.clone();
                    let queue = queue.clone();

                    tokio::spawn(async move {
                        let delivery_tag = delivery.delivery_tag;
                        match consume(
                            &global::tracer("amqp consumer"),
                            &delivery,
                            &queue,
                            &handler,
                            &retries,
                            channel.as_ref(),
                        )
                        .await
                        {
                            Ok(outcome) => debug!(
                                queue,
                                delivery_tag,
                                tries = outcome.tries(),
                                "delivery settled"
                            ),
                            Err(err) => error!(error = err.to_string(), queue, "error consume msg"),
                        }
                    });
                }

                running.store(false, Ordering::SeqCst);
                retries.clear();
                warn!(queue, "consumer stopped, in-flight deliveries are no longer valid");
                let _ = done_tx.send(true);
            }
        });

        Ok(Subscription {
            channel,
            running,
            pump,
            done,
        })
    }
}
