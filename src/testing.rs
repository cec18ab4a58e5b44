// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the channel seams, for tests.
//!
//! It keeps exchanges, queues and bindings, routes publishes through direct and topic
//! exchanges, dead-letters rejected messages through the queue's `x-dead-letter-*`
//! arguments and fails conflicting re-declarations the way RabbitMQ does, closing the
//! channel.
//!
//! Delivery tags are numbered per channel starting at 1. A message requeued on a live
//! channel is redelivered there with its original tag; one orphaned by a closed channel
//! gets a fresh tag from whichever channel receives it next.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Connector, DeliveryStream},
    config::ConnectionParameters,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::InboundDelivery,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::BasicProperties;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) data: Vec<u8>,
    pub(crate) properties: BasicProperties,
    tag: Option<(u64, u64)>,
    redelivered: bool,
}

struct FakeQueue {
    def: QueueDefinition,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
}

struct FakeConsumer {
    channel_id: u64,
    queue: String,
    sender: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, FakeQueue>,
    bindings: Vec<QueueBinding>,
    consumers: Vec<FakeConsumer>,
    unacked: HashMap<(u64, u64), Unacked>,
    next_tags: HashMap<u64, u64>,
    acks: Vec<u64>,
    rejects: Vec<(u64, bool)>,
    published: Vec<StoredMessage>,
    qos: Vec<u16>,
    closed_channels: Vec<u64>,
    refuse_qos: bool,
    refuse_close: bool,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
    ids: Arc<AtomicU64>,
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern = pattern.split('.').collect::<Vec<_>>();
    let key = key.split('.').collect::<Vec<_>>();
    matches(&pattern, &key)
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            return Err(AmqpError::PublishingError(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        };

        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| match def.kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue_name.clone())
            .collect())
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        let consumer = self
            .consumers
            .iter()
            .position(|c| c.queue == queue && !c.sender.is_closed());

        match consumer {
            Some(idx) => self.deliver(idx, message),
            None => {
                if let Some(q) = self.queues.get_mut(queue) {
                    q.messages.push_back(message);
                }
            }
        }
    }

    fn deliver(&mut self, consumer: usize, mut message: StoredMessage) {
        let channel_id = self.consumers[consumer].channel_id;
        let tag = match message.tag {
            Some((owner, tag)) if owner == channel_id => tag,
            _ => {
                let next = self.next_tags.entry(channel_id).or_default();
                *next += 1;
                *next
            }
        };
        message.tag = Some((channel_id, tag));

        let queue = self.consumers[consumer].queue.clone();
        let sender = self.consumers[consumer].sender.clone();
        let delivery = InboundDelivery {
            delivery_tag: tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            data: message.data.clone(),
            properties: message.properties.clone(),
        };

        self.unacked.insert(
            (channel_id, tag),
            Unacked {
                channel_id,
                queue,
                message,
            },
        );

        let _ = sender.send(Ok(delivery));
    }

    fn publish(&mut self, message: StoredMessage) -> Result<(), AmqpError> {
        for queue in self.route(&message.exchange, &message.routing_key)? {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(def) = self.queues.get(queue).map(|q| q.def.clone()) else {
            return;
        };

        if let Some(exchange) = def.dead_letter_exchange() {
            message.exchange = exchange.to_owned();
            if let Some(key) = def.dead_letter_routing_key() {
                message.routing_key = key.to_owned();
            }
            message.tag = None;
            message.redelivered = false;
            let _ = self.publish(message);
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        self.closed_channels.push(channel_id);
        self.consumers.retain(|c| c.channel_id != channel_id);

        let orphaned = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        for key in orphaned {
            if let Some(mut unacked) = self.unacked.remove(&key) {
                unacked.message.tag = None;
                unacked.message.redelivered = true;
                if let Some(q) = self.queues.get_mut(&unacked.queue) {
                    q.messages.push_front(unacked.message);
                }
            }
        }
    }
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        FakeBroker::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn connector(&self) -> FakeConnector {
        FakeConnector {
            broker: self.clone(),
            connects: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    pub(crate) fn connection(&self) -> FakeConnection {
        FakeConnection {
            broker: self.clone(),
            id: self.next_id(),
            open: Arc::new(AtomicBool::new(true)),
            channels: Arc::new(Mutex::new(vec![])),
        }
    }

    pub(crate) fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.lock().exchanges.get(name).cloned()
    }

    pub(crate) fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.lock().queues.get(name).map(|q| q.def.clone())
    }

    pub(crate) fn queue_names(&self) -> Vec<String> {
        let mut names = self.lock().queues.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub(crate) fn exchange_names(&self) -> Vec<String> {
        let mut names = self.lock().exchanges.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub(crate) fn bindings_of(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue_name == queue)
            .map(|b| (b.exchange_name.clone(), b.routing_key.clone()))
            .collect()
    }

    pub(crate) fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn published(&self) -> Vec<StoredMessage> {
        self.lock().published.clone()
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.lock().acks.clone()
    }

    pub(crate) fn rejects(&self) -> Vec<(u64, bool)> {
        self.lock().rejects.clone()
    }

    pub(crate) fn qos(&self) -> Vec<u16> {
        self.lock().qos.clone()
    }

    pub(crate) fn closed_channels(&self) -> usize {
        self.lock().closed_channels.len()
    }

    /// Makes every `basic.qos` time out while leaving the channel open.
    pub(crate) fn refuse_qos(&self) {
        self.lock().refuse_qos = true;
    }

    /// Makes every client-initiated channel close fail.
    pub(crate) fn refuse_close(&self) {
        self.lock().refuse_close = true;
    }

    /// Expires every message parked in `queue` through its dead letter arguments.
    pub(crate) fn expire(&self, queue: &str) {
        let mut state = self.lock();
        let messages = state
            .queues
            .get_mut(queue)
            .map(|q| q.messages.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();

        for message in messages {
            state.dead_letter(queue, message);
        }
    }
}

pub(crate) struct FakeConnector {
    broker: FakeBroker,
    pub(crate) connects: Arc<AtomicUsize>,
    delay: Duration,
    failure: Option<AmqpError>,
}

impl FakeConnector {
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing(mut self, err: AmqpError) -> Self {
        self.failure = Some(err);
        self
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self, _params: &ConnectionParameters) -> Result<FakeConnection, AmqpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.broker.connection()),
        }
    }
}

pub(crate) struct FakeConnection {
    broker: FakeBroker,
    id: u64,
    open: Arc<AtomicBool>,
    channels: Arc<Mutex<Vec<FakeChannel>>>,
}

impl FakeConnection {
    /// Simulates the broker dropping the connection.
    pub(crate) fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            channel.kill();
        }
    }

    pub(crate) fn channels(&self) -> Vec<FakeChannel> {
        self.channels.lock().unwrap().clone()
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    type Channel = FakeChannel;

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<FakeChannel, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        let channel = FakeChannel {
            broker: self.broker.clone(),
            id: self.broker.next_id(),
            connection_id: self.id,
            open: Arc::new(AtomicBool::new(true)),
        };
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.kill();
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct FakeChannel {
    broker: FakeBroker,
    id: u64,
    connection_id: u64,
    open: Arc<AtomicBool>,
}

impl FakeChannel {
    /// Simulates the broker closing this channel.
    pub(crate) fn kill(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.lock().close_channel(self.id);
        }
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }

    fn fail<T>(&self, err: AmqpError) -> Result<T, AmqpError> {
        self.kill();
        Err(err)
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let failure = {
            let mut state = self.broker.lock();
            match state.exchanges.get(&def.name).cloned() {
                Some(existing) if existing.kind != def.kind || existing.durable != def.durable => {
                    Some(format!(
                        "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}'",
                        def.name
                    ))
                }
                Some(_) => None,
                None => {
                    state.exchanges.insert(def.name.clone(), def.clone());
                    None
                }
            }
        };

        match failure {
            Some(reason) => self.fail(AmqpError::DeclareExchangeError(def.name.clone(), reason)),
            None => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let failure = {
            let mut state = self.broker.lock();
            let existing = state
                .queues
                .get(&def.name)
                .map(|q| (q.def.clone(), q.owner));

            match existing {
                Some((_, Some(owner))) if owner != self.connection_id => Some(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    def.name
                )),
                Some(_) if def.passive => None,
                Some((existing, _))
                    if existing.durable != def.durable
                        || existing.exclusive != def.exclusive
                        || existing.arguments().inner() != def.arguments().inner() =>
                {
                    Some(format!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        def.name
                    ))
                }
                Some(_) => None,
                None if def.passive => {
                    Some(format!("NOT_FOUND - no queue '{}' in vhost '/'", def.name))
                }
                None => {
                    state.queues.insert(
                        def.name.clone(),
                        FakeQueue {
                            def: def.clone(),
                            owner: def.exclusive.then_some(self.connection_id),
                            messages: VecDeque::new(),
                        },
                    );
                    None
                }
            }
        };

        match failure {
            Some(reason) => self.fail(AmqpError::DeclareQueueError(def.name.clone(), reason)),
            None => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let missing = {
            let mut state = self.broker.lock();
            if !state.queues.contains_key(&binding.queue_name)
                || !state.exchanges.contains_key(&binding.exchange_name)
            {
                true
            } else {
                if !state.bindings.contains(binding) {
                    state.bindings.push(binding.clone());
                }
                false
            }
        };

        if missing {
            return self.fail(AmqpError::BindingExchangeToQueueError(
                binding.queue_name.clone(),
                binding.exchange_name.clone(),
                "NOT_FOUND".to_owned(),
            ));
        }
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.refuse_qos {
            return Err(AmqpError::QoSDeclarationError("timed out".to_owned()));
        }
        state.qos.push(prefetch_count);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            drop(state);
            return self.fail(AmqpError::BindingConsumerError(
                queue.to_owned(),
                "NOT_FOUND".to_owned(),
            ));
        }

        state.consumers.push(FakeConsumer {
            channel_id: self.id,
            queue: queue.to_owned(),
            sender,
        });

        let pending = state
            .queues
            .get_mut(queue)
            .map(|q| q.messages.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        let idx = state.consumers.len() - 1;
        for message in pending {
            state.deliver(idx, message);
        }

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.acks.push(delivery_tag);
        state.unacked.remove(&(self.id, delivery_tag));
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.rejects.push((delivery_tag, requeue));

        let Some(mut unacked) = state.unacked.remove(&(self.id, delivery_tag)) else {
            return Ok(());
        };

        if requeue {
            unacked.message.redelivered = true;
            state.enqueue(&unacked.queue, unacked.message);
        } else {
            state.dead_letter(&unacked.queue, unacked.message);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: payload.to_vec(),
            properties,
            tag: None,
            redelivered: false,
        };

        let mut state = self.broker.lock();
        state.published.push(message.clone());
        state.publish(message)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.broker.lock().refuse_close {
            return Err(AmqpError::ChannelError("close timed out".to_owned()));
        }
        self.kill();
        Ok(())
    }
}

/// In-memory log sink, installed per thread so tests never touch the global subscriber.
#[derive(Clone, Default)]
pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Routes every event on the current thread into this capture until the guard drops.
    pub(crate) fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// Whether some line at `level` contains `text`.
    pub(crate) fn contains(&self, level: &str, text: &str) -> bool {
        self.lines()
            .iter()
            .any(|line| line.trim_start().starts_with(level) && line.contains(text))
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'w> tracing_subscriber::fmt::MakeWriter<'w> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'w self) -> Self::Writer {
        self.clone()
    }
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("created", "created"));
        assert!(topic_matches("order.*", "order.created"));
        assert!(topic_matches("order.#", "order.created.v1"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("order.*", "order.created.v1"));
        assert!(!topic_matches("created", "deleted"));
    }

    #[tokio::test]
    async fn delivery_tags_are_numbered_per_channel() {
        let broker = FakeBroker::new();
        let connection = broker.connection();
        let publisher = connection.create_channel().await.unwrap();
        publisher
            .declare_queue(&QueueDefinition::new("orders"))
            .await
            .unwrap();

        let first = connection.create_channel().await.unwrap();
        let mut deliveries = first.consume("orders", "a").await.unwrap();
        for _ in 0..2 {
            publisher
                .publish("", "orders", b"{}", BasicProperties::default())
                .await
                .unwrap();
        }
        let one = deliveries.next().await.unwrap().unwrap();
        let two = deliveries.next().await.unwrap().unwrap();
        assert_eq!((one.delivery_tag, two.delivery_tag), (1, 2));

        first.reject(2, true).await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.delivery_tag, 2);
        assert!(again.redelivered);

        first.kill();
        let second = connection.create_channel().await.unwrap();
        let mut deliveries = second.consume("orders", "b").await.unwrap();
        let mut tags = vec![
            deliveries.next().await.unwrap().unwrap().delivery_tag,
            deliveries.next().await.unwrap().unwrap().delivery_tag,
        ];
        tags.sort();
        assert_eq!(tags, vec![1, 2]);
    }
}
