// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types
//!
//! Broker-independent representations of inbound deliveries and message headers, plus
//! the conversions between header maps and AMQP field tables.

use lapin::{
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, ShortInt, ShortString},
    BasicProperties,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Header values supported on published and consumed messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    Bool(bool),
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    Double(f64),
    Timestamp(u64),
}

impl From<&str> for HeaderValues {
    fn from(value: &str) -> Self {
        HeaderValues::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValues {
    fn from(value: String) -> Self {
        HeaderValues::LongString(value)
    }
}

impl From<i64> for HeaderValues {
    fn from(value: i64) -> Self {
        HeaderValues::LongLongInt(value)
    }
}

impl From<bool> for HeaderValues {
    fn from(value: bool) -> Self {
        HeaderValues::Bool(value)
    }
}

impl HeaderValues {
    fn into_amqp(self) -> AMQPValue {
        match self {
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::ShortUInt(v),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(v),
            HeaderValues::Double(v) => AMQPValue::Double(v),
            HeaderValues::Timestamp(v) => AMQPValue::Timestamp(v),
        }
    }

    fn from_amqp(value: &AMQPValue) -> Option<HeaderValues> {
        match value {
            AMQPValue::Boolean(v) => Some(HeaderValues::Bool(*v)),
            AMQPValue::ShortString(v) => Some(HeaderValues::ShortString(v.as_str().to_owned())),
            AMQPValue::LongString(v) => Some(HeaderValues::LongString(
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortShortInt(v) => Some(HeaderValues::Int(i16::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValues::Int(*v)),
            AMQPValue::LongInt(v) => Some(HeaderValues::LongInt(*v)),
            AMQPValue::LongLongInt(v) => Some(HeaderValues::LongLongInt(*v)),
            AMQPValue::ShortShortUInt(v) => Some(HeaderValues::Uint(u16::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValues::Uint(*v)),
            AMQPValue::LongUInt(v) => Some(HeaderValues::LongUint(*v)),
            AMQPValue::Float(v) => Some(HeaderValues::Double(f64::from(*v))),
            AMQPValue::Double(v) => Some(HeaderValues::Double(*v)),
            AMQPValue::Timestamp(v) => Some(HeaderValues::Timestamp(*v)),
            _ => None,
        }
    }
}

/// Writes `headers` into an AMQP header table, overwriting existing keys.
pub(crate) fn headers_into_table(
    headers: &HashMap<String, HeaderValues>,
    btree: &mut BTreeMap<ShortString, AMQPValue>,
) {
    for (key, value) in headers.clone() {
        btree.insert(ShortString::from(key), value.into_amqp());
    }
}

/// Reads an AMQP header table. Nested tables, arrays and byte arrays are skipped.
pub(crate) fn headers_from_table(table: &FieldTable) -> HashMap<String, HeaderValues> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match HeaderValues::from_amqp(value) {
            Some(header) => Some((key.as_str().to_owned(), header)),
            None => {
                debug!(header = key.as_str(), "skipping unsupported header type");
                None
            }
        })
        .collect()
}

/// A delivery pushed by the broker, detached from the client library.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl From<lapin::message::Delivery> for InboundDelivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            data: delivery.data,
            properties: delivery.properties,
        }
    }
}

/// What a handler receives for one delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    pub payload: Value,
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl ConsumerMessage {
    pub fn new(
        queue: &str,
        delivery_tag: u64,
        payload: Value,
        headers: Option<HashMap<String, HeaderValues>>,
    ) -> Self {
        ConsumerMessage {
            queue: queue.to_owned(),
            delivery_tag,
            message_id: None,
            payload,
            headers,
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValues> {
        self.headers.as_ref().and_then(|headers| headers.get(key))
    }
}
