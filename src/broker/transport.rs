//! Message transport boundary
//!
//! The topology, publisher and consume loop only talk to a [`Transport`].
//! `amqp://` URLs are served by lapin, `memory://` by an in-process broker.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;

use crate::config::ExchangeKind;
use crate::constants::{HEADER_HASH, HEADER_SOURCE};
use crate::error::BrokerError;

/// Message headers, string valued
pub type Headers = BTreeMap<String, String>;

/// Exchange declaration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Queue declaration plus its binding to an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueDeclaration {
    /// Flags that must match on redeclaration
    pub fn same_shape(&self, other: &QueueDeclaration) -> bool {
        self.durable == other.durable
            && self.exclusive == other.exclusive
            && self.auto_delete == other.auto_delete
            && self.dead_letter_exchange == other.dead_letter_exchange
    }
}

/// Arguments attached to a consumer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerArguments {
    pub tag: String,
    pub priority: Option<i32>,
}

/// Message as handed to the transport for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Bytes,
    pub headers: Headers,
    pub expiration_ms: Option<u64>,
}

/// Settles a delivered message with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Message received from a consumer queue
pub struct Delivery {
    pub body: Bytes,
    pub headers: Headers,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        body: Bytes,
        headers: Headers,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            headers,
            exchange,
            routing_key,
            redelivered,
            acker,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Content hash claimed by the producer
    pub fn content_hash(&self) -> Option<&str> {
        self.header(HEADER_HASH)
    }

    pub fn source(&self) -> Option<&str> {
        self.header(HEADER_SOURCE)
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Client side of a message broker connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Driver name, used to gate driver specific consumer arguments
    fn driver_type(&self) -> &'static str;

    /// Idempotent exchange declaration
    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), BrokerError>;

    /// Idempotent queue declaration and binding
    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        arguments: &ConsumerArguments,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
