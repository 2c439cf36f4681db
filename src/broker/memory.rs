//! In-process broker for `memory://` URLs and tests
//!
//! Implements the subset of AMQP 0-9-1 routing the topology relies on:
//! topic and fanout exchanges, the default exchange, per-message expiration,
//! dead-lettering on expiry or rejection, and requeue.

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};

use super::transport::{
    Acknowledger, ConsumerArguments, Delivery, DeliveryStream, ExchangeDefinition,
    OutgoingMessage, QueueDeclaration, Transport,
};
use crate::config::ExchangeKind;
use crate::error::BrokerError;

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Clone)]
struct Envelope {
    id: u64,
    exchange: String,
    routing_key: String,
    message: OutgoingMessage,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct QueueState {
    declaration: QueueDeclaration,
    messages: VecDeque<Envelope>,
    consumers: Vec<UnboundedSender<Envelope>>,
    next_consumer: usize,
    unacked: usize,
}

impl QueueState {
    /// Hand the envelope to a live consumer, round robin
    fn dispatch(&mut self, envelope: Envelope) -> Result<(), Envelope> {
        let mut envelope = envelope;
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            match self.consumers[index].send(envelope) {
                Ok(()) => {
                    self.next_consumer = index + 1;
                    self.unacked += 1;
                    return Ok(());
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(index);
                    envelope = returned;
                }
            }
        }
        Err(envelope)
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_id: u64,
}

/// In-memory broker; clones share the same state
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Shared,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting in a queue, not yet delivered
    pub fn message_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Messages delivered to a consumer but not settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked)
            .unwrap_or(0)
    }

    pub fn binding_count(&self) -> usize {
        self.shared.lock().bindings.len()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.shared.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDeclaration> {
        self.shared
            .lock()
            .queues
            .get(name)
            .map(|q| q.declaration.clone())
    }
}

/// AMQP topic match: `*` is exactly one word, `#` zero or more
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

fn route(
    shared: &Shared,
    state: &mut BrokerState,
    exchange: &str,
    routing_key: &str,
    envelope: Envelope,
) -> Result<(), BrokerError> {
    if exchange.is_empty() {
        if state.queues.contains_key(routing_key) {
            enqueue(shared, state, routing_key, envelope);
        }
        return Ok(());
    }

    let kind = state
        .exchanges
        .get(exchange)
        .map(|e| e.kind)
        .ok_or_else(|| BrokerError::NotFound(format!("exchange {}", exchange)))?;

    let mut targets: Vec<String> = Vec::new();
    for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
        let matched = match kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
        };
        if matched && !targets.contains(&binding.queue) {
            targets.push(binding.queue.clone());
        }
    }

    if targets.is_empty() {
        tracing::debug!("Message to {} with key {} is unroutable", exchange, routing_key);
    }

    for queue in targets {
        enqueue(shared, state, &queue, envelope.clone());
    }
    Ok(())
}

fn enqueue(shared: &Shared, state: &mut BrokerState, queue_name: &str, envelope: Envelope) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    let envelope = match queue.dispatch(envelope) {
        Ok(()) => return,
        Err(envelope) => envelope,
    };

    match envelope.message.expiration_ms {
        Some(0) => dead_letter(shared, state, queue_name, envelope),
        Some(ms) => {
            let id = envelope.id;
            queue.messages.push_back(envelope);
            let shared_for_expiry = shared.clone();
            let queue_name = queue_name.to_string();
            // Consumers can be dropped outside a runtime; their requeues keep no timer.
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        expire(&shared_for_expiry, &queue_name, id);
                    });
                }
                Err(_) => tracing::debug!("No runtime to expire message {} on {}", id, queue_name),
            }
        }
        None => queue.messages.push_back(envelope),
    }
}

fn expire(shared: &Shared, queue_name: &str, id: u64) {
    let mut state = shared.lock();
    let expired = state.queues.get_mut(queue_name).and_then(|queue| {
        let position = queue.messages.iter().position(|e| e.id == id)?;
        queue.messages.remove(position)
    });
    if let Some(envelope) = expired {
        dead_letter(shared, &mut state, queue_name, envelope);
    }
}

fn dead_letter(shared: &Shared, state: &mut BrokerState, queue_name: &str, envelope: Envelope) {
    let target = state
        .queues
        .get(queue_name)
        .and_then(|q| q.declaration.dead_letter_exchange.clone());

    let Some(target) = target else {
        tracing::debug!("Dropping message {} from {}", envelope.id, queue_name);
        return;
    };

    let routing_key = envelope.routing_key.clone();
    let mut envelope = envelope;
    envelope.exchange = target.clone();
    envelope.message.expiration_ms = None;
    if let Err(e) = route(shared, state, &target, &routing_key, envelope) {
        tracing::warn!("Dead-letter from {} to {} failed: {}", queue_name, target, e);
    }
}

/// Deliveries handed to one consumer and not yet settled, keyed by envelope id
type Outstanding = Arc<Mutex<HashMap<u64, Envelope>>>;

/// Put an unsettled envelope back on its queue, flagged as redelivered
fn requeue(shared: &Shared, queue_name: &str, mut envelope: Envelope) {
    let mut state = shared.lock();
    match state.queues.get_mut(queue_name) {
        Some(queue) => queue.unacked = queue.unacked.saturating_sub(1),
        None => return,
    }
    envelope.redelivered = true;
    enqueue(shared, &mut state, queue_name, envelope);
}

struct MemoryAcker {
    shared: Shared,
    queue: String,
    id: u64,
    outstanding: Outstanding,
}

impl MemoryAcker {
    fn settle(&self) -> Result<Envelope, BrokerError> {
        let envelope = self.outstanding.lock().remove(&self.id).ok_or_else(|| {
            BrokerError::Ack(format!("message {} already settled or consumer closed", self.id))
        })?;
        if let Some(queue) = self.shared.lock().queues.get_mut(&self.queue) {
            queue.unacked = queue.unacked.saturating_sub(1);
        }
        Ok(envelope)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle().map(|_| ())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        let mut envelope = self.settle()?;
        let mut state = self.shared.lock();
        if requeue {
            envelope.redelivered = true;
            enqueue(&self.shared, &mut state, &self.queue, envelope);
        } else {
            dead_letter(&self.shared, &mut state, &self.queue, envelope);
        }
        Ok(())
    }
}

/// Consumer side of a queue. Dropping it returns everything it still holds
/// to the queue, like a closed AMQP channel.
struct MemoryConsumer {
    shared: Shared,
    queue: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
    outstanding: Outstanding,
}

impl MemoryConsumer {
    fn delivery(&self, envelope: Envelope) -> Delivery {
        self.outstanding.lock().insert(envelope.id, envelope.clone());
        let acker = MemoryAcker {
            shared: self.shared.clone(),
            queue: self.queue.clone(),
            id: envelope.id,
            outstanding: self.outstanding.clone(),
        };
        Delivery::new(
            envelope.message.body,
            envelope.message.headers,
            envelope.exchange,
            envelope.routing_key,
            envelope.redelivered,
            Box::new(acker),
        )
    }
}

impl Stream for MemoryConsumer {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(envelope)) => Poll::Ready(Some(Ok(this.delivery(envelope)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.rx.close();
        let mut returned: Vec<Envelope> = self.outstanding.lock().drain().map(|(_, e)| e).collect();
        while let Ok(envelope) = self.rx.try_recv() {
            returned.push(envelope);
        }
        returned.sort_by_key(|e| e.id);

        if !returned.is_empty() {
            tracing::debug!("Requeueing {} message(s) on {}", returned.len(), self.queue);
        }
        for envelope in returned {
            requeue(&self.shared, &self.queue, envelope);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn driver_type(&self) -> &'static str {
        "memory"
    }

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(BrokerError::PreconditionFailed(
                format!("exchange {} redeclared with different parameters", exchange.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();

        if !queue.exchange.is_empty() && !state.exchanges.contains_key(&queue.exchange) {
            return Err(BrokerError::NotFound(format!("exchange {}", queue.exchange)));
        }

        match state.queues.get(&queue.name) {
            Some(existing) if !existing.declaration.same_shape(queue) => {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue {} redeclared with different parameters",
                    queue.name
                )));
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        declaration: queue.clone(),
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                        unacked: 0,
                    },
                );
            }
        }

        if !queue.exchange.is_empty() {
            let binding = Binding {
                exchange: queue.exchange.clone(),
                queue: queue.name.clone(),
                routing_key: queue.routing_key.clone(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.next_id += 1;
        let envelope = Envelope {
            id: state.next_id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
            redelivered: false,
        };
        route(&self.shared, &mut state, exchange, routing_key, envelope)
    }

    async fn consume(
        &self,
        queue: &str,
        arguments: &ConsumerArguments,
    ) -> Result<DeliveryStream, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        {
            let mut state = self.shared.lock();
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(format!("queue {}", queue)))?;
            queue_state.consumers.push(tx);
            while let Some(envelope) = queue_state.messages.pop_front() {
                if let Err(envelope) = queue_state.dispatch(envelope) {
                    queue_state.messages.push_front(envelope);
                    break;
                }
            }
        }
        tracing::debug!("Consumer {} attached to {}", arguments.tag, queue);

        let deliveries = MemoryConsumer {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            rx,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        };
        Ok(deliveries.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn topic(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_string(),
            kind: ExchangeKind::Topic,
            durable: false,
        }
    }

    fn queue(name: &str, exchange: &str, key: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: name.to_string(),
            exchange: exchange.to_string(),
            routing_key: key.to_string(),
            durable: false,
            exclusive: false,
            auto_delete: true,
            dead_letter_exchange: None,
        }
    }

    fn message(body: &'static [u8], expiration_ms: Option<u64>) -> OutgoingMessage {
        OutgoingMessage {
            body: Bytes::from_static(body),
            headers: Default::default(),
            expiration_ms,
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("*", "mic"));
        assert!(!topic_matches("*", "mic.left"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#", "a.b.c"));
        assert!(topic_matches("audio.#", "audio"));
        assert!(topic_matches("audio.*.raw", "audio.mic.raw"));
        assert!(!topic_matches("audio.*.raw", "audio.raw"));
        assert!(topic_matches("exact", "exact"));
        assert!(!topic_matches("exact", "other"));
    }

    #[tokio::test]
    async fn test_redeclare_is_idempotent() {
        let broker = MemoryTransport::new();
        broker.declare_exchange(&topic("ex")).await.unwrap();
        broker.declare_exchange(&topic("ex")).await.unwrap();
        broker.declare_queue(&queue("q", "ex", "*")).await.unwrap();
        broker.declare_queue(&queue("q", "ex", "*")).await.unwrap();

        assert_eq!(broker.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_redeclare_with_other_kind_fails() {
        let broker = MemoryTransport::new();
        broker.declare_exchange(&topic("ex")).await.unwrap();
        let mut fanout = topic("ex");
        fanout.kind = ExchangeKind::Fanout;

        assert!(matches!(
            broker.declare_exchange(&fanout).await,
            Err(BrokerError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = MemoryTransport::new();
        let result = broker.publish("nowhere", "*", message(b"x", None)).await;
        assert!(matches!(result, Err(BrokerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_zero_expiration_dead_letters_immediately() {
        let broker = MemoryTransport::new();
        broker.declare_exchange(&topic("final")).await.unwrap();
        broker.declare_exchange(&topic("proxy")).await.unwrap();
        let mut proxy_queue = queue("proxy", "proxy", "*");
        proxy_queue.dead_letter_exchange = Some("final".to_string());
        broker.declare_queue(&proxy_queue).await.unwrap();
        broker.declare_queue(&queue("out", "final", "*")).await.unwrap();

        broker.publish("proxy", "*", message(b"abc", Some(0))).await.unwrap();

        assert_eq!(broker.message_count("proxy"), 0);
        assert_eq!(broker.message_count("out"), 1);
    }

    #[tokio::test]
    async fn test_reject_requeues_and_ack_settles() {
        let broker = MemoryTransport::new();
        broker.declare_exchange(&topic("ex")).await.unwrap();
        broker.declare_queue(&queue("q", "ex", "*")).await.unwrap();
        let mut deliveries = broker
            .consume("q", &ConsumerArguments::default())
            .await
            .unwrap();

        broker.publish("ex", "k", message(b"one", None)).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count("q"), 1);

        first.reject(true).await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, Bytes::from_static(b"one"));

        again.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
        assert!(again.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_consumer_requeues_unsettled() {
        let broker = MemoryTransport::new();
        broker.declare_exchange(&topic("ex")).await.unwrap();
        broker.declare_queue(&queue("q", "ex", "*")).await.unwrap();
        let mut deliveries = broker
            .consume("q", &ConsumerArguments::default())
            .await
            .unwrap();

        broker.publish("ex", "k", message(b"held", None)).await.unwrap();
        broker.publish("ex", "k", message(b"queued", None)).await.unwrap();
        let held = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.unacked_count("q"), 2);

        drop(deliveries);
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.message_count("q"), 2);
        assert!(held.ack().await.is_err());

        let mut again = broker
            .consume("q", &ConsumerArguments::default())
            .await
            .unwrap();
        let first = again.next().await.unwrap().unwrap();
        assert!(first.redelivered);
        assert_eq!(first.body, Bytes::from_static(b"held"));
        let second = again.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, Bytes::from_static(b"queued"));
    }

    #[tokio::test]
    async fn test_unsettled_delivery_stays_unacked_while_consumer_lives() {
        let broker = MemoryTransport::new();
        broker.declare_exchange(&topic("ex")).await.unwrap();
        broker.declare_queue(&queue("q", "ex", "*")).await.unwrap();
        let mut deliveries = broker
            .consume("q", &ConsumerArguments::default())
            .await
            .unwrap();

        broker.publish("ex", "k", message(b"x", None)).await.unwrap();
        drop(deliveries.next().await.unwrap().unwrap());

        assert_eq!(broker.unacked_count("q"), 1);
        assert_eq!(broker.message_count("q"), 0);
    }

    #[tokio::test]
    async fn test_fanout_ignores_routing_key() {
        let broker = MemoryTransport::new();
        let mut fanout = topic("fan");
        fanout.kind = ExchangeKind::Fanout;
        broker.declare_exchange(&fanout).await.unwrap();
        broker.declare_queue(&queue("a", "fan", "left")).await.unwrap();
        broker.declare_queue(&queue("b", "fan", "right")).await.unwrap();

        broker.publish("fan", "anything.at.all", message(b"x", None)).await.unwrap();

        assert_eq!(broker.message_count("a"), 1);
        assert_eq!(broker.message_count("b"), 1);
    }
}
