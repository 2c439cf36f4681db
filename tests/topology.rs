//! Publish → proxy → dead-letter → final → consume over the in-process broker

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use aurora_sounddevice::broker::transport::{ConsumerArguments, QueueDeclaration};
use aurora_sounddevice::broker::{
    content_hash, BrokerSession, Delivery, HandlerRegistry, MemoryTransport, MessageHandler,
    PublishOptions, Transport,
};
use aurora_sounddevice::config::{ChannelName, ExchangeConfig, ExchangeKind, QueueConfig, QueuesConfig};
use aurora_sounddevice::constants::{HEADER_HASH, HEADER_SOURCE};

fn queues_config(consumers: Vec<QueueConfig>) -> QueuesConfig {
    let mut exchanges = BTreeMap::new();
    for (channel, name) in [(ChannelName::Detect, "detect"), (ChannelName::Play, "play")] {
        exchanges.insert(
            channel,
            ExchangeConfig {
                name: name.to_string(),
                proxy: format!("{}.proxy", name),
                kind: ExchangeKind::Topic,
                durable: false,
            },
        );
    }
    QueuesConfig {
        url: "memory://".to_string(),
        exchanges,
        queues: consumers,
    }
}

async fn observe(transport: &MemoryTransport, queue: &str, exchange: &str) -> aurora_sounddevice::broker::transport::DeliveryStream {
    transport
        .declare_queue(&QueueDeclaration {
            name: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: "*".to_string(),
            durable: false,
            exclusive: false,
            auto_delete: true,
            dead_letter_exchange: None,
        })
        .await
        .unwrap();
    transport
        .consume(
            queue,
            &ConsumerArguments {
                tag: format!("{}-observer", queue),
                priority: None,
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn detect_block_reaches_final_exchange_with_headers() {
    let transport = MemoryTransport::new();
    let session = BrokerSession::with_transport(Arc::new(transport.clone()), &queues_config(vec![]))
        .await
        .unwrap();
    let mut deliveries = observe(&transport, "detect.observer", "detect").await;

    let block = Bytes::from((0..3200u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
    let hash = session
        .publisher()
        .publish(block.clone(), ChannelName::Detect, &PublishOptions::with_source("mic-1"))
        .await
        .unwrap();
    assert_eq!(hash.len(), 64);

    let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.body, block);
    assert_eq!(delivery.header(HEADER_HASH), Some(hash.as_str()));
    assert_eq!(delivery.header(HEADER_SOURCE), Some("mic-1"));
    assert_eq!(delivery.exchange, "detect");
    assert_eq!(content_hash(&delivery.body), hash);

    // Nothing lingers on the proxy side.
    assert_eq!(transport.message_count("detect.proxy"), 0);
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn deferred_message_waits_for_expiration() {
    let transport = MemoryTransport::new();
    let session = BrokerSession::with_transport(Arc::new(transport.clone()), &queues_config(vec![]))
        .await
        .unwrap();
    let mut deliveries = observe(&transport, "play.observer", "play").await;

    let options = PublishOptions {
        expiration_ms: 300,
        ..Default::default()
    };
    session
        .publisher()
        .publish(Bytes::from_static(b"later"), ChannelName::Play, &options)
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(100), deliveries.next())
            .await
            .is_err(),
        "delivered before expiration"
    );
    assert_eq!(transport.message_count("play.proxy"), 1);

    let delivery = tokio::time::timeout(Duration::from_secs(2), deliveries.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&delivery.body[..], b"later");
    assert_eq!(delivery.source(), None);
}

#[tokio::test]
async fn publishing_to_undeclared_channel_fails() {
    let transport = MemoryTransport::new();
    let session = BrokerSession::with_transport(Arc::new(transport), &queues_config(vec![]))
        .await
        .unwrap();

    let result = session
        .publisher()
        .publish(Bytes::from_static(b"x"), ChannelName::Execute, &PublishOptions::default())
        .await;
    assert!(result.is_err());
}

struct Collect {
    tx: mpsc::UnboundedSender<Delivery>,
}

#[async_trait]
impl MessageHandler for Collect {
    async fn handle(&self, delivery: Delivery) -> aurora_sounddevice::Result<()> {
        delivery.ack().await?;
        let _ = self.tx.send(delivery);
        Ok(())
    }
}

#[tokio::test]
async fn consume_loop_receives_published_payload() {
    let transport = MemoryTransport::new();
    let consumer = QueueConfig {
        name: "sounddevice.play".to_string(),
        exchange: ChannelName::Play,
        routing_key: "*".to_string(),
        durable: false,
        exclusive: false,
        auto_delete: true,
        priority: Some(10),
        handler: "collect".to_string(),
    };
    let session = BrokerSession::with_transport(Arc::new(transport.clone()), &queues_config(vec![consumer]))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = HandlerRegistry::new().with("collect", Arc::new(Collect { tx }));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(session.consume_loop(registry).run(async {
        let _ = stop_rx.await;
    }));

    while transport.queue("sounddevice.play").is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let hash = session
        .publisher()
        .publish(Bytes::from_static(b"RIFF"), ChannelName::Play, &PublishOptions::with_source("tts"))
        .await
        .unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.content_hash(), Some(hash.as_str()));
    assert_eq!(delivery.source(), Some("tts"));
    assert_eq!(transport.unacked_count("sounddevice.play"), 0);

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}
