//! Event loop multiplexing all configured consumers

use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;

use super::handler::{HandlerRegistry, MessageHandler};
use super::topology::BrokerTopology;
use super::transport::{ConsumerArguments, DeliveryStream, QueueDeclaration, Transport};
use crate::config::QueueConfig;
use crate::error::{BrokerError, Result};

/// Consumer queues bound to final exchanges, served concurrently on one task
pub struct ConsumeLoop {
    transport: Arc<dyn Transport>,
    topology: Arc<BrokerTopology>,
    registry: HandlerRegistry,
    queues: Vec<QueueConfig>,
}

impl ConsumeLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        topology: Arc<BrokerTopology>,
        registry: HandlerRegistry,
        queues: Vec<QueueConfig>,
    ) -> Self {
        Self {
            transport,
            topology,
            registry,
            queues,
        }
    }

    fn declaration(&self, queue: &QueueConfig) -> Result<QueueDeclaration> {
        let exchange = self.topology.final_exchange(queue.exchange)?;
        Ok(QueueDeclaration {
            name: queue.name.clone(),
            exchange: exchange.name.clone(),
            routing_key: queue.routing_key.clone(),
            durable: queue.durable,
            exclusive: queue.exclusive,
            auto_delete: queue.auto_delete,
            dead_letter_exchange: None,
        })
    }

    fn consumer_arguments(&self, queue: &QueueConfig) -> ConsumerArguments {
        let priority = match self.transport.driver_type() {
            "amqp" => queue.priority,
            _ => None,
        };
        ConsumerArguments {
            tag: format!("{}-{}", queue.name, uuid::Uuid::new_v4().simple()),
            priority,
        }
    }

    /// Run until `shutdown` completes. Transport failures end the loop with an error.
    ///
    /// Each queue is served by its own worker future, so deliveries on one queue
    /// are handled in order while a slow handler never holds up another queue.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut workers = FuturesUnordered::new();

        for queue in &self.queues {
            let handler = self.registry.resolve(&queue.handler)?;
            let declaration = self.declaration(queue)?;
            self.transport.declare_queue(&declaration).await?;

            let deliveries = self
                .transport
                .consume(&queue.name, &self.consumer_arguments(queue))
                .await?;
            workers.push(serve_queue(queue.name.clone(), deliveries, handler).boxed());

            tracing::info!(
                "Ready for consuming data from {} (bound to {} with {})",
                queue.name,
                declaration.exchange,
                queue.routing_key
            );
        }

        if workers.is_empty() {
            tracing::warn!("No consumer queues configured");
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Consume loop stopped with {} consumer(s) active", workers.len());
                    return Ok(());
                }
                finished = workers.next(), if !workers.is_empty() => match finished {
                    Some(Ok(())) if !workers.is_empty() => {}
                    Some(Ok(())) | None => return Err(BrokerError::ConsumerClosed.into()),
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }
}

/// Dispatch one queue's deliveries to its handler, one at a time
async fn serve_queue(
    queue: String,
    mut deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    while let Some(item) = deliveries.next().await {
        let delivery = item?;
        let hash = delivery.content_hash().unwrap_or("-").to_string();

        tracing::debug!("Delivery {} on {}", hash, queue);
        if let Err(e) = handler.handle(delivery).await {
            tracing::warn!("Handler for {} failed on {}, left unacknowledged: {}", queue, hash, e);
        }
    }

    tracing::warn!("Consumer on {} closed", queue);
    Ok(())
}
