//! Message fabric
//!
//! Every logical channel is a pair of exchanges. Producers publish to the
//! proxy exchange, whose single consumer-less queue dead-letters into the
//! final exchange once a message expires. Consumers bind their own queues to
//! the final exchange. The [`Transport`] trait hides whether that fabric is a
//! real AMQP broker or the in-process [`MemoryTransport`].

pub mod amqp;
pub mod consume;
pub mod handler;
pub mod memory;
pub mod publish;
pub mod topology;
pub mod transport;

use std::sync::Arc;

pub use amqp::AmqpTransport;
pub use consume::ConsumeLoop;
pub use handler::{HandlerRegistry, MessageHandler};
pub use memory::MemoryTransport;
pub use publish::{content_hash, PublishOptions, Publisher};
pub use topology::{BrokerTopology, ExchangePair};
pub use transport::{Delivery, Headers, Transport};

use crate::config::QueuesConfig;
use crate::error::BrokerError;

/// Open a transport for `url`; `memory://` selects the in-process broker
pub async fn connect(url: &str) -> Result<Arc<dyn Transport>, BrokerError> {
    if url.starts_with("memory://") {
        tracing::info!("Using in-process broker");
        return Ok(Arc::new(MemoryTransport::new()));
    }
    Ok(Arc::new(AmqpTransport::connect(url).await?))
}

/// Connected transport with its declared topology
#[derive(Clone)]
pub struct BrokerSession {
    transport: Arc<dyn Transport>,
    topology: Arc<BrokerTopology>,
    queues: QueuesConfig,
}

impl BrokerSession {
    /// Connect and declare every configured exchange pair
    pub async fn connect(config: &QueuesConfig) -> Result<Self, BrokerError> {
        let transport = connect(&config.url).await?;
        Self::with_transport(transport, config).await
    }

    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        config: &QueuesConfig,
    ) -> Result<Self, BrokerError> {
        let topology = BrokerTopology::declare(transport.as_ref(), &config.exchanges).await?;
        Ok(Self {
            transport,
            topology: Arc::new(topology),
            queues: config.clone(),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.transport.clone(), self.topology.clone())
    }

    /// Consume loop over every configured consumer queue
    pub fn consume_loop(&self, registry: HandlerRegistry) -> ConsumeLoop {
        ConsumeLoop::new(
            self.transport.clone(),
            self.topology.clone(),
            registry,
            self.queues.queues.clone(),
        )
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        self.transport.close().await
    }
}
