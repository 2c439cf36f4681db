//! Final/proxy exchange topology
//!
//! Every channel owns a durable-by-config "final" exchange that consumers
//! bind to, and a "proxy" exchange that publishers write to. The proxy
//! exchange feeds a queue of the same name whose dead-letter exchange is the
//! final exchange, so expired or rejected messages land on the final
//! exchange.

use std::collections::BTreeMap;

use super::transport::{ExchangeDefinition, QueueDeclaration, Transport};
use crate::config::{ChannelName, ExchangeConfig};
use crate::constants::DEFAULT_ROUTING_KEY;
use crate::error::BrokerError;

/// Declared exchanges for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangePair {
    pub final_exchange: ExchangeDefinition,
    pub proxy_exchange: ExchangeDefinition,
    pub proxy_queue: QueueDeclaration,
}

impl ExchangePair {
    pub fn from_config(config: &ExchangeConfig) -> Self {
        let final_exchange = ExchangeDefinition {
            name: config.name.clone(),
            kind: config.kind,
            durable: config.durable,
        };
        let proxy_exchange = ExchangeDefinition {
            name: config.proxy.clone(),
            kind: config.kind,
            durable: config.durable,
        };
        let proxy_queue = QueueDeclaration {
            name: config.proxy.clone(),
            exchange: config.proxy.clone(),
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
            durable: config.durable,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: Some(config.name.clone()),
        };
        Self {
            final_exchange,
            proxy_exchange,
            proxy_queue,
        }
    }
}

/// Topology declared on one broker session
#[derive(Debug, Clone, Default)]
pub struct BrokerTopology {
    pairs: BTreeMap<ChannelName, ExchangePair>,
}

impl BrokerTopology {
    /// Declare final exchange, proxy exchange and proxy queue per channel
    pub async fn declare(
        transport: &dyn Transport,
        exchanges: &BTreeMap<ChannelName, ExchangeConfig>,
    ) -> Result<Self, BrokerError> {
        let mut pairs = BTreeMap::new();

        for (channel, config) in exchanges {
            let pair = ExchangePair::from_config(config);
            transport.declare_exchange(&pair.final_exchange).await?;
            transport.declare_exchange(&pair.proxy_exchange).await?;
            transport.declare_queue(&pair.proxy_queue).await?;

            tracing::debug!(
                "Declared {} -> {} (proxy {})",
                channel,
                pair.final_exchange.name,
                pair.proxy_exchange.name
            );
            pairs.insert(*channel, pair);
        }

        tracing::info!("Declared topology for {} channel(s)", pairs.len());
        Ok(Self { pairs })
    }

    pub fn pair(&self, channel: ChannelName) -> Result<&ExchangePair, BrokerError> {
        self.pairs
            .get(&channel)
            .ok_or_else(|| BrokerError::UnknownChannel(channel.to_string()))
    }

    pub fn final_exchange(&self, channel: ChannelName) -> Result<&ExchangeDefinition, BrokerError> {
        self.pair(channel).map(|p| &p.final_exchange)
    }

    pub fn proxy_exchange(&self, channel: ChannelName) -> Result<&ExchangeDefinition, BrokerError> {
        self.pair(channel).map(|p| &p.proxy_exchange)
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelName> + '_ {
        self.pairs.keys().copied()
    }
}
