//! Publishing to a channel's proxy exchange

use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::topology::BrokerTopology;
use super::transport::{Headers, OutgoingMessage, Transport};
use crate::config::ChannelName;
use crate::constants::{DEFAULT_ROUTING_KEY, HEADER_HASH, HEADER_SOURCE};
use crate::error::BrokerError;

/// Hex encoded SHA-256 of `body`
pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Per-message publish parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub routing_key: String,
    pub source: Option<String>,
    /// Delay before the proxy queue dead-letters to the final exchange
    pub expiration_ms: u64,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
            source: None,
            expiration_ms: 0,
        }
    }
}

impl PublishOptions {
    pub fn with_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }
}

/// Publishes payloads through the proxy exchanges of a declared topology
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    topology: Arc<BrokerTopology>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, topology: Arc<BrokerTopology>) -> Self {
        Self {
            transport,
            topology,
        }
    }

    /// Publish `body` to the proxy exchange of `channel`, returning its content hash
    pub async fn publish(
        &self,
        body: Bytes,
        channel: ChannelName,
        options: &PublishOptions,
    ) -> Result<String, BrokerError> {
        let exchange = self.topology.proxy_exchange(channel)?;
        let hash = content_hash(&body);

        let mut headers = Headers::new();
        headers.insert(HEADER_HASH.to_string(), hash.clone());
        if let Some(source) = &options.source {
            headers.insert(HEADER_SOURCE.to_string(), source.clone());
        }

        // Always set: the proxy queue has no consumers and only forwards on expiry.
        let message = OutgoingMessage {
            body,
            headers,
            expiration_ms: Some(options.expiration_ms),
        };

        self.transport
            .publish(&exchange.name, &options.routing_key, message)
            .await?;

        tracing::trace!("Published {} to {} via {}", hash, channel, exchange.name);
        Ok(hash)
    }
}
