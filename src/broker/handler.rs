//! Delivery handlers and their registry
//!
//! Queues name their handler in configuration; the registry resolves those
//! names to typed handlers when the consume loop starts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::transport::Delivery;
use crate::error::{BrokerError, Result};

/// Processes one delivery. The handler settles the message itself:
/// returning an error without acking leaves it to broker redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<()>;
}

/// Maps configured handler names to handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn resolve(&self, name: &str) -> std::result::Result<Arc<dyn MessageHandler>, BrokerError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownHandler(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
