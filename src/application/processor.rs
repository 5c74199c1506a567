//! Routing of raw payloads to per-event-type processors.

use crate::application::ports::{EventHandler, Processor};
use crate::domain::error::{Error, Result};
use crate::domain::event::event_type_of;
use ahash::RandomState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Processors keyed by the event type they handle.
///
/// As an [`EventHandler`], the registry reads `event_type` from the JSON
/// payload and forwards the payload to the matching processor. A payload
/// that is not JSON, or has no `event_type`, fails permanently. A payload
/// whose type has no processor is logged and treated as handled.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn Processor>, RandomState>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("event_types", &self.registered_types())
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` under its own event type, replacing any
    /// processor previously registered for that type.
    pub fn register(&self, processor: Arc<dyn Processor>) {
        let event_type = processor.event_type().to_string();
        let previous = self
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.clone(), processor);

        if previous.is_some() {
            tracing::warn!(event_type = %event_type, "processor already registered, overwriting");
        } else {
            tracing::debug!(event_type = %event_type, "processor registered");
        }
    }

    /// Processor for `event_type`, if any.
    pub fn get(&self, event_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
    }

    /// Registered event types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn count(&self) -> usize {
        self.processors.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Route a raw payload to its processor.
    pub async fn process(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
        let event_type = event_type_of(payload).map_err(Error::permanent)?;

        let Some(processor) = self.get(&event_type) else {
            tracing::warn!(event_type = %event_type, "no processor registered for event type");
            return Ok(());
        };

        tracing::debug!(event_type = %event_type, "processing event");
        processor.process(cancel, payload).await
    }
}

#[async_trait]
impl EventHandler for ProcessorRegistry {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
        self.process(cancel, payload).await
    }
}
