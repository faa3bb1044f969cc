//! Topic-based dispatch of inbound messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{SagaEvent, Topic};
use event_channel::EventEnvelope;

use crate::error::{Result, SagaError};

/// A service's reaction to the events it consumes.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Topics this handler consumes.
    fn topics(&self) -> &'static [Topic];

    /// Handles one decoded event.
    async fn handle(&self, event: SagaEvent) -> Result<()>;
}

/// Maps each inbound topic to exactly one handler.
#[derive(Clone, Default)]
pub struct EventRouter {
    routes: BTreeMap<Topic, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every topic the handler declares to it.
    ///
    /// A later registration for the same topic replaces the earlier one.
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Self {
        for topic in handler.topics() {
            self.routes.insert(*topic, handler.clone());
        }
        self
    }

    /// The topic names to subscribe to.
    pub fn topics(&self) -> Vec<&'static str> {
        self.routes.keys().map(Topic::as_str).collect()
    }

    /// Decodes an inbound message and hands it to its handler.
    ///
    /// Unrouted topics fail with [`SagaError::UnknownEventTopic`] and
    /// undecodable payloads with [`SagaError::Domain`]; neither is retryable.
    pub async fn route(&self, envelope: &EventEnvelope) -> Result<()> {
        let handler = envelope
            .topic
            .parse::<Topic>()
            .ok()
            .and_then(|topic| self.routes.get(&topic))
            .ok_or_else(|| SagaError::UnknownEventTopic(envelope.topic.clone()))?;

        let event = SagaEvent::decode(&envelope.topic, envelope.payload.clone())?;
        handler.handle(event).await
    }
}
