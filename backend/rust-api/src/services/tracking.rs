use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use mongodb::Database;
use uuid::Uuid;

use crate::models::tracking::{TrackingEvent, TrackingEventType};
use crate::models::StageKey;

/// Destination of analytics events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TrackingEvent) -> Result<()>;
}

pub struct MongoEventSink {
    mongo: Database,
}

impl MongoEventSink {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }
}

#[async_trait]
impl EventSink for MongoEventSink {
    async fn emit(&self, event: TrackingEvent) -> Result<()> {
        self.mongo
            .collection::<TrackingEvent>("tracking_events")
            .insert_one(&event)
            .await
            .context("Failed to insert tracking event")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<TrackingEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrackingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: TrackingEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow!("event sink lock poisoned"))?
            .push(event);
        Ok(())
    }
}

/// Builds events for one cycle and emits them best-effort.
#[derive(Clone)]
pub struct Tracker {
    sink: Arc<dyn EventSink>,
}

impl Tracker {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub async fn track(
        &self,
        event_type: TrackingEventType,
        key: &StageKey,
        payload: serde_json::Value,
    ) {
        let event = TrackingEvent {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            question_id: key.question_id.clone(),
            assignment_id: key.assignment_id.clone(),
            user_token: key.user_token.clone(),
            payload,
        };

        tracing::debug!(
            "Tracking event {} for question={} user={}",
            event_type.as_str(),
            key.question_id,
            key.user_token
        );

        if let Err(e) = self.sink.emit(event).await {
            tracing::warn!("Failed to emit {} event: {:#}", event_type.as_str(), e);
        }
    }
}
