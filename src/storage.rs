use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::HubError;
use crate::types::{Delivery, DeliveryStatus, Destination, DestinationRule, Event, Source};

/// Read access to registered webhook sources.
#[async_trait]
pub trait SourceDirectory: Send + Sync {
    /// Look up a source by name, active or not. The caller distinguishes
    /// unknown sources from deactivated ones.
    async fn source_by_name(&self, name: &str) -> Result<Option<Source>, HubError>;
}

/// Read access to destinations and their routing rules.
#[async_trait]
pub trait DestinationDirectory: Send + Sync {
    /// Active destinations with a rule matching `(source_name, event_type)`.
    async fn destinations_for(
        &self,
        source_name: &str,
        event_type: &str,
    ) -> Result<Vec<Destination>, HubError>;
}

/// Durable, deduplicating event record store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the event unless its fingerprint is already recorded.
    ///
    /// Returns `false` when a row with the same
    /// `(source_name, idempotency_key)` already exists; the submission is
    /// then a repeat and must produce no deliveries.
    async fn insert_if_absent(&self, event: &Event) -> Result<bool, HubError>;
}

/// Store for per-destination delivery records.
///
/// The `mark_*` transitions are conditional: they return `false` without
/// touching the row when it is already in a terminal state, so a stray
/// duplicate message can never resurrect a settled delivery.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert(&self, delivery: &Delivery) -> Result<(), HubError>;

    async fn mark_delivered(
        &self,
        id: Uuid,
        attempts: u32,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, HubError>;

    async fn mark_retrying(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool, HubError>;

    async fn mark_dead(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool, HubError>;

    /// Fetch a single delivery record.
    async fn delivery(&self, id: Uuid) -> Result<Option<Delivery>, HubError>;
}

/// In-memory source/destination directory for tests and single-process
/// setups.
#[derive(Default)]
pub struct InMemoryDirectory {
    sources: Mutex<HashMap<String, Source>>,
    destinations: Mutex<HashMap<Uuid, Destination>>,
    rules: Mutex<Vec<DestinationRule>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_source(&self, source: Source) {
        self.sources.lock().await.insert(source.name.clone(), source);
    }

    pub async fn add_destination(&self, destination: Destination) {
        self.destinations
            .lock()
            .await
            .insert(destination.id, destination);
    }

    pub async fn add_rule(&self, rule: DestinationRule) {
        self.rules.lock().await.push(rule);
    }
}

#[async_trait]
impl SourceDirectory for InMemoryDirectory {
    async fn source_by_name(&self, name: &str) -> Result<Option<Source>, HubError> {
        Ok(self.sources.lock().await.get(name).cloned())
    }
}

#[async_trait]
impl DestinationDirectory for InMemoryDirectory {
    async fn destinations_for(
        &self,
        source_name: &str,
        event_type: &str,
    ) -> Result<Vec<Destination>, HubError> {
        let rules = self.rules.lock().await;
        let destinations = self.destinations.lock().await;

        let mut matched = Vec::new();
        for rule in rules.iter() {
            if rule.source_name != source_name || rule.event_type != event_type {
                continue;
            }
            if let Some(destination) = destinations.get(&rule.destination_id) {
                if destination.active {
                    matched.push(destination.clone());
                }
            }
        }
        Ok(matched)
    }
}

/// In-memory event store enforcing the fingerprint constraint.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn insert_if_absent(&self, event: &Event) -> Result<bool, HubError> {
        let mut events = self.events.lock().await;
        let duplicate = events.iter().any(|existing| {
            existing.source_name == event.source_name
                && existing.idempotency_key == event.idempotency_key
        });
        if duplicate {
            return Ok(false);
        }
        events.push(event.clone());
        Ok(true)
    }
}

/// In-memory delivery store enforcing the pair constraint and terminal
/// immutability.
#[derive(Default)]
pub struct InMemoryDeliveryStore {
    rows: Mutex<HashMap<Uuid, Delivery>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Delivery> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert(&self, delivery: &Delivery) -> Result<(), HubError> {
        let mut rows = self.rows.lock().await;
        let duplicate_pair = rows.values().any(|existing| {
            existing.event_id == delivery.event_id
                && existing.destination_id == delivery.destination_id
        });
        if duplicate_pair || rows.contains_key(&delivery.id) {
            return Err(HubError::Storage(format!(
                "delivery already exists for event {} and destination {}",
                delivery.event_id, delivery.destination_id
            )));
        }
        rows.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        attempts: u32,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        row.status = DeliveryStatus::Delivered;
        row.attempts = attempts;
        row.last_error = None;
        row.delivered_at = Some(delivered_at);
        Ok(true)
    }

    async fn mark_retrying(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        row.status = DeliveryStatus::Retrying;
        row.attempts = attempts;
        row.last_error = Some(error.to_string());
        row.last_attempt_at = Some(attempted_at);
        Ok(true)
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        row.status = DeliveryStatus::Dead;
        row.attempts = attempts;
        row.last_error = Some(error.to_string());
        row.last_attempt_at = Some(attempted_at);
        Ok(true)
    }

    async fn delivery(&self, id: Uuid) -> Result<Option<Delivery>, HubError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }
}
