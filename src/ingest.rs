use std::sync::Arc;

use crate::broker::JobTransport;
use crate::error::IngestError;
use crate::signing;
use crate::storage::{DeliveryStore, DestinationDirectory, EventStore, SourceDirectory};
use crate::types::{Delivery, DeliveryJob, Event};

/// Producer side of the hub.
///
/// Authenticates an inbound webhook, records it exactly once, and fans
/// the payload out into one pending delivery plus one queued job per
/// matching destination.
pub struct IngestPipeline {
    sources: Arc<dyn SourceDirectory>,
    destinations: Arc<dyn DestinationDirectory>,
    events: Arc<dyn EventStore>,
    deliveries: Arc<dyn DeliveryStore>,
    transport: Arc<dyn JobTransport>,
    max_attempts: u32,
}

impl IngestPipeline {
    pub fn new(
        sources: Arc<dyn SourceDirectory>,
        destinations: Arc<dyn DestinationDirectory>,
        events: Arc<dyn EventStore>,
        deliveries: Arc<dyn DeliveryStore>,
        transport: Arc<dyn JobTransport>,
        max_attempts: u32,
    ) -> Self {
        Self {
            sources,
            destinations,
            events,
            deliveries,
            transport,
            max_attempts,
        }
    }

    /// Handle one inbound webhook.
    ///
    /// Preconditions are checked in order and the first failure wins:
    /// blank event type, unknown source, inactive source, missing
    /// signature, signature mismatch. A repeat submission (same source
    /// and content fingerprint) returns `Ok` with an empty list; nothing
    /// is created or published.
    ///
    /// Delivery creation and its publish run per destination; if a
    /// publish fails the caller retries the whole ingest, and the event
    /// fingerprint keeps the retry from duplicating anything already
    /// recorded.
    pub async fn ingest(
        &self,
        source_name: &str,
        event_type: &str,
        raw_body: &str,
        supplied_sig: &str,
    ) -> Result<Vec<Delivery>, IngestError> {
        if event_type.trim().is_empty() {
            return Err(IngestError::Validation(
                "event type must not be blank".to_string(),
            ));
        }

        let source = self
            .sources
            .source_by_name(source_name)
            .await?
            .ok_or_else(|| IngestError::SourceNotFound(source_name.to_string()))?;

        if !source.active {
            return Err(IngestError::SourceInactive(source_name.to_string()));
        }

        if supplied_sig.trim().is_empty() {
            return Err(IngestError::MissingSignature);
        }

        if !signing::verify_signature(&source.hmac_secret, raw_body.as_bytes(), supplied_sig) {
            tracing::warn!(source = source_name, "webhook rejected: signature mismatch");
            return Err(IngestError::InvalidSignature);
        }

        let event = Event::from_request(source_name, event_type, raw_body);

        if !self.events.insert_if_absent(&event).await? {
            tracing::info!(
                source = source_name,
                event_type,
                "repeat submission; nothing to do"
            );
            return Ok(Vec::new());
        }

        let destinations = self
            .destinations
            .destinations_for(source_name, event_type)
            .await?;

        let mut created = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let delivery = Delivery::pending(event.id, destination.id, self.max_attempts);
            self.deliveries.insert(&delivery).await?;

            let job = DeliveryJob {
                delivery_id: delivery.id.to_string(),
                event_id: event.id.to_string(),
                destination_id: destination.id.to_string(),
                target_url: destination.target_url.clone(),
                payload_json: event.payload_json.clone(),
                attempt: 1,
            };
            self.transport
                .publish_job(&job)
                .await
                .map_err(IngestError::Infrastructure)?;
            created.push(delivery);
        }

        tracing::info!(
            source = source_name,
            event_type,
            event_id = %event.id,
            deliveries = created.len(),
            "webhook accepted"
        );
        Ok(created)
    }
}
