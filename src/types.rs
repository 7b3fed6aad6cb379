use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A registered external system that sends webhooks.
///
/// Sources are managed out of band; the hub only reads them. The
/// `hmac_secret` is the hex string handed to the sender at registration
/// time and is used as-is as HMAC key material (it is never decoded).
#[derive(Debug, Clone)]
pub struct Source {
    pub id: Uuid,

    /// Unique logical name; webhooks address the source by this.
    pub name: String,

    /// Hex-encoded shared secret for request signing.
    pub hmac_secret: String,

    /// Inactive sources reject all ingest attempts.
    pub active: bool,

    pub created_at: DateTime<Utc>,
}

/// An HTTP endpoint that receives webhook bodies.
///
/// Destinations are selected per event by their routing rules. Like
/// sources, they are managed out of band and read-only here.
#[derive(Debug, Clone)]
pub struct Destination {
    pub id: Uuid,

    pub name: String,

    /// Absolute http/https URL the payload is POSTed to.
    pub target_url: String,

    /// Inactive destinations are skipped during fan-out.
    pub active: bool,

    pub created_at: DateTime<Utc>,
}

/// Routing rule attaching a destination to a `(source, event type)` pair.
#[derive(Debug, Clone)]
pub struct DestinationRule {
    pub id: Uuid,
    pub destination_id: Uuid,
    pub source_name: String,
    pub event_type: String,
}

/// A deduplicated ingest record: one row per unique webhook submission.
///
/// Events are immutable once written. Dedup is by `(source_name,
/// idempotency_key)` where the key is a content fingerprint of the
/// submission, so resubmitting the same body is a no-op.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub source_name: String,
    pub event_type: String,

    /// `hex(SHA-256(source_name || event_type || raw_body))`.
    pub idempotency_key: String,

    /// The inbound request body, verbatim. Carried as a string end to
    /// end so retries re-send byte-identical payloads.
    pub payload_json: String,

    pub received_at: DateTime<Utc>,
}

impl Event {
    /// Build the record for an authenticated inbound webhook.
    pub fn from_request(source_name: &str, event_type: &str, raw_body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_name: source_name.to_string(),
            event_type: event_type.to_string(),
            idempotency_key: idempotency_key(source_name, event_type, raw_body),
            payload_json: raw_body.to_string(),
            received_at: Utc::now(),
        }
    }
}

/// Content fingerprint used to deduplicate submissions per source.
pub fn idempotency_key(source_name: &str, event_type: &str, raw_body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_name.as_bytes());
    hasher.update(event_type.as_bytes());
    hasher.update(raw_body.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lifecycle state of a delivery record.
///
/// `Delivered` and `Dead` are terminal; the stores refuse further writes
/// to rows in either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Retrying,
    Dead,
}

impl DeliveryStatus {
    /// Textual label stored in the `delivery_status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Retrying => "RETRYING",
            DeliveryStatus::Dead => "DEAD",
        }
    }

    /// Inverse of [`DeliveryStatus::as_str`].
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "PENDING" => Some(DeliveryStatus::Pending),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "RETRYING" => Some(DeliveryStatus::Retrying),
            "DEAD" => Some(DeliveryStatus::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Dead)
    }
}

/// One pending or completed push of an event to a destination.
///
/// Created by the ingest pipeline in `Pending`; mutated exclusively by
/// the delivery worker. There is exactly one row per
/// `(event, destination)` pair.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub destination_id: Uuid,
    pub status: DeliveryStatus,

    /// Attempts recorded so far; never decreases.
    pub attempts: u32,

    /// Attempt budget after which the delivery is dead-lettered.
    pub max_attempts: u32,

    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Delivery {
    /// A freshly created record awaiting its first attempt.
    pub fn pending(event_id: Uuid, destination_id: Uuid, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id,
            destination_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            last_attempt_at: None,
            delivered_at: None,
            created_at: Utc::now(),
        }
    }
}

/// The wire message that drives the delivery worker.
///
/// Published by the ingest pipeline with `attempt = 1` and republished by
/// the worker with an incremented counter on every retry. Unknown fields
/// are tolerated on decode so the format can grow without breaking
/// in-flight consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    pub delivery_id: String,
    pub event_id: String,
    pub destination_id: String,
    pub target_url: String,

    /// Verbatim request body, as a string (not a nested JSON object).
    pub payload_json: String,

    /// 1-based attempt counter for the attempt this message represents.
    pub attempt: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_content_addressed() {
        let a = idempotency_key("github", "push", r#"{"ref":"main"}"#);
        let b = idempotency_key("github", "push", r#"{"ref":"main"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Any part of the triple changes the fingerprint.
        assert_ne!(a, idempotency_key("gitlab", "push", r#"{"ref":"main"}"#));
        assert_ne!(a, idempotency_key("github", "tag", r#"{"ref":"main"}"#));
        assert_ne!(a, idempotency_key("github", "push", r#"{"ref":"dev"}"#));
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Retrying,
            DeliveryStatus::Dead,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("GONE"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Dead.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }

    #[test]
    fn job_wire_format_is_camel_case_and_carries_payload_as_string() {
        let job = DeliveryJob {
            delivery_id: "d1".to_string(),
            event_id: "e1".to_string(),
            destination_id: "t1".to_string(),
            target_url: "https://example.com/hook".to_string(),
            payload_json: r#"{"test":true}"#.to_string(),
            attempt: 1,
        };

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["deliveryId"], "d1");
        assert_eq!(json["targetUrl"], "https://example.com/hook");
        // The payload stays a string, not a nested object.
        assert_eq!(json["payloadJson"], r#"{"test":true}"#);
    }

    #[test]
    fn job_decode_tolerates_unknown_fields() {
        let raw = r#"{
            "deliveryId": "d1",
            "eventId": "e1",
            "destinationId": "t1",
            "targetUrl": "https://example.com/hook",
            "payloadJson": "{}",
            "attempt": 3,
            "correlationId": "abc-123"
        }"#;
        let job: DeliveryJob = serde_json::from_str(raw).unwrap();
        assert_eq!(job.attempt, 3);
        assert_eq!(job.delivery_id, "d1");
    }

    #[test]
    fn pending_delivery_starts_clean() {
        let d = Delivery::pending(Uuid::new_v4(), Uuid::new_v4(), 5);
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.attempts, 0);
        assert_eq!(d.max_attempts, 5);
        assert!(d.last_error.is_none());
        assert!(d.delivered_at.is_none());
    }
}
