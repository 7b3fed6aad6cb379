//! A durable webhook ingestion and delivery hub.
//!
//! Signed webhook events from registered **sources** are recorded exactly
//! once and fanned out to every HTTP **destination** whose routing rule
//! matches the event's `(source, type)` pair. Delivery is asynchronous
//! and broker-mediated: the ingest pipeline queues one job per
//! destination, a worker consumes them with bounded prefetch, and failed
//! attempts are retried on a timer the broker itself keeps (a holding
//! queue whose per-message TTL dead-letters expired messages back onto
//! the delivery queue).
//!
//! ## Guarantees
//! - Exactly-once event persistence per `(source, content fingerprint)`
//! - At-least-once delivery to each matching destination
//! - Durable state transitions before any message is acked
//! - Exponential, capped backoff between attempts
//! - Dead-lettering of permanently failed deliveries
//!
//! ## Non-Guarantees
//! - Ordered delivery across events or destinations
//! - Exactly-once delivery to destinations
//! - Retry at a precise wall-clock instant (delays are lower bounds)
//! - Automatic replay of dead-lettered deliveries

mod backoff;
mod broker;
mod client;
mod config;
mod consumer;
mod error;
mod ingest;
mod signing;
mod storage;
mod storage_postgres;
mod types;

pub use backoff::RetryPolicy;
pub use broker::{
    connect, declare_topology, AmqpTransport, JobTransport, PublishedJob, RecordingTransport,
    DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, DELIVERY_ROUTING_KEY, MAIN_EXCHANGE, MAIN_QUEUE,
    RETRY_QUEUE,
};
pub use client::DeliveryClient;
pub use config::HubConfig;
pub use consumer::{DeliveryConsumer, DeliveryWorker};
pub use error::{AttemptOutcome, HubError, IngestError};
pub use ingest::IngestPipeline;
pub use signing::{compute_signature, verify_signature};
pub use storage::{
    DeliveryStore, DestinationDirectory, EventStore, InMemoryDeliveryStore, InMemoryDirectory,
    InMemoryEventStore, SourceDirectory,
};
pub use storage_postgres::PostgresStorage;
pub use types::{
    idempotency_key, Delivery, DeliveryJob, DeliveryStatus, Destination, DestinationRule, Event,
    Source,
};
