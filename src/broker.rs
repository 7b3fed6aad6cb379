use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::types::DeliveryJob;

/// Direct exchange fed by the ingest pipeline.
pub const MAIN_EXCHANGE: &str = "webhookhub";

/// Routing key binding the main exchange to the delivery queue.
pub const DELIVERY_ROUTING_KEY: &str = "delivery";

/// Queue the delivery worker consumes from.
pub const MAIN_QUEUE: &str = "webhookhub.deliveries";

/// Consumer-less holding queue. Per-message TTLs expire here and the
/// broker dead-letters the message back to the main exchange, which is
/// the entire retry scheduler.
pub const RETRY_QUEUE: &str = "deliveries.retry.q";

/// Fanout exchange for terminally failed deliveries.
pub const DEAD_LETTER_EXCHANGE: &str = "deliveries.dlx";

/// Terminal sink bound to the dead-letter exchange.
pub const DEAD_LETTER_QUEUE: &str = "deliveries.dlq";

/// Queue-level TTL on the main queue: messages nobody consumes for this
/// long are dead-lettered rather than piling up.
const MAIN_QUEUE_TTL_MS: i32 = 1_800_000;

/// Open a connection to the configured broker.
pub async fn connect(config: &HubConfig) -> Result<Connection, HubError> {
    let connection =
        Connection::connect(&config.amqp_uri(), ConnectionProperties::default()).await?;
    Ok(connection)
}

/// Declare the full delivery topology.
///
/// Declarations are idempotent: redeclaring with identical arguments is
/// a no-op, while a mismatch makes the broker close the channel and the
/// error surfaces to the caller. Run this on every startup, producer and
/// consumer alike.
pub async fn declare_topology(channel: &Channel) -> Result<(), HubError> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    channel
        .exchange_declare(
            MAIN_EXCHANGE,
            ExchangeKind::Direct,
            durable,
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let durable_queue = QueueDeclareOptions {
        durable: true,
        ..Default::default()
    };

    let mut main_args = FieldTable::default();
    main_args.insert("x-message-ttl".into(), AMQPValue::LongInt(MAIN_QUEUE_TTL_MS));
    main_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
    );
    channel
        .queue_declare(MAIN_QUEUE, durable_queue, main_args)
        .await?;

    let mut retry_args = FieldTable::default();
    retry_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(MAIN_EXCHANGE.into()),
    );
    retry_args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(DELIVERY_ROUTING_KEY.into()),
    );
    channel
        .queue_declare(RETRY_QUEUE, durable_queue, retry_args)
        .await?;

    channel
        .queue_declare(DEAD_LETTER_QUEUE, durable_queue, FieldTable::default())
        .await?;

    channel
        .queue_bind(
            MAIN_QUEUE,
            MAIN_EXCHANGE,
            DELIVERY_ROUTING_KEY,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            DEAD_LETTER_QUEUE,
            DEAD_LETTER_EXCHANGE,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    tracing::info!(
        main_queue = MAIN_QUEUE,
        retry_queue = RETRY_QUEUE,
        dead_letter_queue = DEAD_LETTER_QUEUE,
        "broker topology declared"
    );
    Ok(())
}

/// Publishing capabilities the pipeline and the worker need from the
/// broker. Tests substitute a recording fake.
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Publish a fresh job to the main exchange.
    async fn publish_job(&self, job: &DeliveryJob) -> Result<(), HubError>;

    /// Park a job on the retry queue for at least `delay_ms` milliseconds.
    async fn publish_retry(&self, job: &DeliveryJob, delay_ms: u64) -> Result<(), HubError>;

    /// Route a terminally failed job to the dead-letter exchange.
    async fn publish_dead(&self, job: &DeliveryJob) -> Result<(), HubError>;
}

/// AMQP-backed transport. All publishes go through the channel it was
/// built with, including those issued from inside the consumer loop.
#[derive(Clone)]
pub struct AmqpTransport {
    channel: Channel,
}

impl AmqpTransport {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        job: &DeliveryJob,
    ) -> Result<(), HubError> {
        let body = serde_json::to_vec(job)?;
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobTransport for AmqpTransport {
    async fn publish_job(&self, job: &DeliveryJob) -> Result<(), HubError> {
        self.publish(MAIN_EXCHANGE, DELIVERY_ROUTING_KEY, persistent(), job)
            .await
    }

    async fn publish_retry(&self, job: &DeliveryJob, delay_ms: u64) -> Result<(), HubError> {
        // The default exchange routes straight to the retry queue by name;
        // the per-message expiration is the retry delay.
        let properties = persistent().with_expiration(delay_ms.to_string().into());
        self.publish("", RETRY_QUEUE, properties, job).await
    }

    async fn publish_dead(&self, job: &DeliveryJob) -> Result<(), HubError> {
        self.publish(DEAD_LETTER_EXCHANGE, "", persistent(), job).await
    }
}

fn persistent() -> BasicProperties {
    BasicProperties::default().with_delivery_mode(2)
}

/// One captured publish, as seen by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishedJob {
    Main(DeliveryJob),
    Retry { job: DeliveryJob, delay_ms: u64 },
    Dead(DeliveryJob),
}

/// Transport fake that records every publish for inspection.
#[derive(Default)]
pub struct RecordingTransport {
    log: Mutex<Vec<PublishedJob>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<PublishedJob> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl JobTransport for RecordingTransport {
    async fn publish_job(&self, job: &DeliveryJob) -> Result<(), HubError> {
        self.log.lock().await.push(PublishedJob::Main(job.clone()));
        Ok(())
    }

    async fn publish_retry(&self, job: &DeliveryJob, delay_ms: u64) -> Result<(), HubError> {
        self.log.lock().await.push(PublishedJob::Retry {
            job: job.clone(),
            delay_ms,
        });
        Ok(())
    }

    async fn publish_dead(&self, job: &DeliveryJob) -> Result<(), HubError> {
        self.log.lock().await.push(PublishedJob::Dead(job.clone()));
        Ok(())
    }
}
