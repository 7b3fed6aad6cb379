use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::broker::{JobTransport, MAIN_QUEUE};
use crate::client::DeliveryClient;
use crate::error::{AttemptOutcome, HubError};
use crate::storage::DeliveryStore;
use crate::types::DeliveryJob;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Executes one delivery attempt per message and records the outcome
/// durably before the message is settled.
///
/// The worker never errors on a reachable-but-unhappy destination: those
/// outcomes are classified and turn into a retry or a dead-letter. An
/// `Err` from [`DeliveryWorker::handle`] means the job itself could not
/// be processed (store or broker down, malformed ids) and the message
/// must be left unacked for the broker to dead-letter.
pub struct DeliveryWorker {
    deliveries: Arc<dyn DeliveryStore>,
    transport: Arc<dyn JobTransport>,
    client: DeliveryClient,
    policy: RetryPolicy,
    max_attempts: u32,
}

impl DeliveryWorker {
    pub fn new(
        deliveries: Arc<dyn DeliveryStore>,
        transport: Arc<dyn JobTransport>,
        client: DeliveryClient,
        policy: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            deliveries,
            transport,
            client,
            policy,
            max_attempts,
        }
    }

    /// Process one decoded job: attempt the POST, write the resulting
    /// state, and queue any follow-up message. `Ok` means the original
    /// message may be acked.
    pub async fn handle(&self, job: &DeliveryJob) -> Result<(), HubError> {
        let delivery_id = Uuid::parse_str(&job.delivery_id)
            .map_err(|err| HubError::MalformedJob(format!("bad delivery id: {err}")))?;

        let outcome = self.client.post(&job.target_url, &job.payload_json).await;

        match outcome {
            AttemptOutcome::Success => self.settle_delivered(delivery_id, job).await,
            AttemptOutcome::RetryableFailure { status, message }
                if job.attempt < self.max_attempts =>
            {
                self.schedule_retry(delivery_id, job, status, &message).await
            }
            AttemptOutcome::RetryableFailure { message, .. } => {
                self.settle_dead(delivery_id, job, &message).await
            }
            AttemptOutcome::NonRetryableFailure { message, .. } => {
                self.settle_dead(delivery_id, job, &message).await
            }
        }
    }

    async fn settle_delivered(&self, id: Uuid, job: &DeliveryJob) -> Result<(), HubError> {
        let applied = self
            .deliveries
            .mark_delivered(id, job.attempt, Utc::now())
            .await?;
        if !applied {
            tracing::warn!(delivery_id = %id, "row already settled; dropping stale success");
            return Ok(());
        }
        metric_inc("webhookhub.delivery.delivered");
        tracing::info!(
            delivery_id = %id,
            event_id = %job.event_id,
            attempt = job.attempt,
            "delivered"
        );
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        job: &DeliveryJob,
        status: u16,
        message: &str,
    ) -> Result<(), HubError> {
        let next = job.attempt + 1;
        let delay_ms = self.policy.delay_ms(job.attempt);

        // Status write first; the republish only goes out for a row that
        // actually moved to RETRYING.
        let applied = self
            .deliveries
            .mark_retrying(id, next, message, Utc::now())
            .await?;
        if !applied {
            tracing::warn!(delivery_id = %id, "row already settled; dropping stale retry");
            return Ok(());
        }

        let retry_job = DeliveryJob {
            attempt: next,
            ..job.clone()
        };
        self.transport.publish_retry(&retry_job, delay_ms).await?;

        metric_inc("webhookhub.delivery.retry_scheduled");
        tracing::warn!(
            delivery_id = %id,
            attempt = job.attempt,
            next_attempt = next,
            delay_ms,
            status,
            error = message,
            "attempt failed; retry scheduled"
        );
        Ok(())
    }

    async fn settle_dead(&self, id: Uuid, job: &DeliveryJob, message: &str) -> Result<(), HubError> {
        let applied = self
            .deliveries
            .mark_dead(id, job.attempt, message, Utc::now())
            .await?;
        if !applied {
            tracing::warn!(delivery_id = %id, "row already settled; dropping stale failure");
            return Ok(());
        }

        self.transport.publish_dead(job).await?;

        metric_inc("webhookhub.delivery.dead");
        tracing::error!(
            delivery_id = %id,
            event_id = %job.event_id,
            attempt = job.attempt,
            error = message,
            "delivery dead-lettered"
        );
        Ok(())
    }
}

/// Consumes the main delivery queue until shut down.
///
/// Prefetch bounds the number of unacked (and therefore in-flight)
/// messages per consumer; each message is processed on its own task and
/// settled with a manual ack only after its state write and any
/// follow-up publish have completed. Anything unsettled at shutdown is
/// redelivered by the broker.
pub struct DeliveryConsumer {
    worker: Arc<DeliveryWorker>,
    prefetch: u16,
    drain_window: Duration,
}

impl DeliveryConsumer {
    pub fn new(worker: Arc<DeliveryWorker>, prefetch: u16) -> Self {
        Self {
            worker,
            prefetch,
            drain_window: Duration::from_secs(30),
        }
    }

    /// Cap on how long shutdown waits for in-flight messages to finish
    /// their state writes.
    pub fn with_drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Run the consume loop until `shutdown` resolves, then drain.
    pub async fn run_until(
        &self,
        channel: &Channel,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), HubError> {
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        let mut consumer = channel
            .basic_consume(
                MAIN_QUEUE,
                "delivery-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = MAIN_QUEUE, prefetch = self.prefetch, "consuming");

        let mut in_flight = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = consumer.next() => {
                    let Some(delivery) = next else { break };
                    let delivery = delivery?;

                    // Reap settled tasks so the set stays bounded.
                    while in_flight.try_join_next().is_some() {}

                    let worker = self.worker.clone();
                    in_flight.spawn(async move {
                        process_message(worker, delivery).await;
                    });
                }
            }
        }

        // Stop pulling new messages, then give in-flight handlers a
        // bounded window to finish their status writes.
        drop(consumer);
        let drain = async {
            while in_flight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.drain_window, drain).await.is_err() {
            tracing::warn!("drain window elapsed with messages still in flight");
        }
        Ok(())
    }
}

async fn process_message(worker: Arc<DeliveryWorker>, delivery: AmqpDelivery) {
    let job = match serde_json::from_slice::<DeliveryJob>(&delivery.data) {
        Ok(job) => job,
        Err(err) => {
            tracing::error!(error = %err, "undecodable job; routing to dead letters");
            metric_inc("webhookhub.consumer.undecodable");
            nack_no_requeue(&delivery).await;
            return;
        }
    };

    match worker.handle(&job).await {
        Ok(()) => {
            if let Err(err) = delivery.acker.ack(BasicAckOptions::default()).await {
                tracing::error!(
                    delivery_id = %job.delivery_id,
                    error = %err,
                    "ack failed; broker will redeliver"
                );
            }
        }
        Err(err) => {
            tracing::error!(
                delivery_id = %job.delivery_id,
                attempt = job.attempt,
                error = %err,
                "processing failed; routing to dead letters"
            );
            metric_inc("webhookhub.consumer.unhandled");
            nack_no_requeue(&delivery).await;
        }
    }
}

async fn nack_no_requeue(delivery: &AmqpDelivery) {
    let options = BasicNackOptions {
        requeue: false,
        ..Default::default()
    };
    if let Err(err) = delivery.acker.nack(options).await {
        tracing::error!(error = %err, "nack failed");
    }
}
