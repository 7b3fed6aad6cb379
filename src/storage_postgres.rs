use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::storage::{DeliveryStore, DestinationDirectory, EventStore, SourceDirectory};
use crate::types::{Delivery, DeliveryStatus, Destination, Event, Source};

/// PostgreSQL-backed stores sharing one client.
///
/// Writes are single statements, so each event insert and each status
/// transition is its own transaction. One instance implements every
/// store capability; hand out `Arc` clones per seam.
pub struct PostgresStorage {
    client: Client,
}

impl PostgresStorage {
    /// Connect with the configured credentials and ensure the schema.
    pub async fn connect(config: &HubConfig) -> Result<Self, HubError> {
        let mut pg = config
            .db_url
            .parse::<tokio_postgres::Config>()
            .map_err(|err| HubError::Storage(err.to_string()))?;
        if !config.db_user.is_empty() {
            pg.user(&config.db_user);
        }
        if !config.db_password.is_empty() {
            pg.password(&config.db_password);
        }

        let (client, connection) = pg
            .connect(NoTls)
            .await
            .map_err(|err| HubError::Storage(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection terminated");
            }
        });

        Self::new(client).await
    }

    /// Wrap an existing client and ensure the schema.
    pub async fn new(client: Client) -> Result<Self, HubError> {
        let storage = Self { client };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<(), HubError> {
        self.client
            .batch_execute(
                r#"
                DO $$ BEGIN
                    CREATE TYPE delivery_status AS ENUM
                        ('PENDING', 'DELIVERED', 'RETRYING', 'DEAD');
                EXCEPTION WHEN duplicate_object THEN NULL;
                END $$;

                CREATE TABLE IF NOT EXISTS sources (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    hmac_secret TEXT NOT NULL,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );

                CREATE TABLE IF NOT EXISTS destinations (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    target_url TEXT NOT NULL,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );

                CREATE TABLE IF NOT EXISTS destination_rules (
                    id UUID PRIMARY KEY,
                    destination_id UUID NOT NULL REFERENCES destinations(id),
                    source_name TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    UNIQUE (destination_id, source_name, event_type)
                );

                CREATE TABLE IF NOT EXISTS events (
                    id UUID PRIMARY KEY,
                    source_name TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    idempotency_key TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    received_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (source_name, idempotency_key)
                );

                CREATE TABLE IF NOT EXISTS deliveries (
                    id UUID PRIMARY KEY,
                    event_id UUID NOT NULL REFERENCES events(id),
                    destination_id UUID NOT NULL REFERENCES destinations(id),
                    status delivery_status NOT NULL DEFAULT 'PENDING',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    last_error TEXT,
                    last_attempt_at TIMESTAMPTZ,
                    delivered_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (event_id, destination_id)
                );
                "#,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SourceDirectory for PostgresStorage {
    async fn source_by_name(&self, name: &str) -> Result<Option<Source>, HubError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, name, hmac_secret, active, created_at
                 FROM sources WHERE name = $1",
                &[&name],
            )
            .await?;
        Ok(row.map(|row| Source {
            id: row.get(0),
            name: row.get(1),
            hmac_secret: row.get(2),
            active: row.get(3),
            created_at: row.get(4),
        }))
    }
}

#[async_trait]
impl DestinationDirectory for PostgresStorage {
    async fn destinations_for(
        &self,
        source_name: &str,
        event_type: &str,
    ) -> Result<Vec<Destination>, HubError> {
        let rows = self
            .client
            .query(
                "SELECT d.id, d.name, d.target_url, d.active, d.created_at
                 FROM destinations d
                 JOIN destination_rules r ON r.destination_id = d.id
                 WHERE r.source_name = $1 AND r.event_type = $2 AND d.active",
                &[&source_name, &event_type],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Destination {
                id: row.get(0),
                name: row.get(1),
                target_url: row.get(2),
                active: row.get(3),
                created_at: row.get(4),
            })
            .collect())
    }
}

#[async_trait]
impl EventStore for PostgresStorage {
    async fn insert_if_absent(&self, event: &Event) -> Result<bool, HubError> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO events
                     (id, source_name, event_type, idempotency_key, payload_json, received_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (source_name, idempotency_key) DO NOTHING",
                &[
                    &event.id,
                    &event.source_name,
                    &event.event_type,
                    &event.idempotency_key,
                    &event.payload_json,
                    &event.received_at,
                ],
            )
            .await?;
        Ok(inserted == 1)
    }
}

#[async_trait]
impl DeliveryStore for PostgresStorage {
    async fn insert(&self, delivery: &Delivery) -> Result<(), HubError> {
        let attempts = delivery.attempts as i32;
        let max_attempts = delivery.max_attempts as i32;
        self.client
            .execute(
                "INSERT INTO deliveries
                     (id, event_id, destination_id, status, attempts, max_attempts,
                      last_error, last_attempt_at, delivered_at, created_at)
                 VALUES ($1, $2, $3, $4::delivery_status, $5, $6, $7, $8, $9, $10)",
                &[
                    &delivery.id,
                    &delivery.event_id,
                    &delivery.destination_id,
                    &delivery.status.as_str(),
                    &attempts,
                    &max_attempts,
                    &delivery.last_error,
                    &delivery.last_attempt_at,
                    &delivery.delivered_at,
                    &delivery.created_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        attempts: u32,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        let attempts = attempts as i32;
        let updated = self
            .client
            .execute(
                "UPDATE deliveries
                 SET status = 'DELIVERED', attempts = $2, last_error = NULL, delivered_at = $3
                 WHERE id = $1 AND status NOT IN ('DELIVERED', 'DEAD')",
                &[&id, &attempts, &delivered_at],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn mark_retrying(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        let attempts = attempts as i32;
        let updated = self
            .client
            .execute(
                "UPDATE deliveries
                 SET status = 'RETRYING', attempts = $2, last_error = $3, last_attempt_at = $4
                 WHERE id = $1 AND status NOT IN ('DELIVERED', 'DEAD')",
                &[&id, &attempts, &error, &attempted_at],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        attempts: u32,
        error: &str,
        attempted_at: DateTime<Utc>,
    ) -> Result<bool, HubError> {
        let attempts = attempts as i32;
        let updated = self
            .client
            .execute(
                "UPDATE deliveries
                 SET status = 'DEAD', attempts = $2, last_error = $3, last_attempt_at = $4
                 WHERE id = $1 AND status NOT IN ('DELIVERED', 'DEAD')",
                &[&id, &attempts, &error, &attempted_at],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn delivery(&self, id: Uuid) -> Result<Option<Delivery>, HubError> {
        let row = self
            .client
            .query_opt(
                "SELECT id, event_id, destination_id, status::text, attempts, max_attempts,
                        last_error, last_attempt_at, delivered_at, created_at
                 FROM deliveries WHERE id = $1",
                &[&id],
            )
            .await?;

        row.map(|row| {
            let label: String = row.get(3);
            let status = DeliveryStatus::parse(&label)
                .ok_or_else(|| HubError::Storage(format!("unknown delivery status `{label}`")))?;
            let attempts: i32 = row.get(4);
            let max_attempts: i32 = row.get(5);
            Ok(Delivery {
                id: row.get(0),
                event_id: row.get(1),
                destination_id: row.get(2),
                status,
                attempts: attempts as u32,
                max_attempts: max_attempts as u32,
                last_error: row.get(6),
                last_attempt_at: row.get(7),
                delivered_at: row.get(8),
                created_at: row.get(9),
            })
        })
        .transpose()
    }
}
