//! # PostgreSQL Integration Tests
//!
//! These tests require a running PostgreSQL server and are marked with
//! `#[ignore]`. Run with: `cargo test --test storage_pg -- --ignored`
//!
//! ## Setup
//!
//! Start PostgreSQL with Docker:
//! ```bash
//! docker run -d --name postgres -p 5432:5432 -e POSTGRES_PASSWORD=postgres postgres:16
//! ```
//!
//! Point `DB_URL` (and `DB_USER`/`DB_PASSWORD` if needed) at the server.

use chrono::Utc;
use tokio_postgres::NoTls;
use uuid::Uuid;
use webhookhub::{
    Delivery, DeliveryStatus, DeliveryStore, DestinationDirectory, Event, EventStore, HubConfig,
    PostgresStorage, SourceDirectory,
};

async fn storage() -> PostgresStorage {
    let config = HubConfig::from_env();
    PostgresStorage::connect(&config)
        .await
        .expect("Failed to connect to PostgreSQL")
}

/// Separate raw client for seeding the read-only tables.
async fn raw_client() -> tokio_postgres::Client {
    let config = HubConfig::from_env();
    let mut pg = config
        .db_url
        .parse::<tokio_postgres::Config>()
        .expect("bad DB_URL");
    if !config.db_user.is_empty() {
        pg.user(&config.db_user);
    }
    if !config.db_password.is_empty() {
        pg.password(&config.db_password);
    }
    let (client, connection) = pg.connect(NoTls).await.expect("Failed to connect");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn seed_source(client: &tokio_postgres::Client, name: &str, active: bool) -> Uuid {
    let id = Uuid::new_v4();
    client
        .execute(
            "INSERT INTO sources (id, name, hmac_secret, active, created_at)
             VALUES ($1, $2, $3, $4, now())",
            &[&id, &name, &"aa".repeat(32), &active],
        )
        .await
        .expect("Failed to seed source");
    id
}

async fn seed_destination(client: &tokio_postgres::Client, active: bool) -> Uuid {
    let id = Uuid::new_v4();
    client
        .execute(
            "INSERT INTO destinations (id, name, target_url, active, created_at)
             VALUES ($1, $2, $3, $4, now())",
            &[&id, &format!("dest-{id}"), &"https://example.com/hook", &active],
        )
        .await
        .expect("Failed to seed destination");
    id
}

async fn seed_rule(
    client: &tokio_postgres::Client,
    destination_id: Uuid,
    source_name: &str,
    event_type: &str,
) {
    client
        .execute(
            "INSERT INTO destination_rules (id, destination_id, source_name, event_type)
             VALUES ($1, $2, $3, $4)",
            &[&Uuid::new_v4(), &destination_id, &source_name, &event_type],
        )
        .await
        .expect("Failed to seed rule");
}

/// Unique body per run so reruns never collide on the fingerprint.
fn unique_event(source_name: &str) -> Event {
    Event::from_request(
        source_name,
        "push",
        &format!(r#"{{"run":"{}"}}"#, Uuid::new_v4()),
    )
}

#[tokio::test]
#[ignore = "Requires PostgreSQL - run with --ignored"]
async fn event_fingerprint_constraint_dedupes() {
    let store = storage().await;
    let first = unique_event("pg-test");

    assert!(store.insert_if_absent(&first).await.unwrap());

    // Same submission, new row id: the constraint swallows it.
    let mut second = first.clone();
    second.id = Uuid::new_v4();
    assert!(!store.insert_if_absent(&second).await.unwrap());
}

#[tokio::test]
#[ignore = "Requires PostgreSQL - run with --ignored"]
async fn delivery_pair_is_unique() {
    let store = storage().await;
    let client = raw_client().await;

    let event = unique_event("pg-test");
    store.insert_if_absent(&event).await.unwrap();
    let destination_id = seed_destination(&client, true).await;

    store
        .insert(&Delivery::pending(event.id, destination_id, 5))
        .await
        .unwrap();
    let err = store
        .insert(&Delivery::pending(event.id, destination_id, 5))
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.contains("storage"), "unexpected error: {text}");
}

#[tokio::test]
#[ignore = "Requires PostgreSQL - run with --ignored"]
async fn status_transitions_are_conditional_on_non_terminal_rows() {
    let store = storage().await;
    let client = raw_client().await;

    let event = unique_event("pg-test");
    store.insert_if_absent(&event).await.unwrap();
    let destination_id = seed_destination(&client, true).await;

    let delivery = Delivery::pending(event.id, destination_id, 5);
    store.insert(&delivery).await.unwrap();

    assert!(store
        .mark_retrying(delivery.id, 2, "destination answered 503", Utc::now())
        .await
        .unwrap());

    let row = store.delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Retrying);
    assert_eq!(row.attempts, 2);
    assert!(row.last_error.as_deref().unwrap().contains("503"));

    assert!(store.mark_delivered(delivery.id, 2, Utc::now()).await.unwrap());

    let row = store.delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
    // Success clears the stale error.
    assert_eq!(row.last_error, None);
    assert!(row.delivered_at.is_some());

    // Terminal: every further transition is refused.
    assert!(!store
        .mark_retrying(delivery.id, 3, "late", Utc::now())
        .await
        .unwrap());
    assert!(!store
        .mark_dead(delivery.id, 3, "late", Utc::now())
        .await
        .unwrap());

    let row = store.delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(row.status, DeliveryStatus::Delivered);
    assert_eq!(row.attempts, 2);
}

#[tokio::test]
#[ignore = "Requires PostgreSQL - run with --ignored"]
async fn source_lookup_returns_secret_and_active_flag() {
    let store = storage().await;
    let client = raw_client().await;

    let name = format!("src-{}", Uuid::new_v4());
    seed_source(&client, &name, false).await;

    let source = store.source_by_name(&name).await.unwrap().unwrap();
    assert_eq!(source.name, name);
    assert!(!source.active);
    assert_eq!(source.hmac_secret.len(), 64);

    assert!(store.source_by_name("no-such-source").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires PostgreSQL - run with --ignored"]
async fn destination_lookup_joins_rules_and_filters_inactive() {
    let store = storage().await;
    let client = raw_client().await;

    // Unique source name per run keeps reruns independent.
    let source_name = format!("src-{}", Uuid::new_v4());
    let live = seed_destination(&client, true).await;
    let dark = seed_destination(&client, false).await;
    seed_rule(&client, live, &source_name, "push").await;
    seed_rule(&client, dark, &source_name, "push").await;

    let matched = store.destinations_for(&source_name, "push").await.unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id, live);

    assert!(store
        .destinations_for(&source_name, "tag")
        .await
        .unwrap()
        .is_empty());
}
