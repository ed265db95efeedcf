use std::{
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::{
    capacity::CapacityPolicy,
    cascade::{CascadeCoordinator, RetryPolicy},
    config::Config,
    lifecycle::Lifecycle,
    models::{ListingKey, LostDelivery, NewListing, UnclaimNotificationData},
    notify::{Notice, NotificationChannel, NotificationDispatcher, NotificationFailure},
    session::ActorKey,
    state::State,
    store::ListingStore,
};

/// In-memory SQLite database with all migrations applied. One connection,
/// kept for the life of the pool, so every query sees the same database.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();

    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub(crate) async fn count_rows(pool: &SqlitePool, table: &str, listing_key: ListingKey) -> i64 {
    let sql = match table {
        "food_listings" => "SELECT COUNT(*) FROM food_listings WHERE listing_key = ?1",
        "claims" => "SELECT COUNT(*) FROM claims WHERE listing_key = ?1",
        "deliveries" => {
            "SELECT COUNT(*) FROM deliveries d JOIN claims c ON c.claim_key = d.claim_key \
             WHERE c.listing_key = ?1"
        }
        other => panic!("no row count for table {other}"),
    };

    let mut count: i64 = sqlx::query_scalar(sql)
        .bind(listing_key)
        .fetch_one(pool)
        .await
        .unwrap();

    // Orphans would escape the join above.
    if table == "deliveries" {
        let orphans: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deliveries WHERE claim_key NOT IN (SELECT claim_key FROM claims)",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        count += orphans;
    }

    count
}

pub(crate) fn new_listing(description: &str, quantity: u32) -> NewListing {
    NewListing {
        food_types: vec!["produce".to_string()],
        perishable: true,
        food_description: description.to_string(),
        expiration_date: NaiveDate::from_ymd_opt(2026, 10, 30).unwrap(),
        image_url: None,
        quantity,
    }
}

pub(crate) fn lost_delivery(
    delivery_key: i64,
    deliverer_key: ActorKey,
    listing_key: ListingKey,
) -> LostDelivery {
    LostDelivery {
        delivery_key,
        deliverer_key,
        claim_key: delivery_key,
        listing_key,
        food_description: "Fresh bread".to_string(),
    }
}

pub(crate) fn unclaim_data(
    claim_key: i64,
    listing_key: ListingKey,
    receiver_key: ActorKey,
    lost_delivery: Option<LostDelivery>,
) -> UnclaimNotificationData {
    UnclaimNotificationData {
        claim_key,
        listing_key,
        receiver_key,
        food_description: "Fresh bread".to_string(),
        reason: "no longer available".to_string(),
        lost_delivery,
    }
}

/// Records every notice it is asked to deliver. Failures are configured up front.
pub(crate) struct RecordingChannel {
    failing_recipients: Vec<ActorKey>,
    failing_first: usize,
    delay: Option<Duration>,
    attempts: Mutex<Vec<Notice>>,
    delivered: Mutex<Vec<Notice>>,
}

impl RecordingChannel {
    pub(crate) fn new() -> Self {
        Self {
            failing_recipients: Vec::new(),
            failing_first: 0,
            delay: None,
            attempts: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Every notice to `recipient_key` fails.
    pub(crate) fn failing_for(mut self, recipient_key: ActorKey) -> Self {
        self.failing_recipients.push(recipient_key);
        self
    }

    /// The first `attempts` deliveries fail, whoever they are for.
    pub(crate) fn failing_first(mut self, attempts: usize) -> Self {
        self.failing_first = attempts;
        self
    }

    /// Every notice fails.
    pub(crate) fn failing_always(self) -> Self {
        self.failing_first(usize::MAX)
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn attempts(&self) -> Vec<Notice> {
        self.attempts.lock().unwrap().clone()
    }

    pub(crate) fn delivered(&self) -> Vec<Notice> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotificationFailure> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(notice.clone());
            attempts.len()
        };

        if attempt <= self.failing_first || self.failing_recipients.contains(&notice.recipient_key)
        {
            return Err(NotificationFailure::Unavailable(format!(
                "recipient {} unreachable",
                notice.recipient_key
            )));
        }

        self.delivered.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

pub(crate) fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub(crate) fn test_coordinator(channel: Arc<RecordingChannel>) -> Arc<CascadeCoordinator> {
    let dispatcher = NotificationDispatcher::new(channel, Duration::from_secs(1));

    Arc::new(CascadeCoordinator::new(dispatcher, test_retry_policy()))
}

pub(crate) async fn test_lifecycle(
    channel: Arc<RecordingChannel>,
    policy: CapacityPolicy,
) -> Lifecycle {
    let store = ListingStore::new(setup_test_db().await, policy);

    Lifecycle::new(store, test_coordinator(channel))
}

pub(crate) async fn test_state(channel: Arc<RecordingChannel>) -> Arc<State> {
    let lifecycle = test_lifecycle(channel, CapacityPolicy::AllOrNothing).await;

    Arc::new(State::from_parts(Config::default(), lifecycle))
}
