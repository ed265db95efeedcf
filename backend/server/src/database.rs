//! # SQLite
//!
//! Relational store for listings, claims, deliveries and removal records.
//!
//! ## Requirements
//!
//! - Every lifecycle transition atomic
//! - Concurrent transitions on one listing serialized
//! - No claim outliving its listing, no delivery outliving its claim
//!
//! ## Implementation
//!
//! - WAL journal so searches keep reading while a transition writes
//! - Busy timeout so a blocked writer waits for the lock instead of failing
//! - Foreign keys on, with `ON DELETE CASCADE` from listings to claims to deliveries
//! - Schema applied from `migrations/` on startup
use std::{str::FromStr, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn init_sqlite(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    info!("Database ready at {database_url}");

    Ok(pool)
}
