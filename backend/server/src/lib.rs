//! Food donation listing server.
//!
//! Donors post food listings, receivers claim them and deliverers schedule
//! pick-up and drop-off for a claim.
//!
//!
//!
//! # General Infrastructure
//! - Auth happens upstream; the verified user arrives as `x-actor-key` / `x-actor-role` headers
//! - All lifecycle routes are `POST` with JSON bodies under `/foodListings`
//! - Listings, claims and deliveries live in one SQLite database
//! - Notices go to a mailer webhook, or to the log when none is configured
//!
//!
//!
//! # Removing a Listing
//!
//! **Goal**: Nobody keeps waiting on food that is gone.
//!
//! - The listing, its claims and their deliveries are deleted in one transaction
//! - The transaction also returns every affected claim, oldest first
//! - After commit, each claim holder is told their claim was removed
//! - Right after a claim holder, the deliverer of that claim's delivery is told
//! - A notice that keeps failing is logged with its keys and skipped
//! - The donor's request succeeds either way
//! - On shutdown, running cascades get `CASCADE_DRAIN_MS` to finish; notices
//!   still unsent after that are logged with their keys
//!
//!
//!
//! # Configuration
//!
//! | Variable              | Default            |
//! |-----------------------|--------------------|
//! | `RUST_PORT`           | `8080`             |
//! | `DATABASE_URL`        | `sqlite://food.db` |
//! | `CAPACITY_POLICY`     | `all_or_nothing`   |
//! | `NOTIFY_WEBHOOK_URL`  | unset, log only    |
//! | `NOTIFY_TIMEOUT_MS`   | `2000`             |
//! | `NOTIFY_MAX_ATTEMPTS` | `3`                |
//! | `CASCADE_DRAIN_MS`    | `10000`            |
//!
//! Webhook bearer token is read from the `NOTIFY_WEBHOOK_TOKEN` Docker secret.
//!
//! Log level comes from `RUST_LOG`.
//! ```sh
//! RUST_LOG=food=debug cargo run --bin server
//! ```
//!
//! Log every generated search statement.
//! ```sh
//! cargo run --bin server --features verbose
//! ```
use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Router,
    http::{
        HeaderName, Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod capacity;
pub mod cascade;
pub mod config;
pub mod database;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod query;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

use routes::{
    add_listing_handler, claim_listing_handler, food_types_handler, get_listings_handler,
    health_handler, remove_listing_handler, schedule_delivery_handler, unclaim_listing_handler,
    update_delivery_state_handler,
};
use session::{ACTOR_KEY_HEADER, ACTOR_ROLE_HEADER};
use state::State;

pub fn router(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(ACTOR_KEY_HEADER),
            HeaderName::from_static(ACTOR_ROLE_HEADER),
        ])
        .max_age(Duration::from_secs(60 * 60));

    let listings = Router::new()
        .route("/addFoodListing", post(add_listing_handler))
        .route("/removeFoodListing", post(remove_listing_handler))
        .route("/claimFoodListing", post(claim_listing_handler))
        .route("/unclaimFoodListing", post(unclaim_listing_handler))
        .route("/getFoodListings", post(get_listings_handler))
        .route("/scheduleDelivery", post(schedule_delivery_handler))
        .route("/updateDeliveryState", post(update_delivery_state_handler));

    Router::new()
        .nest("/foodListings", listings)
        .route("/domain/foodTypes", get(food_types_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = State::new().await?;

    info!("Starting server...");

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    state
        .lifecycle
        .drain_cascades(state.config.cascade_drain_timeout)
        .await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
