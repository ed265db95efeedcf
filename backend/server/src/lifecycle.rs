//! # Listing Lifecycle
//!
//! Entry point for every user action on a listing.
//!
//! | Action            | Role      | Cascade                                  |
//! |-------------------|-----------|------------------------------------------|
//! | add listing       | donor     | none                                     |
//! | claim listing     | receiver  | none                                     |
//! | unclaim listing   | receiver  | deliverer of the claim's delivery        |
//! | remove listing    | donor     | every claim holder, then their deliverer |
//! | schedule delivery | deliverer | none                                     |
//! | advance delivery  | deliverer | none                                     |
//! | search listings   | any       | none                                     |
//!
//! The session actor is checked before the store is touched. A cascade starts
//! only after its transition has committed, and its outcome never changes the
//! result of the action.
use std::{sync::Arc, time::Duration};

use tracing::warn;

use crate::{
    cascade::{CascadeCoordinator, CascadeHandle},
    error::AppError,
    models::{
        ClaimKey, DeliveryKey, DeliveryState, DeliveryWindows, FoodListing, ListingKey, NewListing,
    },
    query::{ListingFilters, Scoping, build_listing_query},
    session::{Actor, ActorRole},
    store::ListingStore,
};

pub struct Lifecycle {
    store: ListingStore,
    coordinator: Arc<CascadeCoordinator>,
}

fn authorize(actor: Option<&Actor>, role: ActorRole) -> Result<&Actor, AppError> {
    let actor = actor.ok_or(AppError::LoginRequired)?;
    actor.require_role(role)?;

    Ok(actor)
}

impl Lifecycle {
    pub fn new(store: ListingStore, coordinator: Arc<CascadeCoordinator>) -> Self {
        Self { store, coordinator }
    }

    pub fn store(&self) -> &ListingStore {
        &self.store
    }

    pub async fn add_listing(
        &self,
        actor: Option<&Actor>,
        listing: &NewListing,
    ) -> Result<ListingKey, AppError> {
        let donor = authorize(actor, ActorRole::Donor)?;

        self.store.add_listing(donor.key, listing).await
    }

    pub async fn claim_listing(
        &self,
        actor: Option<&Actor>,
        listing_key: ListingKey,
        quantity: Option<u32>,
    ) -> Result<ClaimKey, AppError> {
        let receiver = authorize(actor, ActorRole::Receiver)?;

        self.store
            .claim_listing(listing_key, receiver.key, quantity)
            .await
    }

    pub async fn unclaim_listing(
        &self,
        actor: Option<&Actor>,
        claim_key: ClaimKey,
    ) -> Result<CascadeHandle, AppError> {
        let receiver = authorize(actor, ActorRole::Receiver)?;

        let lost = self.store.unclaim_listing(claim_key, receiver.key).await?;

        Ok(self.coordinator.spawn_unclaim(lost))
    }

    pub async fn remove_listing(
        &self,
        actor: Option<&Actor>,
        listing_key: ListingKey,
        reason: &str,
    ) -> Result<CascadeHandle, AppError> {
        let donor = authorize(actor, ActorRole::Donor)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Validation(
                "a removal reason is required".to_string(),
            ));
        }

        let affected = self
            .store
            .remove_listing(listing_key, donor.key, reason)
            .await?;

        Ok(self.coordinator.spawn_removal(affected))
    }

    pub async fn schedule_delivery(
        &self,
        actor: Option<&Actor>,
        claim_key: ClaimKey,
        windows: &DeliveryWindows,
    ) -> Result<DeliveryKey, AppError> {
        let deliverer = authorize(actor, ActorRole::Deliverer)?;

        self.store
            .schedule_delivery(claim_key, deliverer.key, windows)
            .await
    }

    pub async fn advance_delivery(
        &self,
        actor: Option<&Actor>,
        delivery_key: DeliveryKey,
        next: DeliveryState,
    ) -> Result<DeliveryState, AppError> {
        let deliverer = authorize(actor, ActorRole::Deliverer)?;

        self.store
            .advance_delivery(delivery_key, deliverer.key, next)
            .await
    }

    /// Lets in-flight cascades finish within `grace` before the process exits.
    pub async fn drain_cascades(&self, grace: Duration) {
        self.coordinator.drain(grace).await;
    }

    /// Bad filters and missing permissions are errors. A failing store yields an
    /// empty page.
    pub async fn get_listings(
        &self,
        actor: Option<&Actor>,
        filters: &ListingFilters,
    ) -> Result<Vec<FoodListing>, AppError> {
        let scoping = Scoping::resolve(filters.scope, actor)?;
        let query = build_listing_query(filters, scoping)?;

        Ok(self.store.get_listings(&query).await.unwrap_or_else(|e| {
            warn!("Listing search failed, returning no listings: {e}");
            Vec::new()
        }))
    }
}
