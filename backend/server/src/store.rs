//! # Listing Store
//!
//! Only place that reads or writes listing, claim and delivery rows.
//!
//! ## Transactions
//! - Every transition is one transaction
//! - The first statement of every transition is a write, so the SQLite write
//!   lock is held before anything is read and concurrent transitions on the
//!   same listing serialize
//! - The affected set a transition returns is read inside that same
//!   transaction, so a claim destroyed by one transition is never reported by
//!   a racing one
//! - On any error the transaction is dropped and rolled back
//!
//! ## Invariants
//! - No delivery without a live claim
//! - No claim without a live listing
//! - `claimed_units` equals the sum of the listing's claim quantities
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};

use crate::{
    capacity::CapacityPolicy,
    error::AppError,
    models::{
        ClaimKey, DeliveryKey, DeliveryState, DeliveryWindows, FoodListing, ListingKey,
        ListingRemoval, ListingState, LostDelivery, NewListing, UnclaimNotificationData,
    },
    query::{ListingQuery, QueryArg},
    session::ActorKey,
    utils::normalize_food_types,
};

#[derive(sqlx::FromRow)]
struct ListingRow {
    listing_key: ListingKey,
    donor_key: ActorKey,
    food_types: String,
    perishable: bool,
    food_description: String,
    expire_date: NaiveDate,
    image_url: Option<String>,
    quantity: i64,
    claimed_units: i64,
    created_at: NaiveDateTime,
}

impl TryFrom<ListingRow> for FoodListing {
    type Error = AppError;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        let food_types: Vec<String> = serde_json::from_str(&row.food_types)
            .map_err(|e| AppError::Persistence(sqlx::Error::Decode(Box::new(e))))?;

        Ok(Self {
            listing_key: row.listing_key,
            donor_key: row.donor_key,
            food_types,
            perishable: row.perishable,
            food_description: row.food_description,
            expiration_date: row.expire_date,
            image_url: row.image_url,
            quantity: row.quantity,
            claimed_units: row.claimed_units,
            state: ListingState::derive(row.quantity, row.claimed_units),
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AffectedClaimRow {
    claim_key: ClaimKey,
    listing_key: ListingKey,
    receiver_key: ActorKey,
    food_description: String,
    delivery_key: Option<DeliveryKey>,
    deliverer_key: Option<ActorKey>,
}

impl AffectedClaimRow {
    fn into_notification(self, reason: &str) -> UnclaimNotificationData {
        let lost_delivery = match (self.delivery_key, self.deliverer_key) {
            (Some(delivery_key), Some(deliverer_key)) => Some(LostDelivery {
                delivery_key,
                deliverer_key,
                claim_key: self.claim_key,
                listing_key: self.listing_key,
                food_description: self.food_description.clone(),
            }),
            _ => None,
        };

        UnclaimNotificationData {
            claim_key: self.claim_key,
            listing_key: self.listing_key,
            receiver_key: self.receiver_key,
            food_description: self.food_description,
            reason: reason.to_string(),
            lost_delivery,
        }
    }
}

const INSERT_LISTING: &str = "
    INSERT INTO food_listings
        (donor_key, food_types, perishable, food_description, expire_date, image_url, quantity)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    RETURNING listing_key
";

const RECORD_REMOVAL: &str = "
    INSERT INTO listing_removals (listing_key, donor_key, reason, claims_invalidated)
    SELECT l.listing_key, l.donor_key, ?3,
        (SELECT COUNT(*) FROM claims c WHERE c.listing_key = l.listing_key)
    FROM food_listings l
    WHERE l.listing_key = ?1 AND l.donor_key = ?2
";

// Deliveries that are already completed or cancelled are not reported as lost.
const AFFECTED_CLAIMS: &str = "
    SELECT c.claim_key, c.listing_key, c.receiver_key, l.food_description,
        d.delivery_key, d.deliverer_key
    FROM claims c
    JOIN food_listings l ON l.listing_key = c.listing_key
    LEFT JOIN deliveries d
        ON d.claim_key = c.claim_key AND d.state IN ('scheduled', 'in_transit')
    WHERE c.listing_key = ?1
    ORDER BY c.created_at ASC, c.claim_key ASC
";

const RELEASE_CLAIM: &str = "
    UPDATE food_listings
    SET claimed_units = claimed_units - c.quantity
    FROM claims c
    WHERE c.claim_key = ?1 AND c.receiver_key = ?2 AND c.listing_key = food_listings.listing_key
";

const LOST_DELIVERIES: &str = "
    SELECT d.delivery_key, d.deliverer_key, c.claim_key, c.listing_key, l.food_description
    FROM deliveries d
    JOIN claims c ON c.claim_key = d.claim_key
    JOIN food_listings l ON l.listing_key = c.listing_key
    WHERE d.claim_key = ?1 AND d.state IN ('scheduled', 'in_transit')
";

const SCHEDULE_DELIVERY: &str = "
    INSERT INTO deliveries
        (claim_key, deliverer_key, pickup_start, pickup_end, dropoff_start, dropoff_end, state)
    SELECT c.claim_key, ?2, ?3, ?4, ?5, ?6, 'scheduled'
    FROM claims c
    WHERE c.claim_key = ?1
    ON CONFLICT (claim_key) DO UPDATE SET
        deliverer_key = excluded.deliverer_key,
        pickup_start = excluded.pickup_start,
        pickup_end = excluded.pickup_end,
        dropoff_start = excluded.dropoff_start,
        dropoff_end = excluded.dropoff_end,
        state = 'scheduled',
        scheduled_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
    WHERE deliveries.state = 'cancelled'
    RETURNING delivery_key
";

const ADVANCE_DELIVERY: &str = "
    UPDATE deliveries
    SET state = ?3
    WHERE delivery_key = ?1 AND deliverer_key = ?2
        AND state IN (SELECT value FROM json_each(?4))
";

#[derive(Clone)]
pub struct ListingStore {
    pool: SqlitePool,
    policy: CapacityPolicy,
}

impl ListingStore {
    pub fn new(pool: SqlitePool, policy: CapacityPolicy) -> Self {
        Self { pool, policy }
    }

    #[cfg(test)]
    pub(crate) fn pool_for_tests(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn add_listing(
        &self,
        donor_key: ActorKey,
        listing: &NewListing,
    ) -> Result<ListingKey, AppError> {
        if listing.food_description.trim().is_empty() {
            return Err(AppError::Validation(
                "food description is required".to_string(),
            ));
        }

        if listing.quantity == 0 {
            return Err(AppError::Validation(
                "quantity must be at least 1".to_string(),
            ));
        }

        let food_types = serde_json::to_string(&normalize_food_types(&listing.food_types))
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let listing_key: ListingKey = sqlx::query_scalar(INSERT_LISTING)
            .bind(donor_key)
            .bind(food_types)
            .bind(listing.perishable)
            .bind(listing.food_description.trim())
            .bind(listing.expiration_date)
            .bind(listing.image_url.as_deref())
            .bind(i64::from(listing.quantity))
            .fetch_one(&self.pool)
            .await?;

        info!(listing_key, donor_key, "Food listing added");

        Ok(listing_key)
    }

    pub async fn claim_listing(
        &self,
        listing_key: ListingKey,
        receiver_key: ActorKey,
        quantity: Option<u32>,
    ) -> Result<ClaimKey, AppError> {
        let reservation = self.policy.reservation(quantity)?;

        let mut sql_tx = self.pool.begin().await?;

        let mut reserve = sqlx::query_scalar::<_, i64>(reservation.sql()).bind(listing_key);
        if let Some(units) = reservation.units() {
            reserve = reserve.bind(units);
        }

        let Some(reserved_units) = reserve.fetch_optional(&mut *sql_tx).await? else {
            return match listing_donor(&mut sql_tx, listing_key).await? {
                Some(_) => {
                    debug!(listing_key, receiver_key, "Claim lost, no capacity left");
                    Err(AppError::NotClaimable(format!(
                        "listing {listing_key} has no claimable capacity left"
                    )))
                }
                None => Err(AppError::NotFound(format!("listing {listing_key}"))),
            };
        };

        let claim_key: ClaimKey = sqlx::query_scalar(
            "INSERT INTO claims (listing_key, receiver_key, quantity) VALUES (?1, ?2, ?3) RETURNING claim_key",
        )
        .bind(listing_key)
        .bind(receiver_key)
        .bind(reserved_units)
        .fetch_one(&mut *sql_tx)
        .await?;

        sql_tx.commit().await?;

        info!(
            listing_key,
            claim_key, receiver_key, reserved_units, "Food listing claimed"
        );

        Ok(claim_key)
    }

    /// Returns the delivery destroyed with the claim, if one was live.
    pub async fn unclaim_listing(
        &self,
        claim_key: ClaimKey,
        receiver_key: ActorKey,
    ) -> Result<Vec<LostDelivery>, AppError> {
        let mut sql_tx = self.pool.begin().await?;

        let released = sqlx::query(RELEASE_CLAIM)
            .bind(claim_key)
            .bind(receiver_key)
            .execute(&mut *sql_tx)
            .await?
            .rows_affected();

        if released == 0 {
            let owner: Option<ActorKey> =
                sqlx::query_scalar("SELECT receiver_key FROM claims WHERE claim_key = ?1")
                    .bind(claim_key)
                    .fetch_optional(&mut *sql_tx)
                    .await?;

            return Err(match owner {
                Some(_) => {
                    warn!(claim_key, receiver_key, "Unclaim attempted on another receiver's claim");
                    AppError::Unauthorized(format!("claim {claim_key} belongs to another receiver"))
                }
                None => AppError::NotFound(format!("claim {claim_key}")),
            });
        }

        let lost: Vec<LostDelivery> = sqlx::query_as(LOST_DELIVERIES)
            .bind(claim_key)
            .fetch_all(&mut *sql_tx)
            .await?;

        sqlx::query("DELETE FROM deliveries WHERE claim_key = ?1")
            .bind(claim_key)
            .execute(&mut *sql_tx)
            .await?;

        sqlx::query("DELETE FROM claims WHERE claim_key = ?1")
            .bind(claim_key)
            .execute(&mut *sql_tx)
            .await?;

        sql_tx.commit().await?;

        info!(
            claim_key,
            receiver_key,
            deliveries_lost = lost.len(),
            "Food listing unclaimed"
        );

        Ok(lost)
    }

    /// Deletes the listing with all of its claims and deliveries. One entry per
    /// claim, oldest claim first.
    pub async fn remove_listing(
        &self,
        listing_key: ListingKey,
        donor_key: ActorKey,
        reason: &str,
    ) -> Result<Vec<UnclaimNotificationData>, AppError> {
        let mut sql_tx = self.pool.begin().await?;

        let recorded = sqlx::query(RECORD_REMOVAL)
            .bind(listing_key)
            .bind(donor_key)
            .bind(reason)
            .execute(&mut *sql_tx)
            .await?
            .rows_affected();

        if recorded == 0 {
            return Err(match listing_donor(&mut sql_tx, listing_key).await? {
                Some(_) => {
                    warn!(listing_key, donor_key, "Removal attempted by non-owner");
                    AppError::Unauthorized(format!("listing {listing_key} belongs to another donor"))
                }
                None => AppError::NotFound(format!("listing {listing_key}")),
            });
        }

        let affected: Vec<UnclaimNotificationData> = sqlx::query_as::<_, AffectedClaimRow>(AFFECTED_CLAIMS)
            .bind(listing_key)
            .fetch_all(&mut *sql_tx)
            .await?
            .into_iter()
            .map(|row| row.into_notification(reason))
            .collect();

        sqlx::query(
            "DELETE FROM deliveries WHERE claim_key IN (SELECT claim_key FROM claims WHERE listing_key = ?1)",
        )
        .bind(listing_key)
        .execute(&mut *sql_tx)
        .await?;

        sqlx::query("DELETE FROM claims WHERE listing_key = ?1")
            .bind(listing_key)
            .execute(&mut *sql_tx)
            .await?;

        sqlx::query("DELETE FROM food_listings WHERE listing_key = ?1")
            .bind(listing_key)
            .execute(&mut *sql_tx)
            .await?;

        sql_tx.commit().await?;

        info!(
            listing_key,
            donor_key,
            claims_invalidated = affected.len(),
            "Food listing removed"
        );

        Ok(affected)
    }

    /// Attaches a delivery to a live claim. A cancelled delivery on the claim is
    /// replaced; any other existing delivery makes the claim unavailable.
    pub async fn schedule_delivery(
        &self,
        claim_key: ClaimKey,
        deliverer_key: ActorKey,
        windows: &DeliveryWindows,
    ) -> Result<DeliveryKey, AppError> {
        windows.validate()?;

        let mut sql_tx = self.pool.begin().await?;

        let scheduled: Option<DeliveryKey> = sqlx::query_scalar(SCHEDULE_DELIVERY)
            .bind(claim_key)
            .bind(deliverer_key)
            .bind(windows.pickup.start)
            .bind(windows.pickup.end)
            .bind(windows.dropoff.start)
            .bind(windows.dropoff.end)
            .fetch_optional(&mut *sql_tx)
            .await?;

        let Some(delivery_key) = scheduled else {
            let claim_exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM claims WHERE claim_key = ?1")
                    .bind(claim_key)
                    .fetch_optional(&mut *sql_tx)
                    .await?;

            return Err(match claim_exists {
                Some(_) => AppError::NotClaimable(format!(
                    "claim {claim_key} already has a delivery scheduled"
                )),
                None => AppError::NotFound(format!("claim {claim_key}")),
            });
        };

        sql_tx.commit().await?;

        info!(claim_key, delivery_key, deliverer_key, "Delivery scheduled");

        Ok(delivery_key)
    }

    pub async fn advance_delivery(
        &self,
        delivery_key: DeliveryKey,
        deliverer_key: ActorKey,
        next: DeliveryState,
    ) -> Result<DeliveryState, AppError> {
        let predecessors: Vec<&str> = next
            .predecessors()
            .iter()
            .map(DeliveryState::as_str)
            .collect();

        if predecessors.is_empty() {
            return Err(AppError::Validation(format!(
                "a delivery cannot be moved to {next}"
            )));
        }

        let predecessors = serde_json::to_string(&predecessors)
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let mut sql_tx = self.pool.begin().await?;

        let advanced = sqlx::query(ADVANCE_DELIVERY)
            .bind(delivery_key)
            .bind(deliverer_key)
            .bind(next.as_str())
            .bind(predecessors)
            .execute(&mut *sql_tx)
            .await?
            .rows_affected();

        if advanced == 0 {
            let current: Option<(ActorKey, String)> = sqlx::query_as(
                "SELECT deliverer_key, state FROM deliveries WHERE delivery_key = ?1",
            )
            .bind(delivery_key)
            .fetch_optional(&mut *sql_tx)
            .await?;

            return Err(match current {
                None => AppError::NotFound(format!("delivery {delivery_key}")),
                Some((owner, _)) if owner != deliverer_key => AppError::Unauthorized(format!(
                    "delivery {delivery_key} belongs to another deliverer"
                )),
                Some((_, state)) => {
                    let current: DeliveryState = state.parse()?;
                    AppError::Validation(format!(
                        "a delivery cannot move from {current} to {next}"
                    ))
                }
            });
        }

        sql_tx.commit().await?;

        info!(delivery_key, deliverer_key, state = %next, "Delivery state updated");

        Ok(next)
    }

    pub async fn get_listings(&self, query: &ListingQuery) -> Result<Vec<FoodListing>, AppError> {
        #[cfg(feature = "verbose")]
        debug!(sql = %query.sql, args = ?query.args, "Executing listing search");

        let mut search = sqlx::query_as::<_, ListingRow>(&query.sql);
        for arg in &query.args {
            search = match arg {
                QueryArg::Int(value) => search.bind(*value),
                QueryArg::Bool(value) => search.bind(*value),
                QueryArg::Text(value) => search.bind(value.clone()),
                QueryArg::Date(value) => search.bind(*value),
            };
        }

        search
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(FoodListing::try_from)
            .collect()
    }

    pub async fn find_removal(
        &self,
        listing_key: ListingKey,
    ) -> Result<Option<ListingRemoval>, AppError> {
        let removal = sqlx::query_as(
            "SELECT removal_key, listing_key, donor_key, reason, claims_invalidated, removed_at \
             FROM listing_removals WHERE listing_key = ?1 ORDER BY removal_key DESC LIMIT 1",
        )
        .bind(listing_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(removal)
    }
}

async fn listing_donor(
    sql_tx: &mut Transaction<'_, Sqlite>,
    listing_key: ListingKey,
) -> Result<Option<ActorKey>, AppError> {
    let donor = sqlx::query_scalar("SELECT donor_key FROM food_listings WHERE listing_key = ?1")
        .bind(listing_key)
        .fetch_optional(&mut **sql_tx)
        .await?;

    Ok(donor)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        models::TimeWindow,
        query::{ListingFilters, ListingsStatus, Scoping, build_listing_query},
        test_utils::{count_rows, new_listing, setup_test_db},
    };

    fn windows() -> DeliveryWindows {
        let at = |hour| Utc.with_ymd_and_hms(2026, 10, 21, hour, 0, 0).unwrap();

        DeliveryWindows {
            pickup: TimeWindow {
                start: at(9),
                end: at(10),
            },
            dropoff: TimeWindow {
                start: at(11),
                end: at(12),
            },
        }
    }

    async fn store(policy: CapacityPolicy) -> ListingStore {
        ListingStore::new(setup_test_db().await, policy)
    }

    #[tokio::test]
    async fn test_add_listing_normalizes_food_types() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let mut listing = new_listing("Bagels", 1);
        listing.food_types = vec!["Baked_Goods".to_string(), "grain".to_string(), "GRAIN".to_string()];

        let listing_key = store.add_listing(1, &listing).await.unwrap();

        let query = build_listing_query(&ListingFilters::default(), Scoping::Everyone).unwrap();
        let listings = store.get_listings(&query).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].listing_key, listing_key);
        assert_eq!(listings[0].donor_key, 1);
        assert_eq!(listings[0].food_types, vec!["baked goods", "grain"]);
        assert_eq!(listings[0].state, ListingState::Open);
    }

    #[tokio::test]
    async fn test_add_listing_rejects_missing_attributes() {
        let store = store(CapacityPolicy::AllOrNothing).await;

        assert!(matches!(
            store.add_listing(1, &new_listing("   ", 1)).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            store.add_listing(1, &new_listing("Soup", 0)).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_all_or_nothing() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Apples", 5)).await.unwrap();

        store.claim_listing(listing_key, 2, Some(1)).await.unwrap();

        assert!(matches!(
            store.claim_listing(listing_key, 3, None).await,
            Err(AppError::NotClaimable(_))
        ));

        let claimed: i64 = sqlx::query_scalar("SELECT quantity FROM claims WHERE listing_key = ?1")
            .bind(listing_key)
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(claimed, 5);
    }

    #[tokio::test]
    async fn test_claim_per_unit_until_exhausted() {
        let store = store(CapacityPolicy::PerUnit).await;
        let listing_key = store.add_listing(1, &new_listing("Cans", 3)).await.unwrap();

        store.claim_listing(listing_key, 2, Some(2)).await.unwrap();

        assert!(matches!(
            store.claim_listing(listing_key, 3, Some(2)).await,
            Err(AppError::NotClaimable(_))
        ));

        store.claim_listing(listing_key, 3, None).await.unwrap();

        let query = build_listing_query(
            &ListingFilters {
                listings_status: ListingsStatus::All,
                ..ListingFilters::default()
            },
            Scoping::Everyone,
        )
        .unwrap();
        let listings = store.get_listings(&query).await.unwrap();
        assert_eq!(listings[0].claimed_units, 3);
        assert_eq!(listings[0].state, ListingState::FullyClaimed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_claims_for_last_unit() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("race.db").display());
        let store = ListingStore::new(
            crate::database::init_sqlite(&url).await.unwrap(),
            CapacityPolicy::PerUnit,
        );

        for round in 0..10 {
            let listing_key = store
                .add_listing(1, &new_listing("Last pie", 1))
                .await
                .unwrap();

            let (first, second) = tokio::join!(
                store.claim_listing(listing_key, 100 + round, None),
                store.claim_listing(listing_key, 200 + round, None),
            );

            let outcomes = [first, second];
            assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
            assert_eq!(
                outcomes
                    .iter()
                    .filter(|o| matches!(o, Err(AppError::NotClaimable(_))))
                    .count(),
                1
            );
            assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 1);
        }
    }

    #[tokio::test]
    async fn test_claim_missing_listing() {
        let store = store(CapacityPolicy::PerUnit).await;

        assert!(matches!(
            store.claim_listing(404, 2, None).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unclaim_without_delivery() {
        let store = store(CapacityPolicy::PerUnit).await;
        let listing_key = store.add_listing(1, &new_listing("Rice", 2)).await.unwrap();
        let claim_key = store.claim_listing(listing_key, 2, Some(2)).await.unwrap();

        let lost = store.unclaim_listing(claim_key, 2).await.unwrap();

        assert!(lost.is_empty());
        assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 0);
        store.claim_listing(listing_key, 3, Some(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unclaim_destroys_delivery() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Milk", 1)).await.unwrap();
        let claim_key = store.claim_listing(listing_key, 2, None).await.unwrap();
        let delivery_key = store
            .schedule_delivery(claim_key, 9, &windows())
            .await
            .unwrap();

        let lost = store.unclaim_listing(claim_key, 2).await.unwrap();

        assert_eq!(
            lost,
            vec![LostDelivery {
                delivery_key,
                deliverer_key: 9,
                claim_key,
                listing_key,
                food_description: "Milk".to_string(),
            }]
        );
        assert_eq!(count_rows(&store.pool, "deliveries", listing_key).await, 0);
        assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 0);
    }

    #[tokio::test]
    async fn test_unclaim_requires_owner() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Milk", 1)).await.unwrap();
        let claim_key = store.claim_listing(listing_key, 2, None).await.unwrap();

        assert!(matches!(
            store.unclaim_listing(claim_key, 3).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            store.unclaim_listing(claim_key + 100, 2).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 1);
    }

    #[tokio::test]
    async fn test_remove_listing_orders_and_cleans_up() {
        let store = store(CapacityPolicy::PerUnit).await;
        let listing_key = store.add_listing(1, &new_listing("Casserole", 3)).await.unwrap();

        let first = store.claim_listing(listing_key, 21, None).await.unwrap();
        let second = store.claim_listing(listing_key, 22, None).await.unwrap();
        let third = store.claim_listing(listing_key, 23, None).await.unwrap();
        let delivery_key = store.schedule_delivery(second, 31, &windows()).await.unwrap();

        let affected = store
            .remove_listing(listing_key, 1, "spoiled")
            .await
            .unwrap();

        let claims: Vec<ClaimKey> = affected.iter().map(|entry| entry.claim_key).collect();
        assert_eq!(claims, vec![first, second, third]);
        assert!(affected.iter().all(|entry| entry.reason == "spoiled"));
        assert_eq!(affected[0].lost_delivery, None);
        assert_eq!(
            affected[1].lost_delivery.as_ref().map(|d| (d.delivery_key, d.deliverer_key)),
            Some((delivery_key, 31))
        );

        assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 0);
        assert_eq!(count_rows(&store.pool, "deliveries", listing_key).await, 0);
        assert_eq!(count_rows(&store.pool, "food_listings", listing_key).await, 0);

        let removal = store.find_removal(listing_key).await.unwrap().unwrap();
        assert_eq!(removal.donor_key, 1);
        assert_eq!(removal.reason, "spoiled");
        assert_eq!(removal.claims_invalidated, 3);
    }

    #[tokio::test]
    async fn test_remove_listing_requires_owner() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Pears", 1)).await.unwrap();
        store.claim_listing(listing_key, 2, None).await.unwrap();

        assert!(matches!(
            store.remove_listing(listing_key, 5, "mine now").await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            store.remove_listing(listing_key + 1, 1, "gone").await,
            Err(AppError::NotFound(_))
        ));

        assert_eq!(count_rows(&store.pool, "food_listings", listing_key).await, 1);
        assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 1);
        assert!(store.find_removal(listing_key).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_remove_and_unclaim() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("remove_race.db").display());
        let store = ListingStore::new(
            crate::database::init_sqlite(&url).await.unwrap(),
            CapacityPolicy::AllOrNothing,
        );

        for round in 0..10 {
            let receiver = 100 + round;
            let listing_key = store.add_listing(1, &new_listing("Soup", 1)).await.unwrap();
            let claim_key = store.claim_listing(listing_key, receiver, None).await.unwrap();

            let (removed, unclaimed) = tokio::join!(
                store.remove_listing(listing_key, 1, "closing"),
                store.unclaim_listing(claim_key, receiver),
            );

            let affected = removed.unwrap();
            let reported_by_removal = affected.iter().any(|entry| entry.claim_key == claim_key);
            match unclaimed {
                Ok(lost) => {
                    assert!(lost.is_empty());
                    assert!(!reported_by_removal);
                }
                Err(AppError::NotFound(_)) => assert!(reported_by_removal),
                Err(e) => panic!("unexpected unclaim error: {e}"),
            }

            assert_eq!(count_rows(&store.pool, "food_listings", listing_key).await, 0);
            assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 0);
        }
    }

    #[tokio::test]
    async fn test_failed_removal_changes_nothing() {
        let store = store(CapacityPolicy::PerUnit).await;
        let listing_key = store.add_listing(1, &new_listing("Stew", 3)).await.unwrap();
        let claim_key = store.claim_listing(listing_key, 21, Some(2)).await.unwrap();
        store.schedule_delivery(claim_key, 31, &windows()).await.unwrap();

        // Fails the last statement of the removal, after claims and deliveries
        // were already deleted inside the transaction.
        sqlx::query(
            "CREATE TRIGGER block_listing_delete BEFORE DELETE ON food_listings \
             BEGIN SELECT RAISE(ABORT, 'listing delete blocked'); END",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        assert!(matches!(
            store.remove_listing(listing_key, 1, "closing").await,
            Err(AppError::Persistence(_))
        ));

        assert_eq!(count_rows(&store.pool, "food_listings", listing_key).await, 1);
        assert_eq!(count_rows(&store.pool, "claims", listing_key).await, 1);
        assert_eq!(count_rows(&store.pool, "deliveries", listing_key).await, 1);
        assert!(store.find_removal(listing_key).await.unwrap().is_none());

        let query = build_listing_query(
            &ListingFilters {
                listings_status: ListingsStatus::All,
                ..ListingFilters::default()
            },
            Scoping::Everyone,
        )
        .unwrap();
        let listings = store.get_listings(&query).await.unwrap();
        assert_eq!(listings[0].claimed_units, 2);
        assert_eq!(listings[0].state, ListingState::PartiallyClaimed);
    }

    #[tokio::test]
    async fn test_remove_unclaimed_listing() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Pears", 1)).await.unwrap();

        let affected = store.remove_listing(listing_key, 1, "eaten").await.unwrap();

        assert!(affected.is_empty());
        assert_eq!(count_rows(&store.pool, "food_listings", listing_key).await, 0);
    }

    #[tokio::test]
    async fn test_schedule_delivery_conflicts() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Juice", 1)).await.unwrap();
        let claim_key = store.claim_listing(listing_key, 2, None).await.unwrap();

        let delivery_key = store.schedule_delivery(claim_key, 9, &windows()).await.unwrap();

        assert!(matches!(
            store.schedule_delivery(claim_key, 10, &windows()).await,
            Err(AppError::NotClaimable(_))
        ));
        assert!(matches!(
            store.schedule_delivery(claim_key + 1, 10, &windows()).await,
            Err(AppError::NotFound(_))
        ));

        store
            .advance_delivery(delivery_key, 9, DeliveryState::Cancelled)
            .await
            .unwrap();

        let rescheduled = store.schedule_delivery(claim_key, 10, &windows()).await.unwrap();
        assert_eq!(rescheduled, delivery_key);
    }

    #[tokio::test]
    async fn test_advance_delivery() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Juice", 1)).await.unwrap();
        let claim_key = store.claim_listing(listing_key, 2, None).await.unwrap();
        let delivery_key = store.schedule_delivery(claim_key, 9, &windows()).await.unwrap();

        assert!(matches!(
            store.advance_delivery(delivery_key, 9, DeliveryState::Completed).await,
            Err(AppError::Validation(message)) if message == "a delivery cannot move from scheduled to completed"
        ));
        assert!(matches!(
            store.advance_delivery(delivery_key, 8, DeliveryState::InTransit).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            store.advance_delivery(delivery_key, 9, DeliveryState::Scheduled).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            store.advance_delivery(delivery_key + 1, 9, DeliveryState::InTransit).await,
            Err(AppError::NotFound(_))
        ));

        assert_eq!(
            store
                .advance_delivery(delivery_key, 9, DeliveryState::InTransit)
                .await
                .unwrap(),
            DeliveryState::InTransit
        );
        assert_eq!(
            store
                .advance_delivery(delivery_key, 9, DeliveryState::Completed)
                .await
                .unwrap(),
            DeliveryState::Completed
        );
    }

    #[tokio::test]
    async fn test_finished_delivery_is_not_reported_lost() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        let listing_key = store.add_listing(1, &new_listing("Juice", 1)).await.unwrap();
        let claim_key = store.claim_listing(listing_key, 2, None).await.unwrap();
        let delivery_key = store.schedule_delivery(claim_key, 9, &windows()).await.unwrap();
        store
            .advance_delivery(delivery_key, 9, DeliveryState::Cancelled)
            .await
            .unwrap();

        let affected = store.remove_listing(listing_key, 1, "gone").await.unwrap();

        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0].lost_delivery, None);
        assert_eq!(count_rows(&store.pool, "deliveries", listing_key).await, 0);
    }

    #[tokio::test]
    async fn test_search_filters() {
        let store = store(CapacityPolicy::AllOrNothing).await;

        let mut bread = new_listing("Bread", 1);
        bread.food_types = vec!["grain".to_string()];
        bread.perishable = true;
        bread.expiration_date = NaiveDate::from_ymd_opt(2026, 10, 22).unwrap();
        let bread = store.add_listing(1, &bread).await.unwrap();

        let mut beans = new_listing("Beans", 1);
        beans.food_types = vec!["canned goods".to_string()];
        beans.perishable = false;
        beans.expiration_date = NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        let beans = store.add_listing(2, &beans).await.unwrap();

        let search = |filters: ListingFilters, scoping: Scoping| {
            let store = store.clone();
            async move {
                let query = build_listing_query(&filters, scoping).unwrap();
                store
                    .get_listings(&query)
                    .await
                    .unwrap()
                    .into_iter()
                    .map(|listing| listing.listing_key)
                    .collect::<Vec<_>>()
            }
        };

        assert_eq!(
            search(ListingFilters::default(), Scoping::Everyone).await,
            vec![bread, beans]
        );
        assert_eq!(
            search(
                ListingFilters {
                    food_types: vec!["Canned Goods".to_string()],
                    ..ListingFilters::default()
                },
                Scoping::Everyone
            )
            .await,
            vec![beans]
        );
        assert_eq!(
            search(
                ListingFilters {
                    not_perishable: true,
                    ..ListingFilters::default()
                },
                Scoping::Everyone
            )
            .await,
            vec![beans]
        );
        assert_eq!(
            search(
                ListingFilters {
                    perishable: true,
                    not_perishable: true,
                    ..ListingFilters::default()
                },
                Scoping::Everyone
            )
            .await,
            vec![bread, beans]
        );
        assert_eq!(
            search(
                ListingFilters {
                    earliest_expire_date: Some(crate::query::DateParts {
                        year: 2026,
                        month: 12,
                        day: 1,
                    }),
                    ..ListingFilters::default()
                },
                Scoping::Everyone
            )
            .await,
            vec![beans]
        );
        assert_eq!(
            search(ListingFilters::default(), Scoping::DonatedBy(1)).await,
            vec![bread]
        );

        store.claim_listing(bread, 7, None).await.unwrap();

        assert_eq!(
            search(ListingFilters::default(), Scoping::Everyone).await,
            vec![beans]
        );
        let all = ListingFilters {
            listings_status: ListingsStatus::All,
            ..ListingFilters::default()
        };
        assert_eq!(search(all.clone(), Scoping::ClaimedBy(7)).await, vec![bread]);
        assert_eq!(search(all.clone(), Scoping::AwaitingDelivery).await, vec![bread]);
        assert_eq!(
            search(
                ListingFilters {
                    retrieval_offset: 1,
                    ..all
                },
                Scoping::Everyone
            )
            .await,
            vec![beans]
        );
    }

    #[tokio::test]
    async fn test_repeated_search_is_identical() {
        let store = store(CapacityPolicy::AllOrNothing).await;
        for description in ["Soup", "Stew", "Chili", "Broth"] {
            store.add_listing(1, &new_listing(description, 1)).await.unwrap();
        }

        let query = build_listing_query(&ListingFilters::default(), Scoping::Everyone).unwrap();

        let first = store.get_listings(&query).await.unwrap();
        let second = store.get_listings(&query).await.unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }
}
