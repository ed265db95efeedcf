use std::sync::Arc;

use axum::{
    Json,
    extract::{State as AxumState, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    envelope::Envelope,
    error::AppError,
    models::{
        ClaimKey, DeliveryKey, DeliveryState, DeliveryWindows, FOOD_TYPES, FoodListing, ListingKey,
        NewListing, TimeWindow,
    },
    query::ListingFilters,
    session::Actor,
    state::State,
};

type Handled<T> = Result<Envelope<T>, AppError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(payload)| payload)
        .map_err(|e| AppError::Validation(e.body_text()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveListingRequest {
    listing_key: ListingKey,
    reason: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimListingRequest {
    listing_key: ListingKey,
    #[serde(default)]
    quantity: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnclaimListingRequest {
    claim_key: ClaimKey,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct GetListingsRequest {
    filters: ListingFilters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDeliveryRequest {
    claim_key: ClaimKey,
    pickup: TimeWindow,
    dropoff: TimeWindow,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeliveryStateRequest {
    delivery_key: DeliveryKey,
    state: DeliveryState,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingAdded {
    listing_key: ListingKey,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRemoved {
    claims_invalidated: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingClaimed {
    claim_key: ClaimKey,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingUnclaimed {
    deliveries_cancelled: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryScheduled {
    delivery_key: DeliveryKey,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdated {
    state: DeliveryState,
}

pub async fn add_listing_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    payload: Result<Json<NewListing>, JsonRejection>,
) -> Handled<ListingAdded> {
    let actor = Actor::from_headers(&headers)?;
    let listing = body(payload)?;

    let listing_key = state
        .lifecycle
        .add_listing(actor.as_ref(), &listing)
        .await?;

    Ok(Envelope::success(
        "Food listing added",
        ListingAdded { listing_key },
    ))
}

pub async fn remove_listing_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    payload: Result<Json<RemoveListingRequest>, JsonRejection>,
) -> Handled<ListingRemoved> {
    let actor = Actor::from_headers(&headers)?;
    let request = body(payload)?;

    let cascade = state
        .lifecycle
        .remove_listing(actor.as_ref(), request.listing_key, &request.reason)
        .await?;

    Ok(Envelope::success(
        "Food listing removed",
        ListingRemoved {
            claims_invalidated: cascade.affected(),
        },
    ))
}

pub async fn claim_listing_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    payload: Result<Json<ClaimListingRequest>, JsonRejection>,
) -> Handled<ListingClaimed> {
    let actor = Actor::from_headers(&headers)?;
    let request = body(payload)?;

    let claim_key = state
        .lifecycle
        .claim_listing(actor.as_ref(), request.listing_key, request.quantity)
        .await?;

    Ok(Envelope::success(
        "Food listing claimed",
        ListingClaimed { claim_key },
    ))
}

pub async fn unclaim_listing_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    payload: Result<Json<UnclaimListingRequest>, JsonRejection>,
) -> Handled<ListingUnclaimed> {
    let actor = Actor::from_headers(&headers)?;
    let request = body(payload)?;

    let cascade = state
        .lifecycle
        .unclaim_listing(actor.as_ref(), request.claim_key)
        .await?;

    Ok(Envelope::success(
        "Food listing unclaimed",
        ListingUnclaimed {
            deliveries_cancelled: cascade.affected(),
        },
    ))
}

/// Responds with a bare list of listings, empty when the search itself fails.
pub async fn get_listings_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    payload: Result<Json<GetListingsRequest>, JsonRejection>,
) -> Result<Json<Vec<FoodListing>>, AppError> {
    let actor = Actor::from_headers(&headers)?;
    let request = body(payload)?;

    let listings = state
        .lifecycle
        .get_listings(actor.as_ref(), &request.filters)
        .await?;

    Ok(Json(listings))
}

pub async fn schedule_delivery_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    payload: Result<Json<ScheduleDeliveryRequest>, JsonRejection>,
) -> Handled<DeliveryScheduled> {
    let actor = Actor::from_headers(&headers)?;
    let request = body(payload)?;

    let windows = DeliveryWindows {
        pickup: request.pickup,
        dropoff: request.dropoff,
    };

    let delivery_key = state
        .lifecycle
        .schedule_delivery(actor.as_ref(), request.claim_key, &windows)
        .await?;

    Ok(Envelope::success(
        "Delivery scheduled",
        DeliveryScheduled { delivery_key },
    ))
}

pub async fn update_delivery_state_handler(
    AxumState(state): AxumState<Arc<State>>,
    headers: HeaderMap,
    payload: Result<Json<UpdateDeliveryStateRequest>, JsonRejection>,
) -> Handled<DeliveryUpdated> {
    let actor = Actor::from_headers(&headers)?;
    let request = body(payload)?;

    let state = state
        .lifecycle
        .advance_delivery(actor.as_ref(), request.delivery_key, request.state)
        .await?;

    Ok(Envelope::success(
        "Delivery state updated",
        DeliveryUpdated { state },
    ))
}

pub async fn food_types_handler() -> impl IntoResponse {
    Json(FOOD_TYPES)
}

pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
