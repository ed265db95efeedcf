use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::AppError, session::ActorKey};

pub type ListingKey = i64;
pub type ClaimKey = i64;
pub type DeliveryKey = i64;

/// Food type domain values offered to the UI.
pub const FOOD_TYPES: [&str; 8] = [
    "baked goods",
    "canned goods",
    "dairy",
    "drink",
    "frozen",
    "grain",
    "meat",
    "produce",
];

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewListing {
    #[serde(default)]
    pub food_types: Vec<String>,
    pub perishable: bool,
    pub food_description: String,
    pub expiration_date: NaiveDate,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingState {
    Open,
    PartiallyClaimed,
    FullyClaimed,
}

impl ListingState {
    pub fn derive(quantity: i64, claimed_units: i64) -> Self {
        match claimed_units {
            0 => ListingState::Open,
            units if units < quantity => ListingState::PartiallyClaimed,
            _ => ListingState::FullyClaimed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodListing {
    pub listing_key: ListingKey,
    pub donor_key: ActorKey,
    pub food_types: Vec<String>,
    pub perishable: bool,
    pub food_description: String,
    pub expiration_date: NaiveDate,
    pub image_url: Option<String>,
    pub quantity: i64,
    pub claimed_units: i64,
    pub state: ListingState,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Scheduled,
    InTransit,
    Completed,
    Cancelled,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Scheduled => "scheduled",
            DeliveryState::InTransit => "in_transit",
            DeliveryState::Completed => "completed",
            DeliveryState::Cancelled => "cancelled",
        }
    }

    /// States a delivery may move into `self` from. Empty when `self` cannot be
    /// reached by a deliverer's update.
    pub fn predecessors(&self) -> &'static [DeliveryState] {
        match self {
            DeliveryState::Scheduled => &[],
            DeliveryState::InTransit => &[DeliveryState::Scheduled],
            DeliveryState::Completed => &[DeliveryState::InTransit],
            DeliveryState::Cancelled => &[DeliveryState::Scheduled, DeliveryState::InTransit],
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(DeliveryState::Scheduled),
            "in_transit" => Ok(DeliveryState::InTransit),
            "completed" => Ok(DeliveryState::Completed),
            "cancelled" => Ok(DeliveryState::Cancelled),
            other => Err(AppError::Validation(format!("unknown delivery state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DeliveryWindows {
    pub pickup: TimeWindow,
    pub dropoff: TimeWindow,
}

impl DeliveryWindows {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.pickup.end < self.pickup.start || self.dropoff.end < self.dropoff.start {
            return Err(AppError::Validation(
                "a delivery window cannot end before it starts".to_string(),
            ));
        }

        if self.dropoff.end < self.pickup.start {
            return Err(AppError::Validation(
                "drop-off cannot end before pick-up starts".to_string(),
            ));
        }

        Ok(())
    }
}

/// A delivery destroyed together with its claim.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LostDelivery {
    pub delivery_key: DeliveryKey,
    pub deliverer_key: ActorKey,
    pub claim_key: ClaimKey,
    pub listing_key: ListingKey,
    pub food_description: String,
}

/// One invalidated claim of a removed listing. Lives only for the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclaimNotificationData {
    pub claim_key: ClaimKey,
    pub listing_key: ListingKey,
    pub receiver_key: ActorKey,
    pub food_description: String,
    pub reason: String,
    pub lost_delivery: Option<LostDelivery>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ListingRemoval {
    pub removal_key: i64,
    pub listing_key: ListingKey,
    pub donor_key: ActorKey,
    pub reason: String,
    pub claims_invalidated: i64,
    pub removed_at: NaiveDateTime,
}
