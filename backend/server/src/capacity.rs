//! # Claim Capacity
//!
//! How much of a listing a single claim takes.
//!
//! - `all_or_nothing`: the first claim takes the whole listing, any requested
//!   quantity is ignored
//! - `per_unit`: each claim reserves `quantity` units (1 when omitted) until the
//!   listing's units run out
//!
//! Both policies are enforced by one conditional `UPDATE`, so two claims racing
//! for the last unit can never both pass.
use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    #[default]
    AllOrNothing,
    PerUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Whole,
    Units(i64),
}

const RESERVE_WHOLE: &str = "
    UPDATE food_listings
    SET claimed_units = quantity
    WHERE listing_key = ?1 AND claimed_units = 0
    RETURNING quantity
";

const RESERVE_UNITS: &str = "
    UPDATE food_listings
    SET claimed_units = claimed_units + ?2
    WHERE listing_key = ?1 AND claimed_units + ?2 <= quantity
    RETURNING ?2
";

impl CapacityPolicy {
    pub fn reservation(&self, requested: Option<u32>) -> Result<Reservation, AppError> {
        match self {
            CapacityPolicy::AllOrNothing => Ok(Reservation::Whole),
            CapacityPolicy::PerUnit => match requested.unwrap_or(1) {
                0 => Err(AppError::Validation(
                    "claim quantity must be at least 1".to_string(),
                )),
                units => Ok(Reservation::Units(i64::from(units))),
            },
        }
    }
}

impl Reservation {
    /// Conditional update returning the reserved units, or no row when the
    /// listing is missing or lacks capacity. Binds: `?1` listing key, `?2` units.
    pub fn sql(&self) -> &'static str {
        match self {
            Reservation::Whole => RESERVE_WHOLE,
            Reservation::Units(_) => RESERVE_UNITS,
        }
    }

    pub fn units(&self) -> Option<i64> {
        match self {
            Reservation::Whole => None,
            Reservation::Units(units) => Some(*units),
        }
    }
}

impl fmt::Display for CapacityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityPolicy::AllOrNothing => f.write_str("all_or_nothing"),
            CapacityPolicy::PerUnit => f.write_str("per_unit"),
        }
    }
}

impl FromStr for CapacityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all_or_nothing" => Ok(CapacityPolicy::AllOrNothing),
            "per_unit" => Ok(CapacityPolicy::PerUnit),
            other => Err(format!(
                "expected 'all_or_nothing' or 'per_unit', got '{other}'"
            )),
        }
    }
}
