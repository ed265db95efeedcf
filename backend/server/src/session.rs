//! # Session
//!
//! Authentication happens upstream. By the time a request reaches us the auth
//! layer has verified the user and forwarded two headers:
//!
//! - `x-actor-key`: numeric app user key
//! - `x-actor-role`: `donor`, `receiver` or `deliverer`
//!
//! Handlers turn them into an [`Actor`] and pass it into every lifecycle call.
//! Nothing here is stored between requests.
use std::{fmt, str::FromStr};

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AppError;

pub const ACTOR_KEY_HEADER: &str = "x-actor-key";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

pub type ActorKey = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Donor,
    Receiver,
    Deliverer,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Donor => "donor",
            ActorRole::Receiver => "receiver",
            ActorRole::Deliverer => "deliverer",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "donor" => Ok(ActorRole::Donor),
            "receiver" => Ok(ActorRole::Receiver),
            "deliverer" => Ok(ActorRole::Deliverer),
            other => Err(AppError::Validation(format!("unknown actor role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub key: ActorKey,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(key: ActorKey, role: ActorRole) -> Self {
        Self { key, role }
    }

    /// `Ok(None)` when the request carries no session at all. A session with
    /// only one of its two headers is rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>, AppError> {
        let (key, role) = match (
            headers.get(ACTOR_KEY_HEADER),
            headers.get(ACTOR_ROLE_HEADER),
        ) {
            (Some(key), Some(role)) => (key, role),
            (None, None) => return Ok(None),
            (key, role) => {
                warn!(
                    has_key = key.is_some(),
                    has_role = role.is_some(),
                    "Rejecting request with a partial session"
                );
                return Err(AppError::LoginRequired);
            }
        };

        let key = key
            .to_str()
            .ok()
            .and_then(|k| k.trim().parse::<ActorKey>().ok())
            .ok_or(AppError::LoginRequired)?;

        let role = role
            .to_str()
            .map_err(|_| AppError::LoginRequired)?
            .parse::<ActorRole>()?;

        Ok(Some(Self { key, role }))
    }

    pub fn require_role(&self, role: ActorRole) -> Result<(), AppError> {
        if self.role != role {
            return Err(AppError::Unauthorized(format!(
                "a {} cannot act as a {role}",
                self.role
            )));
        }

        Ok(())
    }
}
