//! # Notifications
//!
//! Outbound notices for users whose claim or delivery disappeared.
//!
//! ## Channels
//! - [`WebhookChannel`]: POSTs the JSON [`Notice`] to the mailer service, optional bearer token
//! - [`LogChannel`]: writes the notice to the log, used when no webhook is configured
//!
//! ## Dispatcher
//! - One call per notice, bounded by a timeout; a timeout is an ordinary failure
//! - Never retries, retrying belongs to the cascade
//! - Never returns an error, failures come back as [`DispatchOutcome::Failed`]
//!   and are logged at warn level
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    models::{ClaimKey, ListingKey, LostDelivery, UnclaimNotificationData},
    session::{ActorKey, ActorRole},
};

#[derive(Error, Debug)]
pub enum NotificationFailure {
    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),

    #[error("Notification transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Notification rejected with status {0}")]
    Rejected(u16),

    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("Notification abandoned at shutdown")]
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    ClaimRemoved,
    DeliveryCancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub recipient_key: ActorKey,
    pub recipient_role: ActorRole,
    pub kind: NoticeKind,
    pub listing_key: ListingKey,
    pub claim_key: ClaimKey,
    pub food_description: String,
    pub reason: Option<String>,
    pub initiated_by: ActorRole,
}

impl Notice {
    pub fn claim_removed(data: &UnclaimNotificationData) -> Self {
        Self {
            recipient_key: data.receiver_key,
            recipient_role: ActorRole::Receiver,
            kind: NoticeKind::ClaimRemoved,
            listing_key: data.listing_key,
            claim_key: data.claim_key,
            food_description: data.food_description.clone(),
            reason: Some(data.reason.clone()),
            initiated_by: ActorRole::Donor,
        }
    }

    pub fn delivery_cancelled(
        initiated_by: ActorRole,
        delivery: &LostDelivery,
        reason: Option<&str>,
    ) -> Self {
        Self {
            recipient_key: delivery.deliverer_key,
            recipient_role: ActorRole::Deliverer,
            kind: NoticeKind::DeliveryCancelled,
            listing_key: delivery.listing_key,
            claim_key: delivery.claim_key,
            food_description: delivery.food_description.clone(),
            reason: reason.map(str::to_string),
            initiated_by,
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotificationFailure>;
}

pub struct WebhookChannel {
    client: Client,
    url: String,
    token: Option<String>,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotificationFailure> {
        let mut request = self.client.post(&self.url).json(notice);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            return Err(NotificationFailure::Rejected(status.as_u16()));
        }

        Ok(())
    }
}

pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn deliver(&self, notice: &Notice) -> Result<(), NotificationFailure> {
        info!(
            recipient_key = notice.recipient_key,
            recipient_role = %notice.recipient_role,
            kind = ?notice.kind,
            listing_key = notice.listing_key,
            claim_key = notice.claim_key,
            "Notice: {}",
            notice.food_description
        );

        Ok(())
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Delivered,
    Failed(NotificationFailure),
}

impl DispatchOutcome {
    pub fn into_result(self) -> Result<(), NotificationFailure> {
        match self {
            DispatchOutcome::Delivered => Ok(()),
            DispatchOutcome::Failed(failure) => Err(failure),
        }
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    channel: Arc<dyn NotificationChannel>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(channel: Arc<dyn NotificationChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub async fn notify_receiver_of_unclaim(
        &self,
        data: &UnclaimNotificationData,
    ) -> DispatchOutcome {
        self.dispatch(&Notice::claim_removed(data)).await
    }

    pub async fn notify_deliverer_of_lost_delivery(
        &self,
        initiated_by: ActorRole,
        delivery: &LostDelivery,
        reason: Option<&str>,
    ) -> DispatchOutcome {
        self.dispatch(&Notice::delivery_cancelled(initiated_by, delivery, reason))
            .await
    }

    async fn dispatch(&self, notice: &Notice) -> DispatchOutcome {
        let failure = match timeout(self.timeout, self.channel.deliver(notice)).await {
            Ok(Ok(())) => {
                debug!(
                    recipient_key = notice.recipient_key,
                    kind = ?notice.kind,
                    "Notice delivered"
                );
                return DispatchOutcome::Delivered;
            }
            Ok(Err(failure)) => failure,
            Err(_) => NotificationFailure::Timeout(self.timeout),
        };

        warn!(
            recipient_key = notice.recipient_key,
            recipient_role = %notice.recipient_role,
            kind = ?notice.kind,
            listing_key = notice.listing_key,
            claim_key = notice.claim_key,
            "Failed to deliver notice: {failure}"
        );

        DispatchOutcome::Failed(failure)
    }
}
