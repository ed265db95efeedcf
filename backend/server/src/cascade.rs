//! # Cascade
//!
//! Fans one committed transition out into notices for everyone it affected.
//!
//! ## Order
//! - Entries are walked one at a time, in the order the store returned them
//!   (oldest claim first for removals)
//! - Per entry: the receiver is notified first; once that settles, the deliverer
//!   of a lost delivery is notified; only then does the next entry start
//! - Retries of a notice finish before the walk moves on, so a flaky channel
//!   delays the remaining entries but never reorders them
//!
//! ## Failures
//! A notice that still fails after its last attempt is recorded in the
//! [`CascadeReport`] and logged with the keys needed to re-send it by hand.
//! The store mutation that triggered the cascade is already committed and is
//! never rolled back.
//!
//! Once spawned, a cascade runs to completion even if the request that started
//! it goes away.
//!
//! ## Shutdown
//! [`CascadeCoordinator::drain`] waits for every spawned cascade. Cascades still
//! running when the grace period ends stop before their next notice; each notice
//! they did not send is recorded and logged like any other failure.
use std::{sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use tokio::{task::JoinHandle, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    models::{LostDelivery, UnclaimNotificationData},
    notify::{DispatchOutcome, Notice, NotificationDispatcher, NotificationFailure},
    session::ActorRole,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

#[derive(Debug)]
pub struct FailedNotice {
    pub notice: Notice,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct CascadeReport {
    pub receivers_notified: usize,
    pub deliverers_notified: usize,
    pub failures: Vec<FailedNotice>,
    /// The task ended without finishing its walk.
    pub aborted: bool,
}

impl CascadeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.aborted
    }

    fn record(&mut self, notice: Notice, result: Result<(), NotificationFailure>) {
        match result {
            Ok(()) => match notice.recipient_role {
                ActorRole::Deliverer => self.deliverers_notified += 1,
                _ => self.receivers_notified += 1,
            },
            Err(failure) => {
                warn!(
                    recipient_key = notice.recipient_key,
                    recipient_role = %notice.recipient_role,
                    kind = ?notice.kind,
                    listing_key = notice.listing_key,
                    claim_key = notice.claim_key,
                    "Giving up on notice, re-send manually: {failure}"
                );

                self.failures.push(FailedNotice {
                    notice,
                    error: failure.to_string(),
                });
            }
        }
    }
}

/// A cascade running on its own task.
pub struct CascadeHandle {
    affected: usize,
    task: JoinHandle<CascadeReport>,
}

impl CascadeHandle {
    /// Number of claims or deliveries the transition invalidated.
    pub fn affected(&self) -> usize {
        self.affected
    }

    pub async fn settled(self) -> CascadeReport {
        self.task.await.unwrap_or_else(|e| {
            error!(
                affected = self.affected,
                "Cascade task ended abnormally, its notices may not have been sent: {e}"
            );
            CascadeReport {
                aborted: true,
                ..CascadeReport::default()
            }
        })
    }
}

pub struct CascadeCoordinator {
    dispatcher: NotificationDispatcher,
    retry: RetryPolicy,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl CascadeCoordinator {
    pub fn new(dispatcher: NotificationDispatcher, retry: RetryPolicy) -> Self {
        Self {
            dispatcher,
            retry,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn spawn_removal(self: &Arc<Self>, affected: Vec<UnclaimNotificationData>) -> CascadeHandle {
        let coordinator = self.clone();
        let count = affected.len();

        CascadeHandle {
            affected: count,
            task: self
                .tracker
                .spawn(async move { coordinator.notify_removal(&affected).await }),
        }
    }

    pub fn spawn_unclaim(self: &Arc<Self>, lost: Vec<LostDelivery>) -> CascadeHandle {
        let coordinator = self.clone();
        let count = lost.len();

        CascadeHandle {
            affected: count,
            task: self
                .tracker
                .spawn(async move { coordinator.notify_unclaim(&lost).await }),
        }
    }

    /// Donor removed a listing: every claim holder, then their deliverer.
    pub async fn notify_removal(&self, affected: &[UnclaimNotificationData]) -> CascadeReport {
        let mut report = CascadeReport::default();

        for entry in affected {
            let result = self
                .settle(|| self.dispatcher.notify_receiver_of_unclaim(entry))
                .await;
            report.record(Notice::claim_removed(entry), result);

            if let Some(delivery) = &entry.lost_delivery {
                let reason = Some(entry.reason.as_str());
                let result = self
                    .settle(|| {
                        self.dispatcher.notify_deliverer_of_lost_delivery(
                            ActorRole::Donor,
                            delivery,
                            reason,
                        )
                    })
                    .await;
                report.record(
                    Notice::delivery_cancelled(ActorRole::Donor, delivery, reason),
                    result,
                );
            }
        }

        info!(
            entries = affected.len(),
            receivers_notified = report.receivers_notified,
            deliverers_notified = report.deliverers_notified,
            failures = report.failures.len(),
            "Removal cascade finished"
        );

        report
    }

    /// Receiver gave up a claim: only the deliverer of its delivery is told.
    pub async fn notify_unclaim(&self, lost: &[LostDelivery]) -> CascadeReport {
        let mut report = CascadeReport::default();

        for delivery in lost {
            let result = self
                .settle(|| {
                    self.dispatcher.notify_deliverer_of_lost_delivery(
                        ActorRole::Receiver,
                        delivery,
                        None,
                    )
                })
                .await;
            report.record(
                Notice::delivery_cancelled(ActorRole::Receiver, delivery, None),
                result,
            );
        }

        report
    }

    /// Waits up to `grace` for every spawned cascade, then stops the rest.
    /// Returns once no cascade task is left.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();

        if timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                running = self.tracker.len(),
                "Cascades still running after {grace:?}, abandoning their remaining notices"
            );
            self.shutdown.cancel();
            self.tracker.wait().await;
        }

        info!("All cascades settled");
    }

    async fn settle<F, Fut>(&self, mut attempt: F) -> Result<(), NotificationFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DispatchOutcome>,
    {
        let retried = (|| {
            let outcome = attempt();
            async move { outcome.await.into_result() }
        })
        .retry(self.retry.backoff())
        .notify(|failure, delay| debug!("Retrying notice in {delay:?}: {failure}"));

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(NotificationFailure::Abandoned),
            result = retried => result,
        }
    }
}
