use std::sync::Arc;

use tracing::info;

use super::{
    cascade::{CascadeCoordinator, RetryPolicy},
    config::Config,
    database::init_sqlite,
    lifecycle::Lifecycle,
    notify::{LogChannel, NotificationChannel, NotificationDispatcher, WebhookChannel},
    store::ListingStore,
};

pub struct State {
    pub config: Config,
    pub lifecycle: Lifecycle,
}

impl State {
    pub async fn new() -> anyhow::Result<Arc<Self>> {
        let config = Config::load()?;

        let pool = init_sqlite(&config.database_url).await?;
        let store = ListingStore::new(pool, config.capacity_policy);
        info!("Claim capacity policy: {}", config.capacity_policy);

        let channel: Arc<dyn NotificationChannel> = match &config.notify_webhook_url {
            Some(url) => {
                info!("Sending notices to webhook {url}");
                Arc::new(WebhookChannel::new(
                    url.clone(),
                    config.notify_webhook_token.clone(),
                ))
            }
            None => {
                info!("NOTIFY_WEBHOOK_URL not set, writing notices to the log");
                Arc::new(LogChannel)
            }
        };

        let dispatcher = NotificationDispatcher::new(channel, config.notify_timeout);
        let coordinator = CascadeCoordinator::new(
            dispatcher,
            RetryPolicy {
                max_attempts: config.notify_max_attempts,
                ..RetryPolicy::default()
            },
        );

        let lifecycle = Lifecycle::new(store, Arc::new(coordinator));

        Ok(Arc::new(Self::from_parts(config, lifecycle)))
    }

    pub fn from_parts(config: Config, lifecycle: Lifecycle) -> Self {
        Self { config, lifecycle }
    }
}
