//! LISTEN/NOTIFY subscription

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tracing::{instrument, trace, warn};

use conveyor_core::{Notification, Topic};

use crate::error::StoreError;
use crate::store::{NotificationHub, Subscription};

use super::PgEngineStore;

/// A `PgListener` bound to a fixed set of channels
pub struct PgSubscription {
    listener: PgListener,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn recv(&mut self) -> Result<Notification, StoreError> {
        loop {
            let event = self
                .listener
                .recv()
                .await
                .map_err(|e| StoreError::Subscription(e.to_string()))?;
            trace!(channel = event.channel(), payload = event.payload(), "received notification");

            match Topic::parse_channel(event.channel()) {
                Some(topic) => return Ok(Notification::new(topic, event.payload())),
                None => {
                    warn!(channel = event.channel(), "notification on unknown channel");
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl NotificationHub for PgEngineStore {
    #[instrument(skip(self))]
    async fn subscribe(&self, topics: &[Topic]) -> Result<Box<dyn Subscription>, StoreError> {
        let mut listener = PgListener::connect(self.database_url())
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;

        let channels: Vec<String> = topics.iter().map(Topic::channel).collect();
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await
            .map_err(|e| StoreError::Subscription(e.to_string()))?;

        Ok(Box::new(PgSubscription { listener }))
    }
}
