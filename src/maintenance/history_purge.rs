use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::db::OrderBookStore;
use crate::error::Result;

/// Background task that keeps price history inside the retention window.
pub struct HistoryPurger {
    store: OrderBookStore,
    retention_days: i64,
    every: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HistoryPurger {
    pub fn new(store: OrderBookStore, retention_days: i64, every: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            store,
            retention_days,
            every,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.every);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.purge_once(Utc::now()).await {
                error!("[STORE] history purge failed: {e}");
            }
        }
    }

    async fn purge_once(&self, now: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.purge_older_than(self.retention_days, now).await?;
        if deleted > 0 {
            info!(deleted, retention_days = self.retention_days, "[STORE] purged old price history");
        } else {
            debug!("[STORE] history purge: nothing older than {} days", self.retention_days);
        }
        Ok(deleted)
    }
}
