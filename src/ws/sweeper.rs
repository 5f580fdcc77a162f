use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::db::OrderBookStore;

/// Deletes expired orders on a fixed interval, independent of the feed connection.
pub struct ExpirySweeper {
    store: OrderBookStore,
    every: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ExpirySweeper {
    pub fn new(store: OrderBookStore, every: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self { store, every, shutdown }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(self.every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match self.store.cleanup_expired(Utc::now()).await {
                Ok(0) => debug!("[FEED] expiry sweep: nothing to delete"),
                Ok(n) => info!(deleted = n, "[FEED] expiry sweep removed {n} orders"),
                Err(e) => error!("[FEED] expiry sweep failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::order;
    use crate::types::OrderSide;

    #[tokio::test]
    async fn sweeps_on_first_tick_and_stops_on_shutdown() {
        let store = OrderBookStore::open_in_memory().await.unwrap();
        let past = Utc::now() - chrono::Duration::minutes(1);
        store
            .upsert_orders(&[order(1, "T4_BAG", 7, OrderSide::Offer, 100, 1, past)])
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(ExpirySweeper::new(store.clone(), Duration::from_secs(3600), rx).run());
        for _ in 0..100 {
            if store.stats().await.unwrap().orders == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.stats().await.unwrap().orders, 0);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
