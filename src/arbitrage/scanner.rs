use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::arbitrage::calculator::{ArbitrageCalculator, OpportunityFilter};
use crate::db::OrderBookStore;

/// Routes logged per scan.
const TOP_N: usize = 5;

/// Background task that runs the calculator on a timer and logs the best routes.
pub struct OpportunityScanner {
    store: OrderBookStore,
    calculator: Arc<ArbitrageCalculator>,
    every: Duration,
    shutdown: watch::Receiver<bool>,
}

impl OpportunityScanner {
    pub fn new(
        store: OrderBookStore,
        calculator: Arc<ArbitrageCalculator>,
        every: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            calculator,
            every,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.every);
        interval.tick().await; // consume immediate first tick

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
            if let Err(e) = self.scan_once().await {
                error!("[ARB] scan failed: {e}");
            }
        }
    }

    async fn scan_once(&self) -> crate::error::Result<usize> {
        let filter = OpportunityFilter {
            limit: TOP_N,
            ..OpportunityFilter::default()
        };
        let ops = self.calculator.scan(&self.store, &filter).await?;
        if ops.is_empty() {
            debug!("[ARB] no profitable routes");
            return Ok(0);
        }
        for (rank, op) in ops.iter().enumerate() {
            info!(
                rank = rank + 1,
                item = %op.item_id,
                quality = op.quality,
                qty = op.quantity,
                profit = op.total_profit,
                limited_by = %op.limited_by,
                "[ARB] {} → {}: {:.0}/h (avg buy {:.1}, avg sell {:.1})",
                op.buy_location,
                op.sell_location,
                op.profit_per_hour,
                op.avg_buy_price,
                op.avg_sell_price,
            );
        }
        Ok(ops.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ItemCatalog;
    use crate::config::TradeSettings;
    use crate::locations::LocationRegistry;
    use crate::test_support::order;
    use crate::types::OrderSide;
    use chrono::Utc;

    #[tokio::test]
    async fn scan_once_reports_at_most_top_n() {
        let store = OrderBookStore::open_in_memory().await.unwrap();
        let exp = Utc::now() + chrono::Duration::hours(1);
        let mut orders = vec![order(1, "T4_BAG", 7, OrderSide::Offer, 10, 100, exp)];
        for (i, loc) in [1002u32, 2004, 3005, 3008, 4002, 5003].into_iter().enumerate() {
            orders.push(order(10 + i as i64, "T4_BAG", loc, OrderSide::Request, 50 + i as i64, 5, exp));
        }
        store.upsert_orders(&orders).await.unwrap();

        let calc = ArbitrageCalculator::new(
            Arc::new(LocationRegistry::new(&[]).unwrap()),
            Arc::new(ItemCatalog::empty(1.0)),
            TradeSettings {
                carry_capacity_kg: 100.0,
                sales_tax_bps: 0,
                round_trip_minutes: 20.0,
                leg_overhead_minutes: 2.0,
                default_item_weight_kg: 1.0,
            },
        );
        let (_tx, rx) = watch::channel(false);
        let scanner = OpportunityScanner::new(store, Arc::new(calc), Duration::from_secs(60), rx);
        assert_eq!(scanner.scan_once().await.unwrap(), TOP_N);
    }
}
