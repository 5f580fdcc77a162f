use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::arbitrage::depth_walk::walk_depth;
use crate::catalog::ItemCatalog;
use crate::config::TradeSettings;
use crate::db::{best_price, DepthSnapshot, OrderBookStore};
use crate::error::Result;
use crate::locations::LocationRegistry;
use crate::types::{ArbitrageOpportunity, DepthLevel, OrderSide};

pub const DEFAULT_LIMIT: usize = 50;

/// Narrows an opportunity scan. Empty lists mean "any".
#[derive(Debug, Clone)]
pub struct OpportunityFilter {
    pub items: Vec<String>,
    pub qualities: Vec<u8>,
    pub buy_locations: Vec<u32>,
    pub sell_locations: Vec<u32>,
    /// Routes below this total profit are dropped. Never below 1.
    pub min_profit: i64,
    pub limit: usize,
    /// Overrides the configured carry capacity.
    pub capacity_kg: Option<f64>,
}

impl Default for OpportunityFilter {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            qualities: Vec::new(),
            buy_locations: Vec::new(),
            sell_locations: Vec::new(),
            min_profit: 1,
            limit: DEFAULT_LIMIT,
            capacity_kg: None,
        }
    }
}

impl OpportunityFilter {
    fn wants_item(&self, item: &str, quality: u8) -> bool {
        (self.items.is_empty() || self.items.iter().any(|i| i == item))
            && (self.qualities.is_empty() || self.qualities.contains(&quality))
    }

    fn wants_route(&self, buy: u32, sell: u32) -> bool {
        (self.buy_locations.is_empty() || self.buy_locations.contains(&buy))
            && (self.sell_locations.is_empty() || self.sell_locations.contains(&sell))
    }
}

/// Finds depth-aware buy-here/sell-there routes.
pub struct ArbitrageCalculator {
    registry: Arc<LocationRegistry>,
    catalog: Arc<ItemCatalog>,
    trade: TradeSettings,
}

impl ArbitrageCalculator {
    pub fn new(registry: Arc<LocationRegistry>, catalog: Arc<ItemCatalog>, trade: TradeSettings) -> Self {
        Self {
            registry,
            catalog,
            trade,
        }
    }

    /// Snapshot the store once, then rank every route in it.
    pub async fn scan(&self, store: &OrderBookStore, filter: &OpportunityFilter) -> Result<Vec<ArbitrageOpportunity>> {
        let snapshot = store.depth_snapshot().await?;
        let ops = self.find_opportunities(&snapshot, filter);
        debug!(
            books = snapshot.book_count(),
            routes = ops.len(),
            "[ARB] scanned snapshot taken at {}",
            snapshot.taken_at
        );
        Ok(ops)
    }

    /// Every profitable (item, quality, buy city, sell city) route in `snapshot`,
    /// ranked by profit per hour. Routes touching a disallowed location are skipped.
    pub fn find_opportunities(&self, snapshot: &DepthSnapshot, filter: &OpportunityFilter) -> Vec<ArbitrageOpportunity> {
        let min_profit = filter.min_profit.max(1);
        let mut out = Vec::new();

        for ((item, quality), (offer_locs, request_locs)) in snapshot.markets() {
            if !filter.wants_item(&item, quality) {
                continue;
            }
            for &buy in &offer_locs {
                for &sell in &request_locs {
                    if buy == sell
                        || self.registry.is_disallowed(buy)
                        || self.registry.is_disallowed(sell)
                        || !filter.wants_route(buy, sell)
                    {
                        continue;
                    }
                    let offers = snapshot.levels(&item, buy, quality, OrderSide::Offer);
                    let requests = snapshot.levels(&item, sell, quality, OrderSide::Request);
                    if let Some(op) = self.evaluate(&item, quality, buy, sell, offers, requests, filter.capacity_kg) {
                        if op.total_profit >= min_profit {
                            out.push(op);
                        }
                    }
                }
            }
        }

        out.sort_by(rank);
        out.truncate(filter.limit);
        out
    }

    /// Walk one route. `None` if not a single unit is profitable.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        item_id: &str,
        quality: u8,
        buy_location_id: u32,
        sell_location_id: u32,
        offers: &[DepthLevel],
        requests: &[DepthLevel],
        capacity_kg: Option<f64>,
    ) -> Option<ArbitrageOpportunity> {
        let weight = self.catalog.weight(item_id);
        let capacity = capacity_kg.unwrap_or(self.trade.carry_capacity_kg).max(0.0);
        let capacity_units = (capacity / weight).floor() as i64;

        let walk = walk_depth(offers, requests, capacity_units, self.trade.sales_tax_bps);
        if walk.quantity == 0 {
            return None;
        }

        let profit = walk.profit();
        let trip_hours =
            ((self.trade.round_trip_minutes + 2.0 * self.trade.leg_overhead_minutes) / 60.0).max(1.0 / 60.0);

        Some(ArbitrageOpportunity {
            item_id: item_id.to_string(),
            quality,
            buy_location_id,
            buy_location: self.registry.name(buy_location_id),
            sell_location_id,
            sell_location: self.registry.name(sell_location_id),
            best_buy_price: best_price(offers).unwrap_or(0),
            best_sell_price: best_price(requests).unwrap_or(0),
            avg_buy_price: walk.avg_buy_price(),
            avg_sell_price: walk.avg_sell_price(),
            quantity: walk.quantity,
            total_cost: walk.total_cost,
            total_proceeds: walk.total_proceeds,
            total_profit: profit,
            profit_per_unit: profit as f64 / walk.quantity as f64,
            profit_per_kg: profit as f64 / (walk.quantity as f64 * weight),
            profit_per_hour: profit as f64 / trip_hours,
            buy_levels_used: walk.buy_levels_used,
            sell_levels_used: walk.sell_levels_used,
            limited_by: walk.limited_by,
        })
    }
}

/// Profit per hour descending, then total profit, then a stable key.
fn rank(a: &ArbitrageOpportunity, b: &ArbitrageOpportunity) -> Ordering {
    b.profit_per_hour
        .partial_cmp(&a.profit_per_hour)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.total_profit.cmp(&a.total_profit))
        .then_with(|| a.item_id.cmp(&b.item_id))
        .then_with(|| a.quality.cmp(&b.quality))
        .then_with(|| a.buy_location_id.cmp(&b.buy_location_id))
        .then_with(|| a.sell_location_id.cmp(&b.sell_location_id))
}
