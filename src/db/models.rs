//! Row types matching `migrations/`. Timestamps are UTC unix seconds.

use chrono::{DateTime, Utc};

use crate::types::{DepthLevel, JobKind, LatestPrice, OrderSide, SyncCheckpoint};

#[derive(Debug, sqlx::FromRow)]
pub struct DepthRow {
    pub item_id: String,
    pub location_id: i64,
    pub quality: i64,
    pub side: String,
    pub price: i64,
    pub amount: i64,
}

impl DepthRow {
    pub fn side(&self) -> Option<OrderSide> {
        OrderSide::parse(&self.side)
    }

    pub fn level(&self) -> DepthLevel {
        DepthLevel::new(self.price, self.amount)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct CheckpointRow {
    pub job: String,
    pub current_batch: i64,
    pub total_batches: i64,
    pub started_at: i64,
    pub plan: String,
}

impl CheckpointRow {
    pub fn into_checkpoint(self) -> Option<SyncCheckpoint> {
        Some(SyncCheckpoint {
            job: JobKind::parse(&self.job)?,
            current_batch: self.current_batch.max(0) as usize,
            total_batches: self.total_batches.max(0) as usize,
            started_at: from_ts(self.started_at),
            plan: self.plan,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct LatestPriceRow {
    pub item_id: String,
    pub location_id: i64,
    pub quality: i64,
    pub sell_price_min: i64,
    pub sell_price_min_at: Option<i64>,
    pub buy_price_max: i64,
    pub buy_price_max_at: Option<i64>,
    pub fetched_at: i64,
}

impl From<LatestPriceRow> for LatestPrice {
    fn from(r: LatestPriceRow) -> Self {
        LatestPrice {
            item_id: r.item_id,
            location_id: r.location_id as u32,
            quality: r.quality as u8,
            sell_price_min: r.sell_price_min,
            sell_price_min_at: r.sell_price_min_at.map(from_ts),
            buy_price_max: r.buy_price_max,
            buy_price_max_at: r.buy_price_max_at.map(from_ts),
            fetched_at: from_ts(r.fetched_at),
        }
    }
}

pub fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
