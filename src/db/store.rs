use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;

use crate::db::models::{from_ts, to_ts, CheckpointRow, DepthRow, LatestPriceRow};
use crate::error::Result;
use crate::types::{
    DepthLevel, JobKind, LatestPrice, Order, OrderSide, PriceHistoryPoint, SyncCheckpoint, TimeScale,
};

// ---------------------------------------------------------------------------
// Depth snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub item_id: String,
    pub location_id: u32,
    pub quality: u8,
    pub side: OrderSide,
}

/// Every aggregated book read at one instant. Levels are in best-execution order:
/// offers ascending, requests descending.
#[derive(Debug, Clone, Default)]
pub struct DepthSnapshot {
    books: HashMap<BookKey, Vec<DepthLevel>>,
    pub taken_at: DateTime<Utc>,
}

impl DepthSnapshot {
    pub fn new(taken_at: DateTime<Utc>) -> Self {
        Self {
            books: HashMap::new(),
            taken_at,
        }
    }

    /// Add levels for one book, re-sorting into best-execution order.
    pub fn insert(&mut self, key: BookKey, mut levels: Vec<DepthLevel>) {
        sort_levels(&mut levels, key.side);
        levels.retain(|l| l.amount > 0);
        if !levels.is_empty() {
            self.books.insert(key, levels);
        }
    }

    pub fn levels(&self, item_id: &str, location_id: u32, quality: u8, side: OrderSide) -> &[DepthLevel] {
        let key = BookKey {
            item_id: item_id.to_string(),
            location_id,
            quality,
            side,
        };
        self.books.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// (item, quality) → locations with offers, locations with requests. Sorted for stable scans.
    pub fn markets(&self) -> BTreeMap<(String, u8), (Vec<u32>, Vec<u32>)> {
        let mut out: BTreeMap<(String, u8), (Vec<u32>, Vec<u32>)> = BTreeMap::new();
        for key in self.books.keys() {
            let entry = out.entry((key.item_id.clone(), key.quality)).or_default();
            match key.side {
                OrderSide::Offer => entry.0.push(key.location_id),
                OrderSide::Request => entry.1.push(key.location_id),
            }
        }
        for (offers, requests) in out.values_mut() {
            offers.sort_unstable();
            requests.sort_unstable();
        }
        out
    }

    pub fn book_count(&self) -> usize {
        self.books.len()
    }
}

fn sort_levels(levels: &mut [DepthLevel], side: OrderSide) {
    match side {
        OrderSide::Offer => levels.sort_by_key(|l| l.price),
        OrderSide::Request => levels.sort_by_key(|l| std::cmp::Reverse(l.price)),
    }
}

/// Top-of-book price of levels in best-execution order.
pub fn best_price(levels: &[DepthLevel]) -> Option<i64> {
    levels.first().map(|l| l.price)
}

/// Total resting amount across levels.
pub fn total_amount(levels: &[DepthLevel]) -> i64 {
    levels.iter().map(|l| l.amount).sum()
}

/// First day of a `window_days` retention window ending at `today`.
fn window_start(window_days: i64, today: NaiveDate) -> NaiveDate {
    today - ChronoDuration::days(window_days.max(0))
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::default()).and_utc()
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub orders: i64,
    pub offers: i64,
    pub requests: i64,
    pub distinct_items: i64,
    pub distinct_locations: i64,
    pub history_rows: i64,
    pub latest_price_rows: i64,
    pub oldest_history_bucket: Option<DateTime<Utc>>,
    pub newest_history_bucket: Option<DateTime<Utc>>,
    pub pending_checkpoints: i64,
}

// ---------------------------------------------------------------------------
// Batch payloads committed together with a checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum BatchRecords {
    History(Vec<PriceHistoryPoint>),
    Latest(Vec<LatestPrice>),
}

impl BatchRecords {
    pub fn len(&self) -> usize {
        match self {
            BatchRecords::History(v) => v.len(),
            BatchRecords::Latest(v) => v.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// OrderBookStore
// ---------------------------------------------------------------------------

/// SQLite-backed store of live orders, price history, latest prices and sync checkpoints.
///
/// Every multi-row write is a single transaction so depth readers never observe a
/// partially applied batch.
#[derive(Clone)]
pub struct OrderBookStore {
    pool: SqlitePool,
}

impl OrderBookStore {
    /// Open (creating if needed) the database file and apply migrations.
    pub async fn open(db_path: &str) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{db_path}?mode=rwc")).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("[STORE] database ready at {db_path}");
        Ok(Self { pool })
    }

    /// Single-connection in-memory store with migrations applied.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Round-trip a trivial query.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- orders -------------------------------------------------------------

    /// Insert or overwrite a batch of orders by `order_id`, in one transaction.
    /// Re-sightings overwrite price, amount, expiry and `last_seen_at`.
    pub async fn upsert_orders(&self, orders: &[Order]) -> Result<usize> {
        if orders.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for o in orders {
            sqlx::query(
                r#"
                INSERT INTO orders (
                    order_id, item_id, location_id, quality, enchantment,
                    price, amount, side, expires_at, last_seen_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(order_id) DO UPDATE SET
                    price = excluded.price,
                    amount = excluded.amount,
                    expires_at = excluded.expires_at,
                    last_seen_at = excluded.last_seen_at
                "#,
            )
            .bind(o.order_id)
            .bind(&o.item_id)
            .bind(i64::from(o.location_id))
            .bind(i64::from(o.quality))
            .bind(i64::from(o.enchantment))
            .bind(o.price)
            .bind(o.amount)
            .bind(o.side.as_str())
            .bind(to_ts(o.expires_at))
            .bind(to_ts(o.last_seen_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(orders.len())
    }

    /// Delete every order with `expires_at < now`.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM orders WHERE expires_at < ?")
            .bind(to_ts(now))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Aggregated resting depth for one book in best-execution order
    /// (offers ascending, requests descending).
    pub async fn depth_at(
        &self,
        item_id: &str,
        location_id: u32,
        quality: u8,
        side: OrderSide,
    ) -> Result<Vec<DepthLevel>> {
        let sql = match side {
            OrderSide::Offer => DEPTH_SQL_ASC,
            OrderSide::Request => DEPTH_SQL_DESC,
        };
        let rows: Vec<(i64, i64)> = sqlx::query_as(sql)
            .bind(item_id)
            .bind(i64::from(location_id))
            .bind(i64::from(quality))
            .bind(side.as_str())
            .bind(to_ts(Utc::now()))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(p, a)| DepthLevel::new(p, a)).collect())
    }

    /// Read every live book in one statement so a scan sees one consistent state.
    pub async fn depth_snapshot(&self) -> Result<DepthSnapshot> {
        let now = Utc::now();
        let rows: Vec<DepthRow> = sqlx::query_as(
            r#"
            SELECT item_id, location_id, quality, side, price, SUM(amount) AS amount
            FROM orders
            WHERE expires_at >= ? AND amount > 0
            GROUP BY item_id, location_id, quality, side, price
            "#,
        )
        .bind(to_ts(now))
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<BookKey, Vec<DepthLevel>> = HashMap::new();
        for row in rows {
            let Some(side) = row.side() else { continue };
            let key = BookKey {
                item_id: row.item_id.clone(),
                location_id: row.location_id as u32,
                quality: row.quality as u8,
                side,
            };
            grouped.entry(key).or_default().push(row.level());
        }

        let mut snapshot = DepthSnapshot::new(now);
        for (key, levels) in grouped {
            snapshot.insert(key, levels);
        }
        Ok(snapshot)
    }

    /// Every item id seen in the feed or the latest-price table, sorted.
    pub async fn distinct_items(&self) -> Result<Vec<String>> {
        let items: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT item_id FROM orders
            UNION
            SELECT item_id FROM latest_prices
            ORDER BY item_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    // -- price history ------------------------------------------------------

    /// Insert history outside a sync pass. Passes go through `commit_batch`.
    #[cfg(test)]
    pub async fn insert_price_history(&self, points: &[PriceHistoryPoint]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        insert_history_rows(&mut tx, points).await?;
        tx.commit().await?;
        Ok(points.len())
    }

    /// Newest bucket stored for a series scale.
    pub async fn latest_history_date(&self, scale: TimeScale) -> Result<Option<DateTime<Utc>>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(bucket_ts) FROM price_history WHERE time_scale = ?")
            .bind(scale.hours())
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(from_ts))
    }

    /// Days in `[today - window_days, today)` with no daily bucket at all.
    /// Today is excluded: its bucket is still filling.
    pub async fn missing_history_dates(&self, window_days: i64, today: NaiveDate) -> Result<Vec<NaiveDate>> {
        let start = window_start(window_days, today);
        let start_ts = to_ts(midnight(start));
        let present: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT bucket_ts FROM price_history WHERE time_scale = ? AND bucket_ts >= ?",
        )
        .bind(TimeScale::Daily.hours())
        .bind(start_ts)
        .fetch_all(&self.pool)
        .await?;
        let present: HashSet<NaiveDate> = present.into_iter().map(|ts| from_ts(ts).date_naive()).collect();

        Ok(start
            .iter_days()
            .take_while(|d| *d < today)
            .filter(|d| !present.contains(d))
            .collect())
    }

    /// Delete history buckets from days before the retention window. The window is
    /// whole days, the same one `missing_history_dates` checks.
    pub async fn purge_older_than(&self, window_days: i64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = midnight(window_start(window_days, now.date_naive()));
        let res = sqlx::query("DELETE FROM price_history WHERE bucket_ts < ?")
            .bind(to_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // -- latest prices ------------------------------------------------------

    pub async fn latest_prices_fetched_at(&self) -> Result<Option<DateTime<Utc>>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(fetched_at) FROM latest_prices")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(from_ts))
    }

    pub async fn latest_prices_for(&self, item_id: &str) -> Result<Vec<LatestPrice>> {
        let rows: Vec<LatestPriceRow> = sqlx::query_as(
            r#"
            SELECT item_id, location_id, quality, sell_price_min, sell_price_min_at,
                   buy_price_max, buy_price_max_at, fetched_at
            FROM latest_prices
            WHERE item_id = ?
            ORDER BY location_id, quality
            "#,
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LatestPrice::from).collect())
    }

    // -- sync checkpoints ---------------------------------------------------

    pub async fn save_checkpoint(&self, cp: &SyncCheckpoint) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_checkpoint(&mut conn, cp).await
    }

    pub async fn load_checkpoint(&self, job: JobKind) -> Result<Option<SyncCheckpoint>> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "SELECT job, current_batch, total_batches, started_at, plan FROM sync_checkpoints WHERE job = ?",
        )
        .bind(job.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(CheckpointRow::into_checkpoint))
    }

    pub async fn clear_checkpoint(&self, job: JobKind) -> Result<()> {
        sqlx::query("DELETE FROM sync_checkpoints WHERE job = ?")
            .bind(job.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert one fetched batch and advance its checkpoint in the same transaction.
    pub async fn commit_batch(&self, records: &BatchRecords, next: &SyncCheckpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        match records {
            BatchRecords::History(points) => insert_history_rows(&mut tx, points).await?,
            BatchRecords::Latest(rows) => upsert_latest_rows(&mut tx, rows).await?,
        }
        write_checkpoint(&mut tx, next).await?;
        tx.commit().await?;
        Ok(())
    }

    // -- stats --------------------------------------------------------------

    pub async fn stats(&self) -> Result<StoreStats> {
        let (orders, offers, requests, distinct_items, distinct_locations): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(CASE WHEN side = 'offer' THEN 1 ELSE 0 END), 0),
                       COALESCE(SUM(CASE WHEN side = 'request' THEN 1 ELSE 0 END), 0),
                       COUNT(DISTINCT item_id),
                       COUNT(DISTINCT location_id)
                FROM orders
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let (history_rows, oldest, newest): (i64, Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), MIN(bucket_ts), MAX(bucket_ts) FROM price_history")
                .fetch_one(&self.pool)
                .await?;

        let latest_price_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM latest_prices")
            .fetch_one(&self.pool)
            .await?;
        let pending_checkpoints: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_checkpoints")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            orders,
            offers,
            requests,
            distinct_items,
            distinct_locations,
            history_rows,
            latest_price_rows,
            oldest_history_bucket: oldest.map(from_ts),
            newest_history_bucket: newest.map(from_ts),
            pending_checkpoints,
        })
    }
}

const DEPTH_SQL_ASC: &str = r#"
    SELECT price, SUM(amount) AS amount
    FROM orders
    WHERE item_id = ? AND location_id = ? AND quality = ? AND side = ? AND expires_at >= ?
    GROUP BY price
    HAVING SUM(amount) > 0
    ORDER BY price ASC
"#;

const DEPTH_SQL_DESC: &str = r#"
    SELECT price, SUM(amount) AS amount
    FROM orders
    WHERE item_id = ? AND location_id = ? AND quality = ? AND side = ? AND expires_at >= ?
    GROUP BY price
    HAVING SUM(amount) > 0
    ORDER BY price DESC
"#;

async fn insert_history_rows(conn: &mut SqliteConnection, points: &[PriceHistoryPoint]) -> Result<()> {
    for p in points {
        sqlx::query(
            r#"
            INSERT INTO price_history (
                item_id, location_id, quality, time_scale, bucket_ts, avg_price, sample_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id, location_id, quality, time_scale, bucket_ts) DO UPDATE SET
                avg_price = excluded.avg_price,
                sample_count = excluded.sample_count
            "#,
        )
        .bind(&p.item_id)
        .bind(i64::from(p.location_id))
        .bind(i64::from(p.quality))
        .bind(p.time_scale.hours())
        .bind(to_ts(p.bucket_ts))
        .bind(p.avg_price)
        .bind(p.sample_count)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn upsert_latest_rows(conn: &mut SqliteConnection, rows: &[LatestPrice]) -> Result<()> {
    for r in rows {
        sqlx::query(
            r#"
            INSERT INTO latest_prices (
                item_id, location_id, quality, sell_price_min, sell_price_min_at,
                buy_price_max, buy_price_max_at, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_id, location_id, quality) DO UPDATE SET
                sell_price_min = excluded.sell_price_min,
                sell_price_min_at = excluded.sell_price_min_at,
                buy_price_max = excluded.buy_price_max,
                buy_price_max_at = excluded.buy_price_max_at,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&r.item_id)
        .bind(i64::from(r.location_id))
        .bind(i64::from(r.quality))
        .bind(r.sell_price_min)
        .bind(r.sell_price_min_at.map(to_ts))
        .bind(r.buy_price_max)
        .bind(r.buy_price_max_at.map(to_ts))
        .bind(to_ts(r.fetched_at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_checkpoint(conn: &mut SqliteConnection, cp: &SyncCheckpoint) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_checkpoints (job, current_batch, total_batches, started_at, plan)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(job) DO UPDATE SET
            current_batch = excluded.current_batch,
            total_batches = excluded.total_batches,
            started_at = excluded.started_at,
            plan = excluded.plan
        "#,
    )
    .bind(cp.job.as_str())
    .bind(cp.current_batch as i64)
    .bind(cp.total_batches as i64)
    .bind(to_ts(cp.started_at))
    .bind(&cp.plan)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{order, utc};

    async fn store() -> OrderBookStore {
        OrderBookStore::open_in_memory().await.unwrap()
    }

    fn future() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::days(1)
    }

    fn history(item: &str, loc: u32, day: &str, avg: i64) -> PriceHistoryPoint {
        PriceHistoryPoint {
            item_id: item.to_string(),
            location_id: loc,
            quality: 1,
            time_scale: TimeScale::Daily,
            bucket_ts: utc(&format!("{day}T00:00:00Z")),
            avg_price: avg,
            sample_count: 10,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let s = store().await;
        let batch = vec![
            order(1, "T4_BAG", 7, OrderSide::Offer, 100, 5, future()),
            order(2, "T4_BAG", 7, OrderSide::Offer, 110, 3, future()),
            order(3, "T4_BAG", 7, OrderSide::Request, 90, 4, future()),
        ];
        s.upsert_orders(&batch).await.unwrap();
        let once_offers = s.depth_at("T4_BAG", 7, 1, OrderSide::Offer).await.unwrap();
        let once_stats = s.stats().await.unwrap();

        s.upsert_orders(&batch).await.unwrap();
        assert_eq!(s.depth_at("T4_BAG", 7, 1, OrderSide::Offer).await.unwrap(), once_offers);
        assert_eq!(s.stats().await.unwrap(), once_stats);
        assert_eq!(once_stats.orders, 3);
    }

    #[tokio::test]
    async fn resighting_overwrites_price_and_amount() {
        let s = store().await;
        s.upsert_orders(&[order(1, "T4_BAG", 7, OrderSide::Offer, 100, 5, future())])
            .await
            .unwrap();
        s.upsert_orders(&[order(1, "T4_BAG", 7, OrderSide::Offer, 95, 2, future())])
            .await
            .unwrap();
        let depth = s.depth_at("T4_BAG", 7, 1, OrderSide::Offer).await.unwrap();
        assert_eq!(depth, vec![DepthLevel::new(95, 2)]);
    }

    #[tokio::test]
    async fn depth_is_aggregated_and_sorted_by_side() {
        let s = store().await;
        s.upsert_orders(&[
            order(1, "T4_BAG", 7, OrderSide::Offer, 120, 1, future()),
            order(2, "T4_BAG", 7, OrderSide::Offer, 100, 2, future()),
            order(3, "T4_BAG", 7, OrderSide::Offer, 100, 3, future()),
            order(4, "T4_BAG", 7, OrderSide::Request, 80, 1, future()),
            order(5, "T4_BAG", 7, OrderSide::Request, 90, 6, future()),
            order(6, "T4_BAG", 1002, OrderSide::Offer, 50, 9, future()),
        ])
        .await
        .unwrap();

        let offers = s.depth_at("T4_BAG", 7, 1, OrderSide::Offer).await.unwrap();
        assert_eq!(offers, vec![DepthLevel::new(100, 5), DepthLevel::new(120, 1)]);
        let requests = s.depth_at("T4_BAG", 7, 1, OrderSide::Request).await.unwrap();
        assert_eq!(requests, vec![DepthLevel::new(90, 6), DepthLevel::new(80, 1)]);

        assert_eq!(best_price(&offers), Some(100));
        assert_eq!(best_price(&requests), Some(90));
        assert_eq!(total_amount(&offers), 6);
        let empty = s.depth_at("T5_BAG", 7, 1, OrderSide::Offer).await.unwrap();
        assert_eq!((best_price(&empty), total_amount(&empty)), (None, 0));
    }

    #[tokio::test]
    async fn expired_orders_are_swept_and_never_returned() {
        let s = store().await;
        let now = Utc::now();
        s.upsert_orders(&[
            order(1, "T4_BAG", 7, OrderSide::Offer, 100, 5, now - ChronoDuration::minutes(5)),
            order(2, "T4_BAG", 7, OrderSide::Offer, 105, 5, now - ChronoDuration::minutes(1)),
            order(3, "T4_BAG", 7, OrderSide::Offer, 110, 5, future()),
        ])
        .await
        .unwrap();

        let deleted = s.cleanup_expired(now).await.unwrap();
        assert_eq!(deleted, 2);
        let depth = s.depth_at("T4_BAG", 7, 1, OrderSide::Offer).await.unwrap();
        assert_eq!(depth, vec![DepthLevel::new(110, 5)]);
        assert_eq!(s.cleanup_expired(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn snapshot_groups_books_in_execution_order() {
        let s = store().await;
        s.upsert_orders(&[
            order(1, "T4_BAG", 7, OrderSide::Offer, 120, 1, future()),
            order(2, "T4_BAG", 7, OrderSide::Offer, 100, 2, future()),
            order(3, "T4_BAG", 2004, OrderSide::Request, 150, 1, future()),
            order(4, "T4_BAG", 2004, OrderSide::Request, 170, 1, future()),
        ])
        .await
        .unwrap();

        let snap = s.depth_snapshot().await.unwrap();
        assert_eq!(snap.book_count(), 2);
        assert_eq!(
            snap.levels("T4_BAG", 7, 1, OrderSide::Offer),
            &[DepthLevel::new(100, 2), DepthLevel::new(120, 1)]
        );
        assert_eq!(
            snap.levels("T4_BAG", 2004, 1, OrderSide::Request),
            &[DepthLevel::new(170, 1), DepthLevel::new(150, 1)]
        );
        let markets = snap.markets();
        assert_eq!(markets[&("T4_BAG".to_string(), 1)], (vec![7], vec![2004]));
    }

    #[tokio::test]
    async fn history_upserts_by_bucket() {
        let s = store().await;
        s.insert_price_history(&[history("T4_BAG", 7, "2025-03-01", 100)]).await.unwrap();
        s.insert_price_history(&[history("T4_BAG", 7, "2025-03-01", 120)]).await.unwrap();
        let stats = s.stats().await.unwrap();
        assert_eq!(stats.history_rows, 1);
        assert_eq!(
            s.latest_history_date(TimeScale::Daily).await.unwrap(),
            Some(utc("2025-03-01T00:00:00Z"))
        );
        assert_eq!(s.latest_history_date(TimeScale::Hourly).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_dates_exclude_today_and_present_days() {
        let s = store().await;
        s.insert_price_history(&[
            history("T4_BAG", 7, "2025-03-02", 100),
            history("T5_BAG", 7, "2025-03-04", 100),
        ])
        .await
        .unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 3, 6).unwrap();
        let missing = s.missing_history_dates(5, today).await.unwrap();
        let d = |day| NaiveDate::from_ymd_opt(2025, 3, day).unwrap();
        assert_eq!(missing, vec![d(1), d(3), d(5)]);
    }

    #[tokio::test]
    async fn purge_drops_only_rows_outside_window() {
        let s = store().await;
        s.insert_price_history(&[
            history("T4_BAG", 7, "2025-01-01", 100),
            history("T4_BAG", 7, "2025-03-01", 100),
        ])
        .await
        .unwrap();
        let purged = s.purge_older_than(30, utc("2025-03-10T00:00:00Z")).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(s.stats().await.unwrap().history_rows, 1);
    }

    #[tokio::test]
    async fn purge_keeps_every_day_the_daily_window_expects() {
        let s = store().await;
        let today = NaiveDate::from_ymd_opt(2025, 3, 31).unwrap();
        let days: Vec<PriceHistoryPoint> = (1..=30)
            .map(|n| {
                let d = today - ChronoDuration::days(n);
                history("T4_BAG", 7, &d.format("%Y-%m-%d").to_string(), 100)
            })
            .collect();
        s.insert_price_history(&days).await.unwrap();
        s.insert_price_history(&[history("T4_BAG", 7, "2025-02-28", 100)]).await.unwrap();
        assert!(s.missing_history_dates(30, today).await.unwrap().is_empty());

        let purged = s.purge_older_than(30, utc("2025-03-31T12:00:00Z")).await.unwrap();
        assert_eq!(purged, 1);
        assert!(s.missing_history_dates(30, today).await.unwrap().is_empty());
        assert_eq!(s.stats().await.unwrap().history_rows, 30);
    }

    #[tokio::test]
    async fn checkpoint_lifecycle_and_atomic_commit() {
        let s = store().await;
        let mut cp = SyncCheckpoint {
            job: JobKind::DailyHistory,
            current_batch: 0,
            total_batches: 3,
            started_at: utc("2025-03-01T00:00:00Z"),
            plan: "[]".to_string(),
        };
        assert!(s.load_checkpoint(JobKind::DailyHistory).await.unwrap().is_none());
        s.save_checkpoint(&cp).await.unwrap();

        cp.current_batch = 1;
        let records = BatchRecords::History(vec![history("T4_BAG", 7, "2025-02-28", 90)]);
        s.commit_batch(&records, &cp).await.unwrap();

        let loaded = s.load_checkpoint(JobKind::DailyHistory).await.unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(s.stats().await.unwrap().history_rows, 1);
        assert!(s.load_checkpoint(JobKind::LatestPrices).await.unwrap().is_none());

        s.clear_checkpoint(JobKind::DailyHistory).await.unwrap();
        assert!(s.load_checkpoint(JobKind::DailyHistory).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_prices_upsert_and_freshness() {
        let s = store().await;
        let fetched_at = utc("2025-03-01T12:00:00Z");
        let row = LatestPrice {
            item_id: "T4_BAG".to_string(),
            location_id: 7,
            quality: 1,
            sell_price_min: 1_000,
            sell_price_min_at: Some(utc("2025-03-01T11:00:00Z")),
            buy_price_max: 900,
            buy_price_max_at: None,
            fetched_at,
        };
        let cp = SyncCheckpoint {
            job: JobKind::LatestPrices,
            current_batch: 1,
            total_batches: 1,
            started_at: fetched_at,
            plan: String::new(),
        };
        s.commit_batch(&BatchRecords::Latest(vec![row.clone()]), &cp).await.unwrap();
        s.commit_batch(&BatchRecords::Latest(vec![row.clone()]), &cp).await.unwrap();

        assert_eq!(s.latest_prices_fetched_at().await.unwrap(), Some(fetched_at));
        assert_eq!(s.latest_prices_for("T4_BAG").await.unwrap(), vec![row]);
        assert_eq!(s.distinct_items().await.unwrap(), vec!["T4_BAG".to_string()]);
    }
}
