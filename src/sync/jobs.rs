//! What each sync job fetches: pass plans, batched request URLs and response decoding.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::db::models::from_ts;
use crate::error::Result;
use crate::locations::LocationRegistry;
use crate::sync::batch::{merge_date_ranges, pack_items, DateRange};
use crate::types::{JobKind, LatestPrice, PriceHistoryPoint, TimeScale};

/// Date ranges and items one pass covers. `ranges` is empty for the latest-prices job.
/// Stored with the checkpoint so a resumed pass rebuilds the same batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassPlan {
    pub ranges: Vec<DateRange>,
    #[serde(default)]
    pub items: Vec<String>,
}

impl PassPlan {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub url: String,
    pub items: Vec<String>,
    pub range: Option<DateRange>,
}

pub fn time_scale(job: JobKind) -> Option<TimeScale> {
    match job {
        JobKind::LatestPrices => None,
        JobKind::HourlyHistory => Some(TimeScale::Hourly),
        JobKind::DailyHistory => Some(TimeScale::Daily),
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Start of the bucket containing `now`. Buckets at or after it are still filling.
pub fn current_bucket_start(scale: TimeScale, now: DateTime<Utc>) -> DateTime<Utc> {
    let width = scale.hours() * 3_600;
    let ts = now.timestamp();
    from_ts(ts - ts.rem_euclid(width))
}

pub fn current_hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    current_bucket_start(TimeScale::Hourly, now)
}

/// Newest bucket a fresh hourly series must contain.
pub fn last_complete_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    current_hour_start(now) - Duration::hours(1)
}

/// Hourly pass: from the day of the newest stored bucket (or the window start) through today.
pub fn hourly_plan(newest: Option<DateTime<Utc>>, today: NaiveDate, window_days: i64) -> PassPlan {
    let window_start = today - Duration::days(window_days.max(1) - 1);
    let start = newest
        .map(|ts| ts.date_naive())
        .filter(|d| *d > window_start)
        .unwrap_or(window_start)
        .min(today);
    PassPlan {
        ranges: vec![DateRange { start, end: today }],
        items: Vec::new(),
    }
}

/// Daily pass: every missing day, contiguous days merged into one range.
pub fn daily_plan(missing: &[NaiveDate]) -> PassPlan {
    PassPlan {
        ranges: merge_date_ranges(missing),
        items: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// Turn a plan and the item universe into ordered request batches, each URL at most
/// `max_url_length` characters (unless a single item alone exceeds it).
pub fn build_batches(
    job: JobKind,
    plan: &PassPlan,
    items: &[String],
    base_url: &str,
    locations: &[String],
    max_url_length: usize,
) -> Result<Vec<BatchRequest>> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let ranges: Vec<Option<DateRange>> = match time_scale(job) {
        None => vec![None],
        Some(_) => plan.ranges.iter().copied().map(Some).collect(),
    };

    let mut out = Vec::new();
    for range in ranges {
        let fixed = request_url(base_url, job, &[], range, locations)?.len();
        let budget = max_url_length.saturating_sub(fixed).max(1);
        for group in pack_items(items, budget) {
            out.push(BatchRequest {
                url: request_url(base_url, job, &group, range, locations)?,
                items: group,
                range,
            });
        }
    }
    Ok(out)
}

fn request_url(
    base_url: &str,
    job: JobKind,
    items: &[String],
    range: Option<DateRange>,
    locations: &[String],
) -> Result<String> {
    let kind = match job {
        JobKind::LatestPrices => "prices",
        JobKind::HourlyHistory | JobKind::DailyHistory => "history",
    };
    let mut url = Url::parse(&format!("{base_url}/api/v2/stats/{kind}/{}", items.join(",")))?;
    {
        let mut q = url.query_pairs_mut();
        if let (Some(scale), Some(r)) = (time_scale(job), range) {
            q.append_pair("time-scale", &scale.hours().to_string());
            q.append_pair("date", &r.start.format("%Y-%m-%d").to_string());
            // end_date is exclusive on the remote side.
            q.append_pair("end_date", &(r.end + Duration::days(1)).format("%Y-%m-%d").to_string());
        }
        q.append_pair("locations", &locations.join(","));
    }
    Ok(url.into())
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HistorySeries {
    pub location: String,
    pub item_id: String,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub data: Vec<HistorySample>,
}

#[derive(Debug, Deserialize)]
pub struct HistorySample {
    pub item_count: i64,
    pub avg_price: f64,
    pub timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct PriceRow {
    pub item_id: String,
    pub city: String,
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub sell_price_min: i64,
    #[serde(default)]
    pub sell_price_min_date: Option<String>,
    #[serde(default)]
    pub buy_price_max: i64,
    #[serde(default)]
    pub buy_price_max_date: Option<String>,
}

fn default_quality() -> u8 {
    1
}

/// Remote timestamps are naive UTC, with or without fractional seconds.
fn parse_remote_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}

/// Map history series to points, keeping only buckets inside `range` and before
/// `cutoff` (the still-filling bucket is never stored).
pub fn decode_history(
    series: Vec<HistorySeries>,
    scale: TimeScale,
    range: DateRange,
    cutoff: DateTime<Utc>,
    registry: &LocationRegistry,
) -> Vec<PriceHistoryPoint> {
    let mut out = Vec::new();
    for s in series {
        let Some(location_id) = registry.resolve_any(&s.location) else {
            debug!(location = %s.location, "[SYNC] skipping history for unknown location");
            continue;
        };
        for sample in s.data {
            let Some(bucket_ts) = parse_remote_ts(&sample.timestamp) else {
                continue;
            };
            let day = bucket_ts.date_naive();
            if day < range.start || day > range.end || bucket_ts >= cutoff {
                continue;
            }
            out.push(PriceHistoryPoint {
                item_id: s.item_id.clone(),
                location_id,
                quality: s.quality,
                time_scale: scale,
                bucket_ts,
                avg_price: sample.avg_price.round() as i64,
                sample_count: sample.item_count,
            });
        }
    }
    out
}

/// Map latest-price rows. The remote's zero date means "never observed".
pub fn decode_latest(rows: Vec<PriceRow>, fetched_at: DateTime<Utc>, registry: &LocationRegistry) -> Vec<LatestPrice> {
    let observed = |s: &Option<String>| {
        s.as_deref()
            .and_then(parse_remote_ts)
            .filter(|ts| ts.timestamp() > 0)
    };
    rows.into_iter()
        .filter(|r| r.sell_price_min > 0 || r.buy_price_max > 0)
        .filter_map(|r| {
            let location_id = registry.resolve_name(&r.city)?;
            Some(LatestPrice {
                location_id,
                quality: r.quality,
                sell_price_min: r.sell_price_min,
                sell_price_min_at: observed(&r.sell_price_min_date),
                buy_price_max: r.buy_price_max,
                buy_price_max_at: observed(&r.buy_price_max_date),
                fetched_at,
                item_id: r.item_id,
            })
        })
        .collect()
}
