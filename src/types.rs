use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Which side of the book a resting order sits on.
///
/// `Offer` = someone selling (we buy from it), `Request` = someone buying (we sell into it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Offer,
    Request,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Offer => "offer",
            OrderSide::Request => "request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "offer" | "sell" => Some(OrderSide::Offer),
            "request" | "buy" => Some(OrderSide::Request),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One active resting order in one location. Prices are integer silver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: i64,
    pub item_id: String,
    pub location_id: u32,
    pub quality: u8,
    pub enchantment: u8,
    pub price: i64,
    pub amount: i64,
    pub side: OrderSide,
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One aggregated price level: every resting order at `price` summed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: i64,
    pub amount: i64,
}

impl DepthLevel {
    pub fn new(price: i64, amount: i64) -> Self {
        Self { price, amount }
    }
}

// ---------------------------------------------------------------------------
// Aggregate prices
// ---------------------------------------------------------------------------

/// Bucket width of a history series, in hours. Matches the remote `time-scale` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeScale {
    Hourly,
    Daily,
}

impl TimeScale {
    pub fn hours(&self) -> i64 {
        match self {
            TimeScale::Hourly => 1,
            TimeScale::Daily => 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryPoint {
    pub item_id: String,
    pub location_id: u32,
    pub quality: u8,
    pub time_scale: TimeScale,
    pub bucket_ts: DateTime<Utc>,
    pub avg_price: i64,
    pub sample_count: i64,
}

/// Most recent min-offer / max-request aggregate for one item, location and quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPrice {
    pub item_id: String,
    pub location_id: u32,
    pub quality: u8,
    pub sell_price_min: i64,
    pub sell_price_min_at: Option<DateTime<Utc>>,
    pub buy_price_max: i64,
    pub buy_price_max_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sync jobs
// ---------------------------------------------------------------------------

/// Every remote sync job the scheduler knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    LatestPrices,
    HourlyHistory,
    DailyHistory,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::LatestPrices,
        JobKind::HourlyHistory,
        JobKind::DailyHistory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::LatestPrices => "latest_prices",
            JobKind::HourlyHistory => "hourly_history",
            JobKind::DailyHistory => "daily_history",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        JobKind::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted progress of one pass of a sync job.
///
/// `current_batch` is the next batch to fetch. `plan` is the job-specific pass plan
/// (JSON) so a resumed pass rebuilds the same batch list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub job: JobKind,
    pub current_batch: usize,
    pub total_batches: usize,
    pub started_at: DateTime<Utc>,
    pub plan: String,
}

// ---------------------------------------------------------------------------
// Arbitrage
// ---------------------------------------------------------------------------

/// Which constraint stopped the depth walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitingFactor {
    /// Next unit would not be individually profitable.
    Profit,
    /// Carry capacity reached.
    Capacity,
    /// One side of the book ran out.
    Depth,
}

impl std::fmt::Display for LimitingFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LimitingFactor::Profit => "profit",
            LimitingFactor::Capacity => "capacity",
            LimitingFactor::Depth => "depth",
        };
        write!(f, "{s}")
    }
}

/// A ranked buy-here/sell-there route. Derived on every query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageOpportunity {
    pub item_id: String,
    pub quality: u8,
    pub buy_location_id: u32,
    pub buy_location: String,
    pub sell_location_id: u32,
    pub sell_location: String,
    /// Top-of-book offer price in the buy city.
    pub best_buy_price: i64,
    /// Top-of-book request price in the sell city (gross).
    pub best_sell_price: i64,
    /// Weighted average over the offer levels consumed.
    pub avg_buy_price: f64,
    /// Weighted average over the request levels consumed (gross, before tax).
    pub avg_sell_price: f64,
    pub quantity: i64,
    pub total_cost: i64,
    pub total_proceeds: i64,
    pub total_profit: i64,
    pub profit_per_unit: f64,
    pub profit_per_kg: f64,
    pub profit_per_hour: f64,
    pub buy_levels_used: usize,
    pub sell_levels_used: usize,
    pub limited_by: LimitingFactor,
}

// ---------------------------------------------------------------------------
// Feed collector state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
}

impl CollectorState {
    pub fn as_u8(self) -> u8 {
        match self {
            CollectorState::Disconnected => 0,
            CollectorState::Connecting => 1,
            CollectorState::Subscribed => 2,
            CollectorState::Reconnecting => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CollectorState::Connecting,
            2 => CollectorState::Subscribed,
            3 => CollectorState::Reconnecting,
            _ => CollectorState::Disconnected,
        }
    }
}

impl std::fmt::Display for CollectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectorState::Disconnected => "disconnected",
            CollectorState::Connecting => "connecting",
            CollectorState::Subscribed => "subscribed",
            CollectorState::Reconnecting => "reconnecting",
        };
        write!(f, "{s}")
    }
}
