use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::health::{CollectorReport, HealthState};
use crate::api::latency::{Latencies, LatencyReport};
use crate::arbitrage::calculator::DEFAULT_LIMIT;
use crate::arbitrage::{ArbitrageCalculator, OpportunityFilter};
use crate::db::{best_price, total_amount, OrderBookStore, StoreStats};
use crate::error::AppError;
use crate::locations::LocationRegistry;
use crate::sync::lock::LockView;
use crate::sync::status::JobStatus;
use crate::sync::{ApiLock, SyncStatusBoard};
use crate::types::{ArbitrageOpportunity, CollectorState, DepthLevel, JobKind, LatestPrice, OrderSide, SyncCheckpoint};

/// Hard cap on `/opportunities?limit=`.
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ApiState {
    pub store: OrderBookStore,
    pub registry: Arc<LocationRegistry>,
    pub calculator: Arc<ArbitrageCalculator>,
    pub sync_status: Arc<SyncStatusBoard>,
    pub lock: Arc<ApiLock>,
    pub health: Arc<HealthState>,
    pub latencies: Arc<Latencies>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/depth/:item/:location", get(get_depth))
        .route("/prices/:item", get(get_prices))
        .route("/stats", get(get_stats))
        .route("/stats/latency", get(get_stats_latency))
        .route("/opportunities", get(get_opportunities))
        .route("/sync", get(get_sync_all))
        .route("/sync/:job", get(get_sync_status))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct DepthQuery {
    pub side: Option<String>,
    pub quality: Option<u8>,
}

/// List-valued params are comma-separated.
#[derive(Deserialize, Default)]
pub struct OpportunitiesQuery {
    pub items: Option<String>,
    pub qualities: Option<String>,
    pub buy: Option<String>,
    pub sell: Option<String>,
    pub min_profit: Option<i64>,
    pub limit: Option<usize>,
    pub capacity: Option<f64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub collector_state: CollectorState,
    pub last_message_at: Option<DateTime<Utc>>,
    pub database: &'static str,
}

#[derive(Serialize)]
pub struct DepthResponse {
    pub item_id: String,
    pub location_id: u32,
    pub location: String,
    pub quality: u8,
    pub side: OrderSide,
    pub best_price: Option<i64>,
    pub total_amount: i64,
    pub levels: Vec<DepthLevel>,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub store: StoreStats,
    pub collector: CollectorReport,
    pub api_lock: LockView,
}

#[derive(Serialize)]
pub struct SyncStatusResponse {
    #[serde(flatten)]
    pub status: JobStatus,
    pub checkpoint: Option<SyncCheckpointView>,
}

#[derive(Serialize)]
pub struct SyncCheckpointView {
    pub current_batch: usize,
    pub total_batches: usize,
    pub started_at: DateTime<Utc>,
}

impl From<SyncCheckpoint> for SyncCheckpointView {
    fn from(cp: SyncCheckpoint) -> Self {
        Self {
            current_batch: cp.current_batch,
            total_batches: cp.total_batches,
            started_at: cp.started_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let db_ok = state.store.ping().await.is_ok();
    Json(HealthResponse {
        status: if db_ok { "ok" } else { "degraded" },
        collector_state: state.health.state(),
        last_message_at: state.health.last_message_at(),
        database: if db_ok { "ok" } else { "unreachable" },
    })
}

async fn get_depth(
    State(state): State<ApiState>,
    Path((item, location)): Path<(String, String)>,
    Query(params): Query<DepthQuery>,
) -> Result<Json<DepthResponse>, AppError> {
    let location_id = state
        .registry
        .resolve_any(&location)
        .ok_or_else(|| AppError::NotFound(format!("unknown location \"{location}\"")))?;
    let side = match params.side.as_deref() {
        None => OrderSide::Offer,
        Some(s) => OrderSide::parse(s)
            .ok_or_else(|| AppError::BadRequest(format!("side must be offer or request (got \"{s}\")")))?,
    };
    let quality = params.quality.unwrap_or(1);

    let levels = state.store.depth_at(&item, location_id, quality, side).await?;
    Ok(Json(DepthResponse {
        best_price: best_price(&levels),
        total_amount: total_amount(&levels),
        location: state.registry.name(location_id),
        item_id: item,
        location_id,
        quality,
        side,
        levels,
    }))
}

async fn get_prices(
    State(state): State<ApiState>,
    Path(item): Path<String>,
) -> Result<Json<Vec<LatestPrice>>, AppError> {
    let prices = state.store.latest_prices_for(&item).await?;
    if prices.is_empty() {
        return Err(AppError::NotFound(format!("no latest prices for \"{item}\"")));
    }
    Ok(Json(prices))
}

async fn get_stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, AppError> {
    Ok(Json(StatsResponse {
        store: state.store.stats().await?,
        collector: state.health.report(),
        api_lock: state.lock.view(),
    }))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyReport> {
    Json(state.latencies.report())
}

async fn get_opportunities(
    State(state): State<ApiState>,
    Query(params): Query<OpportunitiesQuery>,
) -> Result<Json<Vec<ArbitrageOpportunity>>, AppError> {
    let filter = build_filter(&state.registry, params)?;
    let ops = state.calculator.scan(&state.store, &filter).await?;
    Ok(Json(ops))
}

async fn get_sync_all(State(state): State<ApiState>) -> Json<Vec<JobStatus>> {
    Json(state.sync_status.all())
}

async fn get_sync_status(
    State(state): State<ApiState>,
    Path(job): Path<String>,
) -> Result<Json<SyncStatusResponse>, AppError> {
    let kind = JobKind::parse(&job).ok_or_else(|| AppError::NotFound(format!("unknown sync job \"{job}\"")))?;
    let status = state
        .sync_status
        .get(kind)
        .ok_or_else(|| AppError::NotFound(format!("sync job \"{job}\" is not scheduled")))?;
    let checkpoint = state.store.load_checkpoint(kind).await?.map(SyncCheckpointView::from);
    Ok(Json(SyncStatusResponse { status, checkpoint }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn split_list(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn resolve_locations(registry: &LocationRegistry, raw: &Option<String>, param: &str) -> Result<Vec<u32>, AppError> {
    split_list(raw)
        .into_iter()
        .map(|s| {
            registry
                .resolve_any(&s)
                .ok_or_else(|| AppError::BadRequest(format!("{param}: unknown location \"{s}\"")))
        })
        .collect()
}

fn build_filter(registry: &LocationRegistry, params: OpportunitiesQuery) -> Result<OpportunityFilter, AppError> {
    let qualities = split_list(&params.qualities)
        .into_iter()
        .map(|q| {
            q.parse::<u8>()
                .map_err(|_| AppError::BadRequest(format!("qualities: \"{q}\" is not a quality level")))
        })
        .collect::<Result<Vec<u8>, AppError>>()?;
    if let Some(c) = params.capacity {
        if !(c.is_finite() && c > 0.0) {
            return Err(AppError::BadRequest("capacity must be a positive number".to_string()));
        }
    }
    Ok(OpportunityFilter {
        items: split_list(&params.items),
        qualities,
        buy_locations: resolve_locations(registry, &params.buy, "buy")?,
        sell_locations: resolve_locations(registry, &params.sell, "sell")?,
        min_profit: params.min_profit.unwrap_or(1),
        limit: params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        capacity_kg: params.capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ItemCatalog;
    use crate::config::TradeSettings;
    use crate::test_support::{order, serve};
    use std::time::Duration;

    async fn app() -> (String, ApiState) {
        let store = OrderBookStore::open_in_memory().await.unwrap();
        let registry = Arc::new(LocationRegistry::new(&[]).unwrap());
        let calculator = ArbitrageCalculator::new(
            Arc::clone(&registry),
            Arc::new(ItemCatalog::empty(1.0)),
            TradeSettings {
                carry_capacity_kg: 1_000.0,
                sales_tax_bps: 0,
                round_trip_minutes: 60.0,
                leg_overhead_minutes: 0.0,
                default_item_weight_kg: 1.0,
            },
        );
        let sync_status = Arc::new(SyncStatusBoard::new());
        sync_status.register(JobKind::DailyHistory, Duration::from_secs(60));
        let state = ApiState {
            store,
            registry,
            calculator: Arc::new(calculator),
            sync_status,
            lock: Arc::new(ApiLock::new()),
            health: Arc::new(HealthState::new()),
            latencies: Latencies::new(),
        };
        let exp = Utc::now() + chrono::Duration::hours(1);
        state
            .store
            .upsert_orders(&[
                order(1, "T4_BAG", 7, OrderSide::Offer, 100, 3, exp),
                order(2, "T4_BAG", 7, OrderSide::Offer, 90, 2, exp),
                order(3, "T4_BAG", 1002, OrderSide::Request, 150, 4, exp),
            ])
            .await
            .unwrap();
        (serve(router(state.clone())).await, state)
    }

    async fn get_json(url: &str) -> (u16, serde_json::Value) {
        let resp = reqwest::get(url).await.unwrap();
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap();
        (status, serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)))
    }

    #[tokio::test]
    async fn depth_by_name_or_code() {
        let (base, _) = app().await;
        let (status, body) = get_json(&format!("{base}/depth/T4_BAG/Thetford?side=offer")).await;
        assert_eq!(status, 200);
        assert_eq!(body["best_price"], 90);
        assert_eq!(body["total_amount"], 5);
        assert_eq!(body["levels"][1]["price"], 100);

        let (status, body) = get_json(&format!("{base}/depth/T4_BAG/1002?side=request")).await;
        assert_eq!(status, 200);
        assert_eq!(body["location"], "Lymhurst");
        assert_eq!(body["best_price"], 150);
    }

    #[tokio::test]
    async fn depth_rejects_unknown_location_and_side() {
        let (base, _) = app().await;
        let (status, _) = get_json(&format!("{base}/depth/T4_BAG/Atlantis")).await;
        assert_eq!(status, 404);
        let (status, _) = get_json(&format!("{base}/depth/T4_BAG/7?side=sideways")).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn latest_prices_by_item() {
        let (base, state) = app().await;
        let fetched = Utc::now();
        let price = LatestPrice {
            item_id: "T4_BAG".into(),
            location_id: 7,
            quality: 1,
            sell_price_min: 95,
            sell_price_min_at: Some(fetched),
            buy_price_max: 140,
            buy_price_max_at: None,
            fetched_at: fetched,
        };
        let next = SyncCheckpoint {
            job: JobKind::LatestPrices,
            current_batch: 1,
            total_batches: 1,
            started_at: fetched,
            plan: String::new(),
        };
        state
            .store
            .commit_batch(&crate::db::BatchRecords::Latest(vec![price]), &next)
            .await
            .unwrap();

        let (status, body) = get_json(&format!("{base}/prices/T4_BAG")).await;
        assert_eq!(status, 200);
        assert_eq!(body[0]["sell_price_min"], 95);
        assert_eq!(body[0]["buy_price_max"], 140);

        let (status, _) = get_json(&format!("{base}/prices/T8_BAG")).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn opportunities_apply_filters() {
        let (base, _) = app().await;
        let (status, body) = get_json(&format!("{base}/opportunities")).await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["quantity"], 4);
        assert_eq!(body[0]["total_profit"], 2 * 60 + 2 * 50);
        assert_eq!(body[0]["limited_by"], "depth");

        let (_, body) = get_json(&format!("{base}/opportunities?sell=Martlock")).await;
        assert!(body.as_array().unwrap().is_empty());
        let (status, _) = get_json(&format!("{base}/opportunities?buy=Atlantis")).await;
        assert_eq!(status, 400);
        let (status, _) = get_json(&format!("{base}/opportunities?capacity=-1")).await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn sync_status_and_stats() {
        let (base, state) = app().await;
        let (status, body) = get_json(&format!("{base}/sync/daily_history")).await;
        assert_eq!(status, 200);
        assert_eq!(body["job"], "daily_history");
        assert!(body["checkpoint"].is_null());

        let (status, _) = get_json(&format!("{base}/sync/weekly")).await;
        assert_eq!(status, 404);
        let (status, _) = get_json(&format!("{base}/sync/latest_prices")).await;
        assert_eq!(status, 404);

        state.health.set_state(CollectorState::Subscribed);
        let (status, body) = get_json(&format!("{base}/stats")).await;
        assert_eq!(status, 200);
        assert_eq!(body["store"]["orders"], 3);
        assert_eq!(body["collector"]["state"], "subscribed");

        let (status, body) = get_json(&format!("{base}/health")).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");

        let (status, body) = get_json(&format!("{base}/stats/latency")).await;
        assert_eq!(status, 200);
        assert_eq!(body["fetch"]["samples"], 0);
    }
}
