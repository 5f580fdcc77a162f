use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::{interval, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::config::{Config, FEED_PING_INTERVAL_SECS, FEED_SILENCE_TIMEOUT_SECS, RECONNECT_BACKOFF_MS};
use crate::db::OrderBookStore;
use crate::error::{AppError, Result};
use crate::locations::LocationRegistry;
use crate::types::{CollectorState, Order};
use crate::ws::messages::{parse_feed_frame, Rejected};
use crate::ws::throttled;

/// How one connection ended.
enum Exit {
    /// Server closed the stream.
    Closed,
    Shutdown,
}

/// Keeps the order store current from the push feed.
///
/// `Disconnected → Connecting → Subscribed ⇄ Reconnecting`. Only a shutdown signal
/// ends the loop; every other failure is a reconnect.
pub struct FeedCollector {
    url: String,
    topic: String,
    user: String,
    password: String,
    store: OrderBookStore,
    registry: Arc<LocationRegistry>,
    health: Arc<HealthState>,
    write_latency: Arc<LatencyStats>,
    shutdown: watch::Receiver<bool>,
    ping_interval: Duration,
    silence_timeout: Duration,
}

impl FeedCollector {
    pub fn new(
        cfg: &Config,
        store: OrderBookStore,
        registry: Arc<LocationRegistry>,
        health: Arc<HealthState>,
        write_latency: Arc<LatencyStats>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            url: cfg.feed_url.clone(),
            topic: cfg.feed_topic.clone(),
            user: cfg.feed_user.clone(),
            password: cfg.feed_password.clone(),
            store,
            registry,
            health,
            write_latency,
            shutdown,
            ping_interval: Duration::from_secs(FEED_PING_INTERVAL_SECS),
            silence_timeout: Duration::from_secs(FEED_SILENCE_TIMEOUT_SECS),
        }
    }

    pub async fn run(self) {
        let mut backoff_idx = 0usize;
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.health.set_state(CollectorState::Connecting);
            info!("[FEED] connecting to {}", self.url);
            let received_before = self.health.messages_received.load(Ordering::Relaxed);

            match self.connect_once().await {
                Ok(Exit::Shutdown) => break,
                Ok(Exit::Closed) => info!("[FEED] connection closed by server"),
                Err(e) => error!("[FEED] connection error: {e}"),
            }

            // A session that delivered data resets the ladder.
            if self.health.messages_received.load(Ordering::Relaxed) > received_before {
                backoff_idx = 0;
            }

            self.health.set_state(CollectorState::Reconnecting);
            self.health.inc_reconnects();

            let delay_ms = RECONNECT_BACKOFF_MS
                .get(backoff_idx)
                .or(RECONNECT_BACKOFF_MS.last())
                .copied()
                .unwrap_or(1_000);
            backoff_idx = (backoff_idx + 1).min(RECONNECT_BACKOFF_MS.len().saturating_sub(1));

            warn!("[FEED] reconnecting in {delay_ms}ms");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = shutdown.changed() => {}
            }
        }

        self.health.set_state(CollectorState::Disconnected);
        info!("[FEED] collector stopped");
    }

    async fn connect_once(&self) -> Result<Exit> {
        let (ws_stream, _) = connect_async(&self.url).await?;
        let (mut write, mut read) = ws_stream.split();

        write.send(Message::Text(self.subscribe_msg().into())).await?;
        self.health.set_state(CollectorState::Subscribed);
        info!(topic = %self.topic, "[FEED] subscribed");

        let mut shutdown = self.shutdown.clone();
        let mut ping_interval = interval(self.ping_interval);
        ping_interval.tick().await; // consume immediate first tick
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                msg = read.next() => {
                    last_frame = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Ok(Exit::Closed);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ping_interval.tick() => {
                    debug!("[FEED] ping");
                    write.send(Message::Ping(vec![].into())).await?;
                }

                _ = tokio::time::sleep_until(last_frame + self.silence_timeout) => {
                    return Err(AppError::Feed(format!(
                        "no frames for {}s",
                        self.silence_timeout.as_secs()
                    )));
                }

                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(Exit::Shutdown);
                    }
                }
            }
        }
    }

    fn subscribe_msg(&self) -> String {
        serde_json::json!({
            "action": "subscribe",
            "topic": self.topic,
            "user": self.user,
            "password": self.password,
        })
        .to_string()
    }

    /// Decode one message and upsert its orders as a single batch.
    /// Nothing here can end the subscription.
    async fn handle_text(&self, text: &str) {
        let now = Utc::now();
        self.health.mark_message(now);

        let raw = match parse_feed_frame(text) {
            Ok(raw) => raw,
            Err(e) => {
                let count = self.health.inc_decode_failures();
                if throttled(count) {
                    let sample: String = text.chars().take(300).collect();
                    warn!(count, "[FEED] undecodable message ({e}): {sample}");
                }
                return;
            }
        };

        let mut batch: Vec<Order> = Vec::with_capacity(raw.len());
        for delta in raw {
            let id = delta.id;
            match delta.into_order(&self.registry, now) {
                Ok(order) => batch.push(order),
                Err(Rejected::UnknownLocation(code)) => {
                    let count = self.health.inc_unknown_location(code);
                    if throttled(count) {
                        warn!(code, count, "[FEED] dropping order {id} for unknown location");
                    }
                }
                Err(Rejected::Malformed(field)) => {
                    let count = self.health.inc_decode_failures();
                    if throttled(count) {
                        warn!(count, "[FEED] dropping order {id}: bad {field}");
                    }
                }
            }
        }
        if batch.is_empty() {
            return;
        }

        let started = std::time::Instant::now();
        match self.store.upsert_orders(&batch).await {
            Ok(n) => {
                self.write_latency.record(started.elapsed());
                self.health.add_upserted(n as u64);
                debug!(orders = n, "[FEED] batch upserted");
            }
            Err(e) => {
                self.health.inc_storage_failures();
                error!(orders = batch.len(), "[FEED] dropping batch, store write failed: {e}");
            }
        }
    }
}
