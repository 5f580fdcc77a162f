use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::locations::LocationRegistry;
use crate::types::{Order, OrderSide};

/// Location codes arrive as numbers or as zero-padded strings ("0007").
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum Code {
    Num(u32),
    Text(String),
}

impl Code {
    fn value(&self) -> Option<u32> {
        match self {
            Code::Num(n) => Some(*n),
            Code::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// One order delta exactly as the feed publishes it.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct RawOrder {
    pub id: i64,
    pub item_type_id: String,
    location_id: Code,
    #[serde(default = "default_quality")]
    pub quality_level: u8,
    #[serde(default)]
    pub enchantment_level: u8,
    pub unit_price: i64,
    pub amount: i64,
    pub auction_type: String,
    pub expires: String,
}

fn default_quality() -> u8 {
    1
}

/// Feed messages are either a bare array of deltas, a single delta, or an
/// envelope carrying the array under `Orders`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFrame {
    Batch(Vec<RawOrder>),
    Envelope {
        #[serde(rename = "Orders")]
        orders: Vec<RawOrder>,
    },
    Single(RawOrder),
}

/// Why a single delta could not become an `Order`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    UnknownLocation(u32),
    Malformed(&'static str),
}

/// Parse one text frame into raw deltas. A frame that is not one of the known
/// shapes is an error; the caller logs it and carries on.
pub fn parse_feed_frame(raw: &str) -> Result<Vec<RawOrder>, serde_json::Error> {
    Ok(match serde_json::from_str::<RawFrame>(raw)? {
        RawFrame::Batch(v) => v,
        RawFrame::Envelope { orders } => orders,
        RawFrame::Single(o) => vec![o],
    })
}

impl RawOrder {
    /// Raw location code as published, before portal folding.
    pub fn location_code(&self) -> Option<u32> {
        self.location_id.value()
    }

    /// Map to a store `Order`, resolving the location through the registry.
    pub fn into_order(self, registry: &LocationRegistry, seen_at: DateTime<Utc>) -> Result<Order, Rejected> {
        let code = self.location_code().ok_or(Rejected::Malformed("LocationId"))?;
        let location_id = registry.resolve_code(code).ok_or(Rejected::UnknownLocation(code))?;
        let side = OrderSide::parse(self.auction_type.trim()).ok_or(Rejected::Malformed("AuctionType"))?;
        let expires_at = parse_expires(&self.expires).ok_or(Rejected::Malformed("Expires"))?;
        if self.unit_price <= 0 {
            return Err(Rejected::Malformed("UnitPrice"));
        }
        if self.amount < 0 {
            return Err(Rejected::Malformed("Amount"));
        }
        let item_id = self.item_type_id.trim().to_string();
        if item_id.is_empty() {
            return Err(Rejected::Malformed("ItemTypeId"));
        }
        Ok(Order {
            order_id: self.id,
            item_id,
            location_id,
            quality: self.quality_level,
            enchantment: self.enchantment_level,
            price: self.unit_price,
            amount: self.amount,
            side,
            expires_at,
            last_seen_at: seen_at,
        })
    }
}

/// ISO-8601 with an offset, or a naive timestamp taken as UTC.
fn parse_expires(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|n| n.and_utc())
}
