//! Fixtures shared by the inline test modules.

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;

use crate::types::{Order, OrderSide};

/// Serve `app` on an ephemeral local port. Returns `http://127.0.0.1:PORT`.
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn utc(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

/// Quality-1, unenchanted order.
pub fn order(
    order_id: i64,
    item_id: &str,
    location_id: u32,
    side: OrderSide,
    price: i64,
    amount: i64,
    expires_at: DateTime<Utc>,
) -> Order {
    Order {
        order_id,
        item_id: item_id.to_string(),
        location_id,
        quality: 1,
        enchantment: 0,
        price,
        amount,
        side,
        expires_at,
        last_seen_at: Utc::now(),
    }
}
