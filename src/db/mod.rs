pub mod models;
pub mod store;

pub use store::{best_price, total_amount, BatchRecords, DepthSnapshot, OrderBookStore, StoreStats};
