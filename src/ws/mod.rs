pub mod connection;
pub mod messages;
pub mod sweeper;

pub use connection::FeedCollector;
pub use sweeper::ExpirySweeper;

use crate::config::{WARN_EVERY_N, WARN_FIRST_N};

/// True for the first `WARN_FIRST_N` occurrences and every `WARN_EVERY_N`th after.
pub fn throttled(count: u64) -> bool {
    count <= WARN_FIRST_N || count % WARN_EVERY_N == 0
}
