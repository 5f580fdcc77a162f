pub mod batch;
pub mod jobs;
pub mod lock;
pub mod scheduler;
pub mod status;

pub use lock::ApiLock;
pub use scheduler::{SyncContext, SyncScheduler};
pub use status::SyncStatusBoard;
