pub mod history_purge;

pub use history_purge::HistoryPurger;
