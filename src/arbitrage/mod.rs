pub mod calculator;
pub mod depth_walk;
pub mod scanner;

pub use calculator::{ArbitrageCalculator, OpportunityFilter};
pub use scanner::OpportunityScanner;
