use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

/// Inclusive range of whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Greedily pack `items` into groups whose comma-joined length fits in `budget`
/// characters. Order is preserved. An item longer than the budget on its own
/// still gets a group of one.
pub fn pack_items(items: &[String], budget: usize) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;

    for item in items {
        if !current.is_empty() && current_len + 1 + item.len() > budget {
            groups.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += usize::from(!current.is_empty()) + item.len();
        current.push(item.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Sort, dedupe and merge consecutive days into ranges.
pub fn merge_date_ranges(dates: &[NaiveDate]) -> Vec<DateRange> {
    let mut sorted = dates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<DateRange> = Vec::new();
    for d in sorted {
        match ranges.last_mut() {
            Some(r) if r.end + Duration::days(1) == d => r.end = d,
            _ => ranges.push(DateRange { start: d, end: d }),
        }
    }
    ranges
}
