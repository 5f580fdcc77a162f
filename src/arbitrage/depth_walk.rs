//! Lockstep walk of offer depth in the buy city against request depth in the sell city.

use crate::types::{DepthLevel, LimitingFactor};

/// Result of one walk. All money is integer silver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthWalk {
    pub quantity: i64,
    pub total_cost: i64,
    /// Proceeds after sales tax.
    pub total_proceeds: i64,
    /// Proceeds before sales tax.
    pub gross_proceeds: i64,
    pub buy_levels_used: usize,
    pub sell_levels_used: usize,
    pub limited_by: LimitingFactor,
}

impl DepthWalk {
    pub fn profit(&self) -> i64 {
        self.total_proceeds - self.total_cost
    }

    pub fn avg_buy_price(&self) -> f64 {
        if self.quantity == 0 {
            return 0.0;
        }
        self.total_cost as f64 / self.quantity as f64
    }

    pub fn avg_sell_price(&self) -> f64 {
        if self.quantity == 0 {
            return 0.0;
        }
        self.gross_proceeds as f64 / self.quantity as f64
    }
}

/// Sale price after tax. Tax is rounded up per unit.
pub fn net_of_tax(price: i64, tax_bps: i64) -> i64 {
    let tax = (price * tax_bps + 9_999) / 10_000;
    price - tax
}

/// Walk `offers` (ascending) and `requests` (descending) together, buying from the
/// cheapest offer and selling into the richest request, while the next unit is
/// strictly profitable after tax and the carried quantity stays within
/// `capacity_units`.
///
/// Levels with a non-positive amount are ignored.
pub fn walk_depth(offers: &[DepthLevel], requests: &[DepthLevel], capacity_units: i64, tax_bps: i64) -> DepthWalk {
    let offers: Vec<DepthLevel> = offers.iter().copied().filter(|l| l.amount > 0).collect();
    let requests: Vec<DepthLevel> = requests.iter().copied().filter(|l| l.amount > 0).collect();
    let cap = capacity_units.max(0);

    let mut walk = DepthWalk {
        quantity: 0,
        total_cost: 0,
        total_proceeds: 0,
        gross_proceeds: 0,
        buy_levels_used: 0,
        sell_levels_used: 0,
        limited_by: LimitingFactor::Depth,
    };

    let (mut bi, mut si) = (0usize, 0usize);
    let mut buy_left = offers.first().map_or(0, |l| l.amount);
    let mut sell_left = requests.first().map_or(0, |l| l.amount);

    walk.limited_by = loop {
        if walk.quantity >= cap {
            break LimitingFactor::Capacity;
        }
        let (Some(offer), Some(request)) = (offers.get(bi), requests.get(si)) else {
            break LimitingFactor::Depth;
        };
        let net = net_of_tax(request.price, tax_bps);
        if net <= offer.price {
            break LimitingFactor::Profit;
        }

        let step = buy_left.min(sell_left).min(cap - walk.quantity);
        if buy_left == offer.amount {
            walk.buy_levels_used += 1;
        }
        if sell_left == request.amount {
            walk.sell_levels_used += 1;
        }
        walk.quantity += step;
        walk.total_cost += step * offer.price;
        walk.total_proceeds += step * net;
        walk.gross_proceeds += step * request.price;
        buy_left -= step;
        sell_left -= step;

        if buy_left == 0 {
            bi += 1;
            buy_left = offers.get(bi).map_or(0, |l| l.amount);
        }
        if sell_left == 0 {
            si += 1;
            sell_left = requests.get(si).map_or(0, |l| l.amount);
        }
    };
    walk
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(v: &[(i64, i64)]) -> Vec<DepthLevel> {
        v.iter().map(|&(p, a)| DepthLevel::new(p, a)).collect()
    }

    #[test]
    fn stops_where_the_next_unit_loses_money() {
        let offers = levels(&[(100, 10), (110, 5)]);
        let requests = levels(&[(130, 8), (105, 20)]);
        let w = walk_depth(&offers, &requests, 12, 0);
        assert_eq!(w.quantity, 10);
        assert_eq!(w.limited_by, LimitingFactor::Profit);
        assert_eq!(w.total_cost, 1_000);
        assert_eq!(w.total_proceeds, 8 * 130 + 2 * 105);
        assert_eq!(w.profit(), 250);
        assert_eq!(w.buy_levels_used, 1);
        assert_eq!(w.sell_levels_used, 2);
        assert!((w.avg_buy_price() - 100.0).abs() < 1e-9);
        assert!((w.avg_sell_price() - 125.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_binds_before_profit() {
        let offers = levels(&[(100, 10), (110, 5)]);
        let requests = levels(&[(130, 8), (105, 20)]);
        let w = walk_depth(&offers, &requests, 6, 0);
        assert_eq!(w.quantity, 6);
        assert_eq!(w.limited_by, LimitingFactor::Capacity);
        assert_eq!(w.profit(), 6 * 30);
    }

    #[test]
    fn exhausted_book_is_depth_limited() {
        let w = walk_depth(&levels(&[(100, 3)]), &levels(&[(200, 50)]), 100, 0);
        assert_eq!(w.quantity, 3);
        assert_eq!(w.limited_by, LimitingFactor::Depth);

        let w = walk_depth(&[], &levels(&[(200, 50)]), 100, 0);
        assert_eq!(w.quantity, 0);
        assert_eq!(w.limited_by, LimitingFactor::Depth);
    }

    #[test]
    fn tax_is_rounded_up_and_can_kill_a_spread() {
        assert_eq!(net_of_tax(1_000, 400), 960);
        assert_eq!(net_of_tax(101, 400), 96); // 4.04 rounds up to 5
        assert_eq!(net_of_tax(100, 0), 100);

        // 104 gross nets 99 at 4%: not worth buying at 100.
        let w = walk_depth(&levels(&[(100, 5)]), &levels(&[(104, 5)]), 10, 400);
        assert_eq!(w.quantity, 0);
        assert_eq!(w.limited_by, LimitingFactor::Profit);
    }

    #[test]
    fn every_consumed_unit_is_individually_profitable() {
        let offers = levels(&[(10, 4), (12, 3), (15, 6), (19, 2), (25, 10)]);
        let requests = levels(&[(30, 2), (22, 5), (18, 4), (16, 7), (11, 3)]);
        let w = walk_depth(&offers, &requests, 1_000, 0);

        // Expand per unit and check the marginal pair of each one.
        let expand = |ls: &[DepthLevel]| -> Vec<i64> {
            ls.iter().flat_map(|l| std::iter::repeat(l.price).take(l.amount as usize)).collect()
        };
        let buys = expand(&offers);
        let sells = expand(&requests);
        for i in 0..w.quantity as usize {
            assert!(sells[i] > buys[i], "unit {i}: {} <= {}", sells[i], buys[i]);
        }
        let q = w.quantity as usize;
        assert!(q == buys.len() || q == sells.len() || sells[q] <= buys[q]);
    }

    #[test]
    fn quantity_never_exceeds_capacity() {
        let offers = levels(&[(1, 1_000)]);
        let requests = levels(&[(50, 1_000)]);
        for cap in [0, 1, 7, 999, 1_000, 5_000] {
            let w = walk_depth(&offers, &requests, cap, 250);
            assert!(w.quantity <= cap);
            assert!(w.quantity <= 1_000);
        }
    }
}
