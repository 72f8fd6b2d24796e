//! Ladder planning for range and flat grids

use rust_decimal::Decimal;

use crate::db::{FlatParams, RangeParams};
use crate::types::{MarketInfo, OrderSide};

use super::solver::{amount_for_cost, round_price_down};

/// One planned ladder order, ready for placement.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOrder {
    /// Ladder index (range) or center offset (flat)
    pub level: i64,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
}

/// The full set of orders a bot keeps on the book.
#[derive(Debug, Clone, Default)]
pub struct Ladder {
    pub orders: Vec<PlannedOrder>,
}

impl Ladder {
    pub fn buys(&self) -> impl Iterator<Item = &PlannedOrder> {
        self.orders.iter().filter(|o| o.side == OrderSide::Buy)
    }

    pub fn sells(&self) -> impl Iterator<Item = &PlannedOrder> {
        self.orders.iter().filter(|o| o.side == OrderSide::Sell)
    }

    /// Base currency needed to back every sell order.
    pub fn total_sell_amount(&self) -> Decimal {
        self.sells().map(|o| o.amount).sum()
    }
}

/// The `levels + 1` arithmetic price points of a range grid, unrounded.
pub fn range_prices(lower: Decimal, upper: Decimal, levels: u32) -> Vec<Decimal> {
    let step = (upper - lower) / Decimal::from(levels);
    (0..=levels)
        .map(|i| lower + step * Decimal::from(i))
        .collect()
}

/// Plan a range-grid ladder.
///
/// The lower half of the indices becomes buys, the upper half sells; the
/// center index stays empty so the topmost buy's counter order has a free
/// level to land on.
pub fn plan_range(params: &RangeParams, order_size: Decimal, market: &MarketInfo) -> Ladder {
    let prices = range_prices(params.lower_price, params.upper_price, params.grid_levels);
    let half = params.grid_levels / 2;

    let mut orders = Vec::with_capacity(params.grid_levels as usize);
    for (index, raw_price) in prices.iter().enumerate() {
        let index = index as u32;
        let side = if index < half {
            OrderSide::Buy
        } else if index > half {
            OrderSide::Sell
        } else {
            continue;
        };

        let price = round_price_down(*raw_price, market.price_precision);
        let amount = amount_for_cost(
            order_size,
            price,
            &market.amount_precision,
            market.min_order_amount,
        );
        orders.push(PlannedOrder {
            level: index as i64,
            side,
            price,
            amount,
        });
    }

    Ladder { orders }
}

/// Plan a flat-grid ladder around `starting_price`.
///
/// Buys sit `i * increment` below the start, sells `j * increment` above;
/// the spread plays no role here, it only governs counter-order placement.
/// Buy levels that round to a non-positive price are skipped.
pub fn plan_flat(params: &FlatParams, order_size: Decimal, market: &MarketInfo) -> Ladder {
    let mut orders = Vec::new();

    for i in 1..=params.buy_orders_count {
        let raw = params.starting_price - params.flat_increment * Decimal::from(i);
        let price = round_price_down(raw, market.price_precision);
        if price <= Decimal::ZERO {
            continue;
        }
        orders.push(PlannedOrder {
            level: i as i64,
            side: OrderSide::Buy,
            price,
            amount: amount_for_cost(
                order_size,
                price,
                &market.amount_precision,
                market.min_order_amount,
            ),
        });
    }

    for j in 1..=params.sell_orders_count {
        let price = round_price_down(
            params.starting_price + params.flat_increment * Decimal::from(j),
            market.price_precision,
        );
        orders.push(PlannedOrder {
            level: j as i64,
            side: OrderSide::Sell,
            price,
            amount: amount_for_cost(
                order_size,
                price,
                &market.amount_precision,
                market.min_order_amount,
            ),
        });
    }

    Ladder { orders }
}

/// Candidate sell prices for a flat grid, lowest first. Used by the health
/// checker when it needs a free level for orphaned assets.
pub fn flat_sell_prices(params: &FlatParams, price_precision: u32) -> Vec<Decimal> {
    (1..=params.sell_orders_count)
        .map(|j| {
            round_price_down(
                params.starting_price + params.flat_increment * Decimal::from(j),
                price_precision,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::api::mock::default_market;
    use rust_decimal_macros::dec;

    fn eth_market() -> MarketInfo {
        default_market("ETH/USDT")
    }

    #[test]
    fn test_range_prices_arithmetic() {
        let prices = range_prices(dec!(1800), dec!(2200), 10);
        assert_eq!(prices.len(), 11);
        assert_eq!(prices[0], dec!(1800));
        assert_eq!(prices[5], dec!(2000));
        assert_eq!(prices[10], dec!(2200));
    }

    #[test]
    fn test_range_ladder_splits_around_empty_center() {
        let params = RangeParams {
            lower_price: dec!(1800),
            upper_price: dec!(2200),
            grid_levels: 10,
            investment_amount: dec!(100),
        };
        let ladder = plan_range(&params, dec!(10), &eth_market());

        let buy_prices: Vec<Decimal> = ladder.buys().map(|o| o.price).collect();
        let sell_prices: Vec<Decimal> = ladder.sells().map(|o| o.price).collect();

        assert_eq!(
            buy_prices,
            vec![dec!(1800), dec!(1840), dec!(1880), dec!(1920), dec!(1960)]
        );
        assert_eq!(
            sell_prices,
            vec![dec!(2040), dec!(2080), dec!(2120), dec!(2160), dec!(2200)]
        );
        // Center level 5 (2000) carries no order.
        assert!(ladder.orders.iter().all(|o| o.level != 5));
    }

    #[test]
    fn test_range_ladder_uniform_cost() {
        let params = RangeParams {
            lower_price: dec!(1800),
            upper_price: dec!(2200),
            grid_levels: 10,
            investment_amount: dec!(100),
        };
        let ladder = plan_range(&params, dec!(10), &eth_market());

        for order in &ladder.orders {
            assert!(
                order.price * order.amount >= dec!(10),
                "level {} under target cost",
                order.level
            );
        }
    }

    #[test]
    fn test_range_boundary_level_counts() {
        for levels in [4u32, 50] {
            let params = RangeParams {
                lower_price: dec!(100),
                upper_price: dec!(200),
                grid_levels: levels,
                investment_amount: dec!(100),
            };
            let ladder = plan_range(&params, dec!(5), &eth_market());
            assert_eq!(ladder.buys().count() as u32, levels / 2);
            assert_eq!(ladder.sells().count() as u32, levels / 2);
        }
    }

    #[test]
    fn test_flat_ladder_prices() {
        let params = FlatParams {
            starting_price: dec!(100),
            flat_spread: dec!(2),
            flat_increment: dec!(1),
            buy_orders_count: 3,
            sell_orders_count: 3,
        };
        let ladder = plan_flat(&params, dec!(10), &eth_market());

        let buy_prices: Vec<Decimal> = ladder.buys().map(|o| o.price).collect();
        let sell_prices: Vec<Decimal> = ladder.sells().map(|o| o.price).collect();

        assert_eq!(buy_prices, vec![dec!(99), dec!(98), dec!(97)]);
        assert_eq!(sell_prices, vec![dec!(101), dec!(102), dec!(103)]);
    }

    #[test]
    fn test_flat_ladder_skips_non_positive_buy_levels() {
        let params = FlatParams {
            starting_price: dec!(2),
            flat_spread: dec!(0.5),
            flat_increment: dec!(1),
            buy_orders_count: 3,
            sell_orders_count: 1,
        };
        let ladder = plan_flat(&params, dec!(1), &eth_market());

        // 2-1=1 stays, 2-2=0 and 2-3=-1 are dropped.
        assert_eq!(ladder.buys().count(), 1);
        assert_eq!(ladder.buys().next().unwrap().price, dec!(1));
    }

    #[test]
    fn test_total_sell_amount_sums_sells_only() {
        let params = FlatParams {
            starting_price: dec!(100),
            flat_spread: dec!(2),
            flat_increment: dec!(1),
            buy_orders_count: 2,
            sell_orders_count: 2,
        };
        let ladder = plan_flat(&params, dec!(10), &eth_market());

        let expected: Decimal = ladder.sells().map(|o| o.amount).sum();
        assert_eq!(ladder.total_sell_amount(), expected);
        assert!(expected > Decimal::ZERO);
    }

    #[test]
    fn test_flat_sell_prices_helper() {
        let params = FlatParams {
            starting_price: dec!(100),
            flat_spread: dec!(2),
            flat_increment: dec!(1),
            buy_orders_count: 3,
            sell_orders_count: 3,
        };
        assert_eq!(
            flat_sell_prices(&params, 2),
            vec![dec!(101), dec!(102), dec!(103)]
        );
    }
}
