//! Order-amount arithmetic
//!
//! A grid presents uniform cost across levels: every order is worth the same
//! quote-currency amount. Naive floor division under-fills that target by up
//! to one rounding step, so the solver rounds down first and then walks back
//! up until the executed cost covers the target again.

use rust_decimal::Decimal;

use crate::types::AmountPrecision;

/// Upper bound on corrective steps, against pathological inputs.
const MAX_STEP_UPS: u32 = 100;

/// Convert a target quote-currency cost and a limit price into a base
/// amount that
/// (a) is a legal step for `precision`,
/// (b) costs at least `order_size` once placed, and
/// (c) is at least `min_amount`.
pub fn amount_for_cost(
    order_size: Decimal,
    price: Decimal,
    precision: &AmountPrecision,
    min_amount: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO {
        return min_amount;
    }

    let mut amount = precision.round_down(order_size / price);
    let step = precision.step();

    let mut iterations = 0;
    while amount * price < order_size && iterations < MAX_STEP_UPS {
        amount += step;
        iterations += 1;
    }

    if amount < min_amount {
        amount = min_amount;
    }

    amount
}

/// Round a price down to the exchange's price precision.
pub fn round_price_down(price: Decimal, decimals: u32) -> Decimal {
    price.trunc_with_scale(decimals)
}

/// Decimal places for quote-currency costs: 2 for USD stablecoins,
/// 8 otherwise.
pub fn quote_decimals(quote: &str) -> u32 {
    match quote.to_ascii_uppercase().as_str() {
        "USDT" | "USDC" | "BUSD" | "TUSD" | "FDUSD" | "DAI" => 2,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_uniform_cost_invariant_steps_up() {
        // 5 USDT at 130: floor gives 0.038 (4.94 USDT), one step up restores
        // the invariant.
        let amount = amount_for_cost(
            dec!(5),
            dec!(130),
            &AmountPrecision::Step(dec!(0.001)),
            dec!(0.01),
        );
        assert_eq!(amount, dec!(0.039));
        assert!(amount * dec!(130) >= dec!(5));
    }

    #[test]
    fn test_exact_division_needs_no_correction() {
        let amount = amount_for_cost(
            dec!(10),
            dec!(2000),
            &AmountPrecision::DecimalPlaces(4),
            dec!(0.0001),
        );
        assert_eq!(amount, dec!(0.005));
    }

    #[test]
    fn test_both_precision_forms_agree() {
        let by_places = amount_for_cost(
            dec!(5),
            dec!(130),
            &AmountPrecision::DecimalPlaces(3),
            dec!(0.01),
        );
        let by_step = amount_for_cost(
            dec!(5),
            dec!(130),
            &AmountPrecision::Step(dec!(0.001)),
            dec!(0.01),
        );
        assert_eq!(by_places, by_step);
    }

    #[test]
    fn test_minimum_amount_floor() {
        // Tiny order against a huge price lands below the exchange minimum.
        let amount = amount_for_cost(
            dec!(0.5),
            dec!(60000),
            &AmountPrecision::DecimalPlaces(4),
            dec!(0.01),
        );
        assert_eq!(amount, dec!(0.01));
    }

    #[test]
    fn test_contract_holds_across_prices() {
        let precision = AmountPrecision::Step(dec!(0.001));
        for price in [dec!(0.37), dec!(17), dec!(130), dec!(1999.99)] {
            let amount = amount_for_cost(dec!(5), price, &precision, dec!(0.001));
            assert!(amount * price >= dec!(5), "cost invariant at price {price}");
            assert_eq!(amount, precision.round_down(amount), "legal step at {price}");
        }
    }

    #[test]
    fn test_round_price_down() {
        assert_eq!(round_price_down(dec!(2040.5678), 2), dec!(2040.56));
        assert_eq!(round_price_down(dec!(2040), 2), dec!(2040));
    }

    #[test]
    fn test_quote_decimals() {
        assert_eq!(quote_decimals("USDT"), 2);
        assert_eq!(quote_decimals("usdc"), 2);
        assert_eq!(quote_decimals("BTC"), 8);
    }
}
