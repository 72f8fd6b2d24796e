//! Grid strategy: initial placement and fill handling

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use log::{error, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::db::{Db, FillRecord, GridParams, LogLevel, NewOrder, Order};
use crate::errors::{EngineError, EngineResult};
use crate::gateway::Gateway;
use crate::types::{MarketInfo, OrderSide};

use super::planner::{plan_flat, plan_range, range_prices, PlannedOrder};
use super::solver::{amount_for_cost, quote_decimals, round_price_down};

/// Simultaneous placement/cancellation requests per bot, to respect
/// exchange rate limits without serializing a 30-level ladder.
pub const PLACEMENT_CONCURRENCY: usize = 10;

/// Buffer on the market pre-buy for fees and slippage.
const PREBUY_BUFFER: Decimal = dec!(1.03);

/// Result of initial order placement.
#[derive(Debug, Clone, Default)]
pub struct PlacementSummary {
    pub buy_orders: usize,
    pub sell_orders: usize,
    pub skipped_levels: usize,
    /// Quote-currency cost of the market pre-buy, when one executed
    pub prebuy_cost: Option<Decimal>,
}

impl PlacementSummary {
    pub fn total_orders(&self) -> usize {
        self.buy_orders + self.sell_orders
    }
}

/// Result of dispatching one filled order.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    /// False when the order had already left `open` (duplicate dispatch)
    /// or the bot is not active.
    pub processed: bool,
    pub counter: Option<Order>,
    pub profit: Option<Decimal>,
    pub cycle_completed: bool,
}

impl FillOutcome {
    fn skipped() -> Self {
        Self {
            processed: false,
            counter: None,
            profit: None,
            cycle_completed: false,
        }
    }
}

/// Strategy over both grid kinds. Stateless between calls; everything it
/// knows lives in the database.
pub struct GridStrategy {
    db: Db,
    gateway: Arc<Gateway>,
}

impl GridStrategy {
    pub fn new(db: Db, gateway: Arc<Gateway>) -> Self {
        Self { db, gateway }
    }

    // ------------------------------------------------------------------
    // Initial placement
    // ------------------------------------------------------------------

    /// Place the full initial ladder for a bot.
    ///
    /// Buys go out first (bounded parallelism), then one market buy
    /// acquires the base currency backing the sell half, then the sells go
    /// out. A failed market buy degrades the bot to a buy-only ladder
    /// instead of aborting; single-level failures are skipped and logged.
    pub async fn place_initial_orders(
        &self,
        bot_id: i64,
        reference_price: Decimal,
    ) -> EngineResult<PlacementSummary> {
        let bot = self.db.bot(bot_id).await?;
        let market = self.gateway.market_info(&bot.symbol).await?;
        if !market.active {
            return Err(EngineError::InvalidConfig(format!(
                "{} is not tradable",
                bot.symbol
            )));
        }
        if bot.order_size < market.min_order_cost {
            warn!(
                "bot {}: order size {} below exchange minimum cost {}",
                bot.id, bot.order_size, market.min_order_cost
            );
        }

        let ladder = match bot.params()? {
            GridParams::Range(params) => plan_range(&params, bot.order_size, &market),
            GridParams::Flat(params) => plan_flat(&params, bot.order_size, &market),
        };

        let mut summary = PlacementSummary::default();

        let buys: Vec<PlannedOrder> = ladder.buys().cloned().collect();
        let (placed, skipped) = self.place_ladder_orders(&bot, buys).await?;
        summary.buy_orders = placed;
        summary.skipped_levels += skipped;

        // Acquire base currency for the sell half in one market buy.
        let total_sell_amount = ladder.total_sell_amount();
        let mut sells_backed = total_sell_amount > Decimal::ZERO;
        if sells_backed {
            match self
                .prebuy_base(&bot, &market, total_sell_amount, reference_price)
                .await
            {
                Ok(cost) => summary.prebuy_cost = Some(cost),
                Err(error) => {
                    error!(
                        "bot {}: market pre-buy failed, running buy-only: {error}",
                        bot.id
                    );
                    self.db
                        .insert_log(
                            Some(bot.id),
                            Some(bot.user_id),
                            LogLevel::Error,
                            "market pre-buy failed, sell ladder skipped",
                            Some(json!({ "needed": total_sell_amount.to_string() })),
                        )
                        .await?;
                    sells_backed = false;
                }
            }
        }

        if sells_backed {
            let sells: Vec<PlannedOrder> = ladder.sells().cloned().collect();
            let (placed, skipped) = self.place_ladder_orders(&bot, sells).await?;
            summary.sell_orders = placed;
            summary.skipped_levels += skipped;
        }

        self.db
            .add_order_counts(bot.id, summary.buy_orders as i64, summary.sell_orders as i64)
            .await?;
        self.db.touch_bot_activity(bot.id).await?;

        info!(
            "bot {}: initial placement done, {} buys / {} sells, {} skipped",
            bot.id, summary.buy_orders, summary.sell_orders, summary.skipped_levels
        );
        Ok(summary)
    }

    /// Place one side of a ladder with bounded concurrency. Returns
    /// (placed, skipped).
    async fn place_ladder_orders(
        &self,
        bot: &crate::db::Bot,
        orders: Vec<PlannedOrder>,
    ) -> EngineResult<(usize, usize)> {
        let results: Vec<EngineResult<bool>> = stream::iter(orders)
            .map(|planned| async move { self.place_one(bot, planned).await })
            .buffer_unordered(PLACEMENT_CONCURRENCY)
            .collect()
            .await;

        let mut placed = 0;
        let mut skipped = 0;
        for result in results {
            if result? {
                placed += 1;
            } else {
                skipped += 1;
            }
        }
        Ok((placed, skipped))
    }

    /// Place and persist a single planned order. A per-level exchange
    /// failure is recorded and skipped; anything else aborts the placement.
    async fn place_one(&self, bot: &crate::db::Bot, planned: PlannedOrder) -> EngineResult<bool> {
        match self
            .gateway
            .place_limit(
                bot.user_id,
                &bot.symbol,
                planned.side,
                planned.price,
                planned.amount,
            )
            .await
        {
            Ok(placed) => {
                self.db
                    .insert_order(NewOrder {
                        bot_id: bot.id,
                        exchange_order_id: placed.exchange_order_id,
                        side: planned.side,
                        level: planned.level,
                        price: planned.price,
                        amount: planned.amount,
                        paired_order_id: None,
                    })
                    .await?;
                info!(
                    "bot {}: placed {} at level {}: {} @ {}",
                    bot.id,
                    planned.side.as_str(),
                    planned.level,
                    planned.amount,
                    planned.price
                );
                Ok(true)
            }
            Err(EngineError::Exchange(error)) => {
                warn!(
                    "bot {}: skipping {} level {}: {error}",
                    bot.id,
                    planned.side.as_str(),
                    planned.level
                );
                self.db
                    .insert_log(
                        Some(bot.id),
                        Some(bot.user_id),
                        LogLevel::Warning,
                        "order placement skipped",
                        Some(json!({
                            "side": planned.side.as_str(),
                            "level": planned.level,
                            "price": planned.price.to_string(),
                            "reason": error.to_string(),
                        })),
                    )
                    .await?;
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    /// Market-buy the base currency needed to back the sell ladder.
    /// Returns the quote cost spent.
    async fn prebuy_base(
        &self,
        bot: &crate::db::Bot,
        market: &MarketInfo,
        total_sell_amount: Decimal,
        reference_price: Decimal,
    ) -> EngineResult<Decimal> {
        let mut buy_amount = market
            .amount_precision
            .round_down(total_sell_amount * PREBUY_BUFFER);
        if buy_amount < market.min_order_amount {
            buy_amount = market.min_order_amount;
        }

        // Market buys are priced in quote currency.
        let cost = round_price_down(
            buy_amount * reference_price,
            quote_decimals(&market.quote),
        );
        if cost <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "market pre-buy cost rounds to zero".into(),
            ));
        }

        let placed = self
            .gateway
            .place_market(bot.user_id, &bot.symbol, OrderSide::Buy, cost)
            .await?;

        info!(
            "bot {}: pre-bought {} {} for {} {} (avg {})",
            bot.id,
            buy_amount,
            market.base,
            cost,
            market.quote,
            placed
                .average_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "n/a".into())
        );
        Ok(cost)
    }

    // ------------------------------------------------------------------
    // Fill handling
    // ------------------------------------------------------------------

    /// Consume a fill observed by the monitor: mark the order filled,
    /// place its counter order and attribute profit.
    ///
    /// The atomic `open -> filled` claim makes this idempotent; the second
    /// dispatch of the same fill is a no-op.
    pub async fn handle_filled_order(
        &self,
        order_id: i64,
        fee: Decimal,
        fee_currency: Option<&str>,
    ) -> EngineResult<FillOutcome> {
        let order = self.db.order(order_id).await?;
        let bot = self.db.bot(order.bot_id).await?;

        // Paused and stopped bots keep their fills unconsumed until resume.
        if !bot.status.is_active() {
            return Ok(FillOutcome::skipped());
        }

        if !self.db.claim_fill(order_id, fee, fee_currency).await? {
            return Ok(FillOutcome::skipped());
        }
        let order = self.db.order(order_id).await?;

        info!(
            "bot {}: {} order {} filled: {} @ {}",
            bot.id,
            order.side.as_str(),
            order.id,
            order.amount,
            order.price
        );

        let market = self.gateway.market_info(&bot.symbol).await?;
        let (counter, profit) = match bot.params()? {
            GridParams::Range(ref params) => self.range_counter(&bot, &order, params, &market).await?,
            GridParams::Flat(ref params) => self.flat_counter(&bot, &order, params, &market).await?,
        };

        let (new_total, new_percent, cycle_completed) = match profit {
            Some(profit) => {
                let total = bot.total_profit + profit;
                let capital = bot.capital_base();
                let percent = if capital > Decimal::ZERO {
                    (total / capital * dec!(100)).round_dp(4)
                } else {
                    bot.total_profit_percent
                };
                (Some(total), Some(percent), true)
            }
            None => (None, None, false),
        };

        let counter = self
            .db
            .record_fill_outcome(FillRecord {
                bot_id: bot.id,
                filled_order_id: order.id,
                counter,
                profit,
                new_total_profit: new_total,
                new_total_profit_percent: new_percent,
                cycle_completed,
            })
            .await?;

        if let Some(profit) = profit {
            info!("bot {}: cycle completed, profit {}", bot.id, profit);
            self.db
                .insert_log(
                    Some(bot.id),
                    Some(bot.user_id),
                    LogLevel::Info,
                    "cycle completed",
                    Some(json!({ "profit": profit.to_string() })),
                )
                .await?;
        }

        Ok(FillOutcome {
            processed: true,
            counter,
            profit,
            cycle_completed,
        })
    }

    /// Counter order for a range-grid fill: one level up after a buy, one
    /// level down after a sell, carrying the filled amount through so the
    /// cycle stays balanced in base currency.
    async fn range_counter(
        &self,
        bot: &crate::db::Bot,
        order: &Order,
        params: &crate::db::RangeParams,
        market: &MarketInfo,
    ) -> EngineResult<(Option<NewOrder>, Option<Decimal>)> {
        let prices = range_prices(params.lower_price, params.upper_price, params.grid_levels);

        let counter = match order.side {
            OrderSide::Buy => {
                let next = order.level + 1;
                if next <= params.grid_levels as i64 {
                    let price = round_price_down(prices[next as usize], market.price_precision);
                    self.place_counter(bot, OrderSide::Sell, next, price, order.amount, Some(order.id))
                        .await?
                } else {
                    None
                }
            }
            OrderSide::Sell => {
                let prev = order.level - 1;
                if prev >= 0 {
                    let price = round_price_down(prices[prev as usize], market.price_precision);
                    self.place_counter(bot, OrderSide::Buy, prev, price, order.amount, None)
                        .await?
                } else {
                    None
                }
            }
        };

        let profit = match order.side {
            OrderSide::Sell => self.paired_profit(order).await?,
            OrderSide::Buy => None,
        };

        Ok((counter, profit))
    }

    /// Counter order for a flat-grid fill: the paired sell sits one spread
    /// above a filled buy, the replacement buy one spread below a filled
    /// sell. Amounts are re-solved at the counter price so the cost
    /// invariant holds on the new order too.
    async fn flat_counter(
        &self,
        bot: &crate::db::Bot,
        order: &Order,
        params: &crate::db::FlatParams,
        market: &MarketInfo,
    ) -> EngineResult<(Option<NewOrder>, Option<Decimal>)> {
        let counter = match order.side {
            OrderSide::Buy => {
                let price =
                    round_price_down(order.price + params.flat_spread, market.price_precision);
                let amount = amount_for_cost(
                    bot.order_size,
                    price,
                    &market.amount_precision,
                    market.min_order_amount,
                );
                self.place_counter(bot, OrderSide::Sell, order.level, price, amount, Some(order.id))
                    .await?
            }
            OrderSide::Sell => {
                let price =
                    round_price_down(order.price - params.flat_spread, market.price_precision);
                if price > Decimal::ZERO {
                    let amount = amount_for_cost(
                        bot.order_size,
                        price,
                        &market.amount_precision,
                        market.min_order_amount,
                    );
                    self.place_counter(bot, OrderSide::Buy, order.level, price, amount, None)
                        .await?
                } else {
                    warn!(
                        "bot {}: counter buy below zero ({} - {}), skipping",
                        bot.id, order.price, params.flat_spread
                    );
                    None
                }
            }
        };

        let profit = match order.side {
            OrderSide::Sell => self.paired_profit(order).await?,
            OrderSide::Buy => None,
        };

        Ok((counter, profit))
    }

    /// Place a counter order on the exchange. A failure leaves the cycle
    /// half-open for the health checker instead of failing the fill.
    async fn place_counter(
        &self,
        bot: &crate::db::Bot,
        side: OrderSide,
        level: i64,
        price: Decimal,
        amount: Decimal,
        paired_order_id: Option<i64>,
    ) -> EngineResult<Option<NewOrder>> {
        match self
            .gateway
            .place_limit(bot.user_id, &bot.symbol, side, price, amount)
            .await
        {
            Ok(placed) => Ok(Some(NewOrder {
                bot_id: bot.id,
                exchange_order_id: placed.exchange_order_id,
                side,
                level,
                price,
                amount,
                paired_order_id,
            })),
            Err(EngineError::Exchange(error)) => {
                error!(
                    "bot {}: counter {} at {} failed: {error}",
                    bot.id,
                    side.as_str(),
                    price
                );
                self.db
                    .insert_log(
                        Some(bot.id),
                        Some(bot.user_id),
                        LogLevel::Error,
                        "counter order failed",
                        Some(json!({
                            "side": side.as_str(),
                            "price": price.to_string(),
                            "reason": error.to_string(),
                        })),
                    )
                    .await?;
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Realized profit of a paired cycle, net of both fees.
    async fn paired_profit(&self, sell: &Order) -> EngineResult<Option<Decimal>> {
        let Some(paired_id) = sell.paired_order_id else {
            return Ok(None);
        };
        let buy = self.db.order(paired_id).await?;

        let revenue = sell.price * sell.amount - sell.fee;
        let cost = buy.price * buy.amount + buy.fee;
        Ok(Some(revenue - cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FlatParams, NewBot, RangeParams};
    use crate::errors::ExchangeError;
    use crate::gateway::api::mock::MockExchange;
    use crate::security::CredentialCipher;
    use crate::types::{BotStatus, OrderStatus};
    use std::time::Duration;

    struct Harness {
        db: Db,
        mock: Arc<MockExchange>,
        strategy: GridStrategy,
        user_id: i64,
    }

    async fn harness(symbol: &str, ticker: Decimal) -> Harness {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let cipher = CredentialCipher::from_hex_key(&CredentialCipher::generate_key()).unwrap();

        let user = db.upsert_user(1001, Some("alice")).await.unwrap();
        let (k, s) = cipher.encrypt_credentials("key", "secret").unwrap();
        db.set_credentials(user.id, &k, &s).await.unwrap();

        let mock = Arc::new(MockExchange::with_market(symbol, ticker).await);
        mock.set_balance("USDT", dec!(10000)).await;
        let gateway = Arc::new(
            Gateway::new(mock.clone(), db.clone(), cipher)
                .with_retry_config(2, Duration::from_millis(1)),
        );

        Harness {
            strategy: GridStrategy::new(db.clone(), gateway),
            db,
            mock,
            user_id: user.id,
        }
    }

    async fn range_bot(h: &Harness) -> crate::db::Bot {
        h.db.insert_bot(NewBot::range(
            h.user_id,
            "ETH/USDT",
            RangeParams {
                lower_price: dec!(1800),
                upper_price: dec!(2200),
                grid_levels: 10,
                investment_amount: dec!(100),
            },
            dec!(10),
        ))
        .await
        .unwrap()
    }

    async fn flat_bot(h: &Harness) -> crate::db::Bot {
        h.db.insert_bot(NewBot::flat(
            h.user_id,
            "ETH/USDT",
            FlatParams {
                starting_price: dec!(100),
                flat_spread: dec!(2),
                flat_increment: dec!(1),
                buy_orders_count: 3,
                sell_orders_count: 3,
            },
            dec!(10),
        ))
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_initial_placement_range() {
        let h = harness("ETH/USDT", dec!(2000)).await;
        let bot = range_bot(&h).await;

        let summary = h
            .strategy
            .place_initial_orders(bot.id, dec!(2000))
            .await
            .unwrap();

        assert_eq!(summary.buy_orders, 5);
        assert_eq!(summary.sell_orders, 5);
        assert_eq!(summary.skipped_levels, 0);
        assert!(summary.prebuy_cost.is_some());

        // 10 resting limit orders plus the base bought by the market order.
        assert_eq!(h.mock.open_order_count().await, 10);
        assert!(h.mock.balance_of("ETH").await > Decimal::ZERO);

        let open = h.db.open_orders(bot.id).await.unwrap();
        assert_eq!(open.len(), 10);
        for order in &open {
            assert!(order.price * order.amount >= dec!(10));
        }

        let bot = h.db.bot(bot.id).await.unwrap();
        assert_eq!(bot.total_buy_orders, 5);
        assert_eq!(bot.total_sell_orders, 5);
    }

    #[tokio::test]
    async fn test_market_prebuy_failure_degrades_to_buy_only() {
        let h = harness("ETH/USDT", dec!(2000)).await;
        let bot = range_bot(&h).await;

        h.mock
            .fail_market_orders_with(Some(ExchangeError::InsufficientFunds("no funds".into())))
            .await;

        let summary = h
            .strategy
            .place_initial_orders(bot.id, dec!(2000))
            .await
            .unwrap();

        assert_eq!(summary.buy_orders, 5);
        assert_eq!(summary.sell_orders, 0);
        assert!(summary.prebuy_cost.is_none());
        assert_eq!(h.db.open_orders(bot.id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_per_level_failures_skip_not_abort() {
        let h = harness("ETH/USDT", dec!(2000)).await;
        let bot = range_bot(&h).await;

        h.mock
            .fail_limit_orders_with(Some(ExchangeError::InvalidOrder("bad price".into())))
            .await;

        let summary = h
            .strategy
            .place_initial_orders(bot.id, dec!(2000))
            .await
            .unwrap();

        assert_eq!(summary.total_orders(), 0);
        assert_eq!(summary.skipped_levels, 10);
        // Every skip leaves a warning log behind.
        let logs = h.db.logs_for_bot(bot.id, 20).await.unwrap();
        assert!(logs.len() >= 10);
    }

    #[tokio::test]
    async fn test_range_buy_fill_creates_paired_sell_one_level_up() {
        let h = harness("ETH/USDT", dec!(2000)).await;
        let bot = range_bot(&h).await;
        h.strategy
            .place_initial_orders(bot.id, dec!(2000))
            .await
            .unwrap();

        let filled_buy = h
            .db
            .open_orders(bot.id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.side == OrderSide::Buy && o.price == dec!(1960))
            .expect("buy at 1960");

        h.mock.fill_order(&filled_buy.exchange_order_id).await;
        let outcome = h
            .strategy
            .handle_filled_order(filled_buy.id, dec!(0.01), Some("USDT"))
            .await
            .unwrap();

        assert!(outcome.processed);
        let counter = outcome.counter.expect("counter sell");
        assert_eq!(counter.side, OrderSide::Sell);
        assert_eq!(counter.price, dec!(2000));
        assert_eq!(counter.level, 5);
        assert_eq!(counter.amount, filled_buy.amount);
        assert_eq!(counter.paired_order_id, Some(filled_buy.id));

        // Buys produce no profit yet.
        assert!(outcome.profit.is_none());
        let filled = h.db.order(filled_buy.id).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.fee, dec!(0.01));
    }

    #[tokio::test]
    async fn test_double_dispatch_produces_one_counter() {
        let h = harness("ETH/USDT", dec!(2000)).await;
        let bot = range_bot(&h).await;
        h.strategy
            .place_initial_orders(bot.id, dec!(2000))
            .await
            .unwrap();

        let buy = h
            .db
            .open_orders(bot.id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.side == OrderSide::Buy && o.price == dec!(1960))
            .unwrap();
        h.mock.fill_order(&buy.exchange_order_id).await;

        let first = h
            .strategy
            .handle_filled_order(buy.id, Decimal::ZERO, None)
            .await
            .unwrap();
        let second = h
            .strategy
            .handle_filled_order(buy.id, Decimal::ZERO, None)
            .await
            .unwrap();

        assert!(first.processed);
        assert!(!second.processed);
        assert!(second.counter.is_none());

        let sells_at_2000 = h
            .db
            .open_orders(bot.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.price == dec!(2000))
            .count();
        assert_eq!(sells_at_2000, 1);
    }

    #[tokio::test]
    async fn test_flat_cycle_realizes_profit() {
        let h = harness("ETH/USDT", dec!(100)).await;
        let bot = flat_bot(&h).await;
        h.strategy
            .place_initial_orders(bot.id, dec!(100))
            .await
            .unwrap();

        // Buy at 99 fills; a sell appears one spread above at 101.
        let buy = h
            .db
            .open_orders(bot.id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.side == OrderSide::Buy && o.price == dec!(99))
            .unwrap();
        h.mock.fill_order(&buy.exchange_order_id).await;
        let outcome = h
            .strategy
            .handle_filled_order(buy.id, Decimal::ZERO, None)
            .await
            .unwrap();

        let sell = outcome.counter.expect("paired sell");
        assert_eq!(sell.price, dec!(101));
        assert_eq!(sell.paired_order_id, Some(buy.id));
        // Amount re-solved against the sell price keeps the cost invariant.
        assert!(sell.price * sell.amount >= dec!(10));

        // Later the sell at 101 fills, completing the cycle.
        h.mock.fill_order(&sell.exchange_order_id).await;
        let outcome = h
            .strategy
            .handle_filled_order(sell.id, Decimal::ZERO, None)
            .await
            .unwrap();

        let expected_profit = dec!(101) * sell.amount - dec!(99) * buy.amount;
        assert_eq!(outcome.profit, Some(expected_profit));
        assert!(outcome.cycle_completed);

        // The replacement buy lands a spread below the sell.
        let counter_buy = outcome.counter.expect("replacement buy");
        assert_eq!(counter_buy.side, OrderSide::Buy);
        assert_eq!(counter_buy.price, dec!(99));

        let bot = h.db.bot(bot.id).await.unwrap();
        assert_eq!(bot.completed_cycles, 1);
        assert_eq!(bot.total_profit, expected_profit);
        // Flat percent measures against (buys + sells) * order_size = 60.
        assert_eq!(
            bot.total_profit_percent,
            (expected_profit / dec!(60) * dec!(100)).round_dp(4)
        );

        let sell_row = h.db.order(sell.id).await.unwrap();
        assert_eq!(sell_row.profit, Some(expected_profit));
    }

    #[tokio::test]
    async fn test_flat_sell_near_zero_skips_counter_buy() {
        let h = harness("ETH/USDT", dec!(2)).await;
        let bot = h
            .db
            .insert_bot(NewBot::flat(
                h.user_id,
                "ETH/USDT",
                FlatParams {
                    starting_price: dec!(1),
                    flat_spread: dec!(2),
                    flat_increment: dec!(1),
                    buy_orders_count: 1,
                    sell_orders_count: 1,
                },
                dec!(1),
            ))
            .await
            .unwrap();

        // A sell resting at 2; its counter buy would sit at 2 - 2 = 0.
        let sell = h
            .db
            .insert_order(NewOrder {
                bot_id: bot.id,
                exchange_order_id: "S1".into(),
                side: OrderSide::Sell,
                level: 1,
                price: dec!(2),
                amount: dec!(0.5),
                paired_order_id: None,
            })
            .await
            .unwrap();

        let outcome = h
            .strategy
            .handle_filled_order(sell.id, Decimal::ZERO, None)
            .await
            .unwrap();

        assert!(outcome.processed);
        assert!(outcome.counter.is_none());
    }

    #[tokio::test]
    async fn test_paused_bot_leaves_fill_unconsumed() {
        let h = harness("ETH/USDT", dec!(2000)).await;
        let bot = range_bot(&h).await;
        h.strategy
            .place_initial_orders(bot.id, dec!(2000))
            .await
            .unwrap();
        h.db.set_bot_status(bot.id, BotStatus::Paused).await.unwrap();

        let buy = h
            .db
            .open_orders(bot.id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.side == OrderSide::Buy)
            .unwrap();

        let outcome = h
            .strategy
            .handle_filled_order(buy.id, Decimal::ZERO, None)
            .await
            .unwrap();

        assert!(!outcome.processed);
        // The order is still open in the store, waiting for resume.
        assert_eq!(h.db.order(buy.id).await.unwrap().status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_range_sell_at_bottom_level_has_no_counter() {
        let h = harness("ETH/USDT", dec!(2000)).await;
        let bot = range_bot(&h).await;

        let sell = h
            .db
            .insert_order(NewOrder {
                bot_id: bot.id,
                exchange_order_id: "S0".into(),
                side: OrderSide::Sell,
                level: 0,
                price: dec!(1800),
                amount: dec!(0.005),
                paired_order_id: None,
            })
            .await
            .unwrap();

        let outcome = h
            .strategy
            .handle_filled_order(sell.id, Decimal::ZERO, None)
            .await
            .unwrap();

        assert!(outcome.processed);
        assert!(outcome.counter.is_none());
    }
}
