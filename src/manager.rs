//! Bot lifecycle management
//!
//! The manager is the sole mutator of bot lifecycle state. Creation places
//! the initial ladder immediately; stop cancels the book (including
//! exchange-side orphans) with bounded concurrency; restore replays fills
//! that landed while the process was down.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use log::{error, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::config::Settings;
use crate::db::{Bot, Db, FlatParams, LogLevel, NewBot, Order, RangeParams};
use crate::errors::{EngineError, EngineResult};
use crate::gateway::Gateway;
use crate::grid::strategy::{GridStrategy, PlacementSummary, PLACEMENT_CONCURRENCY};
use crate::monitor::OrderMonitor;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::types::{split_symbol, BotStatus, GridKind, OrderSide, OrderStatus};

/// Minimum width of a range grid, relative to its lower bound.
const MIN_RANGE_SPAN_PERCENT: Decimal = dec!(2);

/// A successfully created and started bot.
#[derive(Debug)]
pub struct BotCreated {
    pub bot: Bot,
    pub summary: PlacementSummary,
}

/// What `stop` did.
#[derive(Debug, Clone)]
pub struct StopSummary {
    pub cancelled_orders: usize,
    pub final_profit: Decimal,
    pub completed_cycles: i64,
    pub runtime: Option<chrono::Duration>,
}

/// One row of the bot list surface.
#[derive(Debug, Clone)]
pub struct BotSummary {
    pub id: i64,
    pub symbol: String,
    pub grid_kind: GridKind,
    pub status: BotStatus,
    pub total_profit: Decimal,
    pub total_profit_percent: Decimal,
    pub completed_cycles: i64,
}

/// Full bot detail surface: configuration plus live statistics.
#[derive(Debug, Clone)]
pub struct BotDetails {
    pub bot: Bot,
    pub open_orders: i64,
    pub runtime: Option<chrono::Duration>,
    pub avg_profit_per_day: Decimal,
}

pub struct BotManager {
    db: Db,
    gateway: Arc<Gateway>,
    strategy: Arc<GridStrategy>,
    monitor: Arc<OrderMonitor>,
    sink: Arc<dyn NotificationSink>,
    settings: Settings,
}

impl BotManager {
    pub fn new(
        db: Db,
        gateway: Arc<Gateway>,
        strategy: Arc<GridStrategy>,
        monitor: Arc<OrderMonitor>,
        sink: Arc<dyn NotificationSink>,
        settings: Settings,
    ) -> Self {
        Self {
            db,
            gateway,
            strategy,
            monitor,
            sink,
            settings,
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create and start a range-grid bot. The uniform per-order cost is
    /// `investment / levels`.
    pub async fn create_range_bot(
        &self,
        user_id: i64,
        symbol: &str,
        lower_price: Decimal,
        upper_price: Decimal,
        grid_levels: u32,
        investment_amount: Decimal,
    ) -> EngineResult<BotCreated> {
        split_symbol(symbol)?;
        self.validate_range(lower_price, upper_price, grid_levels, investment_amount)?;
        self.require_quote_balance(user_id, symbol, investment_amount)
            .await?;

        let ticker = self.gateway.ticker(symbol).await?;
        if ticker < lower_price || ticker > upper_price {
            warn!(
                "range bot on {symbol}: ticker {ticker} outside [{lower_price}, {upper_price}]"
            );
        }

        let order_size = investment_amount / Decimal::from(grid_levels);
        let bot = self
            .db
            .insert_bot(NewBot::range(
                user_id,
                symbol,
                RangeParams {
                    lower_price,
                    upper_price,
                    grid_levels,
                    investment_amount,
                },
                order_size,
            ))
            .await?;

        info!(
            "user {user_id}: created range bot {} on {symbol}, levels={grid_levels}, investment={investment_amount}",
            bot.id
        );
        self.start_new_bot(bot, ticker).await
    }

    /// Create and start a flat-grid bot. A zero starting price means "use
    /// the live ticker".
    #[allow(clippy::too_many_arguments)]
    pub async fn create_flat_bot(
        &self,
        user_id: i64,
        symbol: &str,
        starting_price: Decimal,
        flat_spread: Decimal,
        flat_increment: Decimal,
        buy_orders_count: u32,
        sell_orders_count: u32,
        order_size: Decimal,
    ) -> EngineResult<BotCreated> {
        split_symbol(symbol)?;
        if starting_price < Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "starting price must not be negative".into(),
            ));
        }
        if flat_spread <= Decimal::ZERO || flat_increment <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "spread and increment must be positive".into(),
            ));
        }
        if buy_orders_count == 0 || sell_orders_count == 0 {
            return Err(EngineError::InvalidConfig(
                "both ladder sides need at least one order".into(),
            ));
        }
        if order_size <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "order size must be positive".into(),
            ));
        }

        let capital =
            Decimal::from(buy_orders_count + sell_orders_count) * order_size;
        self.require_quote_balance(user_id, symbol, capital).await?;

        let reference_price = if starting_price == Decimal::ZERO {
            self.gateway.ticker(symbol).await?
        } else {
            starting_price
        };

        let bot = self
            .db
            .insert_bot(NewBot::flat(
                user_id,
                symbol,
                FlatParams {
                    starting_price: reference_price,
                    flat_spread,
                    flat_increment,
                    buy_orders_count,
                    sell_orders_count,
                },
                order_size,
            ))
            .await?;

        info!(
            "user {user_id}: created flat bot {} on {symbol}, start={reference_price}, spread={flat_spread}, increment={flat_increment}",
            bot.id
        );
        self.start_new_bot(bot, reference_price).await
    }

    /// Run initial placement for a freshly inserted bot. Zero placed orders
    /// means the bot failed: it is stopped and the error surfaced.
    async fn start_new_bot(&self, bot: Bot, reference_price: Decimal) -> EngineResult<BotCreated> {
        let summary = match self
            .strategy
            .place_initial_orders(bot.id, reference_price)
            .await
        {
            Ok(summary) => summary,
            Err(error) => {
                error!("bot {}: initial placement failed: {error}", bot.id);
                self.db.mark_bot_stopped(bot.id).await?;
                return Err(error);
            }
        };

        if summary.total_orders() == 0 {
            self.db.mark_bot_stopped(bot.id).await?;
            self.db
                .insert_log(
                    Some(bot.id),
                    Some(bot.user_id),
                    LogLevel::Error,
                    "initial placement produced no orders, bot stopped",
                    None,
                )
                .await?;
            return Err(EngineError::InvalidState(format!(
                "bot {} placed no initial orders",
                bot.id
            )));
        }

        self.db
            .insert_log(
                Some(bot.id),
                Some(bot.user_id),
                LogLevel::Info,
                "bot started",
                Some(json!({
                    "buy_orders": summary.buy_orders,
                    "sell_orders": summary.sell_orders,
                    "reference_price": reference_price.to_string(),
                })),
            )
            .await?;

        self.monitor.watch(bot.id).await;

        let bot = self.db.bot(bot.id).await?;
        Ok(BotCreated { bot, summary })
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    /// Start a stopped bot again: verify funding, re-check the ticker
    /// against the configured range, and rebuild the ladder from scratch.
    pub async fn start(&self, bot_id: i64) -> EngineResult<PlacementSummary> {
        let bot = self.db.bot(bot_id).await?;
        if bot.status != BotStatus::Stopped {
            return Err(EngineError::InvalidState(format!(
                "bot {bot_id} is {}, only stopped bots start",
                bot.status.as_str()
            )));
        }

        self.require_quote_balance(bot.user_id, &bot.symbol, bot.capital_base())
            .await?;

        let ticker = self.gateway.ticker(&bot.symbol).await?;
        let reference_price = match bot.params()? {
            crate::db::GridParams::Range(params) => {
                if ticker < params.lower_price || ticker > params.upper_price {
                    warn!(
                        "bot {bot_id}: ticker {ticker} outside [{}, {}]",
                        params.lower_price, params.upper_price
                    );
                }
                ticker
            }
            crate::db::GridParams::Flat(params) => {
                if params.starting_price > Decimal::ZERO {
                    params.starting_price
                } else {
                    ticker
                }
            }
        };

        self.db.mark_bot_started(bot_id).await?;
        let created = self.start_new_bot(self.db.bot(bot_id).await?, reference_price).await?;
        Ok(created.summary)
    }

    /// Freeze counter-order creation: the supervisor exits, open orders
    /// stay on the book, and anything that fills meanwhile stays `open` in
    /// the store until the first poll after resume consumes it.
    pub async fn pause(&self, bot_id: i64) -> EngineResult<()> {
        let bot = self.db.bot(bot_id).await?;
        if bot.status != BotStatus::Active {
            return Err(EngineError::InvalidState(format!(
                "bot {bot_id} is {}, only active bots pause",
                bot.status.as_str()
            )));
        }

        self.db.set_bot_status(bot_id, BotStatus::Paused).await?;
        self.monitor.unwatch(bot_id).await;
        info!("bot {bot_id}: paused");
        Ok(())
    }

    pub async fn resume(&self, bot_id: i64) -> EngineResult<()> {
        let bot = self.db.bot(bot_id).await?;
        if bot.status != BotStatus::Paused {
            return Err(EngineError::InvalidState(format!(
                "bot {bot_id} is {}, only paused bots resume",
                bot.status.as_str()
            )));
        }

        self.db.set_bot_status(bot_id, BotStatus::Active).await?;
        self.monitor.watch(bot_id).await;
        info!("bot {bot_id}: resumed");
        Ok(())
    }

    /// Stop a bot: cancel every open order (bounded concurrency), sweep
    /// exchange-side orphans, optionally market-dump the residual base
    /// balance, and mark the bot stopped.
    pub async fn stop(&self, bot_id: i64, sell_all: bool) -> EngineResult<StopSummary> {
        let bot = self.db.bot(bot_id).await?;
        self.monitor.unwatch(bot_id).await;

        let open_orders = self.db.open_orders(bot_id).await?;
        let mut cancelled = self.cancel_persisted(&bot, open_orders).await;
        cancelled += self.cancel_orphans(&bot).await?;

        if sell_all {
            if let Err(error) = self.dump_base_balance(&bot).await {
                // Dump failures must not wedge the stop.
                error!("bot {bot_id}: sell-all failed: {error}");
            }
        }

        self.db.mark_bot_stopped(bot_id).await?;
        let bot = self.db.bot(bot_id).await?;
        let runtime = match (bot.started_at, bot.stopped_at) {
            (Some(started), Some(stopped)) => Some(stopped - started),
            _ => None,
        };

        self.db
            .insert_log(
                Some(bot_id),
                Some(bot.user_id),
                LogLevel::Info,
                "bot stopped",
                Some(json!({
                    "cancelled_orders": cancelled,
                    "sell_all": sell_all,
                    "final_profit": bot.total_profit.to_string(),
                })),
            )
            .await?;
        self.sink
            .publish(Notification::new(
                bot.user_id,
                Some(bot_id),
                NotificationKind::BotStopped,
                json!({
                    "symbol": bot.symbol,
                    "cancelled_orders": cancelled,
                    "total_profit": bot.total_profit.to_string(),
                    "completed_cycles": bot.completed_cycles,
                }),
            ))
            .await;

        info!("bot {bot_id}: stopped, {cancelled} orders cancelled");
        Ok(StopSummary {
            cancelled_orders: cancelled,
            final_profit: bot.total_profit,
            completed_cycles: bot.completed_cycles,
            runtime,
        })
    }

    /// Cancel the persisted open orders of a bot, ten at a time.
    async fn cancel_persisted(&self, bot: &Bot, orders: Vec<Order>) -> usize {
        let results: Vec<bool> = stream::iter(orders)
            .map(|order| async move {
                match self
                    .gateway
                    .cancel(bot.user_id, &bot.symbol, &order.exchange_order_id)
                    .await
                {
                    Ok(()) => {
                        // A fill may have won the race; only open rows flip.
                        self.db.mark_order_cancelled(order.id).await.unwrap_or(false)
                    }
                    Err(error) => {
                        warn!(
                            "bot {}: failed to cancel order {}: {error}",
                            bot.id, order.exchange_order_id
                        );
                        false
                    }
                }
            })
            .buffer_unordered(PLACEMENT_CONCURRENCY)
            .collect()
            .await;

        results.into_iter().filter(|ok| *ok).count()
    }

    /// Cancel exchange-side orders on the bot's symbol that none of the
    /// user's bots know about.
    async fn cancel_orphans(&self, bot: &Bot) -> EngineResult<usize> {
        let exchange_orders = match self
            .gateway
            .open_orders(bot.user_id, Some(&bot.symbol))
            .await
        {
            Ok(orders) => orders,
            Err(error) => {
                warn!("bot {}: orphan scan failed: {error}", bot.id);
                return Ok(0);
            }
        };

        let known: HashSet<String> = self
            .db
            .open_order_ids_for_symbol(bot.user_id, &bot.symbol)
            .await?
            .into_iter()
            .collect();

        let orphans: Vec<String> = exchange_orders
            .into_iter()
            .filter(|o| !known.contains(&o.exchange_order_id))
            .map(|o| o.exchange_order_id)
            .collect();

        if orphans.is_empty() {
            return Ok(0);
        }
        info!("bot {}: cancelling {} orphaned orders", bot.id, orphans.len());

        let results: Vec<bool> = stream::iter(orphans)
            .map(|order_id| async move {
                match self.gateway.cancel(bot.user_id, &bot.symbol, &order_id).await {
                    Ok(()) => true,
                    Err(error) => {
                        warn!("bot {}: orphan cancel {order_id} failed: {error}", bot.id);
                        false
                    }
                }
            })
            .buffer_unordered(PLACEMENT_CONCURRENCY)
            .collect()
            .await;

        Ok(results.into_iter().filter(|ok| *ok).count())
    }

    /// Market-sell whatever base currency the account still holds, if it
    /// clears the exchange minimum.
    async fn dump_base_balance(&self, bot: &Bot) -> EngineResult<()> {
        let market = self.gateway.market_info(&bot.symbol).await?;
        let balances = self.gateway.balance(bot.user_id).await?;
        let base_balance = balances
            .get(market.base.as_str())
            .copied()
            .unwrap_or(Decimal::ZERO);

        let amount = market.amount_precision.round_down(base_balance);
        if amount < market.min_order_amount {
            return Ok(());
        }

        let placed = self
            .gateway
            .place_market(bot.user_id, &bot.symbol, OrderSide::Sell, amount)
            .await?;
        info!(
            "bot {}: sold {} {} at market (avg {})",
            bot.id,
            amount,
            market.base,
            placed
                .average_price
                .map(|p| p.to_string())
                .unwrap_or_else(|| "n/a".into())
        );
        Ok(())
    }

    /// Delete a bot and everything it owns. A running bot is stopped first.
    pub async fn delete(&self, bot_id: i64) -> EngineResult<()> {
        let bot = self.db.bot(bot_id).await?;
        if bot.status != BotStatus::Stopped {
            self.stop(bot_id, false).await?;
        }

        self.db.delete_bot(bot_id).await?;
        info!("bot {bot_id}: deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Restart recovery
    // ------------------------------------------------------------------

    /// Re-adopt every active bot after a process restart: replay fills
    /// that happened while we were down, then resume monitoring.
    pub async fn restore_after_restart(&self) -> EngineResult<usize> {
        let bots = self.db.active_bots().await?;
        let mut restored = 0;

        for bot in bots {
            match self.sync_bot_orders(&bot).await {
                Ok(()) => {
                    self.db
                        .insert_log(
                            Some(bot.id),
                            Some(bot.user_id),
                            LogLevel::Info,
                            "bot restored after restart",
                            None,
                        )
                        .await?;
                    self.monitor.watch(bot.id).await;
                    restored += 1;
                }
                Err(error) => {
                    error!("bot {}: restore failed: {error}", bot.id);
                }
            }
        }

        info!("restored {restored} active bots");
        Ok(restored)
    }

    /// Compare persisted open orders against the exchange and consume any
    /// that filled while the process was down.
    async fn sync_bot_orders(&self, bot: &Bot) -> EngineResult<()> {
        for order in self.db.open_orders(bot.id).await? {
            match self
                .gateway
                .order_status(bot.user_id, &bot.symbol, &order.exchange_order_id)
                .await
            {
                Ok(update) if update.status == OrderStatus::Filled => {
                    info!(
                        "bot {}: order {} filled while offline, processing",
                        bot.id, order.id
                    );
                    self.strategy
                        .handle_filled_order(order.id, update.fee, update.fee_currency.as_deref())
                        .await?;
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        "bot {}: could not sync order {}: {error}",
                        bot.id, order.exchange_order_id
                    );
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read surfaces
    // ------------------------------------------------------------------

    pub async fn list_bots(&self, user_id: i64) -> EngineResult<Vec<BotSummary>> {
        Ok(self
            .db
            .bots_by_user(user_id)
            .await?
            .into_iter()
            .map(|bot| BotSummary {
                id: bot.id,
                symbol: bot.symbol,
                grid_kind: bot.grid_kind,
                status: bot.status,
                total_profit: bot.total_profit,
                total_profit_percent: bot.total_profit_percent,
                completed_cycles: bot.completed_cycles,
            })
            .collect())
    }

    pub async fn bot_details(&self, bot_id: i64) -> EngineResult<BotDetails> {
        let bot = self.db.bot(bot_id).await?;
        let open_orders = self.db.count_open_orders(bot_id).await?;

        let runtime = bot.started_at.map(|started| {
            bot.stopped_at.unwrap_or_else(Utc::now) - started
        });
        let avg_profit_per_day = match runtime {
            Some(runtime) if runtime.num_seconds() > 0 => {
                let days = Decimal::from(runtime.num_seconds()) / dec!(86400);
                if days > Decimal::ZERO {
                    (bot.total_profit / days).round_dp(8)
                } else {
                    Decimal::ZERO
                }
            }
            _ => Decimal::ZERO,
        };

        Ok(BotDetails {
            bot,
            open_orders,
            runtime,
            avg_profit_per_day,
        })
    }

    /// Balance pass-through for the UI.
    pub async fn balance(
        &self,
        user_id: i64,
    ) -> EngineResult<std::collections::HashMap<String, Decimal>> {
        self.gateway.balance(user_id).await
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn validate_range(
        &self,
        lower_price: Decimal,
        upper_price: Decimal,
        grid_levels: u32,
        investment_amount: Decimal,
    ) -> EngineResult<()> {
        if lower_price <= Decimal::ZERO || upper_price <= Decimal::ZERO {
            return Err(EngineError::InvalidConfig(
                "price bounds must be positive".into(),
            ));
        }
        if lower_price >= upper_price {
            return Err(EngineError::InvalidConfig(
                "lower price must be below upper price".into(),
            ));
        }

        let span_percent = (upper_price - lower_price) / lower_price * dec!(100);
        if span_percent < MIN_RANGE_SPAN_PERCENT {
            return Err(EngineError::InvalidConfig(format!(
                "price range too narrow: {span_percent:.2}% < {MIN_RANGE_SPAN_PERCENT}%"
            )));
        }

        if grid_levels % 2 != 0 {
            return Err(EngineError::InvalidConfig(
                "grid level count must be even".into(),
            ));
        }
        if grid_levels < self.settings.min_grid_levels
            || grid_levels > self.settings.max_grid_levels
        {
            return Err(EngineError::InvalidConfig(format!(
                "grid levels must be within [{}, {}]",
                self.settings.min_grid_levels, self.settings.max_grid_levels
            )));
        }

        if investment_amount < Decimal::from(self.settings.min_investment_usdt) {
            return Err(EngineError::InvalidConfig(format!(
                "minimum investment is {}",
                self.settings.min_investment_usdt
            )));
        }
        Ok(())
    }

    /// Verify the user can fund the ladder before any order goes out.
    async fn require_quote_balance(
        &self,
        user_id: i64,
        symbol: &str,
        required: Decimal,
    ) -> EngineResult<()> {
        let (_, quote) = split_symbol(symbol)?;
        let balances = self.gateway.balance(user_id).await?;
        let available = balances.get(quote).copied().unwrap_or(Decimal::ZERO);

        if available < required {
            return Err(EngineError::InsufficientBalance {
                available,
                required,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::api::mock::MockExchange;
    use crate::notify::mock::MemorySink;
    use crate::security::CredentialCipher;
    use std::time::Duration;

    struct Harness {
        db: Db,
        mock: Arc<MockExchange>,
        manager: BotManager,
        monitor: Arc<OrderMonitor>,
        sink: Arc<MemorySink>,
        user_id: i64,
    }

    async fn harness() -> Harness {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let cipher = CredentialCipher::from_hex_key(&CredentialCipher::generate_key()).unwrap();

        let user = db.upsert_user(1001, Some("alice")).await.unwrap();
        let (k, s) = cipher.encrypt_credentials("key", "secret").unwrap();
        db.set_credentials(user.id, &k, &s).await.unwrap();

        let mock = Arc::new(MockExchange::with_market("ETH/USDT", dec!(2000)).await);
        mock.set_balance("USDT", dec!(10000)).await;

        let gateway = Arc::new(
            Gateway::new(mock.clone(), db.clone(), cipher)
                .with_retry_config(2, Duration::from_millis(1)),
        );
        let strategy = Arc::new(GridStrategy::new(db.clone(), gateway.clone()));
        let sink = Arc::new(MemorySink::new());
        let monitor = Arc::new(OrderMonitor::new(
            db.clone(),
            gateway.clone(),
            strategy.clone(),
            sink.clone(),
            Duration::from_millis(20),
            dec!(5),
        ));

        let manager = BotManager::new(
            db.clone(),
            gateway,
            strategy,
            monitor.clone(),
            sink.clone(),
            Settings::default(),
        );

        Harness {
            db,
            mock,
            manager,
            monitor,
            sink,
            user_id: user.id,
        }
    }

    async fn create_default_range_bot(h: &Harness) -> BotCreated {
        h.manager
            .create_range_bot(h.user_id, "ETH/USDT", dec!(1800), dec!(2200), 10, dec!(100))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_range_bot_places_ladder_and_watches() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;

        assert_eq!(created.bot.status, BotStatus::Active);
        assert_eq!(created.bot.order_size, dec!(10));
        assert_eq!(created.summary.buy_orders, 5);
        assert_eq!(created.summary.sell_orders, 5);
        assert!(h.monitor.is_watching(created.bot.id).await);

        h.monitor.unwatch(created.bot.id).await;
    }

    #[tokio::test]
    async fn test_create_range_bot_validation() {
        let h = harness().await;

        // Odd level count
        let odd = h
            .manager
            .create_range_bot(h.user_id, "ETH/USDT", dec!(1800), dec!(2200), 9, dec!(100))
            .await;
        assert!(matches!(odd, Err(EngineError::InvalidConfig(_))));

        // Range narrower than 2%
        let narrow = h
            .manager
            .create_range_bot(h.user_id, "ETH/USDT", dec!(2000), dec!(2010), 10, dec!(100))
            .await;
        assert!(matches!(narrow, Err(EngineError::InvalidConfig(_))));

        // Below minimum investment
        let poor = h
            .manager
            .create_range_bot(h.user_id, "ETH/USDT", dec!(1800), dec!(2200), 10, dec!(10))
            .await;
        assert!(matches!(poor, Err(EngineError::InvalidConfig(_))));

        // Malformed pair
        let pair = h
            .manager
            .create_range_bot(h.user_id, "ETHUSDT", dec!(1800), dec!(2200), 10, dec!(100))
            .await;
        assert!(matches!(pair, Err(EngineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_create_checks_quote_balance_first() {
        let h = harness().await;
        h.mock.set_balance("USDT", dec!(30)).await;

        let result = h
            .manager
            .create_range_bot(h.user_id, "ETH/USDT", dec!(1800), dec!(2200), 10, dec!(100))
            .await;
        assert!(matches!(
            result,
            Err(EngineError::InsufficientBalance { .. })
        ));
        // Nothing reached the exchange.
        assert_eq!(h.mock.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_flat_bot_zero_start_uses_ticker() {
        let h = harness().await;

        let created = h
            .manager
            .create_flat_bot(
                h.user_id,
                "ETH/USDT",
                Decimal::ZERO,
                dec!(2),
                dec!(1),
                3,
                3,
                dec!(10),
            )
            .await
            .unwrap();

        assert_eq!(created.bot.starting_price, Some(dec!(2000)));
        assert_eq!(created.summary.total_orders(), 6);
        h.monitor.unwatch(created.bot.id).await;
    }

    #[tokio::test]
    async fn test_stop_cancels_everything_including_orphans() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;
        let bot_id = created.bot.id;

        // An orphan the store does not know about.
        let creds = crate::gateway::Credentials {
            api_key: "k".into(),
            api_secret: "s".into(),
        };
        use crate::gateway::ExchangeApi;
        h.mock
            .create_limit_order(&creds, "ETH/USDT", OrderSide::Sell, dec!(2190), dec!(0.01))
            .await
            .unwrap();
        assert_eq!(h.mock.open_order_count().await, 11);

        let summary = h.manager.stop(bot_id, false).await.unwrap();

        assert_eq!(summary.cancelled_orders, 11);
        assert_eq!(h.mock.open_order_count().await, 0);
        assert_eq!(h.db.count_open_orders(bot_id).await.unwrap(), 0);

        let bot = h.db.bot(bot_id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Stopped);
        assert!(bot.stopped_at.is_some());
        assert!(!h.monitor.is_watching(bot_id).await);
        assert_eq!(
            h.sink.events_of_kind(NotificationKind::BotStopped).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_sixty_orders_bounded() {
        let h = harness().await;
        h.mock.set_balance("USDT", dec!(100000)).await;

        let created = h
            .manager
            .create_flat_bot(
                h.user_id,
                "ETH/USDT",
                dec!(2000),
                dec!(5),
                dec!(1),
                30,
                30,
                dec!(10),
            )
            .await
            .unwrap();
        assert_eq!(created.summary.total_orders(), 60);

        let summary = h.manager.stop(created.bot.id, false).await.unwrap();
        assert_eq!(summary.cancelled_orders, 60);
        assert_eq!(h.mock.open_order_count().await, 0);
        assert_eq!(h.db.count_open_orders(created.bot.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_sell_all_dumps_base_balance() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;
        let eth_before = h.mock.balance_of("ETH").await;
        assert!(eth_before > Decimal::ZERO);

        h.manager.stop(created.bot.id, true).await.unwrap();

        // The pre-bought base was market-sold down to under one step.
        assert!(h.mock.balance_of("ETH").await < dec!(0.0001));
    }

    #[tokio::test]
    async fn test_delete_stops_then_cascades() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;
        let bot_id = created.bot.id;

        h.manager.delete(bot_id).await.unwrap();

        assert!(matches!(
            h.db.bot(bot_id).await,
            Err(EngineError::BotNotFound(_))
        ));
        assert_eq!(h.mock.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_pause_resume_transitions() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;
        let bot_id = created.bot.id;

        h.manager.pause(bot_id).await.unwrap();
        assert_eq!(h.db.bot(bot_id).await.unwrap().status, BotStatus::Paused);
        assert!(!h.monitor.is_watching(bot_id).await);

        // Pausing twice is rejected.
        assert!(matches!(
            h.manager.pause(bot_id).await,
            Err(EngineError::InvalidState(_))
        ));

        h.manager.resume(bot_id).await.unwrap();
        assert_eq!(h.db.bot(bot_id).await.unwrap().status, BotStatus::Active);
        assert!(h.monitor.is_watching(bot_id).await);

        h.monitor.unwatch(bot_id).await;
    }

    #[tokio::test]
    async fn test_start_rebuilds_ladder_for_stopped_bot() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;
        let bot_id = created.bot.id;

        h.manager.stop(bot_id, false).await.unwrap();
        assert_eq!(h.db.count_open_orders(bot_id).await.unwrap(), 0);

        // Only stopped bots are startable; active ones are rejected above.
        let summary = h.manager.start(bot_id).await.unwrap();
        assert_eq!(summary.total_orders(), 10);

        let bot = h.db.bot(bot_id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Active);
        assert!(h.monitor.is_watching(bot_id).await);
        assert!(matches!(
            h.manager.start(bot_id).await,
            Err(EngineError::InvalidState(_))
        ));

        h.monitor.unwatch(bot_id).await;
    }

    #[tokio::test]
    async fn test_restore_processes_offline_fills() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;
        let bot_id = created.bot.id;
        // Simulate a process death: supervisor gone, fill happens offline.
        h.monitor.unwatch(bot_id).await;

        let buy = h
            .db
            .open_orders(bot_id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.side == OrderSide::Buy && o.price == dec!(1960))
            .unwrap();
        h.mock.fill_order(&buy.exchange_order_id).await;

        let restored = h.manager.restore_after_restart().await.unwrap();
        assert_eq!(restored, 1);
        assert!(h.monitor.is_watching(bot_id).await);

        // The offline fill produced its counter sell at 2000.
        let open = h.db.open_orders(bot_id).await.unwrap();
        assert!(open
            .iter()
            .any(|o| o.side == OrderSide::Sell && o.price == dec!(2000)));

        h.monitor.unwatch(bot_id).await;
    }

    #[tokio::test]
    async fn test_list_and_details_surfaces() {
        let h = harness().await;
        let created = create_default_range_bot(&h).await;

        let bots = h.manager.list_bots(h.user_id).await.unwrap();
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].symbol, "ETH/USDT");
        assert_eq!(bots[0].status, BotStatus::Active);

        let details = h.manager.bot_details(created.bot.id).await.unwrap();
        assert_eq!(details.open_orders, 10);
        assert!(details.runtime.is_some());

        h.monitor.unwatch(created.bot.id).await;
    }
}
