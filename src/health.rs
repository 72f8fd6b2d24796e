//! Periodic reconciliation between persisted state and the exchange

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::db::{Bot, Db, GridParams, LogLevel, NewOrder, Order};
use crate::errors::{EngineError, EngineResult};
use crate::gateway::Gateway;
use crate::grid::planner::{flat_sell_prices, range_prices};
use crate::grid::solver::round_price_down;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::types::OrderSide;

/// Tolerated shortfall before the order count is flagged.
const ORDER_COUNT_TOLERANCE: Decimal = dec!(0.8);

/// Quote-balance warning threshold, as a share of the bot's capital base.
const BALANCE_BUFFER: Decimal = dec!(0.2);

/// Outcome of one bot's health pass.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub bot_id: i64,
    pub issues: Vec<String>,
    pub auto_fixed: Vec<String>,
    pub needs_attention: Vec<String>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.needs_attention.is_empty()
    }
}

/// Reconciles drift for all active bots on a timer. Every repair is
/// idempotent: a second pass right after finds nothing to do.
pub struct HealthChecker {
    db: Db,
    gateway: Arc<Gateway>,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(
        db: Db,
        gateway: Arc<Gateway>,
        sink: Arc<dyn NotificationSink>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            gateway,
            sink,
            interval,
        }
    }

    /// Periodic loop for the daemon; never returns.
    pub async fn run(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.interval).await;
            if let Err(error) = self.check_all().await {
                error!("health check sweep failed: {error}");
            }
        }
    }

    /// One sweep across all active bots.
    pub async fn check_all(&self) -> EngineResult<Vec<HealthReport>> {
        let bots = self.db.active_bots().await?;
        info!("health check: {} active bots", bots.len());

        let mut reports = Vec::with_capacity(bots.len());
        for bot in bots {
            match self.check_bot(bot.id).await {
                Ok(report) => reports.push(report),
                Err(error) => {
                    error!("bot {}: health check failed: {error}", bot.id);
                }
            }
        }
        Ok(reports)
    }

    /// The five checks for one bot.
    pub async fn check_bot(&self, bot_id: i64) -> EngineResult<HealthReport> {
        let bot = self.db.bot(bot_id).await?;
        let mut report = HealthReport {
            bot_id,
            ..Default::default()
        };

        self.check_orphaned_assets(&bot, &mut report).await?;
        self.check_order_count(&bot, &mut report).await?;
        self.check_out_of_range(&bot, &mut report).await?;
        self.check_duplicates(&bot, &mut report).await?;
        self.check_balance(&bot, &mut report).await?;

        self.db
            .insert_log(
                Some(bot.id),
                Some(bot.user_id),
                if report.healthy() {
                    LogLevel::Info
                } else {
                    LogLevel::Warning
                },
                "health check",
                Some(json!({
                    "issues": report.issues,
                    "auto_fixed": report.auto_fixed,
                    "needs_attention": report.needs_attention,
                })),
            )
            .await?;

        Ok(report)
    }

    /// Check 1: base currency not backed by any open sell order. Orphans
    /// at or above the exchange minimum get one sell at the lowest free
    /// ladder price above the current ticker.
    async fn check_orphaned_assets(&self, bot: &Bot, report: &mut HealthReport) -> EngineResult<()> {
        let market = self.gateway.market_info(&bot.symbol).await?;
        let balances = self.gateway.balance(bot.user_id).await?;
        let base_balance = balances
            .get(market.base.as_str())
            .copied()
            .unwrap_or(Decimal::ZERO);

        let open_sells = self.db.open_orders_by_side(bot.id, OrderSide::Sell).await?;
        let backed: Decimal = open_sells.iter().map(|o| o.amount).sum();

        let orphan = market.amount_precision.round_down(base_balance - backed);
        if orphan < market.min_order_amount {
            return Ok(());
        }
        report.issues.push(format!("orphaned assets: {orphan}"));

        let ticker = self.gateway.ticker(&bot.symbol).await?;
        let Some((level, price)) =
            self.free_sell_level(bot, &open_sells, ticker, market.price_precision)?
        else {
            warn!("bot {}: no free sell level for orphan of {orphan}", bot.id);
            report
                .needs_attention
                .push("orphaned assets with no free sell level".into());
            return Ok(());
        };

        match self
            .gateway
            .place_limit(bot.user_id, &bot.symbol, OrderSide::Sell, price, orphan)
            .await
        {
            Ok(placed) => {
                self.db
                    .insert_order(NewOrder {
                        bot_id: bot.id,
                        exchange_order_id: placed.exchange_order_id,
                        side: OrderSide::Sell,
                        level,
                        price,
                        amount: orphan,
                        paired_order_id: None,
                    })
                    .await?;

                info!(
                    "bot {}: repaired orphan, sell {} @ {} at level {}",
                    bot.id, orphan, price, level
                );
                report
                    .auto_fixed
                    .push(format!("placed sell for orphaned {orphan} at {price}"));
                self.sink
                    .publish(Notification::new(
                        bot.user_id,
                        Some(bot.id),
                        NotificationKind::OrphanRepaired,
                        json!({
                            "amount": orphan.to_string(),
                            "price": price.to_string(),
                            "level": level,
                        }),
                    ))
                    .await;
            }
            Err(EngineError::Exchange(error)) => {
                warn!("bot {}: orphan repair failed: {error}", bot.id);
                report
                    .needs_attention
                    .push("orphan repair placement failed".into());
            }
            Err(other) => return Err(other),
        }
        Ok(())
    }

    /// The lowest ladder price above the ticker with no open sell on it.
    fn free_sell_level(
        &self,
        bot: &Bot,
        open_sells: &[Order],
        ticker: Decimal,
        price_precision: u32,
    ) -> EngineResult<Option<(i64, Decimal)>> {
        let candidates: Vec<(i64, Decimal)> = match bot.params()? {
            GridParams::Range(params) => {
                range_prices(params.lower_price, params.upper_price, params.grid_levels)
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| (i as i64, round_price_down(p, price_precision)))
                    .collect()
            }
            GridParams::Flat(params) => flat_sell_prices(&params, price_precision)
                .into_iter()
                .enumerate()
                .map(|(i, p)| ((i + 1) as i64, p))
                .collect(),
        };

        let used: std::collections::HashSet<i64> = open_sells.iter().map(|o| o.level).collect();
        Ok(candidates
            .into_iter()
            .find(|(level, price)| *price > ticker && !used.contains(level)))
    }

    /// Check 2: well under the expected open-order count points at a
    /// deeper failure; flag it, never auto-fix.
    async fn check_order_count(&self, bot: &Bot, report: &mut HealthReport) -> EngineResult<()> {
        let expected = Decimal::from(bot.expected_open_orders());
        if expected.is_zero() {
            return Ok(());
        }

        let actual = Decimal::from(self.db.count_open_orders(bot.id).await?);
        if actual < expected * ORDER_COUNT_TOLERANCE {
            report
                .issues
                .push(format!("order count: expected ~{expected}, got {actual}"));
            report
                .needs_attention
                .push(format!("only {actual}/{expected} orders on the book"));
        }
        Ok(())
    }

    /// Check 3: open orders priced outside a range grid's bounds are
    /// cancelled outright.
    async fn check_out_of_range(&self, bot: &Bot, report: &mut HealthReport) -> EngineResult<()> {
        let GridParams::Range(params) = bot.params()? else {
            return Ok(());
        };

        let mut cancelled = 0;
        for order in self.db.open_orders(bot.id).await? {
            if order.price >= params.lower_price && order.price <= params.upper_price {
                continue;
            }

            match self
                .gateway
                .cancel(bot.user_id, &bot.symbol, &order.exchange_order_id)
                .await
            {
                Ok(()) => {
                    self.db.mark_order_cancelled(order.id).await?;
                    cancelled += 1;
                }
                Err(error) => {
                    warn!(
                        "bot {}: failed to cancel out-of-range order {}: {error}",
                        bot.id, order.exchange_order_id
                    );
                }
            }
        }

        if cancelled > 0 {
            report.issues.push(format!("{cancelled} orders out of range"));
            report
                .auto_fixed
                .push(format!("cancelled {cancelled} out-of-range orders"));
        }
        Ok(())
    }

    /// Check 4: more than one open order per (level, side) - keep the
    /// first, cancel the rest.
    async fn check_duplicates(&self, bot: &Bot, report: &mut HealthReport) -> EngineResult<()> {
        let mut by_slot: HashMap<(i64, OrderSide), Vec<Order>> = HashMap::new();
        for order in self.db.open_orders(bot.id).await? {
            by_slot.entry((order.level, order.side)).or_default().push(order);
        }

        let mut removed = 0;
        for (_, orders) in by_slot {
            for duplicate in orders.into_iter().skip(1) {
                match self
                    .gateway
                    .cancel(bot.user_id, &bot.symbol, &duplicate.exchange_order_id)
                    .await
                {
                    Ok(()) => {
                        self.db.mark_order_cancelled(duplicate.id).await?;
                        removed += 1;
                    }
                    Err(error) => {
                        warn!(
                            "bot {}: failed to cancel duplicate {}: {error}",
                            bot.id, duplicate.exchange_order_id
                        );
                    }
                }
            }
        }

        if removed > 0 {
            report.issues.push("duplicate orders found".into());
            report
                .auto_fixed
                .push(format!("cancelled {removed} duplicate orders"));
        }
        Ok(())
    }

    /// Check 5: warn when the quote balance drops below 20% of the bot's
    /// capital base.
    async fn check_balance(&self, bot: &Bot, report: &mut HealthReport) -> EngineResult<()> {
        let capital = bot.capital_base();
        if capital.is_zero() {
            return Ok(());
        }

        let quote = bot.quote_currency()?.to_string();
        let balances = self.gateway.balance(bot.user_id).await?;
        let available = balances.get(&quote).copied().unwrap_or(Decimal::ZERO);

        let recommended = capital * BALANCE_BUFFER;
        if available < recommended {
            report.issues.push("quote balance low".into());
            report.needs_attention.push(format!(
                "balance {available} {quote} below recommended {recommended}"
            ));
        }
        Ok(())
    }
}
