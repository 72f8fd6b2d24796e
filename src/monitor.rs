//! Per-bot order monitoring supervisors

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::db::{Bot, Db, LogLevel, Order};
use crate::errors::{EngineError, EngineResult, ExchangeError};
use crate::gateway::Gateway;
use crate::grid::strategy::GridStrategy;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::types::OrderStatus;

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// What a poll pass decided.
enum Tick {
    Continue,
    Exit,
}

struct Supervisor {
    generation: u64,
    shutdown: watch::Sender<bool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Registry of one supervisor task per active bot.
///
/// Supervisors poll persisted open orders against the exchange and hand
/// fills to the strategy. Transient failures back off exponentially;
/// credential failures stop the bot for good.
#[derive(Clone)]
pub struct OrderMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    db: Db,
    gateway: Arc<Gateway>,
    strategy: Arc<GridStrategy>,
    sink: Arc<dyn NotificationSink>,
    check_interval: Duration,
    /// Milestone granularity in percent (5 = every 5%)
    profit_step: Decimal,
    supervisors: Mutex<HashMap<i64, Supervisor>>,
    generations: AtomicU64,
}

impl OrderMonitor {
    pub fn new(
        db: Db,
        gateway: Arc<Gateway>,
        strategy: Arc<GridStrategy>,
        sink: Arc<dyn NotificationSink>,
        check_interval: Duration,
        profit_step: Decimal,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                gateway,
                strategy,
                sink,
                check_interval,
                profit_step,
                supervisors: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Start supervising a bot. Re-registering a supervised bot is a no-op.
    pub async fn watch(&self, bot_id: i64) {
        let mut supervisors = self.inner.supervisors.lock().await;
        if supervisors.contains_key(&bot_id) {
            warn!("bot {bot_id}: already supervised");
            return;
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            inner.run_supervisor(bot_id, generation, shutdown_rx).await;
        });

        supervisors.insert(
            bot_id,
            Supervisor {
                generation,
                shutdown: shutdown_tx,
                handle,
            },
        );
        info!("bot {bot_id}: supervisor started");
    }

    /// Signal a supervisor to exit at its next suspension point. Does not
    /// wait for it: an in-flight exchange call is allowed to finish and
    /// persist its result.
    pub async fn unwatch(&self, bot_id: i64) {
        if let Some(supervisor) = self.inner.supervisors.lock().await.remove(&bot_id) {
            let _ = supervisor.shutdown.send(true);
            info!("bot {bot_id}: supervisor stop requested");
        }
    }

    pub async fn is_watching(&self, bot_id: i64) -> bool {
        self.inner.supervisors.lock().await.contains_key(&bot_id)
    }

    pub async fn stop_all(&self) {
        let mut supervisors = self.inner.supervisors.lock().await;
        for (bot_id, supervisor) in supervisors.drain() {
            let _ = supervisor.shutdown.send(true);
            debug!("bot {bot_id}: supervisor stop requested");
        }
    }
}

impl Inner {
    /// Drop our registry entry, but only if it is still ours: the bot may
    /// have been unwatched and re-watched while we were exiting.
    async fn release(&self, bot_id: i64, generation: u64) {
        let mut supervisors = self.supervisors.lock().await;
        if supervisors
            .get(&bot_id)
            .map_or(false, |s| s.generation == generation)
        {
            supervisors.remove(&bot_id);
        }
    }

    async fn run_supervisor(
        &self,
        bot_id: i64,
        generation: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut backoff = BACKOFF_START;
        let mut last_milestone = Decimal::ZERO;

        loop {
            let delay = match self.poll_bot(bot_id, &mut last_milestone).await {
                Ok(Tick::Exit) => break,
                Ok(Tick::Continue) => {
                    backoff = BACKOFF_START;
                    self.check_interval
                }
                Err(error) => {
                    error!("bot {bot_id}: monitor pass failed: {error}");
                    let delay = backoff;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }

        self.release(bot_id, generation).await;
        info!("bot {bot_id}: supervisor exited");
    }

    /// One monitor pass over a bot's open orders.
    async fn poll_bot(&self, bot_id: i64, last_milestone: &mut Decimal) -> EngineResult<Tick> {
        let bot = match self.db.bot(bot_id).await {
            Ok(bot) => bot,
            Err(EngineError::BotNotFound(_)) => {
                warn!("bot {bot_id}: gone, stopping supervision");
                return Ok(Tick::Exit);
            }
            Err(other) => return Err(other),
        };

        if !bot.status.is_active() {
            info!("bot {bot_id}: no longer active, stopping supervision");
            return Ok(Tick::Exit);
        }

        let open_orders = self.db.open_orders(bot_id).await?;
        if open_orders.is_empty() {
            return Ok(Tick::Continue);
        }

        for order in open_orders {
            match self
                .gateway
                .order_status(bot.user_id, &bot.symbol, &order.exchange_order_id)
                .await
            {
                Ok(update) if update.status == OrderStatus::Filled => {
                    match self
                        .consume_fill(&bot, &order, update.fee, update.fee_currency.as_deref())
                        .await
                    {
                        Ok(()) => {}
                        Err(EngineError::Exchange(ExchangeError::InvalidCredentials)) => {
                            return self.stop_for_bad_credentials(&bot).await;
                        }
                        Err(error) => {
                            // Safe-fail the single order, keep the bot alive.
                            error!(
                                "bot {}: fill handling failed for order {}: {error}",
                                bot.id, order.id
                            );
                        }
                    }
                    self.notify_milestone(bot_id, last_milestone).await?;
                }
                Ok(_) => {}
                Err(EngineError::Exchange(ExchangeError::InvalidCredentials)) => {
                    return self.stop_for_bad_credentials(&bot).await;
                }
                Err(EngineError::Exchange(ExchangeError::OrderNotFound(_))) => {
                    warn!(
                        "bot {}: order {} unknown to the exchange",
                        bot.id, order.exchange_order_id
                    );
                }
                Err(error) => return Err(error),
            }
        }

        self.db.touch_bot_activity(bot_id).await?;
        Ok(Tick::Continue)
    }

    /// Hand a fill to the strategy and emit the fill notification.
    async fn consume_fill(
        &self,
        bot: &Bot,
        order: &Order,
        fee: Decimal,
        fee_currency: Option<&str>,
    ) -> EngineResult<()> {
        let outcome = self
            .strategy
            .handle_filled_order(order.id, fee, fee_currency)
            .await?;
        if !outcome.processed {
            return Ok(());
        }

        self.sink
            .publish(Notification::new(
                bot.user_id,
                Some(bot.id),
                NotificationKind::OrderFilled,
                json!({
                    "side": order.side.as_str(),
                    "price": order.price.to_string(),
                    "amount": order.amount.to_string(),
                    "counter_price": outcome.counter.as_ref().map(|c| c.price.to_string()),
                    "profit": outcome.profit.map(|p| p.to_string()),
                }),
            ))
            .await;
        Ok(())
    }

    /// Signal newly crossed profit milestones (multiples of the configured
    /// step), each one once per supervisor lifetime.
    async fn notify_milestone(
        &self,
        bot_id: i64,
        last_milestone: &mut Decimal,
    ) -> EngineResult<()> {
        let bot = self.db.bot(bot_id).await?;
        let milestone = milestone_reached(bot.total_profit_percent, self.profit_step);

        if milestone > *last_milestone {
            *last_milestone = milestone;
            self.sink
                .publish(Notification::new(
                    bot.user_id,
                    Some(bot.id),
                    NotificationKind::ProfitMilestone,
                    json!({
                        "percent": milestone.to_string(),
                        "total_profit": bot.total_profit.to_string(),
                    }),
                ))
                .await;
        }
        Ok(())
    }

    /// Credential invalidation is terminal for the bot.
    async fn stop_for_bad_credentials(&self, bot: &Bot) -> EngineResult<Tick> {
        error!("bot {}: credentials invalid, stopping", bot.id);
        self.db.mark_bot_stopped(bot.id).await?;
        self.db
            .insert_log(
                Some(bot.id),
                Some(bot.user_id),
                LogLevel::Error,
                "bot stopped: exchange rejected API credentials",
                None,
            )
            .await?;
        self.sink
            .publish(Notification::new(
                bot.user_id,
                Some(bot.id),
                NotificationKind::CredentialFailure,
                json!({ "symbol": bot.symbol }),
            ))
            .await;
        Ok(Tick::Exit)
    }
}

/// The highest whole milestone at or below `percent`, in `step` increments.
fn milestone_reached(percent: Decimal, step: Decimal) -> Decimal {
    if percent <= Decimal::ZERO || step <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (percent / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewBot, RangeParams};
    use crate::gateway::api::mock::MockExchange;
    use crate::notify::mock::MemorySink;
    use crate::security::CredentialCipher;
    use crate::types::{BotStatus, OrderSide};
    use rust_decimal_macros::dec;

    struct Harness {
        db: Db,
        mock: Arc<MockExchange>,
        monitor: OrderMonitor,
        sink: Arc<MemorySink>,
        strategy: Arc<GridStrategy>,
        bot_id: i64,
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

        let bot = db
            .insert_bot(NewBot::range(
                user.id,
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
            .unwrap();

        let monitor = OrderMonitor::new(
            db.clone(),
            gateway,
            strategy.clone(),
            sink.clone(),
            Duration::from_millis(20),
            dec!(5),
        );

        Harness {
            db,
            mock,
            monitor,
            sink,
            strategy,
            bot_id: bot.id,
        }
    }

    #[tokio::test]
    async fn test_watch_is_idempotent() {
        let h = harness().await;
        h.monitor.watch(h.bot_id).await;
        h.monitor.watch(h.bot_id).await;
        assert!(h.monitor.is_watching(h.bot_id).await);

        h.monitor.unwatch(h.bot_id).await;
        assert!(!h.monitor.is_watching(h.bot_id).await);
    }

    #[tokio::test]
    async fn test_supervisor_dispatches_fill_and_notifies() {
        let h = harness().await;
        h.strategy
            .place_initial_orders(h.bot_id, dec!(2000))
            .await
            .unwrap();

        let buy = h
            .db
            .open_orders(h.bot_id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.side == OrderSide::Buy && o.price == dec!(1960))
            .unwrap();
        h.mock.fill_order(&buy.exchange_order_id).await;

        h.monitor.watch(h.bot_id).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.monitor.unwatch(h.bot_id).await;

        // The fill was consumed into a counter sell at the next level up.
        let open = h.db.open_orders(h.bot_id).await.unwrap();
        assert!(open
            .iter()
            .any(|o| o.side == OrderSide::Sell && o.price == dec!(2000)));

        let filled_events = h.sink.events_of_kind(NotificationKind::OrderFilled).await;
        assert_eq!(filled_events.len(), 1);
        assert_eq!(filled_events[0].payload["side"], "buy");
    }

    #[tokio::test]
    async fn test_invalid_credentials_stop_bot_terminally() {
        let h = harness().await;
        h.strategy
            .place_initial_orders(h.bot_id, dec!(2000))
            .await
            .unwrap();
        h.mock.set_credentials_invalid(true);

        h.monitor.watch(h.bot_id).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let bot = h.db.bot(h.bot_id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Stopped);
        assert!(bot.stopped_at.is_some());

        // Supervisor is gone and the failure was announced.
        assert!(!h.monitor.is_watching(h.bot_id).await);
        assert_eq!(
            h.sink
                .events_of_kind(NotificationKind::CredentialFailure)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_supervisor_exits_when_bot_not_active() {
        let h = harness().await;
        h.db.set_bot_status(h.bot_id, BotStatus::Paused)
            .await
            .unwrap();

        h.monitor.watch(h.bot_id).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!h.monitor.is_watching(h.bot_id).await);
    }

    #[test]
    fn test_milestone_steps() {
        assert_eq!(milestone_reached(dec!(0), dec!(5)), dec!(0));
        assert_eq!(milestone_reached(dec!(4.9), dec!(5)), dec!(0));
        assert_eq!(milestone_reached(dec!(5.0), dec!(5)), dec!(5));
        assert_eq!(milestone_reached(dec!(12.3), dec!(5)), dec!(10));
        assert_eq!(milestone_reached(dec!(25), dec!(5)), dec!(25));
    }
}
