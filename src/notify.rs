//! Notification events and the pluggable sink they flow through

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OrderFilled,
    ProfitMilestone,
    CredentialFailure,
    OrphanRepaired,
    BotStopped,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderFilled => "order_filled",
            NotificationKind::ProfitMilestone => "profit_milestone",
            NotificationKind::CredentialFailure => "credential_failure",
            NotificationKind::OrphanRepaired => "orphan_repaired",
            NotificationKind::BotStopped => "bot_stopped",
        }
    }
}

/// A structured event emitted by the core.
///
/// The payload is already safe for end users: exchange-internal error text
/// never crosses this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: i64,
    pub bot_id: Option<i64>,
    pub kind: NotificationKind,
    pub payload: Value,
}

impl Notification {
    pub fn new(user_id: i64, bot_id: Option<i64>, kind: NotificationKind, payload: Value) -> Self {
        Self {
            user_id,
            bot_id,
            kind,
            payload,
        }
    }
}

/// Where events go. Implementations: chat adapter, log, queue.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: Notification);
}

/// Sink that writes every event as a structured log line.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, event: Notification) {
        info!(
            "notification: user={} bot={:?} kind={} payload={}",
            event.user_id,
            event.bot_id,
            event.kind.as_str(),
            event.payload
        );
    }
}

/// Capturing sink for tests.
pub mod mock {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemorySink {
        pub events: Arc<Mutex<Vec<Notification>>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events_of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
            self.events
                .lock()
                .await
                .iter()
                .filter(|e| e.kind == kind)
                .cloned()
                .collect()
        }

        pub async fn count(&self) -> usize {
            self.events.lock().await.len()
        }
    }

    #[async_trait]
    impl NotificationSink for MemorySink {
        async fn publish(&self, event: Notification) {
            self.events.lock().await.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MemorySink;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_sink_captures_events() {
        let sink = MemorySink::new();

        sink.publish(Notification::new(
            1,
            Some(7),
            NotificationKind::OrderFilled,
            json!({"side": "buy"}),
        ))
        .await;
        sink.publish(Notification::new(
            1,
            Some(7),
            NotificationKind::BotStopped,
            json!({}),
        ))
        .await;

        assert_eq!(sink.count().await, 2);
        let filled = sink.events_of_kind(NotificationKind::OrderFilled).await;
        assert_eq!(filled.len(), 1);
        assert_eq!(filled[0].payload["side"], "buy");
    }
}
