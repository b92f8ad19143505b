//! Fan-out hub: best-effort broadcast of newly indexed data.
//!
//! Publishing never blocks and never fails. Subscribers that fall behind the
//! channel capacity lose the oldest events and see a `Lagged` error on their
//! next receive.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ledger::BlockSummary;
use crate::types::{Direction, HeightRange};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    NewBlock(BlockSummary),
    NewTransaction {
        id: String,
        block_height: u64,
        payer: String,
        status: String,
    },
    IndexedRange {
        source: String,
        direction: Direction,
        range: HeightRange,
    },
}

#[derive(Clone)]
pub struct FanoutHub {
    tx: broadcast::Sender<HubEvent>,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: HubEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                trace!("hub event dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(start: u64) -> HubEvent {
        HubEvent::IndexedRange {
            source: "main_ingester".into(),
            direction: Direction::Forward,
            range: HeightRange::new(start, start + 1),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let hub = FanoutHub::new(4);
        assert_eq!(hub.publish(indexed(1)), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let hub = FanoutHub::new(16);
        let mut rx = hub.subscribe();
        hub.publish(indexed(1));
        hub.publish(indexed(2));
        assert_eq!(rx.recv().await.unwrap(), indexed(1));
        assert_eq!(rx.recv().await.unwrap(), indexed(2));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let hub = FanoutHub::new(2);
        let mut rx = hub.subscribe();
        for i in 0..5 {
            hub.publish(indexed(i));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap(), indexed(3));
    }
}
