//! Draw events and operator alerts
//!
//! Publishing is fire-and-forget. A notifier must never block or fail
//! settlement, so the trait methods return nothing.

use crate::types::{DrawId, PayoutId, TicketId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Public draw lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrawEvent {
    SeedCommitted { draw_id: DrawId, seed_hash: String },
    SalesClosed { draw_id: DrawId },
    DataFinalized { draw_id: DrawId, total_tickets: u64, total_prize_pool: u64 },
    SeedRevealed { draw_id: DrawId, seed: String },
    NumbersGenerated { draw_id: DrawId, winning_numbers: Vec<u8> },
    ResultsAnnounced { draw_id: DrawId, winners_by_tier: BTreeMap<u8, u64>, total_paid: u64 },
    DrawFailed { draw_id: DrawId, reason: String },
    PayoutCompleted { draw_id: DrawId, payout_id: PayoutId, ticket_id: TicketId, tx_hash: String },
}

impl DrawEvent {
    pub fn draw_id(&self) -> DrawId {
        match self {
            Self::SeedCommitted { draw_id, .. }
            | Self::SalesClosed { draw_id }
            | Self::DataFinalized { draw_id, .. }
            | Self::SeedRevealed { draw_id, .. }
            | Self::NumbersGenerated { draw_id, .. }
            | Self::ResultsAnnounced { draw_id, .. }
            | Self::DrawFailed { draw_id, .. }
            | Self::PayoutCompleted { draw_id, .. } => *draw_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SeedCommitted { .. } => "seed_committed",
            Self::SalesClosed { .. } => "sales_closed",
            Self::DataFinalized { .. } => "data_finalized",
            Self::SeedRevealed { .. } => "seed_revealed",
            Self::NumbersGenerated { .. } => "numbers_generated",
            Self::ResultsAnnounced { .. } => "results_announced",
            Self::DrawFailed { .. } => "draw_failed",
            Self::PayoutCompleted { .. } => "payout_completed",
        }
    }
}

/// Condition that needs an operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorAlert {
    /// Drain batch aborted, nothing was sent
    InsufficientBalance { currency: String, required: u64, available: u64 },
    /// Payout exhausted its attempts
    PayoutFailed { payout_id: PayoutId, attempts: u32, error: String },
    /// Stored commitment and recomputation disagree. Never retryable.
    VerificationMismatch { draw_id: DrawId, detail: String },
    /// Draw moved to terminal `Failed`
    DrawFailed { draw_id: DrawId, reason: String },
}

/// Everything a notifier can emit, for channel consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Event(DrawEvent),
    Alert(OperatorAlert),
}

pub trait Notifier: Send + Sync {
    fn publish(&self, event: DrawEvent);
    fn alert(&self, alert: OperatorAlert);
}

/// Writes events and alerts to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn publish(&self, event: DrawEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!("Draw #{} {}: {}", event.draw_id(), event.kind(), payload);
    }

    fn alert(&self, alert: OperatorAlert) {
        let payload = serde_json::to_string(&alert).unwrap_or_default();
        error!("OPERATOR ALERT: {}", payload);
    }
}

/// Forwards to a bounded channel. Drops with a warning when the consumer lags.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn forward(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            warn!("Notification dropped: {}", e);
        }
    }
}

impl Notifier for ChannelNotifier {
    fn publish(&self, event: DrawEvent) {
        self.forward(Notification::Event(event));
    }

    fn alert(&self, alert: OperatorAlert) {
        // Alerts are also logged so a stalled consumer cannot hide them
        LogNotifier.alert(alert.clone());
        self.forward(Notification::Alert(alert));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_forwards_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new(8);
        notifier.publish(DrawEvent::SalesClosed { draw_id: 1 });
        notifier.alert(OperatorAlert::DrawFailed { draw_id: 1, reason: "x".into() });

        assert_eq!(rx.try_recv().unwrap(), Notification::Event(DrawEvent::SalesClosed { draw_id: 1 }));
        assert!(matches!(rx.try_recv().unwrap(), Notification::Alert(OperatorAlert::DrawFailed { .. })));
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let (notifier, _rx) = ChannelNotifier::new(1);
        notifier.publish(DrawEvent::SalesClosed { draw_id: 1 });
        notifier.publish(DrawEvent::SalesClosed { draw_id: 2 });
    }

    #[test]
    fn test_event_payload_is_tagged() {
        let event = DrawEvent::NumbersGenerated { draw_id: 3, winning_numbers: vec![1, 2] };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "numbers_generated");
        assert_eq!(event.kind(), "numbers_generated");
        assert_eq!(event.draw_id(), 3);
    }
}
