use alloy_primitives::Address;

use crate::models::{MonitoredPosition, PositionMetrics, RebalanceHistoryEntry, TokenId};

// Event types for internal messaging
#[derive(Debug, Clone)]
pub enum BotEvent {
    MonitoredUpdated(MonitoredPosition),
    MetricsUpdated(PositionMetrics),
    RebalanceRecorded(RebalanceHistoryEntry),
    PositionReplaced { old: TokenId, new: TokenId },
    PositionRemoved(TokenId),
    RangeExitAlert { pool: Address, token_id: TokenId, price: f64 },
}
