//! Sync status reported to the UI.

use crate::Timestamp;
use serde::Serialize;

/// What the "sync pending / working offline" indicator shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncIndicator {
    /// Nothing waiting to be sent
    Synced,
    /// Changes queued, connection available
    Pending,
    /// No connection; changes are kept locally
    Offline,
    /// Some changes were rejected and need a decision
    NeedsAttention,
}

/// A snapshot of the engine's sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub session_active: bool,
    /// Outbox entries waiting for delivery
    pub pending: usize,
    /// Outbox entries parked after repeated rejection
    pub parked: usize,
    /// Most recent successful pull of any collection
    pub last_pulled: Option<Timestamp>,
}

impl SyncStatus {
    pub fn indicator(&self) -> SyncIndicator {
        if self.parked > 0 {
            SyncIndicator::NeedsAttention
        } else if !self.online {
            SyncIndicator::Offline
        } else if self.pending > 0 {
            SyncIndicator::Pending
        } else {
            SyncIndicator::Synced
        }
    }

    /// Whether every local change has reached the origin.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.parked == 0
    }
}
