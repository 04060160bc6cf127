use alloy_primitives::TxHash;
use uuid::Uuid;

use crate::models::{PlanStatus, Priority, TokenId};

pub const MINT_ID_MISSING: &str = "minted token id not found in receipt";

/// Outcome of one plan step
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub kind: &'static str,
    pub priority: Priority,
    pub success: bool,
    pub attempts: u32,
    pub tx_hashes: Vec<TxHash>,
    /// Set when the step opened a new position
    pub minted_token_id: Option<TokenId>,
    /// Why the step failed, or a note on why nothing had to be sent
    pub detail: Option<String>,
}

impl ActionOutcome {
    pub fn succeeded(kind: &'static str, priority: Priority, attempts: u32) -> Self {
        Self {
            kind,
            priority,
            success: true,
            attempts,
            tx_hashes: Vec::new(),
            minted_token_id: None,
            detail: None,
        }
    }

    pub fn failed(kind: &'static str, priority: Priority, attempts: u32, detail: impl Into<String>) -> Self {
        Self {
            kind,
            priority,
            success: false,
            attempts,
            tx_hashes: Vec::new(),
            minted_token_id: None,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_txs(mut self, hashes: Vec<TxHash>) -> Self {
        self.tx_hashes = hashes;
        self
    }

    /// A failing high-priority step stops the rest of the plan.
    pub fn is_fatal(&self) -> bool {
        !self.success && self.priority == Priority::High
    }
}

/// Outcome of a whole plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub plan_id: Uuid,
    pub token_id: TokenId,
    pub status: PlanStatus,
    pub actions: Vec<ActionOutcome>,
    pub new_token_id: Option<TokenId>,
    pub reason: Option<String>,
}

impl PlanOutcome {
    /// Every step ran and succeeded, ending with a new position.
    pub fn is_success(&self) -> bool {
        self.status == PlanStatus::Completed && self.actions.iter().all(|a| a.success)
    }

    pub fn failed_actions(&self) -> usize {
        self.actions.iter().filter(|a| !a.success).count()
    }

    /// Tx of a mint that confirmed on chain without a readable token id.
    pub fn unresolved_mint(&self) -> Option<TxHash> {
        self.actions
            .iter()
            .find(|a| a.kind == "create_position" && !a.success && a.minted_token_id.is_none())
            .and_then(|a| a.tx_hashes.first().copied())
    }
}
