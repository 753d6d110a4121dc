// ==================== OUTBOX ====================
//
// Side effects requested by progress operations. Operations never call out
// themselves; they return events, the module stores them as queue rows and
// external workers deliver them, reporting back through the retry policy.

use crate::avatar::AvatarStage;
use crate::config::MAX_DELIVERY_ATTEMPTS;
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxEvent {
    /// Log a mint request for admin processing
    MintRequest(MintRequestEvent),
    /// Copy a saved reflection to the remote archive
    ArchiveReflection(ReflectionArchiveEvent),
}

impl OutboxEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboxEvent::MintRequest(_) => "mint_request",
            OutboxEvent::ArchiveReflection(_) => "archive_reflection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintRequestEvent {
    pub wallet_address: String,
    pub stage: AvatarStage,
    pub reason: String,
}

impl MintRequestEvent {
    /// Body accepted by the mint-request intake
    pub fn payload(&self) -> Value {
        json!({
            "walletAddress": self.wallet_address,
            "stageToMint": self.stage.index(),
            "stageName": self.stage.name(),
            "reason": self.reason,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectionArchiveEvent {
    /// Archive owner; reflections written before a wallet is linked are
    /// archived without one
    pub wallet_address: Option<String>,
    pub chapter_id: String,
    pub reflection_id: String,
    pub content: String,
}

/// What to do with a queue row after a delivery attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Retry after this many minutes
    RetryIn { minutes: u64 },
    /// Attempts exhausted, close the row
    GiveUp,
}

/// Exponential backoff for queue rows: 1, 2, 4, 8 minutes, then give up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: MAX_DELIVERY_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Decision after `attempts` failed attempts (counting the one just made)
    pub fn after_failure(&self, attempts: u8) -> Delivery {
        if attempts >= self.max_attempts {
            return Delivery::GiveUp;
        }
        let exponent = attempts.saturating_sub(1).min(16);
        Delivery::RetryIn {
            minutes: 1u64 << exponent,
        }
    }
}
