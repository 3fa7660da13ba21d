//! Recovery session state machine.
//!
//! ```text
//! AwaitingShards ──(2 distinct roles)──▶ Reconstructing ──▶ Completed
//!       │  ▲                                   │
//!       │  └─(unavailable, shards refused)─────┤
//!       ▼                                      ▼
//!    Failed(TooManyFailedAttempts | Expired | Cancelled)   Failed(AddressMismatch)
//! ```
//!
//! Pure data plus transitions; persistence and shard material are handled
//! by the orchestrator. A session is persisted after every transition.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SHARD_THRESHOLD;
use crate::shard::ShardRole;
use crate::storage::{WalletKey, WalletStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    AddressMismatch,
    TooManyFailedAttempts,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingShards,
    Reconstructing,
    Completed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::AwaitingShards => f.write_str("awaiting shards"),
            SessionState::Reconstructing => f.write_str("reconstructing"),
            SessionState::Completed => f.write_str("completed"),
            SessionState::Failed(reason) => write!(f, "failed ({:?})", reason),
        }
    }
}

/// Why a transition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    Closed(SessionState),
    DuplicateRole(ShardRole),
    NotReady { have: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub session_id: String,
    pub user_id: String,
    pub chain: String,
    pub wallet_address: String,
    pub supplied_roles: BTreeSet<ShardRole>,
    pub state: SessionState,
    pub failed_submissions: u32,
    pub max_failed_submissions: u32,
    /// Wallet status before recovery started, restored on cancel.
    pub previous_status: WalletStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RecoverySession {
    pub fn new(
        key: &WalletKey,
        wallet_address: &str,
        previous_status: WalletStatus,
        max_failed_submissions: u32,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::days(1));
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: key.user_id.clone(),
            chain: key.chain.clone(),
            wallet_address: wallet_address.to_string(),
            supplied_roles: BTreeSet::new(),
            state: SessionState::AwaitingShards,
            failed_submissions: 0,
            max_failed_submissions,
            previous_status,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn wallet_key(&self) -> WalletKey {
        WalletKey {
            user_id: self.user_id.clone(),
            chain: self.chain.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_failed_submissions
            .saturating_sub(self.failed_submissions)
    }

    /// Move an open, overdue session to `Failed(Expired)`. Returns whether
    /// the state changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_open() && now >= self.expires_at {
            self.transition(SessionState::Failed(FailureReason::Expired));
            return true;
        }
        false
    }

    fn ensure_awaiting(&self) -> Result<(), TransitionError> {
        match self.state {
            SessionState::AwaitingShards => Ok(()),
            other => Err(TransitionError::Closed(other)),
        }
    }

    /// Accept a validated shard of `role`.
    pub fn add_role(&mut self, role: ShardRole) -> Result<(), TransitionError> {
        self.ensure_awaiting()?;
        if !self.supplied_roles.insert(role) {
            return Err(TransitionError::DuplicateRole(role));
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Forget a role whose material is no longer available.
    pub fn drop_role(&mut self, role: ShardRole) {
        if self.supplied_roles.remove(&role) {
            self.updated_at = Utc::now();
        }
    }

    pub fn has_role(&self, role: ShardRole) -> bool {
        self.supplied_roles.contains(&role)
    }

    /// Count an invalid submission. Returns `true` when this one exhausted
    /// the budget and closed the session.
    pub fn record_failure(&mut self) -> Result<bool, TransitionError> {
        self.ensure_awaiting()?;
        self.failed_submissions += 1;
        self.updated_at = Utc::now();
        if self.failed_submissions >= self.max_failed_submissions {
            self.transition(SessionState::Failed(FailureReason::TooManyFailedAttempts));
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_ready(&self) -> bool {
        self.supplied_roles.len() >= SHARD_THRESHOLD as usize
    }

    pub fn begin_reconstruction(&mut self) -> Result<(), TransitionError> {
        self.ensure_awaiting()?;
        if !self.is_ready() {
            return Err(TransitionError::NotReady {
                have: self.supplied_roles.len(),
            });
        }
        self.transition(SessionState::Reconstructing);
        Ok(())
    }

    /// Collaborator could not be reached; shards stay staged.
    pub fn revert_to_awaiting(&mut self) {
        if self.state == SessionState::Reconstructing {
            self.transition(SessionState::AwaitingShards);
        }
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        match self.state {
            SessionState::Reconstructing => {
                self.transition(SessionState::Completed);
                Ok(())
            }
            other => Err(TransitionError::Closed(other)),
        }
    }

    pub fn fail(&mut self, reason: FailureReason) {
        if self.is_open() {
            self.transition(SessionState::Failed(reason));
        }
    }

    fn transition(&mut self, state: SessionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}
