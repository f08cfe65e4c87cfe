//! Durable state for the review engine: processed-response markers, applications and votes.
//!
//! The vote operations form the ledger. Each ledger mutation applies the change and reads the
//! resulting tally inside one transaction so callers never observe a tally that predates their
//! own write.

mod memory;
mod retry;
mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{Application, Decision, Polarity, ResponseId, Tally, Vote, VoterId};

pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use sqlite::SqliteStore;

/// How a cast changed the voter's ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VoteChange {
    Added,
    Retracted,
    Switched { from: Polarity },
}

impl VoteChange {
    /// Whether the cast polarity gained a vote.
    pub fn increments(&self) -> bool {
        !matches!(self, VoteChange::Retracted)
    }
}

/// Result of a ledger mutation, read in the same transaction as the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VoteOutcome {
    pub change: VoteChange,
    pub tally: Tally,
}

/// Application counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplicationStats {
    pub total: u64,
    pub pending: u64,
    pub accepted: u64,
    pub denied: u64,
}

/// Storage abstraction shared by the poller, intake and decision engine.
///
/// Implementations must be safe to call from several threads at once. Callers in async code
/// go through [`run_blocking`].
pub trait ReviewStore: Send + Sync {
    fn is_processed(&self, response_id: &ResponseId) -> Result<bool, StoreError>;
    /// Idempotent: marking an already processed response is a no-op.
    fn mark_processed(&self, response_id: &ResponseId) -> Result<(), StoreError>;
    /// Delete markers older than `cutoff` unless their application is still pending.
    fn sweep_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Insert the application unless one already exists for its response id. Returns the
    /// stored row either way.
    fn insert_application(&self, application: Application) -> Result<Application, StoreError>;
    /// Message references are unique across applications.
    fn attach_message_ref(
        &self,
        response_id: &ResponseId,
        message_ref: &str,
    ) -> Result<(), StoreError>;
    fn application(&self, response_id: &ResponseId) -> Result<Option<Application>, StoreError>;
    fn application_by_message_ref(
        &self,
        message_ref: &str,
    ) -> Result<Option<Application>, StoreError>;
    fn pending_applications(&self, limit: usize) -> Result<Vec<Application>, StoreError>;
    /// Move a pending application to its terminal status. Returns `false` when the application
    /// was no longer pending, in which case nothing was written.
    fn finalize(&self, response_id: &ResponseId, decision: Decision) -> Result<bool, StoreError>;
    fn stats(&self) -> Result<ApplicationStats, StoreError>;

    /// Insert, retract (same polarity) or switch (other polarity) the voter's vote.
    fn cast_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
        polarity: Polarity,
    ) -> Result<VoteOutcome, StoreError>;
    fn current_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<Option<Polarity>, StoreError>;
    fn tally(&self, response_id: &ResponseId) -> Result<Tally, StoreError>;
    /// Remove the voter's vote if present and return the resulting tally.
    fn clear_vote(&self, response_id: &ResponseId, voter_id: &VoterId)
        -> Result<Tally, StoreError>;
    /// Live votes ordered by cast time, oldest first.
    fn votes(&self, response_id: &ResponseId) -> Result<Vec<Vote>, StoreError>;
}

/// Error enumeration for store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database still locked after {attempts} attempts")]
    Busy { attempts: u32 },
    #[error("record not found")]
    NotFound,
    #[error("message reference {0} already belongs to another application")]
    DuplicateMessageRef(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Run a store operation on the blocking pool so retries and SQLite I/O never stall the
/// async workers.
pub async fn run_blocking<S, T, F>(store: &Arc<S>, operation: F) -> Result<T, StoreError>
where
    S: ReviewStore + ?Sized + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || operation(&store))
        .await
        .map_err(|err| StoreError::Unavailable(format!("store task failed: {err}")))?
}
