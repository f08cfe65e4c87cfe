use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{Application, Decision, ResponseId, Tally, VoterId};
use super::intake::ApplicationCard;

/// Outbound notifications emitted by intake and the decision engine.
///
/// Hooks are invoked from async tasks and must return promptly. Failures are logged by the
/// caller and never roll back a committed state change.
pub trait ReviewEvents: Send + Sync {
    /// A new application is ready for review. May return an opaque reference to the rendered
    /// card so later lookups by that reference resolve to the application.
    fn on_intake(&self, card: &ApplicationCard) -> Result<Option<String>, EventError>;

    /// A decisive vote opened an undo window.
    fn on_decisive(&self, offer: &UndoOffer) -> Result<(), EventError>;

    fn on_finalized(&self, application: &Application, decision: Decision)
        -> Result<(), EventError>;

    fn on_tally_changed(&self, response_id: &ResponseId, tally: &Tally) -> Result<(), EventError>;
}

/// Offer extended to the voter whose vote reached a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoOffer {
    pub response_id: ResponseId,
    pub voter_id: VoterId,
    pub decision: Decision,
    pub deadline: DateTime<Utc>,
}

/// Error enumeration for event sink failures.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event transport unavailable: {0}")]
    Transport(String),
}
