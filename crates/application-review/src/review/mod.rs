//! Review pipeline: polling, intake, the vote ledger and the decision engine.

pub mod domain;
pub mod engine;
pub mod events;
pub mod intake;
pub mod poller;
pub mod rate;
pub mod router;
pub mod source;
pub mod store;

#[cfg(test)]
mod tests;

pub use domain::{
    Answers, Application, ApplicationStatus, Decision, Polarity, QuestionTitles, RawAnswer,
    RawSubmission, ResponseId, Tally, TextAnswer, TextAnswers, Thresholds, Vote, VoterId,
};
pub use engine::{
    ApplicationView, CancelOutcome, DecisionEngine, EngineError, RecoveryReport, VoteReport,
};
pub use events::{EventError, ReviewEvents, UndoOffer};
pub use intake::{
    extract_applicant_id, sanitize, validate_snowflake, ApplicationCard, CardField, Intake,
    IntakeError, IntakeReport,
};
pub use poller::{sweep_processed_markers, Poller, TickOutcome, TickReport};
pub use rate::RateGovernor;
pub use router::{review_router, CancelRequest, VoteRequest};
pub use source::{FormSource, JsonExportSource, SourceError};
pub use store::{
    run_blocking, ApplicationStats, MemoryStore, RetryPolicy, ReviewStore, SqliteStore,
    StoreError, VoteChange, VoteOutcome,
};
