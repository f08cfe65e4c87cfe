use application_review::config::StorageConfig;
use application_review::error::AppError;
use application_review::review::{
    Application, ApplicationCard, Decision, EventError, ResponseId, RetryPolicy, ReviewEvents,
    SqliteStore, Tally, UndoOffer,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tracing::info;

const EVENT_LOG_CAPACITY: usize = 500;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
    pub(crate) events: Arc<EventLog>,
}

/// Outbound review event as recorded by [`EventLog`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum ReviewEvent {
    Intake {
        response_id: ResponseId,
        message_ref: String,
        card: ApplicationCard,
    },
    Decisive {
        offer: UndoOffer,
    },
    Finalized {
        response_id: ResponseId,
        applicant_id: String,
        decision: Decision,
    },
    TallyChanged {
        response_id: ResponseId,
        tally: Tally,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct RecordedEvent {
    pub(crate) at: DateTime<Utc>,
    #[serde(flatten)]
    pub(crate) event: ReviewEvent,
}

/// Reference presentation layer: keeps the most recent outbound events in memory and hands
/// out card references derived from the response id, so they stay unique across restarts.
#[derive(Default)]
pub(crate) struct EventLog {
    entries: Mutex<VecDeque<RecordedEvent>>,
}

impl EventLog {
    pub(crate) fn entries(&self) -> Vec<RecordedEvent> {
        self.entries
            .lock()
            .expect("event log mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    fn record(&self, event: ReviewEvent) {
        let mut entries = self.entries.lock().expect("event log mutex poisoned");
        if entries.len() == EVENT_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(RecordedEvent {
            at: Utc::now(),
            event,
        });
    }
}

impl ReviewEvents for EventLog {
    fn on_intake(&self, card: &ApplicationCard) -> Result<Option<String>, EventError> {
        let message_ref = format!("card-{}", card.response_id);
        info!(response_id = %card.response_id, %message_ref, title = %card.title, "application card posted");
        self.record(ReviewEvent::Intake {
            response_id: card.response_id.clone(),
            message_ref: message_ref.clone(),
            card: card.clone(),
        });
        Ok(Some(message_ref))
    }

    fn on_decisive(&self, offer: &UndoOffer) -> Result<(), EventError> {
        info!(
            response_id = %offer.response_id,
            voter_id = %offer.voter_id,
            decision = offer.decision.label(),
            "undo offered"
        );
        self.record(ReviewEvent::Decisive {
            offer: offer.clone(),
        });
        Ok(())
    }

    fn on_finalized(
        &self,
        application: &Application,
        decision: Decision,
    ) -> Result<(), EventError> {
        info!(
            response_id = %application.response_id,
            applicant_id = %application.applicant_id,
            decision = decision.label(),
            "decision published"
        );
        self.record(ReviewEvent::Finalized {
            response_id: application.response_id.clone(),
            applicant_id: application.applicant_id.clone(),
            decision,
        });
        Ok(())
    }

    fn on_tally_changed(&self, response_id: &ResponseId, tally: &Tally) -> Result<(), EventError> {
        self.record(ReviewEvent::TallyChanged {
            response_id: response_id.clone(),
            tally: *tally,
        });
        Ok(())
    }
}

pub(crate) fn open_store(storage: &StorageConfig) -> Result<Arc<SqliteStore>, AppError> {
    let retry = RetryPolicy::new(storage.max_retries, storage.retry_base_delay);
    Ok(Arc::new(SqliteStore::open(&storage.database_path, retry)?))
}
