use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Notify;

use crate::review::domain::{
    Answers, Application, Decision, Polarity, QuestionTitles, RawAnswer, RawSubmission,
    ResponseId, Tally, Thresholds, Vote, VoterId,
};
use crate::review::events::{EventError, ReviewEvents, UndoOffer};
use crate::review::intake::ApplicationCard;
use crate::review::source::{FormSource, SourceError};
use crate::review::store::{
    ApplicationStats, MemoryStore, ReviewStore, StoreError, VoteOutcome,
};
use crate::review::DecisionEngine;

pub(super) const APPLICANT: &str = "123456789012345678";
pub(super) const SHORT_WINDOW: Duration = Duration::from_millis(60);
pub(super) const LONG_WINDOW: Duration = Duration::from_secs(30);

pub(super) fn thresholds(acceptance: u32, denial: u32) -> Thresholds {
    Thresholds::new(
        NonZeroU32::new(acceptance).expect("positive threshold"),
        NonZeroU32::new(denial).expect("positive threshold"),
    )
}

pub(super) fn rid(value: &str) -> ResponseId {
    ResponseId::from(value)
}

pub(super) fn voter(value: &str) -> VoterId {
    VoterId::from(value)
}

pub(super) fn submitted_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn submission(response_id: &str, applicant: &str) -> RawSubmission {
    RawSubmission {
        response_id: rid(response_id),
        submitted_at: submitted_at(),
        answers: Answers::from([
            ("q1".to_string(), RawAnswer::text(&["Jane"])),
            ("q2".to_string(), RawAnswer::text(&[applicant])),
            ("q3".to_string(), RawAnswer::text(&["I like the community"])),
        ]),
    }
}

pub(super) fn seed_application(store: &MemoryStore, response_id: &str) -> Application {
    store
        .insert_application(Application::new(
            rid(response_id),
            APPLICANT.to_string(),
            submitted_at(),
        ))
        .expect("seed application")
}

pub(super) fn engine_with(
    acceptance: u32,
    denial: u32,
    undo_window: Duration,
) -> (
    DecisionEngine<MemoryStore, RecordingEvents>,
    Arc<MemoryStore>,
    Arc<RecordingEvents>,
) {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(RecordingEvents::default());
    let engine = DecisionEngine::new(
        Arc::clone(&store),
        Arc::clone(&events),
        thresholds(acceptance, denial),
        undo_window,
    );
    (engine, store, events)
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum RecordedEvent {
    Intake(ApplicationCard),
    Decisive(UndoOffer),
    Finalized(ResponseId, Decision),
    TallyChanged(ResponseId, Tally),
}

/// Event sink that records every hook call and can be told to fail or hand out message refs.
#[derive(Default)]
pub(super) struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
    notify: Notify,
    message_refs: AtomicBool,
    fail_intake: AtomicBool,
    fail_finalized: AtomicBool,
}

impl RecordingEvents {
    pub(super) fn with_message_refs() -> Self {
        let events = Self::default();
        events.message_refs.store(true, Ordering::SeqCst);
        events
    }

    pub(super) fn fail_intake(&self, fail: bool) {
        self.fail_intake.store(fail, Ordering::SeqCst);
    }

    pub(super) fn fail_finalized(&self, fail: bool) {
        self.fail_finalized.store(fail, Ordering::SeqCst);
    }

    pub(super) fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("event mutex poisoned").clone()
    }

    pub(super) fn decisive(&self) -> Vec<UndoOffer> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RecordedEvent::Decisive(offer) => Some(offer),
                _ => None,
            })
            .collect()
    }

    pub(super) fn finalized(&self) -> Vec<(ResponseId, Decision)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RecordedEvent::Finalized(id, decision) => Some((id, decision)),
                _ => None,
            })
            .collect()
    }

    pub(super) fn intakes(&self) -> Vec<ApplicationCard> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RecordedEvent::Intake(card) => Some(card),
                _ => None,
            })
            .collect()
    }

    /// Wait up to two seconds for `count` finalizations to be recorded.
    pub(super) async fn wait_for_finalized(&self, count: usize) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.finalized().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .is_ok()
    }

    fn push(&self, event: RecordedEvent) {
        self.events
            .lock()
            .expect("event mutex poisoned")
            .push(event);
        self.notify.notify_waiters();
    }
}

impl ReviewEvents for RecordingEvents {
    fn on_intake(&self, card: &ApplicationCard) -> Result<Option<String>, EventError> {
        if self.fail_intake.load(Ordering::SeqCst) {
            return Err(EventError::Transport("review channel offline".to_string()));
        }
        self.push(RecordedEvent::Intake(card.clone()));
        Ok(self
            .message_refs
            .load(Ordering::SeqCst)
            .then(|| format!("msg-{}", card.response_id)))
    }

    fn on_decisive(&self, offer: &UndoOffer) -> Result<(), EventError> {
        self.push(RecordedEvent::Decisive(offer.clone()));
        Ok(())
    }

    fn on_finalized(
        &self,
        application: &Application,
        decision: Decision,
    ) -> Result<(), EventError> {
        self.push(RecordedEvent::Finalized(
            application.response_id.clone(),
            decision,
        ));
        if self.fail_finalized.load(Ordering::SeqCst) {
            return Err(EventError::Transport("role service offline".to_string()));
        }
        Ok(())
    }

    fn on_tally_changed(&self, response_id: &ResponseId, tally: &Tally) -> Result<(), EventError> {
        self.push(RecordedEvent::TallyChanged(response_id.clone(), *tally));
        Ok(())
    }
}

/// Source that replays scripted fetch results and counts calls.
#[derive(Default)]
pub(super) struct ScriptedSource {
    batches: Mutex<VecDeque<Result<Vec<RawSubmission>, SourceError>>>,
    titles: QuestionTitles,
    pub(super) fetches: AtomicUsize,
}

impl ScriptedSource {
    pub(super) fn new(batches: Vec<Result<Vec<RawSubmission>, SourceError>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            ..Self::default()
        }
    }

    pub(super) fn with_titles(mut self, titles: &[(&str, &str)]) -> Self {
        self.titles = titles
            .iter()
            .map(|(id, title)| (id.to_string(), title.to_string()))
            .collect();
        self
    }

    pub(super) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FormSource for ScriptedSource {
    async fn fetch_new(&self) -> Result<Vec<RawSubmission>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .expect("source mutex poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn question_titles(&self) -> Result<QuestionTitles, SourceError> {
        Ok(self.titles.clone())
    }
}

/// Store whose every call fails, for exercising error paths.
pub(super) struct UnavailableStore;

fn unavailable<T>() -> Result<T, StoreError> {
    Err(StoreError::Unavailable("database offline".to_string()))
}

impl ReviewStore for UnavailableStore {
    fn is_processed(&self, _response_id: &ResponseId) -> Result<bool, StoreError> {
        unavailable()
    }

    fn mark_processed(&self, _response_id: &ResponseId) -> Result<(), StoreError> {
        unavailable()
    }

    fn sweep_processed(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        unavailable()
    }

    fn insert_application(&self, _application: Application) -> Result<Application, StoreError> {
        unavailable()
    }

    fn attach_message_ref(
        &self,
        _response_id: &ResponseId,
        _message_ref: &str,
    ) -> Result<(), StoreError> {
        unavailable()
    }

    fn application(&self, _response_id: &ResponseId) -> Result<Option<Application>, StoreError> {
        unavailable()
    }

    fn application_by_message_ref(
        &self,
        _message_ref: &str,
    ) -> Result<Option<Application>, StoreError> {
        unavailable()
    }

    fn pending_applications(&self, _limit: usize) -> Result<Vec<Application>, StoreError> {
        unavailable()
    }

    fn finalize(&self, _response_id: &ResponseId, _decision: Decision) -> Result<bool, StoreError> {
        unavailable()
    }

    fn stats(&self) -> Result<ApplicationStats, StoreError> {
        unavailable()
    }

    fn cast_vote(
        &self,
        _response_id: &ResponseId,
        _voter_id: &VoterId,
        _polarity: Polarity,
    ) -> Result<VoteOutcome, StoreError> {
        unavailable()
    }

    fn current_vote(
        &self,
        _response_id: &ResponseId,
        _voter_id: &VoterId,
    ) -> Result<Option<Polarity>, StoreError> {
        unavailable()
    }

    fn tally(&self, _response_id: &ResponseId) -> Result<Tally, StoreError> {
        unavailable()
    }

    fn clear_vote(
        &self,
        _response_id: &ResponseId,
        _voter_id: &VoterId,
    ) -> Result<Tally, StoreError> {
        unavailable()
    }

    fn votes(&self, _response_id: &ResponseId) -> Result<Vec<Vote>, StoreError> {
        unavailable()
    }
}

/// Memory store that signals once a vote write or clear has committed and then stalls the
/// calling blocking task for `stall`, leaving a gap before the engine sees the result.
pub(super) struct SlowLedgerStore {
    pub(super) inner: MemoryStore,
    pub(super) cast_applied: Notify,
    pub(super) clear_applied: Notify,
    stall: Duration,
}

impl SlowLedgerStore {
    pub(super) fn new(stall: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            cast_applied: Notify::new(),
            clear_applied: Notify::new(),
            stall,
        }
    }
}

impl ReviewStore for SlowLedgerStore {
    fn is_processed(&self, response_id: &ResponseId) -> Result<bool, StoreError> {
        self.inner.is_processed(response_id)
    }

    fn mark_processed(&self, response_id: &ResponseId) -> Result<(), StoreError> {
        self.inner.mark_processed(response_id)
    }

    fn sweep_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.sweep_processed(cutoff)
    }

    fn insert_application(&self, application: Application) -> Result<Application, StoreError> {
        self.inner.insert_application(application)
    }

    fn attach_message_ref(
        &self,
        response_id: &ResponseId,
        message_ref: &str,
    ) -> Result<(), StoreError> {
        self.inner.attach_message_ref(response_id, message_ref)
    }

    fn application(&self, response_id: &ResponseId) -> Result<Option<Application>, StoreError> {
        self.inner.application(response_id)
    }

    fn application_by_message_ref(
        &self,
        message_ref: &str,
    ) -> Result<Option<Application>, StoreError> {
        self.inner.application_by_message_ref(message_ref)
    }

    fn pending_applications(&self, limit: usize) -> Result<Vec<Application>, StoreError> {
        self.inner.pending_applications(limit)
    }

    fn finalize(&self, response_id: &ResponseId, decision: Decision) -> Result<bool, StoreError> {
        self.inner.finalize(response_id, decision)
    }

    fn stats(&self) -> Result<ApplicationStats, StoreError> {
        self.inner.stats()
    }

    fn cast_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
        polarity: Polarity,
    ) -> Result<VoteOutcome, StoreError> {
        let outcome = self.inner.cast_vote(response_id, voter_id, polarity)?;
        self.cast_applied.notify_one();
        std::thread::sleep(self.stall);
        Ok(outcome)
    }

    fn current_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<Option<Polarity>, StoreError> {
        self.inner.current_vote(response_id, voter_id)
    }

    fn tally(&self, response_id: &ResponseId) -> Result<Tally, StoreError> {
        self.inner.tally(response_id)
    }

    fn clear_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<Tally, StoreError> {
        let tally = self.inner.clear_vote(response_id, voter_id)?;
        self.clear_applied.notify_one();
        std::thread::sleep(self.stall);
        Ok(tally)
    }

    fn votes(&self, response_id: &ResponseId) -> Result<Vec<Vote>, StoreError> {
        self.inner.votes(response_id)
    }
}
