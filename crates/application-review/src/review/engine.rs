//! Decision engine: per-application serialization of votes, decisive-vote detection, the undo
//! window state machine and at-most-once finalization.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::domain::{
    Application, ApplicationStatus, Decision, Polarity, ResponseId, Tally, Thresholds, Vote,
    VoterId,
};
use super::events::{EventError, ReviewEvents, UndoOffer};
use super::store::{run_blocking, ApplicationStats, ReviewStore, StoreError, VoteChange};
use crate::config::ReviewConfig;

const RECOVERY_LIMIT: usize = 10_000;

type Slots = Arc<Mutex<HashMap<ResponseId, Arc<tokio::sync::Mutex<()>>>>>;

/// Keyed async mutex: one critical section per application at a time, unrelated applications
/// never wait on each other. Idle entries are removed when the last holder releases.
#[derive(Default)]
pub(crate) struct ApplicationLocks {
    slots: Slots,
}

impl ApplicationLocks {
    pub(crate) async fn acquire(&self, response_id: &ResponseId) -> ApplicationGuard {
        let slot = {
            let mut slots = self.slots.lock().expect("application lock map poisoned");
            Arc::clone(slots.entry(response_id.clone()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        ApplicationGuard {
            slots: Arc::clone(&self.slots),
            response_id: response_id.clone(),
            slot,
            _guard: guard,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().expect("application lock map poisoned").len()
    }
}

pub(crate) struct ApplicationGuard {
    slots: Slots,
    response_id: ResponseId,
    slot: Arc<tokio::sync::Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for ApplicationGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().expect("application lock map poisoned");
        // Map entry, `slot` and the owned guard: anything beyond that is a waiter.
        if Arc::strong_count(&self.slot) <= 3 {
            slots.remove(&self.response_id);
        }
    }
}

struct PendingUndo {
    voter_id: VoterId,
    polarity: Polarity,
    deadline: DateTime<Utc>,
    generation: u64,
    cancel: oneshot::Sender<()>,
}

impl PendingUndo {
    fn offer(&self, response_id: &ResponseId) -> UndoOffer {
        UndoOffer {
            response_id: response_id.clone(),
            voter_id: self.voter_id.clone(),
            decision: self.polarity.decision(),
            deadline: self.deadline,
        }
    }
}

/// Outcome of a vote handled by [`DecisionEngine::handle_vote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteReport {
    pub response_id: ResponseId,
    pub voter_id: VoterId,
    pub polarity: Polarity,
    pub change: VoteChange,
    pub tally: Tally,
    /// Window opened by this vote, if it was decisive.
    pub undo: Option<UndoOffer>,
    /// The voter withdrew the vote that had opened the current window.
    pub withdrew_undo: bool,
}

/// Outcome of an undo request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The decisive vote was removed. `reopened` is set when the remaining votes still cross
    /// a threshold and a fresh window was opened for them.
    Cancelled {
        tally: Tally,
        reopened: Option<UndoOffer>,
    },
    /// No window is open for this voter; nothing changed.
    NotPending,
    /// The window already closed and the application is decided; nothing changed.
    AlreadyFinalized { status: ApplicationStatus },
}

/// Snapshot of an application for API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationView {
    pub application: Application,
    pub tally: Tally,
    pub votes: Vec<Vote>,
    pub pending_undo: Option<UndoOffer>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub examined: usize,
    pub finalized: usize,
}

struct EngineInner<S, E> {
    store: Arc<S>,
    events: Arc<E>,
    thresholds: Thresholds,
    undo_window: Duration,
    locks: ApplicationLocks,
    undos: Mutex<HashMap<ResponseId, PendingUndo>>,
    generation: AtomicU64,
}

/// Consumes vote and cancel events and finalizes each application exactly once.
///
/// Cloning is cheap; clones share the same undo state and locks.
pub struct DecisionEngine<S, E> {
    inner: Arc<EngineInner<S, E>>,
}

impl<S, E> Clone for DecisionEngine<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, E> DecisionEngine<S, E>
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    pub fn new(
        store: Arc<S>,
        events: Arc<E>,
        thresholds: Thresholds,
        undo_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                events,
                thresholds,
                undo_window,
                locks: ApplicationLocks::default(),
                undos: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(store: Arc<S>, events: Arc<E>, config: &ReviewConfig) -> Self {
        let thresholds = Thresholds::new(config.acceptance_threshold, config.denial_threshold);
        Self::new(store, events, thresholds, config.undo_window)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn thresholds(&self) -> Thresholds {
        self.inner.thresholds
    }

    /// Apply a vote and, in the same critical section, decide whether it opens an undo window.
    ///
    /// The work runs on its own task: once started it completes even if the caller stops
    /// waiting for the report.
    pub async fn handle_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
        polarity: Polarity,
    ) -> Result<VoteReport, EngineError> {
        let engine = self.clone();
        let (response_id, voter_id) = (response_id.clone(), voter_id.clone());
        detached(async move { engine.apply_vote(&response_id, &voter_id, polarity).await }).await
    }

    /// Undo request from a voter. Only the voter whose vote opened the current window can
    /// cancel it, and only before the window's deadline. Runs detached like
    /// [`handle_vote`](Self::handle_vote).
    pub async fn cancel(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<CancelOutcome, EngineError> {
        let engine = self.clone();
        let (response_id, voter_id) = (response_id.clone(), voter_id.clone());
        detached(async move { engine.apply_cancel(&response_id, &voter_id).await }).await
    }

    async fn apply_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
        polarity: Polarity,
    ) -> Result<VoteReport, EngineError> {
        let _guard = self.inner.locks.acquire(response_id).await;
        self.require_pending(response_id).await?;

        let (id, voter) = (response_id.clone(), voter_id.clone());
        let outcome = run_blocking(&self.inner.store, move |store| {
            store.cast_vote(&id, &voter, polarity)
        })
        .await?;
        self.emit(
            "on_tally_changed",
            response_id,
            self.inner
                .events
                .on_tally_changed(response_id, &outcome.tally),
        );

        // A retraction or switch by the pending voter withdraws the decisive vote.
        let withdrew_undo = {
            let mut undos = self.undos();
            let withdrawn = matches!(
                undos.get(response_id),
                Some(pending) if &pending.voter_id == voter_id
                    && (outcome.change == VoteChange::Retracted || polarity != pending.polarity)
            );
            if withdrawn {
                if let Some(pending) = undos.remove(response_id) {
                    let _ = pending.cancel.send(());
                }
            }
            withdrawn
        };
        if withdrew_undo {
            info!(response_id = %response_id, voter_id = %voter_id, "decisive vote withdrawn");
        }

        let trigger = outcome
            .change
            .increments()
            .then_some((voter_id, polarity));
        let undo = self.evaluate(response_id, trigger, outcome.tally).await?;

        Ok(VoteReport {
            response_id: response_id.clone(),
            voter_id: voter_id.clone(),
            polarity,
            change: outcome.change,
            tally: outcome.tally,
            undo,
            withdrew_undo,
        })
    }

    async fn apply_cancel(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<CancelOutcome, EngineError> {
        let _guard = self.inner.locks.acquire(response_id).await;

        // Past the deadline the window belongs to the expiry task, however late it wakes.
        let now = Utc::now();
        let pending = {
            let mut undos = self.undos();
            match undos.get(response_id) {
                Some(pending) if &pending.voter_id == voter_id && now < pending.deadline => {
                    undos.remove(response_id)
                }
                _ => None,
            }
        };

        let Some(pending) = pending else {
            let application = self.load(response_id).await?;
            if application.status.is_terminal() {
                debug!(response_id = %response_id, voter_id = %voter_id, "late undo ignored");
                return Ok(CancelOutcome::AlreadyFinalized {
                    status: application.status,
                });
            }
            return Ok(CancelOutcome::NotPending);
        };
        let _ = pending.cancel.send(());

        let (id, voter) = (response_id.clone(), voter_id.clone());
        let tally =
            run_blocking(&self.inner.store, move |store| store.clear_vote(&id, &voter)).await?;
        self.emit(
            "on_tally_changed",
            response_id,
            self.inner.events.on_tally_changed(response_id, &tally),
        );
        info!(
            response_id = %response_id,
            voter_id = %voter_id,
            decision = pending.polarity.decision().label(),
            "undo window cancelled"
        );

        let reopened = self.evaluate(response_id, None, tally).await?;
        Ok(CancelOutcome::Cancelled { tally, reopened })
    }

    /// The open undo window for an application, if any.
    pub fn pending_undo(&self, response_id: &ResponseId) -> Option<UndoOffer> {
        self.undos()
            .get(response_id)
            .map(|pending| pending.offer(response_id))
    }

    /// Forget every open window. Dropping the cancel handles stops their timers.
    pub fn clear_pending_undos(&self) -> usize {
        let cleared = self.undos().drain().count();
        if cleared > 0 {
            info!(cleared, "cleared pending undo windows");
        }
        cleared
    }

    /// Finalize pending applications whose tally already crosses a threshold, as happens when
    /// the process stopped while an undo window was open.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let pending = run_blocking(&self.inner.store, |store| {
            store.pending_applications(RECOVERY_LIMIT)
        })
        .await?;

        let mut report = RecoveryReport {
            examined: pending.len(),
            finalized: 0,
        };
        for application in pending {
            let response_id = application.response_id;
            let _guard = self.inner.locks.acquire(&response_id).await;
            if self.undos().contains_key(&response_id) {
                continue;
            }

            let id = response_id.clone();
            let tally = run_blocking(&self.inner.store, move |store| store.tally(&id)).await?;
            if let Some((_, polarity)) = self.latest_crossed(&response_id, tally).await? {
                if self.finalize(&response_id, polarity.decision()).await? {
                    report.finalized += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            finalized = report.finalized,
            "recovery pass complete"
        );
        Ok(report)
    }

    pub async fn application_view(
        &self,
        response_id: &ResponseId,
    ) -> Result<Option<ApplicationView>, EngineError> {
        let id = response_id.clone();
        let snapshot = run_blocking(&self.inner.store, move |store| {
            let Some(application) = store.application(&id)? else {
                return Ok(None);
            };
            let tally = store.tally(&id)?;
            let votes = store.votes(&id)?;
            Ok(Some((application, tally, votes)))
        })
        .await?;

        Ok(snapshot.map(|(application, tally, votes)| ApplicationView {
            pending_undo: self.pending_undo(&application.response_id),
            application,
            tally,
            votes,
        }))
    }

    pub async fn application_view_by_message_ref(
        &self,
        message_ref: &str,
    ) -> Result<Option<ApplicationView>, EngineError> {
        let message_ref = message_ref.to_string();
        let application = run_blocking(&self.inner.store, move |store| {
            store.application_by_message_ref(&message_ref)
        })
        .await?;
        match application {
            Some(application) => self.application_view(&application.response_id).await,
            None => Ok(None),
        }
    }

    pub async fn stats(&self) -> Result<ApplicationStats, EngineError> {
        Ok(run_blocking(&self.inner.store, |store| store.stats()).await?)
    }

    /// Open a window when the triggering vote is decisive; otherwise check whether the live
    /// tally crosses a threshold with no window open (after a cancel or a withdrawn vote) and
    /// open one for the most recent qualifying voter. Caller holds the application lock.
    async fn evaluate(
        &self,
        response_id: &ResponseId,
        trigger: Option<(&VoterId, Polarity)>,
        tally: Tally,
    ) -> Result<Option<UndoOffer>, EngineError> {
        if self.undos().contains_key(response_id) {
            return Ok(None);
        }

        let thresholds = self.inner.thresholds;
        let decider = match trigger {
            Some((voter_id, polarity)) if thresholds.is_decisive(polarity, &tally) => {
                Some((voter_id.clone(), polarity))
            }
            _ => self.latest_crossed(response_id, tally).await?,
        };

        Ok(decider.map(|(voter_id, polarity)| self.open_window(response_id, voter_id, polarity)))
    }

    async fn latest_crossed(
        &self,
        response_id: &ResponseId,
        tally: Tally,
    ) -> Result<Option<(VoterId, Polarity)>, EngineError> {
        let thresholds = self.inner.thresholds;
        let crossed: Vec<Polarity> = [Polarity::Approve, Polarity::Deny]
            .into_iter()
            .filter(|polarity| thresholds.is_crossed(*polarity, &tally))
            .collect();
        if crossed.is_empty() {
            return Ok(None);
        }

        let id = response_id.clone();
        let votes = run_blocking(&self.inner.store, move |store| store.votes(&id)).await?;
        Ok(votes
            .into_iter()
            .rev()
            .find(|vote| crossed.contains(&vote.polarity))
            .map(|vote| (vote.voter_id, vote.polarity)))
    }

    fn open_window(
        &self,
        response_id: &ResponseId,
        voter_id: VoterId,
        polarity: Polarity,
    ) -> UndoOffer {
        let window = self.inner.undo_window;
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let deadline = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (cancel, cancelled) = oneshot::channel();

        let pending = PendingUndo {
            voter_id,
            polarity,
            deadline,
            generation,
            cancel,
        };
        let offer = pending.offer(response_id);
        self.undos().insert(response_id.clone(), pending);

        info!(
            response_id = %response_id,
            voter_id = %offer.voter_id,
            decision = offer.decision.label(),
            deadline = %offer.deadline,
            "decisive vote, undo window open"
        );
        self.emit(
            "on_decisive",
            response_id,
            self.inner.events.on_decisive(&offer),
        );

        let engine = self.clone();
        let response_id = response_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {
                    if let Err(err) = engine.expire(&response_id, generation).await {
                        warn!(response_id = %response_id, error = %err, "undo window expiry failed");
                    }
                }
                _ = cancelled => {}
            }
        });

        offer
    }

    /// Deadline reached. The window only resolves if it is still the one that was scheduled;
    /// a cancel that won the lock first leaves nothing to do.
    async fn expire(&self, response_id: &ResponseId, generation: u64) -> Result<(), EngineError> {
        let _guard = self.inner.locks.acquire(response_id).await;

        let pending = {
            let mut undos = self.undos();
            match undos.get(response_id) {
                Some(pending) if pending.generation == generation => undos.remove(response_id),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            return Ok(());
        };

        let id = response_id.clone();
        let tally = run_blocking(&self.inner.store, move |store| store.tally(&id)).await?;
        if self.inner.thresholds.is_crossed(pending.polarity, &tally) {
            self.finalize(response_id, pending.polarity.decision())
                .await?;
        } else {
            self.evaluate(response_id, None, tally).await?;
        }
        Ok(())
    }

    /// Compare-and-set the terminal status. Side effects fire only for the call that won.
    async fn finalize(
        &self,
        response_id: &ResponseId,
        decision: Decision,
    ) -> Result<bool, EngineError> {
        let id = response_id.clone();
        let application = run_blocking(&self.inner.store, move |store| {
            if store.finalize(&id, decision)? {
                store.application(&id)
            } else {
                Ok(None)
            }
        })
        .await?;

        let Some(application) = application else {
            debug!(response_id = %response_id, "already finalized");
            return Ok(false);
        };
        info!(
            response_id = %response_id,
            applicant_id = %application.applicant_id,
            decision = decision.label(),
            "application finalized"
        );
        self.emit(
            "on_finalized",
            response_id,
            self.inner.events.on_finalized(&application, decision),
        );
        Ok(true)
    }

    async fn load(&self, response_id: &ResponseId) -> Result<Application, EngineError> {
        let id = response_id.clone();
        run_blocking(&self.inner.store, move |store| store.application(&id))
            .await?
            .ok_or_else(|| EngineError::NotFound(response_id.clone()))
    }

    async fn require_pending(&self, response_id: &ResponseId) -> Result<Application, EngineError> {
        let application = self.load(response_id).await?;
        if application.status.is_terminal() {
            return Err(EngineError::AlreadyDecided(application.status));
        }
        Ok(application)
    }

    fn undos(&self) -> MutexGuard<'_, HashMap<ResponseId, PendingUndo>> {
        self.inner.undos.lock().expect("undo map mutex poisoned")
    }

    fn emit(&self, hook: &'static str, response_id: &ResponseId, result: Result<(), EventError>) {
        if let Err(err) = result {
            warn!(hook, response_id = %response_id, error = %err, "review event failed");
        }
    }
}

async fn detached<T, F>(work: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    tokio::spawn(work).await?
}

/// Error raised by the decision engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("application {0} not found")]
    NotFound(ResponseId),
    #[error("application already {}", .0.label())]
    AlreadyDecided(ApplicationStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("review task did not complete: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::store::MemoryStore;
    use std::num::NonZeroU32;

    struct SilentEvents;

    impl ReviewEvents for SilentEvents {
        fn on_intake(
            &self,
            _card: &crate::review::intake::ApplicationCard,
        ) -> Result<Option<String>, EventError> {
            Ok(None)
        }

        fn on_decisive(&self, _offer: &UndoOffer) -> Result<(), EventError> {
            Ok(())
        }

        fn on_finalized(
            &self,
            _application: &Application,
            _decision: Decision,
        ) -> Result<(), EventError> {
            Ok(())
        }

        fn on_tally_changed(
            &self,
            _response_id: &ResponseId,
            _tally: &Tally,
        ) -> Result<(), EventError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_after_the_deadline_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let id = ResponseId::from("resp-1");
        let alice = VoterId::from("alice");
        store
            .insert_application(Application::new(
                id.clone(),
                "123456789012345678".to_string(),
                Utc::now(),
            ))
            .expect("seed");
        let one = NonZeroU32::MIN;
        let engine = DecisionEngine::new(
            Arc::clone(&store),
            Arc::new(SilentEvents),
            Thresholds::new(one, one),
            Duration::from_secs(30),
        );

        engine
            .handle_vote(&id, &alice, Polarity::Approve)
            .await
            .expect("decisive vote");
        // The deadline has passed but the expiry task has not run yet.
        if let Some(pending) = engine.undos().get_mut(&id) {
            pending.deadline = Utc::now() - chrono::Duration::seconds(1);
        }

        let outcome = engine.cancel(&id, &alice).await.expect("cancel");
        assert_eq!(outcome, CancelOutcome::NotPending);
        assert!(engine.pending_undo(&id).is_some());
        assert_eq!(store.tally(&id).expect("tally"), Tally { approve: 1, deny: 0 });
        engine.clear_pending_undos();
    }

    #[tokio::test]
    async fn locks_serialize_the_same_application() {
        let locks = Arc::new(ApplicationLocks::default());
        let id = ResponseId::from("resp-1");

        let first = locks.acquire(&id).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let id = id.clone();
            tokio::spawn(async move {
                let _second = locks.acquire(&id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.expect("waiter completes");
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn locks_do_not_block_other_applications() {
        let locks = ApplicationLocks::default();
        let _first = locks.acquire(&ResponseId::from("resp-1")).await;
        let _second = locks.acquire(&ResponseId::from("resp-2")).await;
        assert_eq!(locks.len(), 2);
    }
}
