//! In-memory implementation of [`ReviewStore`] used by the demo and tests.
//!
//! All state sits behind a single mutex, so every operation is trivially atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{ApplicationStats, ReviewStore, StoreError, VoteChange, VoteOutcome};
use crate::review::domain::{
    Application, ApplicationStatus, Decision, Polarity, ResponseId, Tally, Vote, VoterId,
};

#[derive(Default)]
struct MemoryState {
    processed: HashMap<ResponseId, DateTime<Utc>>,
    applications: BTreeMap<ResponseId, Application>,
    votes: BTreeMap<ResponseId, Vec<Vote>>,
}

impl MemoryState {
    fn tally(&self, response_id: &ResponseId) -> Tally {
        let mut tally = Tally::default();
        for vote in self.votes.get(response_id).into_iter().flatten() {
            match vote.polarity {
                Polarity::Approve => tally.approve += 1,
                Polarity::Deny => tally.deny += 1,
            }
        }
        tally
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory store mutex poisoned")
    }
}

impl ReviewStore for MemoryStore {
    fn is_processed(&self, response_id: &ResponseId) -> Result<bool, StoreError> {
        Ok(self.state().processed.contains_key(response_id))
    }

    fn mark_processed(&self, response_id: &ResponseId) -> Result<(), StoreError> {
        self.state()
            .processed
            .entry(response_id.clone())
            .or_insert_with(Utc::now);
        Ok(())
    }

    fn sweep_processed(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state();
        let MemoryState {
            processed,
            applications,
            ..
        } = &mut *state;
        let before = processed.len();
        processed.retain(|id, processed_at| {
            *processed_at >= cutoff
                || applications
                    .get(id)
                    .map(Application::is_pending)
                    .unwrap_or(false)
        });
        Ok(before - processed.len())
    }

    fn insert_application(&self, application: Application) -> Result<Application, StoreError> {
        let mut state = self.state();
        let stored = state
            .applications
            .entry(application.response_id.clone())
            .or_insert(application);
        Ok(stored.clone())
    }

    fn attach_message_ref(
        &self,
        response_id: &ResponseId,
        message_ref: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let taken = state.applications.values().any(|application| {
            &application.response_id != response_id
                && application.external_message_ref.as_deref() == Some(message_ref)
        });
        if taken {
            return Err(StoreError::DuplicateMessageRef(message_ref.to_string()));
        }
        let application = state
            .applications
            .get_mut(response_id)
            .ok_or(StoreError::NotFound)?;
        application.external_message_ref = Some(message_ref.to_string());
        application.updated_at = Utc::now();
        Ok(())
    }

    fn application(&self, response_id: &ResponseId) -> Result<Option<Application>, StoreError> {
        Ok(self.state().applications.get(response_id).cloned())
    }

    fn application_by_message_ref(
        &self,
        message_ref: &str,
    ) -> Result<Option<Application>, StoreError> {
        Ok(self
            .state()
            .applications
            .values()
            .find(|application| application.external_message_ref.as_deref() == Some(message_ref))
            .cloned())
    }

    fn pending_applications(&self, limit: usize) -> Result<Vec<Application>, StoreError> {
        let state = self.state();
        let mut pending: Vec<Application> = state
            .applications
            .values()
            .filter(|application| application.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|application| application.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    fn finalize(&self, response_id: &ResponseId, decision: Decision) -> Result<bool, StoreError> {
        let mut state = self.state();
        let application = state
            .applications
            .get_mut(response_id)
            .ok_or(StoreError::NotFound)?;
        if application.status != ApplicationStatus::Pending {
            return Ok(false);
        }
        application.status = decision.status();
        application.updated_at = Utc::now();
        Ok(true)
    }

    fn stats(&self) -> Result<ApplicationStats, StoreError> {
        let state = self.state();
        let mut stats = ApplicationStats::default();
        for application in state.applications.values() {
            stats.total += 1;
            match application.status {
                ApplicationStatus::Pending => stats.pending += 1,
                ApplicationStatus::Accepted => stats.accepted += 1,
                ApplicationStatus::Denied => stats.denied += 1,
            }
        }
        Ok(stats)
    }

    fn cast_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
        polarity: Polarity,
    ) -> Result<VoteOutcome, StoreError> {
        let mut state = self.state();
        if !state.applications.contains_key(response_id) {
            return Err(StoreError::NotFound);
        }
        let votes = state.votes.entry(response_id.clone()).or_default();
        let position = votes.iter().position(|vote| &vote.voter_id == voter_id);

        let change = match position {
            None => {
                votes.push(Vote {
                    response_id: response_id.clone(),
                    voter_id: voter_id.clone(),
                    polarity,
                    cast_at: Utc::now(),
                });
                VoteChange::Added
            }
            Some(index) if votes[index].polarity == polarity => {
                votes.remove(index);
                VoteChange::Retracted
            }
            Some(index) => {
                let mut vote = votes.remove(index);
                let from = vote.polarity;
                vote.polarity = polarity;
                vote.cast_at = Utc::now();
                votes.push(vote);
                VoteChange::Switched { from }
            }
        };

        Ok(VoteOutcome {
            change,
            tally: state.tally(response_id),
        })
    }

    fn current_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<Option<Polarity>, StoreError> {
        Ok(self
            .state()
            .votes
            .get(response_id)
            .and_then(|votes| votes.iter().find(|vote| &vote.voter_id == voter_id))
            .map(|vote| vote.polarity))
    }

    fn tally(&self, response_id: &ResponseId) -> Result<Tally, StoreError> {
        Ok(self.state().tally(response_id))
    }

    fn clear_vote(
        &self,
        response_id: &ResponseId,
        voter_id: &VoterId,
    ) -> Result<Tally, StoreError> {
        let mut state = self.state();
        if let Some(votes) = state.votes.get_mut(response_id) {
            votes.retain(|vote| &vote.voter_id != voter_id);
        }
        Ok(state.tally(response_id))
    }

    fn votes(&self, response_id: &ResponseId) -> Result<Vec<Vote>, StoreError> {
        Ok(self
            .state()
            .votes
            .get(response_id)
            .cloned()
            .unwrap_or_default())
    }
}
