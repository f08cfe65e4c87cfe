use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::domain::QuestionTitles;
use super::events::ReviewEvents;
use super::intake::Intake;
use super::rate::RateGovernor;
use super::source::FormSource;
use super::store::{run_blocking, ReviewStore, StoreError};
use crate::config::AppConfig;

const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// What a single poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// The rate governor refused the call; nothing was touched.
    RateLimited,
    /// The source failed; processed markers were left alone.
    FetchFailed,
    Completed(TickReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub fetched: usize,
    pub ingested: usize,
    /// Already processed on an earlier cycle.
    pub skipped: usize,
    /// Permanently unusable and marked processed.
    pub malformed: usize,
    /// Transient failures left for the next cycle.
    pub failed: usize,
}

/// Periodically pulls submissions from a [`FormSource`] and feeds unseen ones to [`Intake`].
pub struct Poller<S, E, F> {
    store: Arc<S>,
    source: Arc<F>,
    intake: Intake<S, E>,
    governor: RateGovernor,
    poll_interval: Duration,
    marker_ttl_days: u32,
    titles: Option<QuestionTitles>,
}

impl<S, E, F> Poller<S, E, F>
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
    F: FormSource + 'static,
{
    pub fn new(
        store: Arc<S>,
        source: Arc<F>,
        intake: Intake<S, E>,
        governor: RateGovernor,
        poll_interval: Duration,
        marker_ttl_days: u32,
    ) -> Self {
        Self {
            store,
            source,
            intake,
            governor,
            poll_interval,
            marker_ttl_days,
            titles: None,
        }
    }

    pub fn from_config(store: Arc<S>, events: Arc<E>, source: Arc<F>, config: &AppConfig) -> Self {
        let review = &config.review;
        let intake = Intake::new(
            Arc::clone(&store),
            events,
            config.intake.applicant_id_question.clone(),
        );
        let governor =
            RateGovernor::new(review.rate_window, review.rate_ceiling, review.rate_backoff);
        Self::new(
            store,
            source,
            intake,
            governor,
            review.poll_interval,
            config.storage.processed_marker_ttl_days,
        )
    }

    /// Poll until `shutdown` resolves. Markers are swept on the first iteration and daily
    /// after that.
    pub async fn run<Sd>(mut self, shutdown: Sd)
    where
        Sd: Future<Output = ()>,
    {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweeper = interval(SWEEP_PERIOD);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            "poller started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sweeper.tick() => {
                    if let Err(err) = self.sweep().await {
                        error!(error = %err, "processed marker sweep failed");
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("poller stopped");
    }

    /// Run one poll cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        if !self.governor.admit() {
            debug!("poll skipped by rate governor");
            return TickOutcome::RateLimited;
        }

        let submissions = match self.source.fetch_new().await {
            Ok(submissions) => submissions,
            Err(err) => {
                warn!(error = %err, "form source fetch failed");
                return TickOutcome::FetchFailed;
            }
        };
        self.governor.record();
        self.refresh_titles().await;

        let mut report = TickReport {
            fetched: submissions.len(),
            ..TickReport::default()
        };
        let titles = self.titles.clone().unwrap_or_default();

        for submission in submissions {
            let response_id = submission.response_id.clone();
            let id = response_id.clone();
            match run_blocking(&self.store, move |store| store.is_processed(&id)).await {
                Ok(true) => {
                    report.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(response_id = %response_id, error = %err, "processed marker lookup failed");
                    report.failed += 1;
                    continue;
                }
            }

            let malformed = match self.intake.ingest(&submission, &titles).await {
                Ok(_) => false,
                Err(err) if err.is_malformed() => {
                    err.log();
                    true
                }
                Err(err) => {
                    err.log();
                    report.failed += 1;
                    continue;
                }
            };

            let id = response_id.clone();
            match run_blocking(&self.store, move |store| store.mark_processed(&id)).await {
                Ok(()) if malformed => report.malformed += 1,
                Ok(()) => report.ingested += 1,
                Err(err) => {
                    warn!(response_id = %response_id, error = %err, "failed to mark response processed");
                    report.failed += 1;
                }
            }
        }

        if report.ingested > 0 || report.malformed > 0 || report.failed > 0 {
            info!(
                fetched = report.fetched,
                ingested = report.ingested,
                skipped = report.skipped,
                malformed = report.malformed,
                failed = report.failed,
                "poll cycle complete"
            );
        }
        TickOutcome::Completed(report)
    }

    pub async fn sweep(&self) -> Result<usize, StoreError> {
        sweep_processed_markers(&self.store, self.marker_ttl_days).await
    }

    pub fn cached_titles(&self) -> Option<&QuestionTitles> {
        self.titles.as_ref()
    }

    async fn refresh_titles(&mut self) {
        if self.titles.is_some() || !self.governor.admit() {
            return;
        }
        match self.source.question_titles().await {
            Ok(titles) => {
                self.governor.record();
                debug!(questions = titles.len(), "cached question titles");
                self.titles = Some(titles);
            }
            Err(err) => warn!(error = %err, "failed to load question titles"),
        }
    }
}

/// Delete processed markers older than `ttl_days`, keeping those of pending applications.
pub async fn sweep_processed_markers<S>(store: &Arc<S>, ttl_days: u32) -> Result<usize, StoreError>
where
    S: ReviewStore + ?Sized + 'static,
{
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(ttl_days));
    let removed = run_blocking(store, move |store| store.sweep_processed(cutoff)).await?;
    info!(removed, ttl_days, "swept processed markers");
    Ok(removed)
}
