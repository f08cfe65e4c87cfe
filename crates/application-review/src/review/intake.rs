//! Conversion of raw form submissions into pending applications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::domain::{Answers, Application, QuestionTitles, RawAnswer, RawSubmission, ResponseId};
use super::events::{EventError, ReviewEvents};
use super::store::{run_blocking, ReviewStore, StoreError};

/// Smallest snowflake the platform can issue (the first id after its epoch).
const MIN_SNOWFLAKE: u64 = 4_194_304;
const ENTRY_PREFIX: &str = "entry.";
const EMPTY_ANSWER: &str = "*No answer provided*";

/// Presentation-ready rendering of an application handed to `on_intake`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationCard {
    pub response_id: ResponseId,
    pub applicant_id: String,
    pub title: String,
    pub submitted_at: DateTime<Utc>,
    pub fields: Vec<CardField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardField {
    pub question_id: String,
    pub label: String,
    pub value: String,
}

impl ApplicationCard {
    /// Render a submission. The first answer becomes the title; remaining answers follow in
    /// question order, labelled with `titles` where known.
    pub fn build(
        submission: &RawSubmission,
        applicant_id: &str,
        titles: &QuestionTitles,
    ) -> Self {
        let mut answers = submission.answers.iter();
        let first = answers.next();

        let title = first
            .and_then(|(_, answer)| answer.first_text())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(sanitize)
            .unwrap_or_else(|| applicant_id.to_string());
        let first_id = first.map(|(id, _)| id.as_str());

        let order: Vec<&String> = if titles.is_empty() {
            answers.map(|(id, _)| id).collect()
        } else {
            titles
                .keys()
                .filter(|id| Some(id.as_str()) != first_id)
                .filter(|id| submission.answers.contains_key(id.as_str()))
                .collect()
        };

        let fields = order
            .into_iter()
            .map(|id| {
                let label = titles
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("Question {id}"));
                let value = submission
                    .answers
                    .get(id)
                    .map(RawAnswer::joined)
                    .filter(|text| !text.trim().is_empty())
                    .map(|text| sanitize(&text))
                    .unwrap_or_else(|| EMPTY_ANSWER.to_string());
                CardField {
                    question_id: id.clone(),
                    label,
                    value,
                }
            })
            .collect();

        Self {
            response_id: submission.response_id.clone(),
            applicant_id: applicant_id.to_string(),
            title,
            submitted_at: submission.submitted_at,
            fields,
        }
    }
}

/// Break mentions and code fences and defang links so answer text renders inertly.
pub fn sanitize(text: &str) -> String {
    text.replace('@', "@\u{200b}")
        .replace('`', "`\u{200b}")
        .replace("://", "[://]")
        .replace("discord.gg", "discord[.]gg")
}

/// Normalize a candidate snowflake: digits only, 17 to 20 of them, within `u64`, and no
/// earlier than the platform epoch.
pub fn validate_snowflake(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if !(17..=20).contains(&digits.len()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    (value >= MIN_SNOWFLAKE).then(|| value.to_string())
}

/// Locate the applicant's platform id in a submission.
///
/// When `question` is configured and answered, that answer alone decides. Otherwise every
/// answer is scanned and the first valid snowflake wins.
pub fn extract_applicant_id(submission: &RawSubmission, question: Option<&str>) -> Option<String> {
    if let Some(answer) = question.and_then(|id| configured_answer(&submission.answers, id)) {
        return answer.first_text().and_then(validate_snowflake);
    }

    submission
        .answers
        .values()
        .filter_map(RawAnswer::first_text)
        .find_map(validate_snowflake)
}

fn configured_answer<'a>(
    answers: &'a Answers,
    question: &str,
) -> Option<&'a RawAnswer> {
    let question = question.trim();
    answers
        .get(question)
        .or_else(|| answers.get(&format!("{ENTRY_PREFIX}{question}")))
        .or_else(|| {
            question
                .strip_prefix(ENTRY_PREFIX)
                .and_then(|stripped| answers.get(stripped))
        })
}

/// Result of a successful intake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeReport {
    pub application: Application,
    /// Whether `on_intake` fired for this submission.
    pub announced: bool,
}

/// Persists new applications and announces them to the presentation layer.
pub struct Intake<S, E> {
    store: Arc<S>,
    events: Arc<E>,
    applicant_id_question: Option<String>,
}

impl<S, E> Intake<S, E>
where
    S: ReviewStore + 'static,
    E: ReviewEvents + 'static,
{
    pub fn new(store: Arc<S>, events: Arc<E>, applicant_id_question: Option<String>) -> Self {
        Self {
            store,
            events,
            applicant_id_question,
        }
    }

    /// Ingest a submission. Safe to repeat for the same response id: the application is only
    /// inserted once, and it is announced again only while it is pending without a message
    /// reference.
    pub async fn ingest(
        &self,
        submission: &RawSubmission,
        titles: &QuestionTitles,
    ) -> Result<IntakeReport, IntakeError> {
        let response_id = submission.response_id.clone();
        let applicant_id =
            extract_applicant_id(submission, self.applicant_id_question.as_deref()).ok_or_else(
                || IntakeError::MissingApplicantId {
                    response_id: response_id.clone(),
                },
            )?;

        let candidate = Application::new(
            response_id.clone(),
            applicant_id.clone(),
            submission.submitted_at,
        );
        let application =
            run_blocking(&self.store, move |store| store.insert_application(candidate)).await?;

        if !application.is_pending() || application.external_message_ref.is_some() {
            info!(
                response_id = %response_id,
                status = application.status.label(),
                "application already recorded"
            );
            return Ok(IntakeReport {
                application,
                announced: false,
            });
        }

        let card = ApplicationCard::build(submission, &applicant_id, titles);
        let message_ref = self.events.on_intake(&card)?;

        let mut application = application;
        if let Some(message_ref) = message_ref {
            let id = response_id.clone();
            let stored_ref = message_ref.clone();
            run_blocking(&self.store, move |store| {
                store.attach_message_ref(&id, &stored_ref)
            })
            .await?;
            application.external_message_ref = Some(message_ref);
        }

        info!(
            response_id = %response_id,
            applicant_id = %applicant_id,
            "application ingested"
        );
        Ok(IntakeReport {
            application,
            announced: true,
        })
    }
}

/// Error raised while ingesting a submission.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("submission {response_id} has no valid applicant id")]
    MissingApplicantId { response_id: ResponseId },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Event(#[from] EventError),
}

impl IntakeError {
    /// Data errors are permanent: retrying the same submission cannot succeed.
    pub fn is_malformed(&self) -> bool {
        matches!(self, IntakeError::MissingApplicantId { .. })
    }

    pub(crate) fn log(&self) {
        match self {
            IntakeError::MissingApplicantId { response_id } => warn!(
                response_id = %response_id,
                "skipping submission without an extractable applicant id"
            ),
            other => warn!(error = %other, "intake failed, submission will be retried"),
        }
    }
}
