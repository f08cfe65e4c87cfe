use super::common::*;
use std::sync::Arc;

use crate::review::domain::{ApplicationStatus, Decision, QuestionTitles, RawAnswer};
use crate::review::intake::{Intake, IntakeError};
use crate::review::store::{MemoryStore, ReviewStore};

fn intake(
    events: RecordingEvents,
) -> (
    Intake<MemoryStore, RecordingEvents>,
    Arc<MemoryStore>,
    Arc<RecordingEvents>,
) {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(events);
    let intake = Intake::new(Arc::clone(&store), Arc::clone(&events), None);
    (intake, store, events)
}

#[tokio::test]
async fn ingest_stores_a_pending_application_and_announces_it() {
    let (intake, store, events) = intake(RecordingEvents::with_message_refs());

    let report = intake
        .ingest(&submission("resp-1", APPLICANT), &QuestionTitles::new())
        .await
        .expect("ingest");

    assert!(report.announced);
    assert_eq!(report.application.applicant_id, APPLICANT);
    assert_eq!(report.application.status, ApplicationStatus::Pending);
    assert_eq!(
        report.application.external_message_ref.as_deref(),
        Some("msg-resp-1")
    );

    let cards = events.intakes();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].title, "Jane");
    assert_eq!(
        store
            .application_by_message_ref("msg-resp-1")
            .expect("lookup")
            .map(|application| application.response_id),
        Some(rid("resp-1"))
    );
}

#[tokio::test]
async fn repeated_ingest_does_not_announce_twice() {
    let (intake, store, events) = intake(RecordingEvents::with_message_refs());
    let submission = submission("resp-1", APPLICANT);

    intake
        .ingest(&submission, &QuestionTitles::new())
        .await
        .expect("first");
    let again = intake
        .ingest(&submission, &QuestionTitles::new())
        .await
        .expect("second");

    assert!(!again.announced);
    assert_eq!(events.intakes().len(), 1);
    assert_eq!(store.stats().expect("stats").total, 1);
}

#[tokio::test]
async fn unannounced_pending_applications_are_announced_on_retry() {
    let (intake, _store, events) = intake(RecordingEvents::default());
    events.fail_intake(true);
    let submission = submission("resp-1", APPLICANT);

    let failed = intake.ingest(&submission, &QuestionTitles::new()).await;
    assert!(matches!(failed, Err(IntakeError::Event(_))));
    assert!(!failed.expect_err("event failure").is_malformed());

    events.fail_intake(false);
    let retried = intake
        .ingest(&submission, &QuestionTitles::new())
        .await
        .expect("retry");
    assert!(retried.announced);
    assert_eq!(events.intakes().len(), 1);
}

#[tokio::test]
async fn decided_applications_are_never_announced_again() {
    let (intake, store, events) = intake(RecordingEvents::default());
    let submission = submission("resp-1", APPLICANT);
    intake
        .ingest(&submission, &QuestionTitles::new())
        .await
        .expect("ingest");
    store
        .finalize(&rid("resp-1"), Decision::Denied)
        .expect("finalize");

    let again = intake
        .ingest(&submission, &QuestionTitles::new())
        .await
        .expect("ingest again");
    assert!(!again.announced);
    assert_eq!(again.application.status, ApplicationStatus::Denied);
    assert_eq!(events.intakes().len(), 1);
}

#[tokio::test]
async fn submissions_without_an_applicant_id_are_malformed() {
    let (intake, store, events) = intake(RecordingEvents::default());
    let mut submission = submission("resp-1", "not-an-id");
    submission
        .answers
        .insert("q4".to_string(), RawAnswer::text(&["12345"]));

    let err = intake
        .ingest(&submission, &QuestionTitles::new())
        .await
        .expect_err("no applicant id");
    assert!(err.is_malformed());
    assert!(store.application(&rid("resp-1")).expect("read").is_none());
    assert!(events.intakes().is_empty());
}

#[tokio::test]
async fn configured_question_selects_the_applicant_id() {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(RecordingEvents::default());
    let intake = Intake::new(
        Arc::clone(&store),
        Arc::clone(&events),
        Some("q9".to_string()),
    );
    let mut submission = submission("resp-1", APPLICANT);
    submission.answers.insert(
        "entry.q9".to_string(),
        RawAnswer::text(&["<@223456789012345678>"]),
    );

    let report = intake
        .ingest(&submission, &QuestionTitles::new())
        .await
        .expect("ingest");
    assert_eq!(report.application.applicant_id, "223456789012345678");
}

#[tokio::test]
async fn cards_are_labelled_with_question_titles() {
    let (intake, _store, events) = intake(RecordingEvents::default());
    let titles = QuestionTitles::from([
        ("q2".to_string(), "Platform id".to_string()),
        ("q3".to_string(), "Why join?".to_string()),
    ]);

    intake
        .ingest(&submission("resp-1", APPLICANT), &titles)
        .await
        .expect("ingest");

    let card = events.intakes().pop().expect("card");
    let labels: Vec<&str> = card.fields.iter().map(|field| field.label.as_str()).collect();
    assert_eq!(labels, vec!["Platform id", "Why join?"]);
}
