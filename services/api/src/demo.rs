use crate::infra::{EventLog, ReviewEvent};
use application_review::error::AppError;
use application_review::review::{
    Answers, ApplicationStatus, CancelOutcome, DecisionEngine, Intake, MemoryStore, Polarity,
    QuestionTitles, RawAnswer, RawSubmission, ResponseId, ReviewStore, Thresholds, VoteReport,
    VoterId,
};
use chrono::Utc;
use clap::Args;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Undo window used by the demo, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub(crate) undo_window_ms: u64,
    /// Approvals needed to accept.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) acceptance: u32,
    /// Denials needed to deny.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) denial: u32,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        undo_window_ms,
        acceptance,
        denial,
    } = args;
    let undo_window = Duration::from_millis(undo_window_ms);
    let thresholds = Thresholds::new(positive(acceptance), positive(denial));

    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(EventLog::default());
    let intake = Intake::new(Arc::clone(&store), Arc::clone(&events), None);
    let engine = DecisionEngine::new(
        Arc::clone(&store),
        Arc::clone(&events),
        thresholds,
        undo_window,
    );

    println!("Application review demo");
    println!(
        "Thresholds: accept at {} approvals, deny at {} denials; undo window {} ms",
        acceptance, denial, undo_window_ms
    );

    let submission = demo_submission();
    let response_id = submission.response_id.clone();
    let report = intake.ingest(&submission, &QuestionTitles::new()).await?;
    println!(
        "\nIngested {} for applicant {} (card {})",
        response_id,
        report.application.applicant_id,
        report
            .application
            .external_message_ref
            .as_deref()
            .unwrap_or("none")
    );

    let a = VoterId::from("reviewer-a");
    let b = VoterId::from("reviewer-b");

    let vote = engine.handle_vote(&response_id, &a, Polarity::Deny).await?;
    print_vote("reviewer-a denies", &vote);

    let cancel = engine.cancel(&response_id, &a).await?;
    print_cancel("reviewer-a cancels", &cancel);

    let vote = engine.handle_vote(&response_id, &b, Polarity::Deny).await?;
    print_vote("reviewer-b denies", &vote);

    println!("\nWaiting for the undo window to close...");
    let status = wait_for_decision(&store, &response_id, undo_window).await?;
    println!("Final status: {}", status.label());

    println!("\nEvent log");
    for entry in events.entries() {
        println!("- {} {}", entry.at.format("%H:%M:%S%.3f"), describe(&entry.event));
    }

    let stats = store.stats()?;
    println!(
        "\nApplications: {} total, {} pending, {} accepted, {} denied",
        stats.total, stats.pending, stats.accepted, stats.denied
    );
    Ok(())
}

fn positive(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

fn demo_submission() -> RawSubmission {
    RawSubmission {
        response_id: ResponseId::from("demo-response-1"),
        submitted_at: Utc::now(),
        answers: Answers::from([
            ("name".to_string(), RawAnswer::text(&["Jane Doe"])),
            ("platform_id".to_string(), RawAnswer::text(&["123456789012345678"])),
            (
                "why".to_string(),
                RawAnswer::text(&["Friends from https://discord.gg/example invited me"]),
            ),
        ]),
    }
}

async fn wait_for_decision(
    store: &MemoryStore,
    response_id: &ResponseId,
    undo_window: Duration,
) -> Result<ApplicationStatus, AppError> {
    let deadline = tokio::time::Instant::now() + undo_window + Duration::from_secs(2);
    loop {
        let status = store
            .application(response_id)?
            .map(|application| application.status)
            .unwrap_or(ApplicationStatus::Pending);
        if status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn print_vote(label: &str, report: &VoteReport) {
    println!(
        "\n{}: tally approve={} deny={}",
        label, report.tally.approve, report.tally.deny
    );
    match &report.undo {
        Some(offer) => println!(
            "  Decisive: {} may undo '{}' until {}",
            offer.voter_id,
            offer.decision.label(),
            offer.deadline.format("%H:%M:%S%.3f")
        ),
        None => println!("  Not decisive"),
    }
}

fn print_cancel(label: &str, outcome: &CancelOutcome) {
    match outcome {
        CancelOutcome::Cancelled { tally, reopened } => {
            println!(
                "\n{}: vote removed, tally approve={} deny={}",
                label, tally.approve, tally.deny
            );
            if let Some(offer) = reopened {
                println!("  Remaining votes reopened a window for {}", offer.voter_id);
            }
        }
        CancelOutcome::NotPending => println!("\n{}: nothing to undo", label),
        CancelOutcome::AlreadyFinalized { status } => {
            println!("\n{}: too late, already {}", label, status.label())
        }
    }
}

fn describe(event: &ReviewEvent) -> String {
    match event {
        ReviewEvent::Intake {
            response_id,
            message_ref,
            card,
        } => format!(
            "intake {} as {} ({} fields)",
            response_id,
            message_ref,
            card.fields.len()
        ),
        ReviewEvent::Decisive { offer } => format!(
            "decisive {} by {} ({})",
            offer.response_id,
            offer.voter_id,
            offer.decision.label()
        ),
        ReviewEvent::Finalized {
            response_id,
            decision,
            ..
        } => format!("finalized {} {}", response_id, decision.label()),
        ReviewEvent::TallyChanged { response_id, tally } => format!(
            "tally {} approve={} deny={}",
            response_id, tally.approve, tally.deny
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_scenario_ends_denied() {
        let args = DemoArgs {
            undo_window_ms: 50,
            acceptance: 3,
            denial: 1,
        };
        run_demo(args).await.expect("demo runs");
    }

    #[test]
    fn demo_submission_has_an_applicant_id() {
        let submission = demo_submission();
        assert_eq!(
            application_review::review::extract_applicant_id(&submission, None).as_deref(),
            Some("123456789012345678")
        );
    }
}
