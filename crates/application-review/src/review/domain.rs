use std::fmt;
use std::num::NonZeroU32;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Opaque identifier the form provider assigns to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResponseId(pub String);

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResponseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Platform identity of a reviewer casting votes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoterId(pub String);

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VoterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Direction of a reviewer's vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Approve,
    Deny,
}

impl Polarity {
    pub fn label(&self) -> &'static str {
        match self {
            Polarity::Approve => "approve",
            Polarity::Deny => "deny",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approve" => Some(Polarity::Approve),
            "deny" => Some(Polarity::Deny),
            _ => None,
        }
    }

    /// The outcome an application receives when this polarity wins.
    pub fn decision(&self) -> Decision {
        match self {
            Polarity::Approve => Decision::Accepted,
            Polarity::Deny => Decision::Denied,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Polarity::Approve => Polarity::Deny,
            Polarity::Deny => Polarity::Approve,
        }
    }
}

/// Terminal outcome of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Denied,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        self.status().label()
    }

    pub fn status(&self) -> ApplicationStatus {
        match self {
            Decision::Accepted => ApplicationStatus::Accepted,
            Decision::Denied => ApplicationStatus::Denied,
        }
    }

    pub fn polarity(&self) -> Polarity {
        match self {
            Decision::Accepted => Polarity::Approve,
            Decision::Denied => Polarity::Deny,
        }
    }
}

/// Lifecycle state of an application. Only `Pending` may change, and only once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Accepted,
    Denied,
}

impl ApplicationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Denied => "denied",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ApplicationStatus::Pending),
            "accepted" => Some(ApplicationStatus::Accepted),
            "denied" => Some(ApplicationStatus::Denied),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApplicationStatus::Pending)
    }
}

/// A submission under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub response_id: ResponseId,
    pub applicant_id: String,
    pub submitted_at: DateTime<Utc>,
    pub external_message_ref: Option<String>,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn new(response_id: ResponseId, applicant_id: String, submitted_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            response_id,
            applicant_id,
            submitted_at,
            external_message_ref: None,
            status: ApplicationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApplicationStatus::Pending
    }
}

/// A reviewer's live vote on one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub response_id: ResponseId,
    pub voter_id: VoterId,
    pub polarity: Polarity,
    pub cast_at: DateTime<Utc>,
}

/// Live vote counts for one application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approve: u32,
    pub deny: u32,
}

impl Tally {
    pub fn get(&self, polarity: Polarity) -> u32 {
        match polarity {
            Polarity::Approve => self.approve,
            Polarity::Deny => self.deny,
        }
    }

    pub fn total(&self) -> u32 {
        self.approve + self.deny
    }
}

/// Vote counts at which each polarity decides an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub acceptance: NonZeroU32,
    pub denial: NonZeroU32,
}

impl Thresholds {
    pub fn new(acceptance: NonZeroU32, denial: NonZeroU32) -> Self {
        Self { acceptance, denial }
    }

    pub fn for_polarity(&self, polarity: Polarity) -> u32 {
        match polarity {
            Polarity::Approve => self.acceptance.get(),
            Polarity::Deny => self.denial.get(),
        }
    }

    /// True when an increment of `polarity` is exactly what brought the tally to its threshold.
    pub fn is_decisive(&self, polarity: Polarity, tally: &Tally) -> bool {
        let threshold = self.for_polarity(polarity);
        let count = tally.get(polarity);
        count == threshold && count - 1 < threshold
    }

    pub fn is_crossed(&self, polarity: Polarity, tally: &Tally) -> bool {
        tally.get(polarity) >= self.for_polarity(polarity)
    }
}

/// Answers keyed by question id, in the order the form presents them.
pub type Answers = IndexMap<String, RawAnswer>;

/// Question id to title, in form order.
pub type QuestionTitles = IndexMap<String, String>;

/// A single answer as delivered by the form provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawAnswer {
    #[serde(rename = "textAnswers", default, skip_serializing_if = "Option::is_none")]
    pub text_answers: Option<TextAnswers>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextAnswers {
    #[serde(default)]
    pub answers: Vec<TextAnswer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextAnswer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl RawAnswer {
    pub fn text(values: &[&str]) -> Self {
        Self {
            text_answers: Some(TextAnswers {
                answers: values
                    .iter()
                    .map(|value| TextAnswer {
                        value: Some(serde_json::Value::String(value.to_string())),
                    })
                    .collect(),
            }),
        }
    }

    /// The first answer value when it is a string.
    pub fn first_text(&self) -> Option<&str> {
        self.text_answers
            .as_ref()?
            .answers
            .first()?
            .value
            .as_ref()?
            .as_str()
    }

    /// All answer values joined for display; non-string values are rendered as JSON.
    pub fn joined(&self) -> String {
        match &self.text_answers {
            Some(text) => text
                .answers
                .iter()
                .filter_map(|answer| answer.value.as_ref())
                .map(|value| match value {
                    serde_json::Value::String(value) => value.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            None => String::new(),
        }
    }
}

/// A form response as fetched from the external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSubmission {
    #[serde(rename = "responseId")]
    pub response_id: ResponseId,
    #[serde(rename = "createTime")]
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub answers: Answers,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(acceptance: u32, denial: u32) -> Thresholds {
        Thresholds::new(
            NonZeroU32::new(acceptance).expect("positive"),
            NonZeroU32::new(denial).expect("positive"),
        )
    }

    #[test]
    fn decisive_only_at_the_exact_threshold() {
        let thresholds = thresholds(3, 2);
        assert!(thresholds.is_decisive(Polarity::Approve, &Tally { approve: 3, deny: 1 }));
        assert!(thresholds.is_decisive(Polarity::Deny, &Tally { approve: 1, deny: 2 }));
        assert!(!thresholds.is_decisive(Polarity::Approve, &Tally { approve: 2, deny: 1 }));
        assert!(!thresholds.is_decisive(Polarity::Deny, &Tally { approve: 2, deny: 1 }));
        assert!(!thresholds.is_decisive(Polarity::Approve, &Tally { approve: 4, deny: 0 }));
        assert!(thresholds.is_crossed(Polarity::Approve, &Tally { approve: 4, deny: 0 }));
    }

    #[test]
    fn unit_thresholds_make_the_first_vote_decisive() {
        let thresholds = thresholds(1, 1);
        assert!(thresholds.is_decisive(Polarity::Approve, &Tally { approve: 1, deny: 0 }));
        assert!(thresholds.is_decisive(Polarity::Deny, &Tally { approve: 0, deny: 1 }));
    }

    #[test]
    fn raw_submission_parses_provider_payload() {
        let payload = serde_json::json!({
            "responseId": "resp-1",
            "createTime": "2025-03-01T12:00:00.123Z",
            "answers": {
                "q1": { "textAnswers": { "answers": [{ "value": "123456789012345678" }] } },
                "q2": { "textAnswers": { "answers": [{ "value": "a" }, { "value": 7 }] } },
                "q3": {}
            }
        });
        let submission: RawSubmission = serde_json::from_value(payload).expect("parses");
        assert_eq!(submission.response_id, ResponseId::from("resp-1"));
        assert_eq!(
            submission.answers["q1"].first_text(),
            Some("123456789012345678")
        );
        assert_eq!(submission.answers["q2"].joined(), "a, 7");
        assert_eq!(submission.answers["q3"].first_text(), None);
    }

    #[test]
    fn answers_keep_form_order() {
        let payload = r#"{
            "responseId": "resp-1",
            "createTime": "2025-03-01T12:00:00Z",
            "answers": {
                "zz_name": { "textAnswers": { "answers": [{ "value": "Jane" }] } },
                "aa_id": { "textAnswers": { "answers": [{ "value": "123456789012345678" }] } }
            }
        }"#;
        let submission: RawSubmission = serde_json::from_str(payload).expect("parses");
        let ids: Vec<&str> = submission.answers.keys().map(String::as_str).collect();
        assert_eq!(ids, ["zz_name", "aa_id"]);
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            ApplicationStatus::Pending,
            ApplicationStatus::Accepted,
            ApplicationStatus::Denied,
        ] {
            assert_eq!(ApplicationStatus::parse(status.label()), Some(status));
        }
        assert_eq!(Decision::Denied.status(), ApplicationStatus::Denied);
        assert_eq!(Polarity::Approve.decision(), Decision::Accepted);
    }
}
