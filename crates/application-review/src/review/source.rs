use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::domain::{QuestionTitles, RawSubmission};

/// Supplier of form submissions. Every failure is treated as transient by the poller.
#[async_trait]
pub trait FormSource: Send + Sync {
    /// Fetch the submissions currently available. Already ingested ones may be returned again.
    async fn fetch_new(&self) -> Result<Vec<RawSubmission>, SourceError>;

    /// Question id to title mapping used to label answers, when the source knows it.
    async fn question_titles(&self) -> Result<QuestionTitles, SourceError> {
        Ok(QuestionTitles::new())
    }
}

/// Error enumeration for form source failures.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to read form export {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed form export {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("form source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default, Deserialize)]
struct FormExport {
    #[serde(default)]
    questions: QuestionTitles,
    #[serde(default)]
    responses: Vec<Value>,
}

impl FormExport {
    /// Convert responses one at a time; a record that does not parse is skipped and the rest
    /// are still delivered.
    fn submissions(self, path: &Path) -> Vec<RawSubmission> {
        self.responses
            .into_iter()
            .enumerate()
            .filter_map(|(index, value)| {
                let response_id = value
                    .get("responseId")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                match serde_json::from_value::<RawSubmission>(value) {
                    Ok(submission) => Some(submission),
                    Err(err) => {
                        warn!(
                            path = %path.display(),
                            index,
                            response_id = %response_id,
                            error = %err,
                            "skipping malformed form response"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

/// Reads a form-provider export file on every fetch, so an external process can keep it
/// up to date.
#[derive(Debug, Clone)]
pub struct JsonExportSource {
    path: PathBuf,
}

impl JsonExportSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<FormExport, SourceError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        let export: FormExport =
            serde_json::from_slice(&raw).map_err(|source| SourceError::Parse {
                path: self.path.clone(),
                source,
            })?;
        debug!(
            path = %self.path.display(),
            responses = export.responses.len(),
            "loaded form export"
        );
        Ok(export)
    }
}

#[async_trait]
impl FormSource for JsonExportSource {
    async fn fetch_new(&self) -> Result<Vec<RawSubmission>, SourceError> {
        Ok(self.load().await?.submissions(&self.path))
    }

    async fn question_titles(&self) -> Result<QuestionTitles, SourceError> {
        Ok(self.load().await?.questions)
    }
}
