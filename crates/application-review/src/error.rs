use crate::config::ConfigError;
use crate::review::{EngineError, IntakeError, StoreError};
use crate::telemetry::TelemetryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Store(StoreError),
    Engine(EngineError),
    Intake(IntakeError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Store(err) => write!(f, "store error: {}", err),
            AppError::Engine(err) => write!(f, "review error: {}", err),
            AppError::Intake(err) => write!(f, "intake error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Store(err) => Some(err),
            AppError::Engine(err) => Some(err),
            AppError::Intake(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::Store(StoreError::NotFound) | AppError::Engine(EngineError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Engine(EngineError::AlreadyDecided(_)) => StatusCode::CONFLICT,
            AppError::Intake(ref err) if err.is_malformed() => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_)
            | AppError::Store(_)
            | AppError::Engine(_)
            | AppError::Intake(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<EngineError> for AppError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

impl From<IntakeError> for AppError {
    fn from(value: IntakeError) -> Self {
        Self::Intake(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{ApplicationStatus, ResponseId};
    use crate::review::{EventError, IntakeError};

    #[test]
    fn review_errors_map_to_http_statuses() {
        let missing = AppError::from(EngineError::NotFound(ResponseId::from("resp-1")));
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let decided = AppError::from(EngineError::AlreadyDecided(ApplicationStatus::Denied));
        assert_eq!(decided.into_response().status(), StatusCode::CONFLICT);

        let malformed = AppError::from(IntakeError::MissingApplicantId {
            response_id: ResponseId::from("resp-2"),
        });
        assert_eq!(
            malformed.into_response().status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );

        let offline = AppError::from(IntakeError::Event(EventError::Transport(
            "review channel offline".to_string(),
        )));
        assert_eq!(
            offline.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let busy = AppError::from(StoreError::Busy { attempts: 4 });
        assert_eq!(
            busy.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
