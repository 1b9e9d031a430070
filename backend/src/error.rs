//! Error taxonomy shared by the job core and the HTTP layer.
//!
//! Every fallible operation in the crate returns [`CoreError`]. The
//! [`ResponseError`] impl turns it into a JSON body of the form
//! `{"error": "...", "code": "..."}` with the matching status code.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use common::requests::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The request payload failed kind-specific shape checks.
    #[error("validation error: {0}")]
    Validation(String),

    /// The external processing engine could not accept the job.
    #[error("processing backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("insufficient credits: balance {balance}, required {cost}")]
    InsufficientCredits { balance: i64, cost: i64 },

    #[error("too many active jobs (limit {limit})")]
    TooManyActiveJobs { limit: usize },

    /// Unknown or expired job id.
    #[error("job {0} not found")]
    NotFound(String),

    /// The backend reported failure; carries the backend's error text.
    #[error("job failed: {0}")]
    JobFailed(String),

    /// The poller gave up. The job itself may still complete.
    #[error("gave up polling after {attempts} attempts")]
    PollTimeout { attempts: u32 },

    #[error("job {0} is already in a terminal state")]
    TerminalState(String),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("progress for job {job_id} cannot go from {current} to {requested}")]
    ProgressRegression {
        job_id: String,
        current: u8,
        requested: u8,
    },

    #[error("job {0} has already been debited")]
    DuplicateDebit(String),

    #[error("job {0} has not completed")]
    NotCompleted(String),

    #[error("missing caller identity")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// A recoverable transport failure while polling.
    #[error("transient error: {0}")]
    Transient(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            CoreError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            CoreError::TooManyActiveJobs { .. } => "TOO_MANY_ACTIVE_JOBS",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::JobFailed(_) => "JOB_FAILED",
            CoreError::PollTimeout { .. } => "POLL_TIMEOUT",
            CoreError::TerminalState(_) => "TERMINAL_STATE",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::ProgressRegression { .. } => "PROGRESS_REGRESSION",
            CoreError::DuplicateDebit(_) => "DUPLICATE_DEBIT",
            CoreError::NotCompleted(_) => "NOT_COMPLETED",
            CoreError::Unauthorized => "UNAUTHORIZED",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::Storage(_) => "STORAGE_ERROR",
            CoreError::Transient(_) => "TRANSIENT_ERROR",
        }
    }
}

impl ResponseError for CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::InsufficientCredits { .. } | CoreError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            CoreError::TooManyActiveJobs { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::JobFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::PollTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::TerminalState(_)
            | CoreError::InvalidTransition { .. }
            | CoreError::ProgressRegression { .. }
            | CoreError::DuplicateDebit(_)
            | CoreError::NotCompleted(_) => StatusCode::CONFLICT,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Transient(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            CoreError::Storage(detail) => {
                log::error!("storage failure: {}", detail);
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: message,
            code: self.code().to_string(),
        })
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
