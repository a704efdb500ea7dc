//! Service error taxonomy and its HTTP mapping.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::service::jobs::JobQueryError;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed image or video input from the caller.
    #[error("{0}")]
    InputDecode(String),
    #[error("job not found")]
    JobNotFound,
    #[error("job not finished")]
    JobNotReady,
    #[error("result expired or missing")]
    ResultGone,
    #[error("server stopping")]
    ServerStopping,
    /// Unexpected failure during an estimate call or container pass.
    #[error("{0}")]
    Inference(#[from] anyhow::Error),
}

impl From<JobQueryError> for ServiceError {
    fn from(err: JobQueryError) -> Self {
        match err {
            JobQueryError::NotFound => ServiceError::JobNotFound,
            JobQueryError::NotReady => ServiceError::JobNotReady,
            JobQueryError::Gone => ServiceError::ResultGone,
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InputDecode(_) => StatusCode::BAD_REQUEST,
            ServiceError::JobNotFound => StatusCode::NOT_FOUND,
            ServiceError::JobNotReady => StatusCode::CONFLICT,
            ServiceError::ResultGone => StatusCode::GONE,
            ServiceError::ServerStopping => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_query_failures_stay_distinguishable() {
        let not_found = ServiceError::from(JobQueryError::NotFound);
        let not_ready = ServiceError::from(JobQueryError::NotReady);
        let gone = ServiceError::from(JobQueryError::Gone);
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(not_ready.status_code(), StatusCode::CONFLICT);
        assert_eq!(gone.status_code(), StatusCode::GONE);
    }

    #[test]
    fn decode_failures_are_client_errors() {
        let err = ServiceError::InputDecode("bad image".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.status_code().is_client_error());
    }
}
