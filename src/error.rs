use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use serde::Serialize;
use thiserror::Error;

use crate::kv::StoreError;

/// JSON envelope rendered for every failing request: `{code, error, message?}`
/// with the HTTP status equal to `code`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: u16,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiError {
    pub fn new(status: Status, message: Option<String>) -> Self {
        ApiError {
            code: status.code,
            error: status.reason_lossy().to_string(),
            message,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("too many requests")]
    RateLimited,
    #[error("index invariant violated: {0}")]
    InvariantViolation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status(&self) -> Status {
        match self {
            ServiceError::Validation(_) => Status::BadRequest,
            ServiceError::NotFound(_) => Status::NotFound,
            ServiceError::Unauthorized => Status::Unauthorized,
            ServiceError::RateLimited => Status::TooManyRequests,
            ServiceError::InvariantViolation(_)
            | ServiceError::Store(_)
            | ServiceError::Database(_)
            | ServiceError::Internal(_) => Status::InternalServerError,
        }
    }
}

pub fn bad_request(message: impl Into<String>) -> ServiceError {
    ServiceError::Validation(message.into())
}

pub fn not_found(message: impl Into<String>) -> ServiceError {
    ServiceError::NotFound(message.into())
}

impl<'r> Responder<'r, 'static> for ServiceError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        // Server faults are logged with context; the body stays generic.
        let message = if status == Status::InternalServerError {
            log::error!("{} {}: {}", req.method(), req.uri(), self);
            None
        } else {
            Some(self.to_string())
        };
        let body = Json(ApiError::new(status, message));
        let mut response = body.respond_to(req)?;
        response.set_status(status);
        Ok(response)
    }
}
