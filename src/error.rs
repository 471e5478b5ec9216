//! Unified error taxonomy, exposed over HTTP without leaking internals.
//!
//! One `thiserror` enum backs both the deployment pipeline's terminal
//! status and the HTTP error body, via a `kind()` projection that is
//! always a stable tag rather than an internal error's `Display` text.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed request, missing recipe, unresolvable branch.
    #[error("{0}")]
    Input(String),

    /// Plan limit exceeded.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Recipe failed at build time; carries the (possibly partial) build log.
    #[error("build failed: {0}")]
    Build(String),

    /// Container exited during the verify window.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Driver or State Store I/O hiccup; retried a bounded number of times
    /// by the caller before being converted to a terminal error.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// A resource that outlived its deployment. Surfaced, never fatal.
    #[error("orphaned resource: {0}")]
    Orphan(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The stable tag persisted alongside `error_message` and returned to
    /// clients — never the `Display` text of a wrapped internal error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Input(_) => "input",
            Error::Quota(_) => "quota",
            Error::Build(_) => "build",
            Error::Runtime(_) => "runtime",
            Error::TransientInfra(_) => "transient_infra",
            Error::Orphan(_) => "orphan",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Database(_) => "internal",
            Error::Docker(_) => "internal",
            Error::Io(_) => "internal",
            Error::Json(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Error::Input(_) => StatusCode::BAD_REQUEST,
            Error::Quota(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Build(_) | Error::Runtime(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::TransientInfra(_) | Error::Orphan(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(_) | Error::Docker(_) | Error::Io(_) | Error::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True if retrying the *same* stage within a bounded budget makes
    /// sense, rather than failing the deployment outright.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientInfra(_))
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    r#type: &'a str,
    msg: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            r#type: self.kind(),
            msg: match &self {
                // Internal errors never leak their source text to clients.
                Error::Database(_) | Error::Docker(_) | Error::Io(_) | Error::Json(_) => {
                    "internal error".to_string()
                }
                other => other.to_string(),
            },
        };
        (self.status_code(), Json(body)).into_response()
    }
}
