//! Request Error Taxonomy
//!
//! Every failure surfaced by the pipeline is an `Error`: an abstract kind
//! with a canonical HTTP code plus a small context pair (`what` names the
//! domain, `key` the offending identifier).

use serde::{Deserialize, Serialize};

/// Abstract error kinds with canonical numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Client input
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    UnprocessableEntity,
    TooManyRequests,
    // Server internal
    InternalError,
    // Upstream / time
    UpstreamUnavailable,
    Timeout,
    // Cancellation (internal; never surfaced except via telemetry)
    Aborted,
}

impl ErrorKind {
    /// HTTP status this kind renders as. Unlisted kinds default to 500.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::UnprocessableEntity => 422,
            Self::TooManyRequests => 429,
            Self::InternalError => 500,
            Self::UpstreamUnavailable => 502,
            Self::Timeout => 504,
            Self::Aborted => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::UnprocessableEntity => "unprocessable_entity",
            Self::TooManyRequests => "too_many_requests",
            Self::InternalError => "internal_error",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Timeout => "timeout",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request-level error: abstract kind plus domain context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}: what={what} key={key}")]
pub struct Error {
    pub kind: ErrorKind,
    /// Domain the error belongs to ("todo", "auth", "db", ...).
    pub what: String,
    /// Offending identifier, or empty when none applies.
    pub key: String,
}

impl Error {
    pub fn new(kind: ErrorKind, what: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind,
            what: what.into(),
            key: key.into(),
        }
    }

    pub fn bad_request(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, what, key)
    }

    pub fn unauthorized(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, what, key)
    }

    pub fn forbidden(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, what, key)
    }

    pub fn not_found(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what, key)
    }

    pub fn conflict(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, what, key)
    }

    pub fn unprocessable(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnprocessableEntity, what, key)
    }

    pub fn too_many_requests(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyRequests, what, key)
    }

    pub fn internal(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, what, key)
    }

    pub fn upstream_unavailable(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, what, key)
    }

    pub fn timeout(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, what, key)
    }

    pub fn aborted(what: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, what, key)
    }

    /// HTTP status this error renders as.
    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Compact "what/key" context string for telemetry.
    pub fn ctx_string(&self) -> String {
        format!("{}/{}", self.what, self.key)
    }
}
