use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed {kind} identity `{value}`")]
    MalformedIdentity { kind: &'static str, value: String },
    #[error("unknown or inactive {kind} `{value}`")]
    UnknownOrInactiveScope { kind: &'static str, value: String },
    #[error("{kind} does not match the caller's affiliation")]
    ScopeMismatch { kind: &'static str },
    #[error("{kind} context required for this operation")]
    MissingScope { kind: &'static str },
    #[error("failed to bind `{setting}`: {detail}")]
    BindingFailure {
        setting: &'static str,
        detail: String,
    },
    #[error("failed to clear `{setting}`: {detail}")]
    ClearFailure {
        setting: &'static str,
        detail: String,
    },
    #[error("request context already released")]
    ContextReleased,
    #[error("invalid slug `{slug}`: {reason}")]
    InvalidSlug { slug: String, reason: &'static str },
    #[error("slug `{0}` already exists")]
    DuplicateSlug(String),
    #[error("{kind} {id} not found")]
    ScopeNotFound { kind: &'static str, id: String },
    #[error("{what} `{key}` already exists in this scope")]
    DuplicateRecord { what: &'static str, key: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("cross-scope admin access is not configured")]
    AdminUnavailable,
    #[error("request exceeded {0:?}")]
    Timeout(Duration),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification of an [`Error`] as seen by callers of the request pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionKind {
    MalformedIdentity,
    UnknownOrInactiveScope,
    ScopeMismatch,
    MissingScope,
    BindingFailure,
    ClearFailure,
    InvalidInput,
    NotFound,
    Conflict,
    Timeout,
    Internal,
}

impl RejectionKind {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionKind::MalformedIdentity => "MALFORMED_IDENTITY",
            RejectionKind::UnknownOrInactiveScope => "UNKNOWN_OR_INACTIVE_SCOPE",
            RejectionKind::ScopeMismatch => "SCOPE_MISMATCH",
            RejectionKind::MissingScope => "MISSING_SCOPE",
            RejectionKind::BindingFailure => "BINDING_FAILURE",
            RejectionKind::ClearFailure => "CLEAR_FAILURE",
            RejectionKind::InvalidInput => "INVALID_INPUT",
            RejectionKind::NotFound => "NOT_FOUND",
            RejectionKind::Conflict => "CONFLICT",
            RejectionKind::Timeout => "TIMEOUT",
            RejectionKind::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RejectionKind::MalformedIdentity
            | RejectionKind::MissingScope
            | RejectionKind::InvalidInput => 400,
            RejectionKind::UnknownOrInactiveScope | RejectionKind::ScopeMismatch => 403,
            RejectionKind::NotFound => 404,
            RejectionKind::Conflict => 409,
            RejectionKind::Timeout => 504,
            RejectionKind::BindingFailure | RejectionKind::ClearFailure | RejectionKind::Internal => {
                500
            }
        }
    }

    /// Internal failures are reported without detail.
    pub fn is_internal(&self) -> bool {
        self.status() >= 500
    }
}

impl Error {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Error::MalformedIdentity { .. } => RejectionKind::MalformedIdentity,
            Error::UnknownOrInactiveScope { .. } => RejectionKind::UnknownOrInactiveScope,
            Error::ScopeMismatch { .. } => RejectionKind::ScopeMismatch,
            Error::MissingScope { .. } => RejectionKind::MissingScope,
            Error::BindingFailure { .. } => RejectionKind::BindingFailure,
            Error::ClearFailure { .. } => RejectionKind::ClearFailure,
            Error::InvalidSlug { .. } | Error::InvalidInput(_) => RejectionKind::InvalidInput,
            Error::ScopeNotFound { .. } => RejectionKind::NotFound,
            Error::DuplicateSlug(_) | Error::DuplicateRecord { .. } => RejectionKind::Conflict,
            Error::Timeout(_) => RejectionKind::Timeout,
            Error::Context { source, .. } => source.kind(),
            _ => RejectionKind::Internal,
        }
    }
}

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
