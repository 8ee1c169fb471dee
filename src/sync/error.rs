use std::fmt::Display;

use thiserror::Error;

/// Failure reported by a fetch or mutate function.
///
/// This is the only error shape that crosses the endpoint boundary; transport
/// details stay on the collaborator's side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("server responded {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network failure: {message}")]
    Network { message: String },
}

impl ApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::status(409, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status(404, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network { .. } => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status_code() == Some(409)
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Errors surfaced by the sync layer.
///
/// `Clone` so that one in-flight fetch can hand the same failure to every
/// consumer attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("query `{endpoint}` failed: {source}")]
    Fetch { endpoint: String, source: ApiError },
    #[error("mutation `{endpoint}` rejected: {source}")]
    MutationRejected { endpoint: String, source: ApiError },
    #[error("endpoint `{name}` is not registered")]
    UnknownEndpoint { name: String },
    #[error("endpoint `{name}` is already registered")]
    DuplicateEndpoint { name: String },
    #[error("payload codec failed for `{endpoint}`: {message}")]
    Codec { endpoint: String, message: String },
}

impl SyncError {
    pub fn fetch(endpoint: &str, source: ApiError) -> Self {
        Self::Fetch {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    pub fn rejected(endpoint: &str, source: ApiError) -> Self {
        Self::MutationRejected {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    pub fn unknown_endpoint(name: &str) -> Self {
        Self::UnknownEndpoint {
            name: name.to_string(),
        }
    }

    pub fn duplicate_endpoint(name: &str) -> Self {
        Self::DuplicateEndpoint {
            name: name.to_string(),
        }
    }

    pub fn codec(endpoint: &str, err: impl Display) -> Self {
        Self::Codec {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }

    /// The collaborator error behind a fetch or mutation failure.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Fetch { source, .. } | Self::MutationRejected { source, .. } => Some(source),
            _ => None,
        }
    }
}
