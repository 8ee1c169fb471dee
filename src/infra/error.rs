use thiserror::Error;

use crate::config::LoadError;
use crate::sync::SyncError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

/// Top-level error for the `marketsync` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("scenario `{scenario}` failed: {message}")]
    Scenario {
        scenario: &'static str,
        message: String,
    },
}

impl AppError {
    pub fn scenario(scenario: &'static str, message: impl Into<String>) -> Self {
        Self::Scenario {
            scenario,
            message: message.into(),
        }
    }
}

impl From<LoadError> for AppError {
    fn from(err: LoadError) -> Self {
        Self::Infra(InfraError::configuration(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ApiError;

    #[test]
    fn sync_errors_pass_through_transparently() {
        let error = AppError::from(SyncError::rejected(
            "add_to_cart",
            ApiError::conflict("already in cart"),
        ));
        assert_eq!(
            error.to_string(),
            "mutation `add_to_cart` rejected: server responded 409: already in cart"
        );
    }

    #[test]
    fn load_errors_become_configuration_errors() {
        let error = AppError::from(LoadError::Invalid {
            key: "sync.event_journal_limit",
            reason: "must be greater than zero".to_string(),
        });
        assert!(matches!(
            error,
            AppError::Infra(InfraError::Configuration { .. })
        ));
    }
}
