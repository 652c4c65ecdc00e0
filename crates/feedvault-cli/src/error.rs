use feedvault_core::{ConfigError, FetchError, FetchErrorKind, ValidationError};
use feedvault_store::StoreError;
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to load configuration: {0}")]
    Settings(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("failed to initialise logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Config(_) | Self::Settings(_) => 2,
            Self::Fetch(error) => match error.kind() {
                FetchErrorKind::Cancelled => 130,
                FetchErrorKind::Configuration | FetchErrorKind::Validation => 2,
                FetchErrorKind::Storage => 7,
                _ => 3,
            },
            Self::Store(_) => 7,
            Self::Serialization(_) => 4,
            Self::Logging(_) | Self::Io(_) => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use feedvault_core::SourceId;

    use super::*;

    #[test]
    fn exit_codes_follow_error_category() {
        assert_eq!(CliError::from(ValidationError::EmptyEndpoint).exit_code(), 2);
        assert_eq!(CliError::from(FetchError::Cancelled).exit_code(), 130);
        assert_eq!(
            CliError::from(ConfigError::MissingPolicy {
                provider: SourceId::Fred
            })
            .exit_code(),
            2
        );
        assert_eq!(
            CliError::from(FetchError::Transient {
                provider: SourceId::Fred,
                attempts: 4,
                message: String::from("HTTP 503"),
            })
            .exit_code(),
            3
        );
    }
}
