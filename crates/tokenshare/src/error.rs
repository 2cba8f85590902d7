use std::{sync::Arc, time::Duration};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("Token cannot be used as a header value. Must be ASCII.")]
    InvalidHeaderValue,
    #[error("Token provider call failed: {0}")]
    Provider(String),
    #[error("Operation `{operation}` failed after {attempts} attempts")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("Token refresh failed")]
    TokenRefreshFailed(#[source] Box<Error>),
    #[error("Timed out after {}ms waiting for another instance to refresh tokens", .0.as_millis())]
    TokenRefreshTimeout(Duration),
    #[error("Unable to obtain access token")]
    TokenUnavailable,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Token store error: {0}")]
    Store(String),
    #[error("Token initialization failed")]
    Initialization(#[source] Box<Error>),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Request failed: {0}")]
    ReqwestFailed(#[from] Arc<reqwest::Error>),
}

impl Error {
    pub(crate) fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub(crate) fn store(error: impl std::fmt::Display) -> Self {
        Self::Store(error.to_string())
    }

    /// Walks the `source` chain down to the innermost error of this crate.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetryExhausted { source, .. }
            | Error::TokenRefreshFailed(source)
            | Error::Initialization(source) => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Error::store(value)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_errors() {
        let error = Error::Initialization(Box::new(Error::TokenRefreshFailed(Box::new(
            Error::RetryExhausted {
                operation: "request-new-tokens".to_string(),
                attempts: 3,
                source: Box::new(Error::provider("HTTP status 503")),
            },
        ))));

        assert!(matches!(error.root_cause(), Error::Provider(m) if m == "HTTP status 503"));
        assert_eq!(
            Error::TokenRefreshTimeout(Duration::from_secs(10)).to_string(),
            "Timed out after 10000ms waiting for another instance to refresh tokens"
        );
    }
}
