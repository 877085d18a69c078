//! Error types for spfkit

use thiserror::Error;

/// Main error type for spfkit
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for spfkit
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Dns(_) => "DNS_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Config("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(Error::Dns("x".into()).code(), "DNS_ERROR");
        assert_eq!(
            Error::Other(anyhow::anyhow!("boom")).to_string(),
            "boom"
        );
    }
}
