//! Error types for the SOAP keyword library.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SoapClientError>;

/// SOAP keyword library errors.
#[derive(Error, Debug)]
pub enum SoapClientError {
    #[error("The alias '{0}' is already in use.")]
    AliasAlreadyInUse(String),

    #[error("When using more than one client, providing an alias is required.")]
    AliasRequired,

    #[error("Could not find alias for the provided client.")]
    AliasNotFound,

    #[error("Could not find a client with alias '{0}'.")]
    ClientNotFound(String),

    #[error("Namespace prefix not found: {0}")]
    NamespacePrefixNotFound(String),

    #[error("Invalid MIME type '{0}', expected 'maintype/subtype'")]
    InvalidMimeType(String),

    #[error("Invalid attachment file name {0:?}: control characters are not allowed")]
    InvalidFilename(String),

    #[error("No keyword with name '{0}' found.")]
    UnknownKeyword(String),

    #[error("Invalid argument for '{keyword}': {message}")]
    InvalidArgument { keyword: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("SOAP Fault [{code}]: {message}")]
    Fault { code: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SoapClientError {
    /// Build an [`SoapClientError::InvalidArgument`] for a keyword.
    pub fn invalid_argument(keyword: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            keyword: keyword.into(),
            message: message.into(),
        }
    }

    /// Describe an optional alias for error messages.
    pub(crate) fn client_not_found(alias: Option<&str>) -> Self {
        Self::ClientNotFound(alias.unwrap_or("None").to_string())
    }
}

impl From<reqwest::Error> for SoapClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<quick_xml::Error> for SoapClientError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Xml(err.to_string())
    }
}
