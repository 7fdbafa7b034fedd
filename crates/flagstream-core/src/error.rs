//! # Error Handling for the Flagstream Core
//!
//! All fallible operations in the SDK surface variants of the main
//! [`FlagstreamError`] enum. Evaluation itself never returns an error to the
//! caller; failures there are encoded in the evaluation reason instead (see
//! [`crate::eval::ErrorKind`]). The variants here cover configuration,
//! storage, ingestion, and delivery failures that background components need
//! to report and react to.

/// Result type alias used throughout the SDK.
pub type Result<T> = std::result::Result<T, FlagstreamError>;

/// Errors produced by SDK components.
#[derive(Debug, thiserror::Error)]
pub enum FlagstreamError {
    /// Client configuration was rejected at build time.
    ///
    /// # Fields
    /// - `message` - What was invalid and why
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Details about the rejected setting
        message: String,
    },

    /// A data store operation failed.
    ///
    /// For the in-memory store this never occurs; persistent store
    /// implementations map their backend failures into this variant.
    #[error("Data store error: {message}")]
    Store {
        /// Details about the store failure
        message: String,
    },

    /// The data source could not fetch or apply an update.
    #[error("Data source error: {message}")]
    DataSource {
        /// Details about the ingestion failure
        message: String,
    },

    /// The event pipeline could not accept or deliver events.
    #[error("Event pipeline error: {message}")]
    Events {
        /// Details about the event failure
        message: String,
    },

    /// A payload from the service could not be parsed.
    #[error("Malformed data: {message}")]
    MalformedData {
        /// Details about the parse failure
        message: String,
    },
}

impl FlagstreamError {
    /// Shorthand for a store error with a formatted message.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Shorthand for a data source error with a formatted message.
    pub fn data_source(message: impl Into<String>) -> Self {
        Self::DataSource {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for FlagstreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedData {
            message: e.to_string(),
        }
    }
}
