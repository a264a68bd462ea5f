use thiserror::Error;

/// Failure of one outbound search against the Brave API.
///
/// `Clone` so a single failure can be handed to every caller that was
/// coalesced onto the same upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SearchError {
    #[error("Brave Search API key not configured")]
    MissingApiKey,
    /// Transport level failure (connect, timeout, TLS).
    #[error("failed to send request to Brave Search: {0}")]
    Request(String),
    /// The API answered with a non-success status.
    #[error("Brave Search request failed with status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("failed to parse Brave Search response: {0}")]
    Decode(String),
}

impl SearchError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            SearchError::MissingApiKey => false,
            SearchError::Request(_) | SearchError::Decode(_) => true,
            SearchError::Upstream { status, .. } => *status == 429 || *status >= 500,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SearchError::Upstream { status: 429, .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}
