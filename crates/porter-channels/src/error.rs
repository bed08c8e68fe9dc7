use thiserror::Error;

/// Errors that can occur within any channel adapter.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel's required environment variables are incomplete.
    #[error("Channel '{channel}' not configured, missing: {}", missing.join(", "))]
    NotConfigured {
        channel: String,
        missing: Vec<String>,
    },

    /// Signature / nonce / timestamp validation rejected the request.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The callback payload could not be parsed into an inbound message.
    #[error("Malformed payload: {0}")]
    Parse(String),

    /// The platform rejected or never received an outbound message.
    #[error("Send failed via '{channel}': {reason}")]
    SendFailed { channel: String, reason: String },

    /// The platform API returned an error status.
    #[error("Platform API error {status}: {message}")]
    Api { status: u16, message: String },

    /// No adapter is registered under the requested tag.
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// An operation exceeded its allowed time budget.
    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },
}
