use thiserror::Error;

/// Taxonomy of recoverable and fatal failures produced by the aggregation core.
///
/// Everything except [`AggregatorError::Config`] and [`AggregatorError::Fatal`] is
/// recovered locally by the supervisor or aggregator; callers should log and continue.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("transient link error for {peer}: {reason}")]
    TransientLink { peer: String, reason: String },

    #[error("failed to decode payload from {peer}: {reason}")]
    Decode { peer: String, reason: String },

    #[error("failed to publish combined frame: {reason}")]
    Publish { reason: String },

    #[error("adapter pathology: {consecutive_fails} consecutive empty ticks while all peers connected")]
    AdapterPathology { consecutive_fails: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
