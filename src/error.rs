//! Error types for the fetch adapter and the pipeline.

use thiserror::Error;

/// Failure while fetching a page of rows from a remote dataset.
///
/// `Transport`, `Status` and `Payload` are transient and retried inside the
/// source adapter. `Unavailable` is what callers see once retries run out.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("invalid request url: {0}")]
    Url(String),
    #[error("dataset '{dataset}' unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        dataset: String,
        attempts: u32,
        reason: String,
    },
}

impl SourceError {
    /// A malformed URL will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::Url(_) | SourceError::Unavailable { .. })
    }
}

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("mandatory dataset '{dataset}' could not be fetched: {reason}")]
    MandatoryFeedUnavailable { dataset: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message_names_dataset() {
        let err = SourceError::Unavailable {
            dataset: "nbtm-fbw5".to_string(),
            attempts: 3,
            reason: "server returned status 503: busy".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("nbtm-fbw5"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn test_mandatory_feed_message() {
        let err = PipelineError::MandatoryFeedUnavailable {
            dataset: "fdfd-xptc".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "mandatory dataset 'fdfd-xptc' could not be fetched: timeout"
        );
    }
}
