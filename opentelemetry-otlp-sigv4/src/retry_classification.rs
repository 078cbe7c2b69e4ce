//! Classification of collector responses into retryable and terminal failures.

/// How the exporter should react to a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryErrorType {
    /// Try again after the next backoff delay.
    Retryable,
    /// Give up on the batch.
    NonRetryable,
}

/// HTTP status classification.
pub mod http {
    use super::RetryErrorType;

    /// Classifies a non-success HTTP status code.
    ///
    /// Throttling (429) and server errors (5xx) are retryable. Every other
    /// status, including 3xx responses that were not followed, is terminal.
    pub fn classify_http_status(status_code: u16) -> RetryErrorType {
        match status_code {
            429 => RetryErrorType::Retryable,
            500..=599 => RetryErrorType::Retryable,
            _ => RetryErrorType::NonRetryable,
        }
    }
}
