//! Errors returned while building and while running the exporter.

use crate::config::Compression;
use thiserror::Error;

/// Reasons a single export call did not deliver its batch.
///
/// Every variant is terminal for the batch that produced it: the exporter has
/// already retried whatever was retryable before returning one of these.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// The batch holds more spans than the collector accepts in one request.
    #[error("batch of {count} spans exceeds the limit of {limit} spans per request")]
    TooManySpans {
        /// Number of spans in the rejected batch.
        count: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The serialized batch is larger than the collector accepts, measured
    /// before compression.
    #[error("serialized payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge {
        /// Uncompressed payload size in bytes.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// The encoder or the compression step failed.
    #[error("failed to encode spans: {0}")]
    Encode(String),

    /// The request could not be signed.
    #[error("failed to sign request: {0}")]
    Signing(#[from] SigningError),

    /// The collector rejected the request with a non-retryable status.
    #[error("collector rejected the request with status {status_code} ({reason})")]
    Client {
        /// HTTP status code.
        status_code: u16,
        /// Reason phrase of the status.
        reason: String,
    },

    /// Retryable failures continued until the backoff reached the retry ceiling.
    #[error("giving up after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted {
        /// Number of send attempts made.
        attempts: usize,
        /// Description of the last retryable failure.
        last_error: String,
    },

    /// The exporter was shut down before or during the call.
    #[error("exporter is already shut down")]
    AlreadyShutdown,
}

/// Errors raised by a [`RequestSigner`](crate::RequestSigner).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SigningError {
    /// No credentials were configured and none were found in the environment.
    #[error("no AWS credentials available")]
    MissingCredentials,

    /// The request cannot be signed as built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
/// Errors that can occur while building an exporter.
#[non_exhaustive]
pub enum ExporterBuildError {
    /// Spawning a new thread failed.
    #[error("Spawning a new thread failed. Unable to create Reqwest-Blocking client.")]
    ThreadSpawnFailed,

    /// Feature required to use the specified compression algorithm.
    #[error("feature '{0}' is required to use the compression algorithm '{1}'")]
    FeatureRequiredForCompressionAlgorithm(&'static str, Compression),

    /// No Http client specified.
    #[error("no http client specified")]
    NoHttpClient,

    /// Neither the builder nor the environment provided a signing region.
    #[error("no AWS region configured, set one with `with_region` or AWS_REGION")]
    MissingRegion,

    /// Unsupported compression algorithm.
    #[error("unsupported compression algorithm '{0}'")]
    UnsupportedCompressionAlgorithm(String),

    /// Invalid URI.
    #[error("invalid URI {0}. Reason {1}")]
    InvalidUri(String, String),

    /// Invalid configuration.
    #[error("{name}: {reason}")]
    InvalidConfig {
        /// The configuration name.
        name: String,
        /// The reason the configuration is invalid.
        reason: String,
    },
}
