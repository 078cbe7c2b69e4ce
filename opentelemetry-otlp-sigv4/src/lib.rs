//! An OTLP/HTTP span exporter that authenticates with AWS Signature Version 4.
//!
//! The exporter sends each batch of finished spans as one protobuf-encoded
//! POST to an OTLP traces endpoint, by default the AWS X-Ray OTLP endpoint of
//! the configured region. Requests are signed with SigV4 after compression,
//! and transient failures are retried with exponential backoff.
//!
//! # Quickstart
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use opentelemetry::trace::Tracer;
//! use opentelemetry::global;
//! use opentelemetry_otlp_sigv4::{Compression, SigV4SpanExporter};
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//!
//! let exporter = SigV4SpanExporter::builder()
//!     .with_region("us-east-1")
//!     .with_compression(Compression::Gzip)
//!     .build()?;
//!
//! let provider = SdkTracerProvider::builder()
//!     .with_batch_exporter(exporter)
//!     .build();
//! global::set_tracer_provider(provider.clone());
//!
//! global::tracer("my-component").in_span("doing_work", |_cx| {
//!     // Traced app logic here...
//! });
//!
//! provider.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! Credentials are read from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
//! `AWS_SESSION_TOKEN` every time a request is signed, unless fixed ones are
//! given with [`SigV4SpanExporterBuilder::with_credentials`].
//!
//! # Retries
//!
//! HTTP 429, HTTP 5xx and requests that never got a response are retried.
//! Every other failure, including batches over the configured
//! [`ExportLimits`], fails the call at once. The retry loop ends when the next
//! backoff delay reaches [`RetryConfig::max_retry_timeout`].
//!
//! # Feature flags
//!
//! * `reqwest-blocking-client` (default): use `reqwest::blocking::Client` as the
//!   default HTTP client.
//! * `gzip-http` (default), `deflate-http` (default): payload compression.
//! * `internal-logs` (default): emit the exporter's internal logs through
//!   `tracing`.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![allow(elided_lifetimes_in_paths)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod backoff;
mod config;
mod encoder;
mod error;
mod exporter;
pub mod retry_classification;
mod sender;
mod signer;

pub use crate::backoff::{Backoff, ExponentialBackoff, ExponentialDelays};
pub use crate::config::{
    default_endpoint, Compression, ExportConfig, ExportLimits, RetryConfig, AWS_DEFAULT_REGION,
    AWS_REGION, DEFAULT_MAX_RETRY_TIMEOUT, DEFAULT_MAX_SPANS_PER_BATCH,
    DEFAULT_MAX_UNCOMPRESSED_BYTES, DEFAULT_SIGNING_SERVICE, OTEL_EXPORTER_OTLP_COMPRESSION,
    OTEL_EXPORTER_OTLP_ENDPOINT, OTEL_EXPORTER_OTLP_HEADERS, OTEL_EXPORTER_OTLP_TIMEOUT,
    OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT, OTEL_EXPORTER_OTLP_TRACES_COMPRESSION,
    OTEL_EXPORTER_OTLP_TRACES_ENDPOINT, OTEL_EXPORTER_OTLP_TRACES_HEADERS,
    OTEL_EXPORTER_OTLP_TRACES_TIMEOUT,
};
pub use crate::encoder::{
    check_batch_len, encode_payload, EncodeError, EncodedPayload, ProtobufSpanEncoder,
    SpanEncoder,
};
pub use crate::error::{ExportError, ExporterBuildError, SigningError};
pub use crate::exporter::{SigV4SpanExporter, SigV4SpanExporterBuilder};
pub use crate::sender::{
    HttpError, HttpResponse, HttpTransport, SendError, Sender, PROTOBUF_CONTENT_TYPE,
};
pub use crate::signer::{
    Credentials, RequestSigner, SigV4Signer, AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY,
    AWS_SESSION_TOKEN,
};
