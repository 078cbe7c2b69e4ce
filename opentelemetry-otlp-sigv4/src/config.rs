//! Exporter configuration and its resolution from builder values and the
//! environment.
//!
//! Programmatic values always win. When a value is not set on the builder the
//! trace-specific `OTEL_EXPORTER_OTLP_TRACES_*` variable is consulted first,
//! then the generic `OTEL_EXPORTER_OTLP_*` one, then the default.

use crate::error::ExporterBuildError;
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use std::collections::HashMap;
use std::env;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Target to which the exporter is going to send spans. `/v1/traces` is appended.
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Trace-specific target, used as-is.
pub const OTEL_EXPORTER_OTLP_TRACES_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_TRACES_ENDPOINT";
/// Key-value pairs to be used as headers associated with HTTP requests.
/// Example: `k1=v1,k2=v2`
pub const OTEL_EXPORTER_OTLP_HEADERS: &str = "OTEL_EXPORTER_OTLP_HEADERS";
/// Trace-specific headers, read before [`OTEL_EXPORTER_OTLP_HEADERS`].
pub const OTEL_EXPORTER_OTLP_TRACES_HEADERS: &str = "OTEL_EXPORTER_OTLP_TRACES_HEADERS";
/// Compression algorithm to use, defaults to none.
pub const OTEL_EXPORTER_OTLP_COMPRESSION: &str = "OTEL_EXPORTER_OTLP_COMPRESSION";
/// Trace-specific compression algorithm.
pub const OTEL_EXPORTER_OTLP_TRACES_COMPRESSION: &str = "OTEL_EXPORTER_OTLP_TRACES_COMPRESSION";
/// Max waiting time in milliseconds for the backend to process each batch.
pub const OTEL_EXPORTER_OTLP_TIMEOUT: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";
/// Trace-specific request timeout in milliseconds.
pub const OTEL_EXPORTER_OTLP_TRACES_TIMEOUT: &str = "OTEL_EXPORTER_OTLP_TRACES_TIMEOUT";
/// Default max waiting time for the backend to process each batch.
pub const OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT: Duration = Duration::from_millis(10000);

/// Region used for signing when none is configured on the builder.
pub const AWS_REGION: &str = "AWS_REGION";
/// Fallback for [`AWS_REGION`].
pub const AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";

/// Service name the default signer scopes credentials to.
pub const DEFAULT_SIGNING_SERVICE: &str = "xray";
/// Largest number of spans the X-Ray OTLP endpoint accepts in one request.
pub const DEFAULT_MAX_SPANS_PER_BATCH: usize = 10_000;
/// Largest uncompressed payload the X-Ray OTLP endpoint accepts.
pub const DEFAULT_MAX_UNCOMPRESSED_BYTES: usize = 5 * 1024 * 1024;
/// Backoff delay at or above which an export call stops retrying.
pub const DEFAULT_MAX_RETRY_TIMEOUT: Duration = Duration::from_secs(64);

const TRACES_PATH: &str = "/v1/traces";

/// The compression algorithm to use when sending data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    /// Compresses data using gzip.
    Gzip,
    /// Compresses data using zlib-wrapped deflate.
    Deflate,
}

impl Compression {
    /// Value of the `Content-Encoding` header for payloads compressed with
    /// this algorithm.
    pub fn content_encoding(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
        }
    }

    fn ensure_enabled(self) -> Result<Self, ExporterBuildError> {
        match self {
            #[cfg(feature = "gzip-http")]
            Compression::Gzip => Ok(self),
            #[cfg(not(feature = "gzip-http"))]
            Compression::Gzip => Err(
                ExporterBuildError::FeatureRequiredForCompressionAlgorithm("gzip-http", self),
            ),
            #[cfg(feature = "deflate-http")]
            Compression::Deflate => Ok(self),
            #[cfg(not(feature = "deflate-http"))]
            Compression::Deflate => Err(
                ExporterBuildError::FeatureRequiredForCompressionAlgorithm("deflate-http", self),
            ),
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.content_encoding())
    }
}

impl FromStr for Compression {
    type Err = ExporterBuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "deflate" => Ok(Compression::Deflate),
            _ => Err(ExporterBuildError::UnsupportedCompressionAlgorithm(
                s.to_string(),
            )),
        }
    }
}

/// Transport limits checked before anything is sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExportLimits {
    /// Maximum number of spans in one export call.
    pub max_spans_per_batch: usize,
    /// Maximum serialized size in bytes, measured before compression.
    pub max_uncompressed_bytes: usize,
}

impl Default for ExportLimits {
    fn default() -> Self {
        ExportLimits {
            max_spans_per_batch: DEFAULT_MAX_SPANS_PER_BATCH,
            max_uncompressed_bytes: DEFAULT_MAX_UNCOMPRESSED_BYTES,
        }
    }
}

/// Parameters of the retry loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    /// First backoff delay.
    pub initial_delay: Duration,
    /// Cap applied to every backoff delay.
    pub max_delay: Duration,
    /// Relative jitter in `[0, 1)`, applied as a factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// A drawn delay at or above this value ends the export call instead of
    /// being waited out. It bounds a single step, not the total time spent,
    /// and must not exceed `max_delay`.
    pub max_retry_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: DEFAULT_MAX_RETRY_TIMEOUT,
            jitter: 0.2,
            max_retry_timeout: DEFAULT_MAX_RETRY_TIMEOUT,
        }
    }
}

impl RetryConfig {
    pub(crate) fn validate(&self) -> Result<(), ExporterBuildError> {
        if self.initial_delay.is_zero() {
            return Err(invalid_config("initial_delay", "must be greater than zero"));
        }
        if self.max_delay < self.initial_delay {
            return Err(invalid_config(
                "max_delay",
                "must not be smaller than initial_delay",
            ));
        }
        check_jitter(self.jitter)?;
        // The default backoff never draws more than `max_delay`, so a larger
        // ceiling would never be reached.
        if self.max_retry_timeout > self.max_delay {
            return Err(invalid_config(
                "max_retry_timeout",
                "must not exceed max_delay",
            ));
        }
        Ok(())
    }
}

/// Rejects a relative jitter outside `[0, 1)`.
pub(crate) fn check_jitter(jitter: f64) -> Result<(), ExporterBuildError> {
    if !(0.0..1.0).contains(&jitter) {
        return Err(invalid_config("jitter", "must be within [0, 1)"));
    }
    Ok(())
}

/// Fully resolved, immutable configuration of one exporter instance.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    /// Region the requests are signed for.
    pub region: String,
    /// Collector endpoint the spans are posted to.
    pub endpoint: Uri,
    /// Payload compression, `None` sends the serialized bytes as they are.
    pub compression: Option<Compression>,
    /// Timeout of a single HTTP request.
    pub timeout: Duration,
    /// Headers added to every request before signing.
    pub headers: HeaderMap,
    /// Batch limits.
    pub limits: ExportLimits,
    /// Retry loop parameters.
    pub retry: RetryConfig,
}

/// Values collected by the builder, before environment resolution.
#[derive(Debug, Default)]
pub(crate) struct ExportConfigBuilder {
    pub(crate) region: Option<String>,
    pub(crate) endpoint: Option<String>,
    pub(crate) compression: Option<Compression>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) limits: ExportLimits,
    pub(crate) retry: RetryConfig,
}

impl ExportConfigBuilder {
    pub(crate) fn resolve(self) -> Result<ExportConfig, ExporterBuildError> {
        self.retry.validate()?;
        if self.limits.max_spans_per_batch == 0 {
            return Err(invalid_config("max_spans_per_batch", "must be greater than zero"));
        }

        let region = resolve_region(self.region)?;
        let endpoint = resolve_endpoint(self.endpoint.as_deref(), &region)?;
        let compression = resolve_compression(self.compression)?;
        let timeout = resolve_timeout(self.timeout.as_ref());

        let mut headers = default_headers();
        add_headers(
            self.headers
                .iter()
                .map(|(key, value)| (key.as_str(), url_decode(value).unwrap_or(value.clone()))),
            &mut headers,
        );
        // read headers from env var - trace specific env var is preferred over general
        if let Ok(input) = env::var(OTEL_EXPORTER_OTLP_TRACES_HEADERS)
            .or_else(|_| env::var(OTEL_EXPORTER_OTLP_HEADERS))
        {
            add_headers(parse_header_string(&input), &mut headers);
        }

        Ok(ExportConfig {
            region,
            endpoint,
            compression,
            timeout,
            headers,
            limits: self.limits,
            retry: self.retry,
        })
    }
}

fn invalid_config(name: &str, reason: &str) -> ExporterBuildError {
    ExporterBuildError::InvalidConfig {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn resolve_region(provided: Option<String>) -> Result<String, ExporterBuildError> {
    provided
        .or_else(|| env::var(AWS_REGION).ok())
        .or_else(|| env::var(AWS_DEFAULT_REGION).ok())
        .map(|region| region.trim().to_string())
        .filter(|region| !region.is_empty())
        .ok_or(ExporterBuildError::MissingRegion)
}

/// Default X-Ray OTLP traces endpoint for `region`.
pub fn default_endpoint(region: &str) -> String {
    format!("https://xray.{region}.amazonaws.com{TRACES_PATH}")
}

fn build_endpoint_uri(endpoint: &str, path: &str) -> Result<Uri, ExporterBuildError> {
    let path = match (endpoint.ends_with('/'), path.strip_prefix('/')) {
        (true, Some(stripped)) => stripped,
        _ => path,
    };
    parse_uri(&format!("{endpoint}{path}"))
}

fn parse_uri(endpoint: &str) -> Result<Uri, ExporterBuildError> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e: http::uri::InvalidUri| {
            ExporterBuildError::InvalidUri(endpoint.to_string(), e.to_string())
        })?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(ExporterBuildError::InvalidUri(
            endpoint.to_string(),
            "endpoint must be an absolute URL".to_string(),
        ));
    }
    Ok(uri)
}

fn resolve_endpoint(provided: Option<&str>, region: &str) -> Result<Uri, ExporterBuildError> {
    // programmatic configuration overrides any value set via environment variables
    if let Some(endpoint) = provided.filter(|e| !e.is_empty()) {
        return parse_uri(endpoint);
    }

    // per signal env var is not modified
    if let Some(endpoint) = env::var(OTEL_EXPORTER_OTLP_TRACES_ENDPOINT)
        .ok()
        .and_then(|s| parse_uri(&s).ok())
    {
        return Ok(endpoint);
    }

    // if signal env var is not set, then we check if the OTEL_EXPORTER_OTLP_ENDPOINT is set
    if let Some(endpoint) = env::var(OTEL_EXPORTER_OTLP_ENDPOINT)
        .ok()
        .and_then(|s| build_endpoint_uri(&s, TRACES_PATH).ok())
    {
        return Ok(endpoint);
    }

    parse_uri(&default_endpoint(region))
}

fn parse_compression_env(value: &str) -> Result<Option<Compression>, ExporterBuildError> {
    match value.trim() {
        "" | "none" => Ok(None),
        other => Ok(Some(other.parse::<Compression>()?)),
    }
}

fn resolve_compression(
    provided: Option<Compression>,
) -> Result<Option<Compression>, ExporterBuildError> {
    let compression = if let Some(compression) = provided {
        Some(compression)
    } else if let Ok(compression) = env::var(OTEL_EXPORTER_OTLP_TRACES_COMPRESSION) {
        parse_compression_env(&compression)?
    } else if let Ok(compression) = env::var(OTEL_EXPORTER_OTLP_COMPRESSION) {
        parse_compression_env(&compression)?
    } else {
        None
    };
    compression.map(Compression::ensure_enabled).transpose()
}

fn resolve_timeout(provided_timeout: Option<&Duration>) -> Duration {
    if let Some(timeout) = provided_timeout {
        *timeout
    } else if let Some(timeout) = env::var(OTEL_EXPORTER_OTLP_TRACES_TIMEOUT)
        .ok()
        .and_then(|s| s.parse().ok())
    {
        Duration::from_millis(timeout)
    } else if let Some(timeout) = env::var(OTEL_EXPORTER_OTLP_TIMEOUT)
        .ok()
        .and_then(|s| s.parse().ok())
    {
        Duration::from_millis(timeout)
    } else {
        OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT
    }
}

/// default user-agent headers
fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!(
        "OTel-OTLP-SigV4-Exporter-Rust/{}",
        env!("CARGO_PKG_VERSION")
    )) {
        headers.insert(http::header::USER_AGENT, value);
    }
    headers
}

// later pairs replace earlier values for the same name
fn add_headers<'a>(pairs: impl Iterator<Item = (&'a str, String)>, headers: &mut HeaderMap) {
    for (key, value) in pairs {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(key), HeaderValue::from_str(&value)) {
            headers.insert(name, value);
        }
    }
}

fn parse_header_string(value: &str) -> impl Iterator<Item = (&str, String)> {
    value
        .split_terminator(',')
        .map(str::trim)
        .filter_map(parse_header_key_value_string)
}

fn parse_header_key_value_string(key_value_string: &str) -> Option<(&str, String)> {
    key_value_string
        .split_once('=')
        .map(|(key, value)| {
            (
                key.trim(),
                url_decode(value.trim()).unwrap_or(value.to_string()),
            )
        })
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
}

fn url_decode(value: &str) -> Option<String> {
    percent_encoding::percent_decode_str(value)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
        .filter(|_| !has_invalid_escape(value))
}

// percent_decode_str passes malformed escapes through; those are rejected here.
fn has_invalid_escape(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.iter().enumerate().any(|(i, b)| {
        *b == b'%'
            && !(bytes.get(i + 1).is_some_and(u8::is_ascii_hexdigit)
                && bytes.get(i + 2).is_some_and(u8::is_ascii_hexdigit))
    })
}
