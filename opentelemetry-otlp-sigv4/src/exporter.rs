//! The span exporter and its builder.
//!
//! One [`SigV4SpanExporter::export_spans`] call runs the whole export protocol
//! for a batch: shutdown check, validation, a single encoding pass, then a
//! sign-and-send loop that retries throttling, server errors and transport
//! failures until the backoff reaches the configured retry ceiling.

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::config::{
    Compression, ExportConfig, ExportConfigBuilder, ExportLimits, RetryConfig,
    DEFAULT_SIGNING_SERVICE,
};
use crate::encoder::{encode_payload, ProtobufSpanEncoder, SpanEncoder};
use crate::error::{ExportError, ExporterBuildError};
use crate::retry_classification::{http::classify_http_status, RetryErrorType};
use crate::sender::{HttpTransport, SendError, Sender};
use crate::signer::{Credentials, RequestSigner, SigV4Signer};
use opentelemetry::{otel_debug, otel_error, otel_warn};
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type SleepFn = Arc<dyn Fn(Duration) + Send + Sync>;

/// Builder for [`SigV4SpanExporter`].
///
/// Only the region is required, and it may come from `AWS_REGION` or
/// `AWS_DEFAULT_REGION` instead. Everything else has a default:
///
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use opentelemetry_otlp_sigv4::{Compression, SigV4SpanExporter};
///
/// let exporter = SigV4SpanExporter::builder()
///     .with_region("us-west-2")
///     .with_compression(Compression::Gzip)
///     .build()?;
/// # drop(exporter);
/// # Ok(())
/// # }
/// ```
pub struct SigV4SpanExporterBuilder<E = ProtobufSpanEncoder> {
    config: ExportConfigBuilder,
    http_client: Option<Arc<dyn HttpTransport>>,
    signer: Option<Arc<dyn RequestSigner>>,
    credentials: Option<Credentials>,
    service: String,
    backoff: Option<Box<dyn Backoff>>,
    sleeper: Option<SleepFn>,
    encoder: E,
}

impl Default for SigV4SpanExporterBuilder {
    fn default() -> Self {
        SigV4SpanExporterBuilder {
            config: ExportConfigBuilder::default(),
            http_client: None,
            signer: None,
            credentials: None,
            service: DEFAULT_SIGNING_SERVICE.to_string(),
            backoff: None,
            sleeper: None,
            encoder: ProtobufSpanEncoder::default(),
        }
    }
}

impl<E: Debug> Debug for SigV4SpanExporterBuilder<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigV4SpanExporterBuilder")
            .field("config", &self.config)
            .field("http_client", &self.http_client)
            .field("signer", &self.signer)
            .field("credentials", &self.credentials)
            .field("service", &self.service)
            .field("backoff", &self.backoff)
            .field("encoder", &self.encoder)
            .finish_non_exhaustive()
    }
}

impl<E: SpanEncoder> SigV4SpanExporterBuilder<E> {
    /// Region the requests are signed for and the default endpoint points to.
    pub fn with_region<T: Into<String>>(mut self, region: T) -> Self {
        self.config.region = Some(region.into());
        self
    }

    /// Collector URL, used as-is.
    pub fn with_endpoint<T: Into<String>>(mut self, endpoint: T) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    /// Payload compression.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.config.compression = Some(compression);
        self
    }

    /// Timeout of each HTTP request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Extra headers sent, and signed, with every request.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.config.headers = headers;
        self
    }

    /// Limits checked before anything is sent.
    pub fn with_limits(mut self, limits: ExportLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Retry loop parameters, also used for the default backoff.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// HTTP client to send requests with. Without one, a
    /// `reqwest::blocking::Client` is created.
    pub fn with_http_client<T: HttpTransport + 'static>(mut self, client: T) -> Self {
        self.http_client = Some(Arc::new(client));
        self
    }

    /// Replaces the SigV4 signer. Makes `with_credentials` and `with_service`
    /// irrelevant.
    pub fn with_signer<T: RequestSigner + 'static>(mut self, signer: T) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Fixed credentials for the default signer, instead of reading the
    /// environment on every request.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Service name used by the default signer. Defaults to `xray`.
    pub fn with_service<T: Into<String>>(mut self, service: T) -> Self {
        self.service = service.into();
        self
    }

    /// Source of retry delays. Defaults to an [`ExponentialBackoff`] built from
    /// the retry config.
    pub fn with_backoff<B: Backoff + 'static>(mut self, backoff: B) -> Self {
        self.backoff = Some(Box::new(backoff));
        self
    }

    /// Function used to wait between attempts. Defaults to
    /// [`std::thread::sleep`].
    pub fn with_sleeper<F>(mut self, sleeper: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    /// Serializes spans with `encoder`, which also decides the span type the
    /// exporter accepts.
    pub fn with_encoder<T: SpanEncoder>(self, encoder: T) -> SigV4SpanExporterBuilder<T> {
        SigV4SpanExporterBuilder {
            config: self.config,
            http_client: self.http_client,
            signer: self.signer,
            credentials: self.credentials,
            service: self.service,
            backoff: self.backoff,
            sleeper: self.sleeper,
            encoder,
        }
    }

    /// Resolves the configuration against the environment and creates the
    /// exporter.
    pub fn build(self) -> Result<SigV4SpanExporter<E>, ExporterBuildError> {
        let config = self.config.resolve()?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => default_http_client(config.timeout)?,
        };

        let signer: Arc<dyn RequestSigner> = match self.signer {
            Some(signer) => signer,
            None => {
                let signer = SigV4Signer::new(config.region.clone(), self.service);
                Arc::new(match self.credentials {
                    Some(credentials) => signer.with_credentials(credentials),
                    None => signer,
                })
            }
        };

        let backoff: Box<dyn Backoff> = match self.backoff {
            Some(backoff) => backoff,
            None => Box::new(ExponentialBackoff::try_from(&config.retry)?),
        };
        let sleeper: SleepFn = match self.sleeper {
            Some(sleeper) => sleeper,
            None => Arc::new(std::thread::sleep),
        };

        let sender = Sender::new(
            http_client,
            signer,
            config.endpoint.clone(),
            config.headers.clone(),
            config.timeout,
        );

        otel_debug!(
            name: "SigV4SpanExporterBuilt",
            endpoint = config.endpoint.to_string(),
            region = config.region.as_str(),
            compression = format!("{:?}", config.compression),
            timeout = format!("{:?}", config.timeout)
        );

        Ok(SigV4SpanExporter {
            config,
            encoder: self.encoder,
            sender,
            backoff,
            sleeper,
            is_shutdown: AtomicBool::new(false),
        })
    }
}

#[cfg(feature = "reqwest-blocking-client")]
fn default_http_client(timeout: Duration) -> Result<Arc<dyn HttpTransport>, ExporterBuildError> {
    // The blocking client owns a runtime, which must not be created from
    // within another runtime's thread.
    let client = std::thread::spawn(move || {
        reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new())
    })
    .join()
    .map_err(|_| ExporterBuildError::ThreadSpawnFailed)?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "reqwest-blocking-client"))]
fn default_http_client(_timeout: Duration) -> Result<Arc<dyn HttpTransport>, ExporterBuildError> {
    Err(ExporterBuildError::NoHttpClient)
}

/// Retry bookkeeping of one export call.
struct RetryState {
    delays: Box<dyn Iterator<Item = Duration> + Send>,
    elapsed: Duration,
    attempts: usize,
}

impl RetryState {
    fn new(backoff: &dyn Backoff) -> Self {
        RetryState {
            delays: backoff.delays(),
            elapsed: Duration::ZERO,
            attempts: 0,
        }
    }

    /// Draws the next delay, or `None` once the sequence is exhausted or a
    /// delay reaches `ceiling`.
    fn next_delay(&mut self, ceiling: Duration) -> Option<Duration> {
        let delay = self.delays.next().filter(|delay| *delay < ceiling)?;
        self.elapsed += delay;
        Some(delay)
    }
}

/// Exports span batches to an OTLP/HTTP collector with SigV4 authentication.
///
/// The exporter is synchronous: [`export_spans`](Self::export_spans) blocks
/// the calling thread for the request and for every backoff wait. It can be
/// shared between threads; once [`shutdown`](Self::shutdown) is called, every
/// export fails with [`ExportError::AlreadyShutdown`].
pub struct SigV4SpanExporter<E = ProtobufSpanEncoder> {
    config: ExportConfig,
    encoder: E,
    sender: Sender,
    backoff: Box<dyn Backoff>,
    sleeper: SleepFn,
    is_shutdown: AtomicBool,
}

impl SigV4SpanExporter {
    /// Returns a builder with default settings.
    pub fn builder() -> SigV4SpanExporterBuilder {
        SigV4SpanExporterBuilder::default()
    }
}

impl<E: Debug> Debug for SigV4SpanExporter<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigV4SpanExporter")
            .field("config", &self.config)
            .field("encoder", &self.encoder)
            .field("sender", &self.sender)
            .field("backoff", &self.backoff)
            .field("is_shutdown", &self.is_shutdown)
            .finish_non_exhaustive()
    }
}

impl<E: SpanEncoder> SigV4SpanExporter<E> {
    /// Resolved configuration of this exporter.
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Delivers `batch` in one request, retrying transient failures.
    ///
    /// The batch is encoded once; every retry resends the same bytes with a
    /// fresh signature. The call gives up as soon as the next backoff delay
    /// reaches `RetryConfig::max_retry_timeout`.
    pub fn export_spans(&self, batch: &[E::Span]) -> Result<(), ExportError> {
        if self.is_shutdown() {
            otel_debug!(name: "SigV4SpanExporter.ExportAfterShutdown");
            return Err(ExportError::AlreadyShutdown);
        }

        let payload = encode_payload(
            &self.encoder,
            batch,
            &self.config.limits,
            self.config.compression,
        )?;

        let ceiling = self.config.retry.max_retry_timeout;
        let mut retry = RetryState::new(self.backoff.as_ref());
        loop {
            retry.attempts += 1;

            let last_error = match self.sender.send(&payload) {
                Ok(response) if response.ok => {
                    otel_debug!(
                        name: "SigV4SpanExporter.ExportSucceeded",
                        span_count = batch.len(),
                        attempts = retry.attempts
                    );
                    return Ok(());
                }
                Ok(response) => match classify_http_status(response.status_code) {
                    RetryErrorType::Retryable => {
                        format!("status {} ({})", response.status_code, response.reason)
                    }
                    RetryErrorType::NonRetryable => {
                        otel_error!(
                            name: "SigV4SpanExporter.ExportRejected",
                            status_code = response.status_code,
                            reason = response.reason.as_str(),
                            response_body = String::from_utf8_lossy(&response.body).into_owned()
                        );
                        return Err(ExportError::Client {
                            status_code: response.status_code,
                            reason: response.reason,
                        });
                    }
                },
                Err(SendError::Transport(err)) => err.to_string(),
                Err(SendError::Signing(err)) => {
                    otel_error!(
                        name: "SigV4SpanExporter.SigningFailed",
                        error = format!("{err}")
                    );
                    return Err(ExportError::Signing(err));
                }
                Err(SendError::Closed) => return Err(ExportError::AlreadyShutdown),
            };

            match retry.next_delay(ceiling) {
                Some(delay) => {
                    otel_warn!(
                        name: "SigV4SpanExporter.RetryScheduled",
                        attempt = retry.attempts,
                        error = last_error.as_str(),
                        delay = format!("{delay:?}")
                    );
                    (self.sleeper)(delay);
                }
                None => {
                    otel_error!(
                        name: "SigV4SpanExporter.RetriesExhausted",
                        attempts = retry.attempts,
                        waited = format!("{:?}", retry.elapsed),
                        error = last_error.as_str()
                    );
                    return Err(ExportError::RetriesExhausted {
                        attempts: retry.attempts,
                        last_error,
                    });
                }
            }
        }
    }

    /// Stops the exporter and releases the HTTP client. Repeated calls do
    /// nothing.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.close();
        otel_debug!(name: "SigV4SpanExporter.Shutdown");
    }

    /// Nothing is buffered, so there is never anything to flush.
    pub fn force_flush(&self) -> bool {
        true
    }
}

impl<E> opentelemetry_sdk::trace::SpanExporter for SigV4SpanExporter<E>
where
    E: SpanEncoder<Span = SpanData>,
{
    async fn export(&self, batch: Vec<SpanData>) -> OTelSdkResult {
        self.export_spans(&batch).map_err(|err| match err {
            ExportError::AlreadyShutdown => OTelSdkError::AlreadyShutdown,
            err => OTelSdkError::InternalFailure(err.to_string()),
        })
    }

    fn shutdown_with_timeout(&mut self, _timeout: Duration) -> OTelSdkResult {
        SigV4SpanExporter::shutdown(self);
        Ok(())
    }

    fn force_flush(&mut self) -> OTelSdkResult {
        Ok(())
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.encoder.set_resource(resource);
    }
}
