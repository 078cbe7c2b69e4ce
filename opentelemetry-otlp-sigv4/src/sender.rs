//! Signed delivery of one encoded payload.

use crate::encoder::EncodedPayload;
use crate::error::SigningError;
use crate::signer::RequestSigner;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Uri};
use opentelemetry::otel_debug;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Content type of OTLP protobuf bodies.
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Error type of [`HttpTransport`] implementations.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Blocking HTTP client used to deliver signed requests.
///
/// Non-success statuses must be returned as responses, not as errors, so the
/// exporter can tell throttling apart from rejection. Errors are reserved for
/// requests that never produced a response, such as connection failures and
/// timeouts.
pub trait HttpTransport: Debug + Send + Sync {
    /// Sends `request`, giving up after `timeout`.
    fn send(&self, request: Request<Bytes>, timeout: Duration)
        -> Result<Response<Bytes>, HttpError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    fn send(
        &self,
        request: Request<Bytes>,
        timeout: Duration,
    ) -> Result<Response<Bytes>, HttpError> {
        (**self).send(request, timeout)
    }
}

#[cfg(feature = "reqwest-blocking-client")]
mod reqwest_blocking {
    use super::{Bytes, HttpError, HttpTransport, Request, Response};
    use opentelemetry::otel_debug;
    use std::time::Duration;

    impl HttpTransport for reqwest::blocking::Client {
        fn send(
            &self,
            request: Request<Bytes>,
            timeout: Duration,
        ) -> Result<Response<Bytes>, HttpError> {
            otel_debug!(name: "ReqwestBlockingClient.Send");
            let mut request: reqwest::blocking::Request = request.try_into()?;
            *request.timeout_mut() = Some(timeout);
            let mut response = self.execute(request)?;
            let status = response.status();
            let headers = std::mem::take(response.headers_mut());
            // A body that breaks off still yields the status.
            let body = response.bytes().unwrap_or_else(|err| {
                otel_debug!(
                    name: "ReqwestBlockingClient.ResponseBodyUnreadable",
                    status = status.as_u16(),
                    error = err.to_string()
                );
                Bytes::new()
            });
            let mut http_response = Response::builder().status(status).body(body)?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }
}

/// The parts of a collector response the exporter looks at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Whether the status is 2xx.
    pub ok: bool,
    /// Canonical reason phrase of the status, `"Unknown"` for unregistered codes.
    pub reason: String,
    /// Response body.
    pub body: Bytes,
}

impl From<Response<Bytes>> for HttpResponse {
    fn from(response: Response<Bytes>) -> Self {
        let status = response.status();
        HttpResponse {
            status_code: status.as_u16(),
            ok: status.is_success(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_owned(),
            body: response.into_body(),
        }
    }
}

/// Reasons a send attempt produced no response.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SendError {
    /// The request could not be built or delivered.
    #[error("request failed: {0}")]
    Transport(HttpError),

    /// The signer refused the request.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// [`Sender::close`] was called.
    #[error("sender is closed")]
    Closed,
}

/// Builds, signs and delivers export requests.
///
/// The transport is released by [`close`](Sender::close); every later send
/// fails with [`SendError::Closed`].
#[derive(Debug)]
pub struct Sender {
    transport: Mutex<Option<Arc<dyn HttpTransport>>>,
    signer: Arc<dyn RequestSigner>,
    endpoint: Uri,
    headers: HeaderMap,
    timeout: Duration,
}

impl Sender {
    /// Creates a sender posting to `endpoint` with the given extra headers.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        signer: Arc<dyn RequestSigner>,
        endpoint: Uri,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Self {
        Sender {
            transport: Mutex::new(Some(transport)),
            signer,
            endpoint,
            headers,
            timeout,
        }
    }

    /// Collector endpoint requests are posted to.
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    /// Signs `payload` into a POST request and sends it once.
    ///
    /// Every call builds and signs a fresh request, so retries never reuse an
    /// expired signature.
    pub fn send(&self, payload: &EncodedPayload) -> Result<HttpResponse, SendError> {
        let transport = self.transport().ok_or(SendError::Closed)?;

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .body(payload.body().clone())
            .map_err(|e| SendError::Transport(Box::new(e)))?;

        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(PROTOBUF_CONTENT_TYPE),
        );
        if let Some(encoding) = payload.content_encoding() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        }

        self.signer.sign(&mut request)?;

        otel_debug!(
            name: "SigV4SpanExporter.Send",
            endpoint = self.endpoint.to_string(),
            body_size = payload.body().len()
        );
        let response = transport
            .send(request, self.timeout)
            .map_err(SendError::Transport)?;

        Ok(HttpResponse::from(response))
    }

    /// Releases the transport. Returns `false` if it was already released.
    pub fn close(&self) -> bool {
        let mut transport = match self.transport.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        transport.take().is_some()
    }

    /// Whether [`close`](Sender::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.transport().is_none()
    }

    fn transport(&self) -> Option<Arc<dyn HttpTransport>> {
        match self.transport.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Compression, ExportLimits};
    use crate::encoder::encode_payload;
    use crate::encoder::tests::FixedEncoder;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One scripted transport outcome.
    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        Status(u16),
        Fail(&'static str),
    }

    /// Transport replaying scripted outcomes and recording every request.
    ///
    /// Once the script runs out the last reply repeats.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        last: Mutex<Option<Reply>>,
        pub(crate) requests: Mutex<Vec<Request<Bytes>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
            Arc::new(ScriptedTransport {
                replies: Mutex::new(replies.into_iter().collect()),
                ..Default::default()
            })
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn send(
            &self,
            request: Request<Bytes>,
            _timeout: Duration,
        ) -> Result<Response<Bytes>, HttpError> {
            self.requests.lock().unwrap().push(request);
            let reply = {
                let mut last = self.last.lock().unwrap();
                if let Some(next) = self.replies.lock().unwrap().pop_front() {
                    *last = Some(next);
                }
                last.clone().unwrap_or(Reply::Status(200))
            };
            match reply {
                Reply::Status(code) => Ok(Response::builder()
                    .status(code)
                    .body(Bytes::from_static(b"{}"))?),
                Reply::Fail(msg) => Err(msg.into()),
            }
        }
    }

    /// Signer stamping a counter header, or failing when told to.
    #[derive(Debug, Default)]
    pub(crate) struct StubSigner {
        pub(crate) fail: bool,
        pub(crate) calls: AtomicUsize,
    }

    impl RequestSigner for StubSigner {
        fn sign(&self, request: &mut Request<Bytes>) -> Result<(), SigningError> {
            if self.fail {
                return Err(SigningError::MissingCredentials);
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            request
                .headers_mut()
                .insert("x-test-signature", HeaderValue::from(n));
            Ok(())
        }
    }

    fn sender_with(transport: Arc<ScriptedTransport>, signer: Arc<StubSigner>) -> Sender {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("value"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        Sender::new(
            transport,
            signer,
            Uri::from_static("https://xray.us-east-1.amazonaws.com/v1/traces"),
            headers,
            Duration::from_secs(1),
        )
    }

    fn payload(compression: Option<Compression>) -> EncodedPayload {
        encode_payload(
            &FixedEncoder::new(b"spans".to_vec()),
            &[1],
            &ExportLimits::default(),
            compression,
        )
        .unwrap()
    }

    #[test]
    fn test_send_builds_signed_protobuf_post() {
        let transport = ScriptedTransport::new([Reply::Status(200)]);
        let signer = Arc::new(StubSigner::default());
        let sender = sender_with(transport.clone(), signer.clone());

        let response = sender.send(&payload(None)).unwrap();

        assert_eq!(
            sender.endpoint(),
            "https://xray.us-east-1.amazonaws.com/v1/traces"
        );
        assert!(response.ok);
        assert_eq!(response.status_code, 200);
        assert_eq!(response.reason, "OK");

        let requests = transport.requests.lock().unwrap();
        let request = &requests[0];
        assert_eq!(request.method(), Method::POST);
        assert_eq!(
            request.uri(),
            "https://xray.us-east-1.amazonaws.com/v1/traces"
        );
        assert_eq!(request.headers()[CONTENT_TYPE], PROTOBUF_CONTENT_TYPE);
        assert_eq!(request.headers()["x-custom"], "value");
        assert!(request.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(request.headers()["x-test-signature"], "0");
        assert_eq!(request.body().as_ref(), b"spans");
    }

    #[cfg(feature = "gzip-http")]
    #[test]
    fn test_compressed_payload_sets_content_encoding() {
        let transport = ScriptedTransport::new([Reply::Status(200)]);
        let sender = sender_with(transport.clone(), Arc::new(StubSigner::default()));

        sender.send(&payload(Some(Compression::Gzip))).unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].headers()[CONTENT_ENCODING], "gzip");
    }

    #[test]
    fn test_each_send_is_signed_again() {
        let transport = ScriptedTransport::new([Reply::Status(503), Reply::Status(200)]);
        let signer = Arc::new(StubSigner::default());
        let sender = sender_with(transport.clone(), signer.clone());
        let payload = payload(None);

        let first = sender.send(&payload).unwrap();
        let second = sender.send(&payload).unwrap();

        assert_eq!(first.status_code, 503);
        assert!(!first.ok);
        assert_eq!(first.reason, "Service Unavailable");
        assert!(second.ok);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            transport.requests.lock().unwrap()[1].headers()["x-test-signature"],
            "1"
        );
    }

    #[test]
    fn test_signing_failure_sends_nothing() {
        let transport = ScriptedTransport::new([Reply::Status(200)]);
        let signer = Arc::new(StubSigner {
            fail: true,
            ..Default::default()
        });
        let sender = sender_with(transport.clone(), signer);

        let result = sender.send(&payload(None));

        assert!(matches!(
            result,
            Err(SendError::Signing(SigningError::MissingCredentials))
        ));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_transport_failure_is_reported() {
        let transport = ScriptedTransport::new([Reply::Fail("connection refused")]);
        let sender = sender_with(transport, Arc::new(StubSigner::default()));

        let result = sender.send(&payload(None));

        assert!(
            matches!(result, Err(SendError::Transport(e)) if e.to_string() == "connection refused")
        );
    }

    #[test]
    fn test_closed_sender_refuses_to_send() {
        let transport = ScriptedTransport::new([Reply::Status(200)]);
        let sender = sender_with(transport.clone(), Arc::new(StubSigner::default()));

        assert!(!sender.is_closed());
        assert!(sender.close());
        assert!(!sender.close());
        assert!(sender.is_closed());

        assert!(matches!(
            sender.send(&payload(None)),
            Err(SendError::Closed)
        ));
        assert_eq!(transport.request_count(), 0);
    }
}
