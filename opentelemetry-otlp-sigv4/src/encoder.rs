//! Turning a span batch into the request body.
//!
//! Serialization itself is delegated to a [`SpanEncoder`]. This module owns the
//! checks around it: the span count is validated before any work is done, and
//! the serialized size is checked before compression so that compression never
//! hides an oversized payload.

use crate::config::{Compression, ExportLimits};
use crate::error::ExportError;
use bytes::Bytes;
use opentelemetry::otel_warn;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::transform::common::tonic::ResourceAttributesWithSchema;
use opentelemetry_proto::transform::trace::tonic::group_spans_by_resource_and_scope;
use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::Resource;
use prost::Message;
use std::fmt::Debug;

/// Error type returned by encoders.
pub type EncodeError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Serializes a batch of spans into the wire format.
pub trait SpanEncoder: Debug + Send + Sync {
    /// Span record type this encoder accepts.
    type Span;

    /// Serializes `batch`. Must not reorder or drop spans.
    fn encode(&self, batch: &[Self::Span]) -> Result<Vec<u8>, EncodeError>;

    /// Receives the resource of the tracer provider the exporter is attached to.
    fn set_resource(&mut self, _resource: &Resource) {}
}

/// Encodes [`SpanData`] as an OTLP `ExportTraceServiceRequest` protobuf.
#[derive(Debug, Default)]
pub struct ProtobufSpanEncoder {
    resource: ResourceAttributesWithSchema,
}

impl ProtobufSpanEncoder {
    /// Creates an encoder with an empty resource.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpanEncoder for ProtobufSpanEncoder {
    type Span = SpanData;

    fn encode(&self, batch: &[SpanData]) -> Result<Vec<u8>, EncodeError> {
        let req = ExportTraceServiceRequest {
            resource_spans: group_spans_by_resource_and_scope(batch.to_vec(), &self.resource),
        };
        Ok(req.encode_to_vec())
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.resource = resource.into();
    }
}

/// Serialized, possibly compressed request body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedPayload {
    body: Bytes,
    compression: Option<Compression>,
}

impl EncodedPayload {
    /// Request body, already compressed when a compression is set.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Compression applied to the body.
    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    /// Value for the `Content-Encoding` header, if one is needed.
    pub fn content_encoding(&self) -> Option<&'static str> {
        self.compression.as_ref().map(Compression::content_encoding)
    }
}

/// Fails when a batch of `len` spans is over the configured span limit.
pub fn check_batch_len(len: usize, limits: &ExportLimits) -> Result<(), ExportError> {
    if len > limits.max_spans_per_batch {
        otel_warn!(
            name: "SigV4SpanExporter.TooManySpans",
            span_count = len,
            limit = limits.max_spans_per_batch
        );
        return Err(ExportError::TooManySpans {
            count: len,
            limit: limits.max_spans_per_batch,
        });
    }
    Ok(())
}

/// Validates, serializes and compresses one batch.
pub fn encode_payload<E: SpanEncoder + ?Sized>(
    encoder: &E,
    batch: &[E::Span],
    limits: &ExportLimits,
    compression: Option<Compression>,
) -> Result<EncodedPayload, ExportError> {
    check_batch_len(batch.len(), limits)?;

    let serialized = encoder
        .encode(batch)
        .map_err(|e| ExportError::Encode(e.to_string()))?;

    if serialized.len() > limits.max_uncompressed_bytes {
        otel_warn!(
            name: "SigV4SpanExporter.PayloadTooLarge",
            size = serialized.len(),
            limit = limits.max_uncompressed_bytes
        );
        return Err(ExportError::PayloadTooLarge {
            size: serialized.len(),
            limit: limits.max_uncompressed_bytes,
        });
    }

    let body = match compression {
        None => serialized,
        Some(compression) => compress(compression, &serialized)
            .map_err(|e| ExportError::Encode(format!("{compression} compression failed: {e}")))?,
    };

    Ok(EncodedPayload {
        body: body.into(),
        compression,
    })
}

fn compress(compression: Compression, input: &[u8]) -> std::io::Result<Vec<u8>> {
    match compression {
        #[cfg(feature = "gzip-http")]
        Compression::Gzip => {
            use flate2::write::GzEncoder;
            use std::io::Write;

            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input)?;
            encoder.finish()
        }
        #[cfg(feature = "deflate-http")]
        Compression::Deflate => {
            use flate2::write::ZlibEncoder;
            use std::io::Write;

            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(input)?;
            encoder.finish()
        }
        #[allow(unreachable_patterns)]
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{compression} support is not compiled in"),
        )),
    }
}
