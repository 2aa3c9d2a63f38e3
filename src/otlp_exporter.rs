//! OpenTelemetry OTLP exporter for WASM call traces
//!
//! Uploads each trace's call tree as OTLP spans.
//!
//! # Architecture
//!
//! - Every call event becomes one span, named after the demangled function
//! - Parent/child span links mirror call nesting
//! - The execution's telemetry id is the OTLP trace id
//! - Memory growth inside a call is a span event with an `allocation` attribute
//! - Spans go to an OTLP endpoint (Jaeger, Tempo, Honeycomb, ...) over gRPC or
//!   HTTP/protobuf
//!
//! # Example
//!
//! ```no_run
//! use rastreo::batcher::BatchConfig;
//! use rastreo::otlp_exporter::{otlp_adapter, OtlpConfig, OtlpProtocol};
//!
//! let config = OtlpConfig {
//!     service_name: "my-wasm-service".to_string(),
//!     endpoint: "localhost:4317".to_string(),
//!     protocol: OtlpProtocol::Grpc,
//!     allow_insecure: true,
//!     ..Default::default()
//! };
//! let adapter = otlp_adapter(&config, BatchConfig::default()).unwrap();
//! adapter.start();
//! // ... hand adapter to an Observer ...
//! adapter.stop(true);
//! ```

use crate::batcher::{BatchConfig, FlushError, Flusher, TraceBatcher};
use crate::config::ConfigError;
use crate::event::Trace;
use crate::span_record::SpanRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "otlp")]
use crate::span_mapper::map_trace;
#[cfg(feature = "otlp")]
use crate::span_record::from_unix_nanos;
#[cfg(feature = "otlp")]
use opentelemetry::{
    trace::{
        Span as _, SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId,
        TraceState, Tracer as _, TracerProvider as _,
    },
    Context, KeyValue,
};
#[cfg(feature = "otlp")]
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig, WithTonicConfig};
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    trace::{BatchSpanProcessor, SdkTracerProvider},
    Resource,
};

/// Per-call upload timeout
pub const OTLP_TIMEOUT: Duration = Duration::from_secs(2);

const TRACER_NAME: &str = "rastreo";

/// OTLP transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OtlpProtocol {
    /// Streaming RPC (tonic)
    #[default]
    #[serde(rename = "grpc")]
    Grpc,
    /// HTTP request/response with protobuf bodies
    #[serde(rename = "http/protobuf")]
    HttpProtobuf,
}

/// Configuration for the OTLP exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtlpConfig {
    /// Service name reported on the resource
    pub service_name: String,
    /// Collector address, either `host:port` or a full URL
    pub endpoint: String,
    pub protocol: OtlpProtocol,
    /// Extra headers (gRPC metadata for `grpc`)
    pub headers: HashMap<String, String>,
    /// Permit plaintext transport
    pub allow_insecure: bool,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            service_name: "rastreo".to_string(),
            endpoint: "localhost:4317".to_string(),
            protocol: OtlpProtocol::Grpc,
            headers: HashMap::new(),
            allow_insecure: false,
        }
    }
}

/// OTLP exporter errors
#[derive(Error, Debug)]
pub enum OtlpError {
    #[error("endpoint {0} is plaintext; set allow_insecure to use it")]
    InsecureEndpoint(String),

    #[error("failed to build OTLP exporter: {0}")]
    Build(String),

    #[error("failed to create Tokio runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("OTLP support not compiled in. Enable the 'otlp' feature.")]
    Disabled,
}

impl OtlpConfig {
    /// Endpoint URL with scheme (and `/v1/traces` for HTTP)
    ///
    /// A bare `host:port` gets `https://`, or `http://` when insecure
    /// transport is allowed. An explicit `http://` URL requires
    /// `allow_insecure`.
    pub fn resolved_endpoint(&self) -> Result<String, OtlpError> {
        let endpoint = self.endpoint.trim_end_matches('/');
        let url = if endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with("http://") {
            if !self.allow_insecure {
                return Err(OtlpError::InsecureEndpoint(endpoint.to_string()));
            }
            endpoint.to_string()
        } else if self.allow_insecure {
            format!("http://{}", endpoint)
        } else {
            format!("https://{}", endpoint)
        };

        if self.protocol == OtlpProtocol::HttpProtobuf {
            let authority_and_path = url.split_once("://").map_or(url.as_str(), |(_, rest)| rest);
            if !authority_and_path.contains('/') {
                return Ok(format!("{}/v1/traces", url));
            }
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid("otlp.service_name must not be empty".to_string()));
        }
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("otlp.endpoint must not be empty".to_string()));
        }
        self.resolved_endpoint()
            .map(|_| ())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Interpret caller metadata as a string → string map
///
/// Any other shape is logged and ignored; the upload goes ahead without it.
pub fn string_metadata(metadata: &serde_json::Value) -> Option<HashMap<String, String>> {
    match serde_json::from_value::<HashMap<String, String>>(metadata.clone()) {
        Ok(map) => Some(map),
        Err(_) => {
            tracing::warn!("trace metadata must be a map of strings to strings; omitting it");
            None
        }
    }
}

/// Add metadata as attributes on every top-level span
pub fn apply_metadata(spans: &mut [SpanRecord], metadata: &HashMap<String, String>) {
    for span in spans.iter_mut().filter(|s| s.is_root()) {
        span.attributes
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Batcher that uploads to an OTLP collector
pub type OtlpAdapter = TraceBatcher<OtlpUploader>;

/// Build an OTLP uploader wrapped in a trace batcher
pub fn otlp_adapter(config: &OtlpConfig, batch: BatchConfig) -> Result<OtlpAdapter, OtlpError> {
    Ok(TraceBatcher::new(batch, OtlpUploader::new(config)?)?)
}

/// Uploads flushed traces through the OpenTelemetry SDK
#[cfg(feature = "otlp")]
pub struct OtlpUploader {
    _runtime: tokio::runtime::Runtime, // Tokio runtime for async OTLP operations
    provider: SdkTracerProvider,
}

#[cfg(feature = "otlp")]
impl OtlpUploader {
    /// Create a new OTLP uploader
    pub fn new(config: &OtlpConfig) -> Result<Self, OtlpError> {
        let endpoint = config.resolved_endpoint()?;
        let runtime = tokio::runtime::Runtime::new()?;

        let exporter = match config.protocol {
            // tonic channels must be created inside the runtime
            OtlpProtocol::Grpc => runtime.block_on(async {
                opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(endpoint.clone())
                    .with_timeout(OTLP_TIMEOUT)
                    .with_metadata(grpc_metadata(&config.headers))
                    .build()
            }),
            OtlpProtocol::HttpProtobuf => opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(endpoint.clone())
                .with_timeout(OTLP_TIMEOUT)
                .with_headers(config.headers.clone())
                .build(),
        }
        .map_err(|e| OtlpError::Build(e.to_string()))?;

        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .with_attributes(vec![KeyValue::new("telemetry.sdk.component", TRACER_NAME)])
            .build();

        let provider = SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter).build())
            .with_resource(resource)
            .build();

        tracing::info!(%endpoint, protocol = ?config.protocol, "OTLP exporter ready");

        Ok(Self {
            _runtime: runtime,
            provider,
        })
    }

    /// Replay span records with their own ids and timestamps
    fn record_spans(&self, spans: &[SpanRecord]) {
        let tracer = self.provider.tracer(TRACER_NAME);

        for record in spans {
            let trace_id = TraceId::from_bytes(record.trace_id);
            let parent_cx = match record.parent_span_id {
                Some(parent) => Context::new().with_remote_span_context(SpanContext::new(
                    trace_id,
                    SpanId::from_bytes(parent),
                    TraceFlags::SAMPLED,
                    false,
                    TraceState::default(),
                )),
                None => Context::new(),
            };

            let mut span = tracer
                .span_builder(record.span_name.clone())
                .with_kind(SpanKind::Internal)
                .with_trace_id(trace_id)
                .with_span_id(SpanId::from_bytes(record.span_id))
                .with_start_time(record.start_time())
                .with_attributes(key_values(&record.attributes))
                .start_with_context(&tracer, &parent_cx);

            for event in &record.events {
                span.add_event_with_timestamp(
                    event.name.clone(),
                    from_unix_nanos(event.time_nanos),
                    key_values(&event.attributes),
                );
            }

            span.end_with_timestamp(record.end_time());
        }
    }
}

#[cfg(feature = "otlp")]
fn key_values(attributes: &HashMap<String, String>) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect()
}

#[cfg(feature = "otlp")]
fn grpc_metadata(headers: &HashMap<String, String>) -> tonic::metadata::MetadataMap {
    use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};

    let mut map = MetadataMap::with_capacity(headers.len());
    for (name, value) in headers {
        let key = MetadataKey::<Ascii>::from_bytes(name.to_ascii_lowercase().as_bytes());
        match (key, value.parse::<MetadataValue<Ascii>>()) {
            (Ok(key), Ok(value)) => {
                map.insert(key, value);
            }
            _ => tracing::warn!(header = %name, "skipping header that is not valid gRPC metadata"),
        }
    }
    map
}

#[cfg(feature = "otlp")]
impl Flusher for OtlpUploader {
    fn flush(&self, batch: Vec<Trace>) -> Result<(), FlushError> {
        for trace in &batch {
            let mut spans = map_trace(trace);
            if spans.is_empty() {
                continue;
            }

            if let Some(metadata) = trace.metadata.as_ref().and_then(string_metadata) {
                apply_metadata(&mut spans, &metadata);
            }

            self.record_spans(&spans);
            match self.provider.force_flush() {
                Ok(()) => tracing::debug!(
                    trace_id = %trace.telemetry_id,
                    spans = spans.len(),
                    "uploaded wasm trace"
                ),
                Err(e) => tracing::error!(
                    trace_id = %trace.telemetry_id,
                    "failed to upload wasm trace to OTLP endpoint: {}",
                    e
                ),
            }
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), FlushError> {
        self.provider
            .shutdown()
            .map_err(|e| FlushError::Shutdown(e.to_string()))
    }
}

// Stub implementation when OTLP feature is disabled
#[cfg(not(feature = "otlp"))]
pub struct OtlpUploader;

#[cfg(not(feature = "otlp"))]
impl OtlpUploader {
    pub fn new(_config: &OtlpConfig) -> Result<Self, OtlpError> {
        Err(OtlpError::Disabled)
    }
}

#[cfg(not(feature = "otlp"))]
impl Flusher for OtlpUploader {
    fn flush(&self, _batch: Vec<Trace>) -> Result<(), FlushError> {
        Ok(())
    }
}
