//! Exporter that ships finished spans to a collector over TCP.
//!
//! The wire format is newline-delimited JSON: one object per span, ids as
//! lowercase hex, timestamps as unix nanoseconds. The connection is
//! established eagerly so a misconfigured endpoint fails at startup rather
//! than silently dropping telemetry later. A write failure triggers a single
//! reconnect-and-retry before the batch is reported as failed; batches are
//! never retried beyond that.

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::common::Value;
use crate::error::{TraceError, TraceResult};
use crate::trace::export::{ExportResult, SpanData, SpanExporter};
use crate::trace::provider::Resource;
use crate::trace::span::{SpanKind, Status};

/// Ships spans to a collector endpoint as JSON lines over TCP.
#[derive(Debug)]
pub struct CollectorExporter {
    endpoint: String,
    stream: Option<TcpStream>,
    resource: Option<Resource>,
}

impl CollectorExporter {
    /// Connect to a collector at `endpoint` (`host:port`).
    ///
    /// Returns [`TraceError::Initialization`] if the connection cannot be
    /// established; callers are expected to treat that as fatal.
    pub fn connect(endpoint: impl Into<String>) -> TraceResult<Self> {
        let endpoint = endpoint.into();
        let stream = Self::open(&endpoint)?;
        Ok(CollectorExporter {
            endpoint,
            stream: Some(stream),
            resource: None,
        })
    }

    fn open(endpoint: &str) -> TraceResult<TcpStream> {
        let stream = TcpStream::connect(endpoint).map_err(|err| {
            TraceError::Initialization(format!("connect to collector at {endpoint}: {err}"))
        })?;
        // span lines are small, avoid nagling them
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn encode_batch(&self, batch: &[SpanData]) -> TraceResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(batch.len() * 256);
        for span in batch {
            serde_json::to_writer(&mut buf, &WireSpan::from_span(span, self.resource.as_ref()))
                .map_err(|err| TraceError::Export(err.to_string()))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }

    fn write_batch(&mut self, buf: &[u8]) -> ExportResult {
        let stream = self
            .stream
            .as_mut()
            .ok_or(TraceError::AlreadyShutdown)?;

        if let Err(write_err) = stream.write_all(buf) {
            tracing::warn!(
                name: "collector_exporter.write_failed",
                error = %write_err,
            );
            // one reconnect attempt, then give the batch up
            let mut fresh = Self::open(&self.endpoint)
                .map_err(|err| TraceError::Export(err.to_string()))?;
            fresh
                .write_all(buf)
                .map_err(|err| TraceError::Export(err.to_string()))?;
            self.stream = Some(fresh);
        }
        Ok(())
    }
}

impl SpanExporter for CollectorExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .encode_batch(&batch)
            .and_then(|buf| self.write_batch(&buf));
        Box::pin(std::future::ready(result))
    }

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.resource = Some(resource.clone());
    }
}

#[derive(Serialize)]
struct WireSpan<'a> {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: &'a str,
    kind: &'static str,
    start_time_unix_nano: u128,
    end_time_unix_nano: u128,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<WireKeyValue<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<WireEvent<'a>>,
    status: WireStatus<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    resource: Vec<WireKeyValue<'a>>,
}

#[derive(Serialize)]
struct WireKeyValue<'a> {
    key: &'a str,
    value: serde_json::Value,
}

#[derive(Serialize)]
struct WireEvent<'a> {
    name: &'a str,
    time_unix_nano: u128,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<WireKeyValue<'a>>,
}

#[derive(Serialize)]
struct WireStatus<'a> {
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

impl<'a> WireSpan<'a> {
    fn from_span(span: &'a SpanData, resource: Option<&'a Resource>) -> Self {
        WireSpan {
            trace_id: span.span_context.trace_id().to_string(),
            span_id: span.span_context.span_id().to_string(),
            parent_span_id: (span.parent_span_id != crate::trace::SpanId::INVALID)
                .then(|| span.parent_span_id.to_string()),
            name: &span.name,
            kind: kind_str(&span.span_kind),
            start_time_unix_nano: unix_nanos(span.start_time),
            end_time_unix_nano: unix_nanos(span.end_time),
            attributes: span
                .attributes
                .iter()
                .map(|kv| WireKeyValue {
                    key: kv.key.as_str(),
                    value: value_to_json(&kv.value),
                })
                .collect(),
            events: span
                .events
                .iter()
                .map(|event| WireEvent {
                    name: &event.name,
                    time_unix_nano: unix_nanos(event.timestamp),
                    attributes: event
                        .attributes
                        .iter()
                        .map(|kv| WireKeyValue {
                            key: kv.key.as_str(),
                            value: value_to_json(&kv.value),
                        })
                        .collect(),
                })
                .collect(),
            status: match &span.status {
                Status::Unset => WireStatus {
                    code: "unset",
                    description: None,
                },
                Status::Ok => WireStatus {
                    code: "ok",
                    description: None,
                },
                Status::Error { description } => WireStatus {
                    code: "error",
                    description: Some(description),
                },
            },
            resource: resource
                .map(|resource| {
                    resource
                        .attributes()
                        .iter()
                        .map(|kv| WireKeyValue {
                            key: kv.key.as_str(),
                            value: value_to_json(&kv.value),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn kind_str(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
        SpanKind::Producer => "producer",
        SpanKind::Consumer => "consumer",
        SpanKind::Internal => "internal",
    }
}

fn unix_nanos(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(v) => serde_json::Value::from(*v),
        Value::I64(v) => serde_json::Value::from(*v),
        Value::F64(v) => serde_json::Value::from(*v),
        Value::String(v) => serde_json::Value::from(v.as_ref()),
        Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(value_to_json).collect())
        }
    }
}
