//! The exporter contract between span processors and telemetry sinks.

use std::borrow::Cow;
use std::fmt::Debug;
use std::time::SystemTime;

use futures_util::future::BoxFuture;

use crate::common::KeyValue;
use crate::error::TraceResult;
use crate::trace::provider::Resource;
use crate::trace::span::{Event, SpanKind, Status};
use crate::trace::span_context::{SpanContext, SpanId};

/// Result of an export attempt.
pub type ExportResult = TraceResult<()>;

/// Delivers batches of finished spans to a sink.
///
/// Called from at most one thread at a time per instance; implementations
/// may keep mutable connection state without further locking.
pub trait SpanExporter: Send + Sync + Debug {
    /// Export a batch of finished spans.
    ///
    /// The processor awaits the returned future before handing over the next
    /// batch.
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult>;

    /// Release any held resources. Export is not called afterwards.
    fn shutdown(&mut self) {}

    /// Push any internally buffered spans to the sink.
    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        Box::pin(std::future::ready(Ok(())))
    }

    /// Receive the resource describing the emitting process.
    ///
    /// Called once before the first export.
    fn set_resource(&mut self, _resource: &Resource) {}
}

/// An immutable record of a finished span.
#[derive(Clone, Debug)]
pub struct SpanData {
    /// Trace and span identifiers.
    pub span_context: SpanContext,
    /// Span id of the parent, invalid for root spans.
    pub parent_span_id: SpanId,
    /// Span kind.
    pub span_kind: SpanKind,
    /// Span name.
    pub name: Cow<'static, str>,
    /// Start time.
    pub start_time: SystemTime,
    /// End time.
    pub end_time: SystemTime,
    /// Attributes in insertion order, duplicates preserved.
    pub attributes: Vec<KeyValue>,
    /// Events in recording order.
    pub events: Vec<Event>,
    /// Final status.
    pub status: Status,
}
