//! The recording half of the span lifecycle.
//!
//! A [`Span`] is a handle to a single named, timed operation. While the span
//! is active its mutations (attributes, events, status, name) are buffered in
//! an internal record; [`Span::end`] takes that record and hands it to the
//! provider's processors exactly once. Every mutation after `end` is a silent
//! no-op, which keeps instrumentation sites free of lifecycle bookkeeping.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::time::SystemTime;

use crate::common::KeyValue;
use crate::trace::export;
use crate::trace::span_context::SpanContext;
use crate::trace::tracer::Tracer;

/// Describes the relationship between a span and the operation it measures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpanKind {
    /// Outbound request to a remote service.
    Client,
    /// Handling of an inbound request.
    Server,
    /// Creation of a message for asynchronous processing.
    Producer,
    /// Processing of a previously produced message.
    Consumer,
    /// Operation internal to the application.
    Internal,
}

/// The code path outcome recorded on a span.
///
/// `Unset` is the initial state. `Ok` is final: once set it cannot be
/// replaced. An `Error` set after another `Error` replaces the description
/// (last write wins).
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Status {
    /// Default, no outcome recorded.
    #[default]
    Unset,
    /// The operation failed.
    Error {
        /// Human-readable failure description.
        description: Cow<'static, str>,
    },
    /// The operation completed successfully.
    Ok,
}

impl Status {
    /// Create an error status with the given description.
    pub fn error(description: impl Into<Cow<'static, str>>) -> Self {
        Status::Error {
            description: description.into(),
        }
    }
}

/// A timestamped annotation on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Event name.
    pub name: Cow<'static, str>,
    /// Time the event occurred.
    pub timestamp: SystemTime,
    /// Attributes describing the event.
    pub attributes: Vec<KeyValue>,
}

impl Event {
    /// Create a new event.
    pub fn new<T: Into<Cow<'static, str>>>(
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) -> Self {
        Event {
            name: name.into(),
            timestamp,
            attributes,
        }
    }

    /// Create an event with the current time and no attributes.
    pub fn with_name<T: Into<Cow<'static, str>>>(name: T) -> Self {
        Event {
            name: name.into(),
            timestamp: SystemTime::now(),
            attributes: Vec::new(),
        }
    }
}

/// Single operation within a trace.
///
/// Ends on drop if not explicitly ended first.
pub struct Span {
    span_context: SpanContext,
    data: Option<SpanData>,
    tracer: Tracer,
}

/// The mutable record buffered while a span is active.
#[derive(Clone, Debug)]
pub(crate) struct SpanData {
    pub(crate) parent_span_id: crate::trace::SpanId,
    pub(crate) span_kind: SpanKind,
    pub(crate) name: Cow<'static, str>,
    pub(crate) start_time: SystemTime,
    pub(crate) end_time: SystemTime,
    pub(crate) attributes: Vec<KeyValue>,
    pub(crate) events: Vec<Event>,
    pub(crate) status: Status,
}

impl Span {
    pub(crate) fn new(span_context: SpanContext, data: Option<SpanData>, tracer: Tracer) -> Self {
        Span {
            span_context,
            data,
            tracer,
        }
    }

    /// Operate on a reference to span data, no-op after the span has ended.
    fn with_data<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce(&mut SpanData) -> T,
    {
        self.data.as_mut().map(f)
    }

    /// Immutable identifiers of this span.
    pub fn span_context(&self) -> &SpanContext {
        &self.span_context
    }

    /// Returns `true` until the span has ended.
    pub fn is_recording(&self) -> bool {
        self.data.is_some()
    }

    /// Append an attribute.
    ///
    /// Keys are not deduplicated; duplicate keys are recorded in insertion
    /// order and consumers may fold them as they see fit.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        self.with_data(|data| {
            data.attributes.push(attribute);
        });
    }

    /// Append a set of attributes in one call.
    pub fn set_attributes(&mut self, attributes: impl IntoIterator<Item = KeyValue>) {
        self.with_data(|data| {
            data.attributes.extend(attributes);
        });
    }

    /// Record an event with the current timestamp.
    pub fn add_event<T>(&mut self, name: T, attributes: Vec<KeyValue>)
    where
        T: Into<Cow<'static, str>>,
    {
        self.add_event_with_timestamp(name, SystemTime::now(), attributes)
    }

    /// Record an event with a caller-supplied timestamp.
    pub fn add_event_with_timestamp<T>(
        &mut self,
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) where
        T: Into<Cow<'static, str>>,
    {
        self.with_data(|data| {
            data.events.push(Event::new(name, timestamp, attributes));
        });
    }

    /// Record an error as an `exception` event and mark the span failed.
    ///
    /// The event and the status change are applied together, so a consumer
    /// never observes the event without the matching `Error` status. An
    /// earlier `Ok` status still wins over the error.
    pub fn record_error(&mut self, err: &dyn Error) {
        let message = err.to_string();
        self.with_data(|data| {
            data.events.push(Event::new(
                "exception",
                SystemTime::now(),
                vec![KeyValue::new("exception.message", message.clone())],
            ));
            if !matches!(data.status, Status::Ok) {
                data.status = Status::Error {
                    description: message.into(),
                };
            }
        });
    }

    /// Set the span status.
    ///
    /// `Ok` is final, `Unset` never overrides a recorded outcome, and a later
    /// `Error` replaces an earlier error's description.
    pub fn set_status(&mut self, status: Status) {
        self.with_data(|data| {
            if matches!(data.status, Status::Ok) || matches!(status, Status::Unset) {
                return;
            }
            data.status = status;
        });
    }

    /// Replace the span name.
    pub fn update_name<T>(&mut self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_data(|data| {
            data.name = new_name.into();
        });
    }

    /// Finish the span with the current timestamp.
    pub fn end(&mut self) {
        self.end_with_timestamp(SystemTime::now());
    }

    /// Finish the span with a caller-supplied end timestamp.
    pub fn end_with_timestamp(&mut self, timestamp: SystemTime) {
        self.ensure_ended_and_exported(timestamp);
    }

    fn ensure_ended_and_exported(&mut self, timestamp: SystemTime) {
        let Some(mut data) = self.data.take() else {
            return;
        };
        data.end_time = timestamp;

        let provider = self.tracer.provider();
        if provider.is_shutdown() {
            return;
        }

        let exported = export::SpanData {
            span_context: self.span_context.clone(),
            parent_span_id: data.parent_span_id,
            span_kind: data.span_kind,
            name: data.name,
            start_time: data.start_time,
            end_time: data.end_time,
            attributes: data.attributes,
            events: data.events,
            status: data.status,
        };

        if let Some((last, rest)) = provider.span_processors().split_last() {
            for processor in rest {
                processor.on_end(exported.clone());
            }
            last.on_end(exported);
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("span_context", &self.span_context)
            .field("is_recording", &self.is_recording())
            .finish()
    }
}

impl Drop for Span {
    /// Report the span on drop unless it was already ended.
    fn drop(&mut self) {
        if self.data.is_some() {
            self.ensure_ended_and_exported(SystemTime::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::in_memory_exporter::InMemorySpanExporter;
    use crate::trace::provider::TracerProvider;

    fn test_tracer() -> (Tracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider.tracer("test"), exporter)
    }

    #[test]
    fn mutation_after_end_is_noop() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("operation");
        span.set_attribute(KeyValue::new("before", true));
        span.end();

        span.set_attribute(KeyValue::new("after", true));
        span.add_event("too-late", vec![]);
        span.set_status(Status::error("too late"));
        span.end();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1, "second end must not re-export");
        assert_eq!(spans[0].attributes.len(), 1);
        assert!(spans[0].events.is_empty());
        assert_eq!(spans[0].status, Status::Unset);
    }

    #[test]
    fn duplicate_keys_preserved_in_order() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("operation");
        span.set_attribute(KeyValue::new("retry", 1));
        span.set_attributes([KeyValue::new("retry", 2), KeyValue::new("cached", false)]);
        span.end();

        assert_eq!(
            exporter.get_finished_spans().unwrap()[0].attributes,
            vec![
                KeyValue::new("retry", 1),
                KeyValue::new("retry", 2),
                KeyValue::new("cached", false),
            ]
        );
    }

    #[test]
    fn ok_status_is_final() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("operation");
        span.set_status(Status::Ok);
        span.set_status(Status::error("ignored"));
        span.end();

        assert_eq!(exporter.get_finished_spans().unwrap()[0].status, Status::Ok);
    }

    #[test]
    fn unset_never_overrides() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("operation");
        span.set_status(Status::error("kept"));
        span.set_status(Status::Unset);
        span.end();

        assert_eq!(
            exporter.get_finished_spans().unwrap()[0].status,
            Status::error("kept")
        );
    }

    #[test]
    fn later_error_replaces_description() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("operation");
        span.set_status(Status::error("first"));
        span.set_status(Status::error("second"));
        span.end();

        assert_eq!(
            exporter.get_finished_spans().unwrap()[0].status,
            Status::error("second")
        );
    }

    #[test]
    fn record_error_sets_event_and_status() {
        let (tracer, exporter) = test_tracer();
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");

        let mut span = tracer.start("operation");
        span.record_error(&err);
        span.end();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].events.len(), 1);
        assert_eq!(spans[0].events[0].name, "exception");
        assert_eq!(
            spans[0].events[0].attributes,
            vec![KeyValue::new("exception.message", "disk on fire".to_string())]
        );
        assert_eq!(spans[0].status, Status::error("disk on fire".to_string()));
    }

    #[test]
    fn record_error_does_not_override_ok() {
        let (tracer, exporter) = test_tracer();
        let err = std::io::Error::new(std::io::ErrorKind::Other, "late failure");

        let mut span = tracer.start("operation");
        span.set_status(Status::Ok);
        span.record_error(&err);
        span.end();

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].status, Status::Ok);
        assert_eq!(spans[0].events.len(), 1, "event still recorded");
    }

    #[test]
    fn drop_ends_span() {
        let (tracer, exporter) = test_tracer();
        {
            let mut span = tracer.start("dropped");
            span.set_attribute(KeyValue::new("k", "v"));
        }
        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "dropped");
    }

    #[test]
    fn explicit_end_timestamp() {
        let (tracer, exporter) = test_tracer();
        let end = SystemTime::now();
        let mut span = tracer.start("operation");
        span.end_with_timestamp(end);

        assert_eq!(exporter.get_finished_spans().unwrap()[0].end_time, end);
    }

    #[test]
    fn update_name() {
        let (tracer, exporter) = test_tracer();
        let mut span = tracer.start("initial");
        span.update_name("resolved /users/:id");
        span.end();

        assert_eq!(
            exporter.get_finished_spans().unwrap()[0].name,
            "resolved /users/:id"
        );
    }
}
