//! Span creation.
//!
//! A [`Tracer`] is a cheap, cloneable handle scoped to an instrumentation
//! name. Parenting is resolved at build time from an explicit [`Context`]
//! (or the thread's current one): a valid active span makes the new span its
//! child on the same trace, otherwise a fresh trace id is generated and the
//! span becomes a root.

use std::borrow::Cow;
use std::time::SystemTime;

use crate::common::KeyValue;
use crate::context::Context;
use crate::trace::provider::TracerProvider;
use crate::trace::span::{Event, Span, SpanData, SpanKind, Status};
use crate::trace::span_context::{SpanContext, SpanId, TraceId};

/// Entry point for creating spans.
#[derive(Clone, Debug)]
pub struct Tracer {
    name: Cow<'static, str>,
    provider: TracerProvider,
}

impl Tracer {
    pub(crate) fn new(name: Cow<'static, str>, provider: TracerProvider) -> Self {
        Tracer { name, provider }
    }

    /// Instrumentation scope name this tracer was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    /// Start a span parented from the current context.
    pub fn start<T>(&self, name: T) -> Span
    where
        T: Into<Cow<'static, str>>,
    {
        Context::map_current(|cx| self.start_with_context(name, cx))
    }

    /// Start a span parented from an explicit context.
    pub fn start_with_context<T>(&self, name: T, cx: &Context) -> Span
    where
        T: Into<Cow<'static, str>>,
    {
        self.build_with_context(SpanBuilder::from_name(name), cx)
    }

    /// Create a builder for configuring a span before it starts.
    pub fn span_builder<T>(&self, name: T) -> SpanBuilder
    where
        T: Into<Cow<'static, str>>,
    {
        SpanBuilder::from_name(name)
    }

    /// Build a configured span parented from the current context.
    pub fn build(&self, builder: SpanBuilder) -> Span {
        Context::map_current(|cx| self.build_with_context(builder, cx))
    }

    /// Build a configured span parented from an explicit context.
    ///
    /// After the provider has shut down this returns a non-recording span,
    /// so instrumentation sites keep working without producing telemetry.
    pub fn build_with_context(&self, builder: SpanBuilder, cx: &Context) -> Span {
        if self.provider.is_shutdown() {
            return Span::new(SpanContext::empty_context(), None, self.clone());
        }

        let parent = cx
            .has_active_span()
            .then(|| cx.span().span_context().clone())
            .filter(|sc| sc.is_valid());

        let id_generator = self.provider.id_generator();
        let (trace_id, parent_span_id) = match &parent {
            Some(parent) => (parent.trace_id(), parent.span_id()),
            None => (
                builder
                    .trace_id
                    .unwrap_or_else(|| id_generator.new_trace_id()),
                SpanId::INVALID,
            ),
        };
        let span_id = builder
            .span_id
            .unwrap_or_else(|| id_generator.new_span_id());

        let start_time = builder.start_time.unwrap_or_else(SystemTime::now);
        let mut span = Span::new(
            SpanContext::new(trace_id, span_id),
            Some(SpanData {
                parent_span_id,
                span_kind: builder.span_kind.unwrap_or(SpanKind::Internal),
                name: builder.name,
                start_time,
                end_time: start_time,
                attributes: builder.attributes.unwrap_or_default(),
                events: builder.events.unwrap_or_default(),
                status: builder.status,
            }),
            self.clone(),
        );

        for processor in self.provider.span_processors() {
            processor.on_start(&mut span, cx);
        }

        span
    }

    /// Start a span, run `f` with it active, and end it afterwards.
    ///
    /// The span ends when the context handed to `f` is dropped, error or not,
    /// so early returns and panics still report the span.
    pub fn in_span<T, F, N>(&self, name: N, f: F) -> T
    where
        F: FnOnce(Context) -> T,
        N: Into<Cow<'static, str>>,
    {
        let span = self.start(name);
        let cx = Context::current_with_span(span);
        let _guard = cx.clone().attach();
        f(cx)
    }
}

/// Entry for configuring a new span.
#[derive(Clone, Debug, Default)]
pub struct SpanBuilder {
    /// Trace id to use for a root span, overriding generation.
    pub trace_id: Option<TraceId>,
    /// Span id, overriding generation.
    pub span_id: Option<SpanId>,
    /// Span kind, `Internal` when unset.
    pub span_kind: Option<SpanKind>,
    /// Span name.
    pub name: Cow<'static, str>,
    /// Start time, `SystemTime::now` at build when unset.
    pub start_time: Option<SystemTime>,
    /// Initial attributes.
    pub attributes: Option<Vec<KeyValue>>,
    /// Initial events.
    pub events: Option<Vec<Event>>,
    /// Initial status.
    pub status: Status,
}

impl SpanBuilder {
    /// Create a builder with a span name.
    pub fn from_name<T: Into<Cow<'static, str>>>(name: T) -> Self {
        SpanBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Assign the span kind.
    pub fn with_kind(self, span_kind: SpanKind) -> Self {
        SpanBuilder {
            span_kind: Some(span_kind),
            ..self
        }
    }

    /// Assign the start time.
    pub fn with_start_time<T: Into<SystemTime>>(self, start_time: T) -> Self {
        SpanBuilder {
            start_time: Some(start_time.into()),
            ..self
        }
    }

    /// Assign initial attributes.
    pub fn with_attributes<I>(self, attributes: I) -> Self
    where
        I: IntoIterator<Item = KeyValue>,
    {
        SpanBuilder {
            attributes: Some(attributes.into_iter().collect()),
            ..self
        }
    }

    /// Assign initial events.
    pub fn with_events(self, events: Vec<Event>) -> Self {
        SpanBuilder {
            events: Some(events),
            ..self
        }
    }

    /// Assign the initial status.
    pub fn with_status(self, status: Status) -> Self {
        SpanBuilder { status, ..self }
    }

    /// Start the span parented from the current context.
    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.build(self)
    }

    /// Start the span parented from an explicit context.
    pub fn start_with_context(self, tracer: &Tracer, cx: &Context) -> Span {
        tracer.build_with_context(self, cx)
    }
}
