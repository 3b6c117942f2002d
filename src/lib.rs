//! Tracelet implements a minimal distributed-tracing core: named, timed
//! spans with attributes, events and status; execution-scoped context
//! propagation; and a bounded, fire-and-forget export pipeline that ships
//! finished spans to a collector without ever blocking the instrumented
//! code.
//!
//! # Getting started
//!
//! Initialize a provider once at startup, keep it alive for the life of the
//! process, and shut it down on exit so buffered spans are flushed:
//!
//! ```no_run
//! use tracelet::{Config, KeyValue};
//!
//! fn main() -> tracelet::TraceResult<()> {
//!     let provider = tracelet::init(Config::new("hello-server", "127.0.0.1:4321"))?;
//!
//!     let tracer = provider.tracer("hello-server");
//!     tracer.in_span("handle request", |cx| {
//!         cx.span().set_attribute(KeyValue::new("request.id", 7));
//!         // nested spans started here become children automatically
//!         tracer.in_span("query database", |_cx| {});
//!     });
//!
//!     provider.shutdown()
//! }
//! ```
//!
//! # Crate layout
//!
//! - [`trace`] holds the span model and the pipeline: [`trace::Tracer`],
//!   [`trace::Span`], [`trace::TracerProvider`], processors and exporters.
//! - [`Context`] carries the active span across call boundaries, with
//!   [`FutureExt`] for async code.
//! - [`middleware`] adapts request/response frameworks with one function.
//!
//! Telemetry failures never propagate into instrumented code: mutating an
//! ended span is a no-op, a full export queue drops spans, and export errors
//! are logged through [`tracing`]. The one deliberate exception is
//! [`init`], which fails fast when the collector is unreachable.

#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod common;
mod context;
mod error;
pub mod middleware;
pub mod trace;

pub use common::{Key, KeyValue, Value};
pub use context::{
    get_active_span, mark_span_as_active, Context, ContextGuard, FutureExt, SpanRef, WithContext,
};
pub use error::{TraceError, TraceResult};

use std::borrow::Cow;

use crate::trace::{
    BatchConfig, BatchSpanProcessor, CollectorExporter, Resource, TracerProvider,
};

/// Configuration for [`init`].
#[derive(Debug)]
pub struct Config {
    service_name: Cow<'static, str>,
    service_version: Option<Cow<'static, str>>,
    collector_endpoint: String,
    batch_config: BatchConfig,
}

impl Config {
    /// Configuration for a service reporting to a collector at
    /// `collector_endpoint` (`host:port`).
    pub fn new(
        service_name: impl Into<Cow<'static, str>>,
        collector_endpoint: impl Into<String>,
    ) -> Self {
        Config {
            service_name: service_name.into(),
            collector_endpoint: collector_endpoint.into(),
            service_version: None,
            batch_config: BatchConfig::default(),
        }
    }

    /// Report a `service.version` resource attribute.
    pub fn with_service_version(mut self, version: impl Into<Cow<'static, str>>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    /// Replace the default batch configuration.
    pub fn with_batch_config(mut self, batch_config: BatchConfig) -> Self {
        self.batch_config = batch_config;
        self
    }
}

/// Connect to the collector and build a batching provider for it.
///
/// Fails with [`TraceError::Initialization`] when the collector is
/// unreachable; tracing is assumed required, so callers should abort startup
/// on error. Keep the returned provider alive for the life of the process
/// and call [`TracerProvider::shutdown`] on exit.
pub fn init(config: Config) -> TraceResult<TracerProvider> {
    let exporter = CollectorExporter::connect(config.collector_endpoint)?;

    let mut attributes = vec![KeyValue::new("service.name", config.service_name)];
    if let Some(version) = config.service_version {
        attributes.push(KeyValue::new("service.version", version));
    }

    Ok(TracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::new(exporter, config.batch_config))
        .with_resource(Resource::new(attributes))
        .build())
}
