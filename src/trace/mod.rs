//! The tracing API and pipeline.
//!
//! The pieces fit together like this: a [`TracerProvider`] owns the pipeline
//! (processors, exporter, id generator, resource) and hands out [`Tracer`]s;
//! a tracer starts [`Span`]s, resolving parentage from a
//! [`Context`](crate::Context); ended spans flow through the provider's
//! [`SpanProcessor`]s into a [`SpanExporter`](export::SpanExporter).
//!
//! ```no_run
//! use tracelet::trace::{CollectorExporter, Resource, TracerProvider};
//! use tracelet::KeyValue;
//!
//! # fn main() -> tracelet::TraceResult<()> {
//! let exporter = CollectorExporter::connect("127.0.0.1:4321")?;
//! let provider = TracerProvider::builder()
//!     .with_batch_exporter(exporter)
//!     .with_resource(Resource::new([KeyValue::new("service.name", "demo")]))
//!     .build();
//!
//! let tracer = provider.tracer("demo");
//! tracer.in_span("operation", |_cx| {
//!     // traced work
//! });
//!
//! provider.shutdown()?;
//! # Ok(())
//! # }
//! ```

mod collector;
pub mod export;
mod id_generator;
mod in_memory_exporter;
mod provider;
mod span;
mod span_context;
mod span_processor;
mod tracer;

pub use collector::CollectorExporter;
pub use id_generator::{IdGenerator, RandomIdGenerator, SequentialIdGenerator};
pub use in_memory_exporter::InMemorySpanExporter;
pub use provider::{Resource, TracerProvider, TracerProviderBuilder};
pub use span::{Event, Span, SpanKind, Status};
pub use span_context::{SpanContext, SpanId, TraceId};
pub use span_processor::{
    BatchConfig, BatchConfigBuilder, BatchSpanProcessor, BatchSpanProcessorBuilder,
    SimpleSpanProcessor, SpanProcessor,
};
pub use tracer::{SpanBuilder, Tracer};
