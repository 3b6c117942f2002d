//! Provider of tracers, owner of the export pipeline.
//!
//! The provider is the root object of the pipeline: it holds the span
//! processors, the id generator and the resource, and hands out [`Tracer`]
//! handles that share them. All clones of a provider point at the same
//! pipeline. Shutting down any clone stops the pipeline for all of them,
//! exactly once; dropping the last clone shuts it down implicitly.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Key, KeyValue, Value};
use crate::error::{TraceError, TraceResult};
use crate::trace::export::SpanExporter;
use crate::trace::id_generator::{IdGenerator, RandomIdGenerator};
use crate::trace::span_processor::{
    BatchConfig, BatchSpanProcessor, SimpleSpanProcessor, SpanProcessor, DEFAULT_PIPELINE_TIMEOUT,
};
use crate::trace::tracer::Tracer;

/// Immutable description of the entity producing telemetry.
///
/// Typically carries `service.name` and `service.version`. Delivered to each
/// exporter once at pipeline construction rather than repeated on every
/// span.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Resource {
    attributes: Vec<KeyValue>,
}

impl Resource {
    /// Create a resource from attributes.
    pub fn new<T: IntoIterator<Item = KeyValue>>(kvs: T) -> Self {
        Resource {
            attributes: kvs.into_iter().collect(),
        }
    }

    /// All attributes of this resource.
    pub fn attributes(&self) -> &[KeyValue] {
        &self.attributes
    }

    /// Look up a value by key, last write wins for duplicates.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.attributes
            .iter()
            .rev()
            .find(|kv| &kv.key == key)
            .map(|kv| &kv.value)
    }

    /// Returns `true` if this resource has no attributes.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

pub(crate) struct TracerProviderInner {
    processors: Vec<Box<dyn SpanProcessor>>,
    id_generator: Box<dyn IdGenerator>,
    resource: Resource,
    is_shutdown: AtomicBool,
}

impl TracerProviderInner {
    /// Shut down all processors, collecting failures instead of stopping at
    /// the first one.
    fn shutdown_processors(&self, timeout: Duration) -> Vec<TraceError> {
        self.processors
            .iter()
            .filter_map(|processor| processor.shutdown(timeout).err())
            .collect()
    }
}

impl Drop for TracerProviderInner {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Relaxed) {
            for err in self.shutdown_processors(DEFAULT_PIPELINE_TIMEOUT) {
                tracing::debug!(
                    name: "tracer_provider.drop_shutdown_failed",
                    error = %err,
                );
            }
        }
    }
}

impl fmt::Debug for TracerProviderInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerProviderInner")
            .field("processors", &self.processors)
            .field("resource", &self.resource)
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

/// Creates and manages tracers and the pipeline behind them.
///
/// Cheap to clone; clones share the underlying pipeline.
#[derive(Clone, Debug)]
pub struct TracerProvider {
    inner: Arc<TracerProviderInner>,
}

impl TracerProvider {
    /// Create a builder for configuring a provider.
    pub fn builder() -> TracerProviderBuilder {
        TracerProviderBuilder::default()
    }

    /// Create a tracer scoped to an instrumentation name.
    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> Tracer {
        Tracer::new(name.into(), self.clone())
    }

    /// The resource describing this process.
    pub fn resource(&self) -> &Resource {
        &self.inner.resource
    }

    pub(crate) fn span_processors(&self) -> &[Box<dyn SpanProcessor>] {
        &self.inner.processors
    }

    pub(crate) fn id_generator(&self) -> &dyn IdGenerator {
        self.inner.id_generator.as_ref()
    }

    /// Returns `true` once the pipeline has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::Relaxed)
    }

    /// Push all buffered spans through to the exporters.
    pub fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown() {
            return Err(TraceError::AlreadyShutdown);
        }
        let errs = self
            .inner
            .processors
            .iter()
            .filter_map(|processor| processor.force_flush().err())
            .collect::<Vec<_>>();
        fold_errors(errs, TraceError::Other)
    }

    /// Flush remaining spans and stop the pipeline, with a default timeout.
    ///
    /// Only the first call performs the shutdown; later calls (from this or
    /// any clone) return [`TraceError::AlreadyShutdown`].
    pub fn shutdown(&self) -> TraceResult<()> {
        self.shutdown_with_timeout(DEFAULT_PIPELINE_TIMEOUT)
    }

    /// Flush remaining spans and stop the pipeline within `timeout`.
    pub fn shutdown_with_timeout(&self, timeout: Duration) -> TraceResult<()> {
        if self
            .inner
            .is_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TraceError::AlreadyShutdown);
        }
        fold_errors(self.inner.shutdown_processors(timeout), TraceError::Shutdown)
    }
}

fn fold_errors(errs: Vec<TraceError>, wrap: fn(String) -> TraceError) -> TraceResult<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let joined = errs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(wrap(joined))
    }
}

/// Builder for a [`TracerProvider`].
#[derive(Debug, Default)]
pub struct TracerProviderBuilder {
    processors: Vec<Box<dyn SpanProcessor>>,
    id_generator: Option<Box<dyn IdGenerator>>,
    resource: Option<Resource>,
}

impl TracerProviderBuilder {
    /// Attach `exporter` behind a [`SimpleSpanProcessor`], exporting each
    /// span inline as it ends.
    pub fn with_simple_exporter<E: SpanExporter + 'static>(self, exporter: E) -> Self {
        self.with_span_processor(SimpleSpanProcessor::new(exporter))
    }

    /// Attach `exporter` behind a [`BatchSpanProcessor`] with default batch
    /// configuration.
    pub fn with_batch_exporter<E: SpanExporter + 'static>(self, exporter: E) -> Self {
        self.with_span_processor(BatchSpanProcessor::new(exporter, BatchConfig::default()))
    }

    /// Attach a pre-built span processor.
    pub fn with_span_processor<P: SpanProcessor + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Replace the default random id generator.
    pub fn with_id_generator<G: IdGenerator + 'static>(mut self, id_generator: G) -> Self {
        self.id_generator = Some(Box::new(id_generator));
        self
    }

    /// Set the resource describing this process.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Build the provider, delivering the resource to every processor.
    pub fn build(self) -> TracerProvider {
        let resource = self.resource.unwrap_or_default();
        let mut processors = self.processors;
        for processor in &mut processors {
            processor.set_resource(&resource);
        }

        TracerProvider {
            inner: Arc::new(TracerProviderInner {
                processors,
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Box::new(RandomIdGenerator::default())),
                resource,
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::trace::export::SpanData;
    use crate::trace::in_memory_exporter::InMemorySpanExporter;
    use crate::trace::span::Span;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct CountingProcessor {
        shutdown_calls: Arc<AtomicUsize>,
    }

    impl SpanProcessor for CountingProcessor {
        fn on_start(&self, _span: &mut Span, _cx: &Context) {}
        fn on_end(&self, _span: SpanData) {}
        fn force_flush(&self) -> TraceResult<()> {
            Ok(())
        }
        fn shutdown(&self, _timeout: Duration) -> TraceResult<()> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn second_shutdown_errors_and_skips_processors() {
        let shutdown_calls = Arc::new(AtomicUsize::new(0));
        let provider = TracerProvider::builder()
            .with_span_processor(CountingProcessor {
                shutdown_calls: shutdown_calls.clone(),
            })
            .build();

        provider.shutdown().unwrap();
        assert!(matches!(
            provider.shutdown(),
            Err(TraceError::AlreadyShutdown)
        ));
        assert_eq!(shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clone_shares_shutdown_state() {
        let provider = TracerProvider::builder().build();
        let clone = provider.clone();

        provider.shutdown().unwrap();
        assert!(clone.is_shutdown());
        assert!(matches!(clone.shutdown(), Err(TraceError::AlreadyShutdown)));
    }

    #[test]
    fn drop_shuts_down_pipeline() {
        let shutdown_calls = Arc::new(AtomicUsize::new(0));
        {
            let _provider = TracerProvider::builder()
                .with_span_processor(CountingProcessor {
                    shutdown_calls: shutdown_calls.clone(),
                })
                .build();
        }
        assert_eq!(shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_after_shutdown_does_not_shut_down_twice() {
        let shutdown_calls = Arc::new(AtomicUsize::new(0));
        {
            let provider = TracerProvider::builder()
                .with_span_processor(CountingProcessor {
                    shutdown_calls: shutdown_calls.clone(),
                })
                .build();
            provider.shutdown().unwrap();
        }
        assert_eq!(shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_flushes_batched_spans() {
        let exporter = InMemorySpanExporter::default();
        {
            let provider = TracerProvider::builder()
                .with_batch_exporter(exporter.clone())
                .build();
            provider.tracer("test").start("implicit-flush").end();
        }
        assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
    }

    #[test]
    fn resource_delivered_to_exporter() {
        let exporter = InMemorySpanExporter::default();
        let resource = Resource::new([
            KeyValue::new("service.name", "checkout"),
            KeyValue::new("service.version", "1.4.2"),
        ]);
        let _provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .with_resource(resource.clone())
            .build();

        assert_eq!(exporter.resource().unwrap(), Some(resource));
    }

    #[test]
    fn resource_lookup_last_write_wins() {
        let resource = Resource::new([
            KeyValue::new("service.name", "first"),
            KeyValue::new("service.name", "second"),
        ]);
        assert_eq!(
            resource.get(&Key::from_static_str("service.name")),
            Some(&Value::from("second"))
        );
        assert_eq!(resource.get(&Key::from_static_str("missing")), None);
    }

    #[test]
    fn force_flush_after_shutdown_errors() {
        let provider = TracerProvider::builder().build();
        provider.shutdown().unwrap();
        assert!(matches!(
            provider.force_flush(),
            Err(TraceError::AlreadyShutdown)
        ));
    }
}
