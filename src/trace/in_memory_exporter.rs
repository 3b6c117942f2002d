//! An exporter that buffers finished spans in memory, for tests and
//! debugging.

use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;

use crate::error::TraceResult;
use crate::trace::export::{ExportResult, SpanData, SpanExporter};
use crate::trace::provider::Resource;

/// Collects finished spans into a shared vector.
///
/// Clones share the same buffer, so a test can keep one handle and hand
/// another to the provider.
///
/// ```
/// use tracelet::trace::{InMemorySpanExporter, TracerProvider};
///
/// let exporter = InMemorySpanExporter::default();
/// let provider = TracerProvider::builder()
///     .with_simple_exporter(exporter.clone())
///     .build();
///
/// provider.tracer("test").start("operation").end();
/// assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
    resource: Arc<Mutex<Option<Resource>>>,
}

impl InMemorySpanExporter {
    /// A copy of all finished spans received so far.
    ///
    /// Spans survive exporter shutdown so tests can assert on the final
    /// flush.
    pub fn get_finished_spans(&self) -> TraceResult<Vec<SpanData>> {
        Ok(self.spans.lock()?.clone())
    }

    /// The resource received from the pipeline, if any.
    pub fn resource(&self) -> TraceResult<Option<Resource>> {
        Ok(self.resource.lock()?.clone())
    }

    /// Discard all buffered spans.
    pub fn reset(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl SpanExporter for InMemorySpanExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let result = self
            .spans
            .lock()
            .map(|mut spans| spans.extend(batch))
            .map_err(crate::error::TraceError::from);
        Box::pin(std::future::ready(result))
    }

    fn set_resource(&mut self, resource: &Resource) {
        if let Ok(mut stored) = self.resource.lock() {
            *stored = Some(resource.clone());
        }
    }
}
