//! Span processors sit between span end and the exporter.
//!
//! [`SimpleSpanProcessor`] exports every span inline as it ends, which is
//! predictable but puts exporter latency on the caller's thread. Production
//! setups use [`BatchSpanProcessor`]: span end becomes a bounded, non-blocking
//! queue push, and a dedicated worker thread drains the queue into the
//! exporter on a schedule. When the queue is full spans are dropped rather
//! than slowing the application down.

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::{TraceError, TraceResult};
use crate::trace::export::{SpanData, SpanExporter};
use crate::trace::provider::Resource;
use crate::trace::span::Span;

/// Delay interval between two consecutive batch exports.
const ENV_BSP_SCHEDULE_DELAY: &str = "TRACELET_BSP_SCHEDULE_DELAY";
/// Default delay interval between two consecutive exports.
const DEFAULT_SCHEDULE_DELAY_MILLIS: u64 = 5_000;
/// Maximum queue size.
const ENV_BSP_MAX_QUEUE_SIZE: &str = "TRACELET_BSP_MAX_QUEUE_SIZE";
/// Default maximum queue size.
const DEFAULT_MAX_QUEUE_SIZE: usize = 2_048;
/// Maximum batch size, must be less than or equal to the maximum queue size.
const ENV_BSP_MAX_EXPORT_BATCH_SIZE: &str = "TRACELET_BSP_MAX_EXPORT_BATCH_SIZE";
/// Default maximum batch size.
const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;
/// Maximum time a flush is allowed to take.
const ENV_BSP_EXPORT_TIMEOUT: &str = "TRACELET_BSP_EXPORT_TIMEOUT";
/// Default flush timeout.
const DEFAULT_EXPORT_TIMEOUT_MILLIS: u64 = 5_000;

/// Default timeout for flush and shutdown to complete.
pub(crate) const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interface for receiving span lifecycle notifications from the provider.
pub trait SpanProcessor: Send + Sync + fmt::Debug {
    /// Called when a span starts, with the parent context.
    fn on_start(&self, span: &mut Span, cx: &Context);
    /// Called when a span ends, with the finished record.
    fn on_end(&self, span: SpanData);
    /// Push all spans received so far to the exporter.
    fn force_flush(&self) -> TraceResult<()>;
    /// Flush and release resources within `timeout`.
    fn shutdown(&self, timeout: Duration) -> TraceResult<()>;
    /// Receive the resource describing the emitting process.
    fn set_resource(&mut self, _resource: &Resource) {}
}

/// A [`SpanProcessor`] that exports each span synchronously when it ends.
///
/// Export failures are logged and swallowed; span end never reports errors
/// back to instrumentation sites.
pub struct SimpleSpanProcessor {
    exporter: Mutex<Box<dyn SpanExporter>>,
}

impl SimpleSpanProcessor {
    /// Create a new simple processor for `exporter`.
    pub fn new(exporter: impl SpanExporter + 'static) -> Self {
        SimpleSpanProcessor {
            exporter: Mutex::new(Box::new(exporter)),
        }
    }
}

impl fmt::Debug for SimpleSpanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleSpanProcessor").finish()
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {
        // not required
    }

    fn on_end(&self, span: SpanData) {
        let result = self
            .exporter
            .lock()
            .map_err(TraceError::from)
            .and_then(|mut exporter| futures_executor::block_on(exporter.export(vec![span])));

        if let Err(err) = result {
            tracing::warn!(
                name: "simple_processor.export_failed",
                error = %err,
            );
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        // spans are exported inline, nothing is buffered
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> TraceResult<()> {
        self.exporter.lock()?.shutdown();
        Ok(())
    }

    fn set_resource(&mut self, resource: &Resource) {
        if let Ok(mut exporter) = self.exporter.lock() {
            exporter.set_resource(resource);
        }
    }
}

/// Messages sent to the batch worker thread.
#[derive(Debug)]
enum BatchMessage {
    ExportSpan(SpanData),
    Flush(SyncSender<TraceResult<()>>),
    Shutdown(SyncSender<TraceResult<()>>),
    SetResource(Arc<Resource>),
}

/// A [`SpanProcessor`] that queues finished spans and exports them in
/// batches from a dedicated worker thread.
///
/// Spans are pushed onto a bounded channel; if the channel is full the span
/// is dropped and counted, never blocking the ending thread. The worker
/// exports whenever a batch fills up or the schedule delay elapses,
/// whichever comes first.
pub struct BatchSpanProcessor {
    message_sender: SyncSender<BatchMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    forceflush_timeout: Duration,
    is_shutdown: AtomicBool,
    dropped_spans_count: AtomicUsize,
}

impl BatchSpanProcessor {
    /// Create a batch processor with the given configuration.
    ///
    /// Spawns the worker thread immediately.
    pub fn new(exporter: impl SpanExporter + 'static, config: BatchConfig) -> Self {
        let (message_sender, message_receiver) = mpsc::sync_channel(config.max_queue_size);
        let forceflush_timeout = config.export_timeout;

        let handle = thread::Builder::new()
            .name("tracelet.BatchSpanProcessor".to_string())
            .spawn(move || {
                BatchWorker {
                    exporter: Box::new(exporter),
                    receiver: message_receiver,
                    config,
                    batch: Vec::new(),
                }
                .run()
            })
            .expect("failed to spawn batch span processor thread");

        BatchSpanProcessor {
            message_sender,
            handle: Mutex::new(Some(handle)),
            forceflush_timeout,
            is_shutdown: AtomicBool::new(false),
            dropped_spans_count: AtomicUsize::new(0),
        }
    }

    /// Create a builder to configure a batch processor.
    pub fn builder<E>(exporter: E) -> BatchSpanProcessorBuilder<E>
    where
        E: SpanExporter + 'static,
    {
        BatchSpanProcessorBuilder {
            exporter,
            config: BatchConfig::default(),
        }
    }
}

impl fmt::Debug for BatchSpanProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchSpanProcessor")
            .field("is_shutdown", &self.is_shutdown.load(Ordering::Relaxed))
            .field(
                "dropped_spans_count",
                &self.dropped_spans_count.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_start(&self, _span: &mut Span, _cx: &Context) {
        // not required
    }

    fn on_end(&self, span: SpanData) {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return;
        }
        if self
            .message_sender
            .try_send(BatchMessage::ExportSpan(span))
            .is_err()
        {
            // log at most once, report the total at shutdown
            let previously_dropped = self.dropped_spans_count.fetch_add(1, Ordering::Relaxed);
            if previously_dropped == 0 {
                tracing::warn!(
                    name: "batch_processor.queue_full",
                    message = "span dropped because the export queue is full; subsequent drops are counted silently",
                );
            }
        }
    }

    fn force_flush(&self) -> TraceResult<()> {
        if self.is_shutdown.load(Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }
        let (sender, receiver) = mpsc::sync_channel(1);
        self.message_sender
            .try_send(BatchMessage::Flush(sender))
            .map_err(|err| TraceError::Other(err.to_string()))?;

        receiver
            .recv_timeout(self.forceflush_timeout)
            .map_err(|_| TraceError::Timeout(self.forceflush_timeout))?
    }

    fn shutdown(&self, timeout: Duration) -> TraceResult<()> {
        if self.is_shutdown.swap(true, Ordering::Relaxed) {
            return Err(TraceError::AlreadyShutdown);
        }

        let dropped = self.dropped_spans_count.load(Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(
                name: "batch_processor.spans_dropped",
                count = dropped,
            );
        }

        // the queue may be full here; block until the worker makes room so
        // the backlog is flushed instead of the shutdown failing
        let (sender, receiver) = mpsc::sync_channel(1);
        self.message_sender
            .send(BatchMessage::Shutdown(sender))
            .map_err(|err| TraceError::Other(err.to_string()))?;

        let result = receiver
            .recv_timeout(timeout)
            .map_err(|_| TraceError::Timeout(timeout))?;

        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    return Err(TraceError::Shutdown(
                        "batch span processor thread panicked".to_string(),
                    ));
                }
            }
        }

        result
    }

    fn set_resource(&mut self, resource: &Resource) {
        let _ = self
            .message_sender
            .try_send(BatchMessage::SetResource(Arc::new(resource.clone())));
    }
}

/// The state owned by the batch worker thread.
struct BatchWorker {
    exporter: Box<dyn SpanExporter>,
    receiver: Receiver<BatchMessage>,
    config: BatchConfig,
    batch: Vec<SpanData>,
}

impl BatchWorker {
    fn run(mut self) {
        let mut last_export = Instant::now();
        loop {
            let remaining = self
                .config
                .scheduled_delay
                .saturating_sub(last_export.elapsed());
            match self.receiver.recv_timeout(remaining) {
                Ok(BatchMessage::ExportSpan(span)) => {
                    self.batch.push(span);
                    if self.batch.len() >= self.config.max_export_batch_size {
                        let _ = self.export_batch();
                        last_export = Instant::now();
                    }
                }
                Ok(BatchMessage::Flush(sender)) => {
                    let result = self.export_batch();
                    last_export = Instant::now();
                    let _ = sender.try_send(result);
                }
                Ok(BatchMessage::Shutdown(sender)) => {
                    let result = self.export_batch();
                    self.exporter.shutdown();
                    let _ = sender.try_send(result);
                    return;
                }
                Ok(BatchMessage::SetResource(resource)) => {
                    self.exporter.set_resource(&resource);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let _ = self.export_batch();
                    last_export = Instant::now();
                }
                // all senders gone, flush what is left and stop
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = self.export_batch();
                    self.exporter.shutdown();
                    return;
                }
            }
        }
    }

    /// Drain the accumulated batch into the exporter.
    ///
    /// Returns the first export error, but always attempts every chunk so a
    /// transient failure does not wedge the queue.
    fn export_batch(&mut self) -> TraceResult<()> {
        let mut result = Ok(());
        while !self.batch.is_empty() {
            let chunk_len = self.batch.len().min(self.config.max_export_batch_size);
            let chunk = self.batch.drain(..chunk_len).collect::<Vec<_>>();
            let count = chunk.len();
            if let Err(err) = futures_executor::block_on(self.exporter.export(chunk)) {
                tracing::warn!(
                    name: "batch_processor.export_failed",
                    count,
                    error = %err,
                );
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

/// Batch span processor configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of spans queued between exports; excess spans are
    /// dropped.
    max_queue_size: usize,
    /// Delay between two consecutive exports.
    scheduled_delay: Duration,
    /// Maximum number of spans handed to the exporter in one call.
    max_export_batch_size: usize,
    /// Maximum time a flush may take before it is reported as timed out.
    export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfigBuilder::default().build()
    }
}

/// Builder for [`BatchConfig`], seeded from `TRACELET_BSP_*` environment
/// variables.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    max_queue_size: usize,
    scheduled_delay: Duration,
    max_export_batch_size: usize,
    export_timeout: Duration,
}

impl Default for BatchConfigBuilder {
    /// Defaults of 2048 queued spans, a 5s schedule delay, 512 spans per
    /// batch, and a 5s flush timeout, each overridable by
    /// `TRACELET_BSP_MAX_QUEUE_SIZE`, `TRACELET_BSP_SCHEDULE_DELAY`
    /// (milliseconds), `TRACELET_BSP_MAX_EXPORT_BATCH_SIZE`, and
    /// `TRACELET_BSP_EXPORT_TIMEOUT` (milliseconds).
    fn default() -> Self {
        BatchConfigBuilder {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            scheduled_delay: Duration::from_millis(DEFAULT_SCHEDULE_DELAY_MILLIS),
            max_export_batch_size: DEFAULT_MAX_EXPORT_BATCH_SIZE,
            export_timeout: Duration::from_millis(DEFAULT_EXPORT_TIMEOUT_MILLIS),
        }
        .init_from_env_vars()
    }
}

impl BatchConfigBuilder {
    /// Set the maximum number of queued spans.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Set the delay between two consecutive exports.
    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.scheduled_delay = scheduled_delay;
        self
    }

    /// Set the maximum number of spans per export call.
    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.max_export_batch_size = max_export_batch_size;
        self
    }

    /// Set the maximum time a flush may take.
    pub fn with_export_timeout(mut self, export_timeout: Duration) -> Self {
        self.export_timeout = export_timeout;
        self
    }

    /// Build a config, clamping the batch size to the queue size.
    pub fn build(self) -> BatchConfig {
        BatchConfig {
            max_queue_size: self.max_queue_size,
            scheduled_delay: self.scheduled_delay,
            max_export_batch_size: self.max_export_batch_size.min(self.max_queue_size),
            export_timeout: self.export_timeout,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(max_queue_size) = env::var(ENV_BSP_MAX_QUEUE_SIZE)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.max_queue_size = max_queue_size;
        }
        if let Some(scheduled_delay) = env::var(ENV_BSP_SCHEDULE_DELAY)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.scheduled_delay = Duration::from_millis(scheduled_delay);
        }
        if let Some(max_export_batch_size) = env::var(ENV_BSP_MAX_EXPORT_BATCH_SIZE)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.max_export_batch_size = max_export_batch_size;
        }
        if let Some(export_timeout) = env::var(ENV_BSP_EXPORT_TIMEOUT)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.export_timeout = Duration::from_millis(export_timeout);
        }
        self
    }
}

/// Builder for a [`BatchSpanProcessor`].
#[derive(Debug)]
pub struct BatchSpanProcessorBuilder<E> {
    exporter: E,
    config: BatchConfig,
}

impl<E> BatchSpanProcessorBuilder<E>
where
    E: SpanExporter + 'static,
{
    /// Replace the batch configuration.
    pub fn with_batch_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the processor, spawning its worker thread.
    pub fn build(self) -> BatchSpanProcessor {
        BatchSpanProcessor::new(self.exporter, self.config)
    }
}
