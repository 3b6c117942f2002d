//! End-to-end tests of the tracing pipeline.

use std::io::BufRead;
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracelet::middleware::{trace_request, RequestInfo};
use tracelet::trace::{
    BatchConfigBuilder, BatchSpanProcessor, InMemorySpanExporter, SpanId, Status, TracerProvider,
};
use tracelet::{Config, Context, KeyValue, TraceError};

fn batch_provider(exporter: InMemorySpanExporter) -> TracerProvider {
    // long delay so only flush/shutdown drive exports
    TracerProvider::builder()
        .with_span_processor(
            BatchSpanProcessor::builder(exporter)
                .with_batch_config(
                    BatchConfigBuilder::default()
                        .with_scheduled_delay(Duration::from_secs(60))
                        .build(),
                )
                .build(),
        )
        .build()
}

#[test]
fn parent_and_child_exported_with_linked_identity() {
    let exporter = InMemorySpanExporter::default();
    let provider = batch_provider(exporter.clone());
    let tracer = provider.tracer("request-handler");

    tracer.in_span("request", |_cx| {
        tracer.in_span("db-query", |_cx| {});
    });

    provider.shutdown().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    let child = spans.iter().find(|s| s.name == "db-query").unwrap();
    let parent = spans.iter().find(|s| s.name == "request").unwrap();

    assert_eq!(
        child.span_context.trace_id(),
        parent.span_context.trace_id()
    );
    assert_eq!(child.parent_span_id, parent.span_context.span_id());
    assert_eq!(parent.parent_span_id, SpanId::INVALID);
    assert!(parent.end_time >= child.end_time);
}

#[test]
fn init_fails_fast_when_collector_unreachable() {
    // take a port, then free it so the connect is refused
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);

    match tracelet::init(Config::new("doomed-service", endpoint)) {
        Err(TraceError::Initialization(_)) => {}
        other => panic!("expected initialization failure, got {other:?}"),
    }
}

#[test]
fn shutdown_flushes_queued_spans() {
    let exporter = InMemorySpanExporter::default();
    let provider = batch_provider(exporter.clone());

    provider.tracer("test").start("queued").end();
    assert!(
        exporter.get_finished_spans().unwrap().is_empty(),
        "span should still be queued before shutdown"
    );

    provider.shutdown().unwrap();
    assert_eq!(exporter.get_finished_spans().unwrap().len(), 1);
}

#[test]
fn concurrent_requests_do_not_share_traces() {
    let exporter = InMemorySpanExporter::default();
    let provider = batch_provider(exporter.clone());

    let (ready_sender, ready_receiver) = mpsc::channel();
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let tracer = provider.tracer("worker");
            let ready = ready_sender.clone();
            thread::spawn(move || {
                tracer.in_span("request", |cx| {
                    let own_id = cx.span().span_context().span_id();
                    // hold the span open until both requests are in flight
                    let (release_sender, release_receiver) = mpsc::channel::<()>();
                    ready.send(release_sender).unwrap();
                    release_receiver.recv().unwrap();
                    // each thread still sees its own span as active
                    assert_eq!(
                        Context::current().span().span_context().span_id(),
                        own_id
                    );
                    cx.span().span_context().trace_id()
                })
            })
        })
        .collect();

    // wait for both spans to be open, then release both threads
    let first = ready_receiver.recv().unwrap();
    let second = ready_receiver.recv().unwrap();
    first.send(()).unwrap();
    second.send(()).unwrap();

    let trace_ids: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    assert_ne!(trace_ids[0], trace_ids[1]);

    provider.shutdown().unwrap();
    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 2);
    assert!(spans.iter().all(|s| s.parent_span_id == SpanId::INVALID));
}

#[test]
fn traced_request_reaches_collector_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let reader = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        std::io::BufReader::new(stream)
            .lines()
            .map(|line| {
                serde_json::from_str::<serde_json::Value>(&line.unwrap()).unwrap()
            })
            .collect::<Vec<_>>()
    });

    let provider = tracelet::init(
        Config::new("hello-server", endpoint).with_service_version("0.1.0"),
    )
    .unwrap();
    let tracer = provider.tracer("hello-server");

    let response: Result<&str, std::io::Error> =
        trace_request(&tracer, RequestInfo::new("GET", "/hello"), |_cx| {
            tracer.in_span("render greeting", |cx| {
                cx.span().set_attribute(KeyValue::new("greeting.lang", "en"));
            });
            Ok("Hello, World!")
        });
    assert_eq!(response.unwrap(), "Hello, World!");

    provider.shutdown().unwrap();

    let records = reader.join().unwrap();
    assert_eq!(records.len(), 2);
    let root = records
        .iter()
        .find(|r| r["name"] == "GET /hello")
        .unwrap();
    let child = records
        .iter()
        .find(|r| r["name"] == "render greeting")
        .unwrap();

    assert_eq!(root["kind"], "server");
    assert_eq!(root["status"]["code"], "ok");
    assert!(root.get("parent_span_id").is_none());
    assert_eq!(child["trace_id"], root["trace_id"]);
    assert_eq!(child["parent_span_id"], root["span_id"]);
    assert_eq!(
        root["resource"]
            .as_array()
            .unwrap()
            .iter()
            .find(|kv| kv["key"] == "service.name")
            .unwrap()["value"],
        "hello-server"
    );
}

#[test]
fn failed_request_reports_error_status() {
    let exporter = InMemorySpanExporter::default();
    let provider = batch_provider(exporter.clone());
    let tracer = provider.tracer("request-handler");

    let response: Result<(), std::io::Error> =
        trace_request(&tracer, RequestInfo::new("GET", "/error"), |_cx| {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "deliberate failure",
            ))
        });
    assert!(response.is_err());

    provider.shutdown().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(
        spans[0].status,
        Status::error("deliberate failure".to_string())
    );
    assert_eq!(spans[0].events[0].name, "exception");
}

#[test]
fn spans_started_after_shutdown_are_never_exported() {
    let exporter = InMemorySpanExporter::default();
    let provider = batch_provider(exporter.clone());
    provider.shutdown().unwrap();

    provider.tracer("test").start("too-late").end();
    assert!(exporter.get_finished_spans().unwrap().is_empty());
}
