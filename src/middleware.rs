//! Request-boundary instrumentation.
//!
//! [`trace_request`] wraps a request handler in a server span: it opens the
//! span before the handler runs, installs it as the current context so the
//! handler's own spans parent under it, records the outcome, and ends the
//! span no matter how the handler exits. Panics are re-raised after the span
//! is reported, so a crashing handler still leaves a trace behind.

use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};

use crate::common::KeyValue;
use crate::context::Context;
use crate::trace::{SpanKind, Status, Tracer};

/// Framework-independent description of an inbound request.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    /// HTTP method, e.g. `GET`.
    pub method: Cow<'static, str>,
    /// Matched route pattern, e.g. `/users/:id`.
    pub route: Cow<'static, str>,
}

impl RequestInfo {
    /// Create a request description.
    pub fn new(
        method: impl Into<Cow<'static, str>>,
        route: impl Into<Cow<'static, str>>,
    ) -> Self {
        RequestInfo {
            method: method.into(),
            route: route.into(),
        }
    }

    fn span_name(&self) -> String {
        format!("{} {}", self.method, self.route)
    }
}

/// Run `handler` inside a server span named after the request.
///
/// The span carries `http.method` and `http.route`, receives status `Ok` on
/// success, and on error gets an `exception` event plus an `Error` status
/// before the handler's error is returned unchanged. The context handed to
/// the handler is also installed as current for the duration of the call.
pub fn trace_request<T, E, F>(tracer: &Tracer, request: RequestInfo, handler: F) -> Result<T, E>
where
    E: std::error::Error,
    F: FnOnce(Context) -> Result<T, E>,
{
    let span = tracer
        .span_builder(request.span_name())
        .with_kind(SpanKind::Server)
        .with_attributes([
            KeyValue::new("http.method", request.method.clone()),
            KeyValue::new("http.route", request.route.clone()),
        ])
        .start(tracer);

    let cx = Context::current_with_span(span);
    let guard = cx.clone().attach();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(cx.clone())));
    drop(guard);

    match outcome {
        Ok(Ok(value)) => {
            cx.span().set_status(Status::Ok);
            cx.span().end();
            Ok(value)
        }
        Ok(Err(err)) => {
            cx.span().record_error(&err);
            cx.span().end();
            Err(err)
        }
        Err(payload) => {
            // pass the payload itself, not the box, or downcasting misses
            cx.span().set_status(Status::error(panic_message(payload.as_ref())));
            cx.span().end();
            panic::resume_unwind(payload)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
