//! Execution-scoped context propagation.
//!
//! A [`Context`] is an immutable value that may carry the currently active
//! span. Each thread holds a current context in a thread local; attaching a
//! context swaps it in and returns a [`ContextGuard`] that restores the
//! previous one on drop, so nesting behaves like a stack even when guards are
//! held across arbitrary scopes on the same thread.
//!
//! Futures do not inherit the thread local across `.await` points; use
//! [`FutureExt::with_context`] to pin a context to a future so it is
//! re-attached on every poll.

use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::Poll;

use pin_project_lite::pin_project;

use crate::common::KeyValue;
use crate::trace::{Span, SpanContext, Status};

thread_local! {
    static CURRENT_CONTEXT: std::cell::RefCell<Context> =
        std::cell::RefCell::new(Context::default());
}

/// An immutable execution-scoped value, optionally carrying the active span.
///
/// Deriving a new context never mutates the parent; callers hold plain
/// values and decide themselves when to install one as current.
#[derive(Clone, Default)]
pub struct Context {
    span: Option<Arc<ActiveSpan>>,
}

impl Context {
    /// An empty context with no active span.
    pub fn new() -> Self {
        Context::default()
    }

    /// A clone of this thread's current context.
    pub fn current() -> Self {
        Context::map_current(|cx| cx.clone())
    }

    /// Apply a function to this thread's current context without cloning it.
    pub fn map_current<T>(f: impl FnOnce(&Context) -> T) -> T {
        CURRENT_CONTEXT.with(|cx| f(&cx.borrow()))
    }

    /// The current context with `span` set as its active span.
    pub fn current_with_span(span: Span) -> Self {
        Context::map_current(|cx| cx.with_span(span))
    }

    /// A copy of this context with `span` as its active span.
    ///
    /// The span handle is moved into the context; use [`Context::span`] to
    /// reach it afterwards.
    pub fn with_span(&self, span: Span) -> Self {
        Context {
            span: Some(Arc::new(ActiveSpan::new(span))),
        }
    }

    /// A reference to this context's active span.
    ///
    /// If no span is active a non-recording span reference is returned, so
    /// callers can mutate unconditionally.
    pub fn span(&self) -> SpanRef<'_> {
        match self.span.as_ref() {
            Some(span) => SpanRef(span),
            None => SpanRef(noop_active_span()),
        }
    }

    /// Returns `true` if this context carries an active span.
    pub fn has_active_span(&self) -> bool {
        self.span.is_some()
    }

    /// Install this context as the thread's current context.
    ///
    /// The previous context is restored when the returned guard drops.
    /// Guards must drop on the thread that created them; the guard is
    /// deliberately neither `Send` nor `Sync`.
    pub fn attach(self) -> ContextGuard {
        let previous_cx = CURRENT_CONTEXT
            .try_with(|current| current.replace(self))
            .ok();

        ContextGuard {
            previous_cx,
            _marker: PhantomData,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("span", &self.span.as_ref().map(|s| &s.span_context))
            .finish()
    }
}

/// The active span entry shared by clones of a context.
///
/// The span context is kept outside the lock so readers never contend with
/// a concurrent mutation.
struct ActiveSpan {
    span_context: SpanContext,
    inner: Option<Mutex<Span>>,
}

impl ActiveSpan {
    fn new(span: Span) -> Self {
        ActiveSpan {
            span_context: span.span_context().clone(),
            inner: Some(Mutex::new(span)),
        }
    }

    fn noop() -> Self {
        ActiveSpan {
            span_context: SpanContext::empty_context(),
            inner: None,
        }
    }
}

fn noop_active_span() -> &'static ActiveSpan {
    static NOOP: OnceLock<ActiveSpan> = OnceLock::new();
    NOOP.get_or_init(ActiveSpan::noop)
}

/// A borrow of a context's active span.
///
/// All mutators are no-ops when the context has no active span or the span
/// has already ended.
pub struct SpanRef<'a>(&'a ActiveSpan);

impl fmt::Debug for SpanRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanRef")
            .field("span_context", &self.0.span_context)
            .finish()
    }
}

impl SpanRef<'_> {
    fn with_inner_mut<F: FnOnce(&mut Span)>(&self, f: F) {
        if let Some(inner) = self.0.inner.as_ref() {
            match inner.lock() {
                Ok(mut locked) => f(&mut locked),
                Err(err) => tracing::debug!(
                    name: "span_ref.lock_poisoned",
                    message = %err,
                ),
            }
        }
    }

    /// Immutable identifiers of the active span.
    pub fn span_context(&self) -> &SpanContext {
        &self.0.span_context
    }

    /// Returns `true` if the underlying span is still recording.
    pub fn is_recording(&self) -> bool {
        match self.0.inner.as_ref() {
            Some(inner) => inner.lock().map(|s| s.is_recording()).unwrap_or(false),
            None => false,
        }
    }

    /// Append an attribute to the active span.
    pub fn set_attribute(&self, attribute: KeyValue) {
        self.with_inner_mut(|span| span.set_attribute(attribute))
    }

    /// Record an event on the active span.
    pub fn add_event<T>(&self, name: T, attributes: Vec<KeyValue>)
    where
        T: Into<std::borrow::Cow<'static, str>>,
    {
        self.with_inner_mut(|span| span.add_event(name, attributes))
    }

    /// Record an error on the active span.
    pub fn record_error(&self, err: &dyn std::error::Error) {
        self.with_inner_mut(|span| span.record_error(err))
    }

    /// Set the status of the active span.
    pub fn set_status(&self, status: Status) {
        self.with_inner_mut(|span| span.set_status(status))
    }

    /// Replace the name of the active span.
    pub fn update_name<T>(&self, new_name: T)
    where
        T: Into<std::borrow::Cow<'static, str>>,
    {
        self.with_inner_mut(|span| span.update_name(new_name))
    }

    /// End the active span.
    pub fn end(&self) {
        self.with_inner_mut(|span| span.end())
    }
}

/// Restores the previous context when dropped.
#[must_use = "the current context is reverted as soon as the guard drops"]
#[allow(missing_debug_implementations)]
pub struct ContextGuard {
    previous_cx: Option<Context>,
    // ensure this type is !Send and !Sync
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous_cx) = self.previous_cx.take() {
            let _ = CURRENT_CONTEXT.try_with(|current| current.replace(previous_cx));
        }
    }
}

/// Mark `span` active in the current context and install it.
///
/// The span stays active until the returned guard drops.
pub fn mark_span_as_active(span: Span) -> ContextGuard {
    Context::current_with_span(span).attach()
}

/// Run `f` with a reference to the current context's active span.
pub fn get_active_span<F, T>(f: F) -> T
where
    F: FnOnce(SpanRef<'_>) -> T,
{
    Context::map_current(|cx| f(cx.span()))
}

pin_project! {
    /// A future with a context pinned to it.
    ///
    /// The context is attached before each poll and detached after, so the
    /// wrapped future observes it as current regardless of which thread the
    /// executor polls on.
    #[derive(Clone, Debug)]
    pub struct WithContext<T> {
        #[pin]
        inner: T,
        cx: Context,
    }
}

impl<T: std::future::Future> std::future::Future for WithContext<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, task_cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.cx.clone().attach();
        this.inner.poll(task_cx)
    }
}

/// Extension trait for pinning a [`Context`] to a future.
pub trait FutureExt: Sized {
    /// Attach `cx` to this future for the duration of every poll.
    fn with_context(self, cx: Context) -> WithContext<Self> {
        WithContext { inner: self, cx }
    }

    /// Attach the current context to this future.
    fn with_current_context(self) -> WithContext<Self> {
        let cx = Context::current();
        self.with_context(cx)
    }
}

impl<T: Sized> FutureExt for T {}
