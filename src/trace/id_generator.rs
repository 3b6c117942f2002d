use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::{rngs, Rng, SeedableRng};

use crate::trace::span_context::{SpanId, TraceId};

/// Interface for generating span and trace identifiers.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Generate a new `TraceId`.
    fn new_trace_id(&self) -> TraceId;

    /// Generate a new `SpanId`.
    fn new_span_id(&self) -> SpanId;
}

/// Default [`IdGenerator`] using a fast thread-local PRNG.
///
/// Ids are unique with overwhelming probability, not cryptographically
/// unpredictable.
#[derive(Clone, Debug, Default)]
pub struct RandomIdGenerator {
    _private: (),
}

impl IdGenerator for RandomIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        CURRENT_RNG.with(|rng| TraceId::from(rng.borrow_mut().gen::<u128>()))
    }

    fn new_span_id(&self) -> SpanId {
        CURRENT_RNG.with(|rng| SpanId::from(rng.borrow_mut().gen::<u64>()))
    }
}

thread_local! {
    static CURRENT_RNG: std::cell::RefCell<rngs::SmallRng> =
        std::cell::RefCell::new(rngs::SmallRng::from_entropy());
}

/// Deterministic [`IdGenerator`] handing out sequential ids, for tests.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl IdGenerator for SequentialIdGenerator {
    fn new_trace_id(&self) -> TraceId {
        TraceId::from(u128::from(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn new_span_id(&self) -> SpanId {
        SpanId::from(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
