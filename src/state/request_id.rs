use std::sync::atomic::{AtomicU64, Ordering};

use crate::util::push_u64_hex_16;

/// Generates request ids without per-request RNG calls: a process-wide random
/// seed XOR'd with a monotone sequence.
pub(crate) struct RequestIdGenerator {
    seed: u64,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            seed: fastrand::u64(..),
            counter: AtomicU64::new(1),
        }
    }

    /// Short printable request id, echoed to clients as `X-Request-ID`.
    #[must_use]
    pub(crate) fn next_request_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let mixed = crate::util::mix_u64(self.seed ^ seq);
        let mut out = String::with_capacity(16);
        push_u64_hex_16(&mut out, mixed);
        out.truncate(8);
        out
    }

    /// Full-width trace id for the `X-Trace-ID` header.
    #[must_use]
    pub(crate) fn trace_uuid(&self, request_id: &str) -> uuid::Uuid {
        let hi = u128::from(crate::util::fnv1a_64(request_id.as_bytes()));
        let lo = u128::from(self.seed);
        uuid::Uuid::from_u128((hi << 64) | lo)
    }
}
