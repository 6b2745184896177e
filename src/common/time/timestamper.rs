use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use super::Clock;

/// A point on the cache's logical time line. See [`Timestamper`].
pub type Timestamp = u64;

/// Generates strictly increasing timestamps shared by every region of a
/// factory.
///
/// A timestamp is the number of milliseconds since the Unix epoch shifted
/// left by [`Timestamper::BIN_DIGITS`], so up to 4096 distinct timestamps can
/// be handed out within the same millisecond. When the clock has not moved
/// since the last call (or moved backwards), the previous timestamp plus one is
/// returned instead.
#[derive(Debug)]
pub(crate) struct Timestamper {
    clock: Clock,
    origin_millis: u64,
    last: AtomicU64,
}

impl Timestamper {
    pub(crate) const BIN_DIGITS: u32 = 12;
    pub(crate) const ONE_MS: Timestamp = 1 << Self::BIN_DIGITS;

    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            origin_millis: clock.unix_origin_millis(),
            clock,
            last: AtomicU64::new(0),
        }
    }

    pub(crate) fn next(&self) -> Timestamp {
        let base = self
            .clock
            .fast_now()
            .as_millis()
            .saturating_add(self.origin_millis)
            .saturating_mul(Self::ONE_MS);
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if base > last { base } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Converts a wall-clock duration to a span on the timestamp line.
    pub(crate) fn span_of(duration: Duration) -> Timestamp {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(Self::ONE_MS)
    }
}
