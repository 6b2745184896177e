use std::time::{Duration, Instant as StdInstant, SystemTime, UNIX_EPOCH};

#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::RwLock;

use super::Instant;

/// The source of time for soft-lock timeouts, region TTLs and the timestamper.
#[derive(Default, Clone)]
pub(crate) struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    /// A clock that uses `std::time::Instant` as the source of time.
    Standard {
        origin: StdInstant,
        unix_origin: Duration,
    },
    #[cfg(feature = "quanta")]
    /// A clock that uses both `std::time::Instant` and `quanta::Instant` as the
    /// sources of time.
    Hybrid {
        std_origin: StdInstant,
        quanta_origin: quanta::Instant,
        unix_origin: Duration,
    },
    #[cfg(test)]
    /// A clock that uses a mocked source of time.
    Mocked { mock: Arc<Mock> },
}

impl Default for ClockType {
    /// Create a new `ClockType` with the current time as the origin.
    ///
    /// If the `quanta` feature is enabled, `Hybrid` will be used. Otherwise,
    /// `Standard` will be used.
    fn default() -> Self {
        #[cfg(feature = "quanta")]
        {
            return ClockType::Hybrid {
                std_origin: StdInstant::now(),
                quanta_origin: quanta::Instant::now(),
                unix_origin: since_unix_epoch(),
            };
        }

        #[allow(unreachable_code)]
        ClockType::Standard {
            origin: StdInstant::now(),
            unix_origin: since_unix_epoch(),
        }
    }
}

impl Clock {
    #[cfg(test)]
    /// Creates a new `Clock` with a mocked source of time.
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the current time using a reliable source of time.
    ///
    /// Region TTLs are measured with this time so that entries never expire
    /// early because of a drifting fast clock.
    pub(crate) fn now(&self) -> Instant {
        match &self.ty {
            ClockType::Standard { origin, .. } => {
                Instant::from_duration_since_clock_start(origin.elapsed())
            }
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { std_origin, .. } => {
                Instant::from_duration_since_clock_start(std_origin.elapsed())
            }
            #[cfg(test)]
            ClockType::Mocked { mock } => Instant::from_duration_since_clock_start(mock.elapsed()),
        }
    }

    /// Returns the current time _maybe_ using a fast but less reliable source of
    /// time. The time may drift from the time returned by `now`, or not be
    /// monotonically increasing.
    ///
    /// The timestamper reads this time and enforces monotonicity itself.
    pub(crate) fn fast_now(&self) -> Instant {
        match &self.ty {
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { quanta_origin, .. } => {
                Instant::from_duration_since_clock_start(quanta_origin.elapsed())
            }
            ClockType::Standard { .. } => self.now(),
            #[cfg(test)]
            ClockType::Mocked { .. } => self.now(),
        }
    }
}

impl Clock {
    /// Milliseconds from the Unix epoch to the origin of this clock, so that
    /// clocks created at different times (or in different processes) agree on
    /// the time line. Zero for a mocked clock.
    pub(crate) fn unix_origin_millis(&self) -> u64 {
        let origin = match &self.ty {
            ClockType::Standard { unix_origin, .. } => *unix_origin,
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { unix_origin, .. } => *unix_origin,
            #[cfg(test)]
            ClockType::Mocked { .. } => Duration::ZERO,
        };
        u64::try_from(origin.as_millis()).unwrap_or(u64::MAX)
    }
}

fn since_unix_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match &self.ty {
            ClockType::Standard { .. } => "Standard",
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { .. } => "Hybrid",
            #[cfg(test)]
            ClockType::Mocked { .. } => "Mocked",
        };
        f.debug_struct("Clock").field("type", &name).finish()
    }
}

#[cfg(test)]
pub(crate) struct Mock {
    origin: StdInstant,
    now: RwLock<StdInstant>,
}

#[cfg(test)]
impl Default for Mock {
    fn default() -> Self {
        let origin = StdInstant::now();
        Self {
            origin,
            now: RwLock::new(origin),
        }
    }
}

#[cfg(test)]
impl Mock {
    pub(crate) fn increment(&self, amount: Duration) {
        *self.now.write() += amount;
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.now.read().duration_since(self.origin)
    }
}
