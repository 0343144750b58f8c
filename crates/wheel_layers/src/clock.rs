//! The reproducible clock that every emitted timestamp is clamped against.

use once_cell::sync::OnceCell;
use std::time::{SystemTime, UNIX_EPOCH};

/// The environment variable that pins the clamp timestamp, as used by
/// reproducible-build tooling. See <https://reproducible-builds.org/docs/source-date-epoch/>.
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// A clock that yields a single timestamp for the lifetime of the instance.
///
/// The timestamp is resolved at most once: from the `SOURCE_DATE_EPOCH`
/// environment variable if it is set and parseable, otherwise from the wall
/// clock at the moment of the first read. Every file timestamp written to a
/// layer is clamped so that it never exceeds this value, which makes the
/// resulting byte stream independent of when and where it was produced.
///
/// Callers that want determinism across a whole process share one instance.
#[derive(Debug, Default)]
pub struct ReproducibleClock {
    resolved: OnceCell<u64>,
}

impl ReproducibleClock {
    /// Construct a clock that resolves its timestamp on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a clock pinned to the given unix timestamp, ignoring the
    /// environment. Useful for tests and for callers that already determined
    /// the clamp time elsewhere.
    pub fn fixed(timestamp: u64) -> Self {
        let resolved = OnceCell::new();
        resolved
            .set(timestamp)
            .expect("a fresh cell can always be set");
        Self { resolved }
    }

    /// The clamp timestamp in seconds since the unix epoch.
    ///
    /// The first call resolves the value, subsequent calls return the same
    /// value. Resolution is idempotent under concurrent first reads.
    pub fn clamp_time(&self) -> u64 {
        *self.resolved.get_or_init(|| {
            std::env::var(SOURCE_DATE_EPOCH)
                .ok()
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or_else(|| {
                    SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|elapsed| elapsed.as_secs())
                        .unwrap_or(0)
                })
        })
    }

    /// Clamp a timestamp so it does not exceed [`Self::clamp_time`].
    pub fn clamp(&self, timestamp: u64) -> u64 {
        timestamp.min(self.clamp_time())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_clock_ignores_environment() {
        let clock = ReproducibleClock::fixed(1600000000);
        assert_eq!(clock.clamp_time(), 1600000000);
        assert_eq!(clock.clamp(1700000000), 1600000000);
        assert_eq!(clock.clamp(42), 42);
    }

    #[test]
    fn clamp_time_is_stable_across_reads() {
        let clock = ReproducibleClock::new();
        let first = clock.clamp_time();
        assert_eq!(clock.clamp_time(), first);
    }
}
