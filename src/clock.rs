// Clock synchronization (spec §4.6, §9 "exact constants"): one process
// elects itself (or is configured as) the time reference; every other
// process pings it on a fixed schedule, keeps a 5-sample ring buffer of
// round-trip observations, and slews its local-to-global offset rather than
// stepping it. The ping schedule, ring buffer size, and rate-threshold
// branches below are reproduced exactly from the upstream implementation's
// `clock.c` — spec §9 calls these out as load-bearing for timing-sensitive
// tests.
//
// Grounded in the teacher's `Rc<Cell<_>>`-shared mutable counters
// (`global.rs` `IdSequence`) for the rate-change version guard.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// First 5 pings are 100ms apart, to converge quickly; after that, every
/// 500ms until 5s of runtime, then every 10s indefinitely.
const FAST_PING_COUNT: u32 = 5;
const FAST_PING_INTERVAL: Duration = Duration::from_millis(100);
const SLOW_PING_INTERVAL: Duration = Duration::from_millis(500);
const SLOW_PING_PERIOD: Duration = Duration::from_secs(5);
const IDLE_PING_INTERVAL: Duration = Duration::from_secs(10);

pub const RING_BUFFER_SIZE: usize = 5;

/// Slew rate applied to the local-to-global mapping while catching up
/// (ahead of global time), falling behind, or holding steady.
pub const RATE_SPEED_UP: f64 = 1.1;
pub const RATE_SLOW_DOWN: f64 = 0.9;
pub const RATE_PAUSE: f64 = 0.0;
pub const RATE_NOMINAL: f64 = 1.0;

#[derive(Clone, Copy, Debug)]
struct Sample {
    local_ms: u64,
    round_trip_ms: u64,
    offset_ms: i64,
}

/// Fixed-size ring of the most recent round-trip observations, used to
/// pick the lowest-round-trip (most trustworthy) sample for each
/// recalculation, per spec §4.6 "Best-of-5 selection".
struct RingBuffer {
    samples: [Option<Sample>; RING_BUFFER_SIZE],
    next: usize,
    filled: usize,
}

impl RingBuffer {
    fn new() -> RingBuffer {
        RingBuffer { samples: [None; RING_BUFFER_SIZE], next: 0, filled: 0 }
    }

    fn push(&mut self, sample: Sample) {
        self.samples[self.next] = Some(sample);
        self.next = (self.next + 1) % RING_BUFFER_SIZE;
        self.filled = (self.filled + 1).min(RING_BUFFER_SIZE);
    }

    fn best(&self) -> Option<Sample> {
        self.samples.iter().flatten().min_by_key(|s| s.round_trip_ms).copied()
    }

    fn len(&self) -> usize {
        self.filled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unsynced,
    Reference,
    Synced,
}

/// Tracks rate-change cancellation: each time the offset is recalculated,
/// the version increments so any in-flight scheduled "slew back to
/// nominal" timer becomes a no-op if a newer recalculation superseded it
/// (spec §4.6 "Rate-version cancellation").
pub struct Clock {
    role: Role,
    ring: RingBuffer,
    offset_ms: i64,
    rate: f64,
    rate_version: crate::global::IdSequence,
    /// The most recently issued rate-version number; a `/_o2/cs/cu`
    /// restoration scheduled against an earlier version is stale and must
    /// not touch `rate` (spec §4.6 "Rate-version cancellation").
    last_rate_version: usize,
    pings_sent: u32,
    started_at_local_ms: u64,
    /// Mirrors `offset_ms` behind a lock-free atomic so the shared-memory
    /// bridge's helper thread can read global time without touching this
    /// `Clock` at all (spec §5: "reads the global-time offset as a single
    /// lock-free load").
    offset_mirror: Arc<AtomicI64>,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            role: Role::Unsynced,
            ring: RingBuffer::new(),
            offset_ms: 0,
            rate: RATE_NOMINAL,
            rate_version: crate::global::IdSequence::new(),
            last_rate_version: 0,
            pings_sent: 0,
            started_at_local_ms: 0,
            offset_mirror: Arc::new(AtomicI64::new(0)),
        }
    }

    /// A cloneable handle onto this clock's offset, read-only from the
    /// outside, for components that can't hold a `Rc<RefCell<Clock>>`
    /// themselves (spec §5's shared-memory helper thread, which must not
    /// share anything `!Send` with the main thread).
    pub fn offset_mirror(&self) -> Arc<AtomicI64> {
        self.offset_mirror.clone()
    }

    pub fn become_reference(&mut self) {
        self.role = Role::Reference;
        self.offset_ms = 0;
        self.rate = RATE_NOMINAL;
        self.offset_mirror.store(0, Ordering::Release);
    }

    pub fn is_reference(&self) -> bool {
        self.role == Role::Reference
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self.role, Role::Reference | Role::Synced)
    }

    /// Interval to wait before sending the next ping, given `elapsed` since
    /// synchronization started.
    pub fn next_ping_interval(&self, elapsed: Duration) -> Duration {
        if self.pings_sent < FAST_PING_COUNT {
            FAST_PING_INTERVAL
        } else if elapsed < SLOW_PING_PERIOD {
            SLOW_PING_INTERVAL
        } else {
            IDLE_PING_INTERVAL
        }
    }

    pub fn record_ping_sent(&mut self) {
        self.pings_sent += 1;
    }

    /// Folds in one round-trip observation: `local_ms` when the ping was
    /// sent, `round_trip_ms` measured RTT, `reference_reply_ms` the
    /// reference's reported time at receipt. Recomputes the offset from
    /// the best-of-ring sample and picks a slew rate toward convergence,
    /// with a 1-second threshold on how far off we are (`clock.c`):
    ///
    /// - `advance > 1000ms`: step the offset immediately instead of
    ///   slewing (the gap is too big to close smoothly) and return `None`
    ///   — no restoration timer needed, the rate never left nominal.
    /// - `0 < advance <= 1000ms`: speed up, restore nominal rate after
    ///   `advance * 10` ms.
    /// - `-1000ms < advance <= 0`: slow down (this is the branch that
    ///   catches `advance == 0`, not a pause), restore after
    ///   `-advance * 10` ms.
    /// - `advance <= -1000ms`: pause the local clock until global time
    ///   catches up; no restoration, there's nothing to restore from.
    ///
    /// Returns `Some((delay_ms, rate_version))` when a `/_o2/cs/cu`
    /// restoration should be scheduled `delay_ms` from now; the caller
    /// passes `rate_version` back into [`Clock::restore_rate_if_current`]
    /// when that timer fires.
    pub fn observe(&mut self, local_ms: u64, round_trip_ms: u64, reference_reply_ms: u64) -> Option<(u64, usize)> {
        let estimated_offset = reference_reply_ms as i64 - (local_ms as i64 + round_trip_ms as i64 / 2);
        self.ring.push(Sample { local_ms, round_trip_ms, offset_ms: estimated_offset });

        if self.ring.len() < 2 {
            return None;
        }
        let best = self.ring.best()?;
        let advance = best.offset_ms - self.offset_ms;
        self.offset_ms = best.offset_ms;
        self.offset_mirror.store(self.offset_ms, Ordering::Release);
        self.role = Role::Synced;

        if advance > 1000 {
            self.rate = RATE_NOMINAL;
            self.bump_version();
            None
        } else if advance > 0 {
            self.rate = RATE_SPEED_UP;
            let version = self.bump_version();
            Some((advance as u64 * 10, version))
        } else if advance > -1000 {
            self.rate = RATE_SLOW_DOWN;
            let version = self.bump_version();
            Some(((-advance) as u64 * 10, version))
        } else {
            self.rate = RATE_PAUSE;
            self.bump_version();
            None
        }
    }

    fn bump_version(&mut self) -> usize {
        let version = self.rate_version.next();
        self.last_rate_version = version;
        version
    }

    /// Sets `rate` back to nominal if `version` is still the most recent
    /// one issued by [`Clock::observe`]; a superseded version is a no-op,
    /// since a newer observation already picked a rate for the current
    /// situation (spec §4.6 "Rate-version cancellation").
    pub fn restore_rate_if_current(&mut self, version: usize) -> bool {
        if version == self.last_rate_version {
            self.rate = RATE_NOMINAL;
            true
        } else {
            false
        }
    }

    pub fn global_now_ms(&self, local_now_ms: u64) -> u64 {
        (local_now_ms as i64 + self.offset_ms).max(0) as u64
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_is_synchronized_with_zero_offset() {
        let mut clock = Clock::new();
        clock.become_reference();
        assert!(clock.is_synchronized());
        assert_eq!(clock.global_now_ms(1000), 1000);
    }

    #[test]
    fn unsynced_clock_reports_not_synchronized() {
        let clock = Clock::new();
        assert!(!clock.is_synchronized());
    }

    #[test]
    fn first_five_pings_use_the_fast_interval() {
        let mut clock = Clock::new();
        for _ in 0..FAST_PING_COUNT {
            assert_eq!(clock.next_ping_interval(Duration::from_secs(0)), FAST_PING_INTERVAL);
            clock.record_ping_sent();
        }
        assert_eq!(clock.next_ping_interval(Duration::from_secs(1)), SLOW_PING_INTERVAL);
    }

    #[test]
    fn two_observations_synchronize_and_apply_an_offset() {
        let mut clock = Clock::new();
        clock.observe(0, 20, 110);
        assert!(!clock.is_synchronized());
        clock.observe(100, 20, 210);
        assert!(clock.is_synchronized());
        assert_eq!(clock.global_now_ms(100), (100i64 + clock.offset_ms) as u64);
    }

    #[test]
    fn zero_advance_slows_down_rather_than_pauses() {
        // advance == 0 must land in the slow-down branch (`-1000 < advance
        // <= 0`), not the old buggy "== 0 -> pause" case.
        let mut clock = Clock::new();
        clock.observe(0, 0, 0);
        let restore = clock.observe(0, 0, 0);
        assert_eq!(clock.rate(), RATE_SLOW_DOWN);
        assert!(restore.is_some());
    }

    #[test]
    fn large_positive_advance_jumps_instead_of_slewing() {
        let mut clock = Clock::new();
        clock.observe(0, 100, 0);
        // Lower round-trip time makes this sample the trusted one.
        let restore = clock.observe(0, 10, 2050);
        assert_eq!(clock.rate(), RATE_NOMINAL);
        assert!(restore.is_none());
    }

    #[test]
    fn large_negative_advance_pauses_with_no_restore() {
        let mut clock = Clock::new();
        clock.observe(0, 100, 0);
        let restore = clock.observe(3000, 10, 0);
        assert_eq!(clock.rate(), RATE_PAUSE);
        assert!(restore.is_none());
    }

    #[test]
    fn stale_rate_version_does_not_restore() {
        let mut clock = Clock::new();
        clock.observe(0, 0, 0);
        let (_, first_version) = clock.observe(0, 0, 50).unwrap();
        // A second observation bumps the version again before the first
        // restoration timer fires.
        clock.observe(0, 0, 500);
        assert!(!clock.restore_rate_if_current(first_version));
    }

    #[test]
    fn current_rate_version_restores_nominal_rate() {
        let mut clock = Clock::new();
        clock.observe(0, 0, 0);
        let (_, version) = clock.observe(0, 0, 50).unwrap();
        assert!(clock.restore_rate_if_current(version));
        assert_eq!(clock.rate(), RATE_NOMINAL);
    }

    #[test]
    fn ring_buffer_keeps_only_the_most_recent_five_samples() {
        let mut ring = RingBuffer::new();
        for i in 0..8u64 {
            ring.push(Sample { local_ms: i, round_trip_ms: i, offset_ms: i as i64 });
        }
        assert_eq!(ring.len(), RING_BUFFER_SIZE);
    }
}
