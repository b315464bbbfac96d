// Timing wheel (spec §4.5 "Scheduler"): two independent instances share this
// same structure — one keyed by local arrival time (for outgoing sends
// timed relative to our own clock before we're synchronized), one keyed by
// global time (once synchronized, incoming timestamped messages wait here
// until due). Grounded in the teacher's bucket-queue pattern in
// `event_loop_msg.rs`; generalized into a plain data structure with no
// thread of its own, since O2's entire model is single-threaded poll().

use std::collections::VecDeque;

use crate::message::Message;

const DEFAULT_BINS: usize = 256;
/// Bin granularity in milliseconds: messages due within the same bucket
/// fire together, in arrival order.
const BIN_DURATION_MS: u64 = 10;

struct Entry {
    due_ms: u64,
    message: Message,
}

/// A ring of `bins` FIFO queues, one per millisecond-granularity slot,
/// wrapping around every `bins * BIN_DURATION_MS` milliseconds. Spec §4.5
/// "Wrap-around guard": an entry whose due time is more than one full
/// revolution away is rejected rather than silently aliased onto the wrong
/// bin.
pub struct TimingWheel {
    bins: Vec<VecDeque<Entry>>,
    bin_count: usize,
    current_ms: u64,
}

impl TimingWheel {
    pub fn new() -> TimingWheel {
        TimingWheel::with_bins(DEFAULT_BINS)
    }

    pub fn with_bins(bin_count: usize) -> TimingWheel {
        TimingWheel {
            bins: (0..bin_count).map(|_| VecDeque::new()).collect(),
            bin_count,
            current_ms: 0,
        }
    }

    fn horizon_ms(&self) -> u64 {
        self.bin_count as u64 * BIN_DURATION_MS
    }

    /// Schedules `message` for `due_ms` (absolute, same clock as `advance_to`
    /// is fed). Returns `false` if `due_ms` falls outside the wheel's
    /// horizon from `current_ms` — the caller should hold it elsewhere (a
    /// pending list) and resubmit closer to the deadline.
    pub fn schedule(&mut self, due_ms: u64, message: Message) -> bool {
        if due_ms < self.current_ms || due_ms - self.current_ms >= self.horizon_ms() {
            return false;
        }
        let bin = (due_ms / BIN_DURATION_MS) as usize % self.bin_count;
        self.bins[bin].push_back(Entry { due_ms, message });
        true
    }

    /// Advances the wheel to `now_ms`, draining (and returning, in due-time
    /// order) every entry whose deadline has passed.
    pub fn advance_to(&mut self, now_ms: u64) -> Vec<Message> {
        let mut due = Vec::new();
        while self.current_ms <= now_ms {
            let bin = (self.current_ms / BIN_DURATION_MS) as usize % self.bin_count;
            let bucket = &mut self.bins[bin];
            let mut i = 0;
            while i < bucket.len() {
                if bucket[i].due_ms <= now_ms {
                    due.push(bucket.remove(i).unwrap());
                } else {
                    i += 1;
                }
            }
            if self.current_ms == now_ms {
                break;
            }
            self.current_ms += 1;
        }
        due.sort_by_key(|e| e.due_ms);
        due.into_iter().map(|e| e.message).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(|b| b.is_empty())
    }
}

impl Default for TimingWheel {
    fn default() -> Self {
        TimingWheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(addr: &str) -> Message {
        Message::new(addr, 0.0, vec![])
    }

    #[test]
    fn fires_entries_once_due_time_is_reached() {
        let mut wheel = TimingWheel::new();
        assert!(wheel.schedule(10, msg("/a")));
        assert!(wheel.advance_to(9).is_empty());
        let due = wheel.advance_to(10);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].address, "/a");
    }

    #[test]
    fn entries_beyond_horizon_are_rejected() {
        let mut wheel = TimingWheel::with_bins(4);
        assert!(!wheel.schedule(100, msg("/late")));
    }

    #[test]
    fn fires_in_due_time_order_within_a_batch() {
        let mut wheel = TimingWheel::with_bins(64);
        wheel.schedule(5, msg("/second"));
        wheel.schedule(2, msg("/first"));
        let due = wheel.advance_to(5);
        assert_eq!(due[0].address, "/first");
        assert_eq!(due[1].address, "/second");
    }
}
