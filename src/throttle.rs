//! Send-rate throttling aligned to the statistics clock.
//!
//! Rather than metering every byte, the throttle hands out a budget of
//! `target` bytes per window. A window ends at the next statistics boundary
//! (the last stats tick plus a whole number of seconds plus
//! [`BOUNDARY_OFFSET`]), so a window's bytes land in a single sampling
//! interval. Once the budget is spent the sender sleeps out the rest of the
//! window and starts a new one.
//!
//! ## Algorithm
//!
//! ```text
//! begin:   start = now, wait = boundary - now, chunk = min(buffer, target)
//! enforce: remaining = target - sent
//!          remaining > 0  -> chunk = min(buffer, remaining)
//!          remaining == 0 -> sleep(wait - elapsed), start over with sent = 0
//! ```
//!
//! A target of zero disables throttling; every call then returns a full
//! buffer.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;

/// Distance past a stats tick at which throttling windows roll over.
pub const BOUNDARY_OFFSET: Duration = Duration::from_millis(50);

const STATS_PERIOD: Duration = Duration::from_secs(1);

/// Instant of the most recent statistics tick, shared between a test's
/// publisher (which ticks it) and its senders (which align their windows
/// to it).
#[derive(Debug, Clone)]
pub struct StatsClock {
    last_tick: Arc<Mutex<Instant>>,
}

impl StatsClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Creates a clock whose last tick happened at `instant`.
    pub fn starting_at(instant: Instant) -> Self {
        Self {
            last_tick: Arc::new(Mutex::new(instant)),
        }
    }

    /// Records a statistics tick.
    pub fn tick(&self) {
        *self.last_tick.lock() = Instant::now();
    }

    pub fn last_tick(&self) -> Instant {
        *self.last_tick.lock()
    }

    /// Time from `now` until the next window boundary.
    ///
    /// Boundaries fall at `last_tick + k s + BOUNDARY_OFFSET` for `k >= 1`;
    /// this picks the first one after `now`, so windows stay one second long
    /// when ticks are further apart than that.
    pub fn wait_from(&self, now: Instant) -> Duration {
        next_boundary(self.last_tick(), now).saturating_duration_since(now)
    }
}

fn next_boundary(last_tick: Instant, now: Instant) -> Instant {
    let first = last_tick + STATS_PERIOD + BOUNDARY_OFFSET;
    if now < first {
        return first;
    }
    let periods = now.duration_since(first).as_nanos() / STATS_PERIOD.as_nanos() + 1;
    first + STATS_PERIOD * periods as u32
}

impl Default for StatsClock {
    fn default() -> Self {
        Self::new()
    }
}

/// What the sender should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThrottleStep {
    /// Send at most this many bytes.
    Send(usize),
    /// Budget spent; sleep this long, then open a new window.
    Exhausted(Duration),
}

/// Opens a throttling window.
///
/// Returns `(start, wait_time, bytes_to_send)`.
pub fn begin_throttle(
    clock: &StatsClock,
    target_bytes_per_sec: u64,
    buffer_len: usize,
) -> (Instant, Duration, usize) {
    let start = Instant::now();
    let wait_time = clock.wait_from(start);
    (start, wait_time, first_chunk(target_bytes_per_sec, buffer_len))
}

fn first_chunk(target: u64, buffer_len: usize) -> usize {
    if target > 0 && target < buffer_len as u64 {
        target as usize
    } else {
        buffer_len
    }
}

/// Decides the next step without sleeping.
pub(crate) fn throttle_step(
    target: u64,
    sent_bytes: u64,
    buffer_len: usize,
    elapsed: Duration,
    wait_time: Duration,
) -> ThrottleStep {
    if target == 0 {
        return ThrottleStep::Send(buffer_len);
    }
    let remaining = target.saturating_sub(sent_bytes);
    if remaining > 0 {
        return ThrottleStep::Send(remaining.min(buffer_len as u64) as usize);
    }
    ThrottleStep::Exhausted(wait_time.saturating_sub(elapsed))
}

/// Enforces the budget after a send.
///
/// Returns `(start, wait_time, sent_bytes, bytes_to_send)` for the next
/// call. Sleeps when this window's budget is spent.
pub async fn enforce_throttle(
    clock: &StatsClock,
    start: Instant,
    wait_time: Duration,
    target: u64,
    sent_bytes: u64,
    buffer_len: usize,
) -> (Instant, Duration, u64, usize) {
    match throttle_step(target, sent_bytes, buffer_len, start.elapsed(), wait_time) {
        ThrottleStep::Send(bytes) => (start, wait_time, sent_bytes, bytes),
        ThrottleStep::Exhausted(sleep_for) => {
            if !sleep_for.is_zero() {
                time::sleep(sleep_for).await;
            }
            let start = Instant::now();
            let wait_time = clock.wait_from(start);
            (start, wait_time, 0, first_chunk(target, buffer_len))
        }
    }
}

/// Per-worker throttle state for a send loop.
///
/// # Examples
///
/// ```
/// use ethrs::throttle::{StatsClock, Throttle};
///
/// # async fn example() {
/// let clock = StatsClock::new();
/// // 8 Mbps with 16 KiB buffers
/// let mut throttle = Throttle::begin(clock, 8_000_000, 16 * 1024);
/// let chunk = throttle.bytes_to_send();
/// // ... write `chunk` bytes ...
/// throttle.record_sent(chunk).await;
/// # }
/// ```
#[derive(Debug)]
pub struct Throttle {
    clock: StatsClock,
    target: u64,
    buffer_len: usize,
    start: Instant,
    wait_time: Duration,
    sent_bytes: u64,
    bytes_to_send: usize,
}

impl Throttle {
    /// Starts throttling to `bits_per_sec` (0 for unlimited).
    pub fn begin(clock: StatsClock, bits_per_sec: u64, buffer_len: usize) -> Self {
        let target = bits_per_sec / 8;
        let (start, wait_time, bytes_to_send) = begin_throttle(&clock, target, buffer_len);
        Self {
            clock,
            target,
            buffer_len,
            start,
            wait_time,
            sent_bytes: 0,
            bytes_to_send,
        }
    }

    pub fn bytes_to_send(&self) -> usize {
        self.bytes_to_send
    }

    pub fn is_unlimited(&self) -> bool {
        self.target == 0
    }

    /// Accounts for `n` bytes just sent, sleeping if the window is spent.
    pub async fn record_sent(&mut self, n: usize) {
        if self.target == 0 {
            return;
        }
        self.sent_bytes += n as u64;
        let (start, wait_time, sent_bytes, bytes_to_send) = enforce_throttle(
            &self.clock,
            self.start,
            self.wait_time,
            self.target,
            self.sent_bytes,
            self.buffer_len,
        )
        .await;
        self.start = start;
        self.wait_time = wait_time;
        self.sent_bytes = sent_bytes;
        self.bytes_to_send = bytes_to_send;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_unlimited_uses_full_buffer() {
        let clock = StatsClock::new();
        let (_, _, bytes) = begin_throttle(&clock, 0, 16384);
        assert_eq!(bytes, 16384);
    }

    #[test]
    fn test_begin_small_target_shrinks_chunk() {
        let clock = StatsClock::new();
        let (_, _, bytes) = begin_throttle(&clock, 1000, 16384);
        assert_eq!(bytes, 1000);
    }

    #[test]
    fn test_wait_aligned_to_stats_boundary() {
        let clock = StatsClock::new();
        let now = clock.last_tick();
        assert_eq!(clock.wait_from(now), STATS_PERIOD + BOUNDARY_OFFSET);
        assert_eq!(
            clock.wait_from(now + Duration::from_millis(600)),
            Duration::from_millis(450)
        );
    }

    #[test]
    fn test_stale_clock_keeps_one_second_windows() {
        let clock = StatsClock::new();
        let tick = clock.last_tick();

        // Five seconds without a tick: next boundary is tick + 5.05 s.
        assert_eq!(
            clock.wait_from(tick + Duration::from_secs(5)),
            BOUNDARY_OFFSET
        );
        // Sitting exactly on a boundary waits a full second for the next.
        assert_eq!(
            clock.wait_from(tick + Duration::from_millis(2050)),
            STATS_PERIOD
        );
        assert_eq!(
            clock.wait_from(tick + Duration::from_millis(3500)),
            Duration::from_millis(550)
        );
    }

    #[tokio::test]
    async fn test_stale_clock_still_caps_rate() {
        let clock = StatsClock::starting_at(Instant::now() - Duration::from_secs(2));
        // 8000 bit/s is 1000 bytes per window.
        let mut throttle = Throttle::begin(clock, 8_000, 1000);

        let mut sent = 0u64;
        let _ = time::timeout(Duration::from_millis(300), async {
            loop {
                let chunk = throttle.bytes_to_send();
                sent += chunk as u64;
                throttle.record_sent(chunk).await;
            }
        })
        .await;

        // The short window up to the next boundary plus the one after it.
        assert!(sent >= 1000, "sent {} bytes", sent);
        assert!(sent <= 2000, "sent {} bytes", sent);
    }

    #[test]
    fn test_step_shrinks_to_remainder() {
        let step = throttle_step(10_000, 9_000, 4096, Duration::ZERO, Duration::from_secs(1));
        assert_eq!(step, ThrottleStep::Send(1000));

        let step = throttle_step(10_000, 1_000, 4096, Duration::ZERO, Duration::from_secs(1));
        assert_eq!(step, ThrottleStep::Send(4096));
    }

    #[test]
    fn test_step_exhausted_sleeps_remaining_window() {
        let step = throttle_step(
            10_000,
            10_000,
            4096,
            Duration::from_millis(300),
            Duration::from_millis(1000),
        );
        assert_eq!(step, ThrottleStep::Exhausted(Duration::from_millis(700)));

        // Overshoot counts as exhausted as well.
        let step = throttle_step(10_000, 12_000, 4096, Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(step, ThrottleStep::Exhausted(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_enforce_resets_window() {
        // A zero wait means the window is already over: no sleeping.
        let clock = StatsClock::starting_at(Instant::now());
        let start = Instant::now();
        let (new_start, _, sent, bytes) =
            enforce_throttle(&clock, start, Duration::ZERO, 5000, 5000, 4096).await;

        assert_eq!(sent, 0);
        assert_eq!(bytes, 4096);
        assert!(new_start >= start);
    }

    #[tokio::test]
    async fn test_unlimited_throttle_never_waits() {
        let mut throttle = Throttle::begin(StatsClock::new(), 0, 1500);
        assert!(throttle.is_unlimited());
        for _ in 0..1000 {
            throttle.record_sent(1500).await;
            assert_eq!(throttle.bytes_to_send(), 1500);
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: the next chunk never exceeds the buffer
            #[test]
            fn prop_chunk_bounded_by_buffer(
                target in 0u64..100_000_000,
                sent in 0u64..200_000_000,
                buffer_len in 1usize..1_048_576,
                elapsed_ms in 0u64..2000,
            ) {
                let step = throttle_step(
                    target,
                    sent,
                    buffer_len,
                    Duration::from_millis(elapsed_ms),
                    Duration::from_millis(1050),
                );
                if let ThrottleStep::Send(bytes) = step {
                    prop_assert!(bytes <= buffer_len);
                }
                prop_assert!(first_chunk(target, buffer_len) <= buffer_len);
            }

            /// Property: a window never carries more than target + one buffer
            #[test]
            fn prop_window_total_bounded(
                target in 1u64..1_000_000,
                buffer_len in 1usize..65_536,
                short_write in 512usize..65_536,
            ) {
                let mut sent = 0u64;
                let mut chunk = first_chunk(target, buffer_len);
                loop {
                    // Writers may send less than asked, never more.
                    sent += chunk.min(short_write) as u64;
                    match throttle_step(target, sent, buffer_len, Duration::ZERO, Duration::from_secs(1)) {
                        ThrottleStep::Send(bytes) => chunk = bytes,
                        ThrottleStep::Exhausted(_) => break,
                    }
                }
                prop_assert!(sent <= target + buffer_len as u64);
            }
        }
    }
}
