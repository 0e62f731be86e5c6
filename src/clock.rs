//! Network time model: PTP-style timestamps, clock offset estimation and
//! frame pacing.

use std::{
    fmt,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Timecode value asking the sender to synthesize a timecode from its clock
/// at send time.
pub const TIMECODE_SYNTHESIZE: i64 = i64::MAX;

/// A point in network time, in nanoseconds since the Unix epoch.
///
/// The value is a single signed 64-bit count. Hosts that cannot hold it in a
/// native integer can use the two-part `(seconds, nanoseconds)` view from
/// [`parts`](Self::parts) without losing range.
///
/// A zero timestamp on an outgoing frame means "stamp at send time".
///
/// # Examples
///
/// ```
/// use grafton_av::PtpTimestamp;
///
/// let ts = PtpTimestamp::from_parts(1_700_000_000, 250_000_000);
/// assert_eq!(ts.parts(), (1_700_000_000, 250_000_000));
/// assert_eq!(ts.to_string(), "1700000000.250000000");
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PtpTimestamp(i64);

impl PtpTimestamp {
    pub const ZERO: PtpTimestamp = PtpTimestamp(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Builds a timestamp from whole seconds and a nanosecond remainder.
    /// Values outside the representable range saturate.
    pub fn from_parts(seconds: i64, nanoseconds: u32) -> Self {
        Self(
            seconds
                .saturating_mul(NANOS_PER_SEC)
                .saturating_add(i64::from(nanoseconds)),
        )
    }

    /// Splits into whole seconds and a nanosecond remainder in `0..1e9`.
    pub fn parts(self) -> (i64, u32) {
        (
            self.0.div_euclid(NANOS_PER_SEC),
            self.0.rem_euclid(NANOS_PER_SEC) as u32,
        )
    }

    /// Current time on the process clock. Never goes backwards.
    pub fn now() -> Self {
        CLOCK.now()
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Signed distance `self - earlier` in nanoseconds.
    pub fn nanos_since(self, earlier: PtpTimestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    #[must_use]
    pub fn offset_by(self, nanos: i64) -> Self {
        Self(self.0.saturating_add(nanos))
    }
}

impl From<i64> for PtpTimestamp {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<PtpTimestamp> for i64 {
    fn from(value: PtpTimestamp) -> Self {
        value.0
    }
}

impl fmt::Display for PtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let secs = abs / NANOS_PER_SEC as u64;
        let nanos = abs % NANOS_PER_SEC as u64;
        write!(f, "{sign}{secs}.{nanos:09}")
    }
}

/// Wall time sampled once and advanced by the monotonic clock.
struct ProcessClock {
    wall_anchor: i64,
    mono_anchor: Instant,
}

impl ProcessClock {
    fn new() -> Self {
        let wall_anchor = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self {
            wall_anchor,
            mono_anchor: Instant::now(),
        }
    }

    fn now(&self) -> PtpTimestamp {
        let elapsed = i64::try_from(self.mono_anchor.elapsed().as_nanos()).unwrap_or(i64::MAX);
        PtpTimestamp(self.wall_anchor.saturating_add(elapsed))
    }
}

static CLOCK: Lazy<ProcessClock> = Lazy::new(ProcessClock::new);

/// Offset between a remote clock and the local clock, estimated from one
/// request/response exchange.
///
/// `t1` is the local send time, `t2` the remote receive time, `t3` the remote
/// reply time and `t4` the local receive time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOffset {
    /// Remote minus local, in nanoseconds.
    pub offset_ns: i64,
    /// Network round trip with the remote processing time removed.
    pub round_trip: Duration,
}

impl ClockOffset {
    pub fn from_exchange(
        t1: PtpTimestamp,
        t2: PtpTimestamp,
        t3: PtpTimestamp,
        t4: PtpTimestamp,
    ) -> Self {
        let forward = t2.nanos_since(t1);
        let backward = t3.nanos_since(t4);
        let offset_ns = forward / 2 + backward / 2 + (forward % 2 + backward % 2) / 2;

        let total = t4.nanos_since(t1);
        let remote = t3.nanos_since(t2);
        let round_trip = Duration::from_nanos(total.saturating_sub(remote).max(0) as u64);

        Self {
            offset_ns,
            round_trip,
        }
    }

    /// Maps a timestamp taken on the remote clock onto the local clock.
    pub fn to_local(&self, remote: PtpTimestamp) -> PtpTimestamp {
        remote.offset_by(-self.offset_ns)
    }
}

/// Spaces outgoing frames by their nominal duration.
///
/// The first frame is released immediately. A caller that falls behind is
/// rebased on the current time instead of bursting to catch up.
#[derive(Debug, Default)]
pub struct FramePacer {
    next: Option<tokio::time::Instant>,
}

impl FramePacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the release time for a frame of the given duration and books
    /// the slot after it.
    pub fn schedule(&mut self, duration: Duration) -> tokio::time::Instant {
        let now = tokio::time::Instant::now();
        let release = match self.next {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next = Some(release + duration);
        release
    }

    pub fn reset(&mut self) {
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_of_negative_timestamp() {
        let ts = PtpTimestamp::from_nanos(-1);
        assert_eq!(ts.parts(), (-1, 999_999_999));
        assert_eq!(PtpTimestamp::from_parts(-1, 999_999_999), ts);
        assert_eq!(ts.to_string(), "-0.000000001");
    }

    #[test]
    fn test_from_parts_saturates() {
        assert_eq!(
            PtpTimestamp::from_parts(i64::MAX, 5).as_nanos(),
            i64::MAX
        );
    }

    #[test]
    fn test_now_is_monotonic() {
        let a = PtpTimestamp::now();
        let b = PtpTimestamp::now();
        assert!(b >= a);
        assert!(!a.is_zero());
    }

    /// Remote clock 1 s ahead with a symmetric 10 ms path.
    #[test]
    fn test_clock_offset_symmetric_path() {
        let base = 1_000_000_000_000;
        let t1 = PtpTimestamp::from_nanos(base);
        let t2 = PtpTimestamp::from_nanos(base + 1_000_000_000 + 10_000_000);
        let t3 = PtpTimestamp::from_nanos(base + 1_000_000_000 + 12_000_000);
        let t4 = PtpTimestamp::from_nanos(base + 22_000_000);

        let offset = ClockOffset::from_exchange(t1, t2, t3, t4);
        assert_eq!(offset.offset_ns, 1_000_000_000);
        assert_eq!(offset.round_trip, Duration::from_millis(20));
        assert_eq!(offset.to_local(t2).as_nanos(), base + 10_000_000);
    }

    #[test]
    fn test_clock_offset_identical_clocks() {
        let t = |n| PtpTimestamp::from_nanos(n);
        let offset = ClockOffset::from_exchange(t(100), t(150), t(160), t(210));
        assert_eq!(offset.offset_ns, 0);
        assert_eq!(offset.round_trip, Duration::from_nanos(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_spaces_frames() {
        let mut pacer = FramePacer::new();
        let frame = Duration::from_millis(20);

        let first = pacer.schedule(frame);
        assert!(first <= tokio::time::Instant::now());

        let second = pacer.schedule(frame);
        assert_eq!(second - first, frame);

        // Falling behind rebases on the current time.
        tokio::time::advance(Duration::from_millis(200)).await;
        let late = pacer.schedule(frame);
        assert_eq!(late, tokio::time::Instant::now());
    }
}
