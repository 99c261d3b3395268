//! Drift-aware report scheduling.
//!
//! Tick `n` is due at `first + n * period`, computed from the start rather
//! than chained from the previous fire, so a slow tick does not push every
//! later one back. Ticks that are already a full period overdue are skipped.

use std::time::Duration;

use tokio::time::Instant;

/// Stand-in for a target too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// One scheduled fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based index of this tick.
    pub index: u64,
    /// How late the tick fired relative to its target.
    pub lateness: Duration,
    /// Ticks dropped before this one because they were overdue.
    pub skipped: u64,
    /// Set on every Nth tick whose lateness exceeded the drift threshold.
    pub warn: bool,
}

/// A fixed-cadence schedule anchored at its first fire time.
#[derive(Debug)]
pub struct DriftTicker {
    first: Instant,
    period: Duration,
    next: u64,
    threshold: Duration,
    warn_every: u64,
    drifted: u64,
}

impl DriftTicker {
    /// First fire at `first`, then every `period`.
    pub fn new(first: Instant, period: Duration) -> Self {
        Self {
            first,
            period: period.max(Duration::from_millis(1)),
            next: 0,
            threshold: Duration::from_millis(100),
            warn_every: 50,
            drifted: 0,
        }
    }

    /// Flag ticks later than `threshold`, warning once per `every` of them.
    pub fn with_drift_warning(mut self, threshold: Duration, every: u64) -> Self {
        self.threshold = threshold;
        self.warn_every = every.max(1);
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks seen with lateness above the threshold.
    pub fn drifted(&self) -> u64 {
        self.drifted
    }

    fn target(&self, index: u64) -> Instant {
        let offset = self
            .period
            .checked_mul(u32::try_from(index).unwrap_or(u32::MAX))
            .unwrap_or(FAR_FUTURE);
        self.first
            .checked_add(offset)
            .unwrap_or_else(|| self.first + FAR_FUTURE)
    }

    /// Wait for the next tick. Cancel safe: state only changes after the
    /// wait completes.
    pub async fn tick(&mut self) -> Tick {
        let target = self.target(self.next);
        tokio::time::sleep_until(target).await;

        let now = Instant::now();
        let mut lateness = now.saturating_duration_since(target);
        let mut skipped = 0;
        if lateness >= self.period {
            skipped = (lateness.as_nanos() / self.period.as_nanos()) as u64;
            lateness = now.saturating_duration_since(self.target(self.next + skipped));
        }

        let index = self.next + skipped;
        self.next = index + 1;

        let mut warn = false;
        if lateness > self.threshold || skipped > 0 {
            self.drifted += 1;
            warn = (self.drifted - 1) % self.warn_every == 0;
        }

        Tick {
            index,
            lateness,
            skipped,
            warn,
        }
    }
}
