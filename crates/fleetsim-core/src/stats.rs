//! Statistics collector.
//!
//! Counters are updated from every device session of a run. Observers are
//! not notified per update: the first update in a window schedules a flush
//! after [`StatisticsCollector::window`], and that flush carries the latest
//! cumulative snapshot. Latency is sampled on every 10th success.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::eventbus::EventSink;

/// Record one latency sample per this many successes.
pub const LATENCY_SAMPLE_EVERY: u64 = 10;

/// Default coalescing window.
pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(1);

/// Point-in-time view of a run's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_devices: usize,
    pub online_devices: usize,
    pub offline_devices: usize,
    pub total_messages: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Percentage, two decimals.
    pub success_rate: f64,
    /// Percentage, two decimals.
    pub failure_rate: f64,
    /// Mean of the sampled latencies in milliseconds, two decimals.
    pub avg_latency_ms: f64,
    /// Latest basic-mode payload size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_size: Option<usize>,
    /// Latest payload size per advanced-mode group.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub group_message_sizes: BTreeMap<String, usize>,
}

/// Counter delta reported by a worker partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsDelta {
    pub success_count: u64,
    pub failure_count: u64,
    /// Sum of latency samples in milliseconds.
    pub latency_total_ms: f64,
    pub latency_samples: u64,
}

impl StatsDelta {
    pub fn is_empty(&self) -> bool {
        self.success_count == 0 && self.failure_count == 0
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_devices: usize,
    online_devices: usize,
    total_messages: u64,
    success_count: u64,
    failure_count: u64,
    total_latency_ms: f64,
    latency_samples: u64,
    message_size: Option<usize>,
    group_message_sizes: BTreeMap<String, usize>,
}

impl Counters {
    fn snapshot(&self) -> StatisticsSnapshot {
        let total = self.success_count + self.failure_count;
        let rate = |count: u64| {
            if total == 0 {
                0.0
            } else {
                round2(count as f64 / total as f64 * 100.0)
            }
        };
        let avg_latency_ms = if self.latency_samples > 0 {
            round2(self.total_latency_ms / self.latency_samples as f64)
        } else {
            0.0
        };

        StatisticsSnapshot {
            total_devices: self.total_devices,
            online_devices: self.online_devices,
            offline_devices: self.total_devices.saturating_sub(self.online_devices),
            total_messages: self.total_messages,
            success_count: self.success_count,
            failure_count: self.failure_count,
            success_rate: rate(self.success_count),
            failure_rate: rate(self.failure_count),
            avg_latency_ms,
            message_size: self.message_size,
            group_message_sizes: self.group_message_sizes.clone(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default)]
struct State {
    counters: Counters,
    flush_pending: bool,
    /// Bumped by `reset` so that flushes scheduled before it are dropped.
    generation: u64,
}

/// Aggregates counters from every session of a run.
pub struct StatisticsCollector {
    state: Mutex<State>,
    observer: RwLock<Option<Arc<dyn EventSink>>>,
    window: Duration,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_STATS_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            observer: RwLock::new(None),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Route flushed snapshots to `observer`.
    pub fn set_observer(&self, observer: Arc<dyn EventSink>) {
        *self.observer.write() = Some(observer);
    }

    /// Stop delivering snapshots; pending flushes become no-ops.
    pub fn detach_observer(&self) {
        *self.observer.write() = None;
        let mut state = self.state.lock();
        state.generation += 1;
        state.flush_pending = false;
    }

    /// Count a delivered message. `latency` is sampled on every 10th success.
    pub fn increment_success(self: &Arc<Self>, latency: Option<Duration>) {
        {
            let mut state = self.state.lock();
            let counters = &mut state.counters;
            counters.total_messages += 1;
            counters.success_count += 1;
            if let Some(latency) = latency {
                if !latency.is_zero() && counters.success_count % LATENCY_SAMPLE_EVERY == 0 {
                    counters.total_latency_ms += latency.as_secs_f64() * 1000.0;
                    counters.latency_samples += 1;
                }
            }
        }
        self.schedule_update();
    }

    pub fn increment_failure(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.counters.total_messages += 1;
            state.counters.failure_count += 1;
        }
        self.schedule_update();
    }

    /// Merge a batched delta from a worker partition.
    pub fn merge_worker_stats(self: &Arc<Self>, delta: StatsDelta) {
        {
            let mut state = self.state.lock();
            let counters = &mut state.counters;
            counters.total_messages += delta.success_count + delta.failure_count;
            counters.success_count += delta.success_count;
            counters.failure_count += delta.failure_count;
            counters.total_latency_ms += delta.latency_total_ms;
            counters.latency_samples += delta.latency_samples;
        }
        self.schedule_update();
    }

    pub fn set_online_devices(self: &Arc<Self>, count: usize) {
        self.state.lock().counters.online_devices = count;
        self.schedule_update();
    }

    /// Apply a signed online-device delta, clamped at zero.
    pub fn adjust_online_devices(self: &Arc<Self>, delta: i64) {
        {
            let mut state = self.state.lock();
            let online = state.counters.online_devices as i64 + delta;
            state.counters.online_devices = online.max(0) as usize;
        }
        self.schedule_update();
    }

    pub fn set_total_devices(self: &Arc<Self>, count: usize) {
        self.state.lock().counters.total_devices = count;
        self.schedule_update();
    }

    /// Record the latest basic-mode payload size. Rides along with the next flush.
    pub fn set_message_size(&self, size: usize) {
        self.state.lock().counters.message_size = Some(size);
    }

    /// Record the latest payload size of a group. Rides along with the next flush.
    pub fn set_group_message_size(&self, group: &str, size: usize) {
        let mut state = self.state.lock();
        match state.counters.group_message_sizes.get_mut(group) {
            Some(current) => *current = size,
            None => {
                state
                    .counters
                    .group_message_sizes
                    .insert(group.to_string(), size);
            }
        }
    }

    pub fn online_devices(&self) -> usize {
        self.state.lock().counters.online_devices
    }

    pub fn get_snapshot(&self) -> StatisticsSnapshot {
        self.state.lock().counters.snapshot()
    }

    /// Zero every counter and deliver the zeroed snapshot before returning.
    pub fn reset(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            state.counters = Counters::default();
            state.flush_pending = false;
            state.generation += 1;
            state.counters.snapshot()
        };
        self.deliver(snapshot);
    }

    /// Deliver the current snapshot now, cancelling any pending flush.
    pub fn flush(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            state.flush_pending = false;
            state.generation += 1;
            state.counters.snapshot()
        };
        self.deliver(snapshot);
    }

    fn schedule_update(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock();
            if state.flush_pending {
                return;
            }
            state.flush_pending = true;
            state.generation
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = Arc::clone(self);
                handle.spawn(async move {
                    tokio::time::sleep(this.window).await;
                    this.flush_generation(generation);
                });
            }
            Err(_) => self.flush_generation(generation),
        }
    }

    fn flush_generation(&self, generation: u64) {
        let snapshot = {
            let mut state = self.state.lock();
            if state.generation != generation || !state.flush_pending {
                return;
            }
            state.flush_pending = false;
            state.counters.snapshot()
        };
        self.deliver(snapshot);
    }

    fn deliver(&self, snapshot: StatisticsSnapshot) {
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_stats(snapshot);
        }
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogEntry;

    #[derive(Default)]
    struct Recorder {
        snapshots: Mutex<Vec<StatisticsSnapshot>>,
    }

    impl EventSink for Recorder {
        fn on_log(&self, _entry: LogEntry) {}

        fn on_stats(&self, snapshot: StatisticsSnapshot) {
            self.snapshots.lock().push(snapshot);
        }
    }

    fn collector() -> (Arc<StatisticsCollector>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let collector = Arc::new(StatisticsCollector::new());
        collector.set_observer(recorder.clone());
        (collector, recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_are_coalesced() {
        let (collector, recorder) = collector();

        for _ in 0..5 {
            collector.increment_success(None);
        }
        collector.increment_failure();
        assert!(recorder.snapshots.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let snapshots = recorder.snapshots.lock().clone();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].success_count, 5);
        assert_eq!(snapshots[0].failure_count, 1);
        assert_eq!(snapshots[0].total_messages, 6);
        assert_eq!(snapshots[0].success_rate, 83.33);
        assert_eq!(snapshots[0].failure_rate, 16.67);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_flushes_synchronously() {
        let (collector, recorder) = collector();
        collector.increment_success(None);
        collector.reset();

        {
            let snapshots = recorder.snapshots.lock();
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0], StatisticsSnapshot::default());
        }

        // The flush scheduled before the reset must not fire.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.snapshots.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_sampled() {
        let (collector, _recorder) = collector();
        for i in 1..=20u64 {
            collector.increment_success(Some(Duration::from_millis(i)));
        }
        let snapshot = collector.get_snapshot();
        // Only the 10th and 20th successes were sampled.
        assert_eq!(snapshot.avg_latency_ms, 15.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_merge_and_online_delta() {
        let (collector, _recorder) = collector();
        collector.set_total_devices(10);
        collector.merge_worker_stats(StatsDelta {
            success_count: 100,
            failure_count: 10,
            latency_total_ms: 50.0,
            latency_samples: 10,
        });
        collector.adjust_online_devices(4);
        collector.adjust_online_devices(-6);

        let snapshot = collector.get_snapshot();
        assert_eq!(snapshot.total_messages, 110);
        assert_eq!(snapshot.avg_latency_ms, 5.0);
        assert_eq!(snapshot.online_devices, 0);
        assert_eq!(snapshot.offline_devices, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_observer_receives_nothing() {
        let (collector, recorder) = collector();
        collector.increment_success(None);
        collector.detach_observer();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(recorder.snapshots.lock().is_empty());
    }

    #[test]
    fn test_group_message_sizes() {
        let collector = StatisticsCollector::new();
        collector.set_group_message_size("a", 10);
        collector.set_group_message_size("a", 12);
        collector.set_message_size(99);
        let snapshot = collector.get_snapshot();
        assert_eq!(snapshot.group_message_sizes.get("a"), Some(&12));
        assert_eq!(snapshot.message_size, Some(99));
    }
}
