//! Where device sessions report to.
//!
//! In-process sessions report straight into the run's sink and statistics
//! collector through [`LocalObserver`]. Sessions inside a worker partition
//! report through the worker's batching observer instead.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use fleetsim_core::{EventSink, LogEntry, StatisticsCollector};

/// Callbacks from a running device session.
pub trait SessionObserver: Send + Sync {
    /// Whether the run is still active. Late callbacks are dropped otherwise.
    fn is_running(&self) -> bool;

    fn log(&self, entry: LogEntry);

    fn connected(&self, client_id: &str);

    fn disconnected(&self, client_id: &str);

    fn published(&self, latency: Option<Duration>);

    fn publish_failed(&self, count: u64);

    /// A payload of `size` bytes was built. `group` is set in advanced mode.
    fn message_built(&self, group: Option<&str>, size: usize);
}

/// Observer for sessions hosted by the controller itself.
pub struct LocalObserver {
    sink: Arc<dyn EventSink>,
    stats: Arc<StatisticsCollector>,
    running: Arc<AtomicBool>,
    online: Mutex<HashSet<String>>,
}

impl LocalObserver {
    pub fn new(
        sink: Arc<dyn EventSink>,
        stats: Arc<StatisticsCollector>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sink,
            stats,
            running,
            online: Mutex::new(HashSet::new()),
        }
    }

    pub fn online_count(&self) -> usize {
        self.online.lock().len()
    }

    /// Forget every online device.
    pub fn clear(&self) {
        self.online.lock().clear();
    }
}

impl SessionObserver for LocalObserver {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn log(&self, entry: LogEntry) {
        if self.is_running() {
            self.sink.on_log(entry);
        }
    }

    fn connected(&self, client_id: &str) {
        if !self.is_running() {
            return;
        }
        let count = {
            let mut online = self.online.lock();
            if !online.insert(client_id.to_string()) {
                return;
            }
            online.len()
        };
        self.stats.set_online_devices(count);
    }

    fn disconnected(&self, client_id: &str) {
        if !self.is_running() {
            return;
        }
        let count = {
            let mut online = self.online.lock();
            if !online.remove(client_id) {
                return;
            }
            online.len()
        };
        self.stats.set_online_devices(count);
    }

    fn published(&self, latency: Option<Duration>) {
        if self.is_running() {
            self.stats.increment_success(latency);
        }
    }

    fn publish_failed(&self, count: u64) {
        if self.is_running() {
            for _ in 0..count {
                self.stats.increment_failure();
            }
        }
    }

    fn message_built(&self, group: Option<&str>, size: usize) {
        if !self.is_running() {
            return;
        }
        match group {
            Some(group) => self.stats.set_group_message_size(group, size),
            None => self.stats.set_message_size(size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsim_core::EventBus;

    fn observer(running: bool) -> (LocalObserver, Arc<StatisticsCollector>, EventBus) {
        let bus = EventBus::new();
        let stats = Arc::new(StatisticsCollector::new());
        let observer = LocalObserver::new(
            Arc::new(bus.clone()),
            stats.clone(),
            Arc::new(AtomicBool::new(running)),
        );
        (observer, stats, bus)
    }

    #[tokio::test]
    async fn test_online_devices_are_deduplicated() {
        let (observer, stats, _bus) = observer(true);
        observer.connected("device01");
        observer.connected("device01");
        observer.connected("device02");
        assert_eq!(stats.online_devices(), 2);

        observer.disconnected("device01");
        observer.disconnected("device01");
        assert_eq!(stats.online_devices(), 1);
        assert_eq!(observer.online_count(), 1);
    }

    #[test]
    fn test_message_sizes_recorded_while_running() {
        let (observer, stats, _bus) = observer(true);
        observer.message_built(None, 64);
        observer.message_built(Some("pumps"), 80);
        let snapshot = stats.get_snapshot();
        assert_eq!(snapshot.message_size, Some(64));
        assert_eq!(snapshot.group_message_sizes.get("pumps"), Some(&80));
    }

    #[tokio::test]
    async fn test_stopped_run_drops_callbacks() {
        let (observer, stats, bus) = observer(false);
        let mut rx = bus.subscribe();
        observer.log(LogEntry::info("late"));
        observer.published(None);
        observer.publish_failed(3);
        observer.connected("device01");
        observer.message_built(None, 120);
        observer.message_built(Some("pumps"), 80);

        assert!(rx.try_recv().is_none());
        let snapshot = stats.get_snapshot();
        assert_eq!(snapshot.total_messages, 0);
        assert_eq!(snapshot.online_devices, 0);
        assert_eq!(snapshot.message_size, None);
        assert!(snapshot.group_message_sizes.is_empty());
    }
}
