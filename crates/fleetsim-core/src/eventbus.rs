//! Event sinks for simulation output.
//!
//! A run reports through an [`EventSink`] with two channels, log lines and
//! coalesced statistics. [`EventBus`] fans events out to any number of
//! subscribers over a broadcast channel, [`TracingSink`] mirrors the log
//! stream into `tracing`, and [`RunSink`] scopes a sink to one run so that
//! nothing leaks out after the run has stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::event::{LogEntry, LogLevel, SimulationEvent};
use crate::stats::StatisticsSnapshot;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Receiver side of a simulation run.
pub trait EventSink: Send + Sync {
    fn on_log(&self, entry: LogEntry);
    fn on_stats(&self, snapshot: StatisticsSnapshot);
}

/// Event bus for simulation events.
///
/// Slow subscribers lose the oldest events rather than slowing the run.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SimulationEvent>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: SimulationEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn on_log(&self, entry: LogEntry) {
        self.publish(SimulationEvent::Log(entry));
    }

    fn on_stats(&self, snapshot: StatisticsSnapshot) {
        self.publish(SimulationEvent::Stats(snapshot));
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<SimulationEvent>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<SimulationEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<SimulationEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<SimulationEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Mirrors log entries into `tracing`, optionally forwarding to another sink.
#[derive(Clone, Default)]
pub struct TracingSink {
    inner: Option<Arc<dyn EventSink>>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self { inner: None }
    }

    pub fn wrap(inner: Arc<dyn EventSink>) -> Self {
        Self { inner: Some(inner) }
    }
}

impl EventSink for TracingSink {
    fn on_log(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Error => tracing::error!(target: "fleetsim::run", "{}", entry.message),
            LogLevel::Warning => tracing::warn!(target: "fleetsim::run", "{}", entry.message),
            LogLevel::Data => tracing::debug!(target: "fleetsim::run", "{}", entry.message),
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(target: "fleetsim::run", "{}", entry.message)
            }
        }
        if let Some(inner) = &self.inner {
            inner.on_log(entry);
        }
    }

    fn on_stats(&self, snapshot: StatisticsSnapshot) {
        tracing::debug!(
            target: "fleetsim::run",
            online = snapshot.online_devices,
            total = snapshot.total_messages,
            failures = snapshot.failure_count,
            "stats"
        );
        if let Some(inner) = &self.inner {
            inner.on_stats(snapshot);
        }
    }
}

/// A sink scoped to one run.
///
/// Once [`RunSink::close`] has been called every event is dropped, so late
/// callbacks from a finished run cannot reach the observer.
pub struct RunSink {
    inner: Arc<dyn EventSink>,
    open: AtomicBool,
}

impl RunSink {
    pub fn new(inner: Arc<dyn EventSink>) -> Self {
        Self {
            inner,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl EventSink for RunSink {
    fn on_log(&self, entry: LogEntry) {
        if self.is_open() {
            self.inner.on_log(entry);
        } else {
            tracing::trace!(message = %entry.message, "Suppressed log after stop");
        }
    }

    fn on_stats(&self, snapshot: StatisticsSnapshot) {
        if self.is_open() {
            self.inner.on_stats(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_delivers_logs_and_stats() {
        let bus = EventBus::with_name("test");
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.on_log(LogEntry::info("hello"));
        bus.on_stats(StatisticsSnapshot::default());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.type_name(), "log");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.type_name(), "stats");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.publish(SimulationEvent::Log(LogEntry::info("nobody"))));
    }

    #[test]
    fn test_run_sink_drops_after_close() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sink = RunSink::new(Arc::new(bus.clone()));

        sink.on_log(LogEntry::info("before"));
        sink.close();
        sink.on_log(LogEntry::info("after"));
        sink.on_stats(StatisticsSnapshot::default());

        let events = rx.drain();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SimulationEvent::Log(entry) => assert_eq!(entry.message, "before"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_tracing_sink_forwards() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let sink = TracingSink::wrap(Arc::new(bus.clone()));

        sink.on_log(LogEntry::warning("drift"));
        assert_eq!(rx.drain().len(), 1);
    }
}
