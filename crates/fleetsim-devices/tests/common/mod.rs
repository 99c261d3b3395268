//! In-memory broker used by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use fleetsim_core::{EventSink, LogEntry, MqttSettings, StatisticsSnapshot};
use fleetsim_devices::{Connector, DeviceIdentity, DeviceLink, LinkError, LinkEvent};

/// One message accepted by the in-memory broker.
#[derive(Debug, Clone)]
pub struct Published {
    pub client_id: String,
    pub topic: String,
    pub payload: String,
}

impl Published {
    pub fn json(&self) -> Map<String, Value> {
        serde_json::from_str(&self.payload).unwrap()
    }
}

#[derive(Default)]
struct Broker {
    opened: Mutex<Vec<DeviceIdentity>>,
    published: Mutex<Vec<Published>>,
    closed: AtomicUsize,
    reject_publishes: AtomicBool,
    hang_on_close: AtomicBool,
}

/// Connector whose links connect at once and acknowledge every publish.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: Arc<Broker>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail at the link.
    pub fn reject_publishes(&self, reject: bool) {
        self.broker.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Make every link close block forever.
    pub fn hang_on_close(&self, hang: bool) {
        self.broker.hang_on_close.store(hang, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<DeviceIdentity> {
        self.broker.opened.lock().clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.broker.published.lock().clone()
    }

    pub fn closed(&self) -> usize {
        self.broker.closed.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn open(&self, identity: &DeviceIdentity, _settings: &MqttSettings) -> Box<dyn DeviceLink> {
        self.broker.opened.lock().push(identity.clone());
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        Box::new(MemoryLink {
            client_id: identity.client_id.clone(),
            broker: self.broker.clone(),
            announced: false,
            acks_tx,
            acks_rx,
        })
    }
}

struct MemoryLink {
    client_id: String,
    broker: Arc<Broker>,
    announced: bool,
    acks_tx: mpsc::UnboundedSender<LinkEvent>,
    acks_rx: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
impl DeviceLink for MemoryLink {
    async fn poll(&mut self) -> LinkEvent {
        if !self.announced {
            self.announced = true;
            return LinkEvent::Connected;
        }
        self.acks_rx.recv().await.unwrap_or(LinkEvent::Closed)
    }

    fn publish(&mut self, topic: &str, payload: Arc<str>) -> Result<(), LinkError> {
        if self.broker.reject_publishes.load(Ordering::SeqCst) {
            return Err(LinkError::Publish("rejected by broker".to_string()));
        }
        self.broker.published.lock().push(Published {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        let _ = self.acks_tx.send(LinkEvent::Delivered {
            latency: Some(Duration::from_millis(2)),
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if self.broker.hang_on_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.broker.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that keeps everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    logs: Mutex<Vec<LogEntry>>,
    stats: Mutex<Vec<StatisticsSnapshot>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.logs.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn snapshots(&self) -> Vec<StatisticsSnapshot> {
        self.stats.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.logs.lock().len() + self.stats.lock().len()
    }
}

impl EventSink for RecordingSink {
    fn on_log(&self, entry: LogEntry) {
        self.logs.lock().push(entry);
    }

    fn on_stats(&self, snapshot: StatisticsSnapshot) {
        self.stats.lock().push(snapshot);
    }
}
