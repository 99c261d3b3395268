//! MQTT links backed by `rumqttc`.
//!
//! Each link owns one `AsyncClient` and a background task that drives its
//! event loop. The task turns raw MQTT events into [`LinkEvent`]s: ConnAck
//! becomes `Connected`, PubAck (or the outgoing publish at QoS 0) becomes
//! `Delivered`, and poll errors become `ConnectionError` followed by a retry
//! after the reconnect period. Undelivered publishes survive a reconnect and
//! are only reported lost when the link closes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use fleetsim_core::{MqttSettings, Qos};

use crate::identity::DeviceIdentity;
use crate::link::{Connector, DeviceLink, LinkError, LinkEvent};

/// Capacity of the client's request channel.
const REQUEST_CAPACITY: usize = 64;

/// How long `close` waits for the disconnect to go out.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Shortest keep-alive the client accepts.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

fn to_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

/// Build client options for one device.
pub fn mqtt_options(identity: &DeviceIdentity, settings: &MqttSettings) -> MqttOptions {
    let mut options = MqttOptions::new(&identity.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs).max(MIN_KEEP_ALIVE));
    options.set_clean_session(settings.clean_session);
    options.set_credentials(&identity.username, &identity.password);
    options
}

/// Opens real broker connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for MqttConnector {
    fn open(&self, identity: &DeviceIdentity, settings: &MqttSettings) -> Box<dyn DeviceLink> {
        let options = mqtt_options(identity, settings);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let qos = to_qos(settings.qos);

        let driver = EventLoopDriver {
            client_id: identity.client_id.clone(),
            eventloop,
            events: tx,
            tracker: DeliveryTracker::new(qos, pending.clone()),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            reconnect_period: settings.reconnect_period(),
        };
        let task = tokio::spawn(driver.run());

        Box::new(MqttLink {
            client,
            events: rx,
            pending,
            qos,
            task: Some(task),
            closed: false,
        })
    }
}

/// A device connection to a real broker.
pub struct MqttLink {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    /// Enqueue times of publishes not yet handed to the network.
    pending: Arc<Mutex<VecDeque<Instant>>>,
    qos: QoS,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

#[async_trait]
impl DeviceLink for MqttLink {
    async fn poll(&mut self) -> LinkEvent {
        self.events.recv().await.unwrap_or(LinkEvent::Closed)
    }

    fn publish(&mut self, topic: &str, payload: Arc<str>) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        self.pending.lock().push_back(Instant::now());
        match self
            .client
            .try_publish(topic, self.qos, false, payload.as_bytes().to_vec())
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.lock().pop_back();
                Err(LinkError::Publish(e.to_string()))
            }
        }
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self
            .client
            .try_disconnect()
            .map_err(|e| LinkError::Connection(e.to_string()));

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        result
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Enqueue-to-delivery bookkeeping for one link.
///
/// Publishes still queued or in flight when the connection drops stay
/// tracked: the client replays them after reconnecting, so they are only
/// reported lost when the link closes for good.
struct DeliveryTracker {
    qos: QoS,
    /// Enqueue times of publishes not yet handed to the network.
    pending: Arc<Mutex<VecDeque<Instant>>>,
    /// Enqueue times of QoS 1 publishes awaiting a PubAck.
    inflight: HashMap<u16, Instant>,
}

impl DeliveryTracker {
    fn new(qos: QoS, pending: Arc<Mutex<VecDeque<Instant>>>) -> Self {
        Self {
            qos,
            pending,
            inflight: HashMap::new(),
        }
    }

    /// A publish went out on the wire.
    fn sent(&mut self, pkid: u16) -> Option<LinkEvent> {
        if self.qos != QoS::AtMostOnce && self.inflight.contains_key(&pkid) {
            // Replayed after a reconnect; the original enqueue time stands.
            return None;
        }
        let queued = self.pending.lock().pop_front()?;
        if self.qos == QoS::AtMostOnce {
            return Some(LinkEvent::Delivered {
                latency: Some(queued.elapsed()),
            });
        }
        self.inflight.insert(pkid, queued);
        None
    }

    fn acked(&mut self, pkid: u16) -> Option<LinkEvent> {
        self.inflight.remove(&pkid).map(|at| LinkEvent::Delivered {
            latency: Some(at.elapsed()),
        })
    }

    /// Publishes that have not been delivered yet.
    fn outstanding(&self) -> usize {
        self.inflight.len() + self.pending.lock().len()
    }
}

struct EventLoopDriver {
    client_id: String,
    eventloop: EventLoop,
    events: mpsc::UnboundedSender<LinkEvent>,
    tracker: DeliveryTracker,
    connect_timeout: Duration,
    reconnect_period: Duration,
}

impl EventLoopDriver {
    async fn run(mut self) {
        let mut connected = false;

        loop {
            let polled = if connected {
                self.eventloop.poll().await.map_err(|e| e.to_string())
            } else {
                match tokio::time::timeout(self.connect_timeout, self.eventloop.poll()).await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!(
                        "connect timed out after {}s",
                        self.connect_timeout.as_secs()
                    )),
                }
            };

            let event = match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected = true;
                    Some(LinkEvent::Connected)
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.tracker.sent(pkid),
                Ok(Event::Incoming(Packet::PubAck(ack))) => self.tracker.acked(ack.pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!(client_id = %self.client_id, "Disconnect sent");
                    let lost = self.tracker.outstanding();
                    if lost > 0 {
                        let _ = self.events.send(LinkEvent::Undelivered {
                            count: lost,
                            reason: "link closed before delivery".to_string(),
                        });
                    }
                    let _ = self.events.send(LinkEvent::Closed);
                    break;
                }
                Ok(other) => {
                    trace!(client_id = %self.client_id, event = ?other, "MQTT event");
                    None
                }
                Err(reason) => {
                    connected = false;
                    if self.events.send(LinkEvent::ConnectionError(reason)).is_err() {
                        break;
                    }
                    tokio::time::sleep(self.reconnect_period).await;
                    continue;
                }
            };

            if let Some(event) = event {
                if self.events.send(event).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsim_core::CredentialPrefixes;

    #[test]
    fn test_options_carry_identity() {
        let identity = DeviceIdentity::derive(4, &CredentialPrefixes::default());
        let mut settings = MqttSettings::new("broker.local", "t").with_port(1884);
        settings.keep_alive_secs = 1;
        let options = mqtt_options(&identity, &settings);

        assert_eq!(options.client_id(), "device04");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
        assert!(options.clean_session());
    }

    fn tracker(qos: QoS, queued: usize) -> DeliveryTracker {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        for _ in 0..queued {
            pending.lock().push_back(Instant::now());
        }
        DeliveryTracker::new(qos, pending)
    }

    #[test]
    fn test_replayed_publishes_are_delivered_after_reconnect() {
        let mut tracker = tracker(QoS::AtLeastOnce, 3);

        assert_eq!(tracker.sent(1), None);
        assert_eq!(tracker.sent(2), None);
        assert_eq!(tracker.outstanding(), 3);

        // Connection dropped: the client replays 1 and 2, then sends the
        // request that was still queued.
        assert_eq!(tracker.sent(1), None);
        assert_eq!(tracker.sent(2), None);
        assert_eq!(tracker.sent(3), None);
        assert_eq!(tracker.outstanding(), 3);

        for pkid in 1..=3 {
            assert!(matches!(
                tracker.acked(pkid),
                Some(LinkEvent::Delivered { latency: Some(_) })
            ));
        }
        assert_eq!(tracker.acked(2), None);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_at_most_once_counts_on_send() {
        let mut tracker = tracker(QoS::AtMostOnce, 2);
        assert!(matches!(tracker.sent(0), Some(LinkEvent::Delivered { .. })));
        assert!(matches!(tracker.sent(0), Some(LinkEvent::Delivered { .. })));
        assert_eq!(tracker.sent(0), None);
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_connection_error() {
        let identity = DeviceIdentity::derive(1, &CredentialPrefixes::default());
        let mut settings = MqttSettings::new("127.0.0.1", "t").with_port(1);
        settings.connect_timeout_secs = 1;
        let mut link = MqttConnector::new().open(&identity, &settings);

        let event = tokio::time::timeout(Duration::from_secs(5), link.poll())
            .await
            .unwrap();
        assert!(matches!(event, LinkEvent::ConnectionError(_)));
        link.close().await.ok();
    }
}
