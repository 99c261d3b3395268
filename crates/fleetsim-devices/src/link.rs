//! Broker link abstraction.
//!
//! A session talks to the broker only through a [`DeviceLink`] obtained from
//! a [`Connector`]. The MQTT implementation lives in [`crate::mqtt`]; tests
//! plug in an in-memory connector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use fleetsim_core::MqttSettings;

use crate::identity::DeviceIdentity;

/// Link-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error("Not connected")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Link closed")]
    Closed,
}

/// Something that happened on the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The broker accepted the connection (first connect or reconnect).
    Connected,
    /// A publish was acknowledged. `latency` is enqueue-to-ack time when known.
    Delivered { latency: Option<Duration> },
    /// Publishes that were in flight when the connection dropped.
    Undelivered { count: usize, reason: String },
    /// The connection failed or dropped. The link keeps retrying.
    ConnectionError(String),
    /// The link has shut down for good.
    Closed,
}

/// One device's connection to the broker.
#[async_trait]
pub trait DeviceLink: Send {
    /// Wait for the next link event. Must be cancel safe.
    async fn poll(&mut self) -> LinkEvent;

    /// Queue a publish without waiting for the network.
    fn publish(&mut self, topic: &str, payload: Arc<str>) -> Result<(), LinkError>;

    /// Disconnect and release the connection.
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Opens links for device identities.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, identity: &DeviceIdentity, settings: &MqttSettings) -> Box<dyn DeviceLink>;
}
