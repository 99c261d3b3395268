//! Simulated device fleets for the fleetsim simulator.
//!
//! - [`session`]: one device's connection and report schedule
//! - [`controller`]: start/stop lifecycle of a run
//! - [`worker`]: worker partitions for large basic runs
//! - [`registry`]: concurrent runs keyed by [`RunId`]
//!
//! Brokers are reached through the [`Connector`] trait; [`MqttConnector`]
//! is the real implementation.

pub mod cohort;
pub mod controller;
pub mod identity;
pub mod link;
pub mod mqtt;
pub mod observer;
pub mod partition;
pub mod registry;
pub mod session;
pub mod ticker;
pub mod worker;

pub use cohort::{cohorts, use_template_cache, Cohort, ReportKind, ReportSpec};
pub use controller::{FleetController, RunPlan};
pub use identity::{pad_index, DeviceIdentity};
pub use link::{Connector, DeviceLink, LinkError, LinkEvent};
pub use mqtt::{mqtt_options, MqttConnector, MqttLink};
pub use observer::{LocalObserver, SessionObserver};
pub use partition::{plan_partitions, worker_count, Partition};
pub use registry::{RunId, SimulationRegistry};
pub use session::{spawn_cohort, DeviceSession, SessionState, SessionTiming};
pub use ticker::{DriftTicker, Tick};
pub use worker::{
    spawn_worker, PartitionConfig, WorkerCommand, WorkerEvent, WorkerEventKind, WorkerHandle,
};
