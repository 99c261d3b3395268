//! A single simulated device.
//!
//! A session is one task that owns the device's link, its report tickers and
//! a shutdown receiver. It moves between `Connecting` and `Connected` as the
//! link reports connects and drops; reconnecting is left to the link. The
//! tickers only exist while connected, so a drop clears them and a reconnect
//! arms fresh ones.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use fleetsim_core::{LogEntry, MqttSettings};
use fleetsim_payload::PayloadSource;

use crate::cohort::{Cohort, ReportKind, ReportSpec};
use crate::identity::DeviceIdentity;
use crate::link::{DeviceLink, LinkEvent};
use crate::observer::SessionObserver;
use crate::ticker::{DriftTicker, Tick};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Scheduling knobs shared by every session of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionTiming {
    /// Log every Nth delivered message.
    pub log_sample_every: u64,
    /// Upper bound of the random delay before the first publish. `None`
    /// waits one full period instead.
    pub max_stagger: Option<Duration>,
    pub drift_threshold: Duration,
    pub drift_log_every: u64,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            log_sample_every: 10,
            max_stagger: None,
            drift_threshold: Duration::from_millis(100),
            drift_log_every: 50,
        }
    }
}

struct ReportLoop {
    kind: ReportKind,
    period: Duration,
    source: PayloadSource,
    ticker: Option<DriftTicker>,
}

impl ReportLoop {
    fn new(spec: &ReportSpec) -> Self {
        Self {
            kind: spec.kind,
            period: spec.period,
            source: spec.plan.source(),
            ticker: None,
        }
    }

    async fn next_tick(&mut self) -> Tick {
        match self.ticker.as_mut() {
            Some(ticker) => ticker.tick().await,
            None => std::future::pending().await,
        }
    }
}

async fn next_tick(report: &mut Option<ReportLoop>) -> Tick {
    match report.as_mut() {
        Some(report) => report.next_tick().await,
        None => std::future::pending().await,
    }
}

/// One device's connection and publish schedule.
pub struct DeviceSession {
    identity: DeviceIdentity,
    topic: String,
    group: Option<Arc<str>>,
    primary: ReportLoop,
    secondary: Option<ReportLoop>,
    cohort_preview: Arc<std::sync::atomic::AtomicBool>,
    cohort_label: String,
    timing: SessionTiming,
    link: Box<dyn DeviceLink>,
    observer: Arc<dyn SessionObserver>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    delivered: u64,
}

impl DeviceSession {
    /// Build a session for `identity` in `cohort`. Returns `None` for a
    /// cohort without reports.
    pub fn new(
        identity: DeviceIdentity,
        cohort: &Cohort,
        mqtt: &MqttSettings,
        timing: SessionTiming,
        link: Box<dyn DeviceLink>,
        observer: Arc<dyn SessionObserver>,
        shutdown: watch::Receiver<bool>,
    ) -> Option<Self> {
        let mut reports = cohort.reports.iter();
        let primary = ReportLoop::new(reports.next()?);
        let secondary = reports.next().map(ReportLoop::new);

        Some(Self {
            identity,
            topic: mqtt.topic.clone(),
            group: cohort.group.clone(),
            primary,
            secondary,
            cohort_preview: cohort.preview_logged.clone(),
            cohort_label: cohort.label.clone(),
            timing,
            link,
            observer,
            shutdown,
            state: SessionState::Connecting,
            delivered: 0,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until shutdown or until the link closes for good.
    pub async fn run(mut self) {
        debug!(client_id = %self.identity.client_id, "Session started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.link.poll() => {
                    if !self.handle_link_event(event) {
                        break;
                    }
                }
                tick = self.primary.next_tick() => {
                    self.fire(false, tick);
                }
                tick = next_tick(&mut self.secondary) => {
                    self.fire(true, tick);
                }
            }
        }

        self.disarm();
        if let Err(e) = self.link.close().await {
            warn!(client_id = %self.identity.client_id, error = %e, "Failed to close link");
            self.observer.log(LogEntry::error(format!(
                "[{}] Failed to close connection: {}",
                self.identity.client_id, e
            )));
        }
        self.state = SessionState::Disconnected;
        debug!(client_id = %self.identity.client_id, "Session ended");
    }

    /// Returns `false` once the link is gone for good.
    fn handle_link_event(&mut self, event: LinkEvent) -> bool {
        let client_id = self.identity.client_id.clone();
        match event {
            LinkEvent::Connected => {
                self.observer
                    .log(LogEntry::success(format!("[{}] Connected", client_id)));
                // A transport-level reconnect must not leave duplicate tickers.
                self.disarm();
                self.state = SessionState::Connected;
                self.observer.connected(&client_id);
                self.log_preview();
                self.arm();
            }
            LinkEvent::Delivered { latency } => {
                self.delivered += 1;
                self.observer.published(latency);
                let every = self.timing.log_sample_every.max(1);
                if self.delivered % every == 1 || every == 1 {
                    self.observer.log(LogEntry::success(format!(
                        "[{}] Sent {} messages",
                        client_id, self.delivered
                    )));
                }
            }
            LinkEvent::Undelivered { count, reason } => {
                self.observer.log(LogEntry::error(format!(
                    "[{}] {} messages lost: {}",
                    client_id, count, reason
                )));
                self.observer.publish_failed(count as u64);
            }
            LinkEvent::ConnectionError(reason) => {
                self.observer.log(LogEntry::error(format!(
                    "[{}] Connection error: {}",
                    client_id, reason
                )));
                if self.state == SessionState::Connected {
                    self.connection_closed();
                }
            }
            LinkEvent::Closed => {
                if self.state == SessionState::Connected {
                    self.connection_closed();
                }
                self.state = SessionState::Disconnected;
                return false;
            }
        }
        true
    }

    fn connection_closed(&mut self) {
        self.disarm();
        self.state = SessionState::Connecting;
        self.observer.log(LogEntry::info(format!(
            "[{}] Connection closed",
            self.identity.client_id
        )));
        self.observer.disconnected(&self.identity.client_id);
    }

    fn arm(&mut self) {
        let now = Instant::now();
        let timing = self.timing;
        let first_fire = |period: Duration| match timing.max_stagger {
            Some(max) if !max.is_zero() => {
                let jitter = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
                now + Duration::from_millis(jitter)
            }
            Some(_) => now,
            None => now.checked_add(period).unwrap_or(now),
        };

        for report in std::iter::once(&mut self.primary).chain(self.secondary.as_mut()) {
            report.ticker = Some(
                DriftTicker::new(first_fire(report.period), report.period)
                    .with_drift_warning(timing.drift_threshold, timing.drift_log_every),
            );
        }

        let cadence: Vec<String> = std::iter::once(&self.primary)
            .chain(self.secondary.as_ref())
            .map(|r| format!("{} every {:.3}s", r.kind, r.period.as_secs_f64()))
            .collect();
        self.observer.log(LogEntry::info(format!(
            "[{}] Publishing {}",
            self.identity.client_id,
            cadence.join(", ")
        )));
    }

    fn disarm(&mut self) {
        self.primary.ticker = None;
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.ticker = None;
        }
    }

    fn log_preview(&mut self) {
        if self.cohort_preview.swap(true, Ordering::AcqRel) {
            return;
        }
        let sample = Value::Object(self.primary.source.sample());
        self.observer.log(LogEntry::data(
            format!("[{}] Sample payload", self.cohort_label),
            sample,
        ));
    }

    fn fire(&mut self, secondary: bool, tick: Tick) {
        if !self.observer.is_running() || self.state != SessionState::Connected {
            return;
        }
        let client_id = &self.identity.client_id;
        let report = if secondary {
            match self.secondary.as_mut() {
                Some(report) => report,
                None => return,
            }
        } else {
            &mut self.primary
        };

        if tick.warn {
            self.observer.log(LogEntry::warning(format!(
                "[{}] {} report drifted by {}ms ({} ticks skipped)",
                client_id,
                report.kind,
                tick.lateness.as_millis(),
                tick.skipped
            )));
        }

        let payload = match report.source.next_payload() {
            Ok(payload) => payload,
            Err(e) => {
                self.observer.log(LogEntry::error(format!(
                    "[{}] Failed to build {} payload: {}",
                    client_id, report.kind, e
                )));
                self.observer.publish_failed(1);
                return;
            }
        };
        self.observer
            .message_built(self.group.as_deref(), payload.len());

        if let Err(e) = self.link.publish(&self.topic, payload) {
            self.observer.log(LogEntry::error(format!(
                "[{}] Failed to publish {} report: {}",
                client_id, report.kind, e
            )));
            self.observer.publish_failed(1);
        }
    }
}

/// Spawn a task per device of `cohort`, returning the handles keyed by
/// client id.
pub fn spawn_cohort(
    cohort: &Cohort,
    mqtt: &MqttSettings,
    timing: SessionTiming,
    connector: &dyn crate::link::Connector,
    observer: &Arc<dyn SessionObserver>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<(String, tokio::task::JoinHandle<()>)> {
    let mut handles = Vec::with_capacity(cohort.device_count());
    for index in cohort.range.clone() {
        let identity = DeviceIdentity::derive(index, &cohort.prefixes);
        let link = connector.open(&identity, mqtt);
        let client_id = identity.client_id.clone();
        let session = DeviceSession::new(
            identity,
            cohort,
            mqtt,
            timing,
            link,
            observer.clone(),
            shutdown.clone(),
        );
        if let Some(session) = session {
            handles.push((client_id, tokio::spawn(session.run())));
        }
    }
    handles
}
