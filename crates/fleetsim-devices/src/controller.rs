//! Fleet controller.
//!
//! Owns the lifecycle of one run. `start` validates the config and spawns
//! either in-process device sessions or worker partitions; `stop` cancels
//! everything and guarantees that nothing reaches the run's sink afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetsim_core::{
    BasicConfig, EngineSettings, EventSink, LogEntry, Result, RunSink, SimError,
    SimulationConfig, SimulationMode, StatisticsCollector, StatisticsSnapshot, TracingSink,
};
use fleetsim_payload::{CacheStats, TemplateCache};

use crate::cohort::{cohorts, Cohort};
use crate::link::Connector;
use crate::mqtt::MqttConnector;
use crate::observer::{LocalObserver, SessionObserver};
use crate::partition::{plan_partitions, Partition};
use crate::session::{spawn_cohort, SessionTiming};
use crate::worker::{spawn_worker, PartitionConfig, WorkerEvent, WorkerEventKind, WorkerHandle};

/// Upper bound on waiting for in-process sessions to close their links.
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How a run hosts its devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPlan {
    /// Basic mode below the worker threshold.
    InProcess,
    /// Advanced mode, one cohort per group.
    Groups,
    /// Large basic runs split across worker partitions.
    Workers(Vec<Partition>),
}

impl RunPlan {
    pub fn for_config(config: &SimulationConfig, settings: &EngineSettings) -> Self {
        match &config.mode {
            SimulationMode::Basic(basic) if basic.device_count() >= settings.worker_threshold => {
                RunPlan::Workers(plan_partitions(
                    basic.device_start_number,
                    basic.device_end_number,
                    settings.effective_core_budget(),
                    settings.per_worker_cap,
                ))
            }
            SimulationMode::Basic(_) => RunPlan::InProcess,
            SimulationMode::Advanced(_) => RunPlan::Groups,
        }
    }
}

struct ActiveRun {
    sink: Arc<RunSink>,
    shutdown: watch::Sender<bool>,
    /// Session tasks keyed by client id.
    sessions: HashMap<String, Vec<JoinHandle<()>>>,
    workers: Vec<WorkerHandle>,
    observer: Option<Arc<LocalObserver>>,
    event_pump: Option<JoinHandle<()>>,
}

/// Runs one simulated fleet at a time.
pub struct FleetController {
    connector: Arc<dyn Connector>,
    settings: EngineSettings,
    state: Mutex<Option<ActiveRun>>,
    running: Arc<AtomicBool>,
    stats: Arc<StatisticsCollector>,
    cache: Arc<TemplateCache>,
}

impl FleetController {
    pub fn new(connector: Arc<dyn Connector>, settings: EngineSettings) -> Self {
        Self {
            stats: Arc::new(StatisticsCollector::with_window(settings.stats_window)),
            cache: Arc::new(TemplateCache::with_capacity(settings.template_capacity)),
            connector,
            settings,
            state: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Controller publishing to real brokers.
    pub fn with_mqtt(settings: EngineSettings) -> Self {
        Self::new(Arc::new(MqttConnector::new()), settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Current cumulative statistics.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.stats.get_snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Start a run reporting to `sink`.
    ///
    /// Returns once every session or worker has been spawned. A config that
    /// fails validation is rejected before anything starts.
    pub async fn start(&self, config: SimulationConfig, sink: Arc<dyn EventSink>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            TracingSink::wrap(sink).on_log(LogEntry::error("Simulation is already running"));
            return Err(SimError::AlreadyRunning);
        }

        if let Err(e) = config.validate() {
            TracingSink::wrap(sink).on_log(LogEntry::error(format!("Configuration error: {}", e)));
            return Err(SimError::Config(e));
        }

        let sink = Arc::new(RunSink::new(Arc::new(TracingSink::wrap(sink))));
        let run_sink: Arc<dyn EventSink> = sink.clone();
        self.stats.set_observer(run_sink);
        self.stats.reset();
        self.stats.set_total_devices(config.device_count());
        self.running.store(true, Ordering::Release);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut run = ActiveRun {
            sink,
            shutdown,
            sessions: HashMap::new(),
            workers: Vec::new(),
            observer: None,
            event_pump: None,
        };

        let plan = RunPlan::for_config(&config, &self.settings);
        info!(
            devices = config.device_count(),
            plan = plan_name(&plan),
            "Starting simulation"
        );
        match (plan, &config.mode) {
            (RunPlan::Workers(partitions), SimulationMode::Basic(basic)) => {
                self.start_workers(&mut run, &config, basic, partitions);
            }
            _ => self.start_sessions(&mut run, &config, shutdown_rx),
        }

        *state = Some(run);
        Ok(())
    }

    fn start_sessions(
        &self,
        run: &mut ActiveRun,
        config: &SimulationConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let observer = Arc::new(LocalObserver::new(
            run.sink.clone(),
            self.stats.clone(),
            self.running.clone(),
        ));
        let session_observer: Arc<dyn SessionObserver> = observer.clone();
        let timing = SessionTiming {
            log_sample_every: self.settings.log_sample_every,
            max_stagger: None,
            drift_threshold: self.settings.drift_threshold,
            drift_log_every: self.settings.drift_log_every,
        };

        let cohorts = cohorts(config, &self.cache);
        run.sink.on_log(LogEntry::info(format!(
            "Starting {} devices in {} cohort(s)",
            config.device_count(),
            cohorts.len()
        )));
        for cohort in &cohorts {
            run.sink.on_log(cohort_summary(cohort));
            let handles = spawn_cohort(
                cohort,
                &config.mqtt,
                timing,
                self.connector.as_ref(),
                &session_observer,
                &shutdown_rx,
            );
            for (client_id, handle) in handles {
                run.sessions.entry(client_id).or_default().push(handle);
            }
        }
        run.observer = Some(observer);
    }

    fn start_workers(
        &self,
        run: &mut ActiveRun,
        config: &SimulationConfig,
        basic: &BasicConfig,
        partitions: Vec<Partition>,
    ) {
        run.sink.on_log(LogEntry::info(format!(
            "Starting {} devices across {} workers",
            basic.device_count(),
            partitions.len()
        )));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        run.event_pump = Some(tokio::spawn(pump_worker_events(
            events_rx,
            run.sink.clone(),
            self.stats.clone(),
            self.running.clone(),
        )));

        for partition in partitions {
            let worker_id = partition.worker_id;
            let spawned = spawn_worker(
                worker_id,
                self.settings.clone(),
                self.connector.clone(),
                events_tx.clone(),
            )
            .and_then(|handle| {
                handle.start(PartitionConfig {
                    partition,
                    basic: basic.clone(),
                    mqtt: config.mqtt.clone(),
                    template_policy: config.template_policy,
                })?;
                Ok(handle)
            });
            match spawned {
                Ok(handle) => {
                    debug!(worker_id, start = partition.start, end = partition.end, "Worker spawned");
                    run.workers.push(handle);
                }
                Err(e) => run.sink.on_log(LogEntry::error(format!(
                    "[Worker {}] failed to start: {}",
                    worker_id, e
                ))),
            }
        }
    }

    /// Stop the active run. Does nothing when no run is active.
    pub async fn stop(&self) {
        // Held until teardown completes so a concurrent start waits for it.
        let mut state = self.state.lock().await;
        let Some(mut run) = state.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        run.sink.on_log(LogEntry::info("Stopping simulation..."));
        self.cache.clear();

        let _ = run.shutdown.send(true);
        let grace = self.settings.worker_grace;
        let workers = futures::future::join_all(
            run.workers
                .drain(..)
                .map(|worker| worker.shutdown(grace)),
        );
        let sessions = close_sessions(&mut run.sessions);
        let (stopped, ()) = futures::join!(workers, sessions);
        let terminated = stopped.iter().filter(|graceful| !**graceful).count();
        if terminated > 0 {
            warn!(terminated, "Workers terminated after grace period");
        }

        // Workers hang up their event senders on exit, which ends the pump
        // after their final stats deltas have been merged.
        if let Some(mut pump) = run.event_pump.take() {
            if tokio::time::timeout(grace, &mut pump).await.is_err() {
                pump.abort();
            }
        }
        if let Some(observer) = run.observer.take() {
            observer.clear();
        }
        self.stats.set_online_devices(0);
        self.stats.flush();

        run.sink.on_log(LogEntry::success("All devices stopped"));
        run.sink.close();
        self.stats.detach_observer();
        info!("Simulation stopped");
    }
}

async fn close_sessions(sessions: &mut HashMap<String, Vec<JoinHandle<()>>>) {
    let mut handles: Vec<JoinHandle<()>> = sessions.drain().flat_map(|(_, h)| h).collect();
    let joined = tokio::time::timeout(
        SESSION_CLOSE_TIMEOUT,
        futures::future::join_all(handles.iter_mut()),
    )
    .await;
    if joined.is_err() {
        warn!("Sessions did not close in time, aborting");
        for handle in &handles {
            handle.abort();
        }
    }
}

async fn pump_worker_events(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    sink: Arc<RunSink>,
    stats: Arc<StatisticsCollector>,
    running: Arc<AtomicBool>,
) {
    while let Some(WorkerEvent { worker_id, kind }) = events.recv().await {
        // Counters keep merging until the pump ends; logs stop with the run.
        let logging = running.load(Ordering::Acquire);
        match kind {
            WorkerEventKind::Ready if logging => {
                sink.on_log(LogEntry::success(format!("[Worker {}] ready", worker_id)));
            }
            WorkerEventKind::Log(entry) if logging => sink.on_log(entry),
            WorkerEventKind::Stats(delta) => stats.merge_worker_stats(delta),
            WorkerEventKind::DeviceOnline(delta) => stats.adjust_online_devices(delta),
            WorkerEventKind::MessageSize(size) => stats.set_message_size(size),
            WorkerEventKind::Faulted(reason) if logging => {
                sink.on_log(LogEntry::error(format!(
                    "[Worker {}] error: {}",
                    worker_id, reason
                )));
            }
            WorkerEventKind::Stopped => debug!(worker_id, "Worker stopped"),
            WorkerEventKind::Ready | WorkerEventKind::Log(_) | WorkerEventKind::Faulted(_) => {}
        }
    }
}

fn plan_name(plan: &RunPlan) -> &'static str {
    match plan {
        RunPlan::InProcess => "in-process",
        RunPlan::Groups => "groups",
        RunPlan::Workers(_) => "workers",
    }
}

fn cohort_summary(cohort: &Cohort) -> LogEntry {
    let cadence: Vec<String> = cohort
        .reports
        .iter()
        .map(|r| format!("{} every {}s", r.kind, r.period.as_secs_f64()))
        .collect();
    LogEntry::info(format!(
        "[{}] devices {}-{}, {}",
        cohort.label,
        cohort.range.start(),
        cohort.range.end(),
        cadence.join(", ")
    ))
}
