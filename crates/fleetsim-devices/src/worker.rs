//! Worker partitions for large basic-mode runs.
//!
//! Each worker is an OS thread running its own single-threaded runtime. It
//! hosts the sessions of one contiguous slice of the device range and talks
//! to the controller only through message channels: commands in, events
//! out. Statistics leave a worker as batched deltas.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleetsim_core::{
    BasicConfig, EngineSettings, LogEntry, MqttSettings, Result, SimError, StatsDelta,
    TemplatePolicy,
};
use fleetsim_payload::TemplateCache;

use crate::cohort::{use_template_cache, Cohort};
use crate::link::Connector;
use crate::observer::SessionObserver;
use crate::partition::Partition;
use crate::session::{spawn_cohort, SessionTiming};

/// Interval of the periodic stats flush inside a worker.
pub const WORKER_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Latency is sampled on every Nth success inside a worker.
const LATENCY_SAMPLE_EVERY: u64 = 10;

/// Everything a worker needs to run its slice.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    pub partition: Partition,
    pub basic: BasicConfig,
    pub mqtt: MqttSettings,
    pub template_policy: TemplatePolicy,
}

/// Controller to worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Start(Box<PartitionConfig>),
    Stop,
}

/// Worker to controller.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub worker_id: usize,
    pub kind: WorkerEventKind,
}

#[derive(Debug, Clone)]
pub enum WorkerEventKind {
    /// The worker's runtime is up and accepting commands.
    Ready,
    Log(LogEntry),
    Stats(StatsDelta),
    /// Change in online devices, `+1` or `-1`.
    DeviceOnline(i64),
    MessageSize(usize),
    /// The worker could not start or panicked.
    Faulted(String),
    Stopped,
}

impl WorkerEvent {
    pub fn new(worker_id: usize, kind: WorkerEventKind) -> Self {
        Self { worker_id, kind }
    }
}

/// Controller-side handle of a worker thread.
pub struct WorkerHandle {
    worker_id: usize,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    kill: watch::Sender<bool>,
    exited: Option<oneshot::Receiver<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Hand the worker its partition.
    pub fn start(&self, config: PartitionConfig) -> Result<()> {
        self.commands
            .send(WorkerCommand::Start(Box::new(config)))
            .map_err(|_| SimError::Worker {
                worker_id: self.worker_id,
                message: "worker is not accepting commands".to_string(),
            })
    }

    /// Ask the worker to stop, terminating it if it has not exited within
    /// `grace`. Returns whether it stopped on its own.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let _ = self.commands.send(WorkerCommand::Stop);

        let graceful = match self.exited.take() {
            Some(exited) => matches!(tokio::time::timeout(grace, exited).await, Ok(Ok(()))),
            None => true,
        };
        let _ = self.kill.send(true);
        if !graceful {
            warn!(worker_id = self.worker_id, "Worker did not stop in time, terminated");
        }
        // The thread exits on its own once its runtime is torn down.
        drop(self.thread.take());
        graceful
    }
}

/// Spawn worker `worker_id` on its own thread.
pub fn spawn_worker(
    worker_id: usize,
    settings: EngineSettings,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerHandle> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (kill_tx, mut kill_rx) = watch::channel(false);
    let (exited_tx, exited_rx) = oneshot::channel();

    let thread = std::thread::Builder::new()
        .name(format!("fleetsim-worker-{}", worker_id))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to build worker runtime");
                    let _ = events.send(WorkerEvent::new(
                        worker_id,
                        WorkerEventKind::Faulted(e.to_string()),
                    ));
                    let _ = exited_tx.send(());
                    return;
                }
            };

            let context = WorkerContext {
                worker_id,
                settings,
                connector,
                events: events.clone(),
            };
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                runtime.block_on(async {
                    tokio::select! {
                        _ = kill_rx.wait_for(|killed| *killed) => {
                            debug!(worker_id, "Worker terminated");
                        }
                        _ = worker_main(context, command_rx) => {}
                    }
                })
            }));
            if let Err(panic) = outcome {
                let message = panic_message(&*panic);
                error!(worker_id, panic = %message, "Worker panicked");
                let _ = events.send(WorkerEvent::new(
                    worker_id,
                    WorkerEventKind::Faulted(message),
                ));
            }

            runtime.shutdown_background();
            let _ = exited_tx.send(());
        })?;

    Ok(WorkerHandle {
        worker_id,
        commands: command_tx,
        kill: kill_tx,
        exited: Some(exited_rx),
        thread: Some(thread),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct WorkerContext {
    worker_id: usize,
    settings: EngineSettings,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl WorkerContext {
    fn send(&self, kind: WorkerEventKind) {
        let _ = self.events.send(WorkerEvent::new(self.worker_id, kind));
    }

    fn log(&self, entry: LogEntry) {
        self.send(WorkerEventKind::Log(entry));
    }
}

async fn worker_main(context: WorkerContext, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
    context.send(WorkerEventKind::Ready);
    let mut active: Option<ActivePartition> = None;

    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Start(config) => {
                if active.is_some() {
                    warn!(worker_id = context.worker_id, "Worker already has a partition");
                    continue;
                }
                active = Some(ActivePartition::start(&context, *config));
            }
            WorkerCommand::Stop => break,
        }
    }

    if let Some(partition) = active.take() {
        partition.stop().await;
    }
    context.log(LogEntry::info(format!("[Worker {}] stopped", context.worker_id)));
    context.send(WorkerEventKind::Stopped);
}

struct ActivePartition {
    shutdown: watch::Sender<bool>,
    sessions: Vec<JoinHandle<()>>,
    observer: Arc<WorkerObserver>,
    cache: Arc<TemplateCache>,
    flusher: JoinHandle<()>,
}

impl ActivePartition {
    fn start(context: &WorkerContext, config: PartitionConfig) -> Self {
        let PartitionConfig {
            partition,
            basic,
            mut mqtt,
            template_policy,
        } = config;
        let settings = &context.settings;

        let cache = Arc::new(TemplateCache::with_capacity(settings.template_capacity));
        let cached = use_template_cache(template_policy, true).then(|| cache.clone());
        let mut cohort = Cohort::basic(&basic, cached);
        cohort.range = partition.range();
        // The first partition logs the sample payload for the whole run.
        cohort
            .preview_logged
            .store(partition.worker_id != 0, Ordering::Release);

        mqtt.connect_timeout_secs = settings.worker_connect_timeout.as_secs().max(1);
        let timing = SessionTiming {
            log_sample_every: settings.log_sample_every,
            max_stagger: Some(settings.max_stagger),
            drift_threshold: settings.drift_threshold,
            drift_log_every: settings.drift_log_every,
        };

        let observer = Arc::new(WorkerObserver::new(
            context.worker_id,
            context.events.clone(),
            settings.stats_batch_success,
            settings.stats_batch_failure,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            worker_id = context.worker_id,
            start = partition.start,
            end = partition.end,
            "Starting partition"
        );
        let session_observer: Arc<dyn SessionObserver> = observer.clone();
        let sessions = spawn_cohort(
            &cohort,
            &mqtt,
            timing,
            context.connector.as_ref(),
            &session_observer,
            &shutdown_rx,
        )
        .into_iter()
        .map(|(_, handle)| handle)
        .collect::<Vec<_>>();

        context.log(LogEntry::info(format!(
            "[Worker {}] started {} devices ({}-{})",
            context.worker_id,
            sessions.len(),
            partition.start,
            partition.end
        )));

        let flusher = {
            let observer = observer.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(WORKER_FLUSH_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    observer.flush();
                }
            })
        };

        Self {
            shutdown,
            sessions,
            observer,
            cache,
            flusher,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        futures::future::join_all(self.sessions).await;
        self.flusher.abort();
        self.observer.flush();
        self.observer.stop();
        self.cache.clear();
    }
}

#[derive(Debug, Default)]
struct Batch {
    delta: StatsDelta,
    successes: u64,
    last_size: Option<usize>,
}

/// Session observer inside a worker. Batches counters into deltas.
struct WorkerObserver {
    worker_id: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
    running: AtomicBool,
    batch: Mutex<Batch>,
    batch_success: u64,
    batch_failure: u64,
}

impl WorkerObserver {
    fn new(
        worker_id: usize,
        events: mpsc::UnboundedSender<WorkerEvent>,
        batch_success: u64,
        batch_failure: u64,
    ) -> Self {
        Self {
            worker_id,
            events,
            running: AtomicBool::new(true),
            batch: Mutex::new(Batch::default()),
            batch_success: batch_success.max(1),
            batch_failure: batch_failure.max(1),
        }
    }

    fn send(&self, kind: WorkerEventKind) {
        let _ = self.events.send(WorkerEvent::new(self.worker_id, kind));
    }

    /// Send whatever is batched.
    fn flush(&self) {
        let delta = std::mem::take(&mut self.batch.lock().delta);
        if !delta.is_empty() {
            self.send(WorkerEventKind::Stats(delta));
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn take_if(&self, full: impl FnOnce(&StatsDelta) -> bool) -> Option<StatsDelta> {
        let mut batch = self.batch.lock();
        full(&batch.delta).then(|| std::mem::take(&mut batch.delta))
    }
}

impl SessionObserver for WorkerObserver {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn log(&self, entry: LogEntry) {
        if self.is_running() {
            self.send(WorkerEventKind::Log(entry));
        }
    }

    fn connected(&self, _client_id: &str) {
        self.send(WorkerEventKind::DeviceOnline(1));
    }

    fn disconnected(&self, _client_id: &str) {
        self.send(WorkerEventKind::DeviceOnline(-1));
    }

    fn published(&self, latency: Option<Duration>) {
        {
            let mut batch = self.batch.lock();
            batch.successes += 1;
            let sample = batch.successes % LATENCY_SAMPLE_EVERY == 0;
            batch.delta.success_count += 1;
            if let Some(latency) = latency.filter(|l| sample && !l.is_zero()) {
                batch.delta.latency_total_ms += latency.as_secs_f64() * 1000.0;
                batch.delta.latency_samples += 1;
            }
        }
        let threshold = self.batch_success;
        if let Some(delta) = self.take_if(|d| d.success_count >= threshold) {
            self.send(WorkerEventKind::Stats(delta));
        }
    }

    fn publish_failed(&self, count: u64) {
        self.batch.lock().delta.failure_count += count;
        let threshold = self.batch_failure;
        if let Some(delta) = self.take_if(|d| d.failure_count >= threshold) {
            self.send(WorkerEventKind::Stats(delta));
        }
    }

    fn message_built(&self, _group: Option<&str>, size: usize) {
        let changed = {
            let mut batch = self.batch.lock();
            let changed = batch.last_size != Some(size);
            batch.last_size = Some(size);
            changed
        };
        if changed {
            self.send(WorkerEventKind::MessageSize(size));
        }
    }
}
