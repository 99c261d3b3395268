//! Command-line interface for the fleetsim device-fleet simulator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetsim_core::{
    env_vars, EngineSettings, EventBus, SimulationConfig, SimulationEvent, StatisticsSnapshot,
};
use fleetsim_devices::{cohorts, MqttConnector, RunPlan, SimulationRegistry};
use fleetsim_payload::TemplateCache;
use tracing::info;

/// fleetsim - Simulate fleets of MQTT telemetry devices.
#[derive(Parser, Debug)]
#[command(name = "fleetsim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a simulation until Ctrl-C or the given duration.
    Run {
        /// Path to the JSON simulation config.
        #[arg(short, long)]
        config: PathBuf,
        /// Stop after this many seconds.
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Check a config without connecting to the broker.
    Validate {
        /// Path to the JSON simulation config.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print one sample payload per report.
    Preview {
        /// Path to the JSON simulation config.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Run { config, duration } => run(&config, duration.map(Duration::from_secs)).await,
        Command::Validate { config } => validate(&config),
        Command::Preview { config } => preview(&config),
    }
}

fn init_tracing(verbose: bool) {
    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "fleetsim=debug" } else { "fleetsim=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

fn load_config(path: &Path) -> Result<SimulationConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    SimulationConfig::from_json(&text)
        .with_context(|| format!("Failed to parse config {}", path.display()))
}

fn load_valid_config(path: &Path) -> Result<SimulationConfig> {
    let config = load_config(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn validate(path: &Path) -> Result<()> {
    let config = load_valid_config(path)?;
    let settings = EngineSettings::from_env();
    let hosting = match RunPlan::for_config(&config, &settings) {
        RunPlan::InProcess => "in-process".to_string(),
        RunPlan::Groups => "in-process, one cohort per group".to_string(),
        RunPlan::Workers(partitions) => format!("{} worker partitions", partitions.len()),
    };
    println!(
        "Configuration OK: {} devices publishing to {} on {} ({})",
        config.device_count(),
        config.mqtt.topic,
        config.mqtt.broker_addr(),
        hosting
    );
    Ok(())
}

fn preview(path: &Path) -> Result<()> {
    let config = load_valid_config(path)?;
    let cache = Arc::new(TemplateCache::new());
    for cohort in cohorts(&config, &cache) {
        for report in &cohort.reports {
            let sample = report.plan.source().sample();
            println!("# {} ({} report)", cohort.label, report.kind);
            println!(
                "{}",
                serde_json::to_string_pretty(&sample).context("Failed to render sample")?
            );
        }
    }
    Ok(())
}

async fn run(path: &Path, duration: Option<Duration>) -> Result<()> {
    let config = load_config(path)?;
    let bus = EventBus::with_name("fleetsim");
    let mut events = bus.subscribe();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let SimulationEvent::Stats(snapshot) = event {
                println!("{}", stats_line(&snapshot));
            }
        }
    });

    let registry = SimulationRegistry::new(Arc::new(MqttConnector::new()), EngineSettings::from_env());
    let (run_id, controller) = registry.create();
    controller
        .start(config, Arc::new(bus.clone()))
        .await
        .with_context(|| format!("Failed to start run {}", run_id))?;
    info!(run_id = %run_id, "Simulation running, press Ctrl-C to stop");

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Interrupted");
        }
        _ = deadline => info!("Duration elapsed"),
    }

    registry.stop_all().await;
    printer.abort();

    let summary = controller.snapshot();
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to render summary")?
    );
    Ok(())
}

fn stats_line(snapshot: &StatisticsSnapshot) -> String {
    format!(
        "online {}/{} | sent {} (ok {}, failed {}) | success {:.2}% | avg latency {:.2}ms",
        snapshot.online_devices,
        snapshot.total_devices,
        snapshot.total_messages,
        snapshot.success_count,
        snapshot.failure_count,
        snapshot.success_rate,
        snapshot.avg_latency_ms
    )
}
