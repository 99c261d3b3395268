//! Worker partition runs against the in-memory broker.
//!
//! Workers run their own runtimes on OS threads, so these tests use the
//! real clock with short intervals.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{MemoryConnector, RecordingSink};
use fleetsim_core::{BasicConfig, EngineSettings, MqttSettings, SimulationConfig};
use fleetsim_devices::{FleetController, RunPlan};

fn settings() -> EngineSettings {
    EngineSettings {
        worker_threshold: 4,
        per_worker_cap: 2,
        core_budget: Some(2),
        max_stagger: Duration::ZERO,
        stats_window: Duration::from_millis(50),
        ..EngineSettings::default()
    }
}

fn config() -> SimulationConfig {
    let mut basic = BasicConfig::new(1, 4, 5);
    basic.send_interval = 0.1;
    SimulationConfig::basic(MqttSettings::new("localhost", "telemetry"), basic)
}

#[test]
fn test_threshold_selects_worker_plan() {
    match RunPlan::for_config(&config(), &settings()) {
        RunPlan::Workers(partitions) => {
            assert_eq!(partitions.len(), 2);
            assert_eq!(partitions[0].range(), 1..=2);
            assert_eq!(partitions[1].range(), 3..=4);
        }
        other => panic!("unexpected plan: {:?}", other),
    }

    let mut small = config();
    if let fleetsim_core::SimulationMode::Basic(basic) = &mut small.mode {
        basic.device_end_number = 3;
    }
    assert_eq!(RunPlan::for_config(&small, &settings()), RunPlan::InProcess);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_run_covers_every_device() {
    let connector = MemoryConnector::new();
    let controller = FleetController::new(Arc::new(connector.clone()), settings());
    let sink = RecordingSink::new();

    controller.start(config(), sink.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    controller.stop().await;

    let published = connector.published();
    let clients: BTreeSet<String> = published.iter().map(|p| p.client_id.clone()).collect();
    assert_eq!(clients.len(), 4);
    assert!(clients.contains("device01"));
    assert!(clients.contains("device04"));
    assert_eq!(connector.closed(), 4);

    let messages = sink.messages();
    assert!(messages.contains(&"[Worker 0] ready".to_string()));
    assert!(messages.contains(&"[Worker 1] ready".to_string()));
    assert!(messages.contains(&"[Worker 1] started 2 devices (3-4)".to_string()));
    assert_eq!(messages.last().map(String::as_str), Some("All devices stopped"));

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.total_devices, 4);
    assert_eq!(snapshot.online_devices, 0);
    assert!(snapshot.success_count > 0);
    assert!(snapshot.success_count <= published.len() as u64);
    assert!(snapshot.message_size.is_some());

    let events = sink.event_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.event_count(), events);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_workers_are_terminated_after_grace() {
    let connector = MemoryConnector::new();
    let settings = EngineSettings {
        worker_grace: Duration::from_millis(200),
        ..settings()
    };
    let controller = FleetController::new(Arc::new(connector.clone()), settings);
    let sink = RecordingSink::new();

    controller.start(config(), sink.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    connector.hang_on_close(true);

    let stopping = std::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(5), controller.stop())
        .await
        .expect("stop must not wait on stuck workers");
    assert!(stopping.elapsed() >= Duration::from_millis(200));
    assert!(!controller.is_running());
    assert_eq!(connector.closed(), 0);

    let messages = sink.messages();
    assert!(!messages.iter().any(|m| m.ends_with("] stopped")));
    assert_eq!(messages.last().map(String::as_str), Some("All devices stopped"));

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.online_devices, 0);
    assert_eq!(snapshot.total_devices, 4);
    assert!(snapshot.success_count <= connector.published().len() as u64);
    assert_eq!(
        snapshot.total_messages,
        snapshot.success_count + snapshot.failure_count
    );

    let events = sink.event_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.event_count(), events);
    assert_eq!(sink.snapshots().last(), Some(&snapshot));
}
