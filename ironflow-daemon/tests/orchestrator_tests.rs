//! Orchestrator integration tests.
//!
//! Tests the full flow: config -> pipeline start -> health check -> shutdown,
//! with a scripted mock pipeline and with the real UDP collector.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use ironflow_core::config::IronflowConfig;
use ironflow_core::error::{IronflowError, PipelineError};
use ironflow_core::pipeline::{HealthStatus, Pipeline};
use ironflow_daemon::orchestrator::{Orchestrator, PIPELINE_MODULE};

/// Counters shared between a test and its mock pipeline.
#[derive(Default)]
struct Calls {
    starts: AtomicUsize,
    stops: AtomicUsize,
    health_checks: AtomicUsize,
    running: AtomicBool,
}

struct MockPipeline {
    calls: Arc<Calls>,
    fail_start: bool,
    status: HealthStatus,
}

impl MockPipeline {
    fn new(calls: Arc<Calls>) -> Self {
        Self {
            calls,
            fail_start: false,
            status: HealthStatus::Healthy,
        }
    }
}

impl Pipeline for MockPipeline {
    async fn start(&mut self) -> Result<(), IronflowError> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(PipelineError::InitFailed("port in use".to_owned()).into());
        }
        self.calls.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), IronflowError> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        self.calls.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        self.calls.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.calls.running.load(Ordering::SeqCst) {
            self.status.clone()
        } else {
            HealthStatus::Unhealthy("not started".to_owned())
        }
    }
}

/// Helper function to create a minimal test config.
fn minimal_test_config() -> IronflowConfig {
    let toml_str = r#"
[general]
log_level = "info"
pid_file = ""

[metrics]
enabled = false
"#;
    IronflowConfig::parse(toml_str).expect("failed to parse minimal config")
}

/// Pick two distinct free UDP ports on loopback.
fn free_ports() -> (u16, u16) {
    let a = UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").unwrap();
    (
        a.local_addr().unwrap().port(),
        b.local_addr().unwrap().port(),
    )
}

/// NetFlow v5 datagram with a single TCP record.
fn v5_packet() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&5u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&60_000u32.to_be_bytes());
    buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2, 0, 0, 0, 0]);
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&2u16.to_be_bytes());
    buf.extend_from_slice(&3u32.to_be_bytes());
    buf.extend_from_slice(&1500u32.to_be_bytes());
    buf.extend_from_slice(&50_000u32.to_be_bytes());
    buf.extend_from_slice(&59_000u32.to_be_bytes());
    buf.extend_from_slice(&40000u16.to_be_bytes());
    buf.extend_from_slice(&443u16.to_be_bytes());
    buf.extend_from_slice(&[0, 0x18, 6, 0]);
    buf.extend_from_slice(&[0, 0, 0, 0, 24, 24, 0, 0]);
    buf
}

#[tokio::test]
async fn test_health_before_start_is_unhealthy() {
    // Given: An orchestrator around a pipeline that was never started
    let calls = Arc::new(Calls::default());
    let orchestrator = Orchestrator::with_pipeline(
        minimal_test_config(),
        Box::new(MockPipeline::new(Arc::clone(&calls))),
    )
    .unwrap();

    // When: Checking health
    let health = orchestrator.health().await;

    // Then: The pipeline module reports unhealthy
    assert!(health.status.is_unhealthy());
    assert_eq!(health.modules.len(), 1);
    assert_eq!(health.modules[0].name, PIPELINE_MODULE);
    assert!(health.metrics.is_none());
}

#[tokio::test]
async fn test_run_until_starts_and_stops_pipeline() {
    // Given: A mock pipeline
    let calls = Arc::new(Calls::default());
    let mut orchestrator = Orchestrator::with_pipeline(
        minimal_test_config(),
        Box::new(MockPipeline::new(Arc::clone(&calls))),
    )
    .unwrap();

    // When: Running until an immediate shutdown
    orchestrator
        .run_until(async { Ok("TEST") })
        .await
        .expect("run should succeed");

    // Then: start and stop are each called once
    assert_eq!(calls.starts.load(Ordering::SeqCst), 1);
    assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
    assert!(!calls.running.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_start_failure_is_reported_and_pid_file_removed() {
    // Given: A pipeline that fails to start and a PID file path
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("ironflow.pid");
    let mut config = minimal_test_config();
    config.general.pid_file = pid_path.display().to_string();

    let calls = Arc::new(Calls::default());
    let mut pipeline = MockPipeline::new(Arc::clone(&calls));
    pipeline.fail_start = true;
    let mut orchestrator = Orchestrator::with_pipeline(config, Box::new(pipeline)).unwrap();

    // When: Running
    let result = orchestrator.run_until(async { Ok("TEST") }).await;

    // Then: The error surfaces, stop is never called and the PID file is gone
    let err = result.unwrap_err().to_string();
    assert!(err.contains("failed to start"), "got: {err}");
    assert_eq!(calls.stops.load(Ordering::SeqCst), 0);
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_pid_file_exists_while_running() {
    // Given: A PID file path in a fresh directory
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("run").join("ironflow.pid");
    let mut config = minimal_test_config();
    config.general.pid_file = pid_path.display().to_string();

    let calls = Arc::new(Calls::default());
    let mut orchestrator =
        Orchestrator::with_pipeline(config, Box::new(MockPipeline::new(calls))).unwrap();

    // When: The shutdown future observes the file system while running
    let observed = pid_path.clone();
    orchestrator
        .run_until(async move {
            assert!(observed.exists(), "PID file should exist while running");
            let pid = std::fs::read_to_string(&observed).unwrap();
            assert_eq!(pid.trim().parse::<u32>().unwrap(), std::process::id());
            Ok("TEST")
        })
        .await
        .unwrap();

    // Then: The file is removed on shutdown
    assert!(!pid_path.exists());
}

#[tokio::test]
async fn test_existing_pid_file_blocks_start() {
    // Given: A PID file left by another instance
    let dir = tempfile::tempdir().unwrap();
    let pid_path = dir.path().join("ironflow.pid");
    std::fs::write(&pid_path, "4242\n").unwrap();
    let mut config = minimal_test_config();
    config.general.pid_file = pid_path.display().to_string();

    let calls = Arc::new(Calls::default());
    let mut orchestrator =
        Orchestrator::with_pipeline(config, Box::new(MockPipeline::new(Arc::clone(&calls))))
            .unwrap();

    // When: Running
    let result = orchestrator.run_until(async { Ok("TEST") }).await;

    // Then: The pipeline is never started and the foreign file is kept
    assert!(result.is_err());
    assert_eq!(calls.starts.load(Ordering::SeqCst), 0);
    assert!(pid_path.exists());
}

#[tokio::test]
async fn test_signal_error_still_stops_pipeline() {
    // Given: A shutdown future that fails
    let calls = Arc::new(Calls::default());
    let mut orchestrator = Orchestrator::with_pipeline(
        minimal_test_config(),
        Box::new(MockPipeline::new(Arc::clone(&calls))),
    )
    .unwrap();

    // When: Running
    let result = orchestrator
        .run_until(async { Err(anyhow::anyhow!("signal handler unavailable")) })
        .await;

    // Then: The error is returned after a clean stop
    assert!(result.is_err());
    assert_eq!(calls.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_health_ticker_polls_pipeline() {
    // Given: A short health interval and a degraded pipeline
    let calls = Arc::new(Calls::default());
    let mut pipeline = MockPipeline::new(Arc::clone(&calls));
    pipeline.status = HealthStatus::Degraded("worker queue 95% full".to_owned());
    let mut orchestrator = Orchestrator::with_pipeline(minimal_test_config(), Box::new(pipeline))
        .unwrap()
        .with_health_interval(Duration::from_millis(10));

    // When: Running for a while
    orchestrator
        .run_until(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok("TEST")
        })
        .await
        .unwrap();

    // Then: The pipeline was polled by the ticker
    assert!(calls.health_checks.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    // Given: A config with an unknown log level
    let mut config = minimal_test_config();
    config.general.log_level = "verbose".to_owned();

    // When: Building
    let result =
        Orchestrator::with_pipeline(config, Box::new(MockPipeline::new(Arc::default())));

    // Then: Validation fails before anything starts
    assert!(result.is_err());
}

#[tokio::test]
async fn test_real_pipeline_collects_netflow_v5() {
    // Given: The real collector on free loopback ports
    let (netflow_port, sflow_port) = free_ports();
    let mut config = minimal_test_config();
    config.collector.bind_address = "127.0.0.1".to_owned();
    config.collector.netflow_port = netflow_port;
    config.collector.sflow_port = sflow_port;
    config.batch.min_size = 1;
    config.batch.initial_size = 1;
    config.batch.max_wait_ms = 20;
    config.workers.count = 2;

    let mut orchestrator = Orchestrator::build_from_config(config).expect("build should succeed");
    assert!(orchestrator.health().await.status.is_unhealthy());

    // When: A NetFlow v5 datagram arrives while running
    orchestrator
        .run_until(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
            sender
                .send_to(&v5_packet(), ("127.0.0.1", netflow_port))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok("TEST")
        })
        .await
        .expect("run should succeed");

    // Then: The counters survive the stop and reflect the datagram
    let health = orchestrator.health().await;
    let metrics = health.metrics.expect("real pipeline exposes counters");
    assert_eq!(metrics.packets_received, 1);
    assert_eq!(metrics.flows_decoded, 1);
    assert_eq!(metrics.records_accepted, 1);
    assert!(health.status.is_unhealthy(), "stopped pipeline is unhealthy");
}
