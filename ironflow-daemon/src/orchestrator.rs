//! Daemon orchestration -- assembly, lifecycle and periodic health reporting.
//!
//! The [`Orchestrator`] builds the flow pipeline from a validated
//! `IronflowConfig`, installs the Prometheus recorder, starts the pipeline,
//! logs aggregated health on a fixed interval, and stops the pipeline on
//! SIGINT/SIGTERM.
//!
//! # Shutdown Order
//!
//! 1. Stop background daemon tasks (uptime gauge)
//! 2. Stop the pipeline: listeners flush partial batches, the worker pool
//!    drains with its deadline, then the device refresher stops
//! 3. Remove the PID file

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use ironflow_core::config::IronflowConfig;
use ironflow_core::metrics as m;
use ironflow_core::pipeline::DynPipeline;
use ironflow_pipeline::{FlowPipelineBuilder, PipelineConfig, SnapshotSource};

use crate::health::{DaemonHealth, ModuleHealth, aggregate_status, log_health};
use crate::metrics_server;
use crate::pid::PidFile;

/// Interval between aggregated health log lines.
pub const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between uptime gauge updates.
const UPTIME_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Module name used in health reports.
pub const PIPELINE_MODULE: &str = "flow-pipeline";

/// The main daemon orchestrator.
pub struct Orchestrator {
    /// Loaded and validated configuration.
    config: IronflowConfig,
    /// The collector pipeline.
    pipeline: Box<dyn DynPipeline>,
    /// Counter source for health reports (absent for injected pipelines).
    snapshot: Option<SnapshotSource>,
    /// Shutdown broadcast for daemon background tasks.
    shutdown_tx: broadcast::Sender<()>,
    /// Daemon start time (for uptime reporting).
    start_time: Instant,
    /// Health log interval.
    health_interval: Duration,
}

impl Orchestrator {
    /// Load configuration from a file and build the orchestrator.
    ///
    /// Applies `IRONFLOW_*` environment overrides and validates.
    pub async fn build(config_path: &Path) -> Result<Self> {
        let config = IronflowConfig::load(config_path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
        Self::build_from_config(config)
    }

    /// Build from an already-loaded configuration.
    ///
    /// Installs the metrics recorder when `metrics.enabled` is set. The
    /// recorder is process-global, so this succeeds once per process when
    /// metrics are enabled.
    pub fn build_from_config(config: IronflowConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

        if config.metrics.enabled {
            metrics_server::install_metrics_recorder(&config.metrics)?;
        }

        let pipeline_config = PipelineConfig::from_core(&config)
            .map_err(|e| anyhow::anyhow!("invalid pipeline config: {}", e))?;
        tracing::info!(
            listen = ?pipeline_config.listen_addrs,
            workers = pipeline_config.workers,
            backpressure = ?pipeline_config.backpressure,
            static_devices = pipeline_config.static_devices.len(),
            "initializing flow pipeline"
        );

        let pipeline = FlowPipelineBuilder::new()
            .config(pipeline_config)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build flow pipeline: {}", e))?;
        let snapshot = pipeline.snapshot_source();

        if config.metrics.enabled {
            record_daemon_metrics();
        }

        let mut orchestrator = Self::with_pipeline(config, Box::new(pipeline))?;
        orchestrator.snapshot = Some(snapshot);
        Ok(orchestrator)
    }

    /// Build around an externally constructed pipeline.
    ///
    /// Does not install the metrics recorder.
    pub fn with_pipeline(config: IronflowConfig, pipeline: Box<dyn DynPipeline>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;
        let (shutdown_tx, _) = broadcast::channel(4);
        Ok(Self {
            config,
            pipeline,
            snapshot: None,
            shutdown_tx,
            start_time: Instant::now(),
            health_interval: HEALTH_LOG_INTERVAL,
        })
    }

    /// Override the health log interval.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Start the pipeline and block until SIGINT or SIGTERM.
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(wait_for_shutdown_signal()).await
    }

    /// Start the pipeline and block until `shutdown` resolves.
    ///
    /// The pipeline is stopped and the PID file removed even when `shutdown`
    /// resolves to an error.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<&'static str>>,
    {
        let pid_file = match self.config.general.pid_file.as_str() {
            "" => None,
            path => Some(PidFile::create(path)?),
        };

        tracing::info!("starting flow pipeline");
        if let Err(e) = self.pipeline.start().await {
            tracing::error!(error = %e, "flow pipeline failed to start");
            if let Some(pid_file) = pid_file {
                pid_file.remove();
            }
            return Err(anyhow::anyhow!("failed to start flow pipeline: {}", e));
        }

        let uptime_task = self
            .config
            .metrics
            .enabled
            .then(|| spawn_uptime_updater(self.start_time, self.shutdown_tx.subscribe()));

        let mut ticker = tokio::time::interval(self.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        tokio::pin!(shutdown);
        tracing::info!("ironflow-daemon running");
        let signal = loop {
            tokio::select! {
                signal = &mut shutdown => break signal,
                _ = ticker.tick() => log_health(&self.health().await),
            }
        };
        match &signal {
            Ok(name) => tracing::info!(signal = *name, "shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "shutdown signal handling failed, shutting down"),
        }

        let _ = self.shutdown_tx.send(());
        if let Some(task) = uptime_task {
            let _ = task.await;
        }

        tracing::info!("stopping flow pipeline");
        let stopped = self.pipeline.stop().await;
        if let Some(snapshot) = &self.snapshot {
            let final_stats = snapshot.snapshot();
            tracing::info!(
                packets = final_stats.packets_received,
                flows = final_stats.flows_decoded,
                batches = final_stats.batches_flushed,
                batches_dropped = final_stats.batches_dropped,
                "final collector statistics"
            );
        }

        if let Some(pid_file) = pid_file {
            pid_file.remove();
        }

        stopped.map_err(|e| anyhow::anyhow!("failed to stop flow pipeline: {}", e))?;
        signal.map(|_| ())
    }

    /// Get the current aggregated health status.
    pub async fn health(&self) -> DaemonHealth {
        let modules = vec![ModuleHealth {
            name: PIPELINE_MODULE.to_owned(),
            enabled: true,
            status: self.pipeline.health_check().await,
        }];
        let uptime_secs = self.start_time.elapsed().as_secs();

        if self.config.metrics.enabled {
            metrics::gauge!(m::DAEMON_UPTIME_SECONDS).set(uptime_secs as f64);
        }

        DaemonHealth {
            status: aggregate_status(&modules),
            uptime_secs,
            modules,
            metrics: self.snapshot.as_ref().map(SnapshotSource::snapshot),
        }
    }

    /// Get a reference to the loaded configuration.
    pub fn config(&self) -> &IronflowConfig {
        &self.config
    }
}

/// Wait for SIGTERM or SIGINT and return the signal name.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("failed to install SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to install Ctrl+C handler: {}", e))?;
    Ok("CTRL_C")
}

/// Record build info once at startup.
fn record_daemon_metrics() {
    metrics::gauge!(m::DAEMON_BUILD_INFO, "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "daemon metrics recorded");
}

/// Periodically refresh the uptime gauge for Prometheus scrapes.
fn spawn_uptime_updater(
    start_time: Instant,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPTIME_UPDATE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics::gauge!(m::DAEMON_UPTIME_SECONDS)
                        .set(start_time.elapsed().as_secs() as f64);
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("uptime updater shutting down");
                    break;
                }
            }
        }
    })
}
