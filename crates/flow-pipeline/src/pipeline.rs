//! 파이프라인 오케스트레이션 -- 수신/디코드/검증/배치/플러시의 전체 흐름을 관리합니다.
//!
//! [`FlowPipeline`]은 core의 [`Pipeline`](ironflow_core::pipeline::Pipeline) trait을 구현하여
//! `ironflow-daemon`에서 시작/정지/헬스 체크 생명주기로 관리됩니다.
//!
//! # 내부 아키텍처
//! ```text
//! UdpListener(포트별) -> Dispatcher -> Decoder -> DeviceCache -> Validator -> BatchAccumulator
//!                                                                                  |
//!                              ForwardHub <- WorkerPool <- bounded queue <---------+
//!                                               |
//!                                           FlowSink
//! ```
//!
//! 백그라운드 태스크:
//! - 디바이스 메타데이터 갱신 (bounded 큐)
//! - 유지보수: 템플릿 만료 스윕, 캐시 메모리 압력 샘플링, 초당 패킷 수 게이지

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ironflow_core::error::{IronflowError, PipelineError};
use ironflow_core::metrics as m;
use ironflow_core::pipeline::{FlowSink, HealthStatus, Pipeline};
use ironflow_core::types::{ExporterKey, FlowBatch};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::{AdaptiveBatchSize, BatchAccumulator};
use crate::collector::{bind_udp, CollectorStatus, UdpListener};
use crate::config::PipelineConfig;
use crate::device_cache::{
    spawn_refresher, DeviceCache, DeviceCacheSettings, DeviceResolver, StaticResolver,
};
use crate::dispatcher::ProtocolDispatcher;
use crate::error::FlowPipelineError;
use crate::forward::{ForwardFilter, ForwardHub};
use crate::ingest::PacketProcessor;
use crate::sink::LogSink;
use crate::stats::{CollectorStats, MetricsSnapshot, SnapshotSource};
use crate::template::TemplateManager;
use crate::validator::RecordValidator;
use crate::worker::{DrainReport, PoolHandle, WorkerPool, WorkerSettings};

/// 큐 사용률이 이 값을 넘으면 Degraded
const QUEUE_DEGRADED_RATIO: f64 = 0.9;

/// 최근 실패 비율이 이 값을 넘으면 Degraded
const ERROR_RATE_DEGRADED: f64 = 0.5;

/// 초당 패킷 수 샘플링 간격
const RATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// 파이프라인 실행 상태
#[derive(Debug, Clone, PartialEq, Eq)]
enum PipelineState {
    /// 초기화됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 수신 태스크 정보
struct ListenerTask {
    addr: SocketAddr,
    status: Arc<Mutex<CollectorStatus>>,
    handle: JoinHandle<u64>,
}

/// 플로우 수집 파이프라인
///
/// # 사용 예시
/// ```ignore
/// use ironflow_pipeline::{FlowPipelineBuilder, MemorySink};
///
/// let mut pipeline = FlowPipelineBuilder::new()
///     .config(config)
///     .sink(Arc::new(MemorySink::new()))
///     .build()?;
///
/// let mut forward_rx = pipeline.subscribe(ForwardFilter::all());
/// pipeline.start().await?;
/// ```
pub struct FlowPipeline {
    config: PipelineConfig,
    state: PipelineState,
    sink: Arc<dyn FlowSink>,
    templates: Arc<TemplateManager>,
    cache: Arc<DeviceCache>,
    refresh_rx: Option<mpsc::Receiver<ExporterKey>>,
    validator: Arc<RecordValidator>,
    sizing: Arc<AdaptiveBatchSize>,
    forward: Arc<ForwardHub>,
    stats: Arc<CollectorStats>,
    pool: Option<WorkerPool>,
    pool_handle: Option<PoolHandle>,
    listener_cancel: CancellationToken,
    background_cancel: CancellationToken,
    listeners: Vec<ListenerTask>,
    refresher: Option<JoinHandle<mpsc::Receiver<ExporterKey>>>,
    maintenance: Option<JoinHandle<()>>,
    last_drain: Option<DrainReport>,
}

impl FlowPipeline {
    /// 현재 상태를 반환합니다.
    pub fn state_name(&self) -> &str {
        match self.state {
            PipelineState::Initialized => "initialized",
            PipelineState::Running => "running",
            PipelineState::Stopped => "stopped",
        }
    }

    /// 파이프라인 설정
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// 바인드된 로컬 주소 (포트 0으로 설정한 경우 실제 포트 확인용)
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    /// 수신 태스크별 상태
    pub fn listener_statuses(&self) -> Vec<(SocketAddr, CollectorStatus)> {
        self.listeners
            .iter()
            .map(|l| (l.addr, l.status.lock().clone()))
            .collect()
    }

    /// 포워더 구독을 등록합니다. 시작 전후 모두 가능합니다.
    pub fn subscribe(&self, filter: ForwardFilter) -> mpsc::Receiver<Arc<FlowBatch>> {
        self.forward.subscribe(filter)
    }

    /// 메트릭 스냅샷을 반환합니다.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.snapshot_source().snapshot()
    }

    /// 파이프라인 소유권과 무관하게 스냅샷을 만드는 핸들
    pub fn snapshot_source(&self) -> SnapshotSource {
        SnapshotSource::new(
            Arc::clone(&self.stats),
            Arc::clone(&self.cache),
            Arc::clone(&self.sizing),
        )
    }

    /// 템플릿 관리자
    pub fn templates(&self) -> &Arc<TemplateManager> {
        &self.templates
    }

    /// 디바이스 캐시
    pub fn device_cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    /// 수집 통계
    pub fn stats(&self) -> &Arc<CollectorStats> {
        &self.stats
    }

    /// 검증기
    pub fn validator(&self) -> &Arc<RecordValidator> {
        &self.validator
    }

    /// 적응형 배치 크기
    pub fn batch_sizing(&self) -> &Arc<AdaptiveBatchSize> {
        &self.sizing
    }

    /// 마지막 정지 시 워커 풀 드레인 결과
    pub fn last_drain_report(&self) -> Option<DrainReport> {
        self.last_drain
    }

    fn flush_tick(&self) -> Duration {
        (self.config.batch_max_wait / 4).clamp(Duration::from_millis(10), Duration::from_millis(250))
    }

    fn spawn_maintenance(&self, handle: PoolHandle) -> JoinHandle<()> {
        let templates = Arc::clone(&self.templates);
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        let cancel = self.background_cancel.clone();
        let sweep_every = self.config.template_sweep_interval;
        let pressure_every = self.config.pressure_interval;

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            let mut pressure = tokio::time::interval(pressure_every);
            let mut rates = tokio::time::interval(RATE_SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        templates.expire_idle(Instant::now());
                    }
                    _ = pressure.tick() => {
                        cache.apply_memory_pressure();
                        cache.publish_metrics();
                    }
                    _ = rates.tick() => {
                        let (pps, _) = stats.sample_rates(Instant::now());
                        metrics::gauge!(m::COLLECTOR_PACKETS_PER_SECOND).set(pps);
                        let depth = handle.queue_depth();
                        stats.set_queue_depth(depth);
                        metrics::gauge!(m::WORKER_QUEUE_DEPTH).set(depth as f64);
                    }
                }
            }
        })
    }
}

impl Pipeline for FlowPipeline {
    async fn start(&mut self) -> Result<(), IronflowError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!(
            listen = ?self.config.listen_addrs,
            workers = self.config.workers,
            "starting flow pipeline"
        );

        // 1. 모든 소켓을 먼저 바인드 (하나라도 실패하면 아무것도 시작하지 않음)
        let sockets = self
            .config
            .listen_addrs
            .iter()
            .map(|addr| bind_udp(*addr, self.config.recv_buffer_bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let refresh_rx = self.refresh_rx.take().ok_or_else(|| {
            PipelineError::InitFailed("device refresh queue unavailable".to_owned())
        })?;

        self.listener_cancel = CancellationToken::new();
        self.background_cancel = CancellationToken::new();

        // 2. 워커 풀
        let (pool, handle) = WorkerPool::start(
            WorkerSettings::from(&self.config),
            Arc::clone(&self.sink),
            Arc::clone(&self.forward),
            Arc::clone(&self.sizing),
            Arc::clone(&self.stats),
        );

        // 3. 포트별 수신 태스크
        let dispatcher = ProtocolDispatcher::new(Arc::clone(&self.templates));
        let flush_tick = self.flush_tick();
        let mut listeners = Vec::with_capacity(sockets.len());
        for socket in sockets {
            let processor = PacketProcessor::new(
                dispatcher.clone(),
                Arc::clone(&self.cache),
                Arc::clone(&self.validator),
                BatchAccumulator::new(Arc::clone(&self.sizing), self.config.batch_max_wait),
                handle.clone(),
                Arc::clone(&self.stats),
            );
            let listener = match UdpListener::new(
                socket,
                processor,
                self.config.max_datagram_bytes,
                flush_tick,
            ) {
                Ok(listener) => listener,
                Err(e) => {
                    let mut pool = pool;
                    pool.shutdown(self.config.drain_deadline).await;
                    self.refresh_rx = Some(refresh_rx);
                    return Err(e.into());
                }
            };
            listeners.push((listener.local_addr(), listener.status_handle(), listener));
        }
        for (addr, status, listener) in listeners {
            let handle = tokio::spawn(listener.run(self.listener_cancel.child_token()));
            self.listeners.push(ListenerTask {
                addr,
                status,
                handle,
            });
        }

        // 4. 백그라운드 태스크
        self.refresher = Some(spawn_refresher(
            Arc::clone(&self.cache),
            refresh_rx,
            self.background_cancel.clone(),
            self.config.drain_deadline,
        ));
        self.maintenance = Some(self.spawn_maintenance(handle.clone()));

        self.pool = Some(pool);
        self.pool_handle = Some(handle);
        self.state = PipelineState::Running;
        info!(addrs = ?self.local_addrs(), "flow pipeline started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), IronflowError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping flow pipeline");

        // 1. 수신 중단 (각 수신 태스크가 누적 중인 배치를 풀로 넘기고 종료)
        self.listener_cancel.cancel();
        let mut received = 0u64;
        for listener in self.listeners.drain(..) {
            match listener.handle.await {
                Ok(count) => received += count,
                Err(e) => warn!(addr = %listener.addr, error = %e, "listener task failed"),
            }
        }

        // 2. 워커 풀 드레인
        self.pool_handle = None;
        if let Some(mut pool) = self.pool.take() {
            self.last_drain = Some(pool.shutdown(self.config.drain_deadline).await);
        }

        // 3. 백그라운드 태스크 정지
        self.background_cancel.cancel();
        if let Some(refresher) = self.refresher.take() {
            match refresher.await {
                Ok(rx) => self.refresh_rx = Some(rx),
                // 수신기를 잃었으므로 재시작은 InitFailed로 거부됨
                Err(e) => warn!(error = %e, "device refresher failed"),
            }
        }
        if let Some(maintenance) = self.maintenance.take()
            && let Err(e) = maintenance.await
        {
            warn!(error = %e, "maintenance task failed");
        }

        self.state = PipelineState::Stopped;
        info!(
            received,
            lost_batches = self.last_drain.map_or(0, |r| r.lost),
            "flow pipeline stopped"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PipelineState::Running => {
                if let Some(handle) = &self.pool_handle {
                    let capacity = handle.queue_capacity().max(1);
                    let ratio = handle.queue_depth() as f64 / capacity as f64;
                    if ratio > QUEUE_DEGRADED_RATIO {
                        return HealthStatus::Degraded(format!(
                            "worker queue utilization high: {:.1}%",
                            ratio * 100.0
                        ));
                    }
                }
                let error_rate = self.stats.recent_error_rate();
                if error_rate > ERROR_RATE_DEGRADED {
                    return HealthStatus::Degraded(format!(
                        "decode error rate high: {:.1}%",
                        error_rate * 100.0
                    ));
                }
                HealthStatus::Healthy
            }
            PipelineState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            PipelineState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

/// 플로우 파이프라인 빌더
pub struct FlowPipelineBuilder {
    config: PipelineConfig,
    sink: Option<Arc<dyn FlowSink>>,
    resolver: Option<Arc<dyn DeviceResolver>>,
}

impl FlowPipelineBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            sink: None,
            resolver: None,
        }
    }

    /// 파이프라인 설정을 지정합니다.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// 스토리지 싱크를 지정합니다. 지정하지 않으면 [`LogSink`]를 사용합니다.
    pub fn sink(mut self, sink: Arc<dyn FlowSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// 디바이스 메타데이터 조회기를 지정합니다.
    ///
    /// 지정하지 않으면 설정의 정적 디바이스 테이블([`StaticResolver`])을 사용합니다.
    pub fn resolver(mut self, resolver: Arc<dyn DeviceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 파이프라인을 빌드합니다.
    pub fn build(self) -> Result<FlowPipeline, FlowPipelineError> {
        self.config.validate()?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(StaticResolver::from_config(&self.config.static_devices)?),
        };
        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));
        let (cache, refresh_rx) = DeviceCache::new(DeviceCacheSettings::from(&self.config), resolver);
        let templates = TemplateManager::new(
            self.config.template_ttl,
            self.config.max_templates,
            self.config.pending_per_exporter,
        )
        .with_max_pending(self.config.max_pending_total);

        Ok(FlowPipeline {
            sizing: Arc::new(AdaptiveBatchSize::from_config(&self.config)),
            forward: Arc::new(ForwardHub::new(self.config.forward_channel_capacity)),
            config: self.config,
            state: PipelineState::Initialized,
            sink,
            templates: Arc::new(templates),
            cache: Arc::new(cache),
            refresh_rx: Some(refresh_rx),
            validator: Arc::new(RecordValidator::new()),
            stats: Arc::new(CollectorStats::new()),
            pool: None,
            pool_handle: None,
            listener_cancel: CancellationToken::new(),
            background_cancel: CancellationToken::new(),
            listeners: Vec::new(),
            refresher: None,
            maintenance: None,
            last_drain: None,
        })
    }
}

impl Default for FlowPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
