//! 플로우 파이프라인 설정
//!
//! [`PipelineConfig`]는 core의 [`IronflowConfig`]에서 파생되는
//! 검증된 불변 런타임 설정입니다. 시간 값은 모두 [`Duration`]으로 변환됩니다.
//!
//! # 사용 예시
//! ```ignore
//! use ironflow_core::config::IronflowConfig;
//! use ironflow_pipeline::config::PipelineConfig;
//!
//! let core_config = IronflowConfig::default();
//! let config = PipelineConfig::from_core(&core_config)?;
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ironflow_core::config::{BackpressurePolicy, IronflowConfig, StaticDevice};

use crate::error::FlowPipelineError;

/// 플로우 파이프라인 설정
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 수신 소켓 주소 목록 (포트 0은 임의 포트)
    pub listen_addrs: Vec<SocketAddr>,
    /// 소켓 수신 버퍼 크기 (바이트)
    pub recv_buffer_bytes: usize,
    /// 최대 데이터그램 크기 (바이트)
    pub max_datagram_bytes: usize,

    /// 템플릿 유휴 만료 시간
    pub template_ttl: Duration,
    /// 템플릿 테이블 최대 엔트리 수
    pub max_templates: usize,
    /// 익스포터별 템플릿 대기 데이터 셋 수
    pub pending_per_exporter: usize,
    /// 전체 템플릿 대기 데이터 셋 수
    pub max_pending_total: usize,
    /// 템플릿 만료 스윕 주기
    pub template_sweep_interval: Duration,

    /// 디바이스 캐시 최대 엔트리 수
    pub cache_capacity: usize,
    /// 디바이스 캐시 메모리 예산 (바이트)
    pub cache_memory_budget: usize,
    /// 압력 제거 시작 임계치 (%)
    pub cache_high_water_percent: u8,
    /// 압력 제거 목표 임계치 (%)
    pub cache_low_water_percent: u8,
    /// 동기 조회 타임아웃
    pub lookup_timeout: Duration,
    /// 백그라운드 갱신 큐 용량
    pub refresh_queue: usize,
    /// 메모리 압력 샘플링 주기
    pub pressure_interval: Duration,
    /// 정적 디바이스 메타데이터
    pub static_devices: Vec<StaticDevice>,

    /// 적응형 배치 크기 하한
    pub batch_min: usize,
    /// 적응형 배치 크기 상한
    pub batch_max: usize,
    /// 시작 배치 크기
    pub batch_initial: usize,
    /// 첫 레코드 이후 최대 대기 시간
    pub batch_max_wait: Duration,
    /// 목표 플러시 지연 시간
    pub target_latency: Duration,
    /// 크기 조정 단위 (%)
    pub step_percent: u32,

    /// 워커 수
    pub workers: usize,
    /// 플러시 작업 큐 용량
    pub queue_capacity: usize,
    /// 큐 포화 시 정책
    pub backpressure: BackpressurePolicy,
    /// `Block` 정책의 최대 대기 시간
    pub backpressure_timeout: Duration,
    /// 종료 시 드레인 기한
    pub drain_deadline: Duration,
    /// 포워더 구독자별 채널 용량
    pub forward_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let core = IronflowConfig::default();
        let bind = IpAddr::from([0, 0, 0, 0]);
        Self {
            listen_addrs: vec![
                SocketAddr::new(bind, core.collector.netflow_port),
                SocketAddr::new(bind, core.collector.sflow_port),
            ],
            ..Self::from_sections(&core, Vec::new())
        }
    }
}

impl PipelineConfig {
    /// core의 `IronflowConfig`에서 파이프라인 설정을 생성합니다.
    pub fn from_core(core: &IronflowConfig) -> Result<Self, FlowPipelineError> {
        let bind: IpAddr =
            core.collector
                .bind_address
                .parse()
                .map_err(|_| FlowPipelineError::Config {
                    field: "collector.bind_address".to_owned(),
                    reason: format!("'{}' is not an IP address", core.collector.bind_address),
                })?;
        let listen_addrs = vec![
            SocketAddr::new(bind, core.collector.netflow_port),
            SocketAddr::new(bind, core.collector.sflow_port),
        ];
        let config = Self::from_sections(core, listen_addrs);
        config.validate()?;
        Ok(config)
    }

    fn from_sections(core: &IronflowConfig, listen_addrs: Vec<SocketAddr>) -> Self {
        Self {
            listen_addrs,
            recv_buffer_bytes: core.collector.recv_buffer_bytes,
            max_datagram_bytes: core.collector.max_datagram_bytes,
            template_ttl: Duration::from_secs(core.templates.ttl_secs),
            max_templates: core.templates.max_templates,
            pending_per_exporter: core.templates.pending_per_exporter,
            max_pending_total: core.templates.max_pending_total,
            template_sweep_interval: Duration::from_secs(core.templates.sweep_interval_secs.max(1)),
            cache_capacity: core.device_cache.capacity,
            cache_memory_budget: core.device_cache.memory_budget_bytes,
            cache_high_water_percent: core.device_cache.high_water_percent,
            cache_low_water_percent: core.device_cache.low_water_percent,
            lookup_timeout: Duration::from_millis(core.device_cache.lookup_timeout_ms),
            refresh_queue: core.device_cache.refresh_queue,
            pressure_interval: Duration::from_secs(core.device_cache.pressure_interval_secs.max(1)),
            static_devices: core.device_cache.static_devices.clone(),
            batch_min: core.batch.min_size,
            batch_max: core.batch.max_size,
            batch_initial: core.batch.initial_size,
            batch_max_wait: Duration::from_millis(core.batch.max_wait_ms),
            target_latency: Duration::from_millis(core.batch.target_latency_ms),
            step_percent: core.batch.step_percent,
            workers: core.workers.effective_count(),
            queue_capacity: core.workers.queue_capacity,
            backpressure: core.workers.backpressure,
            backpressure_timeout: Duration::from_millis(core.workers.backpressure_timeout_ms),
            drain_deadline: Duration::from_secs(core.workers.drain_deadline_secs),
            forward_channel_capacity: core.workers.forward_channel_capacity,
        }
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), FlowPipelineError> {
        const MAX_BATCH_SIZE: usize = 1_000_000;
        const MIN_DATAGRAM_BYTES: usize = 512;

        if self.listen_addrs.is_empty() {
            return Err(config_err("listen_addrs", "at least one address is required"));
        }
        if self.max_datagram_bytes < MIN_DATAGRAM_BYTES || self.max_datagram_bytes > 65_535 {
            return Err(config_err(
                "max_datagram_bytes",
                format!("must be {}-65535", MIN_DATAGRAM_BYTES),
            ));
        }
        if self.template_ttl.is_zero() {
            return Err(config_err("template_ttl", "must be greater than 0"));
        }
        if self.max_templates == 0 {
            return Err(config_err("max_templates", "must be greater than 0"));
        }
        if self.cache_capacity == 0 {
            return Err(config_err("cache_capacity", "must be greater than 0"));
        }
        if self.cache_high_water_percent > 100
            || self.cache_low_water_percent >= self.cache_high_water_percent
        {
            return Err(config_err(
                "cache_low_water_percent",
                "must satisfy low < high <= 100",
            ));
        }
        if self.refresh_queue == 0 {
            return Err(config_err("refresh_queue", "must be greater than 0"));
        }
        if self.batch_min == 0 || self.batch_max > MAX_BATCH_SIZE || self.batch_min > self.batch_max
        {
            return Err(config_err(
                "batch_min",
                format!("must satisfy 1 <= min <= max <= {}", MAX_BATCH_SIZE),
            ));
        }
        if self.batch_initial < self.batch_min || self.batch_initial > self.batch_max {
            return Err(config_err("batch_initial", "must be within [batch_min, batch_max]"));
        }
        if self.batch_max_wait.is_zero() {
            return Err(config_err("batch_max_wait", "must be greater than 0"));
        }
        if self.target_latency.is_zero() {
            return Err(config_err("target_latency", "must be greater than 0"));
        }
        if self.step_percent == 0 || self.step_percent > 100 {
            return Err(config_err("step_percent", "must be 1-100"));
        }
        if self.workers == 0 {
            return Err(config_err("workers", "must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(config_err("queue_capacity", "must be greater than 0"));
        }
        if self.forward_channel_capacity == 0 {
            return Err(config_err("forward_channel_capacity", "must be greater than 0"));
        }
        Ok(())
    }
}

fn config_err(field: &str, reason: impl Into<String>) -> FlowPipelineError {
    FlowPipelineError::Config {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

/// 파이프라인 설정 빌더
///
/// 테스트와 임베딩 용도로 core 설정 파일 없이 설정을 구성합니다.
#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 수신 주소 목록을 설정합니다.
    pub fn listen_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.config.listen_addrs = addrs;
        self
    }

    /// 템플릿 유휴 만료 시간을 설정합니다.
    pub fn template_ttl(mut self, ttl: Duration) -> Self {
        self.config.template_ttl = ttl;
        self
    }

    /// 템플릿 테이블 최대 크기를 설정합니다.
    pub fn max_templates(mut self, max: usize) -> Self {
        self.config.max_templates = max;
        self
    }

    /// 익스포터별 템플릿 대기 버퍼 크기를 설정합니다.
    pub fn pending_per_exporter(mut self, count: usize) -> Self {
        self.config.pending_per_exporter = count;
        self
    }

    /// 전체 템플릿 대기 버퍼 크기를 설정합니다.
    pub fn max_pending_total(mut self, count: usize) -> Self {
        self.config.max_pending_total = count;
        self
    }

    /// 디바이스 캐시 용량을 설정합니다.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// 디바이스 캐시 메모리 예산과 임계치를 설정합니다.
    pub fn cache_memory(mut self, budget_bytes: usize, high_percent: u8, low_percent: u8) -> Self {
        self.config.cache_memory_budget = budget_bytes;
        self.config.cache_high_water_percent = high_percent;
        self.config.cache_low_water_percent = low_percent;
        self
    }

    /// 디바이스 조회 타임아웃을 설정합니다.
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.config.lookup_timeout = timeout;
        self
    }

    /// 정적 디바이스 테이블을 설정합니다.
    pub fn static_devices(mut self, devices: Vec<StaticDevice>) -> Self {
        self.config.static_devices = devices;
        self
    }

    /// 적응형 배치 크기 범위와 시작값을 설정합니다.
    pub fn batch_bounds(mut self, min: usize, max: usize, initial: usize) -> Self {
        self.config.batch_min = min;
        self.config.batch_max = max;
        self.config.batch_initial = initial;
        self
    }

    /// 배치 최대 대기 시간을 설정합니다.
    pub fn batch_max_wait(mut self, wait: Duration) -> Self {
        self.config.batch_max_wait = wait;
        self
    }

    /// 목표 플러시 지연 시간을 설정합니다.
    pub fn target_latency(mut self, latency: Duration) -> Self {
        self.config.target_latency = latency;
        self
    }

    /// 워커 수를 설정합니다.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// 작업 큐 용량을 설정합니다.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// 백프레셔 정책과 최대 대기 시간을 설정합니다.
    pub fn backpressure(mut self, policy: BackpressurePolicy, timeout: Duration) -> Self {
        self.config.backpressure = policy;
        self.config.backpressure_timeout = timeout;
        self
    }

    /// 종료 드레인 기한을 설정합니다.
    pub fn drain_deadline(mut self, deadline: Duration) -> Self {
        self.config.drain_deadline = deadline;
        self
    }

    /// 설정을 검증하고 `PipelineConfig`를 생성합니다.
    pub fn build(self) -> Result<PipelineConfig, FlowPipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
