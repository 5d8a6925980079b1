//! `ironflow.toml` 설정 로딩과 검증
//!
//! [`IronflowConfig`]는 수집기의 모든 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`IRONFLOW_BATCH_MAX_SIZE=20000` 형식)
//! 3. 설정 파일 (`ironflow.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), ironflow_core::error::IronflowError> {
//! use ironflow_core::config::IronflowConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = IronflowConfig::load("ironflow.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = IronflowConfig::parse("[batch]\nmax_size = 20000")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, IronflowError};

/// Ironflow 통합 설정
///
/// `ironflow.toml` 파일의 최상위 구조를 나타냅니다.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IronflowConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// UDP 수집기 설정
    #[serde(default)]
    pub collector: CollectorConfig,
    /// 템플릿 관리자 설정
    #[serde(default)]
    pub templates: TemplateConfig,
    /// 디바이스 캐시 설정
    #[serde(default)]
    pub device_cache: DeviceCacheConfig,
    /// 배치 누적기 설정
    #[serde(default)]
    pub batch: BatchConfig,
    /// 워커 풀 설정
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Prometheus 메트릭 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl IronflowConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IronflowError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, IronflowError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IronflowError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                IronflowError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, IronflowError> {
        toml::from_str(toml_str).map_err(|e| {
            IronflowError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `IRONFLOW_{SECTION}_{FIELD}`
    /// 예: `IRONFLOW_COLLECTOR_NETFLOW_PORT=9995`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "IRONFLOW_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "IRONFLOW_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.pid_file, "IRONFLOW_GENERAL_PID_FILE");

        // Collector
        override_string(
            &mut self.collector.bind_address,
            "IRONFLOW_COLLECTOR_BIND_ADDRESS",
        );
        override_u16(
            &mut self.collector.netflow_port,
            "IRONFLOW_COLLECTOR_NETFLOW_PORT",
        );
        override_u16(&mut self.collector.sflow_port, "IRONFLOW_COLLECTOR_SFLOW_PORT");
        override_usize(
            &mut self.collector.recv_buffer_bytes,
            "IRONFLOW_COLLECTOR_RECV_BUFFER_BYTES",
        );

        // Templates
        override_u64(&mut self.templates.ttl_secs, "IRONFLOW_TEMPLATES_TTL_SECS");
        override_usize(
            &mut self.templates.max_templates,
            "IRONFLOW_TEMPLATES_MAX_TEMPLATES",
        );
        override_usize(
            &mut self.templates.pending_per_exporter,
            "IRONFLOW_TEMPLATES_PENDING_PER_EXPORTER",
        );
        override_usize(
            &mut self.templates.max_pending_total,
            "IRONFLOW_TEMPLATES_MAX_PENDING_TOTAL",
        );

        // Device cache
        override_usize(
            &mut self.device_cache.capacity,
            "IRONFLOW_DEVICE_CACHE_CAPACITY",
        );
        override_usize(
            &mut self.device_cache.memory_budget_bytes,
            "IRONFLOW_DEVICE_CACHE_MEMORY_BUDGET_BYTES",
        );
        override_u64(
            &mut self.device_cache.lookup_timeout_ms,
            "IRONFLOW_DEVICE_CACHE_LOOKUP_TIMEOUT_MS",
        );

        // Batch
        override_usize(&mut self.batch.min_size, "IRONFLOW_BATCH_MIN_SIZE");
        override_usize(&mut self.batch.max_size, "IRONFLOW_BATCH_MAX_SIZE");
        override_usize(&mut self.batch.initial_size, "IRONFLOW_BATCH_INITIAL_SIZE");
        override_u64(&mut self.batch.max_wait_ms, "IRONFLOW_BATCH_MAX_WAIT_MS");
        override_u64(
            &mut self.batch.target_latency_ms,
            "IRONFLOW_BATCH_TARGET_LATENCY_MS",
        );

        // Workers
        override_usize(&mut self.workers.count, "IRONFLOW_WORKERS_COUNT");
        override_usize(
            &mut self.workers.queue_capacity,
            "IRONFLOW_WORKERS_QUEUE_CAPACITY",
        );
        if let Ok(val) = std::env::var("IRONFLOW_WORKERS_BACKPRESSURE") {
            match val.parse::<BackpressurePolicy>() {
                Ok(parsed) => self.workers.backpressure = parsed,
                Err(_) => warn!(
                    env_key = "IRONFLOW_WORKERS_BACKPRESSURE",
                    value = val.as_str(),
                    "failed to parse backpressure policy from env var, ignoring"
                ),
            }
        }

        // Metrics
        override_bool(&mut self.metrics.enabled, "IRONFLOW_METRICS_ENABLED");
        override_string(
            &mut self.metrics.listen_addr,
            "IRONFLOW_METRICS_LISTEN_ADDR",
        );
        override_u16(&mut self.metrics.port, "IRONFLOW_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), IronflowError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        // Collector
        if self.collector.bind_address.parse::<std::net::IpAddr>().is_err() {
            return Err(invalid(
                "collector.bind_address",
                "must be an IP address".to_owned(),
            ));
        }
        if self.collector.netflow_port == 0 {
            return Err(invalid("collector.netflow_port", "must not be 0".to_owned()));
        }
        if self.collector.sflow_port == 0 {
            return Err(invalid("collector.sflow_port", "must not be 0".to_owned()));
        }
        if self.collector.netflow_port == self.collector.sflow_port {
            return Err(invalid(
                "collector.sflow_port",
                "must differ from collector.netflow_port".to_owned(),
            ));
        }

        // Templates
        if self.templates.ttl_secs == 0 {
            return Err(invalid("templates.ttl_secs", "must be > 0".to_owned()));
        }
        if self.templates.max_templates == 0 {
            return Err(invalid("templates.max_templates", "must be > 0".to_owned()));
        }

        // Device cache
        if self.device_cache.capacity == 0 {
            return Err(invalid("device_cache.capacity", "must be > 0".to_owned()));
        }
        if self.device_cache.high_water_percent > 100 {
            return Err(invalid(
                "device_cache.high_water_percent",
                "must be <= 100".to_owned(),
            ));
        }
        if self.device_cache.low_water_percent >= self.device_cache.high_water_percent {
            return Err(invalid(
                "device_cache.low_water_percent",
                "must be < device_cache.high_water_percent".to_owned(),
            ));
        }
        if self.device_cache.refresh_queue == 0 {
            return Err(invalid("device_cache.refresh_queue", "must be > 0".to_owned()));
        }
        for device in &self.device_cache.static_devices {
            if device.address.parse::<std::net::IpAddr>().is_err() {
                return Err(invalid(
                    "device_cache.static_devices.address",
                    format!("'{}' is not an IP address", device.address),
                ));
            }
        }

        // Batch
        if self.batch.min_size == 0 {
            return Err(invalid("batch.min_size", "must be > 0".to_owned()));
        }
        if self.batch.min_size > self.batch.max_size {
            return Err(invalid(
                "batch.min_size",
                "must be <= batch.max_size".to_owned(),
            ));
        }
        if !(self.batch.min_size..=self.batch.max_size).contains(&self.batch.initial_size) {
            return Err(invalid(
                "batch.initial_size",
                "must be within [batch.min_size, batch.max_size]".to_owned(),
            ));
        }
        if self.batch.max_wait_ms == 0 {
            return Err(invalid("batch.max_wait_ms", "must be > 0".to_owned()));
        }
        if self.batch.target_latency_ms == 0 {
            return Err(invalid("batch.target_latency_ms", "must be > 0".to_owned()));
        }
        if self.batch.step_percent == 0 || self.batch.step_percent > 100 {
            return Err(invalid(
                "batch.step_percent",
                "must be within 1..=100".to_owned(),
            ));
        }

        // Workers
        if self.workers.queue_capacity == 0 {
            return Err(invalid("workers.queue_capacity", "must be > 0".to_owned()));
        }
        if self.workers.forward_channel_capacity == 0 {
            return Err(invalid(
                "workers.forward_channel_capacity",
                "must be > 0".to_owned(),
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: String) -> IronflowError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason,
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
    /// PID 파일 경로 (빈 문자열이면 사용 안 함)
    pub pid_file: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
            pid_file: String::new(),
        }
    }
}

/// UDP 수집기 설정
///
/// 프로토콜 계열마다 하나의 포트를 수신합니다.
/// 실제 프로토콜은 포트와 무관하게 패킷 헤더로 판별됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// 바인드 주소
    pub bind_address: String,
    /// NetFlow v5/v9, IPFIX 수신 포트
    pub netflow_port: u16,
    /// sFlow 수신 포트
    pub sflow_port: u16,
    /// 소켓 수신 버퍼 크기 (SO_RCVBUF, 바이트)
    pub recv_buffer_bytes: usize,
    /// 최대 데이터그램 크기 (바이트)
    pub max_datagram_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_owned(),
            netflow_port: 2055,
            sflow_port: 6343,
            recv_buffer_bytes: 4 * 1024 * 1024, // 4MB
            max_datagram_bytes: 65_535,
        }
    }
}

/// 템플릿 관리자 설정 (NetFlow v9 / IPFIX)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// 미사용 템플릿 만료 시간 (초)
    pub ttl_secs: u64,
    /// 템플릿 테이블 최대 엔트리 수
    pub max_templates: usize,
    /// 익스포터별 템플릿 대기 데이터 셋 최대 수
    pub pending_per_exporter: usize,
    /// 전체 익스포터의 대기 데이터 셋 최대 수 (넘으면 가장 오래된 것부터 버림)
    pub max_pending_total: usize,
    /// 만료 스윕 주기 (초)
    pub sweep_interval_secs: u64,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            max_templates: 10_000,
            pending_per_exporter: 32,
            max_pending_total: 4096,
            sweep_interval_secs: 30,
        }
    }
}

/// 디바이스 캐시 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceCacheConfig {
    /// 최대 엔트리 수 (LRU 기준)
    pub capacity: usize,
    /// 메모리 예산 (바이트, 추정치 기준)
    pub memory_budget_bytes: usize,
    /// 압력 제거 시작 임계치 (메모리 예산 대비 %)
    pub high_water_percent: u8,
    /// 압력 제거 목표 임계치 (메모리 예산 대비 %)
    pub low_water_percent: u8,
    /// 동기 조회 타임아웃 (밀리초)
    pub lookup_timeout_ms: u64,
    /// 백그라운드 갱신 큐 용량
    pub refresh_queue: usize,
    /// 메모리 압력 샘플링 주기 (초)
    pub pressure_interval_secs: u64,
    /// 정적 디바이스 메타데이터 테이블
    pub static_devices: Vec<StaticDevice>,
}

impl Default for DeviceCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            memory_budget_bytes: 16 * 1024 * 1024, // 16MB
            high_water_percent: 90,
            low_water_percent: 70,
            lookup_timeout_ms: 50,
            refresh_queue: 256,
            pressure_interval_secs: 5,
            static_devices: Vec::new(),
        }
    }
}

/// 정적 디바이스 메타데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticDevice {
    /// 익스포터 IP 주소
    pub address: String,
    /// 디바이스 이름
    pub name: String,
    /// 디바이스 종류 (router, switch, firewall 등)
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

fn default_device_type() -> String {
    "router".to_owned()
}

/// 배치 누적기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// 적응형 배치 크기 하한
    pub min_size: usize,
    /// 적응형 배치 크기 상한
    pub max_size: usize,
    /// 시작 배치 크기
    pub initial_size: usize,
    /// 첫 레코드 이후 최대 대기 시간 (밀리초)
    pub max_wait_ms: u64,
    /// 목표 플러시 지연 시간 (밀리초)
    pub target_latency_ms: u64,
    /// 크기 조정 단위 (%)
    pub step_percent: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_size: 100,
            max_size: 10_000,
            initial_size: 500,
            max_wait_ms: 1000,
            target_latency_ms: 100,
            step_percent: 10,
        }
    }
}

/// 큐가 가득 찼을 때의 동작
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// 제한 시간 동안 대기 후 드롭 (기본값)
    #[default]
    Block,
    /// 즉시 드롭하고 메트릭 증가
    Drop,
}

impl std::str::FromStr for BackpressurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop" => Ok(Self::Drop),
            other => Err(ConfigError::InvalidValue {
                field: "workers.backpressure".to_owned(),
                reason: format!("unknown policy '{other}', expected block or drop"),
            }),
        }
    }
}

/// 워커 풀 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 워커 수 (0이면 가용 병렬성 기준 2~8 사이로 결정)
    pub count: usize,
    /// 플러시 작업 큐 용량
    pub queue_capacity: usize,
    /// 큐가 가득 찼을 때의 정책
    pub backpressure: BackpressurePolicy,
    /// `block` 정책의 최대 대기 시간 (밀리초)
    pub backpressure_timeout_ms: u64,
    /// 종료 시 큐 드레인 기한 (초)
    pub drain_deadline_secs: u64,
    /// 포워더 구독자별 채널 용량
    pub forward_channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 0,
            queue_capacity: 64,
            backpressure: BackpressurePolicy::Block,
            backpressure_timeout_ms: 250,
            drain_deadline_secs: 5,
            forward_channel_capacity: 256,
        }
    }
}

impl WorkerConfig {
    /// 실제로 사용할 워커 수를 계산합니다.
    pub fn effective_count(&self) -> usize {
        if self.count > 0 {
            return self.count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .clamp(2, 8)
    }
}

/// Prometheus 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 메트릭 엔드포인트 활성화 여부
    pub enabled: bool,
    /// 리슨 주소
    pub listen_addr: String,
    /// 리슨 포트
    pub port: u16,
    /// HTTP 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_u16(target: &mut u16, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u16>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u16 from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
