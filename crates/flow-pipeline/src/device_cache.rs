//! 디바이스 메타데이터 캐시
//!
//! 익스포터 키를 디바이스 메타데이터(이름, 종류, 감지된 플로우 버전)에 매핑합니다.
//!
//! # 제거 정책
//! - 1차: 엄격한 LRU. 용량이 가득 찬 상태에서 삽입하면 가장 오래전에 접근한 엔트리 하나를 제거
//! - 2차: 주기적으로 샘플링하는 메모리 압력 정책. 추정 메모리가 high-water를 넘으면
//!   최근 사용 여부와 관계없이 가장 먼저 삽입된 엔트리부터 low-water 아래가 될 때까지 제거
//!
//! # 조회
//! 미스 시 [`DeviceResolver`]로 동기 조회(하드 타임아웃)를 시도하고, 실패하면
//! "unknown" 플레이스홀더를 넣은 뒤 백그라운드 갱신 큐에 요청을 넣습니다.
//! 갱신 큐가 가득 차면 요청은 버려집니다 (메타데이터는 부가 정보).

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::mem::size_of;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ironflow_core::config::StaticDevice;
use ironflow_core::metrics as m;
use ironflow_core::pipeline::BoxFuture;
use ironflow_core::types::{ExporterKey, FlowVersion};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::FlowPipelineError;

/// 엔트리당 고정 오버헤드 추정치 (해시 테이블 버킷, Arc 헤더)
const ENTRY_OVERHEAD: usize = 64;

/// 디바이스 메타데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMetadata {
    /// 디바이스 이름
    pub name: String,
    /// 디바이스 종류 (router, switch 등)
    pub device_type: String,
    /// 마지막으로 감지된 플로우 프로토콜
    pub flow_version: Option<FlowVersion>,
    /// 조회 실패로 채워진 플레이스홀더 여부
    pub placeholder: bool,
}

impl DeviceMetadata {
    /// 조회 실패 시 사용하는 "unknown" 엔트리
    pub fn unknown(flow_version: Option<FlowVersion>) -> Self {
        Self {
            name: "unknown".to_owned(),
            device_type: "unknown".to_owned(),
            flow_version,
            placeholder: true,
        }
    }

    fn estimated_size(&self) -> usize {
        size_of::<ExporterKey>()
            + size_of::<CacheSlot>()
            + size_of::<DeviceMetadata>()
            + self.name.len()
            + self.device_type.len()
            + ENTRY_OVERHEAD
    }
}

/// 디바이스 메타데이터 조회 협력자
pub trait DeviceResolver: Send + Sync {
    /// 익스포터의 메타데이터를 조회합니다.
    fn resolve<'a>(
        &'a self,
        exporter: &'a ExporterKey,
    ) -> BoxFuture<'a, Result<DeviceMetadata, FlowPipelineError>>;
}

/// 설정 파일의 정적 디바이스 테이블로 응답하는 조회기
#[derive(Debug, Default)]
pub struct StaticResolver {
    devices: HashMap<IpAddr, DeviceMetadata>,
}

impl StaticResolver {
    /// 정적 디바이스 목록으로 조회기를 생성합니다.
    pub fn from_config(devices: &[StaticDevice]) -> Result<Self, FlowPipelineError> {
        let mut map = HashMap::with_capacity(devices.len());
        for device in devices {
            let addr: IpAddr = device.address.parse().map_err(|_| FlowPipelineError::Config {
                field: "device_cache.static_devices.address".to_owned(),
                reason: format!("'{}' is not an IP address", device.address),
            })?;
            map.insert(
                addr,
                DeviceMetadata {
                    name: device.name.clone(),
                    device_type: device.device_type.clone(),
                    flow_version: None,
                    placeholder: false,
                },
            );
        }
        Ok(Self { devices: map })
    }

    /// 등록된 디바이스 수
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// 등록된 디바이스가 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceResolver for StaticResolver {
    fn resolve<'a>(
        &'a self,
        exporter: &'a ExporterKey,
    ) -> BoxFuture<'a, Result<DeviceMetadata, FlowPipelineError>> {
        Box::pin(async move {
            self.devices
                .get(&exporter.addr)
                .cloned()
                .ok_or_else(|| FlowPipelineError::CacheLookup {
                    exporter: *exporter,
                    reason: "no static device entry".to_owned(),
                })
        })
    }
}

/// 캐시 설정
#[derive(Debug, Clone)]
pub struct DeviceCacheSettings {
    /// 최대 엔트리 수
    pub capacity: usize,
    /// 메모리 예산 (바이트)
    pub memory_budget: usize,
    /// 압력 제거 시작 임계치 (%)
    pub high_water_percent: u8,
    /// 압력 제거 목표 임계치 (%)
    pub low_water_percent: u8,
    /// 동기 조회 타임아웃
    pub lookup_timeout: Duration,
    /// 백그라운드 갱신 큐 용량
    pub refresh_queue: usize,
}

impl From<&PipelineConfig> for DeviceCacheSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            capacity: config.cache_capacity,
            memory_budget: config.cache_memory_budget,
            high_water_percent: config.cache_high_water_percent,
            low_water_percent: config.cache_low_water_percent,
            lookup_timeout: config.lookup_timeout,
            refresh_queue: config.refresh_queue,
        }
    }
}

/// 샤드 수 (조회/삽입은 키가 속한 샤드만 잠금)
const SHARDS: usize = 16;

#[derive(Debug)]
struct CacheSlot {
    meta: Arc<DeviceMetadata>,
    inserted: u64,
    last_access: u64,
    size: usize,
}

type Shard = Mutex<LruCache<ExporterKey, CacheSlot>>;

/// 디바이스 메타데이터 캐시
///
/// 엔트리는 키 해시로 나눈 샤드에 들어가며 샤드마다 `LruCache`가 최근 사용 순서를 유지합니다.
/// 전역 접근 시각은 샤드 잠금 안에서 발급하므로 각 샤드의 LRU 끝이 그 샤드의 최솟값이고,
/// 용량 초과 시 샤드 끝들만 비교해 전역 LRU를 찾습니다.
pub struct DeviceCache {
    shards: Box<[Shard]>,
    hasher: RandomState,
    resolver: Arc<dyn DeviceResolver>,
    capacity: usize,
    high_water_percent: u8,
    low_water_percent: u8,
    lookup_timeout: Duration,
    budget: AtomicUsize,
    memory: AtomicUsize,
    entries: AtomicUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    lookup_failures: AtomicU64,
    refresh_tx: mpsc::Sender<ExporterKey>,
}

impl DeviceCache {
    /// 새 캐시와 백그라운드 갱신 요청 수신기를 생성합니다.
    pub fn new(
        settings: DeviceCacheSettings,
        resolver: Arc<dyn DeviceResolver>,
    ) -> (Self, mpsc::Receiver<ExporterKey>) {
        let (refresh_tx, refresh_rx) = mpsc::channel(settings.refresh_queue.max(1));
        let cache = Self {
            shards: (0..SHARDS)
                .map(|_| Mutex::new(LruCache::unbounded()))
                .collect(),
            hasher: RandomState::new(),
            resolver,
            capacity: settings.capacity.max(1),
            high_water_percent: settings.high_water_percent,
            low_water_percent: settings.low_water_percent,
            lookup_timeout: settings.lookup_timeout,
            budget: AtomicUsize::new(settings.memory_budget),
            memory: AtomicUsize::new(0),
            entries: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            lookup_failures: AtomicU64::new(0),
            refresh_tx,
        };
        (cache, refresh_rx)
    }

    fn shard(&self, key: &ExporterKey) -> &Shard {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 캐시에서 조회합니다. 히트면 최근 사용으로 갱신합니다.
    pub fn get(&self, key: &ExporterKey) -> Option<Arc<DeviceMetadata>> {
        let found = {
            let mut shard = self.shard(key).lock();
            shard.get_mut(key).map(|slot| {
                slot.last_access = self.tick();
                Arc::clone(&slot.meta)
            })
        };
        match found {
            Some(meta) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::DEVICE_CACHE_HITS_TOTAL).increment(1);
                Some(meta)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::DEVICE_CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// 엔트리를 삽입(또는 교체)합니다. 용량이나 메모리 예산을 넘으면 LRU로 제거합니다.
    pub fn insert(&self, key: ExporterKey, meta: DeviceMetadata) -> Arc<DeviceMetadata> {
        let size = meta.estimated_size();
        let meta = Arc::new(meta);

        let replaced = {
            let mut shard = self.shard(&key).lock();
            let tick = self.tick();
            shard.put(
                key,
                CacheSlot {
                    meta: Arc::clone(&meta),
                    inserted: tick,
                    last_access: tick,
                    size,
                },
            )
        };
        self.memory.fetch_add(size, Ordering::Relaxed);
        match replaced {
            Some(old) => {
                self.memory.fetch_sub(old.size, Ordering::Relaxed);
            }
            None => {
                self.entries.fetch_add(1, Ordering::Relaxed);
            }
        }

        // 방금 넣은 엔트리가 가장 최근이므로 제거 대상은 항상 다른 엔트리
        while self.len() > self.capacity
            || (self.len() > 1
                && self.memory.load(Ordering::Relaxed) > self.budget.load(Ordering::Relaxed))
        {
            if !self.evict_lru() {
                break;
            }
        }
        metrics::gauge!(m::DEVICE_CACHE_ENTRIES).set(self.len() as f64);
        meta
    }

    /// 샤드별 LRU 끝을 비교해 전역에서 가장 오래전에 접근한 엔트리 하나를 제거합니다.
    fn evict_lru(&self) -> bool {
        for _ in 0..self.shards.len() {
            let victim = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(index, shard)| {
                    let shard = shard.lock();
                    let tail = shard
                        .peek_lru()
                        .map(|(key, slot)| (slot.last_access, index, *key));
                    tail
                })
                .min_by_key(|(last_access, _, _)| *last_access);
            let Some((last_access, index, key)) = victim else {
                return false;
            };

            let removed = {
                let mut shard = self.shards[index].lock();
                // 비교 사이에 접근되었으면 다시 선택
                match shard.peek(&key) {
                    Some(slot) if slot.last_access == last_access => shard.pop(&key),
                    _ => None,
                }
            };
            if let Some(slot) = removed {
                self.account_removal(&slot);
                return true;
            }
        }
        false
    }

    fn remove_entry(&self, key: &ExporterKey) -> bool {
        let removed = self.shard(key).lock().pop(key);
        match removed {
            Some(slot) => {
                self.account_removal(&slot);
                true
            }
            None => false,
        }
    }

    fn account_removal(&self, slot: &CacheSlot) {
        self.entries.fetch_sub(1, Ordering::Relaxed);
        self.memory.fetch_sub(slot.size, Ordering::Relaxed);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::DEVICE_CACHE_EVICTIONS_TOTAL).increment(1);
    }

    /// 캐시에서 조회하고, 미스면 타임아웃 내에서 동기 조회합니다.
    ///
    /// 조회가 실패하거나 타임아웃되면 플레이스홀더를 넣고 백그라운드 갱신을 요청합니다.
    pub async fn get_or_resolve(
        &self,
        key: ExporterKey,
        version: FlowVersion,
    ) -> Arc<DeviceMetadata> {
        if let Some(meta) = self.get(&key) {
            return meta;
        }

        let failure = match tokio::time::timeout(self.lookup_timeout, self.resolver.resolve(&key)).await
        {
            Ok(Ok(mut meta)) => {
                meta.flow_version = Some(version);
                return self.insert(key, meta);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("lookup timed out after {:?}", self.lookup_timeout),
        };

        self.lookup_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::DEVICE_CACHE_LOOKUP_FAILURES_TOTAL).increment(1);
        debug!(exporter = %key, reason = %failure, "device lookup failed, using placeholder");
        let placeholder = self.insert(key, DeviceMetadata::unknown(Some(version)));
        self.request_refresh(key);
        placeholder
    }

    /// 백그라운드 갱신을 요청합니다. 큐가 가득 차면 요청을 버립니다.
    pub fn request_refresh(&self, key: ExporterKey) -> bool {
        match self.refresh_tx.try_send(key) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(exporter = %key, "refresh queue full, dropping request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// 조회기로 엔트리를 다시 채웁니다. 감지된 플로우 버전은 유지합니다.
    pub async fn refresh(&self, key: ExporterKey) -> bool {
        match tokio::time::timeout(self.lookup_timeout, self.resolver.resolve(&key)).await {
            Ok(Ok(mut meta)) => {
                meta.flow_version = self
                    .shard(&key)
                    .lock()
                    .peek(&key)
                    .and_then(|slot| slot.meta.flow_version);
                self.insert(key, meta);
                true
            }
            Ok(Err(e)) => {
                debug!(exporter = %key, error = %e, "background refresh failed");
                false
            }
            Err(_) => {
                debug!(exporter = %key, "background refresh timed out");
                false
            }
        }
    }

    /// 메모리 압력을 확인하고 high-water를 넘었으면 low-water 아래까지 제거합니다.
    ///
    /// 가장 먼저 삽입된 엔트리부터 제거하며 최근 접근 여부는 무시합니다.
    /// 제거한 엔트리 수를 반환합니다.
    pub fn apply_memory_pressure(&self) -> usize {
        let budget = self.budget.load(Ordering::Relaxed);
        let high = budget / 100 * usize::from(self.high_water_percent);
        let low = budget / 100 * usize::from(self.low_water_percent);
        let before = self.memory.load(Ordering::Relaxed);
        if before <= high {
            return 0;
        }

        let mut by_age: Vec<(u64, ExporterKey)> = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            by_age.extend(shard.lock().iter().map(|(key, slot)| (slot.inserted, *key)));
        }
        by_age.sort_unstable_by_key(|(inserted, _)| *inserted);

        let mut evicted = 0;
        for (_, key) in by_age {
            if self.memory.load(Ordering::Relaxed) < low {
                break;
            }
            if self.remove_entry(&key) {
                evicted += 1;
            }
        }

        metrics::gauge!(m::DEVICE_CACHE_ENTRIES).set(self.len() as f64);
        info!(
            evicted,
            memory_before = before,
            memory_after = self.memory.load(Ordering::Relaxed),
            "device cache memory pressure eviction"
        );
        evicted
    }

    /// 메모리 예산을 변경합니다. 다음 압력 샘플링부터 적용됩니다.
    pub fn set_memory_budget(&self, bytes: usize) {
        self.budget.store(bytes, Ordering::Relaxed);
    }

    /// 히트율 (조회가 없으면 0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// 캐시 게이지를 갱신합니다.
    pub fn publish_metrics(&self) {
        metrics::gauge!(m::DEVICE_CACHE_HIT_RATIO).set(self.hit_ratio());
        metrics::gauge!(m::DEVICE_CACHE_ENTRIES).set(self.len() as f64);
    }

    /// 엔트리 존재 여부 (접근 시각은 갱신하지 않음)
    pub fn contains(&self, key: &ExporterKey) -> bool {
        self.shard(key).lock().contains(key)
    }

    /// 엔트리 수
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    /// 캐시가 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 추정 메모리 사용량 (바이트)
    pub fn memory_used(&self) -> usize {
        self.memory.load(Ordering::Relaxed)
    }

    /// 누적 제거 수
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// 누적 조회 실패 수
    pub fn lookup_failures(&self) -> u64 {
        self.lookup_failures.load(Ordering::Relaxed)
    }
}

/// 백그라운드 갱신 태스크를 시작합니다.
///
/// 취소되면 큐에 남은 요청을 `drain_deadline`까지 처리하고,
/// 재시작할 수 있도록 수신기를 반환합니다.
pub fn spawn_refresher(
    cache: Arc<DeviceCache>,
    mut rx: mpsc::Receiver<ExporterKey>,
    cancel: CancellationToken,
    drain_deadline: Duration,
) -> JoinHandle<mpsc::Receiver<ExporterKey>> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                key = rx.recv() => match key {
                    Some(key) => {
                        cache.refresh(key).await;
                    }
                    None => return rx,
                },
            }
        }

        let deadline = Instant::now() + drain_deadline;
        let mut drained = 0usize;
        while let Ok(key) = rx.try_recv() {
            if Instant::now() >= deadline {
                let mut abandoned = 1usize;
                while rx.try_recv().is_ok() {
                    abandoned += 1;
                }
                warn!(abandoned, "refresh queue not drained before deadline");
                break;
            }
            cache.refresh(key).await;
            drained += 1;
        }
        debug!(drained, "device refresher stopped");
        rx
    })
}
