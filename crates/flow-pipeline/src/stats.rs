//! 수집 통계
//!
//! Prometheus를 스크랩하지 않는 호출자(헬스 체크, 테스트, 임베딩)를 위해
//! 파이프라인 전 단계의 카운터를 원자 변수로 보관하고
//! [`MetricsSnapshot`]으로 내보냅니다.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::batch::AdaptiveBatchSize;
use crate::device_cache::DeviceCache;
use crate::error::DecodeError;

/// 디코드 에러 종류 레이블 (인덱스 순서 고정)
const DECODE_KINDS: [&str; 4] = [
    "truncated",
    "length_mismatch",
    "unsupported_version",
    "malformed",
];

fn decode_kind_index(error: &DecodeError) -> usize {
    match error {
        DecodeError::Truncated { .. } => 0,
        DecodeError::LengthMismatch { .. } => 1,
        DecodeError::UnsupportedVersion(_) => 2,
        DecodeError::Malformed(_) => 3,
    }
}

/// 비율 계산 구간
#[derive(Debug)]
struct RateWindow {
    at: Instant,
    packets: u64,
    failed_packets: u64,
    packets_per_second: f64,
    error_rate: f64,
}

/// 파이프라인 수집 통계
#[derive(Debug)]
pub struct CollectorStats {
    packets_received: AtomicU64,
    receive_errors: AtomicU64,
    failed_packets: AtomicU64,
    decode_errors: [AtomicU64; 4],
    flows_decoded: AtomicU64,
    records_accepted: AtomicU64,
    records_rejected: AtomicU64,
    template_misses: AtomicU64,
    samples_skipped: AtomicU64,
    batches_flushed: AtomicU64,
    records_flushed: AtomicU64,
    last_batch_size: AtomicUsize,
    last_flush_micros: AtomicU64,
    sink_errors: AtomicU64,
    batches_dropped: AtomicU64,
    backpressure_waits: AtomicU64,
    queue_depth: AtomicUsize,
    window: Mutex<RateWindow>,
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorStats {
    /// 빈 통계를 생성합니다.
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            failed_packets: AtomicU64::new(0),
            decode_errors: Default::default(),
            flows_decoded: AtomicU64::new(0),
            records_accepted: AtomicU64::new(0),
            records_rejected: AtomicU64::new(0),
            template_misses: AtomicU64::new(0),
            samples_skipped: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            records_flushed: AtomicU64::new(0),
            last_batch_size: AtomicUsize::new(0),
            last_flush_micros: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            backpressure_waits: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            window: Mutex::new(RateWindow {
                at: Instant::now(),
                packets: 0,
                failed_packets: 0,
                packets_per_second: 0.0,
                error_rate: 0.0,
            }),
        }
    }

    /// 데이터그램 수신
    pub fn record_packet(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// 소켓 수신 실패
    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 데이터그램 전체 디코드 실패
    pub fn record_failed_packet(&self, error: &DecodeError) {
        self.failed_packets.fetch_add(1, Ordering::Relaxed);
        self.record_decode_error(error);
    }

    /// FlowSet/샘플 단위 디코드 에러
    pub fn record_decode_error(&self, error: &DecodeError) {
        self.decode_errors[decode_kind_index(error)].fetch_add(1, Ordering::Relaxed);
    }

    /// 디코드된 레코드
    pub fn record_decoded(&self, count: usize) {
        self.flows_decoded.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// 검증 통과/거부
    pub fn record_validation(&self, accepted: usize, rejected: usize) {
        self.records_accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        self.records_rejected.fetch_add(rejected as u64, Ordering::Relaxed);
    }

    /// 템플릿 미스
    pub fn record_template_misses(&self, count: u64) {
        self.template_misses.fetch_add(count, Ordering::Relaxed);
    }

    /// 건너뛴 sFlow 샘플
    pub fn record_samples_skipped(&self, count: u64) {
        self.samples_skipped.fetch_add(count, Ordering::Relaxed);
    }

    /// 배치 플러시 완료
    pub fn record_flush(&self, records: usize, elapsed: Duration) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.records_flushed.fetch_add(records as u64, Ordering::Relaxed);
        self.last_batch_size.store(records, Ordering::Relaxed);
        self.last_flush_micros
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// 싱크 제출 실패
    pub fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 배치 폐기
    pub fn record_batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// 백프레셔 대기 발생
    pub fn record_backpressure(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// 작업 큐 깊이
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// 수신 데이터그램 수
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// 디코드된 레코드 수
    pub fn flows_decoded(&self) -> u64 {
        self.flows_decoded.load(Ordering::Relaxed)
    }

    /// 종류별 디코드 에러 수
    pub fn decode_errors(&self, kind: &str) -> u64 {
        DECODE_KINDS
            .iter()
            .position(|k| *k == kind)
            .map_or(0, |i| self.decode_errors[i].load(Ordering::Relaxed))
    }

    /// 디코드 에러 총합
    pub fn decode_errors_total(&self) -> u64 {
        self.decode_errors
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// 검증 거부 수
    pub fn records_rejected(&self) -> u64 {
        self.records_rejected.load(Ordering::Relaxed)
    }

    /// 플러시된 배치 수
    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    /// 버려진 배치 수
    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    /// 싱크 에러 수
    pub fn sink_errors(&self) -> u64 {
        self.sink_errors.load(Ordering::Relaxed)
    }

    /// 백프레셔 대기 수
    pub fn backpressure_waits(&self) -> u64 {
        self.backpressure_waits.load(Ordering::Relaxed)
    }

    /// 작업 큐 깊이
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// 직전 샘플 이후 초당 패킷 수와 실패 비율을 갱신합니다.
    ///
    /// 유지보수 태스크가 주기적으로 호출합니다. `(packets/sec, error_rate)`를 반환합니다.
    pub fn sample_rates(&self, now: Instant) -> (f64, f64) {
        let packets = self.packets_received.load(Ordering::Relaxed);
        let failed = self.failed_packets.load(Ordering::Relaxed);
        let mut window = self.window.lock();
        let elapsed = now.saturating_duration_since(window.at).as_secs_f64();
        if elapsed > 0.0 {
            let delta_packets = packets.saturating_sub(window.packets);
            let delta_failed = failed.saturating_sub(window.failed_packets);
            window.packets_per_second = delta_packets as f64 / elapsed;
            window.error_rate = if delta_packets == 0 {
                0.0
            } else {
                delta_failed as f64 / delta_packets as f64
            };
            window.at = now;
            window.packets = packets;
            window.failed_packets = failed;
        }
        (window.packets_per_second, window.error_rate)
    }

    /// 최근 샘플 구간의 실패 비율
    pub fn recent_error_rate(&self) -> f64 {
        self.window.lock().error_rate
    }

    /// 스냅샷을 생성합니다. 다른 구성요소가 소유한 값은 인자로 받습니다.
    pub fn snapshot(&self, cache_hit_ratio: f64, target_batch_size: usize) -> MetricsSnapshot {
        let (packets_per_second, error_rate) = {
            let window = self.window.lock();
            (window.packets_per_second, window.error_rate)
        };
        let packets = self.packets_received();
        let batches = self.batches_flushed();
        let records_flushed = self.records_flushed.load(Ordering::Relaxed);
        let template_misses = self.template_misses.load(Ordering::Relaxed);

        let mut errors_by_kind = BTreeMap::new();
        for (i, kind) in DECODE_KINDS.iter().enumerate() {
            errors_by_kind.insert(
                (*kind).to_owned(),
                self.decode_errors[i].load(Ordering::Relaxed),
            );
        }
        errors_by_kind.insert("template_miss".to_owned(), template_misses);
        errors_by_kind.insert("validation".to_owned(), self.records_rejected());
        errors_by_kind.insert(
            "receive".to_owned(),
            self.receive_errors.load(Ordering::Relaxed),
        );
        errors_by_kind.insert("sink".to_owned(), self.sink_errors());

        MetricsSnapshot {
            packets_received: packets,
            packets_per_second,
            flows_decoded: self.flows_decoded(),
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            cache_hit_ratio,
            average_batch_size: if batches == 0 {
                0.0
            } else {
                records_flushed as f64 / batches as f64
            },
            last_batch_size: self.last_batch_size.load(Ordering::Relaxed),
            target_batch_size,
            last_flush_ms: self.last_flush_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            batches_flushed: batches,
            batches_dropped: self.batches_dropped(),
            backpressure_waits: self.backpressure_waits(),
            errors_by_kind,
            template_misses,
            template_miss_rate: if packets == 0 {
                0.0
            } else {
                template_misses as f64 / packets as f64
            },
            samples_skipped: self.samples_skipped.load(Ordering::Relaxed),
            error_rate,
            queue_depth: self.queue_depth(),
        }
    }
}

/// 파이프라인 밖에서 스냅샷을 만들기 위한 핸들
///
/// 데몬이 파이프라인을 `Box<dyn DynPipeline>`으로 보관한 뒤에도
/// 메트릭을 조회할 수 있도록 필요한 구성요소만 공유합니다.
#[derive(Clone)]
pub struct SnapshotSource {
    stats: Arc<CollectorStats>,
    cache: Arc<DeviceCache>,
    sizing: Arc<AdaptiveBatchSize>,
}

impl SnapshotSource {
    /// 새 핸들을 생성합니다.
    pub fn new(
        stats: Arc<CollectorStats>,
        cache: Arc<DeviceCache>,
        sizing: Arc<AdaptiveBatchSize>,
    ) -> Self {
        Self {
            stats,
            cache,
            sizing,
        }
    }

    /// 현재 스냅샷
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.stats
            .snapshot(self.cache.hit_ratio(), self.sizing.current())
    }
}

/// 대시보드/헬스 체크용 메트릭 스냅샷
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// 수신 데이터그램 수
    pub packets_received: u64,
    /// 직전 샘플 구간의 초당 패킷 수
    pub packets_per_second: f64,
    /// 디코드된 레코드 수
    pub flows_decoded: u64,
    /// 검증 통과 레코드 수
    pub records_accepted: u64,
    /// 디바이스 캐시 히트율
    pub cache_hit_ratio: f64,
    /// 평균 배치 크기
    pub average_batch_size: f64,
    /// 마지막 배치 크기
    pub last_batch_size: usize,
    /// 현재 적응형 목표 배치 크기
    pub target_batch_size: usize,
    /// 마지막 플러시 처리 시간 (밀리초)
    pub last_flush_ms: f64,
    /// 플러시된 배치 수
    pub batches_flushed: u64,
    /// 버려진 배치 수
    pub batches_dropped: u64,
    /// 백프레셔 대기 수
    pub backpressure_waits: u64,
    /// 종류별 에러 수
    pub errors_by_kind: BTreeMap<String, u64>,
    /// 템플릿 미스 수
    pub template_misses: u64,
    /// 데이터그램당 템플릿 미스 비율
    pub template_miss_rate: f64,
    /// 건너뛴 sFlow 샘플 수
    pub samples_skipped: u64,
    /// 직전 샘플 구간의 데이터그램 실패 비율
    pub error_rate: f64,
    /// 작업 큐 깊이
    pub queue_depth: usize,
}
