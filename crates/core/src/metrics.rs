//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 수집 파이프라인은 이 상수로 `metrics::counter!()`, `metrics::gauge!()`,
//! `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `ironflow_`
//! - 단계명: `collector_`, `decoder_`, `template_`, `device_cache_`, `validator_`,
//!   `batch_`, `worker_`, `forward_`, `daemon_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(ironflow_core::metrics::COLLECTOR_PACKETS_RECEIVED_TOTAL,
//!     ironflow_core::metrics::LABEL_PORT => "2055").increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 프로토콜 레이블 키 (netflow_v5, netflow_v9, ipfix, sflow_v4, sflow_v5)
pub const LABEL_PROTOCOL: &str = "protocol";

/// 에러 종류 레이블 키 (truncated, length_mismatch, unsupported_version, malformed)
pub const LABEL_KIND: &str = "kind";

/// 검증 거부 사유 레이블 키
pub const LABEL_REASON: &str = "reason";

/// 원인 레이블 키 (capacity, pressure, ttl, queue_full, deadline)
pub const LABEL_CAUSE: &str = "cause";

/// 수신 포트 레이블 키
pub const LABEL_PORT: &str = "port";

// ─── Collector 메트릭 ───────────────────────────────────────────────

/// Collector: 수신한 UDP 데이터그램 수 (counter, label: port)
pub const COLLECTOR_PACKETS_RECEIVED_TOTAL: &str = "ironflow_collector_packets_received_total";

/// Collector: 초당 수신 패킷 수 (gauge)
pub const COLLECTOR_PACKETS_PER_SECOND: &str = "ironflow_collector_packets_per_second";

/// Collector: 소켓 수신 에러 수 (counter, label: port)
pub const COLLECTOR_RECEIVE_ERRORS_TOTAL: &str = "ironflow_collector_receive_errors_total";

// ─── Decoder 메트릭 ─────────────────────────────────────────────────

/// Decoder: 디코딩된 플로우 레코드 수 (counter, label: protocol)
pub const DECODER_FLOWS_DECODED_TOTAL: &str = "ironflow_decoder_flows_decoded_total";

/// Decoder: 디코드 에러 수 (counter, labels: protocol, kind)
pub const DECODER_ERRORS_TOTAL: &str = "ironflow_decoder_errors_total";

/// Decoder: 건너뛴 sFlow 샘플 수 (counter, label: protocol)
pub const DECODER_SFLOW_SAMPLES_SKIPPED_TOTAL: &str =
    "ironflow_decoder_sflow_samples_skipped_total";

// ─── Template 메트릭 ────────────────────────────────────────────────

/// Template: 알 수 없는 템플릿을 참조한 데이터 셋 수 (counter, label: protocol)
pub const TEMPLATE_MISSES_TOTAL: &str = "ironflow_template_misses_total";

/// Template: 대기 버퍼가 가득 차 버려진 데이터 셋 수 (counter)
pub const TEMPLATE_PENDING_DROPPED_TOTAL: &str = "ironflow_template_pending_dropped_total";

/// Template: 학습된 템플릿 수 (counter, label: protocol)
pub const TEMPLATE_LEARNED_TOTAL: &str = "ironflow_template_learned_total";

/// Template: 제거된 템플릿 수 (counter, label: cause)
pub const TEMPLATE_EVICTED_TOTAL: &str = "ironflow_template_evicted_total";

/// Template: 활성 템플릿 수 (gauge)
pub const TEMPLATE_ACTIVE: &str = "ironflow_template_active";

// ─── Device Cache 메트릭 ────────────────────────────────────────────

/// Device Cache: 캐시 히트 수 (counter)
pub const DEVICE_CACHE_HITS_TOTAL: &str = "ironflow_device_cache_hits_total";

/// Device Cache: 캐시 미스 수 (counter)
pub const DEVICE_CACHE_MISSES_TOTAL: &str = "ironflow_device_cache_misses_total";

/// Device Cache: 제거된 엔트리 수 (counter, label: cause)
pub const DEVICE_CACHE_EVICTIONS_TOTAL: &str = "ironflow_device_cache_evictions_total";

/// Device Cache: 메타데이터 조회 실패 수 (counter)
pub const DEVICE_CACHE_LOOKUP_FAILURES_TOTAL: &str = "ironflow_device_cache_lookup_failures_total";

/// Device Cache: 히트 비율 (gauge, 0.0~1.0)
pub const DEVICE_CACHE_HIT_RATIO: &str = "ironflow_device_cache_hit_ratio";

/// Device Cache: 상주 엔트리 수 (gauge)
pub const DEVICE_CACHE_ENTRIES: &str = "ironflow_device_cache_entries";

// ─── Validator 메트릭 ───────────────────────────────────────────────

/// Validator: 거부된 레코드 수 (counter, label: reason)
pub const VALIDATOR_REJECTED_TOTAL: &str = "ironflow_validator_rejected_total";

// ─── Batch 메트릭 ───────────────────────────────────────────────────

/// Batch: 플러시된 배치 크기 (histogram, 레코드 수)
pub const BATCH_SIZE: &str = "ironflow_batch_size";

/// Batch: 현재 적응형 목표 배치 크기 (gauge)
pub const BATCH_TARGET_SIZE: &str = "ironflow_batch_target_size";

/// Batch: 배치 처리 지연 시간 (histogram, 초)
pub const BATCH_FLUSH_DURATION_SECONDS: &str = "ironflow_batch_flush_duration_seconds";

/// Batch: 싱크에 제출된 배치 수 (counter)
pub const BATCH_FLUSHED_TOTAL: &str = "ironflow_batch_flushed_total";

/// Batch: 버려진 배치 수 (counter, label: cause)
pub const BATCH_DROPPED_TOTAL: &str = "ironflow_batch_dropped_total";

// ─── Worker 메트릭 ──────────────────────────────────────────────────

/// Worker: 작업 큐 깊이 (gauge)
pub const WORKER_QUEUE_DEPTH: &str = "ironflow_worker_queue_depth";

/// Worker: 싱크 제출 실패 수 (counter)
pub const WORKER_SINK_ERRORS_TOTAL: &str = "ironflow_worker_sink_errors_total";

/// Worker: 백프레셔 대기 발생 수 (counter)
pub const WORKER_BACKPRESSURE_TOTAL: &str = "ironflow_worker_backpressure_total";

// ─── Forward 메트릭 ─────────────────────────────────────────────────

/// Forward: 구독자 채널이 가득 차 버려진 전달 수 (counter)
pub const FORWARD_DROPPED_TOTAL: &str = "ironflow_forward_dropped_total";

/// Forward: 활성 구독자 수 (gauge)
pub const FORWARD_SUBSCRIBERS: &str = "ironflow_forward_subscribers";

// ─── Daemon 메트릭 ──────────────────────────────────────────────────

/// Daemon: 가동 시간 (gauge, 초)
pub const DAEMON_UPTIME_SECONDS: &str = "ironflow_daemon_uptime_seconds";

/// Daemon: 빌드 정보 (gauge, 항상 1, label: version)
pub const DAEMON_BUILD_INFO: &str = "ironflow_daemon_build_info";

// ─── 히스토그램 버킷 정의 ────────────────────────────────────────────

/// 배치 처리 지연 시간 히스토그램 버킷 (초)
///
/// 1ms ~ 10s 범위 (기본 목표 지연 100ms 중심)
pub const FLUSH_DURATION_BUCKETS: [f64; 10] =
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 10.0];

/// 배치 크기 히스토그램 버킷 (레코드 수)
pub const BATCH_SIZE_BUCKETS: [f64; 8] = [
    50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출합니다.
/// 일반적으로 `ironflow-daemon`의 시작 시점에서 호출합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    // Collector
    describe_counter!(
        COLLECTOR_PACKETS_RECEIVED_TOTAL,
        "Total number of UDP datagrams received per listen port"
    );
    describe_gauge!(
        COLLECTOR_PACKETS_PER_SECOND,
        "Datagram receive rate over the last sampling interval"
    );
    describe_counter!(
        COLLECTOR_RECEIVE_ERRORS_TOTAL,
        "Total number of socket receive failures"
    );

    // Decoder
    describe_counter!(
        DECODER_FLOWS_DECODED_TOTAL,
        "Total number of flow records decoded per protocol"
    );
    describe_counter!(
        DECODER_ERRORS_TOTAL,
        "Total number of malformed datagrams or records by protocol and kind"
    );
    describe_counter!(
        DECODER_SFLOW_SAMPLES_SKIPPED_TOTAL,
        "Total number of unsupported or malformed sFlow samples skipped"
    );

    // Template
    describe_counter!(
        TEMPLATE_MISSES_TOTAL,
        "Data sets referencing an unknown or expired template"
    );
    describe_counter!(
        TEMPLATE_PENDING_DROPPED_TOTAL,
        "Data sets dropped because the per-exporter pending buffer was full"
    );
    describe_counter!(
        TEMPLATE_LEARNED_TOTAL,
        "Template definitions learned or refreshed"
    );
    describe_counter!(
        TEMPLATE_EVICTED_TOTAL,
        "Templates removed by TTL, withdrawal or table capacity"
    );
    describe_gauge!(TEMPLATE_ACTIVE, "Number of templates currently held");

    // Device Cache
    describe_counter!(DEVICE_CACHE_HITS_TOTAL, "Device cache hits");
    describe_counter!(DEVICE_CACHE_MISSES_TOTAL, "Device cache misses");
    describe_counter!(
        DEVICE_CACHE_EVICTIONS_TOTAL,
        "Device cache evictions by cause (capacity, pressure)"
    );
    describe_counter!(
        DEVICE_CACHE_LOOKUP_FAILURES_TOTAL,
        "Device metadata lookups that failed or timed out"
    );
    describe_gauge!(DEVICE_CACHE_HIT_RATIO, "Device cache hit ratio (0.0-1.0)");
    describe_gauge!(DEVICE_CACHE_ENTRIES, "Resident device cache entries");

    // Validator
    describe_counter!(
        VALIDATOR_REJECTED_TOTAL,
        "Flow records rejected by validation, by reason"
    );

    // Batch
    describe_histogram!(BATCH_SIZE, "Number of records per flushed batch");
    describe_gauge!(
        BATCH_TARGET_SIZE,
        "Current adaptive maximum batch size"
    );
    describe_histogram!(
        BATCH_FLUSH_DURATION_SECONDS,
        "Time to hand one batch to storage and forwarders in seconds"
    );
    describe_counter!(BATCH_FLUSHED_TOTAL, "Batches submitted to the sink");
    describe_counter!(
        BATCH_DROPPED_TOTAL,
        "Batches dropped by cause (queue_full, deadline)"
    );

    // Worker
    describe_gauge!(WORKER_QUEUE_DEPTH, "Flush jobs waiting in the worker queue");
    describe_counter!(
        WORKER_SINK_ERRORS_TOTAL,
        "Batches the storage sink failed to accept"
    );
    describe_counter!(
        WORKER_BACKPRESSURE_TOTAL,
        "Submissions that had to wait for queue capacity"
    );

    // Forward
    describe_counter!(
        FORWARD_DROPPED_TOTAL,
        "Forward deliveries dropped because a subscriber channel was full"
    );
    describe_gauge!(FORWARD_SUBSCRIBERS, "Active forward subscribers");

    // Daemon
    describe_gauge!(DAEMON_UPTIME_SECONDS, "Ironflow daemon uptime in seconds");
    describe_gauge!(
        DAEMON_BUILD_INFO,
        "Build information (always 1, with version label)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_METRIC_NAMES: &[&str] = &[
        COLLECTOR_PACKETS_RECEIVED_TOTAL,
        COLLECTOR_PACKETS_PER_SECOND,
        COLLECTOR_RECEIVE_ERRORS_TOTAL,
        DECODER_FLOWS_DECODED_TOTAL,
        DECODER_ERRORS_TOTAL,
        DECODER_SFLOW_SAMPLES_SKIPPED_TOTAL,
        TEMPLATE_MISSES_TOTAL,
        TEMPLATE_PENDING_DROPPED_TOTAL,
        TEMPLATE_LEARNED_TOTAL,
        TEMPLATE_EVICTED_TOTAL,
        TEMPLATE_ACTIVE,
        DEVICE_CACHE_HITS_TOTAL,
        DEVICE_CACHE_MISSES_TOTAL,
        DEVICE_CACHE_EVICTIONS_TOTAL,
        DEVICE_CACHE_LOOKUP_FAILURES_TOTAL,
        DEVICE_CACHE_HIT_RATIO,
        DEVICE_CACHE_ENTRIES,
        VALIDATOR_REJECTED_TOTAL,
        BATCH_SIZE,
        BATCH_TARGET_SIZE,
        BATCH_FLUSH_DURATION_SECONDS,
        BATCH_FLUSHED_TOTAL,
        BATCH_DROPPED_TOTAL,
        WORKER_QUEUE_DEPTH,
        WORKER_SINK_ERRORS_TOTAL,
        WORKER_BACKPRESSURE_TOTAL,
        FORWARD_DROPPED_TOTAL,
        FORWARD_SUBSCRIBERS,
        DAEMON_UPTIME_SECONDS,
        DAEMON_BUILD_INFO,
    ];

    #[test]
    fn all_metrics_start_with_ironflow_prefix() {
        for name in ALL_METRIC_NAMES {
            assert!(
                name.starts_with("ironflow_"),
                "Metric '{}' does not start with 'ironflow_' prefix",
                name
            );
        }
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names: Vec<&str> = ALL_METRIC_NAMES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ALL_METRIC_NAMES.len());
    }

    #[test]
    fn counters_end_with_total() {
        let counters = [
            COLLECTOR_PACKETS_RECEIVED_TOTAL,
            DECODER_ERRORS_TOTAL,
            TEMPLATE_MISSES_TOTAL,
            VALIDATOR_REJECTED_TOTAL,
            BATCH_DROPPED_TOTAL,
        ];
        for name in counters {
            assert!(name.ends_with("_total"), "{name}");
        }
    }

    #[test]
    fn describe_all_does_not_panic() {
        describe_all();
    }

    #[test]
    fn label_keys_are_lowercase() {
        let labels = [LABEL_PROTOCOL, LABEL_KIND, LABEL_REASON, LABEL_CAUSE, LABEL_PORT];
        for label in &labels {
            assert_eq!(label.to_lowercase(), *label);
        }
    }

    #[test]
    fn buckets_are_sorted() {
        for buckets in [&FLUSH_DURATION_BUCKETS[..], &BATCH_SIZE_BUCKETS[..]] {
            for i in 1..buckets.len() {
                assert!(buckets[i] > buckets[i - 1]);
            }
        }
    }
}
