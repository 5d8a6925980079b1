//! 수신 경로 처리기
//!
//! 수신 태스크가 데이터그램마다 호출합니다.
//!
//! ```text
//! RawPacket -> Dispatcher -> DeviceCache -> Validator -> BatchAccumulator -> WorkerPool
//! ```
//!
//! 패킷/레코드 단위 실패는 여기서 카운트되고 버려지며 수신 루프로 전파되지 않습니다.
//! 대기할 수 있는 지점은 디바이스 캐시 미스 조회(타임아웃)와
//! 작업 큐 제출(백프레셔) 두 곳뿐입니다.

use std::sync::Arc;
use std::time::Instant;

use ironflow_core::metrics as m;
use ironflow_core::types::{system_time_millis, FlowBatch, FlowRecord};
use tracing::{debug, trace};

use crate::batch::BatchAccumulator;
use crate::collector::RawPacket;
use crate::device_cache::DeviceCache;
use crate::dispatcher::ProtocolDispatcher;
use crate::error::DecodeError;
use crate::stats::CollectorStats;
use crate::validator::RecordValidator;
use crate::worker::{PoolHandle, SubmitOutcome};

/// 데이터그램 하나의 처리 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOutcome {
    /// 디코드된 레코드 수
    pub decoded: usize,
    /// 검증을 통과해 누적된 레코드 수
    pub accepted: usize,
    /// 검증 거부 수
    pub rejected: usize,
    /// 디코드 에러 수 (데이터그램 전체 실패 포함)
    pub errors: usize,
    /// 이 데이터그램으로 플러시된 배치 수
    pub batches: usize,
}

/// 수신 태스크 하나의 처리기
///
/// 배치 누적기를 소유하므로 수신 태스크마다 하나씩 생성합니다.
pub struct PacketProcessor {
    dispatcher: ProtocolDispatcher,
    cache: Arc<DeviceCache>,
    validator: Arc<RecordValidator>,
    accumulator: BatchAccumulator,
    pool: PoolHandle,
    stats: Arc<CollectorStats>,
}

impl PacketProcessor {
    /// 새 처리기를 생성합니다.
    pub fn new(
        dispatcher: ProtocolDispatcher,
        cache: Arc<DeviceCache>,
        validator: Arc<RecordValidator>,
        accumulator: BatchAccumulator,
        pool: PoolHandle,
        stats: Arc<CollectorStats>,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            validator,
            accumulator,
            pool,
            stats,
        }
    }

    /// 데이터그램 하나를 처리합니다.
    pub async fn process(&mut self, packet: RawPacket) -> PacketOutcome {
        let mut outcome = PacketOutcome::default();
        self.stats.record_packet();
        metrics::counter!(
            m::COLLECTOR_PACKETS_RECEIVED_TOTAL,
            m::LABEL_PORT => packet.local_port.to_string()
        )
        .increment(1);

        let now = Instant::now();
        let output = match self.dispatcher.decode(&packet, now) {
            Ok(output) => output,
            Err(failure) => {
                let protocol = failure.version.map_or("unknown", |v| v.as_str());
                self.stats.record_failed_packet(&failure.error);
                count_decode_error(protocol, &failure.error);
                debug!(
                    source = %packet.source,
                    protocol,
                    error = %failure.error,
                    "datagram dropped"
                );
                outcome.errors = 1;
                return outcome;
            }
        };

        let protocol = output.version.as_str();
        for error in &output.errors {
            self.stats.record_decode_error(error);
            count_decode_error(protocol, error);
            trace!(source = %packet.source, protocol, error = %error, "partial decode failure");
        }
        outcome.errors = output.errors.len();
        self.stats.record_template_misses(output.stats.template_misses);
        if output.stats.samples_skipped > 0 {
            self.stats.record_samples_skipped(output.stats.samples_skipped);
            metrics::counter!(
                m::DECODER_SFLOW_SAMPLES_SKIPPED_TOTAL,
                m::LABEL_PROTOCOL => protocol
            )
            .increment(output.stats.samples_skipped);
        }

        outcome.decoded = output.records.len();
        if output.records.is_empty() {
            return outcome;
        }
        self.stats.record_decoded(outcome.decoded);
        metrics::counter!(m::DECODER_FLOWS_DECODED_TOTAL, m::LABEL_PROTOCOL => protocol)
            .increment(outcome.decoded as u64);

        let device = self
            .cache
            .get_or_resolve(output.exporter, output.version)
            .await;
        let received_ms = system_time_millis(packet.received_at);

        let mut accepted: Vec<FlowRecord> = Vec::with_capacity(output.records.len());
        for mut record in output.records {
            if !device.placeholder {
                record.push_extra("device_name", &device.name);
            }
            match self.validator.validate(record, received_ms) {
                Ok(record) => accepted.push(record),
                Err(reason) => {
                    outcome.rejected += 1;
                    metrics::counter!(m::VALIDATOR_REJECTED_TOTAL, m::LABEL_REASON => reason.as_str())
                        .increment(1);
                    trace!(source = %packet.source, %reason, "record rejected");
                }
            }
        }
        outcome.accepted = accepted.len();
        self.stats.record_validation(outcome.accepted, outcome.rejected);

        let batches = self.accumulator.append_all(accepted, now);
        outcome.batches = batches.len();
        self.submit_all(batches).await;
        outcome
    }

    /// 최대 대기 시간을 넘긴 배치를 플러시합니다.
    pub async fn flush_expired(&mut self, now: Instant) -> usize {
        let batches = self.accumulator.flush_expired(now);
        let count = batches.len();
        self.submit_all(batches).await;
        count
    }

    /// 누적 중인 배치를 모두 플러시합니다 (종료 시).
    pub async fn flush_all(&mut self) -> usize {
        let batches = self.accumulator.flush_all();
        let count = batches.len();
        self.submit_all(batches).await;
        count
    }

    /// 누적 중인 레코드 수
    pub fn pending_records(&self) -> usize {
        self.accumulator.pending_records()
    }

    /// 수신 에러를 기록합니다.
    pub fn record_receive_error(&self, port: u16) {
        self.stats.record_receive_error();
        metrics::counter!(m::COLLECTOR_RECEIVE_ERRORS_TOTAL, m::LABEL_PORT => port.to_string())
            .increment(1);
    }

    async fn submit_all(&self, batches: Vec<FlowBatch>) {
        for batch in batches {
            if self.pool.submit(batch).await == SubmitOutcome::Dropped {
                trace!("batch dropped at submit");
            }
        }
    }
}

fn count_decode_error(protocol: &'static str, error: &DecodeError) {
    metrics::counter!(
        m::DECODER_ERRORS_TOTAL,
        m::LABEL_PROTOCOL => protocol,
        m::LABEL_KIND => error.kind()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::AdaptiveBatchSize;
    use crate::device_cache::{DeviceCacheSettings, StaticResolver};
    use crate::forward::ForwardHub;
    use crate::sink::MemorySink;
    use crate::template::TemplateManager;
    use crate::worker::{WorkerPool, WorkerSettings};
    use bytes::{BufMut, Bytes, BytesMut};
    use ironflow_core::config::{BackpressurePolicy, StaticDevice};
    use std::time::{Duration, SystemTime};

    fn v5_packet(records: &[(u32, u32)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(5);
        buf.put_u16(records.len() as u16);
        buf.put_u32(60_000);
        buf.put_u32(1_700_000_000);
        buf.put_u32(0);
        buf.put_u32(1);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u16(0);
        for (octets, packets) in records {
            buf.put_slice(&[10, 0, 0, 1]);
            buf.put_slice(&[10, 0, 0, 2]);
            buf.put_slice(&[0, 0, 0, 0]);
            buf.put_u16(1);
            buf.put_u16(2);
            buf.put_u32(*packets);
            buf.put_u32(*octets);
            buf.put_u32(50_000);
            buf.put_u32(59_000);
            buf.put_u16(1234);
            buf.put_u16(80);
            buf.put_u8(0);
            buf.put_u8(0x18);
            buf.put_u8(6);
            buf.put_u8(0);
            buf.put_u16(0);
            buf.put_u16(0);
            buf.put_u8(24);
            buf.put_u8(24);
            buf.put_u16(0);
        }
        buf.freeze()
    }

    struct Harness {
        processor: PacketProcessor,
        pool: WorkerPool,
        sink: Arc<MemorySink>,
        stats: Arc<CollectorStats>,
    }

    fn harness(batch_size: usize, devices: Vec<StaticDevice>) -> Harness {
        let stats = Arc::new(CollectorStats::new());
        let sink = Arc::new(MemorySink::new());
        let sizing = Arc::new(AdaptiveBatchSize::new(
            1,
            1000,
            batch_size,
            10,
            Duration::from_millis(100),
        ));
        let (pool, handle) = WorkerPool::start(
            WorkerSettings {
                workers: 1,
                queue_capacity: 8,
                policy: BackpressurePolicy::Block,
                backpressure_timeout: Duration::from_secs(1),
            },
            sink.clone(),
            Arc::new(ForwardHub::new(4)),
            Arc::clone(&sizing),
            Arc::clone(&stats),
        );
        let (cache, _rx) = DeviceCache::new(
            DeviceCacheSettings {
                capacity: 16,
                memory_budget: 1 << 20,
                high_water_percent: 90,
                low_water_percent: 70,
                lookup_timeout: Duration::from_millis(50),
                refresh_queue: 4,
            },
            Arc::new(StaticResolver::from_config(&devices).unwrap()),
        );
        let processor = PacketProcessor::new(
            ProtocolDispatcher::new(Arc::new(TemplateManager::new(
                Duration::from_secs(60),
                100,
                4,
            ))),
            Arc::new(cache),
            Arc::new(RecordValidator::new()),
            BatchAccumulator::new(sizing, Duration::from_secs(60)),
            handle,
            Arc::clone(&stats),
        );
        Harness {
            processor,
            pool,
            sink,
            stats,
        }
    }

    fn raw(data: Bytes) -> RawPacket {
        RawPacket {
            data,
            source: "10.9.9.9:5000".parse().unwrap(),
            received_at: SystemTime::now(),
            local_port: 2055,
        }
    }

    #[tokio::test]
    async fn decoded_records_reach_sink_with_device_name() {
        let mut h = harness(
            2,
            vec![StaticDevice {
                address: "10.9.9.9".to_owned(),
                name: "edge-1".to_owned(),
                device_type: "router".to_owned(),
            }],
        );
        let outcome = h.processor.process(raw(v5_packet(&[(1500, 2), (3000, 3)]))).await;
        assert_eq!(outcome.decoded, 2);
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.batches, 1);

        assert!(h.sink.wait_for_records(2, Duration::from_secs(5)).await);
        let records = h.sink.records();
        assert_eq!(records[0].bytes, 1500);
        assert_eq!(records[1].bytes, 3000);
        assert_eq!(records[0].extra("device_name"), Some("edge-1"));
        h.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn invalid_records_rejected_others_kept() {
        let mut h = harness(10, Vec::new());
        // 바이트가 있는데 패킷이 0인 레코드는 거부
        let outcome = h.processor.process(raw(v5_packet(&[(1500, 0), (3000, 3)]))).await;
        assert_eq!(outcome.decoded, 2);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(h.processor.pending_records(), 1);
        assert_eq!(h.stats.records_rejected(), 1);

        assert_eq!(h.processor.flush_all().await, 1);
        assert!(h.sink.wait_for_records(1, Duration::from_secs(5)).await);
        assert!(h.sink.records()[0].extra("device_name").is_none());
        h.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn malformed_datagram_counted_and_next_processed() {
        let mut h = harness(1, Vec::new());
        let outcome = h.processor.process(raw(Bytes::from_static(&[0, 5, 0]))).await;
        assert_eq!(outcome.errors, 1);
        assert_eq!(outcome.decoded, 0);
        assert_eq!(h.stats.decode_errors("truncated"), 1);

        let outcome = h.processor.process(raw(v5_packet(&[(100, 1)]))).await;
        assert_eq!(outcome.accepted, 1);
        assert!(h.sink.wait_for_records(1, Duration::from_secs(5)).await);
        h.pool.shutdown(Duration::from_secs(1)).await;
    }
}
