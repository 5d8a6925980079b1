//! 배치 누적기 -- 익스포터별 레코드 누적 및 적응형 플러시 크기
//!
//! [`BatchAccumulator`]는 검증된 레코드를 익스포터별로 모으고,
//! 다음 중 먼저 충족되는 조건에서 배치를 플러시합니다.
//! - 배치가 현재 목표 크기에 도달
//! - 빈 배치에 첫 레코드가 들어온 뒤 최대 대기 시간 경과
//!
//! [`AdaptiveBatchSize`]는 워커가 측정한 처리 시간을 목표 지연과 비교해
//! 다음 배치의 목표 크기를 `step_percent`만큼 늘리거나 줄입니다.
//! 목표 크기는 항상 `[min, max]` 범위로 제한됩니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ironflow_core::metrics as m;
use ironflow_core::types::{ExporterKey, FlowBatch, FlowRecord};

use crate::config::PipelineConfig;

/// 적응형 배치 크기
///
/// 워커 풀과 모든 누적기가 공유합니다.
#[derive(Debug)]
pub struct AdaptiveBatchSize {
    current: AtomicUsize,
    min: usize,
    max: usize,
    step_percent: u32,
    target: Duration,
}

impl AdaptiveBatchSize {
    /// 새 적응형 크기를 생성합니다. `initial`은 범위로 제한됩니다.
    pub fn new(min: usize, max: usize, initial: usize, step_percent: u32, target: Duration) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            current: AtomicUsize::new(initial.clamp(min, max)),
            min,
            max,
            step_percent,
            target,
        }
    }

    /// 파이프라인 설정으로 생성합니다.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.batch_min,
            config.batch_max,
            config.batch_initial,
            config.step_percent,
            config.target_latency,
        )
    }

    /// 현재 목표 크기
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// 최소 크기
    pub fn min(&self) -> usize {
        self.min
    }

    /// 최대 크기
    pub fn max(&self) -> usize {
        self.max
    }

    fn next_size(&self, current: usize, elapsed: Duration) -> usize {
        let step = (current.saturating_mul(self.step_percent as usize) / 100).max(1);
        let next = if elapsed < self.target {
            current.saturating_add(step)
        } else if elapsed > self.target {
            current.saturating_sub(step)
        } else {
            current
        };
        next.clamp(self.min, self.max)
    }

    /// 플러시 처리 시간을 반영하고 새 목표 크기를 반환합니다.
    pub fn observe(&self, elapsed: Duration) -> usize {
        let previous = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(self.next_size(current, elapsed))
            })
            .unwrap_or_else(|current| current);
        let next = self.next_size(previous, elapsed);
        metrics::gauge!(m::BATCH_TARGET_SIZE).set(next as f64);
        next
    }
}

/// 배치 일련번호 상태를 유지하는 유휴 기간 기본값
///
/// 이 기간 동안 배치를 플러시하지 않은 익스포터는 일련번호가 0부터 다시 시작합니다.
pub const DEFAULT_SEQUENCE_IDLE: Duration = Duration::from_secs(300);

/// 유휴 일련번호 정리 최소 간격
const SEQUENCE_PRUNE_INTERVAL: Duration = Duration::from_secs(10);

/// 익스포터별 배치 일련번호
#[derive(Debug, Clone, Copy)]
struct SequenceState {
    next: u64,
    last_flush: Instant,
}

/// 누적 중인 배치
#[derive(Debug)]
struct PendingBatch {
    records: Vec<FlowRecord>,
    /// 배치 생성 시점의 목표 크기
    limit: usize,
    created_at: SystemTime,
    started: Instant,
}

/// 익스포터별 배치 누적기
///
/// 수신 태스크 하나가 소유하며 잠금 없이 동작합니다.
/// 같은 익스포터의 레코드는 추가된 순서대로 배치에 들어가고,
/// 배치 일련번호는 익스포터가 활동하는 동안 익스포터별로 단조 증가합니다.
#[derive(Debug)]
pub struct BatchAccumulator {
    sizing: Arc<AdaptiveBatchSize>,
    max_wait: Duration,
    pending: HashMap<ExporterKey, PendingBatch>,
    sequences: HashMap<ExporterKey, SequenceState>,
    sequence_idle: Duration,
    last_prune: Option<Instant>,
}

impl BatchAccumulator {
    /// 새 누적기를 생성합니다.
    pub fn new(sizing: Arc<AdaptiveBatchSize>, max_wait: Duration) -> Self {
        Self {
            sizing,
            max_wait,
            pending: HashMap::new(),
            sequences: HashMap::new(),
            sequence_idle: DEFAULT_SEQUENCE_IDLE,
            last_prune: None,
        }
    }

    /// 일련번호 상태를 유지할 유휴 기간을 설정합니다.
    pub fn with_sequence_idle(mut self, idle: Duration) -> Self {
        self.sequence_idle = idle;
        self
    }

    /// 레코드 하나를 추가합니다. 목표 크기에 도달하면 배치를 반환합니다.
    pub fn append(&mut self, record: FlowRecord, now: Instant) -> Option<FlowBatch> {
        let key = record.exporter;
        let batch = self.pending.entry(key).or_insert_with(|| {
            let limit = self.sizing.current();
            PendingBatch {
                records: Vec::with_capacity(limit.min(1024)),
                limit,
                created_at: SystemTime::now(),
                started: now,
            }
        });
        batch.records.push(record);
        if batch.records.len() >= batch.limit {
            return self.take(&key, now);
        }
        None
    }

    /// 레코드 여러 개를 순서대로 추가하고 완성된 배치를 반환합니다.
    pub fn append_all(
        &mut self,
        records: impl IntoIterator<Item = FlowRecord>,
        now: Instant,
    ) -> Vec<FlowBatch> {
        records
            .into_iter()
            .filter_map(|record| self.append(record, now))
            .collect()
    }

    /// 최대 대기 시간을 넘긴 배치를 플러시합니다. 오래된 배치부터 반환합니다.
    ///
    /// 주기적으로 유휴 익스포터의 일련번호 상태도 정리합니다.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<FlowBatch> {
        let prune_due = self
            .last_prune
            .is_none_or(|last| now.saturating_duration_since(last) >= SEQUENCE_PRUNE_INTERVAL);
        if prune_due {
            self.last_prune = Some(now);
            self.prune_idle_sequences(now);
        }

        let mut expired: Vec<(Instant, ExporterKey)> = self
            .pending
            .iter()
            .filter(|(_, batch)| now.saturating_duration_since(batch.started) >= self.max_wait)
            .map(|(key, batch)| (batch.started, *key))
            .collect();
        expired.sort_unstable_by_key(|(started, _)| *started);
        expired
            .into_iter()
            .filter_map(|(_, key)| self.take(&key, now))
            .collect()
    }

    /// 누적 중인 배치가 없고 유휴 기간 동안 플러시하지 않은 익스포터의
    /// 일련번호 상태를 제거합니다. 제거한 수를 반환합니다.
    pub fn prune_idle_sequences(&mut self, now: Instant) -> usize {
        let before = self.sequences.len();
        let idle = self.sequence_idle;
        let pending = &self.pending;
        self.sequences.retain(|key, state| {
            pending.contains_key(key) || now.saturating_duration_since(state.last_flush) < idle
        });
        let pruned = before - self.sequences.len();
        if pruned > 0 {
            tracing::debug!(pruned, "idle batch sequences removed");
        }
        pruned
    }

    /// 일련번호 상태를 보관 중인 익스포터 수
    pub fn tracked_exporters(&self) -> usize {
        self.sequences.len()
    }

    /// 남은 배치를 모두 플러시합니다 (종료 시).
    pub fn flush_all(&mut self) -> Vec<FlowBatch> {
        let now = Instant::now();
        let mut keys: Vec<(Instant, ExporterKey)> = self
            .pending
            .iter()
            .map(|(key, batch)| (batch.started, *key))
            .collect();
        keys.sort_unstable_by_key(|(started, _)| *started);
        keys.into_iter()
            .filter_map(|(_, key)| self.take(&key, now))
            .collect()
    }

    /// 가장 빠른 플러시 기한
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|batch| batch.started + self.max_wait)
            .min()
    }

    /// 누적 중인 레코드 수
    pub fn pending_records(&self) -> usize {
        self.pending.values().map(|batch| batch.records.len()).sum()
    }

    /// 누적 중인 배치 수
    pub fn pending_batches(&self) -> usize {
        self.pending.len()
    }

    fn take(&mut self, key: &ExporterKey, now: Instant) -> Option<FlowBatch> {
        let batch = self.pending.remove(key)?;
        if batch.records.is_empty() {
            return None;
        }
        let state = self.sequences.entry(*key).or_insert(SequenceState {
            next: 0,
            last_flush: now,
        });
        let current = state.next;
        state.next += 1;
        state.last_flush = now;
        Some(FlowBatch::new(
            *key,
            current,
            batch.records,
            batch.created_at,
            batch.created_at + self.max_wait,
        ))
    }
}
