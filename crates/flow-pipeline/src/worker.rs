//! 워커 풀 -- 배치 플러시 작업 실행
//!
//! 고정 크기 워커가 bounded 작업 큐에서 배치를 꺼내
//! 스토리지 싱크 제출과 포워더 전달을 수행합니다.
//! 플러시 I/O는 항상 수신 태스크 밖에서 실행됩니다.
//!
//! # 큐 포화
//! - [`BackpressurePolicy::Block`] (기본): `backpressure_timeout`까지 제출자가 대기,
//!   시간 초과 시 배치를 버리고 카운트
//! - [`BackpressurePolicy::Drop`]: 즉시 버리고 카운트
//!
//! # 종료
//! 새 작업을 거부하고, 진행 중/대기 중인 작업을 기한까지 처리합니다.
//! 기한 내 처리하지 못한 배치는 하나씩 `warn!`으로 기록합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ironflow_core::config::BackpressurePolicy;
use ironflow_core::metrics as m;
use ironflow_core::pipeline::FlowSink;
use ironflow_core::types::{ExporterKey, FlowBatch};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::AdaptiveBatchSize;
use crate::config::PipelineConfig;
use crate::forward::ForwardHub;
use crate::stats::CollectorStats;

/// 워커 풀 설정
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// 워커 수
    pub workers: usize,
    /// 작업 큐 용량
    pub queue_capacity: usize,
    /// 큐 포화 정책
    pub policy: BackpressurePolicy,
    /// `Block` 정책의 최대 대기 시간
    pub backpressure_timeout: Duration,
}

impl From<&PipelineConfig> for WorkerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            policy: config.backpressure,
            backpressure_timeout: config.backpressure_timeout,
        }
    }
}

/// 배치 제출 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 즉시 큐에 들어감
    Queued,
    /// 백프레셔 대기 후 큐에 들어감
    QueuedAfterWait,
    /// 버려짐 (큐 포화, 시간 초과, 종료 중)
    Dropped,
}

/// 플러시 작업
#[derive(Debug)]
struct FlushJob {
    batch: Arc<FlowBatch>,
    enqueued_at: Instant,
}

/// 진행 중인 작업 정보 (종료 시 손실 기록용)
#[derive(Debug, Clone, Copy)]
struct InFlight {
    batch_id: uuid::Uuid,
    exporter: ExporterKey,
    records: usize,
}

/// 종료 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// 종료 중 처리 완료된 배치 수
    pub completed: u64,
    /// 기한 내 처리하지 못한 배치 수
    pub lost: usize,
}

fn drop_batch(stats: &CollectorStats, batch: &FlowBatch, cause: &'static str) -> SubmitOutcome {
    stats.record_batch_dropped();
    metrics::counter!(m::BATCH_DROPPED_TOTAL, m::LABEL_CAUSE => cause).increment(1);
    warn!(
        batch_id = %batch.id,
        exporter = %batch.exporter,
        records = batch.len(),
        cause,
        "batch dropped"
    );
    SubmitOutcome::Dropped
}

/// 작업 제출 핸들
///
/// 수신 태스크마다 복제해서 사용합니다.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<FlushJob>,
    accepting: Arc<AtomicBool>,
    policy: BackpressurePolicy,
    timeout: Duration,
    stats: Arc<CollectorStats>,
}

impl PoolHandle {
    /// 배치를 작업 큐에 제출합니다.
    pub async fn submit(&self, batch: FlowBatch) -> SubmitOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            return drop_batch(&self.stats, &batch, "shutdown");
        }
        let job = FlushJob {
            batch: Arc::new(batch),
            enqueued_at: Instant::now(),
        };

        let outcome = match self.tx.try_send(job) {
            Ok(()) => SubmitOutcome::Queued,
            Err(mpsc::error::TrySendError::Closed(job)) => {
                drop_batch(&self.stats, &job.batch, "closed")
            }
            Err(mpsc::error::TrySendError::Full(job)) => match self.policy {
                BackpressurePolicy::Drop => drop_batch(&self.stats, &job.batch, "queue_full"),
                BackpressurePolicy::Block => {
                    self.stats.record_backpressure();
                    metrics::counter!(m::WORKER_BACKPRESSURE_TOTAL).increment(1);
                    match self.tx.send_timeout(job, self.timeout).await {
                        Ok(()) => SubmitOutcome::QueuedAfterWait,
                        Err(mpsc::error::SendTimeoutError::Timeout(job)) => {
                            drop_batch(&self.stats, &job.batch, "timeout")
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(job)) => {
                            drop_batch(&self.stats, &job.batch, "closed")
                        }
                    }
                }
            },
        };
        self.publish_depth();
        outcome
    }

    /// 현재 작업 큐 깊이
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// 작업 큐 용량
    pub fn queue_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    fn publish_depth(&self) {
        let depth = self.queue_depth();
        self.stats.set_queue_depth(depth);
        metrics::gauge!(m::WORKER_QUEUE_DEPTH).set(depth as f64);
    }
}

/// 워커 간 공유 상태
struct WorkerShared {
    rx: tokio::sync::Mutex<mpsc::Receiver<FlushJob>>,
    closing: CancellationToken,
    sink: Arc<dyn FlowSink>,
    forward: Arc<ForwardHub>,
    sizing: Arc<AdaptiveBatchSize>,
    stats: Arc<CollectorStats>,
    in_flight: parking_lot::Mutex<HashMap<usize, InFlight>>,
}

/// 워커 풀
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    accepting: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// 워커를 시작하고 제출 핸들을 반환합니다.
    pub fn start(
        settings: WorkerSettings,
        sink: Arc<dyn FlowSink>,
        forward: Arc<ForwardHub>,
        sizing: Arc<AdaptiveBatchSize>,
        stats: Arc<CollectorStats>,
    ) -> (Self, PoolHandle) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let accepting = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(WorkerShared {
            rx: tokio::sync::Mutex::new(rx),
            closing: CancellationToken::new(),
            sink,
            forward,
            sizing,
            stats: Arc::clone(&stats),
            in_flight: parking_lot::Mutex::new(HashMap::new()),
        });

        let count = settings.workers.max(1);
        let workers = (0..count)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&shared))))
            .collect();
        info!(
            workers = count,
            queue_capacity = settings.queue_capacity,
            policy = ?settings.policy,
            sink = shared.sink.name(),
            "worker pool started"
        );

        let handle = PoolHandle {
            tx,
            accepting: Arc::clone(&accepting),
            policy: settings.policy,
            timeout: settings.backpressure_timeout,
            stats,
        };
        (
            Self {
                shared,
                accepting,
                workers,
            },
            handle,
        )
    }

    /// 실행 중인 워커 수
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// 새 작업을 거부하고 남은 작업을 기한까지 처리합니다.
    pub async fn shutdown(&mut self, deadline: Duration) -> DrainReport {
        self.accepting.store(false, Ordering::Release);
        self.shared.closing.cancel();
        let flushed_before = self.shared.stats.batches_flushed();

        let mut workers = std::mem::take(&mut self.workers);
        let mut finished = 0;
        let joined = tokio::time::timeout(deadline, async {
            for worker in workers.iter_mut() {
                if let Err(e) = worker.await {
                    warn!(error = %e, "flush worker failed");
                }
                finished += 1;
            }
        })
        .await;

        let mut lost = 0;
        if joined.is_err() {
            // 이미 join된 핸들은 다시 poll하지 않음
            let remaining = workers.split_off(finished);
            for worker in &remaining {
                worker.abort();
            }
            for worker in remaining {
                let _ = worker.await;
            }

            let in_flight: Vec<InFlight> = self
                .shared
                .in_flight
                .lock()
                .drain()
                .map(|(_, job)| job)
                .collect();
            for job in in_flight {
                warn!(
                    batch_id = %job.batch_id,
                    exporter = %job.exporter,
                    records = job.records,
                    "in-flight batch not flushed before drain deadline"
                );
                lost += 1;
            }
        }

        // 큐를 닫아 대기 중인 제출자를 깨우고, 워커 종료 뒤 들어온 작업까지 기록
        let cause = if joined.is_err() { "deadline" } else { "shutdown" };
        let mut queued = 0usize;
        {
            let mut rx = self.shared.rx.lock().await;
            rx.close();
            while let Ok(job) = rx.try_recv() {
                warn!(
                    batch_id = %job.batch.id,
                    exporter = %job.batch.exporter,
                    records = job.batch.len(),
                    cause,
                    "queued batch not flushed before shutdown"
                );
                queued += 1;
            }
        }
        lost += queued;

        for _ in 0..lost {
            self.shared.stats.record_batch_dropped();
        }
        if lost > 0 {
            metrics::counter!(m::BATCH_DROPPED_TOTAL, m::LABEL_CAUSE => cause)
                .increment(lost as u64);
        }

        let report = DrainReport {
            completed: self.shared.stats.batches_flushed() - flushed_before,
            lost,
        };
        info!(
            completed = report.completed,
            lost = report.lost,
            queued_at_close = queued,
            "worker pool drained"
        );
        report
    }
}

/// 다음 작업과 꺼낸 뒤의 큐 깊이를 반환합니다. 종료 중이면 큐가 빌 때 `None`.
async fn next_job(shared: &WorkerShared) -> Option<(FlushJob, usize)> {
    let mut rx = shared.rx.lock().await;
    let job = if shared.closing.is_cancelled() {
        rx.try_recv().ok()
    } else {
        tokio::select! {
            biased;
            _ = shared.closing.cancelled() => rx.try_recv().ok(),
            job = rx.recv() => job,
        }
    };
    job.map(|job| (job, rx.len()))
}

async fn run_worker(id: usize, shared: Arc<WorkerShared>) {
    debug!(worker = id, "flush worker started");
    while let Some((job, depth)) = next_job(&shared).await {
        shared.stats.set_queue_depth(depth);
        metrics::gauge!(m::WORKER_QUEUE_DEPTH).set(depth as f64);
        execute(id, &shared, job).await;
    }
    debug!(worker = id, "flush worker stopped");
}

async fn execute(id: usize, shared: &WorkerShared, job: FlushJob) {
    let batch = job.batch;
    let records = batch.len();
    shared.in_flight.lock().insert(
        id,
        InFlight {
            batch_id: batch.id,
            exporter: batch.exporter,
            records,
        },
    );

    let started = Instant::now();
    if let Err(e) = shared.sink.submit(Arc::clone(&batch)).await {
        shared.stats.record_sink_error();
        metrics::counter!(m::WORKER_SINK_ERRORS_TOTAL).increment(1);
        warn!(
            sink = shared.sink.name(),
            batch_id = %batch.id,
            exporter = %batch.exporter,
            error = %e,
            "sink submit failed"
        );
    }
    shared.forward.publish(&batch);
    let elapsed = started.elapsed();

    let target = shared.sizing.observe(elapsed);
    shared.stats.record_flush(records, elapsed);
    metrics::counter!(m::BATCH_FLUSHED_TOTAL).increment(1);
    metrics::histogram!(m::BATCH_SIZE).record(records as f64);
    metrics::histogram!(m::BATCH_FLUSH_DURATION_SECONDS).record(elapsed.as_secs_f64());
    debug!(
        worker = id,
        batch_id = %batch.id,
        records,
        queued_ms = job.enqueued_at.elapsed().as_millis() as u64,
        flush_ms = elapsed.as_millis() as u64,
        next_target = target,
        "batch flushed"
    );

    shared.in_flight.lock().remove(&id);
}
