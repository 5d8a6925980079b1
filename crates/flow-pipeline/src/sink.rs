//! 스토리지 싱크 구현
//!
//! - [`LogSink`]: 배치 요약을 debug 로그로 남김 (스토리지가 연결되지 않았을 때 기본값)
//! - [`MemorySink`]: 배치를 메모리에 보관 (테스트, 임베딩용)

use std::sync::Arc;
use std::time::Duration;

use ironflow_core::error::IronflowError;
use ironflow_core::pipeline::{BoxFuture, FlowSink};
use ironflow_core::types::{FlowBatch, FlowRecord};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// 배치 요약을 로그로 남기는 싱크
#[derive(Debug, Default)]
pub struct LogSink;

impl FlowSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn submit(&self, batch: Arc<FlowBatch>) -> BoxFuture<'_, Result<(), IronflowError>> {
        Box::pin(async move {
            tracing::debug!(
                batch_id = %batch.id,
                exporter = %batch.exporter,
                sequence = batch.sequence,
                records = batch.len(),
                bytes = batch.total_bytes(),
                "batch flushed"
            );
            Ok(())
        })
    }
}

/// 배치를 메모리에 보관하는 싱크
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Arc<FlowBatch>>>,
    notify: Notify,
}

impl MemorySink {
    /// 빈 싱크를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 제출된 배치 목록 (제출 순서)
    pub fn batches(&self) -> Vec<Arc<FlowBatch>> {
        self.batches.lock().clone()
    }

    /// 제출된 모든 레코드 (제출 순서)
    pub fn records(&self) -> Vec<FlowRecord> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect()
    }

    /// 제출된 레코드 수
    pub fn record_count(&self) -> usize {
        self.batches.lock().iter().map(|b| b.len()).sum()
    }

    /// 레코드가 `count`개 이상 쌓일 때까지 기다립니다. 시간 안에 도달하면 `true`.
    pub async fn wait_for_records(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.record_count() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

impl FlowSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn submit(&self, batch: Arc<FlowBatch>) -> BoxFuture<'_, Result<(), IronflowError>> {
        Box::pin(async move {
            self.batches.lock().push(batch);
            self.notify.notify_waiters();
            Ok(())
        })
    }
}
