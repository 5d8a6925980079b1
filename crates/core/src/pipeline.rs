//! 파이프라인 생명주기 trait과 스토리지 협력자 trait
//!
//! - [`Pipeline`]: 시작/정지/헬스 체크 생명주기 (정적 디스패치)
//! - [`DynPipeline`]: `Box<dyn DynPipeline>`로 보관하기 위한 dyn 호환 버전
//! - [`FlowSink`]: 플러시된 배치를 받는 스토리지 협력자

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::error::IronflowError;
use crate::types::FlowBatch;

/// dyn 호환 trait에서 사용하는 boxed future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 모듈 헬스 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    /// 정상 동작
    Healthy,
    /// 동작 중이지만 성능 저하 (사유 포함)
    Degraded(String),
    /// 동작 불가 (사유 포함)
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// 동작 불가 상태인지 확인합니다.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(_))
    }
}

/// 파이프라인 생명주기 trait
///
/// 수집 파이프라인과 같은 장기 실행 모듈이 구현합니다.
pub trait Pipeline: Send + Sync {
    /// 파이프라인을 시작합니다. 이미 실행 중이면 에러를 반환합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), IronflowError>> + Send;

    /// 파이프라인을 정지합니다. 실행 중이 아니면 에러를 반환합니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), IronflowError>> + Send;

    /// 현재 헬스 상태를 반환합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}

/// [`Pipeline`]의 dyn 호환 버전
///
/// `Pipeline`을 구현한 모든 타입에 blanket 구현이 제공됩니다.
pub trait DynPipeline: Send + Sync {
    /// 파이프라인을 시작합니다.
    fn start(&mut self) -> BoxFuture<'_, Result<(), IronflowError>>;

    /// 파이프라인을 정지합니다.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), IronflowError>>;

    /// 현재 헬스 상태를 반환합니다.
    fn health_check(&self) -> BoxFuture<'_, HealthStatus>;
}

impl<T: Pipeline> DynPipeline for T {
    fn start(&mut self) -> BoxFuture<'_, Result<(), IronflowError>> {
        Box::pin(Pipeline::start(self))
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), IronflowError>> {
        Box::pin(Pipeline::stop(self))
    }

    fn health_check(&self) -> BoxFuture<'_, HealthStatus> {
        Box::pin(Pipeline::health_check(self))
    }
}

/// 스토리지 협력자 trait
///
/// 워커 풀이 플러시된 배치를 append-only로 제출합니다.
/// 영속화 엔진 내부는 이 trait 뒤에 숨겨집니다.
pub trait FlowSink: Send + Sync {
    /// 싱크 이름 (로그/메트릭 레이블)
    fn name(&self) -> &str;

    /// 배치를 제출합니다. 실패는 워커가 카운트하고 로그로 남깁니다.
    fn submit(&self, batch: Arc<FlowBatch>) -> BoxFuture<'_, Result<(), IronflowError>>;
}
