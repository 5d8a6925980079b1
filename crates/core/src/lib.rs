//! ironflow 공통 크레이트
//!
//! 플로우 수집 파이프라인과 데몬이 공유하는 도메인 타입, 에러, 설정,
//! 메트릭 이름, 생명주기 trait을 정의합니다.
//!
//! # 모듈 구성
//!
//! - [`config`]: `ironflow.toml` 파싱, 환경변수 오버라이드, 검증
//! - [`error`]: 최상위 에러 타입
//! - [`metrics`]: Prometheus 메트릭 이름 상수 및 설명 등록
//! - [`pipeline`]: 생명주기 trait (`Pipeline`, `DynPipeline`) 및 스토리지 협력자 trait
//! - [`types`]: `FlowRecord`, `FlowBatch`, `ExporterKey` 등 도메인 타입

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, IronflowError, PipelineError, StorageError};

// 설정
pub use config::IronflowConfig;

// 파이프라인 trait
pub use pipeline::{BoxFuture, DynPipeline, FlowSink, HealthStatus, Pipeline};

// 도메인 타입
pub use types::{ExporterKey, FlowBatch, FlowRecord, FlowVersion};
