//! ironflow 플로우 파이프라인
//!
//! 네트워크 장비가 내보내는 NetFlow v5/v9, IPFIX, sFlow v4/v5 데이터그램을 UDP로 수신하여
//! 정규화된 [`FlowRecord`](ironflow_core::types::FlowRecord)로 디코딩하고, 검증 후
//! 적응형 배치로 묶어 스토리지 싱크로 넘깁니다.
//!
//! # 모듈 구성
//!
//! - [`collector`]: UDP 소켓 바인드 및 포트별 수신 루프
//! - [`dispatcher`]: 데이터그램 내용으로 프로토콜 버전 감지 후 디코더 선택
//! - [`decoder`]: 프로토콜별 디코더 (NetFlow v5/v9, IPFIX, sFlow)
//! - [`template`]: 익스포터별 v9/IPFIX 템플릿 캐시 및 미스 버퍼링
//! - [`device_cache`]: 익스포터 디바이스 메타데이터 LRU 캐시
//! - [`validator`]: 레코드 정합성 검증
//! - [`batch`]: 익스포터별 배치 누적과 적응형 배치 크기
//! - [`worker`]: 배치 플러시 워커 풀 (bounded 큐, 백프레셔)
//! - [`forward`]: 실시간 배치 구독 허브
//! - [`sink`]: 기본 싱크 구현 (로그, 메모리)
//! - [`stats`]: 수집 통계 및 메트릭 스냅샷
//! - [`ingest`]: 패킷 하나의 디코드-검증-배치 경로
//! - [`pipeline`]: 전체 파이프라인 오케스트레이션 (Pipeline trait 구현)
//! - [`config`]: 파이프라인 설정 (core 설정 확장)
//! - [`error`]: 도메인 에러 타입
//!
//! # 아키텍처
//!
//! ```text
//! UDP :2055/:6343 -> Dispatcher -> Decoder -> DeviceCache -> Validator -> BatchAccumulator
//!                        |            |                                        |
//!                   version 감지  TemplateManager                         WorkerPool
//!                                                                          |      |
//!                                                                     FlowSink  ForwardHub
//! ```

pub mod batch;
pub mod config;
pub mod device_cache;
pub mod dispatcher;
pub mod error;
pub mod forward;
pub mod ingest;
pub mod pipeline;
pub mod sink;
pub mod stats;
pub mod template;
pub mod validator;
pub mod worker;

pub mod collector;
pub mod decoder;

// --- 주요 타입 re-export ---

// 파이프라인
pub use pipeline::{FlowPipeline, FlowPipelineBuilder};

// 설정
pub use config::{PipelineConfig, PipelineConfigBuilder};

// 에러
pub use error::{DecodeError, FlowPipelineError};

// 디코더
pub use decoder::{DecodeOutput, DecodeStats};
pub use dispatcher::ProtocolDispatcher;
pub use template::TemplateManager;

// 수집기
pub use collector::{CollectorStatus, RawPacket, UdpListener};

// 캐시
pub use device_cache::{DeviceCache, DeviceMetadata, DeviceResolver, StaticResolver};

// 검증
pub use validator::{RecordValidator, RejectReason};

// 배치/워커
pub use batch::{AdaptiveBatchSize, BatchAccumulator};
pub use worker::{DrainReport, PoolHandle, SubmitOutcome, WorkerPool};

// 포워더/싱크
pub use forward::{ForwardFilter, ForwardHub};
pub use sink::{LogSink, MemorySink};

// 통계
pub use stats::{CollectorStats, MetricsSnapshot, SnapshotSource};
