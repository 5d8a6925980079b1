//! 플로우 파이프라인 에러 타입
//!
//! [`FlowPipelineError`]는 파이프라인 내부에서 발생하는 모든 에러를 표현합니다.
//! `From<FlowPipelineError> for IronflowError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 전파할 수 있습니다.
//!
//! 패킷/레코드 단위 에러([`DecodeError`], 템플릿 미스, 검증 거부)는
//! 해당 단위에서 카운트되고 버려지며 수신 루프로 전파되지 않습니다.

use ironflow_core::error::{ConfigError, IronflowError, PipelineError};
use ironflow_core::types::ExporterKey;

use crate::validator::RejectReason;

/// 디코드 에러
///
/// 잘못된 형식의 패킷 또는 레코드. 버려지고 카운트되며 치명적이지 않습니다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// 필요한 바이트보다 데이터가 짧음
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        /// 읽으려던 구조
        what: &'static str,
        /// 필요한 바이트 수
        needed: usize,
        /// 남은 바이트 수
        available: usize,
    },

    /// 선언된 길이와 실제 길이가 다름
    #[error("{what} length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch {
        /// 길이를 선언한 구조
        what: &'static str,
        /// 헤더에 선언된 길이
        declared: usize,
        /// 실제 길이
        actual: usize,
    },

    /// 지원하지 않는 프로토콜 버전
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),

    /// 구조적으로 잘못된 값
    #[error("malformed: {0}")]
    Malformed(&'static str),
}

impl DecodeError {
    /// 메트릭 레이블로 쓰이는 에러 종류
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::LengthMismatch { .. } => "length_mismatch",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// 플로우 파이프라인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum FlowPipelineError {
    /// 소켓 바인드/수신 실패 (시작 시점에는 치명적)
    #[error("transport error on {addr}: {reason}")]
    Transport {
        /// 바인드 주소
        addr: String,
        /// 실패 사유
        reason: String,
    },

    /// 디코드 실패
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// 알 수 없는 템플릿 참조
    #[error("template miss: exporter {exporter} template {template_id}")]
    TemplateMiss {
        /// 익스포터
        exporter: ExporterKey,
        /// 참조된 템플릿 ID
        template_id: u16,
    },

    /// 검증 거부
    #[error("validation rejected: {0}")]
    Validation(RejectReason),

    /// 디바이스 메타데이터 조회 실패
    #[error("device lookup failed for {exporter}: {reason}")]
    CacheLookup {
        /// 익스포터
        exporter: ExporterKey,
        /// 실패 사유
        reason: String,
    },

    /// 워커 큐 포화로 배치 제출 실패
    #[error("backpressure: worker queue full after {waited_ms}ms")]
    Backpressure {
        /// 대기한 시간 (밀리초)
        waited_ms: u64,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FlowPipelineError> for IronflowError {
    fn from(err: FlowPipelineError) -> Self {
        match err {
            FlowPipelineError::Transport { addr, reason } => {
                IronflowError::Pipeline(PipelineError::Transport { addr, reason })
            }
            FlowPipelineError::Config { field, reason } => {
                IronflowError::Config(ConfigError::InvalidValue { field, reason })
            }
            FlowPipelineError::Channel(msg) => {
                IronflowError::Pipeline(PipelineError::ChannelSend(msg))
            }
            FlowPipelineError::Io(e) => IronflowError::Io(e),
            other => IronflowError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}
