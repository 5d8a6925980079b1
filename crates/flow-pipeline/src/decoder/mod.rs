//! 프로토콜 디코더
//!
//! 데이터그램 하나를 [`DecodeOutput`]으로 변환합니다.
//!
//! - [`netflow_v5`]: 고정 형식 헤더/레코드
//! - [`netflow_v9`], [`ipfix`]: 템플릿 기반 FlowSet ([`flowset`] 공유)
//! - [`sflow`]: v4/v5 샘플 기반 데이터그램 ([`packet`]으로 원시 헤더 파싱)
//!
//! 디코더는 패닉하지 않습니다. 데이터그램 전체가 잘못되면 `Err`,
//! 일부 FlowSet/샘플만 잘못되면 해당 단위만 버리고 `errors`에 기록합니다.

pub mod flowset;
pub mod ipfix;
pub mod netflow_v5;
pub mod netflow_v9;
pub mod packet;
pub mod reader;
pub mod sflow;

use ironflow_core::types::{ExporterKey, FlowRecord, FlowVersion};

use crate::error::DecodeError;

/// 데이터그램 단위 디코드 통계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// 알 수 없는/만료된 템플릿을 참조한 데이터 셋 수
    pub template_misses: u64,
    /// 템플릿 대기 버퍼에 보관된 데이터 셋 수
    pub pending_buffered: u64,
    /// 대기 버퍼가 가득 차 버려진 데이터 셋 수
    pub pending_dropped: u64,
    /// 건너뛴 sFlow 샘플 수 (미지원/손상)
    pub samples_skipped: u64,
    /// sFlow 카운터 샘플 수
    pub counter_samples: u64,
    /// 옵션 템플릿 데이터 레코드 수
    pub options_records: u64,
    /// 학습한 템플릿 수
    pub templates_learned: u64,
    /// 철회된 템플릿 수
    pub templates_withdrawn: u64,
    /// 건너뛴 엔터프라이즈 필드 수
    pub enterprise_fields: u64,
}

impl DecodeStats {
    /// 다른 통계를 합산합니다.
    pub fn merge(&mut self, other: &DecodeStats) {
        self.template_misses += other.template_misses;
        self.pending_buffered += other.pending_buffered;
        self.pending_dropped += other.pending_dropped;
        self.samples_skipped += other.samples_skipped;
        self.counter_samples += other.counter_samples;
        self.options_records += other.options_records;
        self.templates_learned += other.templates_learned;
        self.templates_withdrawn += other.templates_withdrawn;
        self.enterprise_fields += other.enterprise_fields;
    }
}

/// 데이터그램 디코드 결과
#[derive(Debug, Clone)]
pub struct DecodeOutput {
    /// 감지된 프로토콜 버전
    pub version: FlowVersion,
    /// 익스포터 키 (관측 도메인 포함)
    pub exporter: ExporterKey,
    /// 디코드된 레코드 (데이터그램 내 순서 유지)
    pub records: Vec<FlowRecord>,
    /// 부분 실패 에러 (FlowSet/샘플 단위)
    pub errors: Vec<DecodeError>,
    /// 디코드 통계
    pub stats: DecodeStats,
}

impl DecodeOutput {
    /// 빈 결과를 생성합니다.
    pub fn new(version: FlowVersion, exporter: ExporterKey) -> Self {
        Self {
            version,
            exporter,
            records: Vec::new(),
            errors: Vec::new(),
            stats: DecodeStats::default(),
        }
    }
}
