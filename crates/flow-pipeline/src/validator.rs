//! 레코드 검증 및 정규화
//!
//! 디코더가 만든 [`FlowRecord`]를 검사하고 정규화합니다.
//! 거부된 레코드는 사유 코드와 함께 카운트되며 다음 단계로 넘어가지 않습니다.
//!
//! 정규화 규칙:
//! - IPv4-mapped IPv6 주소는 IPv4로 변환
//! - 0 이하 타임스탬프는 수신 시각으로 대체
//!
//! 포트(u16), 프로토콜(u8), 카운터(u64) 범위는 타입으로 보장됩니다.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use ironflow_core::types::FlowRecord;

/// 수신 시각 대비 허용하는 미래 타임스탬프 오차 (24시간)
const MAX_FUTURE_SKEW_MS: i64 = 24 * 60 * 60 * 1000;

/// 검증 거부 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// 출발지 또는 목적지 주소 없음
    MissingAddress,
    /// 출발지와 목적지의 주소 체계가 다름
    AddressFamilyMismatch,
    /// 바이트 수가 있는데 패킷 수가 0
    BytesWithoutPackets,
    /// 타임스탬프가 허용 범위를 벗어남
    TimestampOutOfRange,
}

impl RejectReason {
    /// 모든 거부 사유
    pub const ALL: [RejectReason; 4] = [
        Self::MissingAddress,
        Self::AddressFamilyMismatch,
        Self::BytesWithoutPackets,
        Self::TimestampOutOfRange,
    ];

    /// 메트릭 레이블 문자열
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingAddress => "missing_address",
            Self::AddressFamilyMismatch => "address_family_mismatch",
            Self::BytesWithoutPackets => "bytes_without_packets",
            Self::TimestampOutOfRange => "timestamp_out_of_range",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::MissingAddress => 0,
            Self::AddressFamilyMismatch => 1,
            Self::BytesWithoutPackets => 2,
            Self::TimestampOutOfRange => 3,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 레코드 검증기
///
/// 사유별 거부 카운터를 가지며 여러 수신 태스크가 공유합니다.
#[derive(Debug, Default)]
pub struct RecordValidator {
    accepted: AtomicU64,
    rejected: [AtomicU64; 4],
}

impl RecordValidator {
    /// 새 검증기를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 레코드를 검증하고 정규화된 레코드를 반환합니다.
    ///
    /// `received_ms`는 패킷 수신 시각(Unix epoch 밀리초)입니다.
    pub fn validate(&self, record: FlowRecord, received_ms: i64) -> Result<FlowRecord, RejectReason> {
        match normalize(record, received_ms) {
            Ok(record) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(record)
            }
            Err(reason) => {
                self.rejected[reason.index()].fetch_add(1, Ordering::Relaxed);
                Err(reason)
            }
        }
    }

    /// 통과한 레코드 수
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// 사유별 거부 수
    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected[reason.index()].load(Ordering::Relaxed)
    }

    /// 전체 거부 수
    pub fn rejected_total(&self) -> u64 {
        RejectReason::ALL.iter().map(|r| self.rejected(*r)).sum()
    }
}

fn normalize(mut record: FlowRecord, received_ms: i64) -> Result<FlowRecord, RejectReason> {
    let (Some(src), Some(dst)) = (record.src_addr, record.dst_addr) else {
        return Err(RejectReason::MissingAddress);
    };
    let src = canonical_addr(src);
    let dst = canonical_addr(dst);
    if src.is_ipv4() != dst.is_ipv4() {
        return Err(RejectReason::AddressFamilyMismatch);
    }
    record.src_addr = Some(src);
    record.dst_addr = Some(dst);

    if record.bytes > 0 && record.packets == 0 {
        return Err(RejectReason::BytesWithoutPackets);
    }

    if record.timestamp_ms <= 0 {
        record.timestamp_ms = received_ms;
    } else if record.timestamp_ms > received_ms.saturating_add(MAX_FUTURE_SKEW_MS) {
        return Err(RejectReason::TimestampOutOfRange);
    }

    Ok(record)
}

fn canonical_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}
