//! NetFlow v5 디코더
//!
//! 24바이트 고정 헤더 뒤에 48바이트 고정 레코드가 `count`개 이어집니다.
//! 레코드를 읽기 전에 `24 + count * 48 == 패킷 길이`를 검사하며,
//! 불일치하면 레코드를 하나도 내보내지 않습니다.
//!
//! ```text
//!  0               2               4                               8
//! +---------------+---------------+-------------------------------+
//! |    version    |     count     |           sys_uptime          |
//! +---------------+---------------+-------------------------------+
//! |           unix_secs           |          unix_nsecs           |
//! +-------------------------------+-------+-------+---------------+
//! |         flow_sequence         |e_type | e_id  | sampling_int  |
//! +-------------------------------+-------+-------+---------------+
//! ```

use std::net::IpAddr;

use ironflow_core::types::{ExporterKey, FlowRecord, FlowVersion};

use crate::decoder::reader::Reader;
use crate::decoder::DecodeOutput;
use crate::error::DecodeError;

/// 프로토콜 버전
pub const VERSION: u16 = 5;
/// 헤더 길이
pub const HEADER_LEN: usize = 24;
/// 레코드 길이
pub const RECORD_LEN: usize = 48;
/// 패킷당 최대 레코드 수
pub const MAX_RECORDS: usize = 30;

/// NetFlow v5 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// 레코드 수 (1~30)
    pub count: u16,
    /// 장비 부팅 후 경과 시간 (밀리초)
    pub sys_uptime: u32,
    /// 익스포트 시각 (초)
    pub unix_secs: u32,
    /// 익스포트 시각의 나노초 잔여분
    pub unix_nsecs: u32,
    /// 플로우 일련번호
    pub flow_sequence: u32,
    /// 스위칭 엔진 종류
    pub engine_type: u8,
    /// 스위칭 엔진 슬롯
    pub engine_id: u8,
    /// 상위 2비트 샘플링 모드, 하위 14비트 샘플링 간격
    pub sampling_interval: u16,
}

impl Header {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.u16("netflow v5 header")?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(u32::from(version)));
        }
        Ok(Self {
            count: r.u16("netflow v5 header")?,
            sys_uptime: r.u32("netflow v5 header")?,
            unix_secs: r.u32("netflow v5 header")?,
            unix_nsecs: r.u32("netflow v5 header")?,
            flow_sequence: r.u32("netflow v5 header")?,
            engine_type: r.u8("netflow v5 header")?,
            engine_id: r.u8("netflow v5 header")?,
            sampling_interval: r.u16("netflow v5 header")?,
        })
    }

    /// 장비 부팅 시각 (Unix epoch 밀리초)
    pub fn boot_time_ms(&self) -> i64 {
        i64::from(self.unix_secs) * 1000 + i64::from(self.unix_nsecs / 1_000_000)
            - i64::from(self.sys_uptime)
    }

    /// 관측 도메인 (`engine_type << 8 | engine_id`)
    pub fn domain(&self) -> u32 {
        (u32::from(self.engine_type) << 8) | u32::from(self.engine_id)
    }
}

/// NetFlow v5 데이터그램을 디코드합니다.
///
/// 헤더가 짧거나 길이가 맞지 않으면 레코드 없이 `Err`를 반환합니다.
pub fn decode(data: &[u8], source: IpAddr) -> Result<DecodeOutput, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            what: "netflow v5 header",
            needed: HEADER_LEN,
            available: data.len(),
        });
    }
    let mut r = Reader::new(data);
    let header = Header::read(&mut r)?;

    let count = usize::from(header.count);
    if count == 0 || count > MAX_RECORDS {
        return Err(DecodeError::Malformed("netflow v5 record count out of range"));
    }
    let expected = HEADER_LEN + count * RECORD_LEN;
    if data.len() != expected {
        return Err(DecodeError::LengthMismatch {
            what: "netflow v5 packet",
            declared: expected,
            actual: data.len(),
        });
    }

    let exporter = ExporterKey::new(source, header.domain());
    let mut output = DecodeOutput::new(FlowVersion::NetflowV5, exporter);
    output.records.reserve(count);
    for _ in 0..count {
        output.records.push(read_record(&mut r, &header, exporter)?);
    }
    Ok(output)
}

fn read_record(
    r: &mut Reader<'_>,
    header: &Header,
    exporter: ExporterKey,
) -> Result<FlowRecord, DecodeError> {
    const WHAT: &str = "netflow v5 record";

    let src = r.ipv4(WHAT)?;
    let dst = r.ipv4(WHAT)?;
    let next_hop = r.ipv4(WHAT)?;
    let input_if = r.u16(WHAT)?;
    let output_if = r.u16(WHAT)?;
    let packets = r.u32(WHAT)?;
    let octets = r.u32(WHAT)?;
    let first = r.u32(WHAT)?;
    let last = r.u32(WHAT)?;
    let src_port = r.u16(WHAT)?;
    let dst_port = r.u16(WHAT)?;
    r.skip(1, WHAT)?;
    let tcp_flags = r.u8(WHAT)?;
    let protocol = r.u8(WHAT)?;
    let tos = r.u8(WHAT)?;
    let src_as = r.u16(WHAT)?;
    let dst_as = r.u16(WHAT)?;
    let src_mask = r.u8(WHAT)?;
    let dst_mask = r.u8(WHAT)?;
    r.skip(2, WHAT)?;

    let mut record = FlowRecord::new(
        FlowVersion::NetflowV5,
        exporter,
        header.boot_time_ms() + i64::from(last),
    );
    record.src_addr = Some(IpAddr::V4(src));
    record.dst_addr = Some(IpAddr::V4(dst));
    record.src_port = src_port;
    record.dst_port = dst_port;
    record.protocol = protocol;
    record.bytes = u64::from(octets);
    record.packets = u64::from(packets);
    record.tcp_flags = tcp_flags;
    record.tos = tos;
    record.duration_ms = u64::from(last.saturating_sub(first));

    record.push_extra("next_hop", next_hop);
    record.push_extra("input_if", input_if);
    record.push_extra("output_if", output_if);
    record.push_extra("src_as", src_as);
    record.push_extra("dst_as", dst_as);
    record.push_extra("src_mask", src_mask);
    record.push_extra("dst_mask", dst_mask);
    let sampling = header.sampling_interval & 0x3fff;
    if sampling > 0 {
        record.push_extra("sampling_rate", sampling);
    }
    Ok(record)
}
