//! sFlow v4/v5 디코더
//!
//! 데이터그램 헤더(버전, 에이전트 주소, 일련번호, 가동 시간) 뒤에 샘플이 이어집니다.
//!
//! - 플로우 샘플(1), 확장 플로우 샘플(3): 샘플당 [`FlowRecord`] 하나
//! - 카운터 샘플(2), 확장 카운터 샘플(4): 카운트만 함
//! - 지원하지 않거나 손상된 샘플은 건너뛰고 카운트하며 나머지 샘플은 계속 디코드
//!
//! v5는 샘플과 레코드마다 길이가 있어 개별 건너뛰기가 가능합니다.
//! v4는 길이가 없으므로 해석할 수 없는 형식을 만나면 남은 샘플을 건너뜁니다.

use std::net::IpAddr;

use ironflow_core::types::{ExporterKey, FlowRecord, FlowVersion};

use crate::decoder::packet::{self, PacketSummary};
use crate::decoder::reader::Reader;
use crate::decoder::{DecodeOutput, DecodeStats};
use crate::error::DecodeError;

const ADDRESS_IPV4: u32 = 1;
const ADDRESS_IPV6: u32 = 2;

const SAMPLE_FLOW: u32 = 1;
const SAMPLE_COUNTERS: u32 = 2;
const SAMPLE_FLOW_EXPANDED: u32 = 3;
const SAMPLE_COUNTERS_EXPANDED: u32 = 4;

const RECORD_RAW_HEADER: u32 = 1;
const RECORD_SAMPLED_IPV4: u32 = 3;
const RECORD_SAMPLED_IPV6: u32 = 4;
const RECORD_EXTENDED_SWITCH: u32 = 1001;

const HEADER_PROTO_ETHERNET: u32 = 1;
const HEADER_PROTO_IPV4: u32 = 11;
const HEADER_PROTO_IPV6: u32 = 12;

/// 원시 헤더 최대 길이 (이보다 길면 손상으로 판단)
const MAX_HEADER_LEN: usize = 1024;

/// sFlow 데이터그램 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// 프로토콜 버전 (4 또는 5)
    pub version: u32,
    /// 에이전트 주소
    pub agent: IpAddr,
    /// 서브 에이전트 ID (v5 전용, v4는 0)
    pub sub_agent_id: u32,
    /// 데이터그램 일련번호
    pub sequence: u32,
    /// 에이전트 가동 시간 (밀리초)
    pub uptime: u32,
    /// 샘플 수
    pub num_samples: u32,
}

impl Header {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.u32("sflow header")?;
        if version != 4 && version != 5 {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let agent = read_address(r)?;
        let sub_agent_id = if version == 5 {
            r.u32("sflow header")?
        } else {
            0
        };
        Ok(Self {
            version,
            agent,
            sub_agent_id,
            sequence: r.u32("sflow header")?,
            uptime: r.u32("sflow header")?,
            num_samples: r.u32("sflow header")?,
        })
    }
}

fn read_address(r: &mut Reader<'_>) -> Result<IpAddr, DecodeError> {
    match r.u32("sflow address type")? {
        ADDRESS_IPV4 => Ok(IpAddr::V4(r.ipv4("sflow address")?)),
        ADDRESS_IPV6 => Ok(IpAddr::V6(r.ipv6("sflow address")?)),
        _ => Err(DecodeError::Malformed("sflow address type")),
    }
}

/// 플로우 샘플 하나에서 모은 정보
#[derive(Debug, Default)]
struct SampledFlow {
    sampling_rate: u32,
    input_if: u32,
    output_if: u32,
    frame_length: u64,
    summary: PacketSummary,
    src_vlan: Option<u32>,
    dst_vlan: Option<u32>,
}

impl SampledFlow {
    fn into_record(
        self,
        version: FlowVersion,
        exporter: ExporterKey,
        received_ms: i64,
    ) -> Option<FlowRecord> {
        if !self.summary.has_l3() {
            return None;
        }
        let rate = u64::from(self.sampling_rate.max(1));
        let mut record = FlowRecord::new(version, exporter, received_ms);
        record.src_addr = self.summary.src;
        record.dst_addr = self.summary.dst;
        record.src_port = self.summary.src_port;
        record.dst_port = self.summary.dst_port;
        record.protocol = self.summary.protocol;
        record.tcp_flags = self.summary.tcp_flags;
        record.tos = self.summary.tos;
        record.bytes = self.frame_length.saturating_mul(rate);
        record.packets = rate;

        record.push_extra("sampling_rate", rate);
        record.push_extra("input_if", self.input_if);
        record.push_extra("output_if", self.output_if);
        if let Some(vlan) = self.summary.vlan {
            record.push_extra("vlan", vlan);
        }
        if let Some(vlan) = self.src_vlan {
            record.push_extra("src_vlan", vlan);
        }
        if let Some(vlan) = self.dst_vlan {
            record.push_extra("dst_vlan", vlan);
        }
        Some(record)
    }
}

/// sFlow 데이터그램을 디코드합니다.
///
/// sFlow는 플로우 시작/종료 시각이 없으므로 타임스탬프는 수신 시각입니다.
pub fn decode(data: &[u8], source: IpAddr, received_ms: i64) -> Result<DecodeOutput, DecodeError> {
    let mut r = Reader::new(data);
    let header = Header::read(&mut r)?;

    let agent = if header.agent.is_unspecified() {
        source
    } else {
        header.agent
    };
    let exporter = ExporterKey::new(agent, header.sub_agent_id);
    let version = if header.version == 5 {
        FlowVersion::SflowV5
    } else {
        FlowVersion::SflowV4
    };
    let mut out = DecodeOutput::new(version, exporter);

    if header.version == 5 {
        decode_v5_samples(&mut r, &header, received_ms, &mut out);
    } else {
        decode_v4_samples(&mut r, &header, received_ms, &mut out);
    }
    Ok(out)
}

fn decode_v5_samples(r: &mut Reader<'_>, header: &Header, received_ms: i64, out: &mut DecodeOutput) {
    for _ in 0..header.num_samples {
        let (format, length) = match (r.u32("sample header"), r.u32("sample header")) {
            (Ok(format), Ok(length)) => (format, length as usize),
            (Err(e), _) | (_, Err(e)) => {
                out.errors.push(e);
                return;
            }
        };
        let mut sample = match r.sub_reader(length, "sample body") {
            Ok(sample) => sample,
            Err(e) => {
                out.errors.push(e);
                return;
            }
        };

        let enterprise = format >> 12;
        let kind = format & 0x0fff;
        if enterprise != 0 {
            out.stats.samples_skipped += 1;
            continue;
        }
        match kind {
            SAMPLE_FLOW | SAMPLE_FLOW_EXPANDED => {
                match read_v5_flow_sample(&mut sample, kind == SAMPLE_FLOW_EXPANDED, &mut out.errors) {
                    Ok(flow) => push_sampled_flow(flow, received_ms, out),
                    Err(e) => {
                        tracing::trace!(error = %e, "skipping malformed sflow flow sample");
                        out.stats.samples_skipped += 1;
                        out.errors.push(e);
                    }
                }
            }
            SAMPLE_COUNTERS | SAMPLE_COUNTERS_EXPANDED => out.stats.counter_samples += 1,
            _ => out.stats.samples_skipped += 1,
        }
    }
}

/// 플로우 샘플을 읽습니다. 손상된 레코드는 건너뛰고 `errors`에 기록합니다.
fn read_v5_flow_sample(
    r: &mut Reader<'_>,
    expanded: bool,
    errors: &mut Vec<DecodeError>,
) -> Result<SampledFlow, DecodeError> {
    const WHAT: &str = "sflow flow sample";
    let mut flow = SampledFlow::default();

    r.u32(WHAT)?; // sequence
    if expanded {
        r.skip(8, WHAT)?; // source id type, index
    } else {
        r.u32(WHAT)?; // source id
    }
    flow.sampling_rate = r.u32(WHAT)?;
    r.skip(8, WHAT)?; // sample pool, drops
    if expanded {
        r.u32(WHAT)?; // input format
        flow.input_if = r.u32(WHAT)?;
        r.u32(WHAT)?; // output format
        flow.output_if = r.u32(WHAT)?;
    } else {
        flow.input_if = r.u32(WHAT)?;
        flow.output_if = r.u32(WHAT)?;
    }

    let num_records = r.u32(WHAT)?;
    for _ in 0..num_records {
        let format = r.u32("flow record header")?;
        let length = r.u32("flow record header")? as usize;
        let mut record = r.sub_reader(length, "flow record body")?;
        if format >> 12 != 0 {
            continue;
        }
        let result = match format & 0x0fff {
            RECORD_RAW_HEADER => read_raw_header(&mut record, true)
                .and_then(|raw| apply_raw_header(&raw, &mut flow)),
            RECORD_SAMPLED_IPV4 => read_sampled_ipv4(&mut record, &mut flow),
            RECORD_SAMPLED_IPV6 => read_sampled_ipv6(&mut record, &mut flow),
            RECORD_EXTENDED_SWITCH => read_extended_switch(&mut record, &mut flow),
            _ => Ok(()),
        };
        // 레코드 손상은 그 레코드만 버림
        if let Err(e) = result {
            tracing::trace!(error = %e, format, "skipping malformed sflow flow record");
            errors.push(e);
        }
    }
    Ok(flow)
}

/// 원시 패킷 헤더 레코드의 헤더 바이트
struct RawHeader<'a> {
    protocol: u32,
    frame_length: u32,
    bytes: &'a [u8],
}

/// 원시 패킷 헤더 레코드를 읽습니다. v4에는 `stripped` 필드가 없습니다.
fn read_raw_header<'a>(r: &mut Reader<'a>, has_stripped: bool) -> Result<RawHeader<'a>, DecodeError> {
    const WHAT: &str = "sflow raw header";
    let protocol = r.u32(WHAT)?;
    let frame_length = r.u32(WHAT)?;
    if has_stripped {
        r.u32(WHAT)?;
    }
    let header_len = r.u32(WHAT)? as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(DecodeError::Malformed("sflow raw header length"));
    }
    let bytes = r.take(header_len, WHAT)?;
    r.skip(padding(header_len), WHAT)?;
    Ok(RawHeader {
        protocol,
        frame_length,
        bytes,
    })
}

/// 헤더 바이트를 파싱해 플로우에 반영합니다. 실패하면 플로우는 L3 없이 남습니다.
fn apply_raw_header(raw: &RawHeader<'_>, flow: &mut SampledFlow) -> Result<(), DecodeError> {
    let summary = match raw.protocol {
        HEADER_PROTO_ETHERNET => packet::parse_ethernet(raw.bytes)?,
        HEADER_PROTO_IPV4 => packet::parse_ipv4(raw.bytes)?,
        HEADER_PROTO_IPV6 => packet::parse_ipv6(raw.bytes)?,
        _ => return Ok(()),
    };
    flow.frame_length = u64::from(raw.frame_length);
    flow.summary = PacketSummary {
        vlan: summary.vlan.or(flow.summary.vlan),
        ..summary
    };
    Ok(())
}

fn read_sampled_ipv4(r: &mut Reader<'_>, flow: &mut SampledFlow) -> Result<(), DecodeError> {
    const WHAT: &str = "sflow sampled ipv4";
    let length = r.u32(WHAT)?;
    let protocol = r.u32(WHAT)?;
    let src = r.ipv4(WHAT)?;
    let dst = r.ipv4(WHAT)?;
    let src_port = r.u32(WHAT)?;
    let dst_port = r.u32(WHAT)?;
    let tcp_flags = r.u32(WHAT)?;
    let tos = r.u32(WHAT)?;
    // 원시 헤더가 이미 있으면 덮어쓰지 않음
    if flow.summary.has_l3() {
        return Ok(());
    }
    flow.frame_length = u64::from(length);
    flow.summary = PacketSummary {
        src: Some(IpAddr::V4(src)),
        dst: Some(IpAddr::V4(dst)),
        src_port: src_port as u16,
        dst_port: dst_port as u16,
        protocol: protocol as u8,
        tcp_flags: tcp_flags as u8,
        tos: tos as u8,
        vlan: flow.summary.vlan,
    };
    Ok(())
}

fn read_sampled_ipv6(r: &mut Reader<'_>, flow: &mut SampledFlow) -> Result<(), DecodeError> {
    const WHAT: &str = "sflow sampled ipv6";
    let length = r.u32(WHAT)?;
    let protocol = r.u32(WHAT)?;
    let src = r.ipv6(WHAT)?;
    let dst = r.ipv6(WHAT)?;
    let src_port = r.u32(WHAT)?;
    let dst_port = r.u32(WHAT)?;
    let tcp_flags = r.u32(WHAT)?;
    let priority = r.u32(WHAT)?;
    if flow.summary.has_l3() {
        return Ok(());
    }
    flow.frame_length = u64::from(length);
    flow.summary = PacketSummary {
        src: Some(IpAddr::V6(src)),
        dst: Some(IpAddr::V6(dst)),
        src_port: src_port as u16,
        dst_port: dst_port as u16,
        protocol: protocol as u8,
        tcp_flags: tcp_flags as u8,
        tos: priority as u8,
        vlan: flow.summary.vlan,
    };
    Ok(())
}

fn read_extended_switch(r: &mut Reader<'_>, flow: &mut SampledFlow) -> Result<(), DecodeError> {
    const WHAT: &str = "sflow extended switch";
    let src_vlan = r.u32(WHAT)?;
    r.u32(WHAT)?; // src priority
    let dst_vlan = r.u32(WHAT)?;
    r.u32(WHAT)?; // dst priority
    flow.src_vlan = Some(src_vlan);
    flow.dst_vlan = Some(dst_vlan);
    Ok(())
}

/// 샘플을 레코드로 변환해 추가합니다. L3 정보가 없으면 건너뛴 샘플로 카운트합니다.
fn push_sampled_flow(flow: SampledFlow, received_ms: i64, out: &mut DecodeOutput) {
    match flow.into_record(out.version, out.exporter, received_ms) {
        Some(record) => out.records.push(record),
        None => {
            tracing::trace!("skipping sflow flow sample without l3 data");
            out.stats.samples_skipped += 1;
        }
    }
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

// -----------------------------------------------------------------------------
// sFlow v4
// -----------------------------------------------------------------------------

const V4_PACKET_HEADER: u32 = 1;
const V4_PACKET_IPV4: u32 = 2;
const V4_PACKET_IPV6: u32 = 3;

const V4_EXTENDED_SWITCH: u32 = 1;
const V4_EXTENDED_ROUTER: u32 = 2;
const V4_EXTENDED_USER: u32 = 4;
const V4_EXTENDED_URL: u32 = 5;

fn decode_v4_samples(r: &mut Reader<'_>, header: &Header, received_ms: i64, out: &mut DecodeOutput) {
    for processed in 0..header.num_samples {
        let result = r.u32("sflow v4 sample type").and_then(|sample_type| match sample_type {
            SAMPLE_FLOW => read_v4_flow_sample(r, &mut out.errors)
                .map(|flow| push_sampled_flow(flow, received_ms, out)),
            SAMPLE_COUNTERS => read_v4_counter_sample(r, &mut out.stats),
            _ => Err(DecodeError::Malformed("sflow v4 sample type")),
        });
        // 길이 정보가 없으므로 어떤 실패든 나머지 샘플을 읽을 수 없음
        if let Err(e) = result {
            let remaining = u64::from(header.num_samples - processed);
            tracing::trace!(error = %e, remaining, "sflow v4 datagram abandoned");
            out.stats.samples_skipped += remaining;
            out.errors.push(e);
            return;
        }
    }
}

fn read_v4_flow_sample(
    r: &mut Reader<'_>,
    errors: &mut Vec<DecodeError>,
) -> Result<SampledFlow, DecodeError> {
    const WHAT: &str = "sflow v4 flow sample";
    let mut flow = SampledFlow::default();

    r.skip(8, WHAT)?; // sequence, source id
    flow.sampling_rate = r.u32(WHAT)?;
    r.skip(8, WHAT)?; // sample pool, drops
    flow.input_if = r.u32(WHAT)?;
    flow.output_if = r.u32(WHAT)?;

    match r.u32("sflow v4 packet type")? {
        V4_PACKET_HEADER => {
            let raw = read_raw_header(r, false)?;
            // 헤더 바이트는 이미 소비했으므로 파싱 실패는 이 샘플의 L3만 잃음
            if let Err(e) = apply_raw_header(&raw, &mut flow) {
                tracing::trace!(error = %e, "skipping malformed sflow v4 packet header");
                errors.push(e);
            }
        }
        V4_PACKET_IPV4 => read_sampled_ipv4(r, &mut flow)?,
        V4_PACKET_IPV6 => read_sampled_ipv6(r, &mut flow)?,
        _ => return Err(DecodeError::Malformed("sflow v4 packet type")),
    }

    let extended = r.u32("sflow v4 extended count")?;
    for _ in 0..extended {
        match r.u32("sflow v4 extended type")? {
            V4_EXTENDED_SWITCH => read_extended_switch(r, &mut flow)?,
            V4_EXTENDED_ROUTER => {
                read_address(r)?;
                r.skip(8, "sflow v4 extended router")?;
            }
            V4_EXTENDED_USER => {
                skip_string(r)?;
                skip_string(r)?;
            }
            V4_EXTENDED_URL => {
                r.u32("sflow v4 extended url")?;
                skip_string(r)?;
            }
            _ => return Err(DecodeError::Malformed("sflow v4 extended type")),
        }
    }
    Ok(flow)
}

fn read_v4_counter_sample(r: &mut Reader<'_>, stats: &mut DecodeStats) -> Result<(), DecodeError> {
    const WHAT: &str = "sflow v4 counter sample";
    r.skip(12, WHAT)?; // sequence, source id, sampling interval
    let block_len = match r.u32(WHAT)? {
        1 | 4 | 6 => 88, // generic, fddi, wan
        2 => 140,        // ethernet
        3 => 160,        // token ring
        7 => 28,         // vlan
        _ => return Err(DecodeError::Malformed("sflow v4 counter type")),
    };
    r.skip(block_len, WHAT)?;
    stats.counter_samples += 1;
    Ok(())
}

fn skip_string(r: &mut Reader<'_>) -> Result<(), DecodeError> {
    let len = r.u32("sflow string")? as usize;
    r.skip(len, "sflow string")?;
    r.skip(padding(len), "sflow string")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const NOW: i64 = 1_700_000_000_000;

    fn source() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 50))
    }

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_be_bytes());
    }

    fn tcp_frame() -> Vec<u8> {
        let mut f = vec![0x11; 12];
        f.extend_from_slice(&0x0800u16.to_be_bytes());
        f.extend_from_slice(&[0x45, 0, 0, 40, 0, 0, 0, 0, 64, 6, 0, 0]);
        f.extend_from_slice(&[172, 16, 0, 1, 172, 16, 0, 2]);
        f.extend_from_slice(&33000u16.to_be_bytes());
        f.extend_from_slice(&22u16.to_be_bytes());
        f.extend_from_slice(&[0; 8]);
        f.extend_from_slice(&[0x50, 0x02, 0, 0, 0, 0, 0, 0]);
        f
    }

    fn raw_header_record(frame: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        push_u32(&mut body, HEADER_PROTO_ETHERNET);
        push_u32(&mut body, 1514);
        push_u32(&mut body, 4);
        push_u32(&mut body, frame.len() as u32);
        body.extend_from_slice(frame);
        body.extend(std::iter::repeat_n(0, padding(frame.len())));
        let mut rec = Vec::new();
        push_u32(&mut rec, RECORD_RAW_HEADER);
        push_u32(&mut rec, body.len() as u32);
        rec.extend(body);
        rec
    }

    fn flow_sample(records: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for v in [1, 3, 512, 1000, 0, 7, 9] {
            push_u32(&mut body, v);
        }
        push_u32(&mut body, records.len() as u32);
        for rec in records {
            body.extend_from_slice(rec);
        }
        let mut sample = Vec::new();
        push_u32(&mut sample, SAMPLE_FLOW);
        push_u32(&mut sample, body.len() as u32);
        sample.extend(body);
        sample
    }

    fn datagram_v5(samples: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, 5);
        push_u32(&mut buf, ADDRESS_IPV4);
        buf.extend_from_slice(&[10, 9, 9, 9]);
        push_u32(&mut buf, 3); // sub agent
        push_u32(&mut buf, 100);
        push_u32(&mut buf, 50_000);
        push_u32(&mut buf, samples.len() as u32);
        for s in samples {
            buf.extend_from_slice(s);
        }
        buf
    }

    #[test]
    fn raw_header_sample_yields_l3_l4() {
        let packet = datagram_v5(&[flow_sample(&[raw_header_record(&tcp_frame())])]);
        let out = decode(&packet, source(), NOW).unwrap();

        assert_eq!(out.version, FlowVersion::SflowV5);
        assert_eq!(out.exporter, ExporterKey::new(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)), 3));
        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.src_addr, Some(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert_eq!(r.dst_addr, Some(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 2))));
        assert_eq!(r.src_port, 33000);
        assert_eq!(r.dst_port, 22);
        assert_eq!(r.protocol, 6);
        assert_eq!(r.bytes, 1514 * 512);
        assert_eq!(r.packets, 512);
        assert_eq!(r.timestamp_ms, NOW);
        assert_eq!(r.extra("input_if"), Some("7"));
    }

    #[test]
    fn extended_switch_sets_vlans() {
        let mut switch = Vec::new();
        push_u32(&mut switch, RECORD_EXTENDED_SWITCH);
        push_u32(&mut switch, 16);
        for v in [10, 0, 20, 0] {
            push_u32(&mut switch, v);
        }
        let packet = datagram_v5(&[flow_sample(&[raw_header_record(&tcp_frame()), switch])]);
        let out = decode(&packet, source(), NOW).unwrap();
        assert_eq!(out.records[0].extra("src_vlan"), Some("10"));
        assert_eq!(out.records[0].extra("dst_vlan"), Some("20"));
    }

    #[test]
    fn unsupported_sample_is_skipped_and_rest_decoded() {
        let mut unknown = Vec::new();
        push_u32(&mut unknown, 99);
        push_u32(&mut unknown, 8);
        unknown.extend_from_slice(&[0; 8]);
        let packet = datagram_v5(&[unknown, flow_sample(&[raw_header_record(&tcp_frame())])]);

        let out = decode(&packet, source(), NOW).unwrap();
        assert_eq!(out.stats.samples_skipped, 1);
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn malformed_flow_sample_is_skipped() {
        let mut broken = Vec::new();
        push_u32(&mut broken, SAMPLE_FLOW);
        push_u32(&mut broken, 8);
        broken.extend_from_slice(&[0; 8]);
        let packet = datagram_v5(&[broken, flow_sample(&[raw_header_record(&tcp_frame())])]);

        let out = decode(&packet, source(), NOW).unwrap();
        assert_eq!(out.stats.samples_skipped, 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn truncated_raw_header_skips_sample_and_records_error() {
        let frame = tcp_frame();
        let packet = datagram_v5(&[
            flow_sample(&[raw_header_record(&frame[..20])]),
            flow_sample(&[raw_header_record(&frame)]),
        ]);

        let out = decode(&packet, source(), NOW).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.stats.samples_skipped, 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].kind(), "truncated");
    }

    #[test]
    fn corrupted_record_does_not_drop_valid_sibling() {
        // 길이 8짜리 샘플링 IPv4 레코드는 본문이 모자람
        let mut broken = Vec::new();
        push_u32(&mut broken, RECORD_SAMPLED_IPV4);
        push_u32(&mut broken, 8);
        broken.extend_from_slice(&[0; 8]);
        let packet = datagram_v5(&[flow_sample(&[broken, raw_header_record(&tcp_frame())])]);

        let out = decode(&packet, source(), NOW).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].dst_port, 22);
        assert_eq!(out.stats.samples_skipped, 0);
        assert_eq!(out.errors.len(), 1);
    }

    #[test]
    fn sample_without_l3_is_counted_as_skipped() {
        let mut switch = Vec::new();
        push_u32(&mut switch, RECORD_EXTENDED_SWITCH);
        push_u32(&mut switch, 16);
        for v in [10, 0, 20, 0] {
            push_u32(&mut switch, v);
        }
        let out = decode(&datagram_v5(&[flow_sample(&[switch])]), source(), NOW).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.stats.samples_skipped, 1);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn counter_samples_are_counted() {
        let mut counters = Vec::new();
        push_u32(&mut counters, SAMPLE_COUNTERS);
        push_u32(&mut counters, 4);
        push_u32(&mut counters, 0);
        let out = decode(&datagram_v5(&[counters]), source(), NOW).unwrap();
        assert_eq!(out.stats.counter_samples, 1);
        assert!(out.records.is_empty());
    }

    #[test]
    fn unknown_version_rejected() {
        let mut buf = Vec::new();
        push_u32(&mut buf, 2);
        assert_eq!(
            decode(&buf, source(), NOW).unwrap_err(),
            DecodeError::UnsupportedVersion(2)
        );
    }

    fn datagram_v4(samples: &[u8], count: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        push_u32(&mut buf, 4);
        push_u32(&mut buf, ADDRESS_IPV4);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        push_u32(&mut buf, 1);
        push_u32(&mut buf, 10);
        push_u32(&mut buf, count);
        buf.extend_from_slice(samples);
        buf
    }

    #[test]
    fn v4_flow_sample_with_header() {
        let frame = tcp_frame();
        let mut sample = Vec::new();
        push_u32(&mut sample, SAMPLE_FLOW);
        for v in [1, 0, 100, 0, 0, 1, 2] {
            push_u32(&mut sample, v);
        }
        push_u32(&mut sample, V4_PACKET_HEADER);
        push_u32(&mut sample, HEADER_PROTO_ETHERNET);
        push_u32(&mut sample, 600);
        push_u32(&mut sample, frame.len() as u32);
        sample.extend_from_slice(&frame);
        sample.extend(std::iter::repeat_n(0, padding(frame.len())));
        push_u32(&mut sample, 0); // extended count

        let out = decode(&datagram_v4(&sample, 1), source(), NOW).unwrap();
        assert_eq!(out.version, FlowVersion::SflowV4);
        // 에이전트 주소가 0.0.0.0이면 UDP 출발지 사용
        assert_eq!(out.exporter.addr, source());
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].bytes, 600 * 100);
        assert_eq!(out.records[0].dst_port, 22);
    }

    fn v4_header_sample(frame: &[u8]) -> Vec<u8> {
        let mut sample = Vec::new();
        push_u32(&mut sample, SAMPLE_FLOW);
        for v in [1, 0, 100, 0, 0, 1, 2] {
            push_u32(&mut sample, v);
        }
        push_u32(&mut sample, V4_PACKET_HEADER);
        push_u32(&mut sample, HEADER_PROTO_ETHERNET);
        push_u32(&mut sample, 600);
        push_u32(&mut sample, frame.len() as u32);
        sample.extend_from_slice(frame);
        sample.extend(std::iter::repeat_n(0, padding(frame.len())));
        push_u32(&mut sample, 0); // extended count
        sample
    }

    #[test]
    fn v4_truncated_header_skips_sample_and_continues() {
        let frame = tcp_frame();
        let mut samples = v4_header_sample(&frame[..20]);
        samples.extend(v4_header_sample(&frame));

        let out = decode(&datagram_v4(&samples, 2), source(), NOW).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.stats.samples_skipped, 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].kind(), "truncated");
    }

    #[test]
    fn v4_sample_with_unparsed_header_protocol_is_skipped() {
        let mut sample = v4_header_sample(&tcp_frame());
        // 헤더 프로토콜을 미지원 값으로 변경
        sample[36..40].copy_from_slice(&99u32.to_be_bytes());

        let out = decode(&datagram_v4(&sample, 1), source(), NOW).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.stats.samples_skipped, 1);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn v4_unknown_sample_stops_datagram() {
        let mut samples = Vec::new();
        push_u32(&mut samples, 2); // counter sample
        for v in [1, 0, 10, 7] {
            push_u32(&mut samples, v);
        }
        samples.extend_from_slice(&[0; 28]);
        push_u32(&mut samples, 77); // unknown sample type

        let out = decode(&datagram_v4(&samples, 3), source(), NOW).unwrap();
        assert_eq!(out.stats.counter_samples, 1);
        assert_eq!(out.stats.samples_skipped, 2);
        assert_eq!(out.errors.len(), 1);
    }
}
