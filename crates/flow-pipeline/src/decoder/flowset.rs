//! NetFlow v9 / IPFIX 공용 FlowSet 처리
//!
//! 템플릿 정의 타입과 템플릿 기반 데이터 레코드 디코딩을 제공합니다.
//! 두 프로토콜은 헤더와 템플릿 레코드 형식만 다르고 데이터 레코드 해석은 같습니다.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Instant;

use bytes::Bytes;
use ironflow_core::types::{ExporterKey, FlowRecord, FlowVersion};

use crate::decoder::reader::{be_uint, Reader};
use crate::decoder::DecodeOutput;
use crate::error::DecodeError;
use crate::template::{MissOutcome, PendingSet, TemplateLookup, TemplateManager};

/// 가변 길이 필드를 나타내는 길이 값
pub const VARIABLE_LENGTH: u16 = 65535;

/// 레코드당 보존하는 미지 필드 수 상한
const MAX_UNKNOWN_EXTRAS: usize = 8;
/// 보존하는 미지 필드 값 길이 상한
const MAX_UNKNOWN_VALUE_LEN: usize = 32;

/// 템플릿 필드 명세
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// 정보 요소 ID (엔터프라이즈 비트 제거)
    pub field_type: u16,
    /// 필드 길이 (`VARIABLE_LENGTH`면 가변)
    pub length: u16,
    /// 엔터프라이즈 번호 (IPFIX 전용)
    pub enterprise: Option<u32>,
}

impl FieldSpec {
    /// 표준 정보 요소 필드를 생성합니다.
    pub fn new(field_type: u16, length: u16) -> Self {
        Self {
            field_type,
            length,
            enterprise: None,
        }
    }

    /// 가변 길이 필드인지 확인합니다.
    pub fn is_variable(&self) -> bool {
        self.length == VARIABLE_LENGTH
    }
}

/// 템플릿 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// 플로우 데이터 템플릿
    Data,
    /// 옵션 템플릿
    Options {
        /// 스코프 필드 수
        scope_field_count: u16,
    },
}

/// 학습된 템플릿 정의
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDefinition {
    /// 템플릿을 보낸 익스포터
    pub exporter: ExporterKey,
    /// 템플릿 ID (256 이상)
    pub template_id: u16,
    /// 템플릿을 정의한 프로토콜
    pub version: FlowVersion,
    /// 템플릿 종류
    pub kind: TemplateKind,
    /// 선언 순서대로의 필드 목록
    pub fields: Vec<FieldSpec>,
}

impl TemplateDefinition {
    /// 레코드 최소 길이 (가변 필드는 길이 접두사 1바이트로 계산)
    pub fn min_record_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| {
                if f.is_variable() {
                    1
                } else {
                    usize::from(f.length)
                }
            })
            .sum()
    }

    /// 옵션 템플릿인지 확인합니다.
    pub fn is_options(&self) -> bool {
        matches!(self.kind, TemplateKind::Options { .. })
    }
}

/// 상대 시간 필드 변환 기준
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    /// 익스포트 시각 (Unix epoch 밀리초)
    pub export_ms: i64,
    /// 장비 부팅 후 경과 시간 (NetFlow v9 전용)
    pub sys_uptime_ms: Option<u64>,
}

impl TimeBase {
    fn uptime_to_epoch(&self, uptime_ms: u64) -> Option<i64> {
        let sys_uptime = self.sys_uptime_ms?;
        let boot = self.export_ms.checked_sub(i64::try_from(sys_uptime).ok()?)?;
        boot.checked_add(i64::try_from(uptime_ms).ok()?)
    }
}

/// 템플릿을 학습하고 대기 중이던 데이터 셋을 디코드합니다.
pub fn learn_template(
    templates: &TemplateManager,
    def: TemplateDefinition,
    now: Instant,
    out: &mut DecodeOutput,
) {
    tracing::debug!(
        exporter = %def.exporter,
        template_id = def.template_id,
        fields = def.fields.len(),
        "template learned"
    );
    out.stats.templates_learned += 1;
    let released = templates.learn(def, now);
    for pending in released {
        decode_pending(templates, pending, now, out);
    }
}

fn decode_pending(
    templates: &TemplateManager,
    pending: PendingSet,
    now: Instant,
    out: &mut DecodeOutput,
) {
    let exporter = out.exporter;
    match templates.lookup(&exporter, pending.template_id, now) {
        TemplateLookup::Active(def) => {
            if let Err(e) = decode_data_set(&def, &pending.body, &pending.time, out) {
                out.errors.push(e);
            }
        }
        // learn 직후이므로 도달하지 않지만 데이터는 버리고 카운트
        TemplateLookup::Expired | TemplateLookup::Unknown => {
            out.stats.template_misses += 1;
        }
    }
}

/// 데이터 셋을 처리합니다. 템플릿이 없으면 대기 버퍼에 보관하거나 버립니다.
pub fn handle_data_set(
    templates: &TemplateManager,
    set_id: u16,
    body: &[u8],
    time: TimeBase,
    now: Instant,
    out: &mut DecodeOutput,
) {
    let exporter = out.exporter;
    match templates.lookup(&exporter, set_id, now) {
        TemplateLookup::Active(def) => {
            if let Err(e) = decode_data_set(&def, body, &time, out) {
                out.errors.push(e);
            }
        }
        TemplateLookup::Expired | TemplateLookup::Unknown => {
            out.stats.template_misses += 1;
            let pending = PendingSet {
                template_id: set_id,
                body: Bytes::copy_from_slice(body),
                time,
                received_at: now,
            };
            match templates.on_miss(&exporter, pending) {
                MissOutcome::Buffered => out.stats.pending_buffered += 1,
                MissOutcome::Dropped => out.stats.pending_dropped += 1,
            }
            tracing::trace!(exporter = %exporter, template_id = set_id, "data set references unknown template");
        }
    }
}

/// 템플릿에 따라 데이터 셋 본문을 디코드합니다.
///
/// 완전한 레코드만 `out.records`에 추가하며, 최소 길이보다 짧은 꼬리는 패딩으로 봅니다.
/// 레코드 중간에서 실패하면 그때까지 디코드한 레코드는 유지하고 `Err`를 반환합니다.
pub fn decode_data_set(
    def: &TemplateDefinition,
    body: &[u8],
    time: &TimeBase,
    out: &mut DecodeOutput,
) -> Result<(), DecodeError> {
    let min_len = def.min_record_len();
    if min_len == 0 {
        return Err(DecodeError::Malformed("template with zero-length record"));
    }

    let mut r = Reader::new(body);
    while r.remaining() >= min_len {
        if def.is_options() {
            skip_record(def, &mut r)?;
            out.stats.options_records += 1;
            continue;
        }
        let record = read_record(def, &mut r, time, out)?;
        out.records.push(record);
    }
    Ok(())
}

fn field_len(field: &FieldSpec, r: &mut Reader<'_>) -> Result<usize, DecodeError> {
    if !field.is_variable() {
        return Ok(usize::from(field.length));
    }
    match r.u8("variable length prefix")? {
        255 => Ok(usize::from(r.u16("variable length prefix")?)),
        n => Ok(usize::from(n)),
    }
}

fn skip_record(def: &TemplateDefinition, r: &mut Reader<'_>) -> Result<(), DecodeError> {
    for field in &def.fields {
        let len = field_len(field, r)?;
        r.skip(len, "options data record")?;
    }
    Ok(())
}

/// 레코드 하나를 읽는 동안의 시간 필드
#[derive(Default)]
struct FlowTimes {
    start_ms: Option<i64>,
    end_ms: Option<i64>,
}

fn read_record(
    def: &TemplateDefinition,
    r: &mut Reader<'_>,
    time: &TimeBase,
    out: &mut DecodeOutput,
) -> Result<FlowRecord, DecodeError> {
    let mut record = FlowRecord::new(def.version, def.exporter, time.export_ms);
    let mut times = FlowTimes::default();
    let mut unknown = 0usize;

    for field in &def.fields {
        let len = field_len(field, r)?;
        let value = r.take(len, "data record")?;
        if field.enterprise.is_some() {
            out.stats.enterprise_fields += 1;
            continue;
        }
        if apply_field(&mut record, &mut times, field.field_type, value, time).is_none()
            && unknown < MAX_UNKNOWN_EXTRAS
            && !value.is_empty()
            && value.len() <= MAX_UNKNOWN_VALUE_LEN
        {
            record.push_extra(format!("ie{}", field.field_type), hex(value));
            unknown += 1;
        }
    }

    if let Some(ts) = times.end_ms.or(times.start_ms) {
        record.timestamp_ms = ts;
    }
    if let (Some(start), Some(end)) = (times.start_ms, times.end_ms) {
        record.duration_ms = end
            .checked_sub(start)
            .and_then(|d| u64::try_from(d).ok())
            .unwrap_or(0);
    }
    Ok(record)
}

/// 알려진 정보 요소를 레코드에 반영합니다.
///
/// 미지 요소이거나 값이 대상 필드 폭을 넘으면 `None`을 반환하고 레코드는 바꾸지 않습니다.
fn apply_field(
    record: &mut FlowRecord,
    times: &mut FlowTimes,
    field_type: u16,
    value: &[u8],
    time: &TimeBase,
) -> Option<()> {
    match field_type {
        // octetDeltaCount, packetDeltaCount
        1 => record.bytes = uint_as(value)?,
        2 => record.packets = uint_as(value)?,
        // octetTotalCount, packetTotalCount (delta가 없을 때만)
        85 => {
            let n = uint_as(value)?;
            if record.bytes == 0 {
                record.bytes = n;
            }
        }
        86 => {
            let n = uint_as(value)?;
            if record.packets == 0 {
                record.packets = n;
            }
        }
        4 => record.protocol = uint_as(value)?,
        5 => record.tos = uint_as(value)?,
        6 => record.tcp_flags = uint_as(value)?,
        7 => record.src_port = uint_as(value)?,
        11 => record.dst_port = uint_as(value)?,
        8 | 12 | 27 | 28 => {
            let addr = ip_from(value)?;
            if matches!(field_type, 8 | 27) {
                record.src_addr = Some(addr);
            } else {
                record.dst_addr = Some(addr);
            }
        }
        9 => record.push_extra("src_mask", uint_as::<u8>(value)?),
        13 => record.push_extra("dst_mask", uint_as::<u8>(value)?),
        10 => record.push_extra("input_if", uint_as::<u32>(value)?),
        14 => record.push_extra("output_if", uint_as::<u32>(value)?),
        15 => record.push_extra("next_hop", ip_from(value)?),
        16 => record.push_extra("src_as", uint_as::<u32>(value)?),
        17 => record.push_extra("dst_as", uint_as::<u32>(value)?),
        58 => record.push_extra("vlan", uint_as::<u16>(value)?),
        // flowEndSysUpTime, flowStartSysUpTime
        21 => times.end_ms = Some(time.uptime_to_epoch(uint_as(value)?)?),
        22 => times.start_ms = Some(time.uptime_to_epoch(uint_as(value)?)?),
        // flowStart/EndSeconds
        150 => times.start_ms = Some(uint_as::<i64>(value)?.saturating_mul(1000)),
        151 => times.end_ms = Some(uint_as::<i64>(value)?.saturating_mul(1000)),
        // flowStart/EndMilliseconds
        152 => times.start_ms = Some(uint_as(value)?),
        153 => times.end_ms = Some(uint_as(value)?),
        _ => return None,
    }
    Some(())
}

/// 빅엔디언 부호 없는 정수 값을 대상 타입으로 변환합니다. 값이 넘치면 `None`.
fn uint_as<T: TryFrom<u64>>(value: &[u8]) -> Option<T> {
    let wide = value.len().saturating_sub(8);
    if value[..wide].iter().any(|b| *b != 0) {
        return None;
    }
    T::try_from(be_uint(value)).ok()
}

fn ip_from(value: &[u8]) -> Option<IpAddr> {
    match value.len() {
        4 => {
            let octets: [u8; 4] = value.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = value.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn hex(value: &[u8]) -> String {
    use std::fmt::Write;
    value.iter().fold(String::with_capacity(value.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
