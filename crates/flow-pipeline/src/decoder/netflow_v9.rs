//! NetFlow v9 디코더
//!
//! 20바이트 헤더 뒤에 FlowSet이 이어집니다.
//! - FlowSet ID 0: 템플릿
//! - FlowSet ID 1: 옵션 템플릿
//! - FlowSet ID 2~255: 예약 (건너뜀)
//! - FlowSet ID 256 이상: 해당 템플릿의 데이터
//!
//! 헤더의 source ID가 관측 도메인입니다. FlowSet 길이가 잘못되면 그 지점에서
//! 멈추고, 이미 디코드한 레코드는 유지합니다.

use std::net::IpAddr;
use std::time::Instant;

use ironflow_core::types::{ExporterKey, FlowVersion};

use crate::decoder::flowset::{
    handle_data_set, learn_template, FieldSpec, TemplateDefinition, TemplateKind, TimeBase,
};
use crate::decoder::reader::Reader;
use crate::decoder::DecodeOutput;
use crate::error::DecodeError;
use crate::template::TemplateManager;

/// 프로토콜 버전
pub const VERSION: u16 = 9;
/// 헤더 길이
pub const HEADER_LEN: usize = 20;

const TEMPLATE_FLOWSET_ID: u16 = 0;
const OPTIONS_TEMPLATE_FLOWSET_ID: u16 = 1;
const MIN_DATA_FLOWSET_ID: u16 = 256;
const FLOWSET_HEADER_LEN: usize = 4;

/// NetFlow v9 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// 레코드 수 (템플릿 + 데이터)
    pub count: u16,
    /// 장비 부팅 후 경과 시간 (밀리초)
    pub sys_uptime: u32,
    /// 익스포트 시각 (초)
    pub unix_secs: u32,
    /// 패킷 일련번호
    pub sequence: u32,
    /// 관측 도메인
    pub source_id: u32,
}

impl Header {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.u16("netflow v9 header")?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(u32::from(version)));
        }
        Ok(Self {
            count: r.u16("netflow v9 header")?,
            sys_uptime: r.u32("netflow v9 header")?,
            unix_secs: r.u32("netflow v9 header")?,
            sequence: r.u32("netflow v9 header")?,
            source_id: r.u32("netflow v9 header")?,
        })
    }

    fn time_base(&self) -> TimeBase {
        TimeBase {
            export_ms: i64::from(self.unix_secs) * 1000,
            sys_uptime_ms: Some(u64::from(self.sys_uptime)),
        }
    }
}

/// NetFlow v9 데이터그램을 디코드합니다.
pub fn decode(
    data: &[u8],
    source: IpAddr,
    templates: &TemplateManager,
    now: Instant,
) -> Result<DecodeOutput, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            what: "netflow v9 header",
            needed: HEADER_LEN,
            available: data.len(),
        });
    }
    let mut r = Reader::new(data);
    let header = Header::read(&mut r)?;
    let exporter = ExporterKey::new(source, header.source_id);
    let time = header.time_base();
    let mut out = DecodeOutput::new(FlowVersion::NetflowV9, exporter);

    while r.remaining() >= FLOWSET_HEADER_LEN {
        let set_id = r.u16("flowset header")?;
        let length = usize::from(r.u16("flowset header")?);
        if length < FLOWSET_HEADER_LEN || length - FLOWSET_HEADER_LEN > r.remaining() {
            out.errors.push(DecodeError::LengthMismatch {
                what: "netflow v9 flowset",
                declared: length,
                actual: r.remaining() + FLOWSET_HEADER_LEN,
            });
            break;
        }
        let body = r.take(length - FLOWSET_HEADER_LEN, "flowset body")?;

        let result = match set_id {
            TEMPLATE_FLOWSET_ID => parse_templates(body, exporter, templates, now, &mut out),
            OPTIONS_TEMPLATE_FLOWSET_ID => {
                parse_options_templates(body, exporter, templates, now, &mut out)
            }
            id if id >= MIN_DATA_FLOWSET_ID => {
                handle_data_set(templates, id, body, time, now, &mut out);
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            out.errors.push(e);
        }
    }
    Ok(out)
}

fn parse_templates(
    body: &[u8],
    exporter: ExporterKey,
    templates: &TemplateManager,
    now: Instant,
    out: &mut DecodeOutput,
) -> Result<(), DecodeError> {
    let mut r = Reader::new(body);
    while r.remaining() >= 4 {
        let template_id = r.u16("template record")?;
        let field_count = r.u16("template record")?;
        // 남은 0 바이트는 FlowSet 패딩
        if template_id == 0 && field_count == 0 {
            break;
        }
        if template_id < MIN_DATA_FLOWSET_ID || field_count == 0 {
            return Err(DecodeError::Malformed("netflow v9 template header"));
        }
        let fields = read_fields(&mut r, usize::from(field_count))?;
        let def = TemplateDefinition {
            exporter,
            template_id,
            version: FlowVersion::NetflowV9,
            kind: TemplateKind::Data,
            fields,
        };
        learn_template(templates, def, now, out);
    }
    Ok(())
}

fn parse_options_templates(
    body: &[u8],
    exporter: ExporterKey,
    templates: &TemplateManager,
    now: Instant,
    out: &mut DecodeOutput,
) -> Result<(), DecodeError> {
    let mut r = Reader::new(body);
    while r.remaining() >= 6 {
        let template_id = r.u16("options template record")?;
        let scope_len = usize::from(r.u16("options template record")?);
        let option_len = usize::from(r.u16("options template record")?);
        if template_id == 0 && scope_len == 0 && option_len == 0 {
            break;
        }
        if template_id < MIN_DATA_FLOWSET_ID || scope_len % 4 != 0 || option_len % 4 != 0 {
            return Err(DecodeError::Malformed("netflow v9 options template header"));
        }
        let scope_count = scope_len / 4;
        let fields = read_fields(&mut r, scope_count + option_len / 4)?;
        if fields.is_empty() {
            return Err(DecodeError::Malformed("netflow v9 options template without fields"));
        }
        let def = TemplateDefinition {
            exporter,
            template_id,
            version: FlowVersion::NetflowV9,
            kind: TemplateKind::Options {
                scope_field_count: u16::try_from(scope_count).unwrap_or(u16::MAX),
            },
            fields,
        };
        learn_template(templates, def, now, out);
    }
    Ok(())
}

fn read_fields(r: &mut Reader<'_>, count: usize) -> Result<Vec<FieldSpec>, DecodeError> {
    if count * 4 > r.remaining() {
        return Err(DecodeError::Truncated {
            what: "template fields",
            needed: count * 4,
            available: r.remaining(),
        });
    }
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let field_type = r.u16("template field")?;
        let length = r.u16("template field")?;
        fields.push(FieldSpec::new(field_type, length));
    }
    Ok(fields)
}
