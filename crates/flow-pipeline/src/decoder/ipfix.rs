//! IPFIX 디코더 (RFC 7011)
//!
//! 16바이트 메시지 헤더의 길이는 데이터그램 길이와 같아야 합니다.
//! - Set ID 2: 템플릿 (필드 수 0이면 철회, 템플릿 ID 2는 전체 철회)
//! - Set ID 3: 옵션 템플릿 (템플릿 ID 3은 전체 철회)
//! - Set ID 256 이상: 데이터
//!
//! 필드 명세의 최상위 비트가 켜져 있으면 4바이트 엔터프라이즈 번호가 뒤따릅니다.

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
pub const VERSION: u16 = 10;
/// 메시지 헤더 길이
pub const HEADER_LEN: usize = 16;

const TEMPLATE_SET_ID: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
const MIN_DATA_SET_ID: u16 = 256;
const SET_HEADER_LEN: usize = 4;
const ENTERPRISE_BIT: u16 = 0x8000;

/// IPFIX 메시지 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// 메시지 전체 길이
    pub length: u16,
    /// 익스포트 시각 (초)
    pub export_time: u32,
    /// 데이터 레코드 일련번호
    pub sequence: u32,
    /// 관측 도메인 ID
    pub domain_id: u32,
}

impl Header {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.u16("ipfix header")?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion(u32::from(version)));
        }
        Ok(Self {
            length: r.u16("ipfix header")?,
            export_time: r.u32("ipfix header")?,
            sequence: r.u32("ipfix header")?,
            domain_id: r.u32("ipfix header")?,
        })
    }
}

/// IPFIX 메시지를 디코드합니다.
pub fn decode(
    data: &[u8],
    source: IpAddr,
    templates: &TemplateManager,
    now: Instant,
) -> Result<DecodeOutput, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            what: "ipfix header",
            needed: HEADER_LEN,
            available: data.len(),
        });
    }
    let mut r = Reader::new(data);
    let header = Header::read(&mut r)?;
    if usize::from(header.length) != data.len() {
        return Err(DecodeError::LengthMismatch {
            what: "ipfix message",
            declared: usize::from(header.length),
            actual: data.len(),
        });
    }

    let exporter = ExporterKey::new(source, header.domain_id);
    let time = TimeBase {
        export_ms: i64::from(header.export_time) * 1000,
        sys_uptime_ms: None,
    };
    let mut out = DecodeOutput::new(FlowVersion::Ipfix, exporter);

    while r.remaining() >= SET_HEADER_LEN {
        let set_id = r.u16("set header")?;
        let length = usize::from(r.u16("set header")?);
        if length < SET_HEADER_LEN || length - SET_HEADER_LEN > r.remaining() {
            out.errors.push(DecodeError::LengthMismatch {
                what: "ipfix set",
                declared: length,
                actual: r.remaining() + SET_HEADER_LEN,
            });
            break;
        }
        let body = r.take(length - SET_HEADER_LEN, "set body")?;

        let result = match set_id {
            TEMPLATE_SET_ID => parse_templates(body, exporter, false, templates, now, &mut out),
            OPTIONS_TEMPLATE_SET_ID => {
                parse_templates(body, exporter, true, templates, now, &mut out)
            }
            id if id >= MIN_DATA_SET_ID => {
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
    options: bool,
    templates: &TemplateManager,
    now: Instant,
    out: &mut DecodeOutput,
) -> Result<(), DecodeError> {
    let mut r = Reader::new(body);
    while r.remaining() >= 4 {
        let template_id = r.u16("template record")?;
        let field_count = r.u16("template record")?;

        if field_count == 0 {
            let removed = if template_id == TEMPLATE_SET_ID || template_id == OPTIONS_TEMPLATE_SET_ID
            {
                templates.withdraw_all(&exporter, options)
            } else {
                usize::from(templates.withdraw(&exporter, template_id))
            };
            out.stats.templates_withdrawn += removed as u64;
            continue;
        }
        if template_id < MIN_DATA_SET_ID {
            return Err(DecodeError::Malformed("ipfix template id below 256"));
        }

        let kind = if options {
            let scope_field_count = r.u16("options template record")?;
            if scope_field_count == 0 || scope_field_count > field_count {
                return Err(DecodeError::Malformed("ipfix options scope count"));
            }
            TemplateKind::Options { scope_field_count }
        } else {
            TemplateKind::Data
        };
        let fields = read_fields(&mut r, usize::from(field_count))?;
        let def = TemplateDefinition {
            exporter,
            template_id,
            version: FlowVersion::Ipfix,
            kind,
            fields,
        };
        learn_template(templates, def, now, out);
    }
    Ok(())
}

fn read_fields(r: &mut Reader<'_>, count: usize) -> Result<Vec<FieldSpec>, DecodeError> {
    // 최소 4바이트 필드 명세 기준 상한 검사
    if count * 4 > r.remaining() {
        return Err(DecodeError::Truncated {
            what: "template fields",
            needed: count * 4,
            available: r.remaining(),
        });
    }
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let raw_type = r.u16("field specifier")?;
        let length = r.u16("field specifier")?;
        let enterprise = if raw_type & ENTERPRISE_BIT != 0 {
            Some(r.u32("enterprise number")?)
        } else {
            None
        };
        fields.push(FieldSpec {
            field_type: raw_type & !ENTERPRISE_BIT,
            length,
            enterprise,
        });
    }
    Ok(fields)
}
