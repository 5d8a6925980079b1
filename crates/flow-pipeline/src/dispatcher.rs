//! 프로토콜 감지 및 디코더 분배
//!
//! 데이터그램 앞부분으로 프로토콜을 판별합니다.
//! - u16 5 / 9 / 10: NetFlow v5 / NetFlow v9 / IPFIX
//! - u32 4 / 5: sFlow v4 / v5 (첫 u16이 0)
//!
//! 수신 포트는 힌트일 뿐이며, 한 포트로 여러 프로토콜이 들어와도 처리합니다.

use std::sync::Arc;
use std::time::Instant;

use ironflow_core::types::{system_time_millis, FlowVersion};

use crate::collector::RawPacket;
use crate::decoder::{ipfix, netflow_v5, netflow_v9, sflow, DecodeOutput};
use crate::error::DecodeError;
use crate::template::TemplateManager;

/// 데이터그램의 프로토콜을 감지합니다.
pub fn detect(data: &[u8]) -> Result<FlowVersion, DecodeError> {
    let Some(head) = data.get(..2) else {
        return Err(DecodeError::Truncated {
            what: "version field",
            needed: 2,
            available: data.len(),
        });
    };
    match u16::from_be_bytes([head[0], head[1]]) {
        netflow_v5::VERSION => Ok(FlowVersion::NetflowV5),
        netflow_v9::VERSION => Ok(FlowVersion::NetflowV9),
        ipfix::VERSION => Ok(FlowVersion::Ipfix),
        0 => {
            let Some(word) = data.get(..4) else {
                return Err(DecodeError::Truncated {
                    what: "version field",
                    needed: 4,
                    available: data.len(),
                });
            };
            match u32::from_be_bytes([word[0], word[1], word[2], word[3]]) {
                4 => Ok(FlowVersion::SflowV4),
                5 => Ok(FlowVersion::SflowV5),
                other => Err(DecodeError::UnsupportedVersion(other)),
            }
        }
        other => Err(DecodeError::UnsupportedVersion(u32::from(other))),
    }
}

/// 디코드 실패
///
/// 감지된 버전이 있으면 메트릭 레이블에 사용합니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    /// 감지된 프로토콜 (감지 전 실패면 `None`)
    pub version: Option<FlowVersion>,
    /// 실패 원인
    pub error: DecodeError,
}

/// 프로토콜 디스패처
///
/// 템플릿 관리자를 소유하고 감지된 버전의 디코더로 데이터그램을 넘깁니다.
#[derive(Clone)]
pub struct ProtocolDispatcher {
    templates: Arc<TemplateManager>,
}

impl ProtocolDispatcher {
    /// 새 디스패처를 생성합니다.
    pub fn new(templates: Arc<TemplateManager>) -> Self {
        Self { templates }
    }

    /// 템플릿 관리자를 반환합니다.
    pub fn templates(&self) -> &Arc<TemplateManager> {
        &self.templates
    }

    /// 패킷 하나를 디코드합니다.
    pub fn decode(&self, packet: &RawPacket, now: Instant) -> Result<DecodeOutput, DecodeFailure> {
        let data = packet.data.as_ref();
        let version = detect(data).map_err(|error| DecodeFailure {
            version: None,
            error,
        })?;
        let source = packet.source.ip();

        let result = match version {
            FlowVersion::NetflowV5 => netflow_v5::decode(data, source),
            FlowVersion::NetflowV9 => netflow_v9::decode(data, source, &self.templates, now),
            FlowVersion::Ipfix => ipfix::decode(data, source, &self.templates, now),
            FlowVersion::SflowV4 | FlowVersion::SflowV5 => {
                sflow::decode(data, source, system_time_millis(packet.received_at))
            }
        };
        result.map_err(|error| DecodeFailure {
            version: Some(version),
            error,
        })
    }
}
