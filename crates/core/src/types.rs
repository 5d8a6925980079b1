//! 플로우 도메인 타입
//!
//! 디코더가 생성하고 검증기/배치 누적기/워커 풀이 소비하는
//! 정규화된 플로우 레코드와 배치 구조를 정의합니다.

use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// 플로우 익스포트 프로토콜 및 버전 태그
///
/// 모든 레코드는 디코더와 무관하게 이 통합 태그로 출처를 표시합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowVersion {
    /// NetFlow v5 (고정 레이아웃)
    NetflowV5,
    /// NetFlow v9 (템플릿 기반)
    NetflowV9,
    /// IPFIX (NetFlow v10)
    Ipfix,
    /// sFlow v4
    SflowV4,
    /// sFlow v5
    SflowV5,
}

impl FlowVersion {
    /// 메트릭 레이블과 직렬화에 쓰이는 정규 이름
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetflowV5 => "netflow_v5",
            Self::NetflowV9 => "netflow_v9",
            Self::Ipfix => "ipfix",
            Self::SflowV4 => "sflow_v4",
            Self::SflowV5 => "sflow_v5",
        }
    }

    /// 템플릿 관리가 필요한 프로토콜인지 여부
    pub fn is_template_based(self) -> bool {
        matches!(self, Self::NetflowV9 | Self::Ipfix)
    }

    /// sFlow 계열인지 여부
    pub fn is_sflow(self) -> bool {
        matches!(self, Self::SflowV4 | Self::SflowV5)
    }
}

impl fmt::Display for FlowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 익스포터 식별자
///
/// 익스포터 IP와 프로토콜이 제공하는 관측 도메인(observation domain)을
/// 조합합니다. NAT 뒤에서 같은 IP를 공유하는 익스포터를 구분하기 위해
/// 템플릿 테이블과 디바이스 캐시 모두 이 키를 사용합니다.
///
/// | 프로토콜 | domain 값 |
/// |---|---|
/// | NetFlow v5 | `engine_type << 8 \| engine_id` |
/// | NetFlow v9 | Source ID |
/// | IPFIX | Observation Domain ID |
/// | sFlow v5 | sub-agent ID (v4는 0) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExporterKey {
    /// 익스포터 주소 (sFlow는 에이전트 주소)
    pub addr: IpAddr,
    /// 관측 도메인 식별자
    pub domain: u32,
}

impl ExporterKey {
    /// 새 익스포터 키를 생성합니다.
    pub fn new(addr: IpAddr, domain: u32) -> Self {
        Self { addr, domain }
    }

    /// 관측 도메인이 없는 익스포터 키를 생성합니다.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self { addr, domain: 0 }
    }
}

impl fmt::Display for ExporterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.domain)
    }
}

/// 정규화된 플로우 레코드
///
/// 디코더가 생성하며 검증기를 통과한 뒤 배치에 추가됩니다.
/// 모든 수치 필드는 부호 없는 타입이므로 음수가 될 수 없습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// 플로우 종료(또는 관측) 시각, Unix epoch 밀리초
    pub timestamp_ms: i64,
    /// 출발지 IP (템플릿에 주소 필드가 없으면 None)
    pub src_addr: Option<IpAddr>,
    /// 목적지 IP
    pub dst_addr: Option<IpAddr>,
    /// 출발지 포트
    pub src_port: u16,
    /// 목적지 포트
    pub dst_port: u16,
    /// IP 프로토콜 번호 (TCP=6, UDP=17 등)
    pub protocol: u8,
    /// 바이트 수
    pub bytes: u64,
    /// 패킷 수
    pub packets: u64,
    /// 누적 TCP 플래그
    pub tcp_flags: u8,
    /// Type of Service
    pub tos: u8,
    /// 플로우 지속 시간 (밀리초)
    pub duration_ms: u64,
    /// 출처 프로토콜/버전 태그
    pub version: FlowVersion,
    /// 익스포터 식별자
    pub exporter: ExporterKey,
    /// 추가 필드 (key-value 쌍, 예: input_if, src_as, vlan)
    pub extra: Vec<(String, String)>,
}

impl FlowRecord {
    /// 필수 식별 정보만 채운 빈 레코드를 생성합니다.
    pub fn new(version: FlowVersion, exporter: ExporterKey, timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            src_addr: None,
            dst_addr: None,
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            bytes: 0,
            packets: 0,
            tcp_flags: 0,
            tos: 0,
            duration_ms: 0,
            version,
            exporter,
            extra: Vec::new(),
        }
    }

    /// 추가 필드를 기록합니다.
    pub fn push_extra(&mut self, key: impl Into<String>, value: impl ToString) {
        self.extra.push((key.into(), value.to_string()));
    }

    /// 추가 필드를 이름으로 조회합니다.
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addr = |a: Option<IpAddr>| a.map_or_else(|| "-".to_owned(), |ip| ip.to_string());
        write!(
            f,
            "[{}] {}:{} -> {}:{} proto={} bytes={} packets={}",
            self.version,
            addr(self.src_addr),
            self.src_port,
            addr(self.dst_addr),
            self.dst_port,
            self.protocol,
            self.bytes,
            self.packets,
        )
    }
}

/// 플러시 단위 배치
///
/// 누적기가 생성하며, 플러시되면 워커에 넘겨진 뒤 더 이상 변경되지 않습니다.
/// 같은 익스포터의 배치는 `sequence`가 단조 증가합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowBatch {
    /// 배치 고유 ID (UUID v4)
    pub id: uuid::Uuid,
    /// 누적 키 (익스포터)
    pub exporter: ExporterKey,
    /// 익스포터별 배치 일련번호
    pub sequence: u64,
    /// 추가 순서가 보존된 레코드 목록
    pub records: Vec<FlowRecord>,
    /// 첫 레코드가 추가된 시각
    pub created_at: SystemTime,
    /// 최대 대기 시간 기준 플러시 기한
    pub deadline: SystemTime,
}

impl FlowBatch {
    /// 새 배치를 생성합니다.
    pub fn new(
        exporter: ExporterKey,
        sequence: u64,
        records: Vec<FlowRecord>,
        created_at: SystemTime,
        deadline: SystemTime,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            exporter,
            sequence,
            records,
            created_at,
            deadline,
        }
    }

    /// 레코드 수를 반환합니다.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 배치가 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 배치에 포함된 총 바이트 수를 반환합니다.
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.bytes).sum()
    }
}

impl fmt::Display for FlowBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} exporter={} seq={} records={}",
            self.id,
            self.exporter,
            self.sequence,
            self.records.len()
        )
    }
}

/// 현재 시각을 Unix epoch 밀리초로 반환합니다.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `SystemTime`을 Unix epoch 밀리초로 변환합니다.
pub fn system_time_millis(time: SystemTime) -> i64 {
    chrono::DateTime::<chrono::Utc>::from(time).timestamp_millis()
}
