//! 수집 모듈 -- UDP 포트에서 플로우 데이터그램을 수신합니다.
//!
//! # 아키텍처
//! 바인드된 포트마다 전용 tokio 태스크([`UdpListener`])가 하나씩 실행되어
//! 익스포터별 도착 순서를 보존합니다. 디코드/검증은 같은 태스크에서 인라인으로
//! 수행하고, 플러시 I/O만 워커 풀로 넘깁니다.

pub mod udp;

pub use udp::{bind_udp, UdpListener};

use std::net::SocketAddr;
use std::time::SystemTime;

use bytes::Bytes;

/// 수신된 원시 데이터그램
///
/// 디코드 시도 후 버려집니다.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// 데이터그램 바이트
    pub data: Bytes,
    /// 송신 주소 (익스포터)
    pub source: SocketAddr,
    /// 수신 시각
    pub received_at: SystemTime,
    /// 수신 포트 (프로토콜 힌트, 메트릭 레이블)
    pub local_port: u16,
}

impl RawPacket {
    /// 현재 시각으로 새 RawPacket을 생성합니다.
    pub fn new(data: Bytes, source: SocketAddr, local_port: u16) -> Self {
        Self {
            data,
            source,
            received_at: SystemTime::now(),
            local_port,
        }
    }
}

/// 수집기 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorStatus {
    /// 실행 대기 중
    Idle,
    /// 실행 중
    Running,
    /// 에러로 중단됨
    Error(String),
    /// 정상 종료됨
    Stopped,
}

impl CollectorStatus {
    /// 상태 이름
    pub fn as_str(&self) -> &str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Error(_) => "error",
            Self::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_packet_keeps_source_and_port() {
        let packet = RawPacket::new(
            Bytes::from_static(b"\x00\x05"),
            "192.0.2.1:9000".parse().unwrap(),
            2055,
        );
        assert_eq!(packet.local_port, 2055);
        assert_eq!(packet.source.port(), 9000);
        assert_eq!(packet.data.len(), 2);
    }

    #[test]
    fn status_names() {
        assert_eq!(CollectorStatus::Idle.as_str(), "idle");
        assert_eq!(CollectorStatus::Error("x".to_owned()).as_str(), "error");
    }
}
