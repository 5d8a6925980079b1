#![no_main]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use bytes::Bytes;
use ironflow_pipeline::{ProtocolDispatcher, RawPacket, TemplateManager};
use libfuzzer_sys::fuzz_target;

/// 퍼저용 구조적 입력
#[derive(Arbitrary, Debug)]
struct FuzzInput {
    /// 출발지 IPv4 옥텟
    source: [u8; 4],
    /// 수신 포트 (버전 감지 힌트)
    port: FuzzPort,
    /// 같은 출발지에서 연속으로 받은 데이터그램 (최대 8개)
    datagrams: Vec<Vec<u8>>,
}

#[derive(Arbitrary, Debug)]
enum FuzzPort {
    NetFlow,
    Ipfix,
    Sflow,
    Other(u16),
}

impl FuzzPort {
    fn as_u16(&self) -> u16 {
        match self {
            FuzzPort::NetFlow => 2055,
            FuzzPort::Ipfix => 4739,
            FuzzPort::Sflow => 6343,
            FuzzPort::Other(port) => *port,
        }
    }
}

fuzz_target!(|input: FuzzInput| {
    let templates = Arc::new(TemplateManager::new(Duration::from_secs(60), 64, 4));
    let dispatcher = ProtocolDispatcher::new(Arc::clone(&templates));
    let port = input.port.as_u16();
    let source: SocketAddr = (input.source, port).into();
    let now = Instant::now();

    for data in input.datagrams.iter().take(8) {
        let packet = RawPacket::new(Bytes::copy_from_slice(data), source, port);
        let _ = dispatcher.decode(&packet, now);
    }
    assert!(templates.len() <= 64);
});
