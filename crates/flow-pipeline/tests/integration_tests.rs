//! 통합 테스트 -- 파이프라인 전체 흐름 검증
//!
//! 실제 UDP 소켓으로 데이터그램을 보내 수신부터 싱크/포워더 전달까지 검증합니다.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;

use ironflow_core::config::StaticDevice;
use ironflow_core::pipeline::Pipeline;
use ironflow_core::types::{ExporterKey, FlowBatch, FlowVersion};
use ironflow_pipeline::{
    FlowPipeline, FlowPipelineBuilder, ForwardFilter, MemorySink, PipelineConfig,
    PipelineConfigBuilder, ProtocolDispatcher, RawPacket, TemplateManager,
};

const WAIT: Duration = Duration::from_secs(5);

// --- 패킷 빌더 ---

fn v5_packet(octets: &[u32]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&5u16.to_be_bytes());
    buf.extend_from_slice(&(octets.len() as u16).to_be_bytes());
    buf.extend_from_slice(&60_000u32.to_be_bytes());
    buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0]);
    for bytes in octets {
        buf.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2, 0, 0, 0, 0]);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&bytes.to_be_bytes());
        buf.extend_from_slice(&50_000u32.to_be_bytes());
        buf.extend_from_slice(&59_000u32.to_be_bytes());
        buf.extend_from_slice(&40000u16.to_be_bytes());
        buf.extend_from_slice(&443u16.to_be_bytes());
        buf.extend_from_slice(&[0, 0x18, 6, 0]);
        buf.extend_from_slice(&[0, 0, 0, 0, 24, 24, 0, 0]);
    }
    buf
}

fn v9_header(source_id: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&9u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&100_000u32.to_be_bytes());
    buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&source_id.to_be_bytes());
    buf
}

fn v9_template(id: u16) -> Vec<u8> {
    let fields: [(u16, u16); 6] = [(8, 4), (12, 4), (1, 4), (2, 4), (4, 1), (21, 4)];
    let mut buf = Vec::new();
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&((8 + fields.len() * 4) as u16).to_be_bytes());
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    for (t, l) in fields {
        buf.extend_from_slice(&t.to_be_bytes());
        buf.extend_from_slice(&l.to_be_bytes());
    }
    buf
}

fn v9_data(id: u16, bytes: u32) -> Vec<u8> {
    let mut rec = vec![10, 1, 1, 1, 10, 2, 2, 2];
    rec.extend_from_slice(&bytes.to_be_bytes());
    rec.extend_from_slice(&3u32.to_be_bytes());
    rec.push(17);
    rec.extend_from_slice(&90_000u32.to_be_bytes());
    rec.extend_from_slice(&[0, 0, 0]);
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&((rec.len() + 4) as u16).to_be_bytes());
    buf.extend(rec);
    buf
}

fn ipfix_message(domain: u32, sets: &[Vec<u8>]) -> Vec<u8> {
    let body_len: usize = sets.iter().map(Vec::len).sum();
    let mut buf = Vec::new();
    buf.extend_from_slice(&10u16.to_be_bytes());
    buf.extend_from_slice(&((16 + body_len) as u16).to_be_bytes());
    buf.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    buf.extend_from_slice(&7u32.to_be_bytes());
    buf.extend_from_slice(&domain.to_be_bytes());
    for set in sets {
        buf.extend_from_slice(set);
    }
    buf
}

fn ipfix_set(id: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

fn ipfix_template(id: u16, fields: &[(u16, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    for (t, l) in fields {
        body.extend_from_slice(&t.to_be_bytes());
        body.extend_from_slice(&l.to_be_bytes());
    }
    ipfix_set(2, &body)
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Ethernet + IPv4 + TCP 헤더 (172.16.0.1:33000 -> 172.16.0.2:22)
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

fn sflow_v5_datagram(agent: [u8; 4], sub_agent: u32) -> Vec<u8> {
    let frame = tcp_frame();
    let mut header = Vec::new();
    push_u32(&mut header, 1); // ethernet
    push_u32(&mut header, 1514);
    push_u32(&mut header, 4);
    push_u32(&mut header, frame.len() as u32);
    header.extend_from_slice(&frame);
    while header.len() % 4 != 0 {
        header.push(0);
    }
    let mut record = Vec::new();
    push_u32(&mut record, 1); // raw packet header
    push_u32(&mut record, header.len() as u32);
    record.extend(header);

    let mut body = Vec::new();
    for v in [1, 3, 512, 1000, 0, 7, 9] {
        push_u32(&mut body, v);
    }
    push_u32(&mut body, 1);
    body.extend(record);
    let mut sample = Vec::new();
    push_u32(&mut sample, 1); // flow sample
    push_u32(&mut sample, body.len() as u32);
    sample.extend(body);

    let mut buf = Vec::new();
    push_u32(&mut buf, 5);
    push_u32(&mut buf, 1);
    buf.extend_from_slice(&agent);
    push_u32(&mut buf, sub_agent);
    push_u32(&mut buf, 100);
    push_u32(&mut buf, 50_000);
    push_u32(&mut buf, 1);
    buf.extend(sample);
    buf
}

// --- 하네스 ---

fn test_config() -> PipelineConfigBuilder {
    PipelineConfigBuilder::new()
        .listen_addrs(vec!["127.0.0.1:0".parse().unwrap()])
        .batch_bounds(1, 1000, 100)
        .batch_max_wait(Duration::from_millis(50))
        .workers(2)
}

async fn start(config: PipelineConfig) -> (FlowPipeline, Arc<MemorySink>, SocketAddr) {
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = FlowPipelineBuilder::new()
        .config(config)
        .sink(sink.clone())
        .build()
        .expect("failed to build pipeline");
    pipeline.start().await.expect("failed to start pipeline");
    let addr = pipeline.local_addrs()[0];
    (pipeline, sink, addr)
}

async fn sender() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// --- 시나리오 ---

/// NetFlow v5 패킷 하나, 레코드 2개
#[tokio::test]
async fn test_netflow_v5_two_records() {
    let (mut pipeline, sink, addr) = start(test_config().build().unwrap()).await;
    let tx = sender().await;

    tx.send_to(&v5_packet(&[1500, 3000]), addr).await.unwrap();

    assert!(sink.wait_for_records(2, WAIT).await);
    let records = sink.records();
    let bytes: Vec<u64> = records.iter().map(|r| r.bytes).collect();
    assert_eq!(bytes, vec![1500, 3000]);
    assert!(records.iter().all(|r| r.version == FlowVersion::NetflowV5));
    assert_eq!(pipeline.stats().decode_errors_total(), 0);

    pipeline.stop().await.unwrap();
}

/// IPFIX 3필드 템플릿 + 12바이트 데이터 레코드
#[test]
fn test_ipfix_three_field_template_decodes_exact_fields() {
    let templates = Arc::new(TemplateManager::new(Duration::from_secs(1800), 100, 4));
    let dispatcher = ProtocolDispatcher::new(templates);
    let packet = ipfix_message(
        1,
        &[
            ipfix_template(256, &[(8, 4), (12, 4), (1, 4)]),
            ipfix_set(256, &[192, 168, 0, 1, 192, 168, 0, 2, 0, 0, 0x05, 0xdc]),
        ],
    );
    let raw = RawPacket::new(Bytes::from(packet), "203.0.113.5:4739".parse().unwrap(), 4739);

    let out = dispatcher.decode(&raw, Instant::now()).unwrap();
    assert_eq!(out.version, FlowVersion::Ipfix);
    assert_eq!(out.records.len(), 1);
    let r = &out.records[0];
    assert_eq!(r.src_addr, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
    assert_eq!(r.dst_addr, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2))));
    assert_eq!(r.bytes, 1500);
    assert_eq!(r.packets, 0);
    assert_eq!((r.src_port, r.dst_port, r.protocol), (0, 0, 0));
    assert!(out.errors.is_empty());
}

/// 패킷 수 없이 바이트만 있는 레코드는 검증에서 거부됨
#[tokio::test]
async fn test_ipfix_bytes_without_packets_rejected() {
    let (mut pipeline, sink, addr) = start(test_config().build().unwrap()).await;
    let tx = sender().await;

    let packet = ipfix_message(
        1,
        &[
            ipfix_template(256, &[(8, 4), (12, 4), (1, 4)]),
            ipfix_set(256, &[192, 168, 0, 1, 192, 168, 0, 2, 0, 0, 0x05, 0xdc]),
        ],
    );
    tx.send_to(&packet, addr).await.unwrap();

    let stats = Arc::clone(pipeline.stats());
    assert!(wait_until(|| stats.records_rejected() == 1).await);
    pipeline.stop().await.unwrap();
    assert_eq!(sink.record_count(), 0);
}

/// 템플릿과 데이터가 서로 다른 데이터그램으로 도착
#[tokio::test]
async fn test_ipfix_template_learned_across_datagrams() {
    let (mut pipeline, sink, addr) = start(test_config().build().unwrap()).await;
    let tx = sender().await;

    let template = ipfix_message(9, &[ipfix_template(300, &[(8, 4), (12, 4), (1, 4), (2, 4)])]);
    let data = ipfix_message(
        9,
        &[ipfix_set(300, &[10, 0, 0, 1, 10, 0, 0, 9, 0, 0, 0x10, 0, 0, 0, 0, 4])],
    );
    tx.send_to(&template, addr).await.unwrap();
    tx.send_to(&data, addr).await.unwrap();

    assert!(sink.wait_for_records(1, WAIT).await);
    let record = &sink.records()[0];
    assert_eq!(record.bytes, 4096);
    assert_eq!(record.packets, 4);
    assert_eq!(record.exporter.domain, 9);
    assert_eq!(pipeline.templates().len(), 1);

    pipeline.stop().await.unwrap();
}

/// sFlow v5 원시 헤더 샘플에서 L3/L4 필드 추출
#[tokio::test]
async fn test_sflow_raw_header_sample() {
    let (mut pipeline, sink, addr) = start(test_config().build().unwrap()).await;
    let tx = sender().await;

    tx.send_to(&sflow_v5_datagram([10, 9, 9, 9], 3), addr).await.unwrap();

    assert!(sink.wait_for_records(1, WAIT).await);
    let r = &sink.records()[0];
    assert_eq!(r.version, FlowVersion::SflowV5);
    assert_eq!(r.src_addr, Some(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
    assert_eq!(r.dst_addr, Some(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 2))));
    assert_eq!((r.src_port, r.dst_port, r.protocol), (33000, 22, 6));
    assert_eq!(
        r.exporter,
        ExporterKey::new(IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9)), 3)
    );

    pipeline.stop().await.unwrap();
}

/// 잘린 패킷 이후에도 수신 루프가 계속 처리
#[tokio::test]
async fn test_truncated_packet_does_not_stop_listener() {
    let (mut pipeline, sink, addr) = start(test_config().build().unwrap()).await;
    let tx = sender().await;

    tx.send_to(&[0, 5, 0, 1], addr).await.unwrap();
    tx.send_to(&v5_packet(&[800]), addr).await.unwrap();

    assert!(sink.wait_for_records(1, WAIT).await);
    assert_eq!(sink.record_count(), 1);
    let stats = pipeline.stats();
    assert_eq!(stats.packets_received(), 2);
    assert_eq!(stats.decode_errors("truncated"), 1);
    assert_eq!(stats.decode_errors_total(), 1);

    pipeline.stop().await.unwrap();
}

// --- 상태 관리 ---

/// 템플릿보다 먼저 도착한 데이터는 템플릿 수신 후 디코딩
#[tokio::test]
async fn test_v9_data_before_template_released() {
    let (mut pipeline, sink, addr) = start(test_config().build().unwrap()).await;
    let tx = sender().await;

    let mut data = v9_header(42);
    data.extend(v9_data(300, 1200));
    let mut template = v9_header(42);
    template.extend(v9_template(300));

    tx.send_to(&data, addr).await.unwrap();
    tx.send_to(&template, addr).await.unwrap();

    assert!(sink.wait_for_records(1, WAIT).await);
    let r = &sink.records()[0];
    assert_eq!(r.version, FlowVersion::NetflowV9);
    assert_eq!(r.bytes, 1200);
    assert_eq!(r.protocol, 17);
    assert!(pipeline.metrics_snapshot().template_misses >= 1);

    pipeline.stop().await.unwrap();
}

/// 한 익스포터의 레코드는 배치 일련번호 순으로 도착 순서를 보존
#[tokio::test]
async fn test_per_exporter_order_across_batches() {
    let config = test_config()
        .batch_bounds(5, 5, 5)
        .batch_max_wait(Duration::from_secs(30))
        .build()
        .unwrap();
    let (mut pipeline, sink, addr) = start(config).await;
    let tx = sender().await;

    for i in 1..=20u32 {
        tx.send_to(&v5_packet(&[i]), addr).await.unwrap();
    }

    assert!(sink.wait_for_records(20, WAIT).await);
    let mut batches: Vec<Arc<FlowBatch>> = sink.batches();
    batches.sort_by_key(|b| b.sequence);
    let bytes: Vec<u64> = batches
        .iter()
        .flat_map(|b| b.records.iter().map(|r| r.bytes))
        .collect();
    assert_eq!(bytes, (1..=20).collect::<Vec<u64>>());
    assert!(batches.iter().all(|b| b.len() == 5));

    pipeline.stop().await.unwrap();
}

/// 캐시 용량을 넘는 익스포터가 오면 엔트리 수가 용량에서 멈춤
#[tokio::test]
async fn test_device_cache_bounded_by_capacity() {
    let config = test_config().cache_capacity(3).build().unwrap();
    let (mut pipeline, sink, addr) = start(config).await;
    let tx = sender().await;

    for agent in 1..=4u8 {
        tx.send_to(&sflow_v5_datagram([10, 0, 0, agent], 0), addr)
            .await
            .unwrap();
    }

    assert!(sink.wait_for_records(4, WAIT).await);
    let cache = pipeline.device_cache();
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.evictions(), 1);
    assert!(!cache.contains(&ExporterKey::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 0)));

    pipeline.stop().await.unwrap();
}

/// 메모리 예산을 줄이면 압력 샘플링에서 low-water 아래로 제거
#[tokio::test]
async fn test_device_cache_memory_pressure() {
    let (mut pipeline, sink, addr) = start(test_config().build().unwrap()).await;
    let tx = sender().await;

    for agent in 1..=10u8 {
        tx.send_to(&sflow_v5_datagram([10, 0, 1, agent], 0), addr)
            .await
            .unwrap();
    }
    assert!(sink.wait_for_records(10, WAIT).await);

    let cache = pipeline.device_cache();
    let used = cache.memory_used();
    cache.set_memory_budget(used / 2);
    cache.apply_memory_pressure();
    assert!(cache.memory_used() < used / 2);
    assert!(cache.len() < 10);
    // 가장 먼저 삽입된 엔트리부터 제거
    assert!(!cache.contains(&ExporterKey::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)), 0)));

    pipeline.stop().await.unwrap();
}

/// 정적 디바이스 테이블의 이름이 레코드에 붙음
#[tokio::test]
async fn test_static_device_name_attached() {
    let config = test_config()
        .static_devices(vec![StaticDevice {
            address: "127.0.0.1".to_owned(),
            name: "lab-edge".to_owned(),
            device_type: "router".to_owned(),
        }])
        .build()
        .unwrap();
    let (mut pipeline, sink, addr) = start(config).await;
    let tx = sender().await;

    tx.send_to(&v5_packet(&[100]), addr).await.unwrap();

    assert!(sink.wait_for_records(1, WAIT).await);
    assert_eq!(sink.records()[0].extra("device_name"), Some("lab-edge"));

    pipeline.stop().await.unwrap();
}

// --- 포워더/종료 ---

/// 버전 필터 구독자는 해당 버전 배치만 수신
#[tokio::test]
async fn test_forward_subscription_filters_by_version() {
    let sink = Arc::new(MemorySink::new());
    let mut pipeline = FlowPipelineBuilder::new()
        .config(test_config().build().unwrap())
        .sink(sink.clone())
        .build()
        .unwrap();
    let mut sflow_only = pipeline.subscribe(ForwardFilter::all().with_versions([FlowVersion::SflowV5]));
    pipeline.start().await.unwrap();
    let addr = pipeline.local_addrs()[0];
    let tx = sender().await;

    tx.send_to(&v5_packet(&[500]), addr).await.unwrap();
    tx.send_to(&sflow_v5_datagram([10, 9, 9, 9], 0), addr).await.unwrap();

    assert!(sink.wait_for_records(2, WAIT).await);
    let batch = tokio::time::timeout(WAIT, sflow_only.recv())
        .await
        .expect("forward timed out")
        .expect("forward channel closed");
    assert!(batch.records.iter().all(|r| r.version == FlowVersion::SflowV5));

    pipeline.stop().await.unwrap();
    assert!(sflow_only.try_recv().is_err());
}

/// 정지 시 플러시되지 않은 배치가 싱크로 넘어감
#[tokio::test]
async fn test_stop_flushes_pending_batches() {
    let config = test_config()
        .batch_bounds(1, 1000, 1000)
        .batch_max_wait(Duration::from_secs(60))
        .build()
        .unwrap();
    let (mut pipeline, sink, addr) = start(config).await;
    let tx = sender().await;

    tx.send_to(&v5_packet(&[10, 20]), addr).await.unwrap();

    let stats = Arc::clone(pipeline.stats());
    assert!(wait_until(|| stats.flows_decoded() == 2).await);
    assert_eq!(sink.record_count(), 0);

    pipeline.stop().await.unwrap();
    assert_eq!(sink.record_count(), 2);
    let report = pipeline.last_drain_report().unwrap();
    assert_eq!(report.lost, 0);
}

// --- 견고성 ---

mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn dispatcher() -> ProtocolDispatcher {
        ProtocolDispatcher::new(Arc::new(TemplateManager::new(
            Duration::from_secs(60),
            64,
            4,
        )))
    }

    fn raw(data: Vec<u8>) -> RawPacket {
        RawPacket::new(Bytes::from(data), "192.0.2.1:2055".parse().unwrap(), 2055)
    }

    proptest! {
        #[test]
        fn decode_arbitrary_bytes_does_not_panic(bytes in prop::collection::vec(any::<u8>(), 0..2048)) {
            let _ = dispatcher().decode(&raw(bytes), Instant::now());
        }

        #[test]
        fn decode_arbitrary_v9_body_does_not_panic(body in prop::collection::vec(any::<u8>(), 0..1024)) {
            let mut packet = v9_header(1);
            packet.extend(body);
            let _ = dispatcher().decode(&raw(packet), Instant::now());
        }

        #[test]
        fn decode_arbitrary_ipfix_sets_do_not_panic(body in prop::collection::vec(any::<u8>(), 0..1024)) {
            let packet = ipfix_message(1, &[body]);
            let _ = dispatcher().decode(&raw(packet), Instant::now());
        }

        #[test]
        fn truncated_v5_never_yields_records(count in 1u16..30, cut in 1usize..48) {
            let octets: Vec<u32> = (0..u32::from(count)).map(|i| 100 + i).collect();
            let mut packet = v5_packet(&octets);
            packet.truncate(packet.len() - cut);
            let result = dispatcher().decode(&raw(packet), Instant::now());
            prop_assert!(result.is_err());
        }

        #[test]
        fn truncated_sflow_does_not_panic(cut in 0usize..120) {
            let mut packet = sflow_v5_datagram([10, 1, 1, 1], 0);
            let keep = packet.len().saturating_sub(cut);
            packet.truncate(keep);
            let _ = dispatcher().decode(&raw(packet), Instant::now());
        }
    }
}
