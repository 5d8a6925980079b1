//! UDP 플로우 수신기
//!
//! NetFlow/IPFIX(기본 2055/udp), sFlow(기본 6343/udp) 데이터그램을 수신합니다.
//! 포트는 힌트일 뿐이며 프로토콜은 데이터그램 내용으로 감지합니다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CollectorStatus, RawPacket};
use crate::error::FlowPipelineError;
use crate::ingest::PacketProcessor;

/// UDP 소켓을 바인드합니다.
///
/// 수신 버퍼(SO_RCVBUF) 설정 실패는 경고만 남기고 계속합니다.
pub fn bind_udp(addr: SocketAddr, recv_buffer_bytes: usize) -> Result<UdpSocket, FlowPipelineError> {
    let transport = |e: std::io::Error| FlowPipelineError::Transport {
        addr: addr.to_string(),
        reason: e.to_string(),
    };

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(transport)?;
    socket.set_reuse_address(true).map_err(transport)?;

    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_bytes) {
        tracing::warn!(
            error = %e,
            requested_size = recv_buffer_bytes,
            addr = %addr,
            "failed to set UDP SO_RCVBUF"
        );
    }

    socket.bind(&addr.into()).map_err(transport)?;
    socket.set_nonblocking(true).map_err(transport)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(transport)
}

/// UDP 수신 태스크
///
/// 소켓 하나와 처리기 하나를 소유합니다. 취소되면 누적 중인 배치를
/// 모두 워커 풀로 넘긴 뒤 종료합니다.
pub struct UdpListener {
    socket: UdpSocket,
    local_addr: SocketAddr,
    processor: PacketProcessor,
    max_datagram_bytes: usize,
    flush_tick: Duration,
    status: Arc<Mutex<CollectorStatus>>,
}

impl UdpListener {
    /// 바인드된 소켓으로 수신기를 생성합니다.
    pub fn new(
        socket: UdpSocket,
        processor: PacketProcessor,
        max_datagram_bytes: usize,
        flush_tick: Duration,
    ) -> Result<Self, FlowPipelineError> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            processor,
            max_datagram_bytes: max_datagram_bytes.max(1),
            flush_tick: flush_tick.max(Duration::from_millis(1)),
            status: Arc::new(Mutex::new(CollectorStatus::Idle)),
        })
    }

    /// 바인드된 로컬 주소
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 상태 공유 핸들 (태스크 시작 전에 복제해 둡니다)
    pub fn status_handle(&self) -> Arc<Mutex<CollectorStatus>> {
        Arc::clone(&self.status)
    }

    /// 취소될 때까지 수신 루프를 실행합니다. 수신한 데이터그램 수를 반환합니다.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        *self.status.lock() = CollectorStatus::Running;
        let port = self.local_addr.port();
        info!(addr = %self.local_addr, "flow listener started");

        let mut buf = vec![0u8; self.max_datagram_bytes];
        let mut ticker = tokio::time::interval(self.flush_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut received = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.processor.flush_expired(Instant::now()).await;
                }
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, source)) => {
                        received += 1;
                        let packet = RawPacket {
                            data: Bytes::copy_from_slice(&buf[..len]),
                            source,
                            received_at: SystemTime::now(),
                            local_port: port,
                        };
                        self.processor.process(packet).await;
                    }
                    Err(e) => {
                        self.processor.record_receive_error(port);
                        debug!(addr = %self.local_addr, error = %e, "UDP recv error");
                    }
                },
            }
        }

        let flushed = self.processor.flush_all().await;
        *self.status.lock() = CollectorStatus::Stopped;
        info!(
            addr = %self.local_addr,
            received,
            flushed_batches = flushed,
            "flow listener stopped"
        );
        received
    }
}
