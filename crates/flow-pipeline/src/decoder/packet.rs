//! 원시 패킷 헤더 파서
//!
//! sFlow 원시 헤더 레코드에 담긴 Ethernet → IPv4/IPv6 → TCP/UDP/ICMP 헤더에서
//! 플로우 필드를 추출합니다. L4 헤더가 잘려 있어도 L3 필드는 유지합니다.

use std::net::IpAddr;

use crate::decoder::reader::Reader;
use crate::error::DecodeError;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const PROTO_ICMP: u8 = 1;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;
const PROTO_ICMPV6: u8 = 58;

/// 패킷 헤더에서 추출한 필드
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSummary {
    /// 출발지 주소
    pub src: Option<IpAddr>,
    /// 목적지 주소
    pub dst: Option<IpAddr>,
    /// 출발지 포트
    pub src_port: u16,
    /// 목적지 포트 (ICMP는 `type * 256 + code`)
    pub dst_port: u16,
    /// IP 프로토콜 번호
    pub protocol: u8,
    /// TCP 플래그
    pub tcp_flags: u8,
    /// ToS / Traffic Class
    pub tos: u8,
    /// 가장 바깥 VLAN ID
    pub vlan: Option<u16>,
}

impl PacketSummary {
    /// L3 주소가 추출되었는지 확인합니다.
    pub fn has_l3(&self) -> bool {
        self.src.is_some() && self.dst.is_some()
    }
}

/// Ethernet 프레임 헤더를 파싱합니다.
pub fn parse_ethernet(data: &[u8]) -> Result<PacketSummary, DecodeError> {
    let mut r = Reader::new(data);
    r.skip(12, "ethernet header")?;
    let mut ethertype = r.u16("ethernet header")?;
    let mut summary = PacketSummary::default();

    // 802.1Q / 802.1ad 태그는 최대 2개
    for _ in 0..2 {
        if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
            break;
        }
        let tci = r.u16("vlan tag")?;
        if summary.vlan.is_none() {
            summary.vlan = Some(tci & 0x0fff);
        }
        ethertype = r.u16("vlan tag")?;
    }

    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4_into(r.rest(), &mut summary)?,
        ETHERTYPE_IPV6 => parse_ipv6_into(r.rest(), &mut summary)?,
        _ => {}
    }
    Ok(summary)
}

/// IPv4 헤더부터 시작하는 데이터를 파싱합니다.
pub fn parse_ipv4(data: &[u8]) -> Result<PacketSummary, DecodeError> {
    let mut summary = PacketSummary::default();
    parse_ipv4_into(data, &mut summary)?;
    Ok(summary)
}

/// IPv6 헤더부터 시작하는 데이터를 파싱합니다.
pub fn parse_ipv6(data: &[u8]) -> Result<PacketSummary, DecodeError> {
    let mut summary = PacketSummary::default();
    parse_ipv6_into(data, &mut summary)?;
    Ok(summary)
}

fn parse_ipv4_into(data: &[u8], summary: &mut PacketSummary) -> Result<(), DecodeError> {
    let mut r = Reader::new(data);
    let version_ihl = r.u8("ipv4 header")?;
    if version_ihl >> 4 != 4 {
        return Err(DecodeError::Malformed("ipv4 version nibble"));
    }
    let header_len = usize::from(version_ihl & 0x0f) * 4;
    if header_len < 20 {
        return Err(DecodeError::Malformed("ipv4 header length"));
    }
    summary.tos = r.u8("ipv4 header")?;
    r.skip(4, "ipv4 header")?; // total length, identification
    let fragment = r.u16("ipv4 header")? & 0x1fff;
    r.skip(1, "ipv4 header")?; // ttl
    summary.protocol = r.u8("ipv4 header")?;
    r.skip(2, "ipv4 header")?; // checksum
    summary.src = Some(IpAddr::V4(r.ipv4("ipv4 header")?));
    summary.dst = Some(IpAddr::V4(r.ipv4("ipv4 header")?));

    // 후속 조각에는 L4 헤더가 없음
    if fragment != 0 {
        return Ok(());
    }
    let Ok(()) = r.skip(header_len - 20, "ipv4 options") else {
        return Ok(());
    };
    parse_transport(r.rest(), summary);
    Ok(())
}

fn parse_ipv6_into(data: &[u8], summary: &mut PacketSummary) -> Result<(), DecodeError> {
    const HOP_BY_HOP: u8 = 0;
    const ROUTING: u8 = 43;
    const FRAGMENT: u8 = 44;
    const DEST_OPTS: u8 = 60;
    const MAX_EXTENSIONS: usize = 8;

    let mut r = Reader::new(data);
    let first = r.u32("ipv6 header")?;
    if first >> 28 != 6 {
        return Err(DecodeError::Malformed("ipv6 version nibble"));
    }
    summary.tos = ((first >> 20) & 0xff) as u8;
    r.skip(2, "ipv6 header")?; // payload length
    let mut next = r.u8("ipv6 header")?;
    r.skip(1, "ipv6 header")?; // hop limit
    summary.src = Some(IpAddr::V6(r.ipv6("ipv6 header")?));
    summary.dst = Some(IpAddr::V6(r.ipv6("ipv6 header")?));

    for _ in 0..MAX_EXTENSIONS {
        match next {
            HOP_BY_HOP | ROUTING | DEST_OPTS => {
                let (Ok(n), Ok(len)) = (r.u8("ipv6 extension"), r.u8("ipv6 extension")) else {
                    summary.protocol = next;
                    return Ok(());
                };
                if r.skip(usize::from(len) * 8 + 6, "ipv6 extension").is_err() {
                    summary.protocol = n;
                    return Ok(());
                }
                next = n;
            }
            FRAGMENT => {
                let Ok(n) = r.u8("ipv6 fragment") else {
                    summary.protocol = next;
                    return Ok(());
                };
                summary.protocol = n;
                let (Ok(()), Ok(offset)) = (r.skip(1, "ipv6 fragment"), r.u16("ipv6 fragment"))
                else {
                    return Ok(());
                };
                if offset >> 3 != 0 || r.skip(4, "ipv6 fragment").is_err() {
                    return Ok(());
                }
                next = n;
            }
            _ => break,
        }
    }
    summary.protocol = next;
    parse_transport(r.rest(), summary);
    Ok(())
}

fn parse_transport(data: &[u8], summary: &mut PacketSummary) {
    let mut r = Reader::new(data);
    match summary.protocol {
        PROTO_TCP => {
            if let (Ok(src), Ok(dst)) = (r.u16("tcp header"), r.u16("tcp header")) {
                summary.src_port = src;
                summary.dst_port = dst;
            }
            if r.skip(9, "tcp header").is_ok() {
                summary.tcp_flags = r.u8("tcp header").unwrap_or(0);
            }
        }
        PROTO_UDP => {
            if let (Ok(src), Ok(dst)) = (r.u16("udp header"), r.u16("udp header")) {
                summary.src_port = src;
                summary.dst_port = dst;
            }
        }
        PROTO_ICMP | PROTO_ICMPV6 => {
            if let (Ok(kind), Ok(code)) = (r.u8("icmp header"), r.u8("icmp header")) {
                summary.dst_port = (u16::from(kind) << 8) | u16::from(code);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ipv4_header(protocol: u8, fragment: u16) -> Vec<u8> {
        let mut buf = vec![0x45, 0x10, 0, 40, 0, 1];
        buf.extend_from_slice(&fragment.to_be_bytes());
        buf.extend_from_slice(&[64, protocol, 0, 0]);
        buf.extend_from_slice(&[192, 168, 1, 10]);
        buf.extend_from_slice(&[10, 0, 0, 5]);
        buf
    }

    fn tcp_header() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&51000u16.to_be_bytes());
        buf.extend_from_slice(&443u16.to_be_bytes());
        buf.extend_from_slice(&[0; 8]);
        buf.push(0x50);
        buf.push(0x12); // SYN+ACK
        buf.extend_from_slice(&[0; 6]);
        buf
    }

    fn ethernet(ethertype: u16) -> Vec<u8> {
        let mut buf = vec![0xaa; 12];
        buf.extend_from_slice(&ethertype.to_be_bytes());
        buf
    }

    #[test]
    fn parses_ethernet_ipv4_tcp() {
        let mut frame = ethernet(ETHERTYPE_IPV4);
        frame.extend(ipv4_header(PROTO_TCP, 0));
        frame.extend(tcp_header());

        let s = parse_ethernet(&frame).unwrap();
        assert_eq!(s.src, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10))));
        assert_eq!(s.dst, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
        assert_eq!(s.src_port, 51000);
        assert_eq!(s.dst_port, 443);
        assert_eq!(s.protocol, PROTO_TCP);
        assert_eq!(s.tcp_flags, 0x12);
        assert_eq!(s.tos, 0x10);
        assert!(s.vlan.is_none());
    }

    #[test]
    fn parses_vlan_tag() {
        let mut frame = ethernet(ETHERTYPE_VLAN);
        frame.extend_from_slice(&0x2064u16.to_be_bytes()); // pcp 1, vid 100
        frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame.extend(ipv4_header(PROTO_UDP, 0));
        frame.extend_from_slice(&53u16.to_be_bytes());
        frame.extend_from_slice(&5353u16.to_be_bytes());

        let s = parse_ethernet(&frame).unwrap();
        assert_eq!(s.vlan, Some(100));
        assert_eq!(s.src_port, 53);
        assert_eq!(s.dst_port, 5353);
    }

    #[test]
    fn truncated_l4_keeps_l3() {
        let mut frame = ethernet(ETHERTYPE_IPV4);
        frame.extend(ipv4_header(PROTO_TCP, 0));
        frame.extend_from_slice(&[0xc7]);

        let s = parse_ethernet(&frame).unwrap();
        assert!(s.has_l3());
        assert_eq!(s.src_port, 0);
        assert_eq!(s.protocol, PROTO_TCP);
    }

    #[test]
    fn later_fragment_has_no_ports() {
        let mut packet = ipv4_header(PROTO_TCP, 0x00b9);
        packet.extend(tcp_header());
        let s = parse_ipv4(&packet).unwrap();
        assert!(s.has_l3());
        assert_eq!(s.src_port, 0);
    }

    #[test]
    fn icmp_type_code_in_dst_port() {
        let mut packet = ipv4_header(PROTO_ICMP, 0);
        packet.extend_from_slice(&[8, 0, 0, 0]);
        let s = parse_ipv4(&packet).unwrap();
        assert_eq!(s.dst_port, 8 << 8);
    }

    #[test]
    fn parses_ipv6_with_extension_header() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&0x6000_0000u32.to_be_bytes());
        packet.extend_from_slice(&[0, 32, 0, 64]); // payload len, next = hop-by-hop, hop limit
        packet.extend_from_slice(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets());
        packet.extend_from_slice(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2).octets());
        packet.extend_from_slice(&[PROTO_UDP, 0, 0, 0, 0, 0, 0, 0]);
        packet.extend_from_slice(&1000u16.to_be_bytes());
        packet.extend_from_slice(&2000u16.to_be_bytes());

        let s = parse_ipv6(&packet).unwrap();
        assert_eq!(s.protocol, PROTO_UDP);
        assert_eq!(s.src_port, 1000);
        assert_eq!(s.dst_port, 2000);
    }

    #[test]
    fn non_ip_ethertype_has_no_l3() {
        let frame = ethernet(0x0806);
        let s = parse_ethernet(&frame).unwrap();
        assert!(!s.has_l3());
    }

    #[test]
    fn short_frame_is_error() {
        assert!(parse_ethernet(&[0; 6]).is_err());
    }
}
