//! 경계 검사 바이트 리더
//!
//! 모든 읽기 전에 남은 길이를 확인하고 부족하면 [`DecodeError::Truncated`]를
//! 반환합니다. 검사를 통과한 뒤에만 `bytes::Buf`로 읽으므로 패닉하지 않습니다.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Buf;

use crate::error::DecodeError;

/// 빅엔디언 바이트 리더
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// 슬라이스 위에 리더를 생성합니다.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// 남은 바이트 수
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// 시작 위치부터 읽은 바이트 수
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 읽을 데이터가 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize, what: &'static str) -> Result<(), DecodeError> {
        if self.buf.len() < needed {
            return Err(DecodeError::Truncated {
                what,
                needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    /// u8을 읽습니다.
    pub fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        self.ensure(1, what)?;
        self.offset += 1;
        Ok(self.buf.get_u8())
    }

    /// 빅엔디언 u16을 읽습니다.
    pub fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        self.ensure(2, what)?;
        self.offset += 2;
        Ok(self.buf.get_u16())
    }

    /// 빅엔디언 u32를 읽습니다.
    pub fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        self.ensure(4, what)?;
        self.offset += 4;
        Ok(self.buf.get_u32())
    }

    /// 빅엔디언 u64를 읽습니다.
    pub fn u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        self.ensure(8, what)?;
        self.offset += 8;
        Ok(self.buf.get_u64())
    }

    /// IPv4 주소를 읽습니다.
    pub fn ipv4(&mut self, what: &'static str) -> Result<Ipv4Addr, DecodeError> {
        Ok(Ipv4Addr::from(self.u32(what)?))
    }

    /// IPv6 주소를 읽습니다.
    pub fn ipv6(&mut self, what: &'static str) -> Result<Ipv6Addr, DecodeError> {
        self.ensure(16, what)?;
        self.offset += 16;
        Ok(Ipv6Addr::from(self.buf.get_u128()))
    }

    /// `n` 바이트를 잘라 반환합니다.
    pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        self.ensure(n, what)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        self.offset += n;
        Ok(head)
    }

    /// `n` 바이트를 건너뜁니다.
    pub fn skip(&mut self, n: usize, what: &'static str) -> Result<(), DecodeError> {
        self.take(n, what).map(|_| ())
    }

    /// `n` 바이트 범위의 하위 리더를 만들고 그만큼 전진합니다.
    pub fn sub_reader(&mut self, n: usize, what: &'static str) -> Result<Reader<'a>, DecodeError> {
        self.take(n, what).map(Reader::new)
    }

    /// 남은 바이트 전체
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }
}

/// 1~8 바이트 빅엔디언 정수를 u64로 읽습니다. 8바이트를 넘으면 하위 8바이트를 사용합니다.
pub fn be_uint(bytes: &[u8]) -> u64 {
    let start = bytes.len().saturating_sub(8);
    bytes[start..]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_values() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut r = Reader::new(&data);
        assert_eq!(r.u8("a").unwrap(), 0x01);
        assert_eq!(r.u16("b").unwrap(), 0x0203);
        assert_eq!(r.u32("c").unwrap(), 0x04050607);
        assert!(r.is_empty());
        assert_eq!(r.offset(), 7);
    }

    #[test]
    fn short_read_reports_truncation() {
        let data = [0x01, 0x02];
        let mut r = Reader::new(&data);
        let err = r.u32("field").unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                what: "field",
                needed: 4,
                available: 2
            }
        );
        // 실패한 읽기는 위치를 바꾸지 않음
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn sub_reader_is_bounded() {
        let data = [1, 2, 3, 4, 5, 6];
        let mut r = Reader::new(&data);
        let mut sub = r.sub_reader(2, "sub").unwrap();
        assert_eq!(sub.u16("x").unwrap(), 0x0102);
        assert!(sub.u8("y").is_err());
        assert_eq!(r.remaining(), 4);
    }

    #[test]
    fn reads_addresses() {
        let mut data = vec![192, 168, 0, 1];
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        let mut r = Reader::new(&data);
        assert_eq!(r.ipv4("v4").unwrap(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(r.ipv6("v6").unwrap(), Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn be_uint_handles_widths() {
        assert_eq!(be_uint(&[]), 0);
        assert_eq!(be_uint(&[0x12]), 0x12);
        assert_eq!(be_uint(&[0x01, 0x00, 0x00]), 0x010000);
        assert_eq!(be_uint(&[0xff; 10]), u64::MAX);
    }
}
