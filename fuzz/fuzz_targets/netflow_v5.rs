#![no_main]

use std::net::{IpAddr, Ipv4Addr};

use ironflow_pipeline::decoder::netflow_v5;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // 디코드 성공 시 레코드 수는 헤더의 count와 일치해야 함
    if let Ok(output) = netflow_v5::decode(data, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))) {
        let count = u16::from_be_bytes([data[2], data[3]]);
        assert_eq!(output.records.len(), usize::from(count));
    }
});
