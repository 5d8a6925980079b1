#![no_main]

use ironflow_pipeline::decoder::packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = packet::parse_ethernet(data);
    let _ = packet::parse_ipv4(data);
    let _ = packet::parse_ipv6(data);
});
