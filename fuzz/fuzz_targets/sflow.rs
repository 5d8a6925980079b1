#![no_main]

use std::net::{IpAddr, Ipv4Addr};

use ironflow_pipeline::decoder::sflow;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = sflow::decode(
        data,
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
        1_700_000_000_000,
    );
});
