#![no_main]

use std::net::{IpAddr, Ipv6Addr};
use std::time::{Duration, Instant};

use ironflow_pipeline::TemplateManager;
use ironflow_pipeline::decoder::ipfix;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|datagrams: Vec<Vec<u8>>| {
    let templates = TemplateManager::new(Duration::from_secs(60), 32, 4);
    let source = IpAddr::V6(Ipv6Addr::LOCALHOST);
    let start = Instant::now();

    for (i, data) in datagrams.iter().take(8).enumerate() {
        // 만료 경로도 함께 실행
        let now = start + Duration::from_secs(20 * i as u64);
        let _ = ipfix::decode(data, source, &templates, now);
        templates.expire_idle(now);
    }
    assert!(templates.len() <= 32);
});
