#![no_main]

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use ironflow_pipeline::TemplateManager;
use ironflow_pipeline::decoder::netflow_v9;
use libfuzzer_sys::fuzz_target;

/// 같은 익스포터에서 온 연속된 데이터그램 (템플릿 상태가 이어짐)
fuzz_target!(|datagrams: Vec<Vec<u8>>| {
    let templates = TemplateManager::new(Duration::from_secs(60), 32, 4);
    let source = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9));
    let now = Instant::now();

    for data in datagrams.iter().take(8) {
        let _ = netflow_v9::decode(data, source, &templates, now);
    }
    assert!(templates.len() <= 32);
});
