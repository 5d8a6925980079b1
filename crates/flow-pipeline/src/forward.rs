//! 포워더 구독 허브
//!
//! 플러시된 배치를 구독자에게 전달합니다. 구독자는 프로토콜 집합과
//! 주소 범위로 필터를 지정하며, 조건에 맞는 레코드만 받습니다.
//!
//! 구독자 채널이 가득 차면 해당 전달은 버려지고 카운트됩니다.
//! 포워더 자체의 재시도/전송은 이 크레이트의 범위가 아닙니다.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ip_network::IpNetwork;
use ironflow_core::metrics as m;
use ironflow_core::types::{FlowBatch, FlowRecord, FlowVersion};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::FlowPipelineError;

/// 구독 필터
///
/// 비어있는 조건은 모두 허용합니다.
#[derive(Debug, Clone, Default)]
pub struct ForwardFilter {
    versions: Option<HashSet<FlowVersion>>,
    networks: Vec<IpNetwork>,
}

impl ForwardFilter {
    /// 모든 레코드를 허용하는 필터
    pub fn all() -> Self {
        Self::default()
    }

    /// 프로토콜 조건을 추가합니다.
    pub fn with_versions(mut self, versions: impl IntoIterator<Item = FlowVersion>) -> Self {
        self.versions = Some(versions.into_iter().collect());
        self
    }

    /// 주소 범위 조건을 추가합니다. 출발지 또는 목적지가 범위 안이면 허용합니다.
    pub fn with_networks(mut self, networks: impl IntoIterator<Item = IpNetwork>) -> Self {
        self.networks.extend(networks);
        self
    }

    /// CIDR 문자열로 주소 범위 조건을 추가합니다.
    pub fn with_cidrs<S: AsRef<str>>(
        self,
        cidrs: impl IntoIterator<Item = S>,
    ) -> Result<Self, FlowPipelineError> {
        let networks = cidrs
            .into_iter()
            .map(|cidr| {
                let cidr = cidr.as_ref();
                cidr.parse::<IpNetwork>()
                    .map_err(|e| FlowPipelineError::Config {
                        field: "forward.networks".to_owned(),
                        reason: format!("invalid cidr '{cidr}': {e}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_networks(networks))
    }

    /// 조건이 없는 필터인지 확인합니다.
    pub fn is_unfiltered(&self) -> bool {
        self.versions.is_none() && self.networks.is_empty()
    }

    /// 레코드가 조건에 맞는지 확인합니다.
    pub fn matches(&self, record: &FlowRecord) -> bool {
        if let Some(versions) = &self.versions
            && !versions.contains(&record.version)
        {
            return false;
        }
        if self.networks.is_empty() {
            return true;
        }
        [record.src_addr, record.dst_addr]
            .into_iter()
            .flatten()
            .any(|addr| self.contains(addr))
    }

    fn contains(&self, addr: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(addr))
    }
}

struct Subscriber {
    id: u64,
    filter: ForwardFilter,
    tx: mpsc::Sender<Arc<FlowBatch>>,
}

/// 포워더 구독 허브
pub struct ForwardHub {
    subscribers: RwLock<Vec<Subscriber>>,
    capacity: usize,
    next_id: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ForwardHub {
    /// 구독자 채널 용량을 지정해 허브를 생성합니다.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// 필터를 지정해 구독합니다. 수신기를 drop하면 구독이 해제됩니다.
    pub fn subscribe(&self, filter: ForwardFilter) -> mpsc::Receiver<Arc<FlowBatch>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write();
        subscribers.push(Subscriber { id, filter, tx });
        metrics::gauge!(m::FORWARD_SUBSCRIBERS).set(subscribers.len() as f64);
        debug!(subscriber = id, "forward subscriber added");
        rx
    }

    /// 배치를 구독자에게 전달하고 전달에 성공한 구독자 수를 반환합니다.
    pub fn publish(&self, batch: &Arc<FlowBatch>) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for subscriber in subscribers.iter() {
                let Some(delivery) = filtered(batch, &subscriber.filter) else {
                    continue;
                };
                match subscriber.tx.try_send(delivery) {
                    Ok(()) => sent += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(m::FORWARD_DROPPED_TOTAL).increment(1);
                        debug!(
                            subscriber = subscriber.id,
                            batch_id = %batch.id,
                            "forward subscriber full, delivery dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }
        if !closed.is_empty() {
            self.prune(&closed);
        }
        self.delivered.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    fn prune(&self, closed: &[u64]) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|s| !closed.contains(&s.id));
        metrics::gauge!(m::FORWARD_SUBSCRIBERS).set(subscribers.len() as f64);
        debug!(removed = closed.len(), "closed forward subscribers pruned");
    }

    /// 활성 구독자 수
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// 누적 전달 수
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// 채널 포화로 버려진 전달 수
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// 필터에 맞는 레코드만 담은 배치를 만듭니다. 맞는 레코드가 없으면 `None`.
fn filtered(batch: &Arc<FlowBatch>, filter: &ForwardFilter) -> Option<Arc<FlowBatch>> {
    if filter.is_unfiltered() {
        return Some(Arc::clone(batch));
    }
    let records: Vec<FlowRecord> = batch
        .records
        .iter()
        .filter(|r| filter.matches(r))
        .cloned()
        .collect();
    if records.is_empty() {
        return None;
    }
    if records.len() == batch.records.len() {
        return Some(Arc::clone(batch));
    }
    Some(Arc::new(FlowBatch {
        id: batch.id,
        exporter: batch.exporter,
        sequence: batch.sequence,
        records,
        created_at: batch.created_at,
        deadline: batch.deadline,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironflow_core::types::ExporterKey;
    use std::net::Ipv4Addr;
    use std::time::SystemTime;

    fn record(version: FlowVersion, src: [u8; 4], dst: [u8; 4]) -> FlowRecord {
        let exporter = ExporterKey::from_addr(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        let mut r = FlowRecord::new(version, exporter, 0);
        r.src_addr = Some(IpAddr::V4(Ipv4Addr::from(src)));
        r.dst_addr = Some(IpAddr::V4(Ipv4Addr::from(dst)));
        r.packets = 1;
        r
    }

    fn batch(records: Vec<FlowRecord>) -> Arc<FlowBatch> {
        let exporter = records[0].exporter;
        let now = SystemTime::now();
        Arc::new(FlowBatch::new(exporter, 0, records, now, now))
    }

    #[test]
    fn filter_by_version() {
        let filter = ForwardFilter::all().with_versions([FlowVersion::Ipfix]);
        assert!(filter.matches(&record(FlowVersion::Ipfix, [1, 1, 1, 1], [2, 2, 2, 2])));
        assert!(!filter.matches(&record(FlowVersion::NetflowV5, [1, 1, 1, 1], [2, 2, 2, 2])));
    }

    #[test]
    fn filter_by_network_matches_either_side() {
        let filter = ForwardFilter::all().with_cidrs(["10.0.0.0/8"]).unwrap();
        assert!(filter.matches(&record(FlowVersion::NetflowV5, [10, 1, 2, 3], [8, 8, 8, 8])));
        assert!(filter.matches(&record(FlowVersion::NetflowV5, [8, 8, 8, 8], [10, 9, 9, 9])));
        assert!(!filter.matches(&record(FlowVersion::NetflowV5, [8, 8, 8, 8], [1, 1, 1, 1])));
    }

    #[test]
    fn invalid_cidr_rejected() {
        assert!(ForwardFilter::all().with_cidrs(["10.0.0.0/99"]).is_err());
    }

    #[tokio::test]
    async fn subscriber_receives_only_matching_records() {
        let hub = ForwardHub::new(4);
        let mut all = hub.subscribe(ForwardFilter::all());
        let mut sflow = hub.subscribe(ForwardFilter::all().with_versions([FlowVersion::SflowV5]));

        let delivered = hub.publish(&batch(vec![
            record(FlowVersion::SflowV5, [1, 1, 1, 1], [2, 2, 2, 2]),
            record(FlowVersion::NetflowV5, [3, 3, 3, 3], [4, 4, 4, 4]),
        ]));
        assert_eq!(delivered, 2);
        assert_eq!(all.recv().await.unwrap().len(), 2);
        let got = sflow.recv().await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got.records[0].version, FlowVersion::SflowV5);
    }

    #[test]
    fn no_delivery_when_nothing_matches() {
        let hub = ForwardHub::new(4);
        let mut rx = hub.subscribe(ForwardFilter::all().with_versions([FlowVersion::Ipfix]));
        let delivered = hub.publish(&batch(vec![record(
            FlowVersion::NetflowV9,
            [1, 1, 1, 1],
            [2, 2, 2, 2],
        )]));
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_subscriber_drops_delivery() {
        let hub = ForwardHub::new(1);
        let _rx = hub.subscribe(ForwardFilter::all());
        let b = batch(vec![record(FlowVersion::NetflowV5, [1, 1, 1, 1], [2, 2, 2, 2])]);
        assert_eq!(hub.publish(&b), 1);
        assert_eq!(hub.publish(&b), 0);
        assert_eq!(hub.dropped(), 1);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let hub = ForwardHub::new(4);
        let rx = hub.subscribe(ForwardFilter::all());
        let _keep = hub.subscribe(ForwardFilter::all());
        drop(rx);
        hub.publish(&batch(vec![record(FlowVersion::NetflowV5, [1, 1, 1, 1], [2, 2, 2, 2])]));
        assert_eq!(hub.subscriber_count(), 1);
    }
}
