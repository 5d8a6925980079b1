//! 템플릿 관리자
//!
//! NetFlow v9 / IPFIX 템플릿을 익스포터별로 보관합니다.
//! (익스포터, 템플릿 ID)마다 `Unknown → Active → Expired` 상태를 가집니다.
//!
//! - 템플릿 수신 시 `Active`로 전이하고 마지막 사용 시각을 갱신
//! - 유휴 TTL을 넘기면 `Expired` (조회 시점 또는 주기 스윕)
//! - 테이블이 상한을 넘으면 `Expired` 우선, 그 다음 LRU 순으로 제거
//! - 알 수 없는 템플릿을 참조한 데이터 셋은 익스포터별 대기 버퍼에 보관하고,
//!   버퍼가 가득 차면 버리고 카운트 (수신 루프를 막지 않음)
//! - 전체 대기 데이터 셋 수가 상한을 넘으면 모든 익스포터 중 가장 오래된 것부터 버림
//! - 스윕 시 템플릿도 대기 데이터 셋도 없는 익스포터 엔트리는 제거
//!
//! 익스포터 단위로 샤딩된 `DashMap`을 사용하므로 다른 익스포터 간 경합이 없습니다.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use ironflow_core::metrics as m;
use ironflow_core::types::ExporterKey;
use tracing::{debug, info};

use crate::decoder::flowset::{TemplateDefinition, TimeBase};

/// 템플릿 도착을 기다리는 데이터 셋
#[derive(Debug, Clone)]
pub struct PendingSet {
    /// 참조된 템플릿 ID
    pub template_id: u16,
    /// 데이터 셋 본문 (셋 헤더 제외)
    pub body: Bytes,
    /// 원래 패킷의 시간 기준
    pub time: TimeBase,
    /// 수신 시각
    pub received_at: Instant,
}

/// 템플릿 조회 결과
#[derive(Debug, Clone)]
pub enum TemplateLookup {
    /// 사용 가능한 템플릿
    Active(Arc<TemplateDefinition>),
    /// 유휴 TTL을 넘긴 템플릿
    Expired,
    /// 한 번도 학습하지 않았거나 제거된 템플릿
    Unknown,
}

/// (익스포터, 템플릿 ID)의 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateState {
    /// 미학습
    Unknown,
    /// 사용 가능
    Active,
    /// 만료
    Expired,
}

/// 템플릿 미스 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// 대기 버퍼에 보관됨
    Buffered,
    /// 버퍼가 가득 차 버려짐
    Dropped,
}

#[derive(Debug)]
struct TemplateSlot {
    def: Arc<TemplateDefinition>,
    last_used: Instant,
    expired: bool,
}

#[derive(Debug, Default)]
struct ExporterTemplates {
    templates: HashMap<u16, TemplateSlot>,
    pending: VecDeque<PendingSet>,
}

/// 전체 대기 데이터 셋 기본 상한
pub const DEFAULT_MAX_PENDING_TOTAL: usize = 4096;

/// 템플릿 관리자
pub struct TemplateManager {
    exporters: DashMap<ExporterKey, ExporterTemplates>,
    ttl: Duration,
    max_templates: usize,
    pending_per_exporter: usize,
    max_pending: usize,
    total: AtomicUsize,
    pending_total: AtomicUsize,
    misses: AtomicU64,
    pending_dropped: AtomicU64,
    evicted: AtomicU64,
}

impl TemplateManager {
    /// 새 템플릿 관리자를 생성합니다.
    pub fn new(ttl: Duration, max_templates: usize, pending_per_exporter: usize) -> Self {
        Self {
            exporters: DashMap::new(),
            ttl,
            max_templates: max_templates.max(1),
            pending_per_exporter,
            max_pending: DEFAULT_MAX_PENDING_TOTAL,
            total: AtomicUsize::new(0),
            pending_total: AtomicUsize::new(0),
            misses: AtomicU64::new(0),
            pending_dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// 전체 대기 데이터 셋 상한을 설정합니다.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// 템플릿을 학습(또는 재정의)하고, 이 템플릿을 기다리던 데이터 셋을 반환합니다.
    ///
    /// 반환된 데이터 셋은 도착 순서를 유지합니다.
    pub fn learn(&self, def: TemplateDefinition, now: Instant) -> Vec<PendingSet> {
        let exporter = def.exporter;
        let template_id = def.template_id;
        let released = {
            let mut entry = self.exporters.entry(exporter).or_default();
            let slot = TemplateSlot {
                def: Arc::new(def),
                last_used: now,
                expired: false,
            };
            if entry.templates.insert(template_id, slot).is_none() {
                self.total.fetch_add(1, Ordering::Relaxed);
            }

            let mut released = Vec::new();
            if entry.pending.iter().any(|p| p.template_id == template_id) {
                let (matching, rest): (VecDeque<_>, VecDeque<_>) = entry
                    .pending
                    .drain(..)
                    .partition(|p| p.template_id == template_id);
                entry.pending = rest;
                released.extend(matching);
            }
            released
        };
        if !released.is_empty() {
            self.pending_total.fetch_sub(released.len(), Ordering::Relaxed);
        }

        metrics::counter!(m::TEMPLATE_LEARNED_TOTAL).increment(1);
        self.enforce_cap();
        metrics::gauge!(m::TEMPLATE_ACTIVE).set(self.len() as f64);
        released
    }

    /// 템플릿 하나를 철회합니다.
    pub fn withdraw(&self, exporter: &ExporterKey, template_id: u16) -> bool {
        let removed = self
            .exporters
            .get_mut(exporter)
            .and_then(|mut entry| entry.templates.remove(&template_id))
            .is_some();
        if removed {
            self.total.fetch_sub(1, Ordering::Relaxed);
            debug!(exporter = %exporter, template_id, "template withdrawn");
        }
        removed
    }

    /// 익스포터의 데이터(`options == false`) 또는 옵션 템플릿을 모두 철회합니다.
    pub fn withdraw_all(&self, exporter: &ExporterKey, options: bool) -> usize {
        let Some(mut entry) = self.exporters.get_mut(exporter) else {
            return 0;
        };
        let before = entry.templates.len();
        entry
            .templates
            .retain(|_, slot| slot.def.is_options() != options);
        let removed = before - entry.templates.len();
        drop(entry);

        if removed > 0 {
            self.total.fetch_sub(removed, Ordering::Relaxed);
            info!(exporter = %exporter, removed, options, "all templates withdrawn");
        }
        removed
    }

    /// 템플릿을 조회합니다. 활성 템플릿이면 마지막 사용 시각을 갱신합니다.
    pub fn lookup(&self, exporter: &ExporterKey, template_id: u16, now: Instant) -> TemplateLookup {
        let Some(mut entry) = self.exporters.get_mut(exporter) else {
            return TemplateLookup::Unknown;
        };
        let Some(slot) = entry.templates.get_mut(&template_id) else {
            return TemplateLookup::Unknown;
        };
        if slot.expired || now.saturating_duration_since(slot.last_used) > self.ttl {
            slot.expired = true;
            return TemplateLookup::Expired;
        }
        slot.last_used = now;
        TemplateLookup::Active(Arc::clone(&slot.def))
    }

    /// 상태를 조회합니다. 마지막 사용 시각은 바꾸지 않습니다.
    pub fn state(&self, exporter: &ExporterKey, template_id: u16, now: Instant) -> TemplateState {
        let Some(entry) = self.exporters.get(exporter) else {
            return TemplateState::Unknown;
        };
        match entry.templates.get(&template_id) {
            None => TemplateState::Unknown,
            Some(slot)
                if slot.expired || now.saturating_duration_since(slot.last_used) > self.ttl =>
            {
                TemplateState::Expired
            }
            Some(_) => TemplateState::Active,
        }
    }

    /// 템플릿 미스를 기록하고 데이터 셋을 보관하거나 버립니다.
    pub fn on_miss(&self, exporter: &ExporterKey, set: PendingSet) -> MissOutcome {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::TEMPLATE_MISSES_TOTAL).increment(1);

        if self.pending_per_exporter == 0 || self.max_pending == 0 {
            self.count_pending_dropped(1);
            return MissOutcome::Dropped;
        }
        {
            let mut entry = self.exporters.entry(*exporter).or_default();
            if entry.pending.len() >= self.pending_per_exporter {
                drop(entry);
                self.count_pending_dropped(1);
                return MissOutcome::Dropped;
            }
            entry.pending.push_back(set);
        }

        // 샤드 잠금을 놓은 뒤 전체 상한 적용
        let buffered = self.pending_total.fetch_add(1, Ordering::Relaxed) + 1;
        if buffered > self.max_pending {
            self.drop_oldest_pending();
        }
        MissOutcome::Buffered
    }

    /// 모든 익스포터 중 가장 먼저 도착한 대기 데이터 셋 하나를 버립니다.
    fn drop_oldest_pending(&self) {
        // 각 큐의 맨 앞이 그 익스포터에서 가장 오래된 셋
        let oldest = self
            .exporters
            .iter()
            .filter_map(|entry| entry.pending.front().map(|p| (p.received_at, *entry.key())))
            .min_by_key(|(received_at, _)| *received_at);
        let Some((_, exporter)) = oldest else {
            return;
        };
        let removed = self
            .exporters
            .get_mut(&exporter)
            .and_then(|mut entry| entry.pending.pop_front());
        if removed.is_some() {
            self.pending_total.fetch_sub(1, Ordering::Relaxed);
            self.count_pending_dropped(1);
            debug!(exporter = %exporter, "oldest pending set dropped at global limit");
        }
    }

    fn count_pending_dropped(&self, count: u64) {
        self.pending_dropped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(m::TEMPLATE_PENDING_DROPPED_TOTAL).increment(count);
    }

    /// 유휴 템플릿을 만료시키고 오래된 대기 데이터 셋을 버립니다.
    ///
    /// 템플릿도 대기 데이터 셋도 남지 않은 익스포터 엔트리는 제거합니다.
    /// 새로 만료된 템플릿 수를 반환합니다.
    pub fn expire_idle(&self, now: Instant) -> usize {
        let mut expired = 0;
        let mut stale = 0usize;
        let mut pruned = 0usize;
        self.exporters.retain(|_, entry| {
            for slot in entry.templates.values_mut() {
                if !slot.expired && now.saturating_duration_since(slot.last_used) > self.ttl {
                    slot.expired = true;
                    expired += 1;
                }
            }
            let before = entry.pending.len();
            entry
                .pending
                .retain(|p| now.saturating_duration_since(p.received_at) <= self.ttl);
            stale += before - entry.pending.len();

            let keep = !entry.templates.is_empty() || !entry.pending.is_empty();
            if !keep {
                pruned += 1;
            }
            keep
        });

        if stale > 0 {
            self.pending_total.fetch_sub(stale, Ordering::Relaxed);
            self.count_pending_dropped(stale as u64);
        }
        if expired > 0 {
            debug!(expired, "idle templates expired");
        }
        if pruned > 0 {
            debug!(pruned, "idle exporter entries removed");
        }
        metrics::gauge!(m::TEMPLATE_ACTIVE).set(self.len() as f64);
        expired
    }

    /// 상한을 넘는 동안 Expired 우선, 그 다음 LRU 순으로 제거합니다.
    fn enforce_cap(&self) {
        while self.total.load(Ordering::Relaxed) > self.max_templates {
            let Some((exporter, template_id)) = self.eviction_victim() else {
                break;
            };
            if self.withdraw(&exporter, template_id) {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::TEMPLATE_EVICTED_TOTAL).increment(1);
            }
        }
    }

    fn eviction_victim(&self) -> Option<(ExporterKey, u16)> {
        // (만료 아님, 마지막 사용 시각) 기준 최소값
        let mut victim: Option<((bool, Instant), ExporterKey, u16)> = None;
        for entry in self.exporters.iter() {
            for (id, slot) in &entry.templates {
                let rank = (!slot.expired, slot.last_used);
                if victim.as_ref().is_none_or(|(best, _, _)| rank < *best) {
                    victim = Some((rank, *entry.key(), *id));
                }
            }
        }
        victim.map(|(_, exporter, id)| (exporter, id))
    }

    /// 보관 중인 템플릿 수 (Active + Expired)
    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// 템플릿이 없는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 누적 템플릿 미스 수
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// 누적 대기 버퍼 드롭 수
    pub fn pending_dropped(&self) -> u64 {
        self.pending_dropped.load(Ordering::Relaxed)
    }

    /// 상한 초과로 제거된 템플릿 수
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// 전체 대기 데이터 셋 수
    pub fn pending_total(&self) -> usize {
        self.pending_total.load(Ordering::Relaxed)
    }

    /// 상태를 보관 중인 익스포터 수
    pub fn exporter_count(&self) -> usize {
        self.exporters.len()
    }

    /// 익스포터의 대기 데이터 셋 수
    pub fn pending_len(&self, exporter: &ExporterKey) -> usize {
        self.exporters
            .get(exporter)
            .map_or(0, |entry| entry.pending.len())
    }
}
