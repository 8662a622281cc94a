//! 윈도우 임계치 집계 -- 2계층 keyed 카운터 스토어
//!
//! 세 가지 집계 모드(COUNT/SUM/CLASSIFY)가 하나의 백엔드 계약
//! ([`ThresholdBackend`])을 공유합니다:
//!
//! - [`LocalThresholdStore`]: 프로세스 내 TinyLFU TTL 캐시 (moka).
//!   비용 예산으로 바운드되며, 룰셋 단위 배타 구간으로 선형화된
//!   카운팅을 보장합니다.
//! - [`SharedThresholdStore`]: 분산 키 스토어([`CounterStore`]) 어댑터.
//!   여러 엔진 프로세스가 같은 카운터를 공유합니다.
//!
//! 발화는 "임계값을 넘는 순간 한 번"입니다 -- 발화 후 키가 삭제되어
//! 다음 해당 이벤트부터 새 윈도우가 시작됩니다. CLASSIFY의 집합은
//! `2 × range` TTL, 개별 항목은 `range` TTL을 씁니다.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;
use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

use rulehub_core::pipeline::BoxFuture;
use rulehub_core::store::CounterStore;

use crate::error::EngineError;
use crate::ruleset::CountType;

// ─── 그룹 키 유도 ────────────────────────────────────────────────────

/// 이벤트에서 유도된 임계치 그룹 키를 만듭니다.
///
/// `ruleset_id ∥ rule_id` 접두어와 각 `group_by` 필드 값의 문자열 투영을
/// 이어 붙인 뒤 xxh64로 해시합니다. 접두어 `F_`/`FS_`/`FC_`가 집계
/// 모드를 구분합니다.
pub fn group_key(count_type: CountType, group_prefix: &str, group_values: &[String]) -> String {
    let mut joined = String::with_capacity(
        group_prefix.len() + group_values.iter().map(String::len).sum::<usize>(),
    );
    joined.push_str(group_prefix);
    for value in group_values {
        joined.push_str(value);
    }
    let hash = xxh64(joined.as_bytes(), 0);
    match count_type {
        CountType::Count => format!("F_{hash}"),
        CountType::Sum => format!("FS_{hash}"),
        CountType::Classify => format!("FC_{hash}"),
    }
}

/// CLASSIFY 모드의 개별 항목 키 (`그룹키_항목해시`)
pub fn classify_item_key(group_key: &str, item: &str) -> String {
    format!("{group_key}_{}", xxh64(item.as_bytes(), 0))
}

// ─── 백엔드 계약 ─────────────────────────────────────────────────────

/// 임계치 백엔드 능력 인터페이스
///
/// 룰의 `local_cache` 플래그에 따라 구현이 선택됩니다.
pub trait ThresholdBackend: Send + Sync {
    /// 카운터를 `delta`만큼 증가시킵니다.
    ///
    /// 키가 없으면 `delta`로 생성하고 TTL을 `window_secs`로 둡니다 (미발화).
    /// 있으면 증가시키고, 새 값이 `threshold`를 **초과**하면 키를 삭제하고
    /// 발화를 보고합니다.
    fn freq_add<'a>(
        &'a self,
        key: &'a str,
        delta: i64,
        window_secs: u64,
        threshold: i64,
    ) -> BoxFuture<'a, Result<bool, EngineError>>;

    /// `group_key` 아래에서 관찰된 고유 항목 집합에 `item_key`를 더합니다.
    ///
    /// 고유 항목 수가 `threshold`를 **초과**하면 추적 중인 항목과 집합을
    /// 모두 삭제하고 발화를 보고합니다.
    fn classify_add<'a>(
        &'a self,
        item_key: &'a str,
        group_key: &'a str,
        window_secs: u64,
        threshold: i64,
    ) -> BoxFuture<'a, Result<bool, EngineError>>;
}

// ─── 로컬 백엔드 ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CounterEntry {
    value: i64,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct SetEntry {
    items: HashSet<String>,
    ttl: Duration,
}

#[derive(Debug, Clone)]
struct ItemEntry {
    ttl: Duration,
}

/// 엔트리가 자신의 TTL을 들고 다니는 만료 정책.
/// 갱신은 남은 수명을 보존합니다 (윈도우는 첫 이벤트 기준).
struct EntryTtl;

impl Expiry<String, CounterEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CounterEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

impl Expiry<String, SetEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &SetEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

impl Expiry<String, ItemEntry> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &ItemEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// 프로세스 내 윈도우 카운터/분류 캐시
///
/// 룰셋이 시작할 때 생성되고 정지할 때 비워집니다. 쓰기는 moka의
/// 비동기 유지 작업을 쓰므로, 같은 프로세스의 후속 읽기에 보이도록
/// 변이 직후 `run_pending_tasks()` 배리어를 겁니다. `freq_add`의
/// 선형화는 스토어 단위 배타 구간으로 보장합니다.
pub struct LocalThresholdStore {
    counters: Cache<String, CounterEntry>,
    sets: Cache<String, SetEntry>,
    items: Cache<String, ItemEntry>,
    lock: Mutex<()>,
}

impl LocalThresholdStore {
    /// 총 비용 예산(바이트)으로 스토어를 생성합니다.
    pub fn new(max_bytes: u64) -> Self {
        // 카운터와 분류(집합+항목)에 예산을 반씩 배정합니다.
        let counter_budget = max_bytes / 2;
        let classify_budget = max_bytes / 4;

        let counters = Cache::builder()
            .max_capacity(counter_budget)
            .weigher(|key: &String, _: &CounterEntry| (key.len() + 24) as u32)
            .expire_after(EntryTtl)
            .build();
        let sets = Cache::builder()
            .max_capacity(classify_budget)
            .weigher(|key: &String, value: &SetEntry| {
                let items: usize = value.items.iter().map(|i| i.len() + 16).sum();
                (key.len() + items + 24) as u32
            })
            .expire_after(EntryTtl)
            .build();
        let items = Cache::builder()
            .max_capacity(classify_budget)
            .weigher(|key: &String, _: &ItemEntry| (key.len() + 16) as u32)
            .expire_after(EntryTtl)
            .build();

        Self {
            counters,
            sets,
            items,
            lock: Mutex::new(()),
        }
    }

    /// 모든 엔트리를 비웁니다 (룰셋 정지 시).
    pub fn clear(&self) {
        self.counters.invalidate_all();
        self.sets.invalidate_all();
        self.items.invalidate_all();
        self.barrier();
    }

    /// 쓰기 배리어 -- 보류된 유지 작업을 처리해 이후 읽기에 일관성을 줍니다.
    fn barrier(&self) {
        self.counters.run_pending_tasks();
        self.sets.run_pending_tasks();
        self.items.run_pending_tasks();
    }

    fn freq_add_sync(&self, key: &str, delta: i64, window_secs: u64, threshold: i64) -> bool {
        let _guard = self.lock.lock();
        let window = Duration::from_secs(window_secs);

        let fired = match self.counters.get(key) {
            None => {
                self.counters.insert(
                    key.to_owned(),
                    CounterEntry {
                        value: delta,
                        ttl: window,
                    },
                );
                false
            }
            Some(entry) => {
                let next = entry.value + delta;
                if next > threshold {
                    self.counters.invalidate(key);
                    true
                } else {
                    self.counters.insert(
                        key.to_owned(),
                        CounterEntry {
                            value: next,
                            ttl: window,
                        },
                    );
                    false
                }
            }
        };
        self.barrier();
        fired
    }

    fn classify_add_sync(
        &self,
        item_key: &str,
        group_key: &str,
        window_secs: u64,
        threshold: i64,
    ) -> bool {
        let _guard = self.lock.lock();
        let window = Duration::from_secs(window_secs);

        if self.items.get(item_key).is_some() {
            // 이 윈도우에서 이미 관찰한 항목 -- 고유값 수는 변하지 않습니다.
            return false;
        }
        self.items.insert(item_key.to_owned(), ItemEntry { ttl: window });

        let mut members = self
            .sets
            .get(group_key)
            .map(|entry| entry.items)
            .unwrap_or_default();
        members.insert(item_key.to_owned());
        // 집합은 항목보다 오래 살 수 있으므로, 만료된 항목을 걷어내고 셉니다.
        members.retain(|member| self.items.get(member).is_some());

        let fired = members.len() as i64 > threshold;
        if fired {
            for member in &members {
                self.items.invalidate(member);
            }
            self.sets.invalidate(group_key);
        } else {
            self.sets.insert(
                group_key.to_owned(),
                SetEntry {
                    items: members,
                    ttl: 2 * window,
                },
            );
        }
        self.barrier();
        fired
    }
}

impl ThresholdBackend for LocalThresholdStore {
    fn freq_add<'a>(
        &'a self,
        key: &'a str,
        delta: i64,
        window_secs: u64,
        threshold: i64,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        Box::pin(async move { Ok(self.freq_add_sync(key, delta, window_secs, threshold)) })
    }

    fn classify_add<'a>(
        &'a self,
        item_key: &'a str,
        group_key: &'a str,
        window_secs: u64,
        threshold: i64,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        Box::pin(async move {
            Ok(self.classify_add_sync(item_key, group_key, window_secs, threshold))
        })
    }
}

// ─── 공유 백엔드 ─────────────────────────────────────────────────────

/// 분산 키 스토어를 임계치 백엔드로 어댑트합니다.
///
/// CLASSIFY의 "집합"은 접두어 스캔과 항목별 키로 모델링합니다.
/// 집합 추정치 키는 `2 × range` TTL로 유지되고, 검증 시점마다 살아있는
/// 항목 키를 다시 세어 만료된 항목을 추정치에서 제외합니다.
pub struct SharedThresholdStore {
    store: Arc<dyn CounterStore>,
}

impl SharedThresholdStore {
    /// 공유 스토어 어댑터를 생성합니다.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }
}

fn backend_err(group: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Backend {
        group: group.to_owned(),
        reason: err.to_string(),
    }
}

impl ThresholdBackend for SharedThresholdStore {
    fn freq_add<'a>(
        &'a self,
        key: &'a str,
        delta: i64,
        window_secs: u64,
        threshold: i64,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        Box::pin(async move {
            let created = self
                .store
                .set_if_absent(key, delta, window_secs)
                .await
                .map_err(|e| backend_err(key, e))?;
            if created {
                return Ok(false);
            }
            let value = self
                .store
                .incr_by(key, delta)
                .await
                .map_err(|e| backend_err(key, e))?;
            if value > threshold {
                self.store.del(key).await.map_err(|e| backend_err(key, e))?;
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn classify_add<'a>(
        &'a self,
        item_key: &'a str,
        group_key: &'a str,
        window_secs: u64,
        threshold: i64,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        Box::pin(async move {
            let created = self
                .store
                .set_if_absent(item_key, 1, window_secs)
                .await
                .map_err(|e| backend_err(group_key, e))?;
            if !created {
                return Ok(false);
            }

            // 살아있는 항목 키만 스캔되므로 만료 항목은 자연히 제외됩니다.
            let prefix = format!("{group_key}_");
            let live = self
                .store
                .keys_matching(&prefix)
                .await
                .map_err(|e| backend_err(group_key, e))?;
            let cardinality = live.len() as i64;

            self.store
                .set(group_key, cardinality, 2 * window_secs)
                .await
                .map_err(|e| backend_err(group_key, e))?;

            if cardinality > threshold {
                for key in &live {
                    self.store.del(key).await.map_err(|e| backend_err(group_key, e))?;
                }
                self.store
                    .del(group_key)
                    .await
                    .map_err(|e| backend_err(group_key, e))?;
                return Ok(true);
            }
            Ok(false)
        })
    }
}
