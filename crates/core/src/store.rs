//! 공유 카운터 스토어 계약 — 분산 keyed set/incr/del (TTL 포함)
//!
//! 여러 엔진 프로세스가 임계치 카운터를 공유할 때 사용하는 좁은
//! 인터페이스입니다. 실제 구현(Redis 등)은 호스트가 주입하며,
//! 이 크레이트는 계약과 단일 프로세스용 인메모리 구현만 제공합니다.
//!
//! 키 패턴 스캔([`CounterStore::keys_matching`])은 coarse해도 되며,
//! 엔진은 classify 카운팅에서의 false negative를 허용합니다.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::pipeline::BoxFuture;

/// 공유 카운터 스토어 계약
///
/// 모든 연산은 네트워크 I/O일 수 있으므로 비동기입니다.
pub trait CounterStore: Send + Sync {
    /// 키가 없을 때만 값을 설정합니다 (TTL 포함). 생성 여부를 반환합니다.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: i64,
        ttl_secs: u64,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// 키 값을 delta만큼 원자적으로 증가시키고 새 값을 반환합니다.
    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>>;

    /// 키를 삭제합니다. 없는 키 삭제는 성공으로 처리합니다.
    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// 접두어로 시작하는 살아있는 키 목록을 반환합니다.
    fn keys_matching<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, StoreError>>;

    /// 키 값을 무조건 설정합니다 (TTL 포함).
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: i64,
        ttl_secs: u64,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

// ─── 인메모리 구현 ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: i64,
    expires_at: Instant,
}

/// 단일 프로세스용 인메모리 카운터 스토어
///
/// 엔진 테스트와 공유 백엔드 없는 소규모 배포에서 사용합니다.
/// TTL은 실제 시간 기준이며, 만료된 키는 접근 시점에 제거됩니다.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCounterStore {
    /// 빈 스토어를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(entries: &mut HashMap<String, MemoryEntry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
    }

    /// 현재 살아있는 키 수를 반환합니다 (테스트용).
    pub fn live_len(&self) -> usize {
        let mut entries = self.entries.lock();
        Self::prune(&mut entries);
        entries.len()
    }
}

impl CounterStore for MemoryCounterStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: i64,
        ttl_secs: u64,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let mut entries = self.entries.lock();
            Self::prune(&mut entries);
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_owned(),
                MemoryEntry {
                    value,
                    expires_at: Instant::now() + Duration::from_secs(ttl_secs),
                },
            );
            Ok(true)
        })
    }

    fn incr_by<'a>(&'a self, key: &'a str, delta: i64) -> BoxFuture<'a, Result<i64, StoreError>> {
        Box::pin(async move {
            let mut entries = self.entries.lock();
            Self::prune(&mut entries);
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.value += delta;
                    Ok(entry.value)
                }
                None => {
                    // 만료 직후 increment가 도착한 경우: 키를 새로 만들되
                    // TTL 없는 잔존을 막기 위해 짧은 기본 수명을 부여합니다.
                    entries.insert(
                        key.to_owned(),
                        MemoryEntry {
                            value: delta,
                            expires_at: Instant::now() + Duration::from_secs(60),
                        },
                    );
                    Ok(delta)
                }
            }
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.lock().remove(key);
            Ok(())
        })
    }

    fn keys_matching<'a>(
        &'a self,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>, StoreError>> {
        Box::pin(async move {
            let mut entries = self.entries.lock();
            Self::prune(&mut entries);
            Ok(entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: i64,
        ttl_secs: u64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.lock().insert(
                key.to_owned(),
                MemoryEntry {
                    value,
                    expires_at: Instant::now() + Duration::from_secs(ttl_secs),
                },
            );
            Ok(())
        })
    }
}
