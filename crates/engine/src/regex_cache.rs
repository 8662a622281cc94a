//! 정규식 2단 LRU 캐시
//!
//! - 컴파일 캐시: 패턴 문자열 → 컴파일된 정규식. 프로세스 내 모든 룰셋이
//!   공유합니다 ([`shared_compiled_cache`]).
//! - 결과 캐시: `(패턴 해시, 입력 문자열) → bool`. 룰셋 인스턴스별로
//!   소유하며, 패턴이 컴파일 타임 상수일 때만 사용합니다 (`_$` 전개로
//!   이벤트마다 바뀌는 패턴은 결과 캐시를 건너뜁니다).

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::RwLock;
use regex::Regex;
use xxhash_rust::xxh64::xxh64;

/// 기본 캐시 용량
pub const DEFAULT_CACHE_SIZE: usize = 1_000;

fn effective_capacity(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity)
        .or(NonZeroUsize::new(DEFAULT_CACHE_SIZE))
        .unwrap_or(NonZeroUsize::MIN)
}

/// 패턴 문자열 → 컴파일된 정규식 LRU 캐시 (thread-safe)
pub struct CompiledRegexCache {
    inner: RwLock<LruCache<String, Arc<Regex>>>,
}

impl CompiledRegexCache {
    /// 지정한 용량의 캐시를 생성합니다. 0은 기본 용량으로 올림합니다.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(effective_capacity(capacity))),
        }
    }

    /// 패턴을 캐시에서 찾거나 컴파일합니다.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        if let Some(compiled) = self.inner.write().get(pattern) {
            return Ok(Arc::clone(compiled));
        }
        let compiled = Arc::new(Regex::new(pattern)?);
        self.inner
            .write()
            .put(pattern.to_owned(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// 현재 캐시된 패턴 수를 반환합니다 (테스트용).
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// 캐시가 비었는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// 프로세스 전역 컴파일 캐시
pub fn shared_compiled_cache() -> &'static CompiledRegexCache {
    static CACHE: OnceLock<CompiledRegexCache> = OnceLock::new();
    CACHE.get_or_init(|| CompiledRegexCache::new(DEFAULT_CACHE_SIZE))
}

/// 패턴 식별자 -- 결과 캐시 키에 쓰이는 패턴 문자열의 xxh64 해시
pub fn pattern_id(pattern: &str) -> u64 {
    xxh64(pattern.as_bytes(), 0)
}

/// `(패턴 식별자, 입력) → bool` 결과 LRU 캐시 (룰셋 인스턴스 단위)
pub struct RegexResultCache {
    inner: RwLock<LruCache<(u64, String), bool>>,
}

impl RegexResultCache {
    /// 지정한 용량의 결과 캐시를 생성합니다. 0은 기본 용량으로 올림합니다.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(effective_capacity(capacity))),
        }
    }

    /// 캐시된 결과를 조회합니다.
    pub fn get(&self, pattern_id: u64, input: &str) -> Option<bool> {
        self.inner
            .write()
            .get(&(pattern_id, input.to_owned()))
            .copied()
    }

    /// 결과를 기록합니다.
    pub fn put(&self, pattern_id: u64, input: &str, matched: bool) {
        self.inner
            .write()
            .put((pattern_id, input.to_owned()), matched);
    }

    /// 캐시를 비웁니다 (룰셋 정지 시 호출).
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// 현재 엔트리 수를 반환합니다 (테스트용).
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// 캐시가 비었는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
