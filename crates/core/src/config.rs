//! 엔진 설정 — 캐시 용량, 채널/풀 크기, 드레인 예산

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 룰셋 엔진 설정
///
/// 설정 파일 로딩은 호스트 책임이며, 이 구조체는 런타임 값만 담습니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 컴파일된 정규식 LRU 캐시 용량 (프로세스 전역)
    pub regex_compiled_cache_size: usize,
    /// 정규식 매칭 결과 LRU 캐시 용량 (룰셋 인스턴스별)
    pub regex_result_cache_size: usize,
    /// 로컬 임계치 캐시 비용 예산 (바이트)
    pub local_cache_max_bytes: u64,
    /// 워커 풀 작업 큐 용량
    pub pool_queue_capacity: usize,
    /// 워커 풀 하한 재정의 (없으면 `max(4, cores/2)`)
    pub pool_floor: Option<usize>,
    /// 워커 풀 상한 재정의 (없으면 `max(8, cores*4)`)
    pub pool_ceiling: Option<usize>,
    /// 풀 스케일링 주기 (초)
    pub scale_interval_secs: u64,
    /// 정지 시 업스트림 드레인 예산 (초)
    pub upstream_drain_secs: u64,
    /// 정지 시 다운스트림 드레인 예산 (초)
    pub downstream_drain_secs: u64,
    /// 정지 시 워커 종료 대기 예산 (초)
    pub worker_drain_secs: u64,
    /// 테스트 모드 — 처리 카운터 증가와 샘플링을 생략합니다.
    pub test_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            regex_compiled_cache_size: 1_000,
            regex_result_cache_size: 1_000,
            local_cache_max_bytes: 16 * 1024 * 1024,
            pool_queue_capacity: 1_024,
            pool_floor: None,
            pool_ceiling: None,
            scale_interval_secs: 20,
            upstream_drain_secs: 10,
            downstream_drain_secs: 10,
            worker_drain_secs: 15,
            test_mode: false,
        }
    }
}

impl EngineConfig {
    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regex_compiled_cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "regex_compiled_cache_size".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.regex_result_cache_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "regex_result_cache_size".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.pool_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool_queue_capacity".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if self.scale_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scale_interval_secs".to_owned(),
                reason: "must be greater than 0".to_owned(),
            });
        }
        if let (Some(floor), Some(ceiling)) = (self.pool_floor, self.pool_ceiling) {
            if floor == 0 || ceiling < floor {
                return Err(ConfigError::InvalidValue {
                    field: "pool_floor/pool_ceiling".to_owned(),
                    reason: "floor must be > 0 and ceiling >= floor".to_owned(),
                });
            }
        }
        Ok(())
    }
}

/// 엔진 설정 빌더
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// 새 빌더를 생성합니다.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// 정규식 캐시 용량을 설정합니다 (컴파일/결과 공통).
    pub fn regex_cache_size(mut self, size: usize) -> Self {
        self.config.regex_compiled_cache_size = size;
        self.config.regex_result_cache_size = size;
        self
    }

    /// 로컬 임계치 캐시 비용 예산을 설정합니다.
    pub fn local_cache_max_bytes(mut self, bytes: u64) -> Self {
        self.config.local_cache_max_bytes = bytes;
        self
    }

    /// 워커 풀 작업 큐 용량을 설정합니다.
    pub fn pool_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_queue_capacity = capacity;
        self
    }

    /// 워커 풀 하한/상한을 설정합니다.
    pub fn pool_bounds(mut self, floor: usize, ceiling: usize) -> Self {
        self.config.pool_floor = Some(floor);
        self.config.pool_ceiling = Some(ceiling);
        self
    }

    /// 테스트 모드를 설정합니다.
    pub fn test_mode(mut self, on: bool) -> Self {
        self.config.test_mode = on;
        self
    }

    /// 설정을 검증하고 `EngineConfig`를 생성합니다.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
