//! 에러 타입 — 도메인별 에러 정의

/// Rulehub 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 파이프라인 생명주기/채널 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// 플러그인 레지스트리/호출 에러
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// 공유 카운터 스토어 에러
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// 필요한 백엔드가 구성되지 않음 (예: 공유 임계치에 카운터 스토어 부재)
    #[error("missing backend: {reason}")]
    MissingBackend { reason: String },
}

/// 파이프라인 생명주기/채널 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 이미 실행 중인 모듈을 다시 시작
    #[error("already running")]
    AlreadyRunning,

    /// 실행 중이 아닌 모듈을 정지
    #[error("not running")]
    NotRunning,

    /// 채널 전송 실패
    #[error("channel send failed: {0}")]
    ChannelSend(String),

    /// 채널 수신 실패
    #[error("channel receive failed: {0}")]
    ChannelRecv(String),

    /// 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),

    /// 정지 시 드레인 예산 초과
    #[error("stop exceeded {phase} drain budget of {budget_secs}s")]
    StopTimeout { phase: String, budget_secs: u64 },
}

/// 플러그인 레지스트리/호출 에러
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// 레지스트리에 없는 플러그인
    #[error("plugin not found: {name}")]
    NotFound { name: String },

    /// 스테이징 테이블에만 존재 (아직 확정 안 됨)
    #[error("plugin not promoted from staging: {name}")]
    NotPromoted { name: String },

    /// 동일 이름 플러그인 중복 등록
    #[error("plugin already registered: {name}")]
    AlreadyRegistered { name: String },

    /// 플러그인 호출 실패
    #[error("plugin '{name}' invocation failed: {reason}")]
    Invocation { name: String, reason: String },

    /// 반환 형태 불일치 (예: map 기대, bool 반환)
    #[error("plugin '{name}' returned {actual}, expected {expected}")]
    ReturnShape {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
}

/// 공유 카운터 스토어 에러
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// 연결 실패
    #[error("store connection failed: {0}")]
    Connection(String),

    /// 개별 연산 실패
    #[error("store {op} failed for key '{key}': {reason}")]
    Operation {
        op: &'static str,
        key: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_errors_convert_to_hub_error() {
        let err: HubError = PipelineError::AlreadyRunning.into();
        assert!(matches!(err, HubError::Pipeline(_)));
        assert_eq!(err.to_string(), "pipeline error: already running");
    }

    #[test]
    fn plugin_error_display() {
        let err = PluginError::NotPromoted {
            name: "geoip".to_owned(),
        };
        assert_eq!(err.to_string(), "plugin not promoted from staging: geoip");
    }

    #[test]
    fn store_operation_error_display() {
        let err = StoreError::Operation {
            op: "incr_by",
            key: "F_123".to_owned(),
            reason: "timeout".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("incr_by"));
        assert!(msg.contains("F_123"));
        assert!(msg.contains("timeout"));
    }

    #[test]
    fn stop_timeout_display_includes_phase() {
        let err = PipelineError::StopTimeout {
            phase: "upstream".to_owned(),
            budget_secs: 10,
        };
        assert!(err.to_string().contains("upstream"));
        assert!(err.to_string().contains("10"));
    }
}
