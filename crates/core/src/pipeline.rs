//! 파이프라인 노드 trait — DAG 노드 생명주기와 헬스 리포트
//!
//! 호스트의 데이터플로우 수퍼바이저는 입력 어댑터 → 룰셋 → 출력 어댑터의
//! DAG를 배선하고, 각 노드를 [`Pipeline`] trait으로 동일하게 기동/정지하고
//! 헬스를 수집합니다. trait 메서드가 [`BoxFuture`]를 반환하므로 별도의
//! 어댑터 없이 `Vec<Box<dyn Pipeline>>`으로 노드를 동적 관리할 수 있습니다.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// dyn-compatible Future 타입 별칭
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// DAG 노드 종류
///
/// 수퍼바이저가 배선을 검증할 때 사용합니다. 입력 노드의 다운스트림은
/// 룰셋이어야 하고, 출력 노드는 업스트림만 가집니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// 외부 소스에서 이벤트를 들여오는 입력 어댑터
    Input,
    /// 룰셋 런타임
    Ruleset,
    /// 이벤트를 외부로 내보내는 출력 어댑터
    Output,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Ruleset => write!(f, "ruleset"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// 노드 가용성 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// 정상 처리 중
    Up,
    /// 처리는 계속되지만 저하됨 (백로그 적체, 기동 중 등)
    Impaired,
    /// 처리 불가
    Down,
}

/// 노드 헬스 리포트
///
/// 상태와 원인에 더해, 큐를 가진 노드는 보고 시점의 백로그를 함께
/// 싣습니다. 수퍼바이저는 이 값으로 DAG 전체의 적체 지점을 찾습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// 가용성 상태
    pub state: NodeState,
    /// `Impaired`/`Down`의 원인
    pub reason: Option<String>,
    /// 보고 시점의 백로그 (큐가 없는 노드는 None)
    pub backlog: Option<usize>,
}

impl HealthReport {
    /// 정상 리포트를 만듭니다.
    pub fn up() -> Self {
        Self {
            state: NodeState::Up,
            reason: None,
            backlog: None,
        }
    }

    /// 저하 리포트를 만듭니다.
    pub fn impaired(reason: impl Into<String>) -> Self {
        Self {
            state: NodeState::Impaired,
            reason: Some(reason.into()),
            backlog: None,
        }
    }

    /// 처리 불가 리포트를 만듭니다.
    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            state: NodeState::Down,
            reason: Some(reason.into()),
            backlog: None,
        }
    }

    /// 백로그 관측치를 싣습니다.
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// 정상 상태인지 확인합니다.
    pub fn is_up(&self) -> bool {
        self.state == NodeState::Up
    }

    /// 처리 불가 상태인지 확인합니다.
    pub fn is_down(&self) -> bool {
        self.state == NodeState::Down
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            NodeState::Up => write!(f, "up")?,
            NodeState::Impaired => write!(f, "impaired")?,
            NodeState::Down => write!(f, "down")?,
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        if let Some(backlog) = self.backlog {
            write!(f, " (backlog {backlog})")?;
        }
        Ok(())
    }
}

/// 모든 DAG 노드가 구현하는 생명주기 trait
///
/// 메서드가 `BoxFuture`를 반환하므로 trait 자체가 dyn-compatible합니다.
/// 구현체는 보통 고유(inherent) async 메서드에 본체를 두고 여기서는
/// `Box::pin`으로 위임합니다.
pub trait Pipeline: Send + Sync {
    /// 노드 종류를 반환합니다.
    fn node_kind(&self) -> NodeKind;

    /// DAG 내 노드 식별자를 반환합니다.
    fn node_id(&self) -> &str;

    /// 노드를 시작합니다.
    ///
    /// 워커 스폰, 채널 연결, 캐시 오픈 등을 수행합니다.
    /// 이미 실행 중이면 `PipelineError::AlreadyRunning`을 반환합니다.
    fn start(&mut self) -> BoxFuture<'_, Result<(), HubError>>;

    /// 노드를 정지합니다.
    ///
    /// 잔여 이벤트를 드레인하고 리소스를 정리합니다.
    fn stop(&mut self) -> BoxFuture<'_, Result<(), HubError>>;

    /// 현재 헬스 리포트를 수집합니다.
    fn health(&self) -> BoxFuture<'_, HealthReport>;
}
