//! 사용자 플러그인 시스템 — 등록, 스테이징/확정 2단 테이블, 호출 진입점
//!
//! 룰 연산자(`PLUGIN` check, `append`, `modify`, `plugin`)가 참조하는
//! 사용자 함수를 프로세스 전역 [`PluginRegistry`]에서 이름으로 해석합니다.
//!
//! 플러그인은 먼저 스테이징 테이블에 등록되고, [`PluginRegistry::promote`]로
//! 확정 테이블에 승격된 뒤에만 룰셋 빌드에서 참조할 수 있습니다.
//! 스테이징 상태의 플러그인을 참조하는 룰셋 빌드는 별도 에러로 거부됩니다.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::PluginError;
use crate::event::Value;

// ─── 시그니처 메타데이터 ─────────────────────────────────────────────

/// 플러그인 인자 타입 (컴파일 시 best-effort 검증용)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// 정수
    Int,
    /// 부동소수
    Float,
    /// 불리언
    Bool,
    /// 문자열
    String,
    /// 제약 없음
    Any,
}

/// 플러그인 반환 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    /// 불리언 — check 연산자에서 사용 가능
    Bool,
    /// 임의 값 — append/modify에서 사용
    Any,
}

impl fmt::Display for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// 플러그인 파라미터 선언
#[derive(Debug, Clone)]
pub struct PluginParam {
    /// 파라미터 이름
    pub name: String,
    /// 기대 타입
    pub param_type: ParamType,
    /// 필수 여부
    pub required: bool,
}

/// 플러그인 시그니처
#[derive(Debug, Clone)]
pub struct PluginSpec {
    /// 레지스트리 내 고유 이름
    pub name: String,
    /// 파라미터 선언 목록
    pub params: Vec<PluginParam>,
    /// 반환 타입
    pub return_type: ReturnType,
}

// ─── 플러그인 본체 ───────────────────────────────────────────────────

/// bool 반환 플러그인 함수
pub type BoolFn = dyn Fn(&[Value]) -> Result<bool, PluginError> + Send + Sync;

/// 임의 값 반환 플러그인 함수
pub type AnyFn = dyn Fn(&[Value]) -> Result<Value, PluginError> + Send + Sync;

/// 반환 종류별 함수 포인터를 담는 합 타입
pub enum PluginFunc {
    /// bool 반환
    Bool(Arc<BoolFn>),
    /// 임의 값 반환
    Any(Arc<AnyFn>),
}

/// 등록된 플러그인 — 시그니처와 구현의 쌍
pub struct Plugin {
    spec: PluginSpec,
    func: PluginFunc,
}

impl Plugin {
    /// bool 반환 플러그인을 생성합니다.
    pub fn new_bool<F>(name: impl Into<String>, params: Vec<PluginParam>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<bool, PluginError> + Send + Sync + 'static,
    {
        Self {
            spec: PluginSpec {
                name: name.into(),
                params,
                return_type: ReturnType::Bool,
            },
            func: PluginFunc::Bool(Arc::new(f)),
        }
    }

    /// 임의 값 반환 플러그인을 생성합니다.
    pub fn new_any<F>(name: impl Into<String>, params: Vec<PluginParam>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, PluginError> + Send + Sync + 'static,
    {
        Self {
            spec: PluginSpec {
                name: name.into(),
                params,
                return_type: ReturnType::Any,
            },
            func: PluginFunc::Any(Arc::new(f)),
        }
    }

    /// 플러그인 시그니처를 반환합니다.
    pub fn spec(&self) -> &PluginSpec {
        &self.spec
    }

    /// bool 진입점 — bool 반환 플러그인만 호출 가능합니다.
    pub fn call_bool(&self, args: &[Value]) -> Result<bool, PluginError> {
        match &self.func {
            PluginFunc::Bool(f) => f(args),
            PluginFunc::Any(_) => Err(PluginError::ReturnShape {
                name: self.spec.name.clone(),
                expected: "bool",
                actual: "any",
            }),
        }
    }

    /// 임의 값 진입점 — 어느 플러그인이든 호출 가능합니다.
    ///
    /// bool 플러그인은 `Value::Bool`로 감싸 반환합니다.
    /// 두 번째 반환값은 호출 성공 여부(`ok`)입니다.
    pub fn call_any(&self, args: &[Value]) -> Result<(Value, bool), PluginError> {
        match &self.func {
            PluginFunc::Bool(f) => Ok((Value::Bool(f(args)?), true)),
            PluginFunc::Any(f) => Ok((f(args)?, true)),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.spec.name)
            .field("return_type", &self.spec.return_type)
            .finish()
    }
}

// ─── 레지스트리 ──────────────────────────────────────────────────────

/// 이름 조회 결과
#[derive(Debug, Clone)]
pub enum PluginLookup {
    /// 확정 테이블에 존재 — 룰셋에서 사용 가능
    Finalized(Arc<Plugin>),
    /// 스테이징 테이블에만 존재 — 아직 승격 전
    Staged,
    /// 어느 테이블에도 없음
    Missing,
}

/// 프로세스 전역 플러그인 레지스트리
///
/// 확정(finalized) 테이블과 스테이징(staging) 테이블을 분리 관리합니다.
/// 룰셋 컴파일러는 확정 테이블만 참조하며, 스테이징 상태의 이름을
/// 참조하면 "아직 승격되지 않음"을 뜻하는 별도 에러를 받습니다.
#[derive(Default)]
pub struct PluginRegistry {
    finalized: RwLock<HashMap<String, Arc<Plugin>>>,
    staging: RwLock<HashMap<String, Arc<Plugin>>>,
}

impl PluginRegistry {
    /// 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 플러그인을 스테이징 테이블에 등록합니다.
    ///
    /// 동일 이름이 확정 또는 스테이징 테이블에 이미 있으면 에러입니다.
    pub fn register_staged(&self, plugin: Plugin) -> Result<(), PluginError> {
        let name = plugin.spec.name.clone();
        if self.finalized.read().contains_key(&name) || self.staging.read().contains_key(&name) {
            return Err(PluginError::AlreadyRegistered { name });
        }
        self.staging.write().insert(name, Arc::new(plugin));
        Ok(())
    }

    /// 스테이징 플러그인 하나를 확정 테이블로 승격합니다.
    pub fn promote(&self, name: &str) -> Result<(), PluginError> {
        let plugin = self
            .staging
            .write()
            .remove(name)
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_owned(),
            })?;
        self.finalized.write().insert(name.to_owned(), plugin);
        Ok(())
    }

    /// 스테이징 테이블 전체를 확정 테이블로 승격합니다.
    pub fn promote_all(&self) {
        let mut staging = self.staging.write();
        let mut finalized = self.finalized.write();
        for (name, plugin) in staging.drain() {
            finalized.insert(name, plugin);
        }
    }

    /// 등록과 동시에 확정합니다 (테스트/부트스트랩 편의).
    pub fn register(&self, plugin: Plugin) -> Result<(), PluginError> {
        let name = plugin.spec.name.clone();
        if self.finalized.read().contains_key(&name) || self.staging.read().contains_key(&name) {
            return Err(PluginError::AlreadyRegistered { name });
        }
        self.finalized.write().insert(name, Arc::new(plugin));
        Ok(())
    }

    /// 확정 테이블에서 플러그인을 조회합니다.
    pub fn get(&self, name: &str) -> Option<Arc<Plugin>> {
        self.finalized.read().get(name).cloned()
    }

    /// 두 테이블을 함께 조회하여 상태를 구분합니다.
    pub fn lookup(&self, name: &str) -> PluginLookup {
        if let Some(plugin) = self.finalized.read().get(name) {
            return PluginLookup::Finalized(Arc::clone(plugin));
        }
        if self.staging.read().contains_key(name) {
            return PluginLookup::Staged;
        }
        PluginLookup::Missing
    }

    /// 확정된 플러그인 수를 반환합니다.
    pub fn count(&self) -> usize {
        self.finalized.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_plugin() -> Plugin {
        Plugin::new_bool("contains", vec![], |args| {
            let haystack = args.first().map(Value::projected).unwrap_or_default();
            let needle = args.get(1).map(Value::projected).unwrap_or_default();
            Ok(haystack.contains(&needle))
        })
    }

    #[test]
    fn call_bool_invokes_function() {
        let plugin = contains_plugin();
        let args = vec![Value::from("hello world"), Value::from("world")];
        assert!(plugin.call_bool(&args).unwrap());

        let args = vec![Value::from("hello"), Value::from("world")];
        assert!(!plugin.call_bool(&args).unwrap());
    }

    #[test]
    fn call_bool_on_any_plugin_is_shape_error() {
        let plugin = Plugin::new_any("upper", vec![], |args| {
            Ok(Value::from(
                args.first().map(Value::projected).unwrap_or_default().to_uppercase(),
            ))
        });
        let err = plugin.call_bool(&[]).unwrap_err();
        assert!(matches!(err, PluginError::ReturnShape { .. }));
    }

    #[test]
    fn call_any_wraps_bool_return() {
        let plugin = contains_plugin();
        let args = vec![Value::from("abc"), Value::from("b")];
        let (value, ok) = plugin.call_any(&args).unwrap();
        assert!(ok);
        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn staged_plugin_is_not_finalized() {
        let registry = PluginRegistry::new();
        registry.register_staged(contains_plugin()).unwrap();

        assert!(registry.get("contains").is_none());
        assert!(matches!(registry.lookup("contains"), PluginLookup::Staged));
    }

    #[test]
    fn promote_moves_to_finalized() {
        let registry = PluginRegistry::new();
        registry.register_staged(contains_plugin()).unwrap();
        registry.promote("contains").unwrap();

        assert!(registry.get("contains").is_some());
        assert!(matches!(
            registry.lookup("contains"),
            PluginLookup::Finalized(_)
        ));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn promote_unknown_fails() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.promote("ghost"),
            Err(PluginError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = PluginRegistry::new();
        registry.register(contains_plugin()).unwrap();
        assert!(matches!(
            registry.register(contains_plugin()),
            Err(PluginError::AlreadyRegistered { .. })
        ));
        assert!(matches!(
            registry.register_staged(contains_plugin()),
            Err(PluginError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn missing_lookup() {
        let registry = PluginRegistry::new();
        assert!(matches!(registry.lookup("nope"), PluginLookup::Missing));
    }

    #[test]
    fn promote_all_drains_staging() {
        let registry = PluginRegistry::new();
        registry.register_staged(contains_plugin()).unwrap();
        registry
            .register_staged(Plugin::new_any("ident", vec![], |args| {
                Ok(args.first().cloned().unwrap_or(Value::Null))
            }))
            .unwrap();

        registry.promote_all();
        assert_eq!(registry.count(), 2);
        assert!(matches!(registry.lookup("ident"), PluginLookup::Finalized(_)));
    }
}
