//! 룰셋 컴파일러 -- 소스 AST를 실행 가능한 표현으로 변환
//!
//! 룰마다 작성 순서 그대로의 연산자 큐 `(종류, ID)`와 종류별 사이드
//! 테이블을 만듭니다. 필드 경로, 정규식, 조건식, 임계치 그룹 접두어,
//! 윈도우 초는 모두 여기서 한 번만 파싱/컴파일됩니다.
//!
//! 체크리스트 내부의 check들은 평가 비용 계층(ISNULL/NOTNULL →
//! 문자열/숫자 → REGEX → PLUGIN)으로 재배열됩니다. 체크리스트 결합자는
//! 가환이므로 관찰 가능한 의미는 변하지 않습니다. 룰 큐 자체의 순서는
//! 작성자 제어이며 절대 재배열하지 않습니다.

pub mod source;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;

use rulehub_core::event::{ORIDATA, RESERVED_PREFIX, Value};
use rulehub_core::plugin::{ParamType, Plugin, PluginLookup, PluginRegistry, ReturnType};

use crate::check::{BaseCheck, CheckKind, Logic};
use crate::error::EngineError;
use crate::expr::Condition;
use crate::field::{FieldPath, Template};
use crate::regex_cache;
use self::source::{
    SourceCheck, SourceChecklist, SourceIterator, SourceOp, SourceRule, SourceThreshold,
    parse_source,
};

// ─── 컴파일된 타입 ───────────────────────────────────────────────────

/// 룰셋 동작 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 매칭된 룰마다 주석 달린 이벤트 사본을 방출
    Detection,
    /// 어느 룰이든 매칭되면 이벤트를 드롭, 아니면 통과
    Exclude,
}

impl Mode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "DETECTION" => Some(Self::Detection),
            "EXCLUDE" => Some(Self::Exclude),
            _ => None,
        }
    }

    /// 메트릭 레이블용 문자열
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Exclude => "exclude",
        }
    }
}

/// 연산자 종류 -- 큐 디스패치 태그
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Check,
    Checklist,
    Threshold,
    Iterator,
    Append,
    Modify,
    Del,
    Plugin,
}

/// 룰 내 연산자 식별자 (사이드 테이블 인덱스)
pub type OperatorId = u32;

/// 임계치 집계 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountType {
    /// 이벤트 수
    Count,
    /// `count_field` 값의 누적 합
    Sum,
    /// `count_field` 고유값 개수
    Classify,
}

/// 컴파일 타임 상수 패턴의 정규식 핸들
#[derive(Debug, Clone)]
pub struct StaticRegex {
    /// 컴파일된 정규식
    pub regex: Arc<Regex>,
    /// 결과 캐시 키에 쓰이는 패턴 식별자
    pub id: u64,
}

/// 플러그인 호출 인자
#[derive(Debug, Clone)]
pub enum PluginArg {
    /// 룰 텍스트에서 파싱된 리터럴 (int/float/bool/따옴표 문자열)
    Literal(Value),
    /// 호출 시점에 이벤트에서 해석되는 필드 참조
    FieldRef(FieldPath),
    /// 현재 이벤트 문서 전체의 깊은 복사
    OriData,
}

/// 컴파일된 플러그인 호출
#[derive(Clone)]
pub struct PluginCall {
    /// 플러그인 이름
    pub name: String,
    /// 인자 목록
    pub args: Vec<PluginArg>,
    /// 확정 테이블에서 해석된 플러그인
    pub plugin: Arc<Plugin>,
}

impl std::fmt::Debug for PluginCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCall")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .finish()
    }
}

/// 컴파일된 check 연산자
#[derive(Debug, Clone)]
pub struct CheckOp {
    /// 체크리스트 조건식에서 참조하는 멤버 ID
    pub member_id: Option<String>,
    /// 술어 종류
    pub kind: CheckKind,
    /// 대상 필드 (PLUGIN check는 None 가능)
    pub field: Option<FieldPath>,
    /// 비교 문자열 토큰 (delimiter 분리, 없으면 1개)
    pub values: Vec<Template>,
    /// 토큰 결합 로직
    pub logic: Logic,
    /// 정적 단일 패턴 REGEX의 컴파일 결과
    pub static_regex: Option<StaticRegex>,
    /// PLUGIN check의 호출
    pub plugin: Option<PluginCall>,
    /// PLUGIN check의 `!` 부정
    pub negate_plugin: bool,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 checklist 연산자
#[derive(Debug, Clone)]
pub struct ChecklistOp {
    /// 멤버 check (평가 비용 계층으로 재배열됨)
    pub checks: Vec<CheckOp>,
    /// 멤버 threshold
    pub thresholds: Vec<ThresholdOp>,
    /// 조건식 (없으면 암묵적 AND)
    pub condition: Option<Condition>,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 threshold 연산자
#[derive(Debug, Clone)]
pub struct ThresholdOp {
    /// 체크리스트 조건식에서 참조하는 멤버 ID
    pub member_id: Option<String>,
    /// 그룹화 필드 경로들
    pub group_by: Vec<FieldPath>,
    /// 윈도우 길이 (초)
    pub range_secs: u64,
    /// 임계값
    pub value: i64,
    /// 집계 모드
    pub count_type: CountType,
    /// SUM/CLASSIFY 대상 필드
    pub count_field: Option<FieldPath>,
    /// 로컬 캐시 백엔드 사용 여부
    pub local_cache: bool,
    /// 사전 계산된 그룹 접두어 (`ruleset_id ∥ rule_id`)
    pub group_prefix: String,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 iterator 연산자
#[derive(Debug, Clone)]
pub struct IteratorOp {
    /// true면 ANY (요소 하나라도 매칭), false면 ALL
    pub any: bool,
    /// 배열 값 필드
    pub field: FieldPath,
    /// 요소 바인딩 변수
    pub variable: String,
    /// 내부 check 멤버
    pub checks: Vec<CheckOp>,
    /// 내부 checklist 멤버
    pub checklists: Vec<ChecklistOp>,
    /// 내부 threshold 멤버
    pub thresholds: Vec<ThresholdOp>,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 append 연산자
#[derive(Debug, Clone)]
pub struct AppendOp {
    /// 대상 필드 원문 (`_$ORIDATA` 가능)
    pub field_raw: String,
    /// 파싱된 대상 경로 (`_$ORIDATA`면 None)
    pub field_path: Option<FieldPath>,
    /// 리터럴 값 템플릿 (플러그인 모드면 미사용)
    pub value: Template,
    /// 플러그인 모드 호출
    pub plugin: Option<PluginCall>,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 modify 연산자
#[derive(Debug, Clone)]
pub struct ModifyOp {
    /// 덮어쓸 필드 (플러그인 모드에서 None이면 이벤트 전체 교체)
    pub field_path: Option<FieldPath>,
    /// 리터럴 값 템플릿
    pub value: Template,
    /// 플러그인 모드 호출
    pub plugin: Option<PluginCall>,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 del 연산자
#[derive(Debug, Clone)]
pub struct DelOp {
    /// 삭제할 경로 목록
    pub paths: Vec<FieldPath>,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 plugin(부수효과) 연산자
#[derive(Debug, Clone)]
pub struct PluginOp {
    /// 호출
    pub call: PluginCall,
    /// 소스 라인
    pub line: u64,
}

/// 컴파일된 룰 -- 작성 순서의 연산자 큐와 종류별 사이드 테이블
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// 룰셋 내 유일 ID
    pub id: String,
    /// 룰 이름
    pub name: String,
    /// 작성 순서의 `(종류, ID)` 큐
    pub queue: Vec<(OperatorKind, OperatorId)>,
    /// check 사이드 테이블
    pub checks: HashMap<OperatorId, CheckOp>,
    /// checklist 사이드 테이블
    pub checklists: HashMap<OperatorId, ChecklistOp>,
    /// threshold 사이드 테이블
    pub thresholds: HashMap<OperatorId, ThresholdOp>,
    /// iterator 사이드 테이블
    pub iterators: HashMap<OperatorId, IteratorOp>,
    /// append 사이드 테이블
    pub appends: HashMap<OperatorId, AppendOp>,
    /// modify 사이드 테이블
    pub modifies: HashMap<OperatorId, ModifyOp>,
    /// del 사이드 테이블
    pub deletes: HashMap<OperatorId, DelOp>,
    /// plugin 사이드 테이블
    pub plugins: HashMap<OperatorId, PluginOp>,
}

/// 컴파일된 룰셋
#[derive(Debug, Clone)]
pub struct Ruleset {
    /// 룰셋 ID -- 히트 ID와 임계치 그룹 접두어에 쓰입니다.
    pub id: String,
    /// 룰셋 이름
    pub name: String,
    /// 작성자
    pub author: String,
    /// 동작 모드
    pub mode: Mode,
    /// 선언 순서의 룰 목록
    pub rules: Vec<Rule>,
}

impl Ruleset {
    /// 로컬 캐시 임계치를 선언한 룰이 있는지 확인합니다.
    pub fn has_local_thresholds(&self) -> bool {
        self.any_threshold(|t| t.local_cache)
    }

    /// 공유 백엔드 임계치를 선언한 룰이 있는지 확인합니다.
    pub fn has_shared_thresholds(&self) -> bool {
        self.any_threshold(|t| !t.local_cache)
    }

    fn any_threshold(&self, pred: impl Fn(&ThresholdOp) -> bool) -> bool {
        self.rules.iter().any(|rule| {
            rule.thresholds.values().any(&pred)
                || rule
                    .checklists
                    .values()
                    .flat_map(|cl| cl.thresholds.iter())
                    .any(&pred)
                || rule.iterators.values().any(|it| {
                    it.thresholds.iter().any(&pred)
                        || it
                            .checklists
                            .iter()
                            .flat_map(|cl| cl.thresholds.iter())
                            .any(&pred)
                })
        })
    }
}

// ─── 검증 리포트 ─────────────────────────────────────────────────────

/// 검증 이슈 -- 라인 번호는 소스 문서의 문제 요소를 가리킵니다.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// 소스 라인 (모를 때 0)
    pub line: u64,
    /// 요약
    pub message: String,
    /// 상세
    pub detail: String,
}

/// `validate()` 결과
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// 에러가 없으면 true -- false인 룰셋은 시작할 수 없습니다.
    pub is_valid: bool,
    /// 빌드를 거부하는 에러 목록
    pub errors: Vec<ValidationIssue>,
    /// 빌드는 허용되는 경고 목록
    pub warnings: Vec<ValidationIssue>,
}

fn issue_from(err: &EngineError) -> ValidationIssue {
    match err {
        EngineError::Build {
            line,
            message,
            detail,
        } => ValidationIssue {
            line: *line,
            message: message.clone(),
            detail: detail.clone(),
        },
        other => ValidationIssue {
            line: other.line(),
            message: other.to_string(),
            detail: String::new(),
        },
    }
}

// ─── 컴파일 ──────────────────────────────────────────────────────────

struct RuleCompiler<'a> {
    ruleset_id: &'a str,
    registry: &'a PluginRegistry,
    warnings: &'a mut Vec<ValidationIssue>,
}

impl RuleCompiler<'_> {
    fn warn(&mut self, line: u64, message: impl Into<String>, detail: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            line,
            message: message.into(),
            detail: detail.into(),
        });
    }

    fn compile_rule(&mut self, src: &SourceRule) -> Result<Rule, EngineError> {
        let mut rule = Rule {
            id: src.id.clone(),
            name: src.name.clone(),
            ..Rule::default()
        };

        let mut next_id: OperatorId = 0;
        for op in &src.ops {
            let op_id = next_id;
            next_id += 1;
            match op {
                SourceOp::Check(check) => {
                    let compiled = self.compile_check(check, false)?;
                    rule.queue.push((OperatorKind::Check, op_id));
                    rule.checks.insert(op_id, compiled);
                }
                SourceOp::Checklist(checklist) => {
                    let compiled = self.compile_checklist(checklist, &src.id)?;
                    rule.queue.push((OperatorKind::Checklist, op_id));
                    rule.checklists.insert(op_id, compiled);
                }
                SourceOp::Threshold(threshold) => {
                    let compiled = self.compile_threshold(threshold, &src.id)?;
                    rule.queue.push((OperatorKind::Threshold, op_id));
                    rule.thresholds.insert(op_id, compiled);
                }
                SourceOp::Iterator(iterator) => {
                    let compiled = self.compile_iterator(iterator, &src.id)?;
                    rule.queue.push((OperatorKind::Iterator, op_id));
                    rule.iterators.insert(op_id, compiled);
                }
                SourceOp::Append(append) => {
                    let compiled = self.compile_append(append)?;
                    rule.queue.push((OperatorKind::Append, op_id));
                    rule.appends.insert(op_id, compiled);
                }
                SourceOp::Modify(modify) => {
                    let compiled = self.compile_modify(modify)?;
                    rule.queue.push((OperatorKind::Modify, op_id));
                    rule.modifies.insert(op_id, compiled);
                }
                SourceOp::Del(del) => {
                    let mut paths = Vec::new();
                    for raw in del.paths.split(',') {
                        let raw = raw.trim();
                        if raw.is_empty() {
                            continue;
                        }
                        let path = FieldPath::parse(raw).map_err(|e| {
                            EngineError::build(del.line, "invalid del path", e)
                        })?;
                        paths.push(path);
                    }
                    if paths.is_empty() {
                        return Err(EngineError::build(del.line, "del lists no paths", ""));
                    }
                    rule.queue.push((OperatorKind::Del, op_id));
                    rule.deletes.insert(op_id, DelOp {
                        paths,
                        line: del.line,
                    });
                }
                SourceOp::Plugin(plugin) => {
                    let (call, negate) = self.compile_plugin_call(&plugin.value, plugin.line)?;
                    if negate {
                        return Err(EngineError::build(
                            plugin.line,
                            "'!' negation is only valid in PLUGIN checks",
                            &plugin.value,
                        ));
                    }
                    rule.queue.push((OperatorKind::Plugin, op_id));
                    rule.plugins.insert(op_id, PluginOp {
                        call,
                        line: plugin.line,
                    });
                }
            }
        }

        Ok(rule)
    }

    fn compile_check(
        &mut self,
        src: &SourceCheck,
        in_conditioned_checklist: bool,
    ) -> Result<CheckOp, EngineError> {
        let kind = CheckKind::parse(&src.check_type).ok_or_else(|| {
            EngineError::build(src.line, "unknown check type", &src.check_type)
        })?;

        if in_conditioned_checklist && src.id.as_deref().unwrap_or("").is_empty() {
            return Err(EngineError::build(
                src.line,
                "check in a checklist with a condition requires an 'id'",
                "",
            ));
        }

        // delimiter와 logic은 쌍으로만 유효합니다.
        let logic = match (&src.delimiter, &src.logic) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(EngineError::build(
                    src.line,
                    "'delimiter' and 'logic' must be declared together",
                    "",
                ));
            }
            (Some(_), Some(raw)) => Logic::parse(raw).ok_or_else(|| {
                EngineError::build(src.line, "logic must be AND or OR", raw)
            })?,
            (None, None) => Logic::And,
        };

        if kind.base == BaseCheck::Plugin {
            let (call, negate) = self.compile_plugin_call(&src.value, src.line)?;
            if call.plugin.spec().return_type != ReturnType::Bool {
                return Err(EngineError::build(
                    src.line,
                    "PLUGIN check requires a bool-returning plugin",
                    &call.name,
                ));
            }
            return Ok(CheckOp {
                member_id: src.id.clone(),
                kind,
                field: None,
                values: Vec::new(),
                logic,
                static_regex: None,
                plugin: Some(call),
                negate_plugin: negate,
                line: src.line,
            });
        }

        let field_raw = src.field.as_deref().unwrap_or("");
        if field_raw.is_empty() {
            return Err(EngineError::build(src.line, "check missing 'field'", ""));
        }
        let field = FieldPath::parse(field_raw)
            .map_err(|e| EngineError::build(src.line, "invalid check field path", e))?;

        // 다중값 분리는 빌드 타임에 수행합니다.
        let values: Vec<Template> = match &src.delimiter {
            Some(delimiter) => {
                let tokens: Vec<&str> = src.value.split(delimiter.as_str()).collect();
                if tokens.len() < 2 {
                    return Err(EngineError::build(
                        src.line,
                        "delimiter must split the value into at least 2 tokens",
                        &src.value,
                    ));
                }
                tokens.iter().map(|t| Template::parse(t)).collect()
            }
            None => vec![Template::parse(&src.value)],
        };

        // 정적 단일 패턴 REGEX는 지금 컴파일하고 결과 캐시 대상이 됩니다.
        let static_regex = if kind.base == BaseCheck::Regex
            && values.len() == 1
            && !values[0].is_dynamic()
        {
            let pattern = if kind.ncs {
                values[0].raw().to_lowercase()
            } else {
                values[0].raw().to_owned()
            };
            let regex = regex_cache::shared_compiled_cache()
                .get_or_compile(&pattern)
                .map_err(|e| EngineError::build(src.line, "invalid regex pattern", e.to_string()))?;
            Some(StaticRegex {
                regex,
                id: regex_cache::pattern_id(&pattern),
            })
        } else {
            None
        };

        Ok(CheckOp {
            member_id: src.id.clone(),
            kind,
            field: Some(field),
            values,
            logic,
            static_regex,
            plugin: None,
            negate_plugin: false,
            line: src.line,
        })
    }

    fn compile_checklist(
        &mut self,
        src: &SourceChecklist,
        rule_id: &str,
    ) -> Result<ChecklistOp, EngineError> {
        if src.checks.is_empty() && src.thresholds.is_empty() {
            return Err(EngineError::build(
                src.line,
                "checklist requires at least one check or threshold member",
                "",
            ));
        }

        let condition = match &src.condition {
            Some(raw) => Some(
                Condition::parse(raw)
                    .map_err(|e| EngineError::build(src.line, "invalid condition", e))?,
            ),
            None => None,
        };
        let has_condition = condition.is_some();

        let mut checks = Vec::new();
        for check in &src.checks {
            checks.push(self.compile_check(check, has_condition)?);
        }
        let mut thresholds = Vec::new();
        for threshold in &src.thresholds {
            let compiled = self.compile_threshold(threshold, rule_id)?;
            if has_condition && compiled.member_id.as_deref().unwrap_or("").is_empty() {
                return Err(EngineError::build(
                    threshold.line,
                    "threshold in a checklist with a condition requires an 'id'",
                    "",
                ));
            }
            thresholds.push(compiled);
        }

        if let Some(condition) = &condition {
            let mut declared = HashSet::new();
            for id in checks
                .iter()
                .filter_map(|c| c.member_id.as_deref())
                .chain(thresholds.iter().filter_map(|t| t.member_id.as_deref()))
            {
                if !declared.insert(id.to_owned()) {
                    return Err(EngineError::build(
                        src.line,
                        "duplicate member id in checklist",
                        id,
                    ));
                }
            }
            for referenced in condition.referenced_ids() {
                if !declared.contains(referenced) {
                    return Err(EngineError::build(
                        src.line,
                        "condition references undeclared member id",
                        referenced,
                    ));
                }
            }
            for declared_id in &declared {
                if !condition.referenced_ids().contains(declared_id) {
                    self.warn(
                        src.line,
                        "checklist member is not referenced by the condition",
                        declared_id,
                    );
                }
            }
        }

        // 평가 비용 계층으로 재배열 (안정 정렬 -- 같은 계층은 작성 순서 유지)
        checks.sort_by_key(|c| c.kind.tier());

        Ok(ChecklistOp {
            checks,
            thresholds,
            condition,
            line: src.line,
        })
    }

    fn compile_threshold(
        &mut self,
        src: &SourceThreshold,
        rule_id: &str,
    ) -> Result<ThresholdOp, EngineError> {
        let mut group_by = Vec::new();
        for raw in src.group_by.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let path = FieldPath::parse(raw)
                .map_err(|e| EngineError::build(src.line, "invalid group_by path", e))?;
            group_by.push(path);
        }
        if group_by.is_empty() {
            return Err(EngineError::build(
                src.line,
                "threshold requires a non-empty group_by",
                "",
            ));
        }

        let range_secs = parse_range_secs(&src.range)
            .map_err(|e| EngineError::build(src.line, "invalid threshold range", e))?;

        let value: i64 = src
            .value
            .parse()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                EngineError::build(
                    src.line,
                    "threshold value must be a positive integer",
                    &src.value,
                )
            })?;

        let count_type = match src.count_type.as_str() {
            "" => CountType::Count,
            "SUM" => CountType::Sum,
            "CLASSIFY" => CountType::Classify,
            other => {
                return Err(EngineError::build(
                    src.line,
                    "count_type must be empty, SUM, or CLASSIFY",
                    other,
                ));
            }
        };

        let count_field = if matches!(count_type, CountType::Sum | CountType::Classify) {
            if src.count_field.is_empty() {
                return Err(EngineError::build(
                    src.line,
                    "SUM/CLASSIFY thresholds require a count_field",
                    "",
                ));
            }
            Some(
                FieldPath::parse(&src.count_field)
                    .map_err(|e| EngineError::build(src.line, "invalid count_field path", e))?,
            )
        } else {
            None
        };

        if !src.local_cache {
            self.warn(
                src.line,
                "threshold uses the shared counter store",
                "start fails unless a store is configured",
            );
        }

        Ok(ThresholdOp {
            member_id: src.id.clone(),
            group_by,
            range_secs,
            value,
            count_type,
            count_field,
            local_cache: src.local_cache,
            group_prefix: format!("{}{}", self.ruleset_id, rule_id),
            line: src.line,
        })
    }

    fn compile_iterator(
        &mut self,
        src: &SourceIterator,
        rule_id: &str,
    ) -> Result<IteratorOp, EngineError> {
        let any = match src.iter_type.as_str() {
            "ANY" => true,
            "ALL" => false,
            other => {
                return Err(EngineError::build(
                    src.line,
                    "iterator type must be ANY or ALL",
                    other,
                ));
            }
        };

        let field = FieldPath::parse(&src.field)
            .map_err(|e| EngineError::build(src.line, "invalid iterator field path", e))?;

        validate_variable(&src.variable)
            .map_err(|e| EngineError::build(src.line, "invalid iterator variable", e))?;

        if src.checks.is_empty() && src.checklists.is_empty() && src.thresholds.is_empty() {
            return Err(EngineError::build(
                src.line,
                "iterator requires at least one inner member",
                "",
            ));
        }

        let mut checks = Vec::new();
        for check in &src.checks {
            checks.push(self.compile_check(check, false)?);
        }
        let mut checklists = Vec::new();
        for checklist in &src.checklists {
            checklists.push(self.compile_checklist(checklist, rule_id)?);
        }
        let mut thresholds = Vec::new();
        for threshold in &src.thresholds {
            thresholds.push(self.compile_threshold(threshold, rule_id)?);
        }

        Ok(IteratorOp {
            any,
            field,
            variable: src.variable.clone(),
            checks,
            checklists,
            thresholds,
            line: src.line,
        })
    }

    fn compile_append(&mut self, src: &source::SourceAppend) -> Result<AppendOp, EngineError> {
        if src.field.is_empty() {
            return Err(EngineError::build(src.line, "append missing 'field'", ""));
        }

        let plugin = match src.append_type.as_deref() {
            Some("PLUGIN") => {
                let (call, negate) = self.compile_plugin_call(&src.value, src.line)?;
                if negate {
                    return Err(EngineError::build(
                        src.line,
                        "'!' negation is only valid in PLUGIN checks",
                        &src.value,
                    ));
                }
                Some(call)
            }
            Some(other) => {
                return Err(EngineError::build(src.line, "unknown append type", other));
            }
            None => None,
        };

        let field_path = if src.field == ORIDATA {
            if plugin.is_none() {
                return Err(EngineError::build(
                    src.line,
                    "append to _$ORIDATA requires a PLUGIN value",
                    "",
                ));
            }
            None
        } else {
            Some(
                FieldPath::parse(&src.field)
                    .map_err(|e| EngineError::build(src.line, "invalid append field path", e))?,
            )
        };

        Ok(AppendOp {
            field_raw: src.field.clone(),
            field_path,
            value: Template::parse(&src.value),
            plugin,
            line: src.line,
        })
    }

    fn compile_modify(&mut self, src: &source::SourceModify) -> Result<ModifyOp, EngineError> {
        let plugin = match src.modify_type.as_deref() {
            Some("PLUGIN") => {
                let (call, negate) = self.compile_plugin_call(&src.value, src.line)?;
                if negate {
                    return Err(EngineError::build(
                        src.line,
                        "'!' negation is only valid in PLUGIN checks",
                        &src.value,
                    ));
                }
                Some(call)
            }
            Some(other) => {
                return Err(EngineError::build(src.line, "unknown modify type", other));
            }
            None => None,
        };

        let field_raw = src.field.as_deref().unwrap_or("");
        match &plugin {
            None if field_raw.is_empty() => {
                return Err(EngineError::build(
                    src.line,
                    "literal modify requires a 'field'",
                    "",
                ));
            }
            Some(call)
                if field_raw.is_empty()
                    && call.plugin.spec().return_type == ReturnType::Bool =>
            {
                // 데이터 전체 교체는 map이 필요하므로 bool 플러그인은 필드가 필수입니다.
                return Err(EngineError::build(
                    src.line,
                    "bool-returning modify plugin requires a 'field'",
                    &call.name,
                ));
            }
            _ => {}
        }

        let field_path = if field_raw.is_empty() {
            None
        } else {
            Some(
                FieldPath::parse(field_raw)
                    .map_err(|e| EngineError::build(src.line, "invalid modify field path", e))?,
            )
        };

        Ok(ModifyOp {
            field_path,
            value: Template::parse(&src.value),
            plugin,
            line: src.line,
        })
    }

    /// `name(arg, ...)` 또는 `!name(arg, ...)` 호출식을 컴파일합니다.
    fn compile_plugin_call(
        &mut self,
        raw: &str,
        line: u64,
    ) -> Result<(PluginCall, bool), EngineError> {
        let text = raw.trim();
        let (negate, text) = match text.strip_prefix('!') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, text),
        };

        let open = text.find('(').ok_or_else(|| {
            EngineError::build(line, "plugin call must look like name(args)", raw)
        })?;
        if !text.ends_with(')') {
            return Err(EngineError::build(
                line,
                "plugin call must look like name(args)",
                raw,
            ));
        }
        let name = text[..open].trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EngineError::build(line, "invalid plugin name", name));
        }

        let plugin = match self.registry.lookup(name) {
            PluginLookup::Finalized(plugin) => plugin,
            PluginLookup::Staged => {
                return Err(EngineError::PluginStaged {
                    name: name.to_owned(),
                    line,
                });
            }
            PluginLookup::Missing => {
                return Err(EngineError::PluginMissing {
                    name: name.to_owned(),
                    line,
                });
            }
        };

        let inner = &text[open + 1..text.len() - 1];
        let tokens = split_args(inner)
            .map_err(|e| EngineError::build(line, "malformed plugin arguments", e))?;
        let mut args = Vec::new();
        for token in &tokens {
            args.push(
                parse_arg(token)
                    .map_err(|e| EngineError::build(line, "invalid plugin argument", e))?,
            );
        }

        // 인자 수/타입은 best-effort 검증입니다. 값 강제 변환은 하지 않습니다.
        let spec = plugin.spec();
        let required = spec.params.iter().filter(|p| p.required).count();
        if args.len() < required {
            return Err(EngineError::build(
                line,
                "too few plugin arguments",
                format!("{name} requires {required}, got {}", args.len()),
            ));
        }
        if !spec.params.is_empty() && args.len() > spec.params.len() {
            self.warn(
                line,
                "more arguments than declared parameters",
                format!("{name} declares {}, got {}", spec.params.len(), args.len()),
            );
        }
        for (arg, param) in args.iter().zip(spec.params.iter()) {
            if let PluginArg::Literal(value) = arg {
                let compatible = match param.param_type {
                    ParamType::Any => true,
                    ParamType::Int => matches!(value, Value::Int(_)),
                    ParamType::Float => matches!(value, Value::Float(_) | Value::Int(_)),
                    ParamType::Bool => matches!(value, Value::Bool(_)),
                    ParamType::String => matches!(value, Value::String(_)),
                };
                if !compatible {
                    self.warn(
                        line,
                        "literal argument type differs from declared parameter",
                        format!("{name}({})", param.name),
                    );
                }
            }
        }

        Ok((
            PluginCall {
                name: name.to_owned(),
                args,
                plugin,
            },
            negate,
        ))
    }
}

/// 최상위 쉼표로 인자 목록을 분리합니다 (따옴표 문자열 내 쉼표는 보존).
fn split_args(inner: &str) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in inner.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            ',' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_string {
        return Err("unterminated string literal".to_owned());
    }

    let trailing = current.trim().to_owned();
    if !trailing.is_empty() {
        parts.push(current);
    } else if !parts.is_empty() {
        return Err("trailing comma in argument list".to_owned());
    }

    for part in &parts {
        if part.trim().is_empty() {
            return Err("empty argument".to_owned());
        }
    }
    Ok(parts)
}

/// 단일 인자 토큰을 파싱합니다.
fn parse_arg(token: &str) -> Result<PluginArg, String> {
    let t = token.trim();
    if let Some(inner) = t.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| format!("unterminated string literal: {t}"))?;
        let mut out = String::new();
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => return Err(format!("dangling escape in string literal: {t}")),
                }
            } else {
                out.push(c);
            }
        }
        return Ok(PluginArg::Literal(Value::String(out)));
    }
    if t == "true" {
        return Ok(PluginArg::Literal(Value::Bool(true)));
    }
    if t == "false" {
        return Ok(PluginArg::Literal(Value::Bool(false)));
    }
    if t == ORIDATA {
        return Ok(PluginArg::OriData);
    }
    if let Ok(i) = t.parse::<i64>() {
        return Ok(PluginArg::Literal(Value::Int(i)));
    }
    if let Ok(f) = t.parse::<f64>() {
        return Ok(PluginArg::Literal(Value::Float(f)));
    }
    FieldPath::parse(t)
        .map(PluginArg::FieldRef)
        .map_err(|e| format!("not a literal or field reference: {e}"))
}

/// `30s`/`5m`/`1h`/`2d` 또는 순수 정수(초)를 초 단위로 파싱합니다.
fn parse_range_secs(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty range".to_owned());
    }
    let secs = if trimmed.chars().all(|c| c.is_ascii_digit()) {
        trimmed
            .parse::<u64>()
            .map_err(|e| format!("invalid range '{trimmed}': {e}"))?
    } else {
        humantime::parse_duration(trimmed)
            .map_err(|e| format!("invalid range '{trimmed}': {e}"))?
            .as_secs()
    };
    if secs == 0 {
        return Err(format!("range '{trimmed}' must be positive"));
    }
    Ok(secs)
}

/// iterator 변수 이름 규칙을 검증합니다.
fn validate_variable(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("variable name is empty".to_owned());
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(format!("variable '{name}' must start with a letter or underscore"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "variable '{name}' may contain only letters, digits, and underscores"
        ));
    }
    if name.starts_with("_$") || name.starts_with(RESERVED_PREFIX) || name.starts_with("#_") {
        return Err(format!("variable '{name}' uses a reserved prefix"));
    }
    if name == ORIDATA {
        return Err(format!("variable '{name}' is a reserved name"));
    }
    Ok(())
}

/// 룰셋 소스를 컴파일합니다. 첫 에러에서 즉시 실패합니다 (fail-fast).
pub fn compile(source: &str, registry: &PluginRegistry) -> Result<Ruleset, EngineError> {
    let mut warnings = Vec::new();
    compile_with_warnings(source, registry, &mut warnings)
}

pub(crate) fn compile_with_warnings(
    source: &str,
    registry: &PluginRegistry,
    warnings: &mut Vec<ValidationIssue>,
) -> Result<Ruleset, EngineError> {
    let src = parse_source(source)?;

    let mode = Mode::parse(&src.mode).ok_or_else(|| {
        EngineError::build(src.line, "type must be DETECTION or EXCLUDE", &src.mode)
    })?;

    let mut seen_ids = HashSet::new();
    for rule in &src.rules {
        if !seen_ids.insert(rule.id.clone()) {
            return Err(EngineError::build(rule.line, "duplicate rule id", &rule.id));
        }
    }

    let mut compiler = RuleCompiler {
        ruleset_id: &src.id,
        registry,
        warnings,
    };
    let mut rules = Vec::new();
    for rule in &src.rules {
        rules.push(compiler.compile_rule(rule)?);
    }

    Ok(Ruleset {
        id: src.id,
        name: src.name,
        author: src.author,
        mode,
        rules,
    })
}

/// 룰셋 소스를 검증하고 에러/경고 리포트를 반환합니다.
///
/// 컴파일과 달리 룰 단위로 계속 진행하여 가능한 한 많은 에러를
/// 수집합니다. `is_valid == false`인 룰셋은 시작할 수 없습니다.
pub fn validate(source: &str, registry: &PluginRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    let src = match parse_source(source) {
        Ok(src) => src,
        Err(err) => {
            report.errors.push(issue_from(&err));
            return report;
        }
    };

    if Mode::parse(&src.mode).is_none() {
        report.errors.push(ValidationIssue {
            line: src.line,
            message: "type must be DETECTION or EXCLUDE".to_owned(),
            detail: src.mode.clone(),
        });
    }

    let mut seen_ids = HashSet::new();
    for rule in &src.rules {
        if !seen_ids.insert(rule.id.clone()) {
            report.errors.push(ValidationIssue {
                line: rule.line,
                message: "duplicate rule id".to_owned(),
                detail: rule.id.clone(),
            });
        }
    }

    let mut warnings = Vec::new();
    for rule in &src.rules {
        let mut compiler = RuleCompiler {
            ruleset_id: &src.id,
            registry,
            warnings: &mut warnings,
        };
        if let Err(err) = compiler.compile_rule(rule) {
            report.errors.push(issue_from(&err));
        }
    }

    report.warnings = warnings;
    report.is_valid = report.errors.is_empty();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulehub_core::plugin::PluginParam;

    fn registry_with_bool_plugin(name: &str) -> PluginRegistry {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_bool(name, vec![], |_| Ok(true)))
            .unwrap();
        registry
    }

    fn detection(rules_xml: &str) -> String {
        format!(r#"<ruleset id="rs" name="rs" type="DETECTION">{rules_xml}</ruleset>"#)
    }

    #[test]
    fn compile_preserves_queue_order_and_side_tables() {
        let src = detection(
            r#"<rule id="r1">
                <append field="a">x</append>
                <check type="EQU" field="user">alice</check>
                <del>a</del>
            </rule>"#,
        );
        let ruleset = compile(&src, &PluginRegistry::new()).unwrap();
        let rule = &ruleset.rules[0];
        assert_eq!(
            rule.queue
                .iter()
                .map(|(kind, _)| *kind)
                .collect::<Vec<_>>(),
            vec![OperatorKind::Append, OperatorKind::Check, OperatorKind::Del]
        );
        assert_eq!(rule.appends.len(), 1);
        assert_eq!(rule.checks.len(), 1);
        assert_eq!(rule.deletes.len(), 1);
        // 큐의 ID로 사이드 테이블 조회가 가능해야 합니다.
        for (kind, id) in &rule.queue {
            let found = match kind {
                OperatorKind::Append => rule.appends.contains_key(id),
                OperatorKind::Check => rule.checks.contains_key(id),
                OperatorKind::Del => rule.deletes.contains_key(id),
                _ => false,
            };
            assert!(found);
        }
    }

    #[test]
    fn duplicate_rule_ids_rejected() {
        let src = detection(r#"<rule id="r1"/><rule id="r1"/>"#);
        let err = compile(&src, &PluginRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("duplicate rule id"));
    }

    #[test]
    fn bad_mode_rejected() {
        let src = r#"<ruleset id="rs" type="DETECT"><rule id="r1"/></ruleset>"#;
        assert!(compile(src, &PluginRegistry::new()).is_err());
    }

    #[test]
    fn checklist_checks_reordered_by_tier() {
        let src = detection(
            r#"<rule id="r1">
                <checklist>
                    <check type="PLUGIN">probe()</check>
                    <check type="REGEX" field="msg">x+</check>
                    <check type="INCL" field="msg">x</check>
                    <check type="ISNULL" field="gone"></check>
                </checklist>
            </rule>"#,
        );
        let registry = registry_with_bool_plugin("probe");
        let ruleset = compile(&src, &registry).unwrap();
        let checklist = ruleset.rules[0].checklists.values().next().unwrap();
        let tiers: Vec<u8> = checklist.checks.iter().map(|c| c.kind.tier()).collect();
        assert_eq!(tiers, vec![0, 1, 2, 3]);
    }

    #[test]
    fn empty_checklist_rejected() {
        let src = detection(r#"<rule id="r1"><checklist/></rule>"#);
        assert!(compile(&src, &PluginRegistry::new()).is_err());
    }

    #[test]
    fn condition_requires_member_ids() {
        let src = detection(
            r#"<rule id="r1">
                <checklist condition="a and b">
                    <check id="a" type="INCL" field="m">x</check>
                    <check type="INCL" field="m">y</check>
                </checklist>
            </rule>"#,
        );
        let err = compile(&src, &PluginRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("requires an 'id'"));
    }

    #[test]
    fn condition_undeclared_reference_rejected() {
        let src = detection(
            r#"<rule id="r1">
                <checklist condition="a and ghost">
                    <check id="a" type="INCL" field="m">x</check>
                </checklist>
            </rule>"#,
        );
        let err = compile(&src, &PluginRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("undeclared member id"));
    }

    #[test]
    fn delimiter_without_logic_rejected() {
        let src = detection(
            r#"<rule id="r1"><check type="INCL" field="m" delimiter="|">a|b</check></rule>"#,
        );
        let err = compile(&src, &PluginRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("declared together"));
    }

    #[test]
    fn delimiter_must_yield_two_tokens() {
        let src = detection(
            r#"<rule id="r1"><check type="INCL" field="m" delimiter="|" logic="OR">only</check></rule>"#,
        );
        let err = compile(&src, &PluginRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("at least 2 tokens"));
    }

    #[test]
    fn multivalue_check_splits_at_build_time() {
        let src = detection(
            r#"<rule id="r1"><check type="INCL" field="m" delimiter="|" logic="OR">a|b|c</check></rule>"#,
        );
        let ruleset = compile(&src, &PluginRegistry::new()).unwrap();
        let check = ruleset.rules[0].checks.values().next().unwrap();
        assert_eq!(check.values.len(), 3);
        assert_eq!(check.logic, Logic::Or);
    }

    #[test]
    fn static_regex_precompiled_dynamic_not() {
        let src = detection(
            r#"<rule id="r1">
                <check type="REGEX" field="m">^a+$</check>
                <check type="REGEX" field="m">^_$prefix.*</check>
            </rule>"#,
        );
        let ruleset = compile(&src, &PluginRegistry::new()).unwrap();
        let rule = &ruleset.rules[0];
        let static_count = rule
            .checks
            .values()
            .filter(|c| c.static_regex.is_some())
            .count();
        assert_eq!(static_count, 1);
    }

    #[test]
    fn invalid_static_regex_rejected_with_line() {
        let src = detection(r#"<rule id="r1"><check type="REGEX" field="m">[bad</check></rule>"#);
        let err = compile(&src, &PluginRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("invalid regex pattern"));
        assert!(err.line() > 0);
    }

    #[test]
    fn threshold_invariants_enforced() {
        for (attrs, needle) in [
            (r#"range="10s" value="3""#, "group_by"),
            (r#"group_by="src" value="3""#, "range"),
            (r#"group_by="src" range="10s" value="0""#, "positive integer"),
            (r#"group_by="src" range="10s" value="-2""#, "positive integer"),
            (
                r#"group_by="src" range="10s" value="3" count_type="SUM""#,
                "count_field",
            ),
            (
                r#"group_by="src" range="10s" value="3" count_type="MAX""#,
                "count_type",
            ),
        ] {
            let src = detection(&format!(r#"<rule id="r1"><threshold {attrs}/></rule>"#));
            let err = compile(&src, &PluginRegistry::new()).unwrap_err();
            assert!(err.to_string().contains(needle), "attrs={attrs}: {err}");
        }
    }

    #[test]
    fn threshold_range_suffixes() {
        for (range, secs) in [("30s", 30), ("5m", 300), ("1h", 3600), ("2d", 172_800), ("45", 45)] {
            let src = detection(&format!(
                r#"<rule id="r1"><threshold group_by="src" range="{range}" value="3" local_cache="true"/></rule>"#
            ));
            let ruleset = compile(&src, &PluginRegistry::new()).unwrap();
            let threshold = ruleset.rules[0].thresholds.values().next().unwrap();
            assert_eq!(threshold.range_secs, secs, "range={range}");
        }
    }

    #[test]
    fn threshold_group_prefix_precomputed() {
        let src = detection(
            r#"<rule id="r9"><threshold group_by="a,b" range="10s" value="3" local_cache="true"/></rule>"#,
        );
        let ruleset = compile(&src, &PluginRegistry::new()).unwrap();
        let threshold = ruleset.rules[0].thresholds.values().next().unwrap();
        assert_eq!(threshold.group_prefix, "rsr9");
        assert_eq!(threshold.group_by.len(), 2);
    }

    #[test]
    fn iterator_variable_rules() {
        for (variable, ok) in [
            ("ev", true),
            ("_ev", true),
            ("ev2", true),
            ("2ev", false),
            ("e-v", false),
            ("_hubx", false),
            ("", false),
        ] {
            let src = detection(&format!(
                r#"<rule id="r1"><iterator type="ANY" field="xs" variable="{variable}"><check type="NOTNULL" field="{variable}"></check></iterator></rule>"#
            ));
            let result = compile(&src, &PluginRegistry::new());
            assert_eq!(result.is_ok(), ok, "variable={variable:?}");
        }
    }

    #[test]
    fn iterator_requires_members_and_valid_type() {
        let src = detection(r#"<rule id="r1"><iterator type="ANY" field="xs" variable="v"/></rule>"#);
        assert!(compile(&src, &PluginRegistry::new()).is_err());

        let src = detection(
            r#"<rule id="r1"><iterator type="SOME" field="xs" variable="v"><check type="NOTNULL" field="v"></check></iterator></rule>"#,
        );
        assert!(compile(&src, &PluginRegistry::new()).is_err());
    }

    #[test]
    fn plugin_check_requires_bool_return() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_any("mapper", vec![], |_| Ok(Value::Null)))
            .unwrap();
        let src = detection(r#"<rule id="r1"><check type="PLUGIN">mapper()</check></rule>"#);
        let err = compile(&src, &registry).unwrap_err();
        assert!(err.to_string().contains("bool-returning"));
    }

    #[test]
    fn staged_plugin_fails_with_distinct_error() {
        let registry = PluginRegistry::new();
        registry
            .register_staged(Plugin::new_bool("probe", vec![], |_| Ok(true)))
            .unwrap();
        let src = detection(r#"<rule id="r1"><check type="PLUGIN">probe()</check></rule>"#);
        let err = compile(&src, &registry).unwrap_err();
        assert!(matches!(err, EngineError::PluginStaged { .. }));

        // 승격 후에는 성공합니다.
        registry.promote("probe").unwrap();
        assert!(compile(&src, &registry).is_ok());
    }

    #[test]
    fn missing_plugin_fails() {
        let src = detection(r#"<rule id="r1"><check type="PLUGIN">ghost()</check></rule>"#);
        let err = compile(&src, &PluginRegistry::new()).unwrap_err();
        assert!(matches!(err, EngineError::PluginMissing { .. }));
    }

    #[test]
    fn plugin_args_parse_shapes() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_bool("probe", vec![], |_| Ok(true)))
            .unwrap();
        let src = detection(
            r#"<rule id="r1"><check type="PLUGIN">probe(42, 2.5, true, "a, \"b\"", user.name, _$ORIDATA)</check></rule>"#,
        );
        let ruleset = compile(&src, &registry).unwrap();
        let call = ruleset.rules[0]
            .checks
            .values()
            .next()
            .unwrap()
            .plugin
            .as_ref()
            .unwrap();
        assert_eq!(call.args.len(), 6);
        assert!(matches!(&call.args[0], PluginArg::Literal(Value::Int(42))));
        assert!(matches!(&call.args[1], PluginArg::Literal(Value::Float(_))));
        assert!(matches!(&call.args[2], PluginArg::Literal(Value::Bool(true))));
        match &call.args[3] {
            PluginArg::Literal(Value::String(s)) => assert_eq!(s, "a, \"b\""),
            other => panic!("expected string literal, got {other:?}"),
        }
        assert!(matches!(&call.args[4], PluginArg::FieldRef(_)));
        assert!(matches!(&call.args[5], PluginArg::OriData));
    }

    #[test]
    fn negated_plugin_only_in_checks() {
        let registry = registry_with_bool_plugin("probe");
        let src = detection(r#"<rule id="r1"><check type="PLUGIN">!probe()</check></rule>"#);
        let ruleset = compile(&src, &registry).unwrap();
        assert!(ruleset.rules[0].checks.values().next().unwrap().negate_plugin);

        let src = detection(r#"<rule id="r1"><plugin>!probe()</plugin></rule>"#);
        assert!(compile(&src, &registry).is_err());
    }

    #[test]
    fn too_few_plugin_args_rejected() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_bool(
                "needs2",
                vec![
                    PluginParam {
                        name: "a".to_owned(),
                        param_type: ParamType::Any,
                        required: true,
                    },
                    PluginParam {
                        name: "b".to_owned(),
                        param_type: ParamType::Any,
                        required: true,
                    },
                ],
                |_| Ok(true),
            ))
            .unwrap();
        let src = detection(r#"<rule id="r1"><check type="PLUGIN">needs2(1)</check></rule>"#);
        let err = compile(&src, &registry).unwrap_err();
        assert!(err.to_string().contains("too few plugin arguments"));
    }

    #[test]
    fn append_modify_del_compile() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_any("enrich", vec![], |_| Ok(Value::Null)))
            .unwrap();
        let src = detection(
            r#"<rule id="r1">
                <append field="tag">v=_$user</append>
                <append field="geo" type="PLUGIN">enrich(src)</append>
                <modify field="user">anon</modify>
                <modify type="PLUGIN">enrich(_$ORIDATA)</modify>
                <del>a.b, c</del>
            </rule>"#,
        );
        let ruleset = compile(&src, &registry).unwrap();
        let rule = &ruleset.rules[0];
        assert_eq!(rule.appends.len(), 2);
        assert_eq!(rule.modifies.len(), 2);
        assert_eq!(rule.deletes.values().next().unwrap().paths.len(), 2);
    }

    #[test]
    fn literal_append_to_oridata_rejected() {
        let src = detection(r#"<rule id="r1"><append field="_$ORIDATA">text</append></rule>"#);
        assert!(compile(&src, &PluginRegistry::new()).is_err());
    }

    #[test]
    fn bool_modify_plugin_without_field_rejected() {
        let registry = registry_with_bool_plugin("probe");
        let src = detection(r#"<rule id="r1"><modify type="PLUGIN">probe()</modify></rule>"#);
        let err = compile(&src, &registry).unwrap_err();
        assert!(err.to_string().contains("requires a 'field'"));
    }

    #[test]
    fn validate_collects_multiple_errors_and_warnings() {
        let src = r#"<ruleset id="rs" type="DETECTION">
    <rule id="r1"><check type="BOGUS" field="x">v</check></rule>
    <rule id="r2"><threshold group_by="src" range="10s" value="0"/></rule>
    <rule id="r3">
        <checklist condition="a">
            <check id="a" type="INCL" field="m">x</check>
            <check id="b" type="INCL" field="m">y</check>
        </checklist>
        <threshold group_by="src" range="10s" value="3"/>
    </rule>
</ruleset>"#;
        let report = validate(src, &PluginRegistry::new());
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.line > 0));
        // 미참조 멤버 b + 공유 스토어 경고
        assert!(report.warnings.len() >= 2);
    }

    #[test]
    fn validate_accepts_good_source() {
        let src = detection(r#"<rule id="r1"><check type="EQU" field="user">alice</check></rule>"#);
        let report = validate(&src, &PluginRegistry::new());
        assert!(report.is_valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn compile_is_idempotent_up_to_operator_ids() {
        let src = detection(
            r#"<rule id="r1">
                <check type="EQU" field="user">alice</check>
                <threshold group_by="src" range="10s" value="3" local_cache="true"/>
            </rule>"#,
        );
        let registry = PluginRegistry::new();
        let a = compile(&src, &registry).unwrap();
        let b = compile(&src, &registry).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.rules.len(), b.rules.len());
        assert_eq!(a.rules[0].queue, b.rules[0].queue);
    }

    #[test]
    fn range_parse_rejects_garbage() {
        assert!(parse_range_secs("").is_err());
        assert!(parse_range_secs("10x").is_err());
        assert!(parse_range_secs("0").is_err());
        assert!(parse_range_secs("-5").is_err());
    }
}
