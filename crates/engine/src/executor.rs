//! 룰 실행기 -- 이벤트마다 각 룰의 연산자 큐를 구동
//!
//! 룰은 선언 순서대로, 연산자는 작성자가 배치한 큐 순서 그대로
//! 실행됩니다. 진리 연산자(check/checklist/threshold/iterator)가
//! false를 내면 룰의 진리값이 false가 되며, DETECTION 모드에서는 이후
//! 변이가 무의미하므로 큐를 중단합니다. EXCLUDE 모드에서는 룰이 끝내
//! 발화하지 않아도 변이가 이벤트를 변형할 수 있으므로 계속 진행합니다.
//!
//! 변이 연산자(append/modify/del)가 처음 실행될 때 이벤트를 깊은
//! 복사하고, 이후 연산자는 그 사본을 봅니다 (copy-on-first-write).
//! 입력 이벤트 원본은 평가 후에도 변하지 않습니다.
//!
//! 이벤트 단위 장애는 밖으로 전파되지 않습니다 -- 로그를 남기고 해당
//! 연산자의 진리값을 결정적(false)으로 만듭니다.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use rulehub_core::config::EngineConfig;
use rulehub_core::event::{Event, Value, append_hit_rule_id};
use rulehub_core::metrics as m;
use rulehub_core::plugin::ReturnType;
use rulehub_core::store::CounterStore;

use crate::check::{self, BaseCheck};
use crate::field::{FieldCache, FieldCachePool, remove_path, set_path};
use crate::regex_cache::{RegexResultCache, shared_compiled_cache};
use crate::ruleset::{
    AppendOp, CheckOp, ChecklistOp, CountType, DelOp, IteratorOp, Mode, ModifyOp, OperatorKind,
    PluginArg, PluginCall, PluginOp, Rule, Ruleset, ThresholdOp,
};
use crate::threshold::{
    LocalThresholdStore, SharedThresholdStore, ThresholdBackend, classify_item_key, group_key,
};

/// 룰 하나의 실행 결과
struct RuleOutcome {
    /// 모든 진리 연산자가 true였는지
    truth: bool,
    /// 변이가 있었다면 룰 로컬 작업 사본
    working: Option<Value>,
}

/// 컴파일된 룰셋의 이벤트 실행기
///
/// 워커 태스크들이 `Arc<Executor>`로 공유합니다. 이벤트별 상태는 전부
/// 지역(필드 캐시, 작업 사본)이므로 `execute`는 동시 호출이 안전합니다.
pub struct Executor {
    ruleset: Ruleset,
    result_cache: RegexResultCache,
    pool: FieldCachePool,
    local_store: RwLock<Option<Arc<LocalThresholdStore>>>,
    shared_store: Option<Arc<SharedThresholdStore>>,
    local_cache_max_bytes: u64,
}

impl Executor {
    /// 실행기를 생성합니다. 임계치 캐시는 [`Executor::open_caches`]로 엽니다.
    pub fn new(
        ruleset: Ruleset,
        config: &EngineConfig,
        shared: Option<Arc<dyn CounterStore>>,
    ) -> Self {
        Self {
            result_cache: RegexResultCache::new(config.regex_result_cache_size),
            pool: FieldCachePool::new(),
            local_store: RwLock::new(None),
            shared_store: shared.map(|store| Arc::new(SharedThresholdStore::new(store))),
            local_cache_max_bytes: config.local_cache_max_bytes,
            ruleset,
        }
    }

    /// 컴파일된 룰셋을 반환합니다.
    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    /// 공유 스토어 없이 시작할 수 없는 룰셋인지 확인합니다.
    pub fn requires_shared_store(&self) -> bool {
        self.ruleset.has_shared_thresholds() && self.shared_store.is_none()
    }

    /// 임계치 캐시를 엽니다 (로컬 캐시 임계치가 선언된 경우에만 생성).
    pub fn open_caches(&self) {
        if self.ruleset.has_local_thresholds() {
            *self.local_store.write() =
                Some(Arc::new(LocalThresholdStore::new(self.local_cache_max_bytes)));
        }
    }

    /// 임계치 캐시와 정규식 결과 캐시를 정리합니다 (룰셋 정지 시).
    pub fn close_caches(&self) {
        if let Some(store) = self.local_store.write().take() {
            store.clear();
        }
        self.result_cache.clear();
    }

    /// 이벤트 하나를 평가하고 방출할 이벤트 목록을 반환합니다.
    pub async fn execute(&self, event: Event) -> Vec<Event> {
        let base = Value::Object(event);
        match self.ruleset.mode {
            Mode::Detection => self.execute_detection(base).await,
            Mode::Exclude => self.execute_exclude(base).await,
        }
    }

    async fn execute_detection(&self, base: Value) -> Vec<Event> {
        let mut out = Vec::new();
        for rule in &self.ruleset.rules {
            let mut cache = self.pool.acquire();
            let outcome = self.run_rule(rule, &base, &mut cache, true).await;
            self.pool.release(cache);

            if outcome.truth {
                let mut emitted = outcome.working.unwrap_or_else(|| base.clone());
                if let Value::Object(map) = &mut emitted {
                    append_hit_rule_id(map, &format!("{}.{}", self.ruleset.id, rule.id));
                }
                if let Value::Object(map) = emitted {
                    out.push(map);
                }
            }
        }
        out
    }

    async fn execute_exclude(&self, base: Value) -> Vec<Event> {
        let mut current = base;
        for rule in &self.ruleset.rules {
            let mut cache = self.pool.acquire();
            let outcome = self.run_rule(rule, &current, &mut cache, false).await;
            self.pool.release(cache);

            if let Some(mutated) = outcome.working {
                current = mutated;
            }
            if outcome.truth {
                return Vec::new();
            }
        }
        match current {
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        }
    }

    async fn run_rule(
        &self,
        rule: &Rule,
        base: &Value,
        cache: &mut FieldCache,
        detection: bool,
    ) -> RuleOutcome {
        let mut truth = true;
        let mut working: Option<Value> = None;

        for (kind, op_id) in &rule.queue {
            match kind {
                OperatorKind::Check => {
                    let Some(op) = rule.checks.get(op_id) else { continue };
                    let current = working.as_ref().unwrap_or(base);
                    if !self.eval_check(op, current, cache) {
                        truth = false;
                        if detection {
                            break;
                        }
                    }
                }
                OperatorKind::Checklist => {
                    let Some(op) = rule.checklists.get(op_id) else { continue };
                    let current = working.as_ref().unwrap_or(base);
                    if !self.eval_checklist(op, current, cache, &rule.id).await {
                        truth = false;
                        if detection {
                            break;
                        }
                    }
                }
                OperatorKind::Threshold => {
                    let Some(op) = rule.thresholds.get(op_id) else { continue };
                    let current = working.as_ref().unwrap_or(base);
                    if !self.eval_threshold(op, current, cache, &rule.id).await {
                        truth = false;
                        if detection {
                            break;
                        }
                    }
                }
                OperatorKind::Iterator => {
                    let Some(op) = rule.iterators.get(op_id) else { continue };
                    let current = working.as_ref().unwrap_or(base);
                    if !self.eval_iterator(op, current, cache, &rule.id).await {
                        truth = false;
                        if detection {
                            break;
                        }
                    }
                }
                OperatorKind::Append => {
                    let Some(op) = rule.appends.get(op_id) else { continue };
                    let working = working.get_or_insert_with(|| base.clone());
                    self.apply_append(op, working, cache);
                    cache.clear();
                }
                OperatorKind::Modify => {
                    let Some(op) = rule.modifies.get(op_id) else { continue };
                    let working = working.get_or_insert_with(|| base.clone());
                    self.apply_modify(op, working, cache);
                    cache.clear();
                }
                OperatorKind::Del => {
                    let Some(op) = rule.deletes.get(op_id) else { continue };
                    let working = working.get_or_insert_with(|| base.clone());
                    Self::apply_delete(op, working);
                    cache.clear();
                }
                OperatorKind::Plugin => {
                    let Some(op) = rule.plugins.get(op_id) else { continue };
                    let current = working.as_ref().unwrap_or(base);
                    self.apply_plugin(op, current, cache);
                }
            }
        }

        RuleOutcome { truth, working }
    }

    // ─── 진리 연산자 ─────────────────────────────────────────────────

    fn eval_check(&self, op: &CheckOp, current: &Value, cache: &mut FieldCache) -> bool {
        match op.kind.base {
            BaseCheck::Plugin => {
                let Some(call) = &op.plugin else { return false };
                let args = resolve_args(call, current, cache);
                match call.plugin.call_bool(&args) {
                    Ok(result) => {
                        if op.negate_plugin {
                            !result
                        } else {
                            result
                        }
                    }
                    Err(err) => {
                        metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                        tracing::warn!(plugin = %call.name, error = %err, "plugin check failed");
                        false
                    }
                }
            }
            BaseCheck::IsNull => {
                let (exists, text) = self.fetch_field(op, current, cache);
                check::is_null(exists, &text)
            }
            BaseCheck::NotNull => {
                let (_, text) = self.fetch_field(op, current, cache);
                check::not_null(&text)
            }
            BaseCheck::Regex => {
                let (_, text) = self.fetch_field(op, current, cache);
                self.eval_regex(op, &text, current, cache)
            }
            _ => {
                let (_, text) = self.fetch_field(op, current, cache);
                self.eval_string_tokens(op, &text, current, cache)
            }
        }
    }

    fn fetch_field(&self, op: &CheckOp, current: &Value, cache: &mut FieldCache) -> (bool, String) {
        match &op.field {
            Some(path) => {
                let entry = cache.fetch(current, path);
                (entry.exists, entry.text.clone())
            }
            None => (false, String::new()),
        }
    }

    fn eval_string_tokens(
        &self,
        op: &CheckOp,
        text: &str,
        current: &Value,
        cache: &mut FieldCache,
    ) -> bool {
        let mut matched = op.logic == check::Logic::And;
        for template in &op.values {
            let compare = template.expand(current, cache);
            let (token_matched, _) =
                check::string_predicate(op.kind.base, op.kind.ncs, text, &compare);
            match op.logic {
                check::Logic::And => {
                    if !token_matched {
                        return false;
                    }
                    matched = true;
                }
                check::Logic::Or => {
                    if token_matched {
                        return true;
                    }
                    matched = false;
                }
            }
        }
        matched
    }

    fn eval_regex(
        &self,
        op: &CheckOp,
        text: &str,
        current: &Value,
        cache: &mut FieldCache,
    ) -> bool {
        let input = if op.kind.ncs {
            text.to_lowercase()
        } else {
            text.to_owned()
        };

        // 컴파일 타임 상수 단일 패턴: 결과 캐시 사용
        if let Some(static_regex) = &op.static_regex {
            if let Some(hit) = self.result_cache.get(static_regex.id, &input) {
                return hit;
            }
            let (matched, _) = check::regex_predicate(&static_regex.regex, &input);
            self.result_cache.put(static_regex.id, &input, matched);
            return matched;
        }

        // 동적 패턴 또는 다중 토큰: 전개된 패턴은 이벤트마다 달라지므로
        // 결과 캐시를 건너뛰고 공유 컴파일 캐시만 거칩니다.
        let mut matched = op.logic == check::Logic::And;
        for template in &op.values {
            let mut pattern = template.expand(current, cache);
            if op.kind.ncs {
                pattern = pattern.to_lowercase();
            }
            let token_matched = match shared_compiled_cache().get_or_compile(&pattern) {
                Ok(regex) => check::regex_predicate(&regex, &input).0,
                Err(err) => {
                    tracing::debug!(pattern = %pattern, error = %err, "expanded regex failed to compile");
                    false
                }
            };
            match op.logic {
                check::Logic::And => {
                    if !token_matched {
                        return false;
                    }
                    matched = true;
                }
                check::Logic::Or => {
                    if token_matched {
                        return true;
                    }
                    matched = false;
                }
            }
        }
        matched
    }

    async fn eval_checklist(
        &self,
        op: &ChecklistOp,
        current: &Value,
        cache: &mut FieldCache,
        rule_id: &str,
    ) -> bool {
        match &op.condition {
            // 암묵적 AND -- 단락 가능
            None => {
                for check in &op.checks {
                    if !self.eval_check(check, current, cache) {
                        return false;
                    }
                }
                for threshold in &op.thresholds {
                    if !self.eval_threshold(threshold, current, cache, rule_id).await {
                        return false;
                    }
                }
                true
            }
            // 조건식 -- 모든 멤버를 평가해 진리값 맵을 만든 뒤 AST 평가
            Some(condition) => {
                let mut truth = HashMap::new();
                for check in &op.checks {
                    if let Some(id) = &check.member_id {
                        truth.insert(id.clone(), self.eval_check(check, current, cache));
                    }
                }
                for threshold in &op.thresholds {
                    if let Some(id) = &threshold.member_id {
                        truth.insert(
                            id.clone(),
                            self.eval_threshold(threshold, current, cache, rule_id).await,
                        );
                    }
                }
                match condition.evaluate(&truth) {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(condition = condition.raw(), error = %err, "condition evaluation failed");
                        false
                    }
                }
            }
        }
    }

    async fn eval_threshold(
        &self,
        op: &ThresholdOp,
        current: &Value,
        cache: &mut FieldCache,
        rule_id: &str,
    ) -> bool {
        // 그룹 값 수집 -- 부재 필드는 빈 문자열로 투영됩니다.
        let mut values = Vec::with_capacity(op.group_by.len());
        for path in &op.group_by {
            values.push(cache.fetch(current, path).text.clone());
        }
        let key = group_key(op.count_type, &op.group_prefix, &values);

        let backend: Arc<dyn ThresholdBackend> = if op.local_cache {
            match self.local_store.read().clone() {
                Some(store) => store as Arc<dyn ThresholdBackend>,
                None => {
                    tracing::error!(
                        ruleset = %self.ruleset.id,
                        rule = rule_id,
                        "local threshold cache is not open"
                    );
                    return false;
                }
            }
        } else {
            match &self.shared_store {
                Some(store) => Arc::clone(store) as Arc<dyn ThresholdBackend>,
                None => {
                    tracing::error!(
                        ruleset = %self.ruleset.id,
                        rule = rule_id,
                        "shared counter store is not configured"
                    );
                    return false;
                }
            }
        };

        let result = match op.count_type {
            CountType::Count => backend.freq_add(&key, 1, op.range_secs, op.value).await,
            CountType::Sum => {
                let text = match &op.count_field {
                    Some(path) => cache.fetch(current, path).text.clone(),
                    None => String::new(),
                };
                let delta = match text.trim().parse::<f64>() {
                    Ok(value) => value as i64,
                    Err(_) => {
                        tracing::debug!(
                            ruleset = %self.ruleset.id,
                            rule = rule_id,
                            value = %text,
                            "non-numeric count_field value, skipping threshold"
                        );
                        return false;
                    }
                };
                backend.freq_add(&key, delta, op.range_secs, op.value).await
            }
            CountType::Classify => {
                let item = match &op.count_field {
                    Some(path) => cache.fetch(current, path).text.clone(),
                    None => String::new(),
                };
                let item_key = classify_item_key(&key, &item);
                backend
                    .classify_add(&item_key, &key, op.range_secs, op.value)
                    .await
            }
        };

        match result {
            Ok(fired) => {
                if fired {
                    metrics::counter!(m::ENGINE_THRESHOLD_FIRES_TOTAL).increment(1);
                }
                fired
            }
            Err(err) => {
                metrics::counter!(m::ENGINE_BACKEND_ERRORS_TOTAL).increment(1);
                tracing::error!(
                    ruleset = %self.ruleset.id,
                    rule = rule_id,
                    group = %key,
                    error = %err,
                    "threshold backend error"
                );
                false
            }
        }
    }

    async fn eval_iterator(
        &self,
        op: &IteratorOp,
        current: &Value,
        cache: &mut FieldCache,
        rule_id: &str,
    ) -> bool {
        // 배열, 또는 배열로 파싱되는 JSON 문자열만 허용합니다.
        let elements: Vec<Value> = {
            let entry = cache.fetch(current, &op.field);
            match &entry.value {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
                    Ok(Value::Array(items)) => items,
                    _ => return false,
                },
                _ => return false,
            }
        };
        if elements.is_empty() {
            return false;
        }

        for element in elements {
            // 요소를 변수에 바인딩한 단일 키 서브 컨텍스트
            let mut binding = HashMap::new();
            binding.insert(op.variable.clone(), element);
            let sub_event = Value::Object(binding);
            let mut sub_cache = self.pool.acquire();

            let mut element_ok = true;
            for check in &op.checks {
                if !self.eval_check(check, &sub_event, &mut sub_cache) {
                    element_ok = false;
                    break;
                }
            }
            if element_ok {
                for checklist in &op.checklists {
                    if !self
                        .eval_checklist(checklist, &sub_event, &mut sub_cache, rule_id)
                        .await
                    {
                        element_ok = false;
                        break;
                    }
                }
            }
            if element_ok {
                for threshold in &op.thresholds {
                    if !self
                        .eval_threshold(threshold, &sub_event, &mut sub_cache, rule_id)
                        .await
                    {
                        element_ok = false;
                        break;
                    }
                }
            }
            self.pool.release(sub_cache);

            if op.any && element_ok {
                return true;
            }
            if !op.any && !element_ok {
                return false;
            }
        }
        !op.any
    }

    // ─── 변이 연산자 ─────────────────────────────────────────────────

    fn apply_append(&self, op: &AppendOp, working: &mut Value, cache: &mut FieldCache) {
        let Some(call) = &op.plugin else {
            // 리터럴 모드 -- `_$` 전개 후 문자열로 기록
            let text = op.value.expand(working, cache);
            if let Some(path) = &op.field_path {
                if !set_path(working, path, Value::String(text)) {
                    tracing::debug!(field = %op.field_raw, "append target not writable");
                }
            }
            return;
        };

        let args = resolve_args(call, working, cache);
        match call.plugin.spec().return_type {
            ReturnType::Bool => match call.plugin.call_bool(&args) {
                Ok(result) => match &op.field_path {
                    Some(path) => {
                        set_path(working, path, Value::Bool(result));
                    }
                    None => {
                        metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                        tracing::error!(
                            plugin = %call.name,
                            "append to _$ORIDATA requires a map return, got bool; dropping append"
                        );
                    }
                },
                Err(err) => {
                    metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                    tracing::error!(plugin = %call.name, error = %err, "append plugin failed");
                }
            },
            ReturnType::Any => match call.plugin.call_any(&args) {
                Ok((value, _)) => match &op.field_path {
                    Some(path) => {
                        set_path(working, path, value);
                    }
                    None => {
                        if matches!(value, Value::Object(_)) {
                            *working = value;
                        } else {
                            metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                            tracing::error!(
                                plugin = %call.name,
                                got = value.type_name(),
                                "append to _$ORIDATA requires a map return; dropping append"
                            );
                        }
                    }
                },
                Err(err) => {
                    metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                    tracing::error!(plugin = %call.name, error = %err, "append plugin failed");
                }
            },
        }
    }

    fn apply_modify(&self, op: &ModifyOp, working: &mut Value, cache: &mut FieldCache) {
        let Some(call) = &op.plugin else {
            // 리터럴 덮어쓰기 (field는 컴파일 타임에 보장됨)
            let text = op.value.expand(working, cache);
            if let Some(path) = &op.field_path {
                set_path(working, path, Value::String(text));
            }
            return;
        };

        let args = resolve_args(call, working, cache);
        match call.plugin.spec().return_type {
            ReturnType::Bool => match call.plugin.call_bool(&args) {
                Ok(result) => {
                    if let Some(path) = &op.field_path {
                        set_path(working, path, Value::Bool(result));
                    }
                }
                Err(err) => {
                    metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                    tracing::error!(plugin = %call.name, error = %err, "modify plugin failed");
                }
            },
            ReturnType::Any => match call.plugin.call_any(&args) {
                Ok((value, _)) => match &op.field_path {
                    Some(path) => {
                        set_path(working, path, value);
                    }
                    None => {
                        if matches!(value, Value::Object(_)) {
                            *working = value;
                        } else {
                            metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                            tracing::error!(
                                plugin = %call.name,
                                got = value.type_name(),
                                "modify event replacement requires a map return; dropping modify"
                            );
                        }
                    }
                },
                Err(err) => {
                    metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
                    tracing::error!(plugin = %call.name, error = %err, "modify plugin failed");
                }
            },
        }
    }

    fn apply_delete(op: &DelOp, working: &mut Value) {
        for path in &op.paths {
            remove_path(working, path);
        }
    }

    fn apply_plugin(&self, op: &PluginOp, current: &Value, cache: &mut FieldCache) {
        let args = resolve_args(&op.call, current, cache);
        let result = match op.call.plugin.spec().return_type {
            ReturnType::Bool => op.call.plugin.call_bool(&args).map(|_| ()),
            ReturnType::Any => op.call.plugin.call_any(&args).map(|_| ()),
        };
        if let Err(err) = result {
            metrics::counter!(m::ENGINE_PLUGIN_FAILURES_TOTAL).increment(1);
            tracing::error!(plugin = %op.call.name, error = %err, "side-effect plugin failed");
        }
    }
}

/// 플러그인 인자를 현재 이벤트에 대해 해석합니다.
///
/// 해석되지 않는 필드 참조는 빈 문자열로 치환됩니다.
fn resolve_args(call: &PluginCall, current: &Value, cache: &mut FieldCache) -> Vec<Value> {
    call.args
        .iter()
        .map(|arg| match arg {
            PluginArg::Literal(value) => value.clone(),
            PluginArg::FieldRef(path) => {
                let entry = cache.fetch(current, path);
                if entry.exists {
                    entry.value.clone().unwrap_or(Value::Null)
                } else {
                    Value::String(String::new())
                }
            }
            PluginArg::OriData => current.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use rulehub_core::event::HIT_RULE_KEY;
    use rulehub_core::plugin::{Plugin, PluginRegistry};

    use crate::ruleset::compile;

    fn event(json: &str) -> Event {
        serde_json::from_str(json).unwrap()
    }

    fn executor(xml: &str, registry: &PluginRegistry) -> Executor {
        let ruleset = compile(xml, registry).unwrap();
        let exec = Executor::new(ruleset, &EngineConfig::default(), None);
        exec.open_caches();
        exec
    }

    fn detection(rules: &str) -> String {
        format!(r#"<ruleset id="rs" type="DETECTION">{rules}</ruleset>"#)
    }

    fn exclude(rules: &str) -> String {
        format!(r#"<ruleset id="rs" type="EXCLUDE">{rules}</ruleset>"#)
    }

    #[tokio::test]
    async fn detection_annotates_hit_rule_id() {
        let exec = executor(
            &detection(r#"<rule id="r1"><check type="EQU" field="user">alice</check></rule>"#),
            &PluginRegistry::new(),
        );
        let out = exec.execute(event(r#"{"user":"Alice"}"#)).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][HIT_RULE_KEY], Value::String("rs.r1".to_owned()));
        assert_eq!(out[0]["user"], Value::String("Alice".to_owned()));
    }

    #[tokio::test]
    async fn detection_non_match_emits_nothing() {
        let exec = executor(
            &detection(r#"<rule id="r1"><check type="EQU" field="user">alice</check></rule>"#),
            &PluginRegistry::new(),
        );
        assert!(exec.execute(event(r#"{"user":"bob"}"#)).await.is_empty());
        assert!(exec.execute(event(r#"{}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn empty_detection_ruleset_emits_nothing() {
        let exec = executor(&detection(""), &PluginRegistry::new());
        assert!(exec.execute(event(r#"{"a":1}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn empty_exclude_ruleset_passes_through() {
        let exec = executor(&exclude(""), &PluginRegistry::new());
        let input = event(r#"{"a":1}"#);
        let out = exec.execute(input.clone()).await;
        assert_eq!(out, vec![input]);
    }

    #[tokio::test]
    async fn multiple_detection_rules_emit_multiple_copies() {
        let exec = executor(
            &detection(
                r#"<rule id="r1"><check type="NOTNULL" field="user"></check></rule>
                   <rule id="r2"><check type="NOTNULL" field="user"></check></rule>"#,
            ),
            &PluginRegistry::new(),
        );
        let out = exec.execute(event(r#"{"user":"x"}"#)).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0][HIT_RULE_KEY], Value::String("rs.r1".to_owned()));
        assert_eq!(out[1][HIT_RULE_KEY], Value::String("rs.r2".to_owned()));
    }

    #[tokio::test]
    async fn input_event_is_never_mutated() {
        let exec = executor(
            &detection(
                r#"<rule id="r1">
                    <append field="tag">marked</append>
                    <del>secret</del>
                </rule>"#,
            ),
            &PluginRegistry::new(),
        );
        let input = event(r#"{"user":"x","secret":"s"}"#);
        let out = exec.execute(input.clone()).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["tag"], Value::String("marked".to_owned()));
        assert!(!out[0].contains_key("secret"));
        // 원본은 그대로
        assert_eq!(input["secret"], Value::String("s".to_owned()));
        assert!(!input.contains_key("tag"));
    }

    #[tokio::test]
    async fn exclude_drops_matching_and_mutates_passing() {
        let exec = executor(
            &exclude(
                r#"<rule id="r1">
                    <append field="seen">true</append>
                    <check type="EQU" field="user">test</check>
                </rule>"#,
            ),
            &PluginRegistry::new(),
        );

        // 매칭 → 드롭
        assert!(exec.execute(event(r#"{"user":"test"}"#)).await.is_empty());

        // 비매칭 → 변이가 적용된 단일 이벤트
        let out = exec.execute(event(r#"{"user":"bob"}"#)).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["seen"], Value::String("true".to_owned()));
        assert_eq!(out[0]["user"], Value::String("bob".to_owned()));
    }

    #[tokio::test]
    async fn exclude_carries_mutations_across_rules() {
        let exec = executor(
            &exclude(
                r#"<rule id="r1"><append field="first">1</append><check type="EQU" field="user">zzz</check></rule>
                   <rule id="r2"><append field="second">2</append><check type="EQU" field="user">yyy</check></rule>"#,
            ),
            &PluginRegistry::new(),
        );
        let out = exec.execute(event(r#"{"user":"bob"}"#)).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["first"], Value::String("1".to_owned()));
        assert_eq!(out[0]["second"], Value::String("2".to_owned()));
    }

    #[tokio::test]
    async fn detection_short_circuits_on_false() {
        let calls = Arc::new(Mutex::new(0));
        let registry = PluginRegistry::new();
        let calls_clone = Arc::clone(&calls);
        registry
            .register(Plugin::new_bool("probe", vec![], move |_| {
                *calls_clone.lock().unwrap() += 1;
                Ok(true)
            }))
            .unwrap();

        let exec = executor(
            &detection(
                r#"<rule id="r1">
                    <check type="EQU" field="user">nobody</check>
                    <check type="PLUGIN">probe()</check>
                </rule>"#,
            ),
            &registry,
        );
        exec.execute(event(r#"{"user":"alice"}"#)).await;
        // 첫 check가 false → 이후 연산자는 실행되지 않음
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn exclude_continues_after_false() {
        let exec = executor(
            &exclude(
                r#"<rule id="r1">
                    <check type="EQU" field="user">nobody</check>
                    <append field="touched">yes</append>
                </rule>"#,
            ),
            &PluginRegistry::new(),
        );
        let out = exec.execute(event(r#"{"user":"alice"}"#)).await;
        // 룰은 발화하지 않았지만 변이는 적용됨
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["touched"], Value::String("yes".to_owned()));
    }

    #[tokio::test]
    async fn checklist_condition_evaluation() {
        let xml = detection(
            r#"<rule id="r1">
                <checklist condition="(a or b) and not c">
                    <check id="a" type="INCL" field="msg">login</check>
                    <check id="b" type="INCL" field="msg">auth</check>
                    <check id="c" type="EQU" field="user">root</check>
                </checklist>
            </rule>"#,
        );
        let exec = executor(&xml, &PluginRegistry::new());

        let out = exec
            .execute(event(r#"{"msg":"user login","user":"bob"}"#))
            .await;
        assert_eq!(out.len(), 1);

        let out = exec
            .execute(event(r#"{"msg":"user login","user":"root"}"#))
            .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn checklist_implicit_and() {
        let xml = detection(
            r#"<rule id="r1">
                <checklist>
                    <check type="INCL" field="msg">a</check>
                    <check type="INCL" field="msg">b</check>
                </checklist>
            </rule>"#,
        );
        let exec = executor(&xml, &PluginRegistry::new());
        assert_eq!(exec.execute(event(r#"{"msg":"ab"}"#)).await.len(), 1);
        assert!(exec.execute(event(r#"{"msg":"a"}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn iterator_any_and_all() {
        let any_xml = detection(
            r#"<rule id="r1">
                <iterator type="ANY" field="events" variable="ev">
                    <check type="EQU" field="ev.code">FAIL</check>
                </iterator>
            </rule>"#,
        );
        let exec = executor(&any_xml, &PluginRegistry::new());
        assert_eq!(
            exec.execute(event(r#"{"events":[{"code":"OK"},{"code":"FAIL"}]}"#))
                .await
                .len(),
            1
        );
        assert!(
            exec.execute(event(r#"{"events":[{"code":"OK"}]}"#))
                .await
                .is_empty()
        );
        // 빈 배열은 false
        assert!(exec.execute(event(r#"{"events":[]}"#)).await.is_empty());
        // 배열이 아닌 값은 false
        assert!(exec.execute(event(r#"{"events":42}"#)).await.is_empty());

        let all_xml = detection(
            r#"<rule id="r1">
                <iterator type="ALL" field="events" variable="ev">
                    <check type="EQU" field="ev.code">FAIL</check>
                </iterator>
            </rule>"#,
        );
        let exec = executor(&all_xml, &PluginRegistry::new());
        assert_eq!(
            exec.execute(event(r#"{"events":[{"code":"FAIL"},{"code":"FAIL"}]}"#))
                .await
                .len(),
            1
        );
        assert!(
            exec.execute(event(r#"{"events":[{"code":"FAIL"},{"code":"OK"}]}"#))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn iterator_accepts_json_string_array() {
        let xml = detection(
            r#"<rule id="r1">
                <iterator type="ANY" field="raw" variable="item">
                    <check type="EQU" field="item">x</check>
                </iterator>
            </rule>"#,
        );
        let exec = executor(&xml, &PluginRegistry::new());
        let out = exec
            .execute(event(r#"{"raw":"[\"a\",\"x\"]"}"#))
            .await;
        assert_eq!(out.len(), 1);
        // 배열로 파싱되지 않는 문자열은 false
        assert!(exec.execute(event(r#"{"raw":"not json"}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn threshold_local_count_fires_on_fourth() {
        let xml = detection(
            r#"<rule id="r1">
                <threshold group_by="src" range="10" value="3" local_cache="true"/>
            </rule>"#,
        );
        let exec = executor(&xml, &PluginRegistry::new());
        for i in 1..=3 {
            assert!(
                exec.execute(event(r#"{"src":"10.0.0.1"}"#)).await.is_empty(),
                "event {i}"
            );
        }
        let out = exec.execute(event(r#"{"src":"10.0.0.1"}"#)).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][HIT_RULE_KEY], Value::String("rs.r1".to_owned()));

        // 다른 그룹 키는 독립 카운트
        assert!(exec.execute(event(r#"{"src":"10.0.0.2"}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn placeholder_expansion_in_append() {
        let xml = detection(
            r#"<rule id="r1">
                <append field="msg">user _$user connected; literal \_$user</append>
            </rule>"#,
        );
        let exec = executor(&xml, &PluginRegistry::new());
        let out = exec.execute(event(r#"{"user":"alice"}"#)).await;
        assert_eq!(
            out[0]["msg"],
            Value::String("user alice connected; literal _$user".to_owned())
        );

        // 부재 필드 참조는 리터럴로 남습니다.
        let xml = detection(r#"<rule id="r1"><append field="m">_$ghost</append></rule>"#);
        let exec = executor(&xml, &PluginRegistry::new());
        let out = exec.execute(event(r#"{}"#)).await;
        assert_eq!(out[0]["m"], Value::String("_$ghost".to_owned()));
    }

    #[tokio::test]
    async fn append_plugin_value_and_oridata_replacement() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_any("wrap", vec![], |args| {
                let mut map = HashMap::new();
                map.insert("wrapped".to_owned(), args.first().cloned().unwrap_or(Value::Null));
                Ok(Value::Object(map))
            }))
            .unwrap();
        registry
            .register(Plugin::new_bool("yes", vec![], |_| Ok(true)))
            .unwrap();

        let xml = detection(
            r#"<rule id="r1">
                <append field="flag" type="PLUGIN">yes()</append>
                <append field="_$ORIDATA" type="PLUGIN">wrap(user)</append>
            </rule>"#,
        );
        let exec = executor(&xml, &registry);
        let out = exec.execute(event(r#"{"user":"bob"}"#)).await;
        assert_eq!(out.len(), 1);
        // wrap이 이벤트 전체를 교체했으므로 flag는 사라지고 wrapped만 남음
        assert_eq!(out[0]["wrapped"], Value::String("bob".to_owned()));
        assert!(out[0].contains_key(HIT_RULE_KEY));
    }

    #[tokio::test]
    async fn append_oridata_with_non_map_return_is_dropped() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_any("scalar", vec![], |_| Ok(Value::Int(1))))
            .unwrap();
        let xml = detection(
            r#"<rule id="r1"><append field="_$ORIDATA" type="PLUGIN">scalar()</append></rule>"#,
        );
        let exec = executor(&xml, &registry);
        let out = exec.execute(event(r#"{"user":"bob"}"#)).await;
        // append는 드롭되지만 룰은 계속 발화
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["user"], Value::String("bob".to_owned()));
    }

    #[tokio::test]
    async fn modify_literal_and_plugin_replacement() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_any("redact", vec![], |args| {
                let Some(Value::Object(map)) = args.first() else {
                    return Ok(Value::Null);
                };
                let mut map = map.clone();
                map.remove("password");
                Ok(Value::Object(map))
            }))
            .unwrap();

        let xml = detection(
            r#"<rule id="r1">
                <modify field="user">anonymous</modify>
                <modify type="PLUGIN">redact(_$ORIDATA)</modify>
            </rule>"#,
        );
        let exec = executor(&xml, &registry);
        let out = exec
            .execute(event(r#"{"user":"bob","password":"hunter2"}"#))
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["user"], Value::String("anonymous".to_owned()));
        assert!(!out[0].contains_key("password"));
    }

    #[tokio::test]
    async fn plugin_failure_does_not_poison_event() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_bool("broken", vec![], |_| {
                Err(rulehub_core::error::PluginError::Invocation {
                    name: "broken".to_owned(),
                    reason: "boom".to_owned(),
                })
            }))
            .unwrap();

        // 부수효과 플러그인의 실패는 룰 진리값에 영향이 없습니다.
        let xml = detection(
            r#"<rule id="r1">
                <plugin>broken()</plugin>
                <check type="NOTNULL" field="user"></check>
            </rule>"#,
        );
        let exec = executor(&xml, &registry);
        assert_eq!(exec.execute(event(r#"{"user":"x"}"#)).await.len(), 1);

        // PLUGIN check의 실패는 결정적으로 false입니다.
        let xml = detection(r#"<rule id="r1"><check type="PLUGIN">broken()</check></rule>"#);
        let exec = executor(&xml, &registry);
        assert!(exec.execute(event(r#"{"user":"x"}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn negated_plugin_check() {
        let registry = PluginRegistry::new();
        registry
            .register(Plugin::new_bool("always", vec![], |_| Ok(true)))
            .unwrap();
        let xml = detection(r#"<rule id="r1"><check type="PLUGIN">!always()</check></rule>"#);
        let exec = executor(&xml, &registry);
        assert!(exec.execute(event(r#"{}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn plugin_args_resolved_against_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new();
        let seen_clone = Arc::clone(&seen);
        registry
            .register(Plugin::new_bool("record", vec![], move |args| {
                seen_clone.lock().unwrap().push(args.to_vec());
                Ok(true)
            }))
            .unwrap();

        let xml = detection(
            r#"<rule id="r1"><check type="PLUGIN">record(user, 7, "lit", missing)</check></rule>"#,
        );
        let exec = executor(&xml, &registry);
        exec.execute(event(r#"{"user":"alice"}"#)).await;

        let calls = seen.lock().unwrap();
        let args = &calls[0];
        assert_eq!(args[0], Value::String("alice".to_owned()));
        assert_eq!(args[1], Value::Int(7));
        assert_eq!(args[2], Value::String("lit".to_owned()));
        // 부재 필드 참조는 빈 문자열
        assert_eq!(args[3], Value::String(String::new()));
    }

    #[tokio::test]
    async fn multivalue_check_logic() {
        let or_xml = detection(
            r#"<rule id="r1"><check type="INCL" field="msg" delimiter="|" logic="OR">alpha|beta</check></rule>"#,
        );
        let exec = executor(&or_xml, &PluginRegistry::new());
        assert_eq!(exec.execute(event(r#"{"msg":"has beta"}"#)).await.len(), 1);
        assert!(exec.execute(event(r#"{"msg":"none"}"#)).await.is_empty());

        let and_xml = detection(
            r#"<rule id="r1"><check type="INCL" field="msg" delimiter="|" logic="AND">alpha|beta</check></rule>"#,
        );
        let exec = executor(&and_xml, &PluginRegistry::new());
        assert_eq!(
            exec.execute(event(r#"{"msg":"alpha and beta"}"#)).await.len(),
            1
        );
        assert!(exec.execute(event(r#"{"msg":"only alpha"}"#)).await.is_empty());
    }

    #[tokio::test]
    async fn mutation_invalidates_field_cache() {
        // append가 필드를 바꾼 뒤 같은 필드를 읽는 check는 새 값을 봐야 합니다.
        let xml = detection(
            r#"<rule id="r1">
                <append field="user">rewritten</append>
                <check type="EQU" field="user">rewritten</check>
            </rule>"#,
        );
        let exec = executor(&xml, &PluginRegistry::new());
        assert_eq!(exec.execute(event(r#"{"user":"original"}"#)).await.len(), 1);
    }

    #[tokio::test]
    async fn dynamic_regex_pattern_from_event() {
        let xml = detection(
            r#"<rule id="r1"><check type="REGEX" field="msg">^_$prefix</check></rule>"#,
        );
        let exec = executor(&xml, &PluginRegistry::new());
        assert_eq!(
            exec.execute(event(r#"{"msg":"abc123","prefix":"abc"}"#)).await.len(),
            1
        );
        assert!(
            exec.execute(event(r#"{"msg":"xyz","prefix":"abc"}"#))
                .await
                .is_empty()
        );
    }
}
