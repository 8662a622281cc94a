//! 룰셋 소스 문서 파싱 -- XML을 라인 정보가 붙은 소스 AST로 변환
//!
//! 루트 요소 `<ruleset>`은 `type ∈ {DETECTION, EXCLUDE}`를 가지며,
//! `<rule>` 요소의 자식들이 작성자가 의도한 순서 그대로 연산자 목록이
//! 됩니다. 여기서는 구문만 다루고, 의미 검증(중복 ID, 임계치 범위,
//! 플러그인 해석 등)은 컴파일 단계가 수행합니다.
//!
//! 각 노드는 소스 문서의 라인 번호를 보존하여 검증 리포트가
//! 문제 요소의 위치를 가리킬 수 있게 합니다.

use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;

use crate::error::EngineError;

// ─── 소스 AST ────────────────────────────────────────────────────────

/// 파싱된 룰셋 소스 문서
#[derive(Debug, Clone)]
pub struct SourceRuleset {
    /// `type` 속성 원문 (DETECTION / EXCLUDE)
    pub mode: String,
    /// 룰셋 ID (`id` 속성, 없으면 `name`)
    pub id: String,
    /// 룰셋 이름
    pub name: String,
    /// 작성자
    pub author: String,
    /// 선언 순서의 룰 목록
    pub rules: Vec<SourceRule>,
    /// 루트 요소 라인
    pub line: u64,
}

/// 파싱된 룰
#[derive(Debug, Clone)]
pub struct SourceRule {
    /// 룰 ID (룰셋 내 유일)
    pub id: String,
    /// 룰 이름
    pub name: String,
    /// 작성 순서 그대로의 연산자 목록
    pub ops: Vec<SourceOp>,
    /// 라인
    pub line: u64,
}

/// 연산자 소스 요소 (작성 순서 보존)
#[derive(Debug, Clone)]
pub enum SourceOp {
    /// `<check>`
    Check(SourceCheck),
    /// `<checklist>`
    Checklist(SourceChecklist),
    /// `<threshold>`
    Threshold(SourceThreshold),
    /// `<iterator>`
    Iterator(SourceIterator),
    /// `<append>`
    Append(SourceAppend),
    /// `<modify>`
    Modify(SourceModify),
    /// `<del>`
    Del(SourceDel),
    /// `<plugin>`
    Plugin(SourcePlugin),
}

/// `<check>` 요소
#[derive(Debug, Clone)]
pub struct SourceCheck {
    /// 멤버 ID -- 체크리스트가 `condition`을 선언할 때만 필수
    pub id: Option<String>,
    /// 술어 이름 (`EQU`, `NCS_INCL`, ...)
    pub check_type: String,
    /// 대상 필드 경로 (PLUGIN check는 생략 가능)
    pub field: Option<String>,
    /// 다중값 결합 로직 (`AND`/`OR`)
    pub logic: Option<String>,
    /// 다중값 구분자
    pub delimiter: Option<String>,
    /// 비교 문자열 (요소 텍스트)
    pub value: String,
    /// 라인
    pub line: u64,
}

/// `<checklist>` 요소
#[derive(Debug, Clone)]
pub struct SourceChecklist {
    /// 불리언 조건식 (없으면 암묵적 AND)
    pub condition: Option<String>,
    /// 멤버 check 목록
    pub checks: Vec<SourceCheck>,
    /// 멤버 threshold 목록
    pub thresholds: Vec<SourceThreshold>,
    /// 라인
    pub line: u64,
}

/// `<threshold>` 요소
#[derive(Debug, Clone)]
pub struct SourceThreshold {
    /// 멤버 ID (체크리스트 내부에서 사용)
    pub id: Option<String>,
    /// 그룹화 필드 경로 (쉼표 구분)
    pub group_by: String,
    /// 윈도우 길이 (`30s`, `5m`, `1h`, `2d` 또는 초 단위 정수)
    pub range: String,
    /// 임계값 (양의 정수)
    pub value: String,
    /// 집계 모드 (``/`SUM`/`CLASSIFY`)
    pub count_type: String,
    /// SUM/CLASSIFY의 대상 필드
    pub count_field: String,
    /// 로컬 캐시 사용 여부
    pub local_cache: bool,
    /// 라인
    pub line: u64,
}

/// `<iterator>` 요소
#[derive(Debug, Clone)]
pub struct SourceIterator {
    /// `ANY` 또는 `ALL`
    pub iter_type: String,
    /// 배열 값 필드 경로
    pub field: String,
    /// 요소 바인딩 변수 이름
    pub variable: String,
    /// 내부 check 멤버
    pub checks: Vec<SourceCheck>,
    /// 내부 checklist 멤버
    pub checklists: Vec<SourceChecklist>,
    /// 내부 threshold 멤버
    pub thresholds: Vec<SourceThreshold>,
    /// 라인
    pub line: u64,
}

/// `<append>` 요소
#[derive(Debug, Clone)]
pub struct SourceAppend {
    /// 기록 대상 필드 (`_$ORIDATA` 허용)
    pub field: String,
    /// `PLUGIN`이면 플러그인 모드
    pub append_type: Option<String>,
    /// 리터럴 값 또는 플러그인 호출식 (요소 텍스트)
    pub value: String,
    /// 라인
    pub line: u64,
}

/// `<modify>` 요소
#[derive(Debug, Clone)]
pub struct SourceModify {
    /// 덮어쓸 필드 -- 플러그인 모드에서는 생략 가능 (이벤트 전체 교체)
    pub field: Option<String>,
    /// `PLUGIN`이면 플러그인 모드
    pub modify_type: Option<String>,
    /// 리터럴 값 또는 플러그인 호출식 (요소 텍스트)
    pub value: String,
    /// 라인
    pub line: u64,
}

/// `<del>` 요소 -- 텍스트는 쉼표로 구분된 경로 목록
#[derive(Debug, Clone)]
pub struct SourceDel {
    /// 삭제할 경로 목록 원문
    pub paths: String,
    /// 라인
    pub line: u64,
}

/// `<plugin>` 요소 -- 부수효과용 플러그인 호출
#[derive(Debug, Clone)]
pub struct SourcePlugin {
    /// 플러그인 호출식 (요소 텍스트)
    pub value: String,
    /// 라인
    pub line: u64,
}

// ─── 일반 XML 트리 ───────────────────────────────────────────────────

/// 요소 이름/속성/텍스트/자식을 담는 중간 트리 노드
#[derive(Debug, Clone, Default)]
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    line: u64,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn attr_owned(&self, name: &str) -> Option<String> {
        self.attr(name).map(str::to_owned)
    }
}

/// 바이트 오프셋을 1 기반 라인 번호로 변환합니다.
fn line_of(src: &str, pos: usize) -> u64 {
    let upto = &src.as_bytes()[..pos.min(src.len())];
    upto.iter().filter(|&&b| b == b'\n').count() as u64 + 1
}

fn decode_name(raw: &[u8], line: u64) -> Result<String, EngineError> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|e| EngineError::build(line, "invalid element name", e.to_string()))
}

fn node_from_start(
    e: &quick_xml::events::BytesStart<'_>,
    line: u64,
) -> Result<XmlNode, EngineError> {
    let name = decode_name(e.name().as_ref(), line)?;
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr =
            attr.map_err(|err| EngineError::build(line, "malformed attribute", err.to_string()))?;
        let key = decode_name(attr.key.as_ref(), line)?;
        let value = attr
            .unescape_value()
            .map_err(|err| EngineError::build(line, "malformed attribute value", err.to_string()))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(XmlNode {
        name,
        attrs,
        line,
        ..XmlNode::default()
    })
}

/// XML 텍스트를 중간 트리로 파싱합니다.
fn parse_tree(src: &str) -> Result<XmlNode, EngineError> {
    let mut reader = Reader::from_str(src);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        let line = line_of(src, reader.buffer_position());
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                stack.push(node_from_start(&e, line)?);
            }
            Ok(XmlEvent::Empty(e)) => {
                let node = node_from_start(&e, line)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => {
                        return Err(EngineError::build(
                            line,
                            "multiple root elements",
                            node.name,
                        ));
                    }
                }
            }
            Ok(XmlEvent::Text(t)) => {
                let text = t.unescape().map_err(|err| {
                    EngineError::build(line, "malformed text content", err.to_string())
                })?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(text.trim());
                }
            }
            Ok(XmlEvent::CData(t)) => {
                if let Some(top) = stack.last_mut() {
                    top.text
                        .push_str(String::from_utf8_lossy(&t.into_inner()).trim());
                }
            }
            Ok(XmlEvent::End(_)) => {
                let Some(node) = stack.pop() else {
                    return Err(EngineError::build(line, "unbalanced closing tag", ""));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => {
                        return Err(EngineError::build(
                            line,
                            "multiple root elements",
                            node.name,
                        ));
                    }
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(EngineError::build(line, "xml syntax error", err.to_string()));
            }
        }
    }

    if !stack.is_empty() {
        return Err(EngineError::build(
            line_of(src, src.len()),
            "unclosed element",
            stack
                .last()
                .map(|n| n.name.clone())
                .unwrap_or_default(),
        ));
    }

    root.ok_or_else(|| EngineError::build(1, "empty ruleset source", ""))
}

// ─── 트리 → 소스 AST 매핑 ────────────────────────────────────────────

fn map_check(node: &XmlNode) -> Result<SourceCheck, EngineError> {
    let check_type = node.attr_owned("type").ok_or_else(|| {
        EngineError::build(node.line, "check missing 'type' attribute", "")
    })?;
    Ok(SourceCheck {
        id: node.attr_owned("id"),
        check_type,
        field: node.attr_owned("field"),
        logic: node.attr_owned("logic"),
        delimiter: node.attr_owned("delimiter"),
        value: node.text.clone(),
        line: node.line,
    })
}

fn map_threshold(node: &XmlNode) -> Result<SourceThreshold, EngineError> {
    Ok(SourceThreshold {
        id: node.attr_owned("id"),
        group_by: node.attr_owned("group_by").unwrap_or_default(),
        range: node.attr_owned("range").unwrap_or_default(),
        value: node.attr_owned("value").unwrap_or_default(),
        count_type: node.attr_owned("count_type").unwrap_or_default(),
        count_field: node.attr_owned("count_field").unwrap_or_default(),
        local_cache: node
            .attr("local_cache")
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        line: node.line,
    })
}

fn map_checklist(node: &XmlNode) -> Result<SourceChecklist, EngineError> {
    let mut checks = Vec::new();
    let mut thresholds = Vec::new();
    for child in &node.children {
        match child.name.as_str() {
            "check" => checks.push(map_check(child)?),
            "threshold" => thresholds.push(map_threshold(child)?),
            other => {
                return Err(EngineError::build(
                    child.line,
                    "unexpected element in checklist",
                    other,
                ));
            }
        }
    }
    Ok(SourceChecklist {
        condition: node.attr_owned("condition"),
        checks,
        thresholds,
        line: node.line,
    })
}

fn map_iterator(node: &XmlNode) -> Result<SourceIterator, EngineError> {
    let mut checks = Vec::new();
    let mut checklists = Vec::new();
    let mut thresholds = Vec::new();
    for child in &node.children {
        match child.name.as_str() {
            "check" => checks.push(map_check(child)?),
            "checklist" => checklists.push(map_checklist(child)?),
            "threshold" => thresholds.push(map_threshold(child)?),
            other => {
                return Err(EngineError::build(
                    child.line,
                    "unexpected element in iterator",
                    other,
                ));
            }
        }
    }
    Ok(SourceIterator {
        iter_type: node.attr_owned("type").unwrap_or_default(),
        field: node.attr_owned("field").unwrap_or_default(),
        variable: node.attr_owned("variable").unwrap_or_default(),
        checks,
        checklists,
        thresholds,
        line: node.line,
    })
}

fn map_rule(node: &XmlNode) -> Result<SourceRule, EngineError> {
    let id = node
        .attr_owned("id")
        .ok_or_else(|| EngineError::build(node.line, "rule missing 'id' attribute", ""))?;

    let mut ops = Vec::new();
    for child in &node.children {
        let op = match child.name.as_str() {
            "check" => SourceOp::Check(map_check(child)?),
            "checklist" => SourceOp::Checklist(map_checklist(child)?),
            "threshold" => SourceOp::Threshold(map_threshold(child)?),
            "iterator" => SourceOp::Iterator(map_iterator(child)?),
            "append" => SourceOp::Append(SourceAppend {
                field: child.attr_owned("field").unwrap_or_default(),
                append_type: child.attr_owned("type"),
                value: child.text.clone(),
                line: child.line,
            }),
            "modify" => SourceOp::Modify(SourceModify {
                field: child.attr_owned("field"),
                modify_type: child.attr_owned("type"),
                value: child.text.clone(),
                line: child.line,
            }),
            "del" => SourceOp::Del(SourceDel {
                paths: child.text.clone(),
                line: child.line,
            }),
            "plugin" => SourceOp::Plugin(SourcePlugin {
                value: child.text.clone(),
                line: child.line,
            }),
            other => {
                return Err(EngineError::build(
                    child.line,
                    "unknown operator element",
                    other,
                ));
            }
        };
        ops.push(op);
    }

    Ok(SourceRule {
        id,
        name: node.attr_owned("name").unwrap_or_default(),
        ops,
        line: node.line,
    })
}

/// 룰셋 소스 텍스트를 소스 AST로 파싱합니다.
pub fn parse_source(src: &str) -> Result<SourceRuleset, EngineError> {
    let root = parse_tree(src)?;

    if root.name != "ruleset" {
        return Err(EngineError::build(
            root.line,
            "root element must be <ruleset>",
            root.name,
        ));
    }

    let mode = root.attr_owned("type").ok_or_else(|| {
        EngineError::build(root.line, "ruleset missing 'type' attribute", "")
    })?;

    let name = root.attr_owned("name").unwrap_or_default();
    let id = root.attr_owned("id").unwrap_or_else(|| name.clone());
    if id.is_empty() {
        return Err(EngineError::build(
            root.line,
            "ruleset requires an 'id' or 'name' attribute",
            "",
        ));
    }

    let mut rules = Vec::new();
    for child in &root.children {
        match child.name.as_str() {
            "rule" => rules.push(map_rule(child)?),
            other => {
                return Err(EngineError::build(
                    child.line,
                    "unexpected element in ruleset",
                    other,
                ));
            }
        }
    }

    Ok(SourceRuleset {
        mode,
        id,
        name,
        author: root.attr_owned("author").unwrap_or_default(),
        rules,
        line: root.line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<ruleset id="rs" name="demo" author="team" type="DETECTION">
    <rule id="r1" name="first">
        <check type="EQU" field="user">alice</check>
        <checklist condition="(a or b) and not c">
            <check id="a" type="INCL" field="msg">login</check>
            <check id="b" type="INCL" field="msg">auth</check>
            <check id="c" type="EQU" field="user">root</check>
        </checklist>
        <threshold group_by="src" range="10s" value="3" local_cache="true"/>
        <iterator type="ANY" field="events" variable="ev">
            <check type="EQU" field="ev.code">FAIL</check>
        </iterator>
        <append field="tag">seen _$user</append>
        <modify field="user">anonymous</modify>
        <del>tmp.a,tmp.b</del>
        <plugin>notify(user)</plugin>
    </rule>
</ruleset>"#;

    #[test]
    fn parses_full_document() {
        let source = parse_source(SAMPLE).unwrap();
        assert_eq!(source.mode, "DETECTION");
        assert_eq!(source.id, "rs");
        assert_eq!(source.author, "team");
        assert_eq!(source.rules.len(), 1);

        let rule = &source.rules[0];
        assert_eq!(rule.id, "r1");
        assert_eq!(rule.ops.len(), 8);
    }

    #[test]
    fn operator_order_is_preserved() {
        let source = parse_source(SAMPLE).unwrap();
        let kinds: Vec<&str> = source.rules[0]
            .ops
            .iter()
            .map(|op| match op {
                SourceOp::Check(_) => "check",
                SourceOp::Checklist(_) => "checklist",
                SourceOp::Threshold(_) => "threshold",
                SourceOp::Iterator(_) => "iterator",
                SourceOp::Append(_) => "append",
                SourceOp::Modify(_) => "modify",
                SourceOp::Del(_) => "del",
                SourceOp::Plugin(_) => "plugin",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "check",
                "checklist",
                "threshold",
                "iterator",
                "append",
                "modify",
                "del",
                "plugin"
            ]
        );
    }

    #[test]
    fn checklist_members_parsed() {
        let source = parse_source(SAMPLE).unwrap();
        let SourceOp::Checklist(checklist) = &source.rules[0].ops[1] else {
            panic!("expected checklist");
        };
        assert_eq!(checklist.condition.as_deref(), Some("(a or b) and not c"));
        assert_eq!(checklist.checks.len(), 3);
        assert_eq!(checklist.checks[0].id.as_deref(), Some("a"));
        assert_eq!(checklist.checks[0].value, "login");
    }

    #[test]
    fn threshold_attributes_parsed() {
        let source = parse_source(SAMPLE).unwrap();
        let SourceOp::Threshold(threshold) = &source.rules[0].ops[2] else {
            panic!("expected threshold");
        };
        assert_eq!(threshold.group_by, "src");
        assert_eq!(threshold.range, "10s");
        assert_eq!(threshold.value, "3");
        assert!(threshold.local_cache);
        assert!(threshold.count_type.is_empty());
    }

    #[test]
    fn lines_point_to_source_elements() {
        let source = parse_source(SAMPLE).unwrap();
        assert_eq!(source.line, 1);
        assert_eq!(source.rules[0].line, 2);
        let SourceOp::Check(check) = &source.rules[0].ops[0] else {
            panic!("expected check");
        };
        assert_eq!(check.line, 3);
    }

    #[test]
    fn missing_rule_id_is_error() {
        let src = r#"<ruleset id="rs" type="DETECTION"><rule name="x"/></ruleset>"#;
        let err = parse_source(src).unwrap_err();
        assert!(err.to_string().contains("rule missing 'id'"));
    }

    #[test]
    fn missing_type_is_error() {
        let src = r#"<ruleset id="rs"><rule id="r1"/></ruleset>"#;
        assert!(parse_source(src).is_err());
    }

    #[test]
    fn unknown_operator_is_error() {
        let src = r#"<ruleset id="rs" type="DETECTION"><rule id="r1"><frobnicate/></rule></ruleset>"#;
        let err = parse_source(src).unwrap_err();
        assert!(err.to_string().contains("unknown operator"));
    }

    #[test]
    fn unbalanced_document_is_error() {
        assert!(parse_source("<ruleset type=\"DETECTION\" id=\"rs\">").is_err());
        assert!(parse_source("").is_err());
    }

    #[test]
    fn name_falls_back_as_id() {
        let src = r#"<ruleset name="only-name" type="EXCLUDE"/>"#;
        let source = parse_source(src).unwrap();
        assert_eq!(source.id, "only-name");
        assert!(source.rules.is_empty());
    }

    #[test]
    fn escaped_text_content_is_unescaped() {
        let src = r#"<ruleset id="rs" type="DETECTION"><rule id="r1"><check type="INCL" field="m">a &amp; b</check></rule></ruleset>"#;
        let source = parse_source(src).unwrap();
        let SourceOp::Check(check) = &source.rules[0].ops[0] else {
            panic!("expected check");
        };
        assert_eq!(check.value, "a & b");
    }
}
