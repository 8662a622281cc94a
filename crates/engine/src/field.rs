//! 필드 경로 해석 -- 점 구분 경로 파싱, 이벤트 문서 탐색, 이벤트별 조회 캐시
//!
//! 경로 문법: 세그먼트는 `.`로 구분하고, `\.`는 세그먼트 내부의 리터럴
//! 점을 뜻하며, `#`으로 시작하는 세그먼트는 0 기반 배열 인덱스입니다.
//! 존재하지 않는 경로는 0값이 아니라 "부재"로 보고됩니다 (null 값,
//! 범위 밖 인덱스, 경로 도중의 스칼라 포함).
//!
//! [`FieldCache`]는 한 이벤트를 평가하는 동안 `(경로) → 결과`를 메모하여
//! 같은 필드를 여러 check가 읽을 때 탐색을 한 번으로 줄입니다.
//! 캐시는 [`FieldCachePool`]에서 빌려 쓰고 반납하며, 획득 시 비워집니다.

use std::collections::HashMap;

use parking_lot::Mutex;

use rulehub_core::event::{ORIDATA, REF_PREFIX, Value};

// ─── 경로 ────────────────────────────────────────────────────────────

/// 경로 세그먼트
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    /// 맵 키
    Key(String),
    /// `#N` 형태의 배열 인덱스
    Index(usize),
}

/// 파싱된 필드 경로
///
/// 빌드 시 한 번 파싱하여 평가 경로에서 재파싱을 없앱니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    /// 경로 문자열을 파싱합니다.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("empty field path".to_owned());
        }

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'.') => {
                    chars.next();
                    current.push('.');
                }
                '.' => Self::push_segment(&mut segments, &mut current)?,
                _ => current.push(c),
            }
        }
        Self::push_segment(&mut segments, &mut current)?;

        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    fn push_segment(segments: &mut Vec<Segment>, current: &mut String) -> Result<(), String> {
        if current.is_empty() {
            return Err("empty path segment".to_owned());
        }
        let segment = if let Some(index) = current.strip_prefix('#') {
            let index: usize = index
                .parse()
                .map_err(|_| format!("invalid array index segment '#{index}'"))?;
            Segment::Index(index)
        } else {
            Segment::Key(current.clone())
        };
        segments.push(segment);
        current.clear();
        Ok(())
    }

    /// 원본 경로 문자열을 반환합니다.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// 이벤트 문서에서 경로를 해석합니다.
    ///
    /// 키 부재, 범위 밖 인덱스, null 값, 경로 도중의 스칼라는 모두
    /// `None`(부재)입니다.
    pub fn resolve<'a>(&self, event: &'a Value) -> Option<&'a Value> {
        let mut current = event;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Key(key), Value::Array(items)) => {
                    // 시퀀스에서는 세그먼트를 숫자 인덱스로 재해석합니다.
                    let index: usize = key.parse().ok()?;
                    items.get(index)?
                }
                (Segment::Index(index), Value::Array(items)) => items.get(*index)?,
                _ => return None,
            };
        }
        if current.is_null() { None } else { Some(current) }
    }
}

/// 경로가 가리키는 위치에 값을 기록합니다.
///
/// 경로 도중의 누락된 맵 키는 빈 맵으로 생성하고, 스칼라를 가로지르는
/// 경로나 범위 밖 인덱스는 기록 없이 `false`를 반환합니다.
pub fn set_path(root: &mut Value, path: &FieldPath, value: Value) -> bool {
    let Some((last, init)) = path.segments.split_last() else {
        return false;
    };

    let mut current = root;
    for segment in init {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map
                .entry(key.clone())
                .or_insert_with(|| Value::Object(HashMap::new())),
            (Segment::Index(index), Value::Array(items)) => match items.get_mut(*index) {
                Some(slot) => slot,
                None => return false,
            },
            _ => return false,
        };
    }

    match (last, current) {
        (Segment::Key(key), Value::Object(map)) => {
            map.insert(key.clone(), value);
            true
        }
        (Segment::Index(index), Value::Array(items)) => match items.get_mut(*index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
        _ => false,
    }
}

/// 경로의 가장 깊은 키를 포함 맵에서 제거합니다.
///
/// 탐색 실패는 조용히 성공으로 처리합니다 (지울 것이 없음).
/// 실제로 제거했으면 `true`를 반환합니다.
pub fn remove_path(root: &mut Value, path: &FieldPath) -> bool {
    let Some((last, init)) = path.segments.split_last() else {
        return false;
    };

    let mut current = root;
    for segment in init {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => match map.get_mut(key) {
                Some(next) => next,
                None => return false,
            },
            (Segment::Index(index), Value::Array(items)) => match items.get_mut(*index) {
                Some(slot) => slot,
                None => return false,
            },
            _ => return false,
        };
    }

    match (last, current) {
        (Segment::Key(key), Value::Object(map)) => map.remove(key).is_some(),
        _ => false,
    }
}

// ─── 이벤트별 필드 캐시 ──────────────────────────────────────────────

/// 필드 조회 결과
#[derive(Debug, Clone, Default)]
pub struct FieldEntry {
    /// 경로 존재 여부
    pub exists: bool,
    /// 정규 문자열 투영 (부재 시 빈 문자열)
    pub text: String,
    /// 타입 있는 값 (부재 시 None)
    pub value: Option<Value>,
}

/// 이벤트별 필드 조회 캐시
///
/// 한 이벤트 평가 동안 단일 워커 태스크만 접근합니다.
/// 변이 연산자가 실행되면 호출자가 [`FieldCache::clear`]로 무효화합니다.
#[derive(Debug, Default)]
pub struct FieldCache {
    entries: HashMap<String, FieldEntry>,
}

impl FieldCache {
    /// 빈 캐시를 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 캐시를 비웁니다.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 경로를 해석하고 결과를 메모합니다.
    pub fn fetch(&mut self, event: &Value, path: &FieldPath) -> &FieldEntry {
        self.entries
            .entry(path.raw().to_owned())
            .or_insert_with(|| match path.resolve(event) {
                Some(value) => FieldEntry {
                    exists: true,
                    text: value.projected(),
                    value: Some(value.clone()),
                },
                None => FieldEntry::default(),
            })
    }

    /// 캐시된 엔트리 수를 반환합니다 (테스트용).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 캐시가 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 필드 캐시 프리리스트
///
/// 이벤트마다 캐시를 새로 할당하지 않도록 재사용합니다.
#[derive(Debug, Default)]
pub struct FieldCachePool {
    caches: Mutex<Vec<FieldCache>>,
}

impl FieldCachePool {
    /// 빈 풀을 생성합니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 캐시를 하나 빌립니다. 반환되는 캐시는 비어 있습니다.
    pub fn acquire(&self) -> FieldCache {
        match self.caches.lock().pop() {
            Some(mut cache) => {
                cache.clear();
                cache
            }
            None => FieldCache::new(),
        }
    }

    /// 캐시를 반납합니다.
    pub fn release(&self, cache: FieldCache) {
        self.caches.lock().push(cache);
    }
}

// ─── 동적 참조 템플릿 ────────────────────────────────────────────────

/// 템플릿 조각
#[derive(Debug, Clone)]
enum TemplatePart {
    /// 리터럴 텍스트 (`\_$` 이스케이프는 이미 풀린 상태)
    Literal(String),
    /// `_$path` 동적 참조. `path`가 None이면 파싱 불가 -- 리터럴로 남습니다.
    Field { raw: String, path: Option<FieldPath> },
}

/// `_$path` 참조가 포함될 수 있는 컴파일된 문자열 템플릿
///
/// check 비교 문자열과 append/modify 리터럴 값에 쓰입니다.
/// 참조가 해석되지 않으면 `_$path` 텍스트를 그대로 남깁니다 (에러 아님).
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    parts: Vec<TemplatePart>,
    dynamic: bool,
}

/// 참조 경로에 쓰일 수 있는 문자인지 확인합니다.
fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '#' | '-')
}

/// `_$ORIDATA` 센티널의 참조 텍스트 부분 (`ORIDATA`)
fn oridata_ref() -> &'static str {
    ORIDATA.trim_start_matches(REF_PREFIX)
}

impl Template {
    /// 템플릿 문자열을 컴파일합니다.
    pub fn parse(raw: &str) -> Self {
        let mut parts: Vec<TemplatePart> = Vec::new();
        let mut literal = String::new();
        let mut rest = raw;

        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix("\\_$") {
                literal.push_str("_$");
                rest = tail;
                continue;
            }
            if let Some(tail) = rest.strip_prefix("_$") {
                let end = tail.find(|c| !is_ref_char(c)).unwrap_or(tail.len());
                let ref_text = &tail[..end];
                if ref_text.is_empty() {
                    literal.push_str("_$");
                    rest = tail;
                    continue;
                }
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                let path = if ref_text == oridata_ref() {
                    None
                } else {
                    FieldPath::parse(ref_text).ok()
                };
                parts.push(TemplatePart::Field {
                    raw: ref_text.to_owned(),
                    path,
                });
                rest = &tail[end..];
                continue;
            }
            // 다음 특수 시퀀스까지 리터럴로 소비
            let mut chars = rest.char_indices();
            let (_, c) = chars.next().unwrap_or((0, '\0'));
            literal.push(c);
            rest = &rest[c.len_utf8()..];
        }

        if !literal.is_empty() {
            parts.push(TemplatePart::Literal(literal));
        }

        let dynamic = parts
            .iter()
            .any(|p| matches!(p, TemplatePart::Field { .. }));

        Self {
            raw: raw.to_owned(),
            parts,
            dynamic,
        }
    }

    /// 원본 템플릿 문자열을 반환합니다.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// 동적 참조 포함 여부 -- 포함 시 정규식 결과 캐시를 건너뜁니다.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// 현재 이벤트에 대해 템플릿을 전개합니다.
    pub fn expand(&self, event: &Value, cache: &mut FieldCache) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Field { raw, path } => {
                    if raw == oridata_ref() {
                        out.push_str(&event.projected());
                        continue;
                    }
                    match path {
                        Some(path) => {
                            let entry = cache.fetch(event, path);
                            if entry.exists {
                                out.push_str(&entry.text);
                            } else {
                                out.push_str("_$");
                                out.push_str(raw);
                            }
                        }
                        None => {
                            out.push_str("_$");
                            out.push_str(raw);
                        }
                    }
                }
            }
        }
        out
    }
}
