//! 이벤트 문서 모델 — 느슨하게 타입된 중첩 key/value 문서
//!
//! 업스트림 채널로 유입되는 모든 이벤트는 [`Event`] (문자열 키의 중첩 맵)로
//! 표현됩니다. 값은 [`Value`] 재귀 합 타입으로, 스칼라/배열/객체를 모두
//! 담을 수 있습니다. 이벤트는 유입 시점 이후 불변이며, 변이 연산자는
//! 룰 실행기가 만든 깊은 복사본에만 적용됩니다.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// 이벤트 문서 — 최상위는 항상 문자열 키의 맵입니다.
pub type Event = HashMap<String, Value>;

/// 매칭된 룰 ID가 누적되는 예약 필드 (`,` 구분)
pub const HIT_RULE_KEY: &str = "_hub_hit_rule_id";

/// 엔진 예약 필드 접두어 — 사용자 룰이 새 식별자로 쓸 수 없습니다.
pub const RESERVED_PREFIX: &str = "_hub";

/// 동적 참조(`_$path`) 접두어
pub const REF_PREFIX: &str = "_$";

/// "현재 이벤트 문서 전체"를 뜻하는 센티널 — 실제 키로는 절대 존재하지 않습니다.
pub const ORIDATA: &str = "_$ORIDATA";

/// 이벤트 문서의 값 타입
///
/// JSON과 동형인 재귀 합 타입입니다. `#[serde(untagged)]` 덕분에
/// JSON 문서와 직접 상호 변환됩니다 (정수는 `Int`, 나머지 수는 `Float`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// null
    Null,
    /// 불리언
    Bool(bool),
    /// 부호 있는 정수
    Int(i64),
    /// 부동소수
    Float(f64),
    /// 문자열
    String(String),
    /// 순서 있는 시퀀스
    Array(Vec<Value>),
    /// 중첩 맵
    Object(HashMap<String, Value>),
}

impl Value {
    /// 값의 정규 문자열 투영을 반환합니다.
    ///
    /// 스칼라는 자연스러운 텍스트 형태, 맵/시퀀스는 JSON 직렬화입니다.
    /// `Null`은 빈 문자열로 투영됩니다.
    pub fn projected(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::Array(_) | Self::Object(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }

    /// 값 유형 이름을 반환합니다 (에러 메시지용).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    /// null 여부를 확인합니다.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// 객체이면 내부 맵 참조를 반환합니다.
    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// 객체이면 내부 맵 가변 참조를 반환합니다.
    pub fn as_object_mut(&mut self) -> Option<&mut HashMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// 시퀀스이면 요소 슬라이스를 반환합니다.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// 문자열이면 참조를 반환합니다.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.projected())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.into_iter().map(|(k, v)| (k, Self::from(v))).collect(),
            ),
        }
    }
}

/// 매칭 룰 ID를 `_hub_hit_rule_id`에 누적합니다.
///
/// 기존 값은 `,`로 분리된 ID 목록으로 해석하며, 같은 ID를 두 번
/// 추가하는 것은 no-op입니다. 기존 값이 문자열이 아니면 문자열 투영을
/// 기준으로 이어 붙입니다.
pub fn append_hit_rule_id(event: &mut Event, hit_id: &str) {
    let joined = match event.get(HIT_RULE_KEY) {
        Some(existing) => {
            let current = existing.projected();
            if current.split(',').any(|id| id == hit_id) {
                return;
            }
            if current.is_empty() {
                hit_id.to_owned()
            } else {
                format!("{current},{hit_id}")
            }
        }
        None => hit_id.to_owned(),
    };
    event.insert(HIT_RULE_KEY.to_owned(), Value::String(joined));
}
