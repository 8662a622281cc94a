//! Check 라이브러리 -- 문자열/숫자/null/정규식 원시 술어
//!
//! 모든 술어는 `(이벤트 문자열, 비교 문자열) → (매칭 여부, 매칭 텍스트)`
//! 의 단일 시그니처를 따릅니다. 매칭 텍스트 채널은 REGEX가 매칭된 부분
//! 문자열을 하류 보강 연산자에 넘기기 위해 존재합니다.
//!
//! 보존해야 하는 역사적 에지 케이스:
//! - START/END/NSTART/NEND/INCL은 비교 문자열이 비면 `true`
//! - 이벤트 문자열이 비고 비교 문자열이 비지 않으면 위 술어들은 `false`
//! - NI/NCS_NI는 이벤트 문자열이 비면 `true`
//! - EQU/NEQ는 NCS 접두어 없이도 대소문자 무시

use regex::Regex;

/// 원시 술어 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseCheck {
    /// 대소문자 무시 완전 일치
    Equ,
    /// 대소문자 무시 불일치
    Neq,
    /// 접두사
    Start,
    /// 접미사
    End,
    /// 접두사 부정
    NStart,
    /// 접미사 부정
    NEnd,
    /// 부분 문자열 포함
    Incl,
    /// 부분 문자열 부재
    Ni,
    /// 숫자 초과 (둘 다 f64 파싱, 실패 시 false)
    Mt,
    /// 숫자 미만
    Lt,
    /// 정규식 (패턴이 스스로 앵커를 지정)
    Regex,
    /// 빈 문자열 또는 필드 부재
    IsNull,
    /// 공백 제거 후 비어있지 않음
    NotNull,
    /// 등록된 bool 플러그인 호출
    Plugin,
}

/// 파싱된 check 타입 -- 원시 술어와 NCS(대소문자 무시) 변형 여부
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckKind {
    /// 원시 술어
    pub base: BaseCheck,
    /// `NCS_` 접두어 여부
    pub ncs: bool,
}

impl CheckKind {
    /// 룰셋 소스의 `type` 속성값을 파싱합니다.
    pub fn parse(name: &str) -> Option<Self> {
        let (ncs, bare) = match name.strip_prefix("NCS_") {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        let base = match bare {
            "EQU" => BaseCheck::Equ,
            "NEQ" => BaseCheck::Neq,
            "START" => BaseCheck::Start,
            "END" => BaseCheck::End,
            "NSTART" => BaseCheck::NStart,
            "NEND" => BaseCheck::NEnd,
            "INCL" => BaseCheck::Incl,
            "NI" => BaseCheck::Ni,
            "MT" => BaseCheck::Mt,
            "LT" => BaseCheck::Lt,
            "REGEX" => BaseCheck::Regex,
            "ISNULL" => BaseCheck::IsNull,
            "NOTNULL" => BaseCheck::NotNull,
            "PLUGIN" => BaseCheck::Plugin,
            _ => return None,
        };
        // NCS 변형이 의미 있는 술어만 허용합니다.
        if ncs
            && !matches!(
                base,
                BaseCheck::Equ
                    | BaseCheck::Neq
                    | BaseCheck::Start
                    | BaseCheck::End
                    | BaseCheck::NStart
                    | BaseCheck::NEnd
                    | BaseCheck::Incl
                    | BaseCheck::Ni
                    | BaseCheck::Regex
            )
        {
            return None;
        }
        Some(Self { base, ncs })
    }

    /// 체크리스트 내부 재배열용 평가 비용 계층.
    ///
    /// ISNULL/NOTNULL(필드 파싱 불필요) → 문자열/숫자 → REGEX → PLUGIN.
    /// 체크리스트 결합자는 가환이므로 재배열해도 의미가 보존됩니다.
    pub fn tier(&self) -> u8 {
        match self.base {
            BaseCheck::IsNull | BaseCheck::NotNull => 0,
            BaseCheck::Regex => 2,
            BaseCheck::Plugin => 3,
            _ => 1,
        }
    }
}

/// 다중값 check의 토큰 결합 로직
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    /// 모든 토큰이 매칭
    And,
    /// 하나라도 매칭
    Or,
}

impl Logic {
    /// 룰셋 소스의 `logic` 속성값을 파싱합니다.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "AND" => Some(Self::And),
            "OR" => Some(Self::Or),
            _ => None,
        }
    }
}

/// 문자열/숫자 원시 술어를 평가합니다.
///
/// REGEX/ISNULL/NOTNULL/PLUGIN은 이 함수의 대상이 아닙니다 (실행기가
/// 필드 존재 여부, 컴파일된 정규식, 플러그인 핸들과 함께 처리).
pub fn string_predicate(
    base: BaseCheck,
    ncs: bool,
    event_str: &str,
    compare: &str,
) -> (bool, String) {
    let matched = match base {
        BaseCheck::Equ => event_str.to_lowercase() == compare.to_lowercase(),
        BaseCheck::Neq => event_str.to_lowercase() != compare.to_lowercase(),
        BaseCheck::Start | BaseCheck::End | BaseCheck::NStart | BaseCheck::NEnd
        | BaseCheck::Incl => {
            if compare.is_empty() {
                true
            } else if event_str.is_empty() {
                false
            } else {
                let (ev, cmp) = normalized(ncs, event_str, compare);
                match base {
                    BaseCheck::Start => ev.starts_with(&cmp),
                    BaseCheck::End => ev.ends_with(&cmp),
                    BaseCheck::NStart => !ev.starts_with(&cmp),
                    BaseCheck::NEnd => !ev.ends_with(&cmp),
                    BaseCheck::Incl => ev.contains(&cmp),
                    _ => unreachable!(),
                }
            }
        }
        BaseCheck::Ni => {
            if event_str.is_empty() {
                true
            } else {
                let (ev, cmp) = normalized(ncs, event_str, compare);
                !ev.contains(&cmp)
            }
        }
        BaseCheck::Mt => match (event_str.parse::<f64>(), compare.parse::<f64>()) {
            (Ok(ev), Ok(cmp)) => ev > cmp,
            _ => false,
        },
        BaseCheck::Lt => match (event_str.parse::<f64>(), compare.parse::<f64>()) {
            (Ok(ev), Ok(cmp)) => ev < cmp,
            _ => false,
        },
        BaseCheck::Regex
        | BaseCheck::IsNull
        | BaseCheck::NotNull
        | BaseCheck::Plugin => false,
    };

    if matched {
        (true, event_str.to_owned())
    } else {
        (false, String::new())
    }
}

fn normalized(ncs: bool, event_str: &str, compare: &str) -> (String, String) {
    if ncs {
        (event_str.to_lowercase(), compare.to_lowercase())
    } else {
        (event_str.to_owned(), compare.to_owned())
    }
}

/// 정규식 술어를 평가합니다. 매칭된 부분 문자열을 반환합니다.
pub fn regex_predicate(re: &Regex, event_str: &str) -> (bool, String) {
    match re.find(event_str) {
        Some(m) => (true, m.as_str().to_owned()),
        None => (false, String::new()),
    }
}

/// ISNULL: 필드 부재 또는 빈 문자열이면 매칭
pub fn is_null(exists: bool, text: &str) -> bool {
    !exists || text.is_empty()
}

/// NOTNULL: 공백 제거 후 비어있지 않으면 매칭
pub fn not_null(text: &str) -> bool {
    !text.trim().is_empty()
}
