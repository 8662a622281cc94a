//! 체크리스트 불리언 표현식 -- 토크나이저, 재귀 하강 파서, AST 평가
//!
//! 문법: 식별자(`[A-Za-z0-9_-]+`), `and`, `or`, `not`, 괄호, 공백.
//! 연산자는 소문자만 인정합니다. 우선순위는 `not` > `and` > `or`,
//! 좌결합입니다. 표현식은 룰셋 빌드 시 한 번 파싱되어 AST로 보관되고,
//! 이벤트마다 멤버 진리값 맵에 대해 AST를 순회합니다.

use std::collections::{HashMap, HashSet};

/// 표현식 AST 노드
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprNode {
    /// 체크리스트 멤버 ID 참조
    Ident(String),
    /// 논리 부정
    Not(Box<ExprNode>),
    /// 논리곱
    And(Box<ExprNode>, Box<ExprNode>),
    /// 논리합
    Or(Box<ExprNode>, Box<ExprNode>),
}

/// 컴파일된 체크리스트 조건식
#[derive(Debug, Clone)]
pub struct Condition {
    raw: String,
    root: ExprNode,
    idents: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // 연산자는 소문자만 인정합니다. 다른 대소문자 조합은 식별자로
                // 취급되어 선언되지 않은 멤버로 빌드에서 거부됩니다.
                tokens.push(match word.as_str() {
                    "not" => Token::Not,
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}' in condition")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // or_expr := and_expr ("or" and_expr)*
    fn parse_or(&mut self) -> Result<ExprNode, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = ExprNode::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and_expr := unary ("and" unary)*
    fn parse_and(&mut self) -> Result<ExprNode, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = ExprNode::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // unary := "not" unary | primary
    fn parse_unary(&mut self) -> Result<ExprNode, String> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(ExprNode::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    // primary := ident | "(" or_expr ")"
    fn parse_primary(&mut self) -> Result<ExprNode, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(ExprNode::Ident(name)),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("missing closing parenthesis".to_owned()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of condition".to_owned()),
        }
    }
}

fn collect_idents(node: &ExprNode, out: &mut HashSet<String>) {
    match node {
        ExprNode::Ident(name) => {
            out.insert(name.clone());
        }
        ExprNode::Not(inner) => collect_idents(inner, out),
        ExprNode::And(l, r) | ExprNode::Or(l, r) => {
            collect_idents(l, out);
            collect_idents(r, out);
        }
    }
}

fn eval_node(node: &ExprNode, truth: &HashMap<String, bool>) -> Result<bool, String> {
    match node {
        ExprNode::Ident(name) => truth
            .get(name)
            .copied()
            .ok_or_else(|| format!("undeclared member id '{name}'")),
        ExprNode::Not(inner) => Ok(!eval_node(inner, truth)?),
        ExprNode::And(l, r) => Ok(eval_node(l, truth)? && eval_node(r, truth)?),
        ExprNode::Or(l, r) => Ok(eval_node(l, truth)? || eval_node(r, truth)?),
    }
}

impl Condition {
    /// 조건식을 파싱합니다. 실패하면 룰셋 빌드가 거부됩니다.
    pub fn parse(src: &str) -> Result<Self, String> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err("empty condition".to_owned());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err("trailing tokens after condition".to_owned());
        }

        let mut idents = HashSet::new();
        collect_idents(&root, &mut idents);

        Ok(Self {
            raw: src.to_owned(),
            root,
            idents,
        })
    }

    /// 원본 조건식 텍스트를 반환합니다.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// 참조하는 멤버 ID 집합을 반환합니다.
    ///
    /// 빌더가 선언된 멤버 ID의 부분집합인지 검증합니다.
    pub fn referenced_ids(&self) -> &HashSet<String> {
        &self.idents
    }

    /// 멤버 진리값 맵에 대해 식을 평가합니다.
    pub fn evaluate(&self, truth: &HashMap<String, bool>) -> Result<bool, String> {
        eval_node(&self.root, truth)
    }
}
