//! The authenticated actor and its required-claims boolean DSL.
//!
//! An [`Actor`] wraps the JSON claims document attached to a [`Frame`](crate::Frame)
//! by the `Authorization` middleware. A [`ClaimsExpr`] is a tiny boolean
//! expression over that document — `roles.a || (roles.m && roles.u)` — parsed
//! once into an AST and evaluated per request.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// The authenticated identity: a JSON object of claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(Value);

impl Actor {
    /// Wrap a claims document. Returns `None` if `claims` is not a JSON
    /// object (an actor is always a tagged document, never a scalar/array).
    pub fn from_json(claims: Value) -> Option<Self> {
        claims.is_object().then_some(Self(claims))
    }

    /// The underlying claims document.
    pub fn claims(&self) -> &Value {
        &self.0
    }

    /// Resolve a dotted path (`roles.a`) against the claims document.
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let mut cursor = &self.0;
        for segment in path {
            cursor = cursor.as_object()?.get(segment)?;
        }
        Some(cursor)
    }
}

/// Errors raised while parsing a [`ClaimsExpr`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActorError {
    /// The expression text could not be parsed.
    #[error("invalid claims expression '{0}': {1}")]
    ParseError(String, String),
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    /// `path` alone: true iff the path resolves to a present, truthy value.
    Presence(Vec<String>),
    /// `path == literal`.
    Equals(Vec<String>, Value),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
}

impl Ast {
    fn evaluate(&self, actor: &Actor) -> bool {
        match self {
            Ast::Presence(path) => match actor.get_path(path) {
                Some(Value::Null) | None => false,
                Some(Value::Bool(b)) => *b,
                Some(_) => true,
            },
            Ast::Equals(path, expected) => actor.get_path(path) == Some(expected),
            Ast::And(a, b) => a.evaluate(actor) && b.evaluate(actor),
            Ast::Or(a, b) => a.evaluate(actor) || b.evaluate(actor),
            Ast::Not(a) => !a.evaluate(actor),
        }
    }
}

/// A parsed required-claims expression, e.g. `roles.a || (roles.m && roles.u)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimsExpr {
    source: String,
    ast: Ast,
}

impl fmt::Display for ClaimsExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl ClaimsExpr {
    /// Parse a claims expression.
    pub fn parse(source: &str) -> Result<Self, ActorError> {
        let tokens = lex(source).map_err(|e| ActorError::ParseError(source.to_string(), e))?;
        let mut parser = Parser { tokens: &tokens, pos: 0 };
        let ast = parser
            .parse_or()
            .map_err(|e| ActorError::ParseError(source.to_string(), e))?;
        if parser.pos != parser.tokens.len() {
            return Err(ActorError::ParseError(
                source.to_string(),
                "trailing tokens after expression".to_string(),
            ));
        }
        Ok(Self { source: source.to_string(), ast })
    }

    /// Evaluate against an actor's claims.
    pub fn evaluate(&self, actor: &Actor) -> bool {
        self.ast.evaluate(actor)
    }

    /// The original source text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    StringLit(String),
    NumberLit(f64),
    BoolLit(bool),
    And,
    Or,
    Not,
    EqEq,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(format!("unterminated string literal starting at {start}"));
                }
                tokens.push(Token::StringLit(chars[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.')
                {
                    j += 1;
                }
                let word: String = chars[start..j].iter().collect();
                i = j;
                match word.as_str() {
                    "true" => tokens.push(Token::BoolLit(true)),
                    "false" => tokens.push(Token::BoolLit(false)),
                    _ => {
                        let path = word.split('.').map(|s| s.to_string()).collect();
                        tokens.push(Token::Path(path));
                    }
                }
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                let word: String = chars[start..j].iter().collect();
                let n: f64 = word
                    .parse()
                    .map_err(|_| format!("invalid number literal '{word}'"))?;
                tokens.push(Token::NumberLit(n));
                i = j;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Ast, String> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Ast::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Ast, String> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Ast::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Ast, String> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Ast::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Ast, String> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected closing ')'".to_string()),
                }
            }
            Some(Token::Path(path)) => {
                let path = path.clone();
                if matches!(self.peek(), Some(Token::EqEq)) {
                    self.bump();
                    let value = self.parse_literal()?;
                    Ok(Ast::Equals(path, value))
                } else {
                    Ok(Ast::Presence(path))
                }
            }
            other => Err(format!("expected a path or '(', found {other:?}")),
        }
    }

    fn parse_literal(&mut self) -> Result<Value, String> {
        match self.bump() {
            Some(Token::StringLit(s)) => Ok(Value::String(s.clone())),
            Some(Token::BoolLit(b)) => Ok(Value::Bool(*b)),
            Some(Token::NumberLit(n)) => Ok(serde_json::json!(*n)),
            other => Err(format!("expected a literal, found {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor_with(claims: Value) -> Actor {
        Actor::from_json(claims).unwrap()
    }

    #[test]
    fn presence_checks_truthy_value() {
        let actor = actor_with(serde_json::json!({"roles": {"a": true}}));
        let expr = ClaimsExpr::parse("roles.a").unwrap();
        assert!(expr.evaluate(&actor));
    }

    #[test]
    fn presence_is_false_when_absent() {
        let actor = actor_with(serde_json::json!({"roles": {}}));
        let expr = ClaimsExpr::parse("roles.a").unwrap();
        assert!(!expr.evaluate(&actor));
    }

    #[test]
    fn or_and_and_combine_as_documented() {
        let actor = actor_with(serde_json::json!({"roles": {"m": true, "u": true}}));
        let expr = ClaimsExpr::parse("roles.a || (roles.m && roles.u)").unwrap();
        assert!(expr.evaluate(&actor));
    }

    #[test]
    fn or_and_and_combine_and_reject_partial_match() {
        let actor = actor_with(serde_json::json!({"roles": {"m": true}}));
        let expr = ClaimsExpr::parse("roles.a || (roles.m && roles.u)").unwrap();
        assert!(!expr.evaluate(&actor));
    }

    #[test]
    fn equality_compares_scalar_fields() {
        let actor = actor_with(serde_json::json!({"tenant": "acme"}));
        let expr = ClaimsExpr::parse("tenant == \"acme\"").unwrap();
        assert!(expr.evaluate(&actor));
        let expr_no = ClaimsExpr::parse("tenant == \"other\"").unwrap();
        assert!(!expr_no.evaluate(&actor));
    }

    #[test]
    fn negation_inverts_presence() {
        let actor = actor_with(serde_json::json!({"roles": {}}));
        let expr = ClaimsExpr::parse("!roles.a").unwrap();
        assert!(expr.evaluate(&actor));
    }

    #[test]
    fn malformed_expression_is_rejected() {
        assert!(ClaimsExpr::parse("roles.a &&").is_err());
        assert!(ClaimsExpr::parse("(roles.a").is_err());
    }
}
