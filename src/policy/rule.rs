//! Group selection rules.
//!
//! ```text
//! rule  := and ("OR" and)*
//! and   := term ("AND" term)*
//! term  := "thingName" ":" value
//! value := [A-Za-z0-9_-]+ | "\:" ... optionally followed by "*", or "*"
//! ```
//!
//! `AND` binds tighter than `OR`; both short-circuit.

use std::fmt;
use std::str::FromStr;

use super::wildcard::GlobPattern;
use crate::iot::Thing;
use crate::session::Session;
use crate::{Error, Result};

const THING_NAME_KEYWORD: &str = "thingName";

/// A parsed selection rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRule {
    source: String,
    expression: Expression,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expression {
    Or(Vec<Expression>),
    And(Vec<Expression>),
    ThingName(GlobPattern),
}

impl SelectionRule {
    /// Parse `source`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Policy` describing the first syntax error.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let expression = parser.or_expression()?;
        if let Some(token) = parser.peek() {
            return Err(Error::Policy(format!(
                "Unexpected {token} in selection rule `{source}`"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expression,
        })
    }

    /// The rule as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `session` satisfies the rule.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        self.expression.evaluate(session)
    }
}

impl FromStr for SelectionRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expression {
    fn evaluate(&self, session: &Session) -> bool {
        match self {
            Self::Or(terms) => terms.iter().any(|t| t.evaluate(session)),
            Self::And(terms) => terms.iter().all(|t| t.evaluate(session)),
            Self::ThingName(pattern) => session
                .attribute(Thing::NAMESPACE, "ThingName")
                .is_some_and(|name| pattern.matches(name)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lexer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Colon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Word(w) => write!(f, "`{w}`"),
            Self::Colon => f.write_str("`:`"),
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '*')
}

fn lex(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == ':' {
            chars.next();
            tokens.push(Token::Colon);
        } else if is_word_char(c) || c == '\\' {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if is_word_char(c) {
                    word.push(c);
                    chars.next();
                } else if c == '\\' {
                    chars.next();
                    match chars.next() {
                        Some(':') => word.push(':'),
                        _ => {
                            return Err(Error::Policy(format!(
                                "Invalid escape sequence in selection rule `{source}`"
                            )));
                        }
                    }
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else {
            return Err(Error::Policy(format!(
                "Unexpected character `{c}` in selection rule `{source}`"
            )));
        }
    }
    Ok(tokens)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expression(&mut self) -> Result<Expression> {
        let mut terms = vec![self.and_expression()?];
        while self.eat_keyword("OR") {
            terms.push(self.and_expression()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expression::Or(terms)
        })
    }

    fn and_expression(&mut self) -> Result<Expression> {
        let mut terms = vec![self.term()?];
        while self.eat_keyword("AND") {
            terms.push(self.term()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expression::And(terms)
        })
    }

    fn term(&mut self) -> Result<Expression> {
        match self.next() {
            Some(Token::Word(w)) if w == THING_NAME_KEYWORD => {}
            Some(other) => {
                return Err(Error::Policy(format!(
                    "Expected `{THING_NAME_KEYWORD}`, found {other}"
                )));
            }
            None => {
                return Err(Error::Policy(format!(
                    "Expected `{THING_NAME_KEYWORD}`, found end of rule"
                )));
            }
        }
        if self.next() != Some(&Token::Colon) {
            return Err(Error::Policy(format!(
                "Expected `:` after `{THING_NAME_KEYWORD}`"
            )));
        }
        match self.next() {
            Some(Token::Word(value)) => Ok(Expression::ThingName(value_pattern(value)?)),
            Some(other) => Err(Error::Policy(format!("Expected thing name, found {other}"))),
            None => Err(Error::Policy("Expected thing name, found end of rule".into())),
        }
    }
}

/// Only a bare `*` or a single trailing `*` is allowed.
fn value_pattern(value: &str) -> Result<GlobPattern> {
    let body = value.strip_suffix('*').unwrap_or(value);
    if body.contains('*') {
        return Err(Error::Policy(format!(
            "Wildcard is only allowed at the end of thing name `{value}`"
        )));
    }
    Ok(GlobPattern::new(value))
}
