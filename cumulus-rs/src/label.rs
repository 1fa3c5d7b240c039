//! Label sets and label expressions.
//!
//! A template advertises a whitespace separated set of labels. A build asks
//! for workers with a label expression such as `linux && (x86 || arm)`, which
//! is matched against a template's label set.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Anything that can decide whether a set of labels is acceptable.
pub trait LabelMatcher {
    fn matches(&self, labels: &BTreeSet<String>) -> bool;
}

/// Parse a whitespace separated label string into a set.
pub fn parse_label_set(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace().map(String::from).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelParseError {
    #[error("empty label expression")]
    Empty,
    #[error("unexpected token '{0}' in label expression")]
    UnexpectedToken(String),
    #[error("unexpected end of label expression")]
    UnexpectedEnd,
    #[error("unterminated quoted label")]
    UnterminatedQuote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelExpression {
    Atom(String),
    Not(Box<LabelExpression>),
    And(Box<LabelExpression>, Box<LabelExpression>),
    Or(Box<LabelExpression>, Box<LabelExpression>),
    Implies(Box<LabelExpression>, Box<LabelExpression>),
    Iff(Box<LabelExpression>, Box<LabelExpression>),
}

impl LabelExpression {
    pub fn atom(name: impl Into<String>) -> Self {
        LabelExpression::Atom(name.into())
    }
}

impl LabelMatcher for LabelExpression {
    fn matches(&self, labels: &BTreeSet<String>) -> bool {
        match self {
            LabelExpression::Atom(a) => labels.contains(a),
            LabelExpression::Not(e) => !e.matches(labels),
            LabelExpression::And(l, r) => l.matches(labels) && r.matches(labels),
            LabelExpression::Or(l, r) => l.matches(labels) || r.matches(labels),
            LabelExpression::Implies(l, r) => !l.matches(labels) || r.matches(labels),
            LabelExpression::Iff(l, r) => l.matches(labels) == r.matches(labels),
        }
    }
}

impl fmt::Display for LabelExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelExpression::Atom(a) => {
                if a.chars().all(is_atom_char) && !a.contains("->") {
                    write!(f, "{a}")
                } else {
                    write!(f, "\"{a}\"")
                }
            }
            LabelExpression::Not(e) => write!(f, "!{e}"),
            LabelExpression::And(l, r) => write!(f, "({l} && {r})"),
            LabelExpression::Or(l, r) => write!(f, "({l} || {r})"),
            LabelExpression::Implies(l, r) => write!(f, "({l} -> {r})"),
            LabelExpression::Iff(l, r) => write!(f, "({l} <-> {r})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    Not,
    And,
    Or,
    Implies,
    Iff,
    Open,
    Close,
}

fn is_atom_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '!' | '&' | '|' | '<' | '"')
}

fn tokenize(raw: &str) -> Result<Vec<Token>, LabelParseError> {
    let mut tokens = vec![];
    let mut rest = raw;
    loop {
        rest = rest.trim_start();
        let Some(c) = rest.chars().next() else {
            break;
        };
        let (token, len) = if rest.starts_with("&&") {
            (Token::And, 2)
        } else if rest.starts_with("||") {
            (Token::Or, 2)
        } else if rest.starts_with("<->") {
            (Token::Iff, 3)
        } else if rest.starts_with("->") {
            (Token::Implies, 2)
        } else if c == '!' {
            (Token::Not, 1)
        } else if c == '(' {
            (Token::Open, 1)
        } else if c == ')' {
            (Token::Close, 1)
        } else if c == '"' {
            let end = rest[1..]
                .find('"')
                .ok_or(LabelParseError::UnterminatedQuote)?;
            (Token::Atom(rest[1..1 + end].to_string()), end + 2)
        } else if is_atom_char(c) {
            let mut end = 0;
            for (idx, ch) in rest.char_indices() {
                if !is_atom_char(ch) || rest[idx..].starts_with("->") {
                    break;
                }
                end = idx + ch.len_utf8();
            }
            (Token::Atom(rest[..end].to_string()), end)
        } else {
            return Err(LabelParseError::UnexpectedToken(c.to_string()));
        };
        tokens.push(token);
        rest = &rest[len..];
    }
    Ok(tokens)
}

/// Recursive descent over the token stream; precedence from loosest to
/// tightest is `<->`, `->`, `||`, `&&`, `!`.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn iff(&mut self) -> Result<LabelExpression, LabelParseError> {
        let mut lhs = self.implies()?;
        while self.eat(&Token::Iff) {
            lhs = LabelExpression::Iff(Box::new(lhs), Box::new(self.implies()?));
        }
        Ok(lhs)
    }

    fn implies(&mut self) -> Result<LabelExpression, LabelParseError> {
        let lhs = self.or()?;
        if self.eat(&Token::Implies) {
            // right associative
            return Ok(LabelExpression::Implies(
                Box::new(lhs),
                Box::new(self.implies()?),
            ));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<LabelExpression, LabelParseError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            lhs = LabelExpression::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<LabelExpression, LabelParseError> {
        let mut lhs = self.not()?;
        while self.eat(&Token::And) {
            lhs = LabelExpression::And(Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<LabelExpression, LabelParseError> {
        if self.eat(&Token::Not) {
            return Ok(LabelExpression::Not(Box::new(self.not()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<LabelExpression, LabelParseError> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Atom(a)) => {
                self.pos += 1;
                Ok(LabelExpression::Atom(a))
            }
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.iff()?;
                if !self.eat(&Token::Close) {
                    return Err(match self.peek() {
                        Some(t) => LabelParseError::UnexpectedToken(format!("{t:?}")),
                        None => LabelParseError::UnexpectedEnd,
                    });
                }
                Ok(inner)
            }
            Some(t) => Err(LabelParseError::UnexpectedToken(format!("{t:?}"))),
            None => Err(LabelParseError::UnexpectedEnd),
        }
    }
}

impl FromStr for LabelExpression {
    type Err = LabelParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(raw)?;
        if tokens.is_empty() {
            return Err(LabelParseError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.iff()?;
        match parser.peek() {
            None => Ok(expr),
            Some(t) => Err(LabelParseError::UnexpectedToken(format!("{t:?}"))),
        }
    }
}
