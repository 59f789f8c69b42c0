//! Pull-side message filters.
//!
//! A filter first sees the tag hash stored in the consume queue entry; a
//! filter that needs more than the tag can also inspect the decoded record.

use std::collections::{BTreeMap, HashSet};

use crate::message::{tags_string_to_tags_code, MessageExt};
use crate::{Error, Result};

pub const SUB_ALL: &str = "*";

pub trait MessageFilter: Send + Sync {
    /// Decides from the consume queue entry alone.
    fn is_matched_by_consume_queue(&self, tags_code: i64) -> bool;

    /// Whether [`MessageFilter::is_matched_by_commit_log`] must run.
    fn needs_commit_log(&self) -> bool {
        false
    }

    /// Second pass over the decoded record.
    fn is_matched_by_commit_log(&self, _msg: &MessageExt) -> bool {
        true
    }
}

/// Matches a set of tags (`"TagA || TagB"`), or everything for `"*"`.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    all: bool,
    tags: HashSet<String>,
    codes: HashSet<i64>,
}

impl TagFilter {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn parse(expression: &str) -> Self {
        let expression = expression.trim();
        if expression.is_empty() || expression == SUB_ALL {
            return Self::all();
        }
        Self::from_tags(expression.split("||"))
    }

    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if tag.is_empty() {
                continue;
            }
            filter.codes.insert(tags_string_to_tags_code(tag));
            filter.tags.insert(tag.to_string());
        }
        filter
    }
}

impl MessageFilter for TagFilter {
    fn is_matched_by_consume_queue(&self, tags_code: i64) -> bool {
        self.all || self.codes.contains(&tags_code)
    }

    fn needs_commit_log(&self) -> bool {
        !self.all
    }

    // Tag hashes can collide; the record settles it.
    fn is_matched_by_commit_log(&self, msg: &MessageExt) -> bool {
        self.all || msg.tags().map(|t| self.tags.contains(t)).unwrap_or(false)
    }
}

/// Boolean expression over message properties, e.g.
/// `TAGS = 'TagA' AND (region <> 'eu' OR price >= 10) AND trace IS NOT NULL`.
///
/// Comparisons are numeric when both sides parse as numbers and otherwise
/// lexical. A missing property makes every comparison false.
#[derive(Debug, Clone)]
pub struct ExpressionFilter {
    source: String,
    expr: Expr,
}

impl ExpressionFilter {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::Unsupported("trailing tokens in filter expression"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, properties: &BTreeMap<String, String>) -> bool {
        self.expr.eval(properties)
    }
}

impl MessageFilter for ExpressionFilter {
    fn is_matched_by_consume_queue(&self, _tags_code: i64) -> bool {
        true
    }

    fn needs_commit_log(&self) -> bool {
        true
    }

    fn is_matched_by_commit_log(&self, msg: &MessageExt) -> bool {
        self.evaluate(&msg.properties)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(String, CmpOp, String),
    IsNull(String, bool),
    Const(bool),
}

impl Expr {
    fn eval(&self, props: &BTreeMap<String, String>) -> bool {
        match self {
            Expr::And(a, b) => a.eval(props) && b.eval(props),
            Expr::Or(a, b) => a.eval(props) || b.eval(props),
            Expr::Not(inner) => !inner.eval(props),
            Expr::IsNull(name, negated) => props.contains_key(name) == *negated,
            Expr::Const(value) => *value,
            Expr::Compare(name, op, literal) => {
                let Some(value) = props.get(name) else {
                    return false;
                };
                let ordering = match (value.parse::<f64>(), literal.parse::<f64>()) {
                    (Ok(a), Ok(b)) => a.partial_cmp(&b),
                    _ => Some(value.as_str().cmp(literal.as_str())),
                };
                let Some(ordering) = ordering else {
                    return false;
                };
                match op {
                    CmpOp::Eq => ordering.is_eq(),
                    CmpOp::Ne => ordering.is_ne(),
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        // '' is an escaped quote
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            literal.push('\'');
                        }
                        Some('\'') => break,
                        Some(c) => literal.push(c),
                        None => return Err(Error::Unsupported("unterminated string in filter expression")),
                    }
                }
                tokens.push(Token::Literal(literal));
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '<' | '>' => {
                chars.next();
                let op = match (c, chars.peek().copied()) {
                    ('<', Some('>')) => Some(CmpOp::Ne),
                    ('<', Some('=')) => Some(CmpOp::Le),
                    ('>', Some('=')) => Some(CmpOp::Ge),
                    _ => None,
                };
                let op = match op {
                    Some(op) => {
                        chars.next();
                        op
                    }
                    None if c == '<' => CmpOp::Lt,
                    None => CmpOp::Gt,
                };
                tokens.push(Token::Op(op));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let mut number = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '-' || d == '.' {
                        number.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Literal(number));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '.' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            _ => return Err(Error::Unsupported("unexpected character in filter expression")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("OR") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("AND") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek_keyword("NOT") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::Unsupported("missing `)` in filter expression")),
                }
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("TRUE") => Ok(Expr::Const(true)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("FALSE") => Ok(Expr::Const(false)),
            Some(Token::Ident(name)) => {
                if self.peek_keyword("IS") {
                    self.pos += 1;
                    let negated = self.peek_keyword("NOT");
                    if negated {
                        self.pos += 1;
                    }
                    if !self.peek_keyword("NULL") {
                        return Err(Error::Unsupported("expected NULL in filter expression"));
                    }
                    self.pos += 1;
                    return Ok(Expr::IsNull(name, negated));
                }
                let Some(Token::Op(op)) = self.next() else {
                    return Err(Error::Unsupported("expected comparison in filter expression"));
                };
                match self.next() {
                    Some(Token::Literal(literal)) => Ok(Expr::Compare(name, op, literal)),
                    _ => Err(Error::Unsupported("expected literal in filter expression")),
                }
            }
            _ => Err(Error::Unsupported("malformed filter expression")),
        }
    }
}
