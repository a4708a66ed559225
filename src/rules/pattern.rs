//! Router-style rule grammar.
//!
//! ```text
//! expr    := and ('||' and)*
//! and     := unary ('&&' unary)*
//! unary   := '!' unary | '(' expr ')' | matcher
//! matcher := Name '(' string (',' string)* ')'
//! string  := '`' raw '`' | '"' escaped '"'
//! ```
//!
//! | Matcher | Arguments | Matches when |
//! |---|---|---|
//! | `Host` | host | host equals (case-insensitive) |
//! | `HostRegexp` | regex | regex finds a match in the host |
//! | `Path` | path | path equals |
//! | `PathPrefix` | prefix | path starts with prefix |
//! | `PathRegexp` | regex | regex finds a match in the path |
//! | `Method` | method | method equals (case-insensitive) |
//! | `Header` | name, value | any value of the header equals |
//! | `Query` | key [, value] | key present (with value) |

use http::HeaderName;
use regex::Regex;

use super::RequestTarget;

#[derive(Debug)]
enum Matcher {
    Host(String),
    HostRegexp(Regex),
    Path(String),
    PathPrefix(String),
    PathRegexp(Regex),
    Method(String),
    Header(HeaderName, String),
    Query(String, Option<String>),
}

impl Matcher {
    fn matches(&self, target: &RequestTarget) -> bool {
        match self {
            Matcher::Host(host) => *host == target.host,
            Matcher::HostRegexp(re) => re.is_match(&target.host),
            Matcher::Path(path) => *path == target.path,
            Matcher::PathPrefix(prefix) => target.path.starts_with(prefix.as_str()),
            Matcher::PathRegexp(re) => re.is_match(&target.path),
            Matcher::Method(method) => *method == target.method,
            Matcher::Header(name, value) => target
                .headers
                .get_all(name)
                .iter()
                .any(|v| v.as_bytes() == value.as_bytes()),
            Matcher::Query(key, value) => target.query.iter().any(|(k, v)| {
                k == key && value.as_ref().is_none_or(|expected| expected == v)
            }),
        }
    }
}

#[derive(Debug)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Match(Matcher),
}

impl Expr {
    fn eval(&self, target: &RequestTarget) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(target) || b.eval(target),
            Expr::And(a, b) => a.eval(target) && b.eval(target),
            Expr::Not(inner) => !inner.eval(target),
            Expr::Match(m) => m.matches(target),
        }
    }
}

/// A compiled pattern rule.
#[derive(Debug)]
pub struct PatternRule {
    expr: Expr,
}

impl PatternRule {
    pub fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err("empty expression".into());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(format!(
                "unexpected {} at offset {}",
                token.kind.describe(),
                token.offset
            ));
        }
        Ok(Self { expr })
    }

    pub fn matches(&self, target: &RequestTarget) -> bool {
        self.expr.eval(target)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lexer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::Str(value) => format!("string \"{value}\""),
            TokenKind::LParen => "'('".into(),
            TokenKind::RParen => "')'".into(),
            TokenKind::Comma => "','".into(),
            TokenKind::And => "'&&'".into(),
            TokenKind::Or => "'||'".into(),
            TokenKind::Not => "'!'".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        let kind = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            '!' => {
                chars.next();
                TokenKind::Not
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        if c == '&' {
                            TokenKind::And
                        } else {
                            TokenKind::Or
                        }
                    }
                    _ => return Err(format!("expected '{c}{c}' at offset {offset}")),
                }
            }
            '`' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '`')) => break,
                        Some((_, ch)) => value.push(ch),
                        None => return Err(format!("unterminated string at offset {offset}")),
                    }
                }
                TokenKind::Str(value)
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => {
                                return Err(format!("unterminated string at offset {offset}"));
                            }
                        },
                        Some((_, ch)) => value.push(ch),
                        None => return Err(format!("unterminated string at offset {offset}")),
                    }
                }
                TokenKind::Str(value)
            }
            c if c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if !ch.is_ascii_alphanumeric() {
                        break;
                    }
                    name.push(ch);
                    chars.next();
                }
                TokenKind::Ident(name)
            }
            other => return Err(format!("unexpected character '{other}' at offset {offset}")),
        };
        tokens.push(Token { kind, offset });
    }

    Ok(tokens)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────────

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

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| t.kind == *kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), String> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(format!(
                "expected {} but found {} at offset {}",
                kind.describe(),
                token.kind.describe(),
                token.offset
            )),
            None => Err(format!("expected {} but the expression ended", kind.describe())),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.eat(&TokenKind::And) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token {
                kind: TokenKind::Not,
                ..
            }) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Token {
                kind: TokenKind::LParen,
                ..
            }) => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            Some(Token {
                kind: TokenKind::Ident(name),
                offset,
            }) => {
                let args = self.arguments()?;
                build_matcher(&name, args)
                    .map_err(|e| format!("{e} (offset {offset})"))
                    .map(Expr::Match)
            }
            Some(token) => Err(format!(
                "unexpected {} at offset {}",
                token.kind.describe(),
                token.offset
            )),
            None => Err("expression ended unexpectedly".into()),
        }
    }

    fn arguments(&mut self) -> Result<Vec<String>, String> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token {
                    kind: TokenKind::Str(value),
                    ..
                }) => args.push(value),
                Some(token) => {
                    return Err(format!(
                        "expected a string argument but found {} at offset {}",
                        token.kind.describe(),
                        token.offset
                    ));
                }
                None => return Err("unterminated argument list".into()),
            }
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            self.expect(TokenKind::RParen)?;
            return Ok(args);
        }
    }
}

fn build_matcher(name: &str, args: Vec<String>) -> Result<Matcher, String> {
    let arity = |expected: &[usize]| -> Result<(), String> {
        if expected.contains(&args.len()) {
            Ok(())
        } else {
            Err(format!("{name} takes {expected:?} argument(s), got {}", args.len()))
        }
    };

    match name {
        "Host" => {
            arity(&[1])?;
            Ok(Matcher::Host(args[0].to_ascii_lowercase()))
        }
        "HostRegexp" => {
            arity(&[1])?;
            compile_regex(&args[0]).map(Matcher::HostRegexp)
        }
        "Path" => {
            arity(&[1])?;
            require_path(&args[0])?;
            Ok(Matcher::Path(args[0].clone()))
        }
        "PathPrefix" => {
            arity(&[1])?;
            require_path(&args[0])?;
            Ok(Matcher::PathPrefix(args[0].clone()))
        }
        "PathRegexp" => {
            arity(&[1])?;
            compile_regex(&args[0]).map(Matcher::PathRegexp)
        }
        "Method" => {
            arity(&[1])?;
            Ok(Matcher::Method(args[0].to_ascii_uppercase()))
        }
        "Header" => {
            arity(&[2])?;
            let header = HeaderName::try_from(args[0].as_str())
                .map_err(|_| format!("'{}' is not a valid header name", args[0]))?;
            Ok(Matcher::Header(header, args[1].clone()))
        }
        "Query" => {
            arity(&[1, 2])?;
            Ok(Matcher::Query(args[0].clone(), args.get(1).cloned()))
        }
        other => Err(format!("unknown matcher '{other}'")),
    }
}

fn require_path(path: &str) -> Result<(), String> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(format!("path '{path}' must start with '/'"))
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid regex '{pattern}': {e}"))
}
