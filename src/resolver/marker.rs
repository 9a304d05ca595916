//! Dependency specifiers and environment markers
//!
//! A deliberately small grammar: enough of PEP 508 to decide whether a
//! pinned runtime dependency applies to a Linux build of a given architecture
//! and interpreter minor.
//!
//! ```text
//! marker  := and ('or' and)*
//! and     := atom ('and' atom)*
//! atom    := '(' marker ')' | value op value
//! op      := '==' | '!=' | '<' | '<=' | '>' | '>=' | '~=' | '===' | 'in' | 'not' 'in'
//! value   := identifier | quoted string
//! ```

use crate::error::{Result, ServeTuneError};
use crate::system::Architecture;
use std::cmp::Ordering;

/// One declared runtime dependency
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    /// Normalized distribution name
    pub name: String,
    /// Exact version when pinned with `==`
    pub pinned: Option<String>,
    /// Environment marker, if any
    pub marker: Option<Marker>,
    /// Marker could not be parsed but names `extra`, so the entry is taken
    /// to belong to an optional feature
    pub extras_only: bool,
}

impl Requirement {
    /// Parse a `requires_dist` entry or requirements-file line
    pub fn parse(line: &str) -> Result<Self> {
        let (spec, marker_text) = match line.split_once(';') {
            Some((spec, marker)) => (spec.trim(), Some(marker.trim())),
            None => (line.trim(), None),
        };

        let name_end = spec
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
            .unwrap_or(spec.len());
        let name = &spec[..name_end];
        if name.is_empty() {
            return Err(ServeTuneError::requirement(line, "missing distribution name"));
        }

        let mut rest = spec[name_end..].trim_start();
        if rest.starts_with('[') {
            let close = rest
                .find(']')
                .ok_or_else(|| ServeTuneError::requirement(line, "unterminated extras"))?;
            rest = rest[close + 1..].trim_start();
        }

        let pinned = if rest.starts_with('@') {
            None
        } else {
            parse_pin(rest.trim_start_matches('(').trim_end_matches(')'))
        };

        let (marker, extras_only) = match marker_text {
            Some(text) if !text.is_empty() => match Marker::parse(text) {
                Ok(marker) => (Some(marker), false),
                Err(e) if mentions_extra(text) => {
                    tracing::warn!("Treating unparseable extras marker as optional: {}", e);
                    (None, true)
                }
                Err(e) => {
                    tracing::warn!("Treating unparseable marker as always true: {}", e);
                    (None, false)
                }
            },
            _ => (None, false),
        };

        Ok(Requirement {
            name: normalize_name(name),
            pinned,
            marker,
            extras_only,
        })
    }

    /// Does this requirement apply to the given environment?
    pub fn applies(&self, env: &MarkerEnv) -> bool {
        !self.extras_only && self.marker.as_ref().map(|m| m.evaluate(env)).unwrap_or(true)
    }
}

/// Does unquoted marker text use the `extra` variable?
fn mentions_extra(text: &str) -> bool {
    let mut quote = None;
    let mut word = String::new();
    for c in text.chars().chain(std::iter::once(' ')) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c.is_ascii_alphanumeric() || c == '_' => word.push(c),
            None => {
                if word == "extra" {
                    return true;
                }
                word.clear();
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
            }
        }
    }
    false
}

/// Parsed contents of a pip requirements file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequirementsFile {
    /// Requirement lines
    pub requirements: Vec<Requirement>,
    /// Paths named by `-r` / `--requirement`, relative to the including file
    pub includes: Vec<String>,
}

impl RequirementsFile {
    /// Parse requirements-file text. Malformed lines are skipped with a
    /// warning; other pip options are ignored.
    pub fn parse(content: &str) -> Self {
        let mut file = RequirementsFile::default();

        for raw in content.lines() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            if let Some(path) = line
                .strip_prefix("--requirement")
                .or_else(|| line.strip_prefix("-r"))
            {
                let path = path.trim_start_matches('=').trim();
                if !path.is_empty() {
                    file.includes.push(path.to_string());
                }
                continue;
            }
            if line.starts_with('-') {
                continue;
            }

            match Requirement::parse(line) {
                Ok(req) => file.requirements.push(req),
                Err(e) => tracing::warn!("Skipping requirement line: {}", e),
            }
        }

        file
    }
}

/// Drop a trailing `# comment` (a `#` at line start or after whitespace)
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

/// Exact version from a specifier list, if it is a single `==`/`===` pin
fn parse_pin(spec: &str) -> Option<String> {
    let spec = spec.trim();
    if spec.contains(',') {
        return None;
    }
    let version = spec
        .strip_prefix("===")
        .or_else(|| spec.strip_prefix("=="))?
        .trim();
    (!version.is_empty() && !version.contains('*')).then(|| version.to_string())
}

/// PEP 503 name normalization
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// Evaluation context for markers
#[derive(Debug, Clone, Copy)]
pub struct MarkerEnv {
    /// Target architecture
    pub arch: Architecture,
    /// CPython 3 minor, `None` when not yet known
    pub python_minor: Option<u32>,
}

/// Parsed environment marker
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    /// Both sides hold
    And(Box<Marker>, Box<Marker>),
    /// Either side holds
    Or(Box<Marker>, Box<Marker>),
    /// `lhs op rhs`
    Compare {
        /// Left operand
        lhs: Value,
        /// Operator
        op: Op,
        /// Right operand
        rhs: Value,
    },
}

/// Marker operand
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Environment variable such as `platform_machine`
    Variable(String),
    /// Quoted literal
    Literal(String),
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `==`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `~=`
    Compatible,
    /// `===`
    Arbitrary,
    /// `in` (substring)
    In,
    /// `not in`
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Op(Op),
    LParen,
    RParen,
    And,
    Or,
}

fn tokenize(text: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| format!("unterminated string in '{}'", text))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '=' | '!' | '<' | '>' | '~' => {
                let op_len = chars[i..]
                    .iter()
                    .take_while(|ch| matches!(ch, '=' | '!' | '<' | '>' | '~'))
                    .count();
                let op: String = chars[i..i + op_len].iter().collect();
                let op = match op.as_str() {
                    "==" => Op::Eq,
                    "!=" => Op::NotEq,
                    "<" => Op::Lt,
                    "<=" => Op::LtEq,
                    ">" => Op::Gt,
                    ">=" => Op::GtEq,
                    "~=" => Op::Compatible,
                    "===" => Op::Arbitrary,
                    other => return Err(format!("unknown operator '{}'", other)),
                };
                tokens.push(Token::Op(op));
                i += op_len;
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let len = chars[i..]
                    .iter()
                    .take_while(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.'))
                    .count();
                let word: String = chars[i..i + len].iter().collect();
                i += len;
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "in" => Token::Op(Op::In),
                    "not" => {
                        // `not` only occurs as part of `not in`
                        let skip = chars[i..].iter().take_while(|ch| ch.is_whitespace()).count();
                        let next: String = chars[i + skip..]
                            .iter()
                            .take_while(|ch| ch.is_ascii_alphanumeric() || **ch == '_')
                            .collect();
                        if next != "in" {
                            return Err("'not' must be followed by 'in'".to_string());
                        }
                        i += skip + 2;
                        Token::Op(Op::NotIn)
                    }
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
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
        self.pos += 1;
        token
    }

    fn or_expr(&mut self) -> std::result::Result<Marker, String> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Marker::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> std::result::Result<Marker, String> {
        let mut lhs = self.atom()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.atom()?;
            lhs = Marker::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> std::result::Result<Marker, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or_expr()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("missing ')'".to_string()),
            };
        }

        let lhs = self.value()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => return Err(format!("expected operator, found {:?}", other)),
        };
        let rhs = self.value()?;
        Ok(Marker::Compare { lhs, op, rhs })
    }

    fn value(&mut self) -> std::result::Result<Value, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Value::Variable(name)),
            Some(Token::Str(s)) => Ok(Value::Literal(s)),
            other => Err(format!("expected value, found {:?}", other)),
        }
    }
}

impl Marker {
    /// Parse marker text (the part after `;`)
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text).map_err(|e| ServeTuneError::requirement(text, e))?;
        let mut parser = Parser { tokens, pos: 0 };
        let marker = parser
            .or_expr()
            .map_err(|e| ServeTuneError::requirement(text, e))?;
        if parser.pos != parser.tokens.len() {
            return Err(ServeTuneError::requirement(text, "trailing tokens"));
        }
        Ok(marker)
    }

    /// Evaluate against `env`. Comparisons involving unknown variables, or a
    /// python version that is not known yet, count as satisfied.
    pub fn evaluate(&self, env: &MarkerEnv) -> bool {
        match self {
            Marker::And(a, b) => a.evaluate(env) && b.evaluate(env),
            Marker::Or(a, b) => a.evaluate(env) || b.evaluate(env),
            Marker::Compare { lhs, op, rhs } => compare(lhs, *op, rhs, env).unwrap_or(true),
        }
    }
}

fn resolve_variable(name: &str, env: &MarkerEnv) -> Option<String> {
    match name {
        "platform_machine" => Some(env.arch.as_str().to_string()),
        "sys_platform" => Some("linux".to_string()),
        "platform_system" => Some("Linux".to_string()),
        "os_name" => Some("posix".to_string()),
        "implementation_name" => Some("cpython".to_string()),
        "platform_python_implementation" => Some("CPython".to_string()),
        "python_version" => env.python_minor.map(|m| format!("3.{}", m)),
        "python_full_version" => env.python_minor.map(|m| format!("3.{}.0", m)),
        "extra" => Some(String::new()),
        _ => None,
    }
}

fn compare(lhs: &Value, op: Op, rhs: &Value, env: &MarkerEnv) -> Option<bool> {
    let machine_side = matches!(lhs, Value::Variable(n) if n == "platform_machine")
        || matches!(rhs, Value::Variable(n) if n == "platform_machine");

    let operand = |v: &Value| match v {
        Value::Variable(name) => resolve_variable(name, env),
        Value::Literal(s) => Some(s.clone()),
    };
    let left = operand(lhs)?;
    let right = operand(rhs)?;

    if machine_side {
        return Some(compare_machine(&left, op, &right, env.arch));
    }

    let versioned = [lhs, rhs]
        .iter()
        .any(|v| matches!(v, Value::Variable(n) if n.starts_with("python_")));

    Some(match op {
        Op::In => !left.is_empty() && right.contains(&left),
        Op::NotIn => left.is_empty() || !right.contains(&left),
        Op::Arbitrary => left == right,
        _ if versioned => compare_versions(&left, op, &right),
        Op::Eq => left == right,
        Op::NotEq => left != right,
        _ => return None,
    })
}

/// Architecture comparisons go through the alias table so `arm64` and
/// `aarch64` (or `AMD64` and `x86_64`) agree.
fn compare_machine(left: &str, op: Op, right: &str, arch: Architecture) -> bool {
    let literal = if left == arch.as_str() { right } else { left };
    let hit = match op {
        Op::In | Op::NotIn => literal
            .split(|c: char| c.is_whitespace() || c == ',')
            .any(|token| arch.matches(token)),
        _ => arch.matches(literal),
    };
    match op {
        Op::NotEq | Op::NotIn => !hit,
        _ => hit,
    }
}

fn version_parts(v: &str) -> Vec<u64> {
    v.split('.')
        .map(|p| p.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

fn cmp_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0)))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn compare_versions(left: &str, op: Op, right: &str) -> bool {
    let (a, b) = (version_parts(left), version_parts(right));
    let ord = cmp_versions(&a, &b);
    match op {
        Op::Eq | Op::Arbitrary => ord == Ordering::Equal,
        Op::NotEq => ord != Ordering::Equal,
        Op::Lt => ord == Ordering::Less,
        Op::LtEq => ord != Ordering::Greater,
        Op::Gt => ord == Ordering::Greater,
        Op::GtEq => ord != Ordering::Less,
        Op::Compatible => {
            let prefix = b.len().saturating_sub(1).max(1);
            ord != Ordering::Less && a.iter().take(prefix).eq(b.iter().take(prefix))
        }
        Op::In | Op::NotIn => false,
    }
}
