//! kubectl-style JSONPath subset used by wait conditions.
//!
//! Accepted: optional `{...}` braces, optional leading `.`, dotted keys,
//! `[N]` indexes, quoted keys (`['a.b/c']` or `["a.b/c"]`) and one-key
//! equality filters `[?(@.type=="Ready")]` that select the first matching
//! array element. Wildcards, recursive descent and slices are refused.

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    /// First array element whose `path` renders to `value`.
    Filter { path: Vec<String>, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path expression")]
    Empty,
    #[error("unsupported path expression {expr:?}: {reason}")]
    Unsupported { expr: String, reason: &'static str },
    #[error("malformed path expression {expr:?} at offset {at}: {reason}")]
    Malformed { expr: String, at: usize, reason: &'static str },
}

/// A parsed path into a server object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    raw: String,
    segments: Vec<Segment>,
}

struct Parser<'a> {
    expr: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn malformed(&self, reason: &'static str) -> PathError {
        PathError::Malformed { expr: self.expr.to_string(), at: self.pos, reason }
    }

    fn unsupported(&self, reason: &'static str) -> PathError {
        PathError::Unsupported { expr: self.expr.to_string(), reason }
    }

    fn peek(&self) -> Option<char> { self.chars.get(self.pos).copied() }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char, reason: &'static str) -> Result<(), PathError> {
        if self.eat(c) { Ok(()) } else { Err(self.malformed(reason)) }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn ident(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                '.' | '[' | ']' | '=' | '!' | ')' | '(' | '\'' | '"' => break,
                '*' => return Err(self.unsupported("wildcards are not supported")),
                c if c.is_whitespace() => break,
                _ => self.pos += 1,
            }
        }
        if self.pos == start {
            return Err(self.malformed("expected a key"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn quoted(&mut self) -> Result<String, PathError> {
        let quote = match self.peek() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.malformed("expected a quoted string")),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let s: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err(self.malformed("unterminated quoted string"))
    }

    fn bracket(&mut self) -> Result<Segment, PathError> {
        // '[' already consumed
        let seg = match self.peek() {
            Some('\'' | '"') => Segment::Key(self.quoted()?),
            Some('?') => {
                self.pos += 1;
                self.filter()?
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                Segment::Index(digits.parse().map_err(|_| self.malformed("index out of range"))?)
            }
            Some('*') => return Err(self.unsupported("wildcards are not supported")),
            Some('-') | Some(':') => return Err(self.unsupported("negative indexes and slices are not supported")),
            _ => return Err(self.malformed("expected an index, a quoted key or a filter")),
        };
        if self.peek() == Some(':') {
            return Err(self.unsupported("slices are not supported"));
        }
        self.expect(']', "expected ']'")?;
        Ok(seg)
    }

    fn filter(&mut self) -> Result<Segment, PathError> {
        self.expect('(', "expected '(' after '?'")?;
        self.skip_ws();
        self.expect('@', "filter must start with '@'")?;
        let mut path = Vec::new();
        while self.eat('.') {
            path.push(self.ident()?);
        }
        if path.is_empty() {
            return Err(self.malformed("filter needs a key after '@'"));
        }
        self.skip_ws();
        if !(self.eat('=') && self.eat('=')) {
            return Err(self.unsupported("only '==' filters are supported"));
        }
        self.skip_ws();
        let value = self.quoted()?;
        self.skip_ws();
        self.expect(')', "expected ')' to close the filter")?;
        Ok(Segment::Filter { path, value })
    }

    fn parse(mut self) -> Result<Vec<Segment>, PathError> {
        let mut segments = Vec::new();
        self.eat('.');
        if self.peek() == Some('.') {
            return Err(self.unsupported("recursive descent is not supported"));
        }
        while self.pos < self.chars.len() {
            match self.peek() {
                Some('[') => {
                    self.pos += 1;
                    segments.push(self.bracket()?);
                }
                Some('.') => {
                    self.pos += 1;
                    match self.peek() {
                        Some('.') => return Err(self.unsupported("recursive descent is not supported")),
                        Some('[') | None => return Err(self.malformed("expected a key after '.'")),
                        _ => segments.push(Segment::Key(self.ident()?)),
                    }
                }
                Some(_) => {
                    if !segments.is_empty() && self.pos > 0 && self.chars[self.pos - 1] == ']' {
                        return Err(self.malformed("expected '.' or '[' after ']'"));
                    }
                    segments.push(Segment::Key(self.ident()?));
                }
                None => break,
            }
        }
        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(segments)
    }
}

impl PathExpr {
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let trimmed = input.trim();
        let inner = match (trimmed.strip_prefix('{'), trimmed.ends_with('}')) {
            (Some(rest), true) => &rest[..rest.len() - 1],
            (None, false) => trimmed,
            _ => {
                return Err(PathError::Malformed {
                    expr: input.to_string(),
                    at: 0,
                    reason: "unbalanced braces",
                })
            }
        };
        let inner = inner.trim();
        if inner.is_empty() {
            return Err(PathError::Empty);
        }
        let segments = Parser { expr: input, chars: inner.chars().collect(), pos: 0 }.parse()?;
        Ok(Self { raw: input.to_string(), segments })
    }

    pub fn as_str(&self) -> &str { &self.raw }

    pub fn segments(&self) -> &[Segment] { &self.segments }

    /// Follow the path through `root`; `None` when any step is missing.
    pub fn resolve<'a>(&self, root: &'a Json) -> Option<&'a Json> {
        let mut cur = root;
        for seg in self.segments.iter() {
            cur = match seg {
                Segment::Key(k) => cur.as_object()?.get(k)?,
                Segment::Index(i) => cur.as_array()?.get(*i)?,
                Segment::Filter { path, value } => cur.as_array()?.iter().find(|el| {
                    path.iter()
                        .try_fold(*el, |v, k| v.as_object()?.get(k))
                        .map(|v| render(v) == *value)
                        .unwrap_or(false)
                })?,
            };
        }
        Some(cur)
    }

    /// Rendered value at the path, if it resolves.
    pub fn evaluate(&self, root: &Json) -> Option<String> { self.resolve(root).map(render) }
}

impl std::fmt::Display for PathExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.raw) }
}

/// Text form of a value as compared against an expected value.
pub fn render(v: &Json) -> String {
    match v {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Whether a rendered value counts as present.
pub fn is_non_empty(rendered: &str) -> bool { !rendered.is_empty() && rendered != "{}" && rendered != "[]" }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(parts: &[&str]) -> Vec<Segment> { parts.iter().map(|p| Segment::Key(p.to_string())).collect() }

    #[test]
    fn accepts_braces_and_leading_dot() {
        for s in ["status.phase", ".status.phase", "{.status.phase}", " { .status.phase } "] {
            assert_eq!(PathExpr::parse(s).unwrap().segments(), keys(&["status", "phase"]).as_slice(), "{}", s);
        }
    }

    #[test]
    fn parses_indexes_quoted_keys_and_filters() {
        let p = PathExpr::parse("{.status.conditions[?(@.type==\"Ready\")].status}").unwrap();
        assert_eq!(
            p.segments(),
            &[
                Segment::Key("status".into()),
                Segment::Key("conditions".into()),
                Segment::Filter { path: vec!["type".into()], value: "Ready".into() },
                Segment::Key("status".into()),
            ]
        );
        let p = PathExpr::parse("metadata.annotations['example.com/owner']").unwrap();
        assert_eq!(p.segments()[2], Segment::Key("example.com/owner".into()));
        let p = PathExpr::parse("spec.containers[0].image").unwrap();
        assert_eq!(p.segments()[2], Segment::Index(0));
    }

    #[test]
    fn refuses_unsupported_and_malformed() {
        assert_eq!(PathExpr::parse(""), Err(PathError::Empty));
        assert_eq!(PathExpr::parse("{}"), Err(PathError::Empty));
        assert!(matches!(PathExpr::parse("spec.*"), Err(PathError::Unsupported { .. })));
        assert!(matches!(PathExpr::parse("..name"), Err(PathError::Unsupported { .. })));
        assert!(matches!(PathExpr::parse("items[0:2]"), Err(PathError::Unsupported { .. })));
        assert!(matches!(PathExpr::parse("items[?(@.a!='b')]"), Err(PathError::Unsupported { .. })));
        assert!(matches!(PathExpr::parse("spec..x"), Err(PathError::Unsupported { .. })));
        assert!(matches!(PathExpr::parse("spec."), Err(PathError::Malformed { .. })));
        assert!(matches!(PathExpr::parse("items[0"), Err(PathError::Malformed { .. })));
        assert!(matches!(PathExpr::parse("{.status"), Err(PathError::Malformed { .. })));
        assert!(matches!(PathExpr::parse("a['unterminated]"), Err(PathError::Malformed { .. })));
    }

    #[test]
    fn resolves_and_renders() {
        let obj = json!({
            "status": {
                "phase": "Ready",
                "replicas": 3,
                "paused": false,
                "empty": {},
                "none": null,
                "conditions": [
                    { "type": "Progressing", "status": "True" },
                    { "type": "Available", "status": "False" }
                ]
            },
            "spec": { "ports": [80, 443] }
        });
        let eval = |p: &str| PathExpr::parse(p).unwrap().evaluate(&obj);
        assert_eq!(eval("status.phase").as_deref(), Some("Ready"));
        assert_eq!(eval("status.replicas").as_deref(), Some("3"));
        assert_eq!(eval("status.paused").as_deref(), Some("false"));
        assert_eq!(eval("status.none").as_deref(), Some(""));
        assert_eq!(eval("spec.ports").as_deref(), Some("[80,443]"));
        assert_eq!(eval("spec.ports[1]").as_deref(), Some("443"));
        assert_eq!(eval("status.conditions[?(@.type=='Available')].status").as_deref(), Some("False"));
        assert_eq!(eval("status.conditions[?(@.type=='Missing')].status"), None);
        assert_eq!(eval("status.missing"), None);
        assert_eq!(eval("spec.ports[5]"), None);
        assert_eq!(eval("status.phase.deeper"), None);
    }

    #[test]
    fn non_empty_excludes_empty_containers() {
        assert!(is_non_empty("x"));
        assert!(is_non_empty("0"));
        assert!(is_non_empty("false"));
        assert!(!is_non_empty(""));
        assert!(!is_non_empty("{}"));
        assert!(!is_non_empty("[]"));
    }
}
