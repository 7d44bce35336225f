//! Boolean expression language for `conditional` and `loop` nodes.
//!
//! Expressions are parsed once at plan-validation time and evaluated against
//! the per-execution shared state. Supported syntax:
//!
//! - literals: `"text"`, `'text'`, `42`, `-1.5`, `true`, `false`, `null`
//! - paths: `fetch.output.count`, resolved by longest matching state key
//!   (`fetch.output`) and then descending into the JSON value (`count`)
//! - operators: `!`, `&&`, `||`, `==`, `!=`, `<`, `<=`, `>`, `>=`, `contains`
//! - grouping with parentheses

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// Shared per-execution state, keyed by `"<nodeId>.output"` and friends.
pub type StateMap = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "contains",
        };
        f.write_str(s)
    }
}

/// A parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "'{}'", s),
            Self::Str(s) => write!(f, "\"{}\"", s),
            Self::Num(n) => write!(f, "{}", n),
            Self::True => f.write_str("true"),
            Self::False => f.write_str("false"),
            Self::Null => f.write_str("null"),
            Self::Cmp(op) => write!(f, "'{}'", op),
            Self::And => f.write_str("'&&'"),
            Self::Or => f.write_str("'||'"),
            Self::Not => f.write_str("'!'"),
            Self::LParen => f.write_str("'('"),
            Self::RParen => f.write_str("')'"),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '$')
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
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
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(format!("expected '{}{}' at position {}", c, c, i));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(format!("expected '==' at position {}", i));
                }
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Cmp(op));
                i += if eq { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '\\' if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        ch if ch == quote => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        ch => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "contains" => Token::Cmp(CmpOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(format!(
                    "unexpected character '{}' at position {}",
                    other, i
                ))
            }
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
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(path)) => Ok(Expr::Path(path)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(tok) => Err(format!("expected ')' but found {}", tok)),
                    None => Err("expected ')' but reached end of expression".to_string()),
                }
            }
            Some(tok) => Err(format!("unexpected token {}", tok)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl Expr {
    /// Parse an expression, returning a human-readable message on failure.
    pub fn parse(src: &str) -> Result<Self, String> {
        if src.trim().is_empty() {
            return Err("expression is empty".to_string());
        }
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected token {} after complete expression", tok));
        }
        Ok(expr)
    }

    /// Evaluate to a JSON value. Missing paths evaluate to `null`.
    pub fn evaluate(&self, state: &StateMap) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(p) => resolve_path(state, p).unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(state))),
            Expr::And(a, b) => {
                Value::Bool(is_truthy(&a.evaluate(state)) && is_truthy(&b.evaluate(state)))
            }
            Expr::Or(a, b) => {
                Value::Bool(is_truthy(&a.evaluate(state)) || is_truthy(&b.evaluate(state)))
            }
            Expr::Compare(a, op, b) => {
                Value::Bool(compare(&a.evaluate(state), *op, &b.evaluate(state)))
            }
        }
    }

    /// Evaluate and coerce to a boolean.
    pub fn is_true(&self, state: &StateMap) -> bool {
        is_truthy(&self.evaluate(state))
    }
}

/// JavaScript-like truthiness: `null`, `false`, `0`, `""` and `[]` are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Resolve a dotted path against the state map.
///
/// The longest prefix of segments that names a state key wins; the remaining
/// segments index into that value (object keys or array positions).
pub fn resolve_path(state: &StateMap, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    for split in (1..=segments.len()).rev() {
        let key = segments[..split].join(".");
        if let Some(root) = state.get(&key) {
            let mut current = root;
            for seg in &segments[split..] {
                current = match current {
                    Value::Object(map) => map.get(*seg)?,
                    Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            return Some(current.clone());
        }
    }
    None
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Contains => match left {
            Value::String(s) => right.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
            Value::Object(map) => right.as_str().is_some_and(|k| map.contains_key(k)),
            _ => false,
        },
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(a), Value::Number(b)) => {
                    a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            match ordering {
                Some(ord) => match op {
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Le => ord.is_le(),
                    CmpOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                },
                None => false,
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> StateMap {
        let mut s = StateMap::new();
        s.insert("fetch.output".into(), json!({"count": 5, "status": "ok", "tags": ["a", "b"]}));
        s.insert("check-db.output".into(), json!(true));
        s.insert("input".into(), json!({"region": "eu"}));
        s
    }

    #[test]
    fn comparisons_against_nested_paths() {
        let s = state();
        assert!(Expr::parse("fetch.output.count > 3").unwrap().is_true(&s));
        assert!(!Expr::parse("fetch.output.count >= 6").unwrap().is_true(&s));
        assert!(Expr::parse(r#"fetch.output.status == "ok""#).unwrap().is_true(&s));
        assert!(Expr::parse("fetch.output.count == 5.0").unwrap().is_true(&s));
        assert!(Expr::parse(r#"input.region != 'us'"#).unwrap().is_true(&s));
    }

    #[test]
    fn boolean_operators_and_grouping() {
        let s = state();
        let expr = Expr::parse(r#"check-db.output && (fetch.output.count < 2 || fetch.output.tags contains "b")"#)
            .unwrap();
        assert!(expr.is_true(&s));
        assert!(!Expr::parse("!check-db.output").unwrap().is_true(&s));
    }

    #[test]
    fn missing_path_is_null() {
        let s = state();
        assert!(Expr::parse("nope.output == null").unwrap().is_true(&s));
        assert!(!Expr::parse("nope.output").unwrap().is_true(&s));
    }

    #[test]
    fn array_index_segments() {
        let s = state();
        assert_eq!(resolve_path(&s, "fetch.output.tags.1"), Some(json!("b")));
        assert_eq!(resolve_path(&s, "fetch.output.tags.9"), None);
    }

    #[test]
    fn malformed_expressions_report_specific_messages() {
        let err = Expr::parse("a == ").unwrap_err();
        assert!(err.contains("unexpected end"), "{}", err);

        let err = Expr::parse("a = 1").unwrap_err();
        assert!(err.contains("'=='"), "{}", err);

        let err = Expr::parse("(a == 1").unwrap_err();
        assert!(err.contains("')'"), "{}", err);

        let err = Expr::parse("a == 1 b").unwrap_err();
        assert!(err.contains("after complete expression"), "{}", err);

        assert!(Expr::parse("   ").is_err());
        assert!(Expr::parse(r#"x == "open"#).is_err());
    }
}
