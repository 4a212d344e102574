//! Bounded boolean expressions over workflow context.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := operand (("==" | "!=" | ">" | ">=" | "<" | "<=" | "contains" | "in") operand)?
//! operand := number | string | true | false | null | path | "[" list "]" | "(" or ")"
//! ```
//!
//! Paths are dotted (`invoice.lines.0.amount`); a missing path is `null`.
//! There are no function calls, assignments or loops.

use serde_json::{Map, Value};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::CompareOp;

pub const MAX_EXPRESSION_LEN: usize = 1024;
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    And,
    Or,
    Not,
    Cmp(CompareOp),
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Path(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Path(String),
    List(Vec<Node>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CompareOp, Box<Node>, Box<Node>),
}

/// A parsed, validated condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        if source.len() > MAX_EXPRESSION_LEN {
            return Err(invalid(format!(
                "expression exceeds {} characters",
                MAX_EXPRESSION_LEN
            )));
        }
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(invalid("expression is empty".into()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a JSON object. Pure: same data, same answer.
    pub fn evaluate(&self, data: &Map<String, Value>) -> bool {
        truthy(&eval(&self.root, data))
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, data: &Map<String, Value>) -> Result<bool> {
    Ok(Expression::parse(source)?.evaluate(data))
}

fn invalid(message: String) -> TrellisError {
    TrellisError::Validation(format!("invalid expression: {}", message))
}

/// Resolve a dotted path in a JSON object. Numeric segments index arrays.
pub fn lookup<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(invalid(format!("expected '{}{}' at position {}", c, c, i)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '>' | '<' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_eq) {
                    ('=', true) => Token::Cmp(CompareOp::Eq),
                    ('!', true) => Token::Cmp(CompareOp::Ne),
                    ('>', true) => Token::Cmp(CompareOp::Gte),
                    ('<', true) => Token::Cmp(CompareOp::Lte),
                    ('>', false) => Token::Cmp(CompareOp::Gt),
                    ('<', false) => Token::Cmp(CompareOp::Lt),
                    ('!', false) => Token::Not,
                    _ => return Err(invalid(format!("unexpected '=' at position {}", i))),
                };
                tokens.push(token);
                i += if next_eq { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string".into())),
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                value.push(escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("bad number '{}'", text)))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word.ends_with('.') || word.contains("..") {
                    return Err(invalid(format!("bad path '{}'", word)));
                }
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Cmp(CompareOp::Contains),
                    "in" => Token::Cmp(CompareOp::In),
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Path(word),
                });
            }
            other => {
                return Err(invalid(format!(
                    "unexpected character '{}' at position {}",
                    other, i
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
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

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(invalid(format!("nesting deeper than {}", MAX_DEPTH)));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Node> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Node> {
        let left = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Node::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Node::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Node::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Node::Literal(Value::Null)),
            Some(Token::Path(p)) => Ok(Node::Path(p)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                if self.next() != Some(Token::RParen) {
                    return Err(invalid("missing ')'".into()));
                }
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.descend()?;
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                } else {
                    loop {
                        items.push(self.parse_operand()?);
                        match self.next() {
                            Some(Token::Comma) => continue,
                            Some(Token::RBracket) => break,
                            _ => return Err(invalid("expected ',' or ']' in list".into())),
                        }
                    }
                }
                self.depth -= 1;
                Ok(Node::List(items))
            }
            Some(other) => Err(invalid(format!("unexpected token {:?}", other))),
            None => Err(invalid("unexpected end of expression".into())),
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn eval(node: &Node, data: &Map<String, Value>) -> Value {
    match node {
        Node::Literal(v) => v.clone(),
        Node::Path(p) => lookup(data, p).cloned().unwrap_or(Value::Null),
        Node::List(items) => Value::Array(items.iter().map(|n| eval(n, data)).collect()),
        Node::Not(inner) => Value::Bool(!truthy(&eval(inner, data))),
        Node::And(l, r) => Value::Bool(truthy(&eval(l, data)) && truthy(&eval(r, data))),
        Node::Or(l, r) => Value::Bool(truthy(&eval(l, data)) || truthy(&eval(r, data))),
        Node::Compare(op, l, r) => Value::Bool(compare(*op, &eval(l, data), &eval(r, data))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Numbers, and strings that parse as numbers, coerce to f64.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

/// Binary comparison shared by condition expressions and trigger field
/// conditions. `exists` and `changed` are not binary and always yield false.
pub fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(left, right),
        CompareOp::Ne => !loosely_equal(left, right),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let ordering = match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => match (left.as_str(), right.as_str()) {
                    (Some(a), Some(b)) => Some(a.cmp(b)),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CompareOp::Gt => ordering.is_gt(),
                CompareOp::Gte => ordering.is_ge(),
                CompareOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }
        }
        CompareOp::Contains => match left {
            Value::String(s) => right.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|item| loosely_equal(item, right)),
            Value::Object(map) => right.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
        },
        CompareOp::In => match right {
            Value::Array(items) => items.iter().any(|item| loosely_equal(left, item)),
            Value::String(s) => left.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Object(map) => left.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
        },
        CompareOp::Exists | CompareOp::Changed => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn numeric_comparisons() {
        let ctx = data(json!({"amount": 500, "limit": "1000"}));
        assert!(!evaluate("amount > 1000", &ctx).unwrap());
        assert!(evaluate("amount <= 500", &ctx).unwrap());
        assert!(evaluate("amount < limit", &ctx).unwrap());
        assert!(evaluate("amount == 500.0", &ctx).unwrap());
        assert!(evaluate("amount >= -1", &ctx).unwrap());
    }

    #[test]
    fn logical_operators_and_precedence() {
        let ctx = data(json!({"a": true, "b": false, "c": true}));
        assert!(evaluate("a || b && c", &ctx).unwrap());
        assert!(!evaluate("(a || b) && !c", &ctx).unwrap());
        assert!(evaluate("not b and c", &ctx).unwrap());
        assert!(evaluate("a or b", &ctx).unwrap());
    }

    #[test]
    fn strings_lists_and_contains() {
        let ctx = data(json!({
            "status": "approved",
            "tags": ["urgent", "finance"],
            "vendor": {"name": "Acme Corp", "country": "DE"}
        }));
        assert!(evaluate("status == \"approved\"", &ctx).unwrap());
        assert!(evaluate("status != 'rejected'", &ctx).unwrap());
        assert!(evaluate("tags contains \"urgent\"", &ctx).unwrap());
        assert!(evaluate("vendor.name contains \"Acme\"", &ctx).unwrap());
        assert!(evaluate("vendor.country in [\"DE\", \"FR\"]", &ctx).unwrap());
        assert!(!evaluate("vendor.country in []", &ctx).unwrap());
    }

    #[test]
    fn missing_paths_are_null() {
        let ctx = data(json!({"a": 1}));
        assert!(evaluate("missing == null", &ctx).unwrap());
        assert!(!evaluate("missing > 0", &ctx).unwrap());
        assert!(!evaluate("missing", &ctx).unwrap());
        assert!(evaluate("a", &ctx).unwrap());
    }

    #[test]
    fn malformed_expressions_rejected() {
        for bad in ["", "amount >", "(a == 1", "a = 1", "a & b", "\"open", "a..b == 1", "a == 1 )"] {
            assert!(Expression::parse(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn limits_enforced() {
        let long = format!("a == \"{}\"", "x".repeat(MAX_EXPRESSION_LEN));
        assert!(Expression::parse(&long).is_err());

        let deep = format!("{}a{}", "(".repeat(MAX_DEPTH + 1), ")".repeat(MAX_DEPTH + 1));
        assert!(Expression::parse(&deep).is_err());

        let ok = format!("{}a{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert!(Expression::parse(&ok).is_ok());
    }

    #[test]
    fn evaluation_is_pure() {
        let expr = Expression::parse("amount > 1000 && region == \"eu\"").unwrap();
        let ctx = data(json!({"amount": 1500, "region": "eu"}));
        let first = expr.evaluate(&ctx);
        for _ in 0..10 {
            assert_eq!(expr.evaluate(&ctx), first);
        }
        assert!(first);
    }
}
