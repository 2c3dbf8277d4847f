//! Sandboxed expression language used by rules, observers, transition
//! conditions and pipeline steps.
//!
//! The grammar is a restricted boolean/arithmetic/comparison language over
//! a read-only variable context plus a closed helper whitelist. There is no
//! I/O, no mutation, no recursion into caller code and no host-language
//! evaluation; parsing and evaluation are a terminating function of the
//! expression string.

use serde_json::{Map, Number, Value};

/// Expressions longer than this are rejected before tokenization.
pub const MAX_EXPRESSION_BYTES: usize = 4_096;
/// Maximum nesting depth accepted by the parser.
pub const MAX_PARSE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("expression exceeds {MAX_EXPRESSION_BYTES} bytes")]
    TooLong,
    #[error("expression nests deeper than {MAX_PARSE_DEPTH} levels")]
    TooDeep,
    #[error("syntax error at byte {at}: {reason}")]
    Syntax { at: usize, reason: String },
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid pattern for matches(): {0}")]
    InvalidPattern(String),
}

/// Evaluates `expression` against `context` and returns the resulting value.
pub fn evaluate(expression: &str, context: &Map<String, Value>) -> Result<Value, ExprError> {
    let ast = parse(expression)?;
    eval(&ast, context)
}

/// Evaluates `expression` as a predicate. Callers that want fail-open
/// semantics catch the error, log a diagnostic and treat it as `false`.
pub fn evaluate_predicate(
    expression: &str,
    context: &Map<String, Value>,
) -> Result<bool, ExprError> {
    Ok(truthy(&evaluate(expression, context)?))
}

/// The language's truthiness rules: null and empty collections are false,
/// numbers are false only at zero.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Integer(i64),
    Str(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Dot,
}

fn syntax(at: usize, reason: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        at,
        reason: reason.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let ch = bytes[pos] as char;
        match ch {
            ' ' | '\t' | '\r' | '\n' => pos += 1,
            '(' => {
                tokens.push((pos, Token::LParen));
                pos += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                pos += 1;
            }
            ',' => {
                tokens.push((pos, Token::Comma));
                pos += 1;
            }
            '.' => {
                tokens.push((pos, Token::Dot));
                pos += 1;
            }
            '+' => {
                tokens.push((pos, Token::Plus));
                pos += 1;
            }
            '-' => {
                tokens.push((pos, Token::Minus));
                pos += 1;
            }
            '*' => {
                tokens.push((pos, Token::Star));
                pos += 1;
            }
            '/' => {
                tokens.push((pos, Token::Slash));
                pos += 1;
            }
            '%' => {
                tokens.push((pos, Token::Percent));
                pos += 1;
            }
            '=' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::Eq));
                    pos += 2;
                } else {
                    return Err(syntax(pos, "assignment is not supported; use `==`"));
                }
            }
            '!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::Ne));
                    pos += 2;
                } else {
                    tokens.push((pos, Token::Not));
                    pos += 1;
                }
            }
            '<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::Le));
                    pos += 2;
                } else {
                    tokens.push((pos, Token::Lt));
                    pos += 1;
                }
            }
            '>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    tokens.push((pos, Token::Ge));
                    pos += 2;
                } else {
                    tokens.push((pos, Token::Gt));
                    pos += 1;
                }
            }
            '&' => {
                if bytes.get(pos + 1) == Some(&b'&') {
                    tokens.push((pos, Token::And));
                    pos += 2;
                } else {
                    return Err(syntax(pos, "single `&` is not an operator"));
                }
            }
            '|' => {
                if bytes.get(pos + 1) == Some(&b'|') {
                    tokens.push((pos, Token::Or));
                    pos += 2;
                } else {
                    return Err(syntax(pos, "single `|` is not an operator"));
                }
            }
            '\'' | '"' => {
                let quote = ch;
                let start = pos;
                pos += 1;
                let mut literal = String::new();
                let mut closed = false;
                // Literals may hold arbitrary UTF-8; walk chars, not bytes.
                while let Some(c) = input[pos..].chars().next() {
                    if c == quote {
                        closed = true;
                        pos += 1;
                        break;
                    }
                    if c == '\\' {
                        if let Some(escaped) = input[pos + 1..].chars().next() {
                            literal.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            pos += 1 + escaped.len_utf8();
                            continue;
                        }
                    }
                    literal.push(c);
                    pos += c.len_utf8();
                }
                if !closed {
                    return Err(syntax(start, "unterminated string literal"));
                }
                tokens.push((start, Token::Str(literal)));
            }
            '0'..='9' => {
                let start = pos;
                let mut is_float = false;
                while pos < bytes.len() {
                    let c = bytes[pos] as char;
                    if c.is_ascii_digit() {
                        pos += 1;
                    } else if c == '.'
                        && !is_float
                        && bytes
                            .get(pos + 1)
                            .map(|b| (*b as char).is_ascii_digit())
                            .unwrap_or(false)
                    {
                        is_float = true;
                        pos += 1;
                    } else {
                        break;
                    }
                }
                let raw = &input[start..pos];
                if is_float {
                    let value = raw
                        .parse::<f64>()
                        .map_err(|_| syntax(start, format!("invalid number `{raw}`")))?;
                    tokens.push((start, Token::Number(value)));
                } else {
                    let value = raw
                        .parse::<i64>()
                        .map_err(|_| syntax(start, format!("integer `{raw}` is out of range")))?;
                    tokens.push((start, Token::Integer(value)));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < bytes.len() {
                    let c = bytes[pos] as char;
                    if c.is_ascii_alphanumeric() || c == '_' {
                        pos += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..pos];
                let token = match word {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    other => Token::Ident(other.to_string()),
                };
                tokens.push((start, token));
            }
            other => return Err(syntax(pos, format!("unexpected character `{other}`"))),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Len,
    Contains,
    Matches,
}

impl Func {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Self::Len),
            "contains" => Some(Self::Contains),
            "matches" => Some(Self::Matches),
            _ => None,
        }
    }

    fn arity(self) -> usize {
        match self {
            Self::Len => 1,
            Self::Contains | Self::Matches => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone)]
enum Ast {
    Literal(Value),
    Path(Vec<String>),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Call(Func, Vec<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
}

fn parse(input: &str) -> Result<Ast, ExprError> {
    if input.len() > MAX_EXPRESSION_BYTES {
        return Err(ExprError::TooLong);
    }
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(syntax(0, "empty expression"));
    }
    let mut parser = Parser { tokens, cursor: 0 };
    let ast = parser.parse_or(0)?;
    if let Some((at, _)) = parser.peek_at() {
        return Err(syntax(at, "trailing input after expression"));
    }
    Ok(ast)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, token)| token)
    }

    fn peek_at(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.cursor).map(|(at, token)| (*at, token))
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|(_, token)| token.clone());
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .or_else(|| self.tokens.last())
            .map(|(at, _)| *at)
            .unwrap_or(0)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        let at = self.position();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(syntax(at, format!("expected {what}"))),
        }
    }

    fn guard_depth(&self, depth: usize) -> Result<usize, ExprError> {
        if depth >= MAX_PARSE_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(depth + 1)
    }

    fn parse_or(&mut self, depth: usize) -> Result<Ast, ExprError> {
        let depth = self.guard_depth(depth)?;
        let mut left = self.parse_and(depth)?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and(depth)?;
            left = Ast::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self, depth: usize) -> Result<Ast, ExprError> {
        let depth = self.guard_depth(depth)?;
        let mut left = self.parse_comparison(depth)?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison(depth)?;
            left = Ast::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self, depth: usize) -> Result<Ast, ExprError> {
        let depth = self.guard_depth(depth)?;
        let mut left = self.parse_additive(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::In) => BinOp::In,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive(depth)?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self, depth: usize) -> Result<Ast, ExprError> {
        let depth = self.guard_depth(depth)?;
        let mut left = self.parse_multiplicative(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative(depth)?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self, depth: usize) -> Result<Ast, ExprError> {
        let depth = self.guard_depth(depth)?;
        let mut left = self.parse_unary(depth)?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary(depth)?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self, depth: usize) -> Result<Ast, ExprError> {
        let depth = self.guard_depth(depth)?;
        match self.peek() {
            Some(Token::Not) => {
                self.advance();
                Ok(Ast::Unary(UnaryOp::Not, Box::new(self.parse_unary(depth)?)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Ast::Unary(UnaryOp::Neg, Box::new(self.parse_unary(depth)?)))
            }
            _ => self.parse_primary(depth),
        }
    }

    fn parse_primary(&mut self, depth: usize) -> Result<Ast, ExprError> {
        let depth = self.guard_depth(depth)?;
        let at = self.position();
        match self.advance() {
            Some(Token::Integer(value)) => Ok(Ast::Literal(Value::from(value))),
            Some(Token::Number(value)) => Number::from_f64(value)
                .map(|n| Ast::Literal(Value::Number(n)))
                .ok_or_else(|| syntax(at, "non-finite number literal")),
            Some(Token::Str(value)) => Ok(Ast::Literal(Value::String(value))),
            Some(Token::True) => Ok(Ast::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Ast::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Ast::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_or(depth)?;
                self.expect(Token::RParen, "closing `)`")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let func = Func::parse(&name)
                        .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or(depth)?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.advance();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen, "closing `)` after arguments")?;
                    if args.len() != func.arity() {
                        return Err(syntax(
                            at,
                            format!("`{name}` takes {} argument(s)", func.arity()),
                        ));
                    }
                    return Ok(Ast::Call(func, args));
                }
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    let at = self.position();
                    match self.advance() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => return Err(syntax(at, "expected identifier after `.`")),
                    }
                }
                Ok(Ast::Path(path))
            }
            _ => Err(syntax(at, "expected a value")),
        }
    }
}

fn resolve_path(path: &[String], context: &Map<String, Value>) -> Result<Value, ExprError> {
    let mut current = context
        .get(&path[0])
        .ok_or_else(|| ExprError::UnknownIdentifier(path.join(".")))?;
    for segment in &path[1..] {
        current = current
            .as_object()
            .and_then(|object| object.get(segment))
            .ok_or_else(|| ExprError::UnknownIdentifier(path.join(".")))?;
    }
    Ok(current.clone())
}

fn number_pair(left: &Value, right: &Value) -> Option<(f64, f64)> {
    Some((left.as_f64()?, right.as_f64()?))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let Some((a, b)) = number_pair(left, right) {
        return a == b;
    }
    left == right
}

fn compare(op: BinOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    if let Some((a, b)) = number_pair(left, right) {
        return Ok(match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            _ => unreachable!(),
        });
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(match op {
            BinOp::Lt => a < b,
            BinOp::Le => a <= b,
            BinOp::Gt => a > b,
            BinOp::Ge => a >= b,
            _ => unreachable!(),
        });
    }
    Err(ExprError::Type(
        "ordering comparison requires two numbers or two strings".to_string(),
    ))
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::String(text) => match needle {
            Value::String(sub) => Ok(text.contains(sub.as_str())),
            _ => Err(ExprError::Type(
                "string membership requires a string needle".to_string(),
            )),
        },
        Value::Object(fields) => match needle {
            Value::String(key) => Ok(fields.contains_key(key)),
            _ => Err(ExprError::Type(
                "object membership requires a string key".to_string(),
            )),
        },
        _ => Err(ExprError::Type(
            "`in` requires an array, string or object on the right".to_string(),
        )),
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    if op == BinOp::Add {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }

    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.checked_div(b)
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(ExprError::DivisionByZero);
                }
                a.checked_rem(b)
            }
            _ => unreachable!(),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| ExprError::Type("integer overflow".to_string()));
    }

    let (a, b) = number_pair(left, right)
        .ok_or_else(|| ExprError::Type("arithmetic requires numbers".to_string()))?;
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            a % b
        }
        _ => unreachable!(),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type("non-finite arithmetic result".to_string()))
}

fn call(func: Func, args: &[Value]) -> Result<Value, ExprError> {
    match func {
        Func::Len => {
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(fields) => fields.len(),
                _ => {
                    return Err(ExprError::Type(
                        "len() requires a string, array or object".to_string(),
                    ))
                }
            };
            Ok(Value::from(len as u64))
        }
        Func::Contains => Ok(Value::Bool(membership(&args[1], &args[0])?)),
        Func::Matches => {
            let text = args[0].as_str().ok_or_else(|| {
                ExprError::Type("matches() requires a string subject".to_string())
            })?;
            let pattern = args[1].as_str().ok_or_else(|| {
                ExprError::Type("matches() requires a string pattern".to_string())
            })?;
            let re = regex::Regex::new(pattern)
                .map_err(|err| ExprError::InvalidPattern(err.to_string()))?;
            Ok(Value::Bool(re.is_match(text)))
        }
    }
}

fn eval(ast: &Ast, context: &Map<String, Value>) -> Result<Value, ExprError> {
    match ast {
        Ast::Literal(value) => Ok(value.clone()),
        Ast::Path(path) => resolve_path(path, context),
        Ast::Unary(op, inner) => {
            let value = eval(inner, context)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => {
                    if let Some(i) = value.as_i64() {
                        return i
                            .checked_neg()
                            .map(Value::from)
                            .ok_or_else(|| ExprError::Type("integer overflow".to_string()));
                    }
                    let f = value
                        .as_f64()
                        .ok_or_else(|| ExprError::Type("unary minus requires a number".to_string()))?;
                    Number::from_f64(-f)
                        .map(Value::Number)
                        .ok_or_else(|| ExprError::Type("non-finite negation".to_string()))
                }
            }
        }
        Ast::Binary(op, left, right) => match op {
            // Short-circuit forms return the boolean, not the operand, so
            // downstream comparisons stay type-stable.
            BinOp::Or => {
                if truthy(&eval(left, context)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&eval(right, context)?)))
            }
            BinOp::And => {
                if !truthy(&eval(left, context)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&eval(right, context)?)))
            }
            BinOp::Eq => {
                let (a, b) = (eval(left, context)?, eval(right, context)?);
                Ok(Value::Bool(values_equal(&a, &b)))
            }
            BinOp::Ne => {
                let (a, b) = (eval(left, context)?, eval(right, context)?);
                Ok(Value::Bool(!values_equal(&a, &b)))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (a, b) = (eval(left, context)?, eval(right, context)?);
                Ok(Value::Bool(compare(*op, &a, &b)?))
            }
            BinOp::In => {
                let (a, b) = (eval(left, context)?, eval(right, context)?);
                Ok(Value::Bool(membership(&a, &b)?))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let (a, b) = (eval(left, context)?, eval(right, context)?);
                arithmetic(*op, &a, &b)
            }
        },
        Ast::Call(func, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, context)?);
            }
            call(*func, &values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().expect("object context").clone()
    }

    #[test]
    fn comparison_and_boolean_operators() {
        let context = ctx(json!({"x": 10, "name": "build"}));
        assert_eq!(
            evaluate("x > 5 and name == 'build'", &context).expect("eval"),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("not (x >= 10) || x == 10", &context).expect("eval"),
            Value::Bool(true)
        );
    }

    #[test]
    fn dotted_paths_resolve_nested_objects() {
        let context = ctx(json!({"event": {"tool": "Edit", "count": 3}}));
        assert_eq!(
            evaluate("event.tool == 'Edit' and event.count + 1 == 4", &context).expect("eval"),
            Value::Bool(true)
        );
    }

    #[test]
    fn helper_whitelist() {
        let context = ctx(json!({"files": ["a.rs", "b.rs"], "cmd": "git push origin"}));
        assert_eq!(
            evaluate("len(files)", &context).expect("eval"),
            Value::from(2_u64)
        );
        assert_eq!(
            evaluate("contains(files, 'a.rs')", &context).expect("eval"),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("'b.rs' in files", &context).expect("eval"),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("matches(cmd, '^git push')", &context).expect("eval"),
            Value::Bool(true)
        );
    }

    #[test]
    fn division_by_zero_is_an_error_not_a_panic() {
        let err = evaluate("1/0", &Map::new()).expect_err("must fail");
        assert!(matches!(err, ExprError::DivisionByZero));
    }

    #[test]
    fn host_escape_attempts_fail_closed() {
        assert!(matches!(
            evaluate("os.system('x')", &Map::new()).expect_err("must fail"),
            ExprError::UnknownFunction(_) | ExprError::UnknownIdentifier(_)
        ));
        assert!(evaluate("__import__('os')", &Map::new()).is_err());
        assert!(!evaluate_predicate("os.system('x')", &Map::new()).unwrap_or(false));
    }

    #[test]
    fn unknown_identifier_is_reported() {
        let err = evaluate("missing_var", &Map::new()).expect_err("must fail");
        assert!(matches!(err, ExprError::UnknownIdentifier(_)));
    }

    #[test]
    fn pathological_nesting_is_rejected() {
        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(
            evaluate(&deep, &Map::new()).expect_err("must fail"),
            ExprError::TooDeep
        ));
    }

    #[test]
    fn oversized_expressions_are_rejected() {
        let long = format!("1 + {}", "1 + ".repeat(2_000));
        assert!(evaluate(&long, &Map::new()).is_err());
    }

    #[test]
    fn string_concat_and_mixed_numbers() {
        let context = ctx(json!({"a": 1.5}));
        assert_eq!(
            evaluate("'re' + 'view'", &context).expect("eval"),
            Value::String("review".to_string())
        );
        assert_eq!(
            evaluate("a * 2 == 3.0", &context).expect("eval"),
            Value::Bool(true)
        );
    }

    #[test]
    fn truthiness_rules() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("x")));
        assert!(!truthy(&json!(0)));
        assert!(truthy(&json!([1])));
        assert!(!truthy(&json!([])));
    }
}
