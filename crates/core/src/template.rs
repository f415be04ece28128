//! `#{...}` placeholder handling.
//!
//! Two flavours share the syntax. Directive arguments reference context
//! paths (`#{db_path}`, `#{db_directory}`, `#{base_directory}`), and
//! series templates embed integer expressions over the row counter `i`
//! (`{"_key": "k#{i}", "n": #{i * 2 + 1}}`).

use serde_json::Value;

use crate::error::CoreError;

/// Replace every `#{name}` for which `lookup` knows a value. Unknown
/// placeholders are left untouched.
pub fn expand_variables(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("#{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name.trim()) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("#{");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(i64),
    Counter,
    Negate(Box<Expr>),
    Binary(Box<Expr>, char, Box<Expr>),
}

impl Expr {
    fn eval(&self, i: i64) -> Result<i64, CoreError> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Counter => Ok(i),
            Self::Negate(inner) => Ok(inner.eval(i)?.wrapping_neg()),
            Self::Binary(lhs, op, rhs) => {
                let (a, b) = (lhs.eval(i)?, rhs.eval(i)?);
                match op {
                    '+' => Ok(a.wrapping_add(b)),
                    '-' => Ok(a.wrapping_sub(b)),
                    '*' => Ok(a.wrapping_mul(b)),
                    '/' | '%' if b == 0 => {
                        Err(CoreError::Template(format!("division by zero at i={i}")))
                    }
                    '/' => a
                        .checked_div_euclid(b)
                        .ok_or_else(|| CoreError::Template(format!("overflow in {a} / {b} at i={i}"))),
                    _ => a
                        .checked_rem_euclid(b)
                        .ok_or_else(|| CoreError::Template(format!("overflow in {a} % {b} at i={i}"))),
                }
            }
        }
    }
}

/// Recursive descent over `+ - * / %`, unary minus and parentheses.
struct ExprParser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    source: &'a str,
}

impl<'a> ExprParser<'a> {
    fn parse(source: &'a str) -> Result<Expr, CoreError> {
        let mut parser = Self {
            chars: source.chars().peekable(),
            source,
        };
        let expr = parser.sum()?;
        parser.skip_whitespace();
        match parser.chars.next() {
            None => Ok(expr),
            Some(c) => Err(parser.error(&format!("unexpected <{c}>"))),
        }
    }

    fn error(&self, message: &str) -> CoreError {
        CoreError::Template(format!("{message} in <{}>", self.source))
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn sum(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.product()?;
        loop {
            self.skip_whitespace();
            match self.chars.next_if(|c| matches!(c, '+' | '-')) {
                Some(op) => lhs = Expr::Binary(Box::new(lhs), op, Box::new(self.product()?)),
                None => return Ok(lhs),
            }
        }
    }

    fn product(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.unary()?;
        loop {
            self.skip_whitespace();
            match self.chars.next_if(|c| matches!(c, '*' | '/' | '%')) {
                Some(op) => lhs = Expr::Binary(Box::new(lhs), op, Box::new(self.unary()?)),
                None => return Ok(lhs),
            }
        }
    }

    fn unary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();
        if self.chars.next_if_eq(&'-').is_some() {
            return Ok(Expr::Negate(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();
        match self.chars.peek().copied() {
            Some('(') => {
                self.chars.next();
                let inner = self.sum()?;
                self.skip_whitespace();
                if self.chars.next_if_eq(&')').is_none() {
                    return Err(self.error("missing )"));
                }
                Ok(inner)
            }
            Some('i') => {
                self.chars.next();
                Ok(Expr::Counter)
            }
            Some(c) if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(d) = self.chars.next_if(char::is_ascii_digit) {
                    digits.push(d);
                }
                digits
                    .parse()
                    .map(Expr::Number)
                    .map_err(|_| self.error("number out of range"))
            }
            Some(c) => Err(self.error(&format!("unexpected <{c}>"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expr(Expr),
}

/// A compiled series record template.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesTemplate {
    segments: Vec<Segment>,
}

impl SeriesTemplate {
    pub fn compile(template: &str) -> Result<Self, CoreError> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("#{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| CoreError::Template(format!("unterminated #{{ in <{template}>")))?;
            segments.push(Segment::Expr(ExprParser::parse(&after[..end])?));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(Self { segments })
    }

    /// Render the record text for counter `i`.
    pub fn render(&self, i: i64) -> Result<String, CoreError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&expr.eval(i)?.to_string()),
            }
        }
        Ok(out)
    }

    /// Render and check that the result is one JSON value. The returned
    /// text is the compact serialization.
    pub fn render_json(&self, i: i64) -> Result<String, CoreError> {
        let text = self.render(i)?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::Template(format!("{e}: <{text}>")))?;
        Ok(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
