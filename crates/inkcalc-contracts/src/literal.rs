//! Permissive literal-data parser.
//!
//! Accepts the list/dict syntax models tend to emit when asked for "a Python or
//! JSON-style list of dicts": single or double quoted strings (with optional
//! `r`/`u` prefixes, triple quotes and adjacent-literal concatenation), lists,
//! tuples, dicts, sets, integers in any radix, floats, `True`/`False`/`None`,
//! unary signs on numbers, complex numbers (`1j`, `2+3j`), trailing commas and
//! `#` comments.
//!
//! Tuples and sets become JSON arrays; non-string dict keys are rendered as
//! their JSON text; complex and non-finite numbers become strings. Lowercase `true`/`false`/`null` are rejected so strict JSON
//! goes through the JSON stage instead.

use serde_json::{Map, Number, Value};
use thiserror::Error;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct LiteralParseError {
    pub offset: usize,
    pub message: String,
}

pub fn parse_literal(text: &str) -> Result<Value, LiteralParseError> {
    let mut parser = LiteralParser::new(text);
    parser.skip_insignificant();
    let first = parser.parse_value(0)?;
    parser.skip_insignificant();

    // A bare `a, b` at the top level is a tuple.
    let value = if parser.peek() == Some(',') {
        let mut items = vec![first];
        while parser.eat(',') {
            parser.skip_insignificant();
            if parser.at_end() {
                break;
            }
            items.push(parser.parse_value(0)?);
            parser.skip_insignificant();
        }
        Value::Array(items)
    } else {
        first
    };

    if !parser.at_end() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(value)
}

struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            return true;
        }
        false
    }

    fn error(&self, message: impl Into<String>) -> LiteralParseError {
        LiteralParseError {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_insignificant(&mut self) {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('\\') if matches!(self.peek_nth(1), Some('\n')) => {
                    self.pos += 2;
                }
                Some('#') => {
                    while let Some(ch) = self.bump() {
                        if ch == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value, LiteralParseError> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('[') => {
                self.bump();
                let items = self.parse_sequence(']', depth)?;
                Ok(Value::Array(items))
            }
            Some('(') => self.parse_parenthesized(depth),
            Some('{') => self.parse_braced(depth),
            Some('+') | Some('-') => self.parse_number_value(),
            Some(ch) if ch.is_ascii_digit() => self.parse_number_value(),
            Some('.') if matches!(self.peek_nth(1), Some(d) if d.is_ascii_digit()) => {
                self.parse_number_value()
            }
            Some(ch) if ch == '\'' || ch == '"' || is_string_prefix_start(ch) => {
                if let Some(value) = self.try_parse_strings()? {
                    return Ok(value);
                }
                self.parse_name()
            }
            Some(ch) if ch.is_alphabetic() || ch == '_' => self.parse_name(),
            Some(ch) => Err(self.error(format!("unexpected character '{ch}'"))),
        }
    }

    fn parse_sequence(&mut self, close: char, depth: usize) -> Result<Vec<Value>, LiteralParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_insignificant();
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.parse_value(depth + 1)?);
            self.skip_insignificant();
            if self.eat(',') {
                continue;
            }
            if self.eat(close) {
                return Ok(items);
            }
            return Err(self.error(format!("expected ',' or '{close}'")));
        }
    }

    fn parse_parenthesized(&mut self, depth: usize) -> Result<Value, LiteralParseError> {
        self.bump();
        self.skip_insignificant();
        if self.eat(')') {
            return Ok(Value::Array(Vec::new()));
        }
        let first = self.parse_value(depth + 1)?;
        self.skip_insignificant();
        if self.eat(')') {
            return Ok(first);
        }
        if !self.eat(',') {
            return Err(self.error("expected ',' or ')'"));
        }
        let mut items = vec![first];
        items.extend(self.parse_sequence(')', depth)?);
        Ok(Value::Array(items))
    }

    fn parse_braced(&mut self, depth: usize) -> Result<Value, LiteralParseError> {
        self.bump();
        self.skip_insignificant();
        if self.eat('}') {
            return Ok(Value::Object(Map::new()));
        }
        let first = self.parse_value(depth + 1)?;
        self.skip_insignificant();
        if !self.eat(':') {
            // `{a, b}` is a set literal.
            if self.eat('}') {
                return Ok(Value::Array(vec![first]));
            }
            if !self.eat(',') {
                return Err(self.error("expected ':', ',' or '}'"));
            }
            let mut items = vec![first];
            items.extend(self.parse_sequence('}', depth)?);
            return Ok(Value::Array(items));
        }

        let mut map = Map::new();
        let mut key = first;
        loop {
            self.skip_insignificant();
            let value = self.parse_value(depth + 1)?;
            map.insert(dict_key(key), value);
            self.skip_insignificant();
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            if !self.eat(',') {
                return Err(self.error("expected ',' or '}'"));
            }
            self.skip_insignificant();
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            key = self.parse_value(depth + 1)?;
            self.skip_insignificant();
            if !self.eat(':') {
                return Err(self.error("expected ':' after dict key"));
            }
        }
    }

    fn parse_name(&mut self) -> Result<Value, LiteralParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if ch.is_alphanumeric() || ch == '_') {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            "None" => Ok(Value::Null),
            other => Err(LiteralParseError {
                offset: start,
                message: format!("unexpected name '{other}'"),
            }),
        }
    }

    /// A number, optionally followed by `+`/`-` and an imaginary part
    /// (`2+3j`). Anything else after the `+`/`-` is left for the caller.
    fn parse_number_value(&mut self) -> Result<Value, LiteralParseError> {
        let first = self.parse_signed_numeric()?;
        if let Numeric::Imaginary(_) = first {
            return Ok(first.into_value());
        }
        let mark = self.pos;
        self.skip_insignificant();
        if matches!(self.peek(), Some('+' | '-')) {
            if let Ok(Numeric::Imaginary(imag)) = self.parse_signed_numeric() {
                return Ok(Value::String(format_complex(first.as_f64(), imag)));
            }
        }
        self.pos = mark;
        Ok(first.into_value())
    }

    fn parse_signed_numeric(&mut self) -> Result<Numeric, LiteralParseError> {
        let mut negative = false;
        while let Some(sign @ ('+' | '-')) = self.peek() {
            self.bump();
            if sign == '-' {
                negative = !negative;
            }
            self.skip_insignificant();
        }
        match self.peek() {
            Some(ch) if ch.is_ascii_digit() || ch == '.' => self.parse_numeric(negative),
            _ => Err(self.error("unary sign must precede a number")),
        }
    }

    fn parse_numeric(&mut self, negative: bool) -> Result<Numeric, LiteralParseError> {
        let start = self.pos;
        if self.peek() == Some('0') {
            let radix = match self.peek_nth(1) {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits_start = self.pos;
                while matches!(self.peek(), Some(ch) if ch.is_digit(radix) || ch == '_') {
                    self.bump();
                }
                let digits = self.src[digits_start..self.pos].replace('_', "");
                if digits.is_empty() {
                    return Err(LiteralParseError {
                        offset: start,
                        message: "invalid integer literal".to_string(),
                    });
                }
                return Ok(match i64::from_str_radix(&digits, radix) {
                    Ok(parsed) => Numeric::Int(if negative { -parsed } else { parsed }),
                    Err(_) => {
                        let magnitude = digits.chars().fold(0f64, |acc, ch| {
                            acc * f64::from(radix) + f64::from(ch.to_digit(radix).unwrap_or(0))
                        });
                        Numeric::Float(if negative { -magnitude } else { magnitude })
                    }
                });
            }
        }

        let mut is_float = false;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_digit() || ch == '_') {
            self.bump();
        }
        if self.peek() == Some('.') {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(ch) if ch.is_ascii_digit() || ch == '_') {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let mark = self.pos;
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
                is_float = true;
                while matches!(self.peek(), Some(ch) if ch.is_ascii_digit() || ch == '_') {
                    self.bump();
                }
            } else {
                self.pos = mark;
            }
        }

        let literal = self.src[start..self.pos].replace('_', "");
        let imaginary = matches!(self.peek(), Some('j' | 'J'));
        if imaginary {
            self.bump();
        }
        if !is_float && !imaginary {
            if let Ok(parsed) = literal.parse::<i64>() {
                return Ok(Numeric::Int(if negative { -parsed } else { parsed }));
            }
        }
        let parsed = literal.parse::<f64>().map_err(|_| LiteralParseError {
            offset: start,
            message: format!("invalid number literal '{literal}'"),
        })?;
        let signed = if negative { -parsed } else { parsed };
        Ok(if imaginary {
            Numeric::Imaginary(signed)
        } else {
            Numeric::Float(signed)
        })
    }

    /// Parses one or more adjacent string literals. Returns `None` when the
    /// prefix letters turn out to be the start of a plain name.
    fn try_parse_strings(&mut self) -> Result<Option<Value>, LiteralParseError> {
        let mut combined: Option<String> = None;
        loop {
            let Some((prefix_len, raw)) = self.string_prefix() else {
                break;
            };
            self.pos += prefix_len;
            let piece = self.parse_quoted(raw)?;
            combined.get_or_insert_with(String::new).push_str(&piece);

            let mark = self.pos;
            self.skip_insignificant();
            if self.string_prefix().is_none() {
                self.pos = mark;
                break;
            }
        }
        Ok(combined.map(Value::String))
    }

    fn string_prefix(&self) -> Option<(usize, bool)> {
        let mut raw = false;
        let mut len = 0;
        for ch in self.rest().chars().take(3) {
            match ch {
                '\'' | '"' => return Some((len, raw)),
                'r' | 'R' if !raw => {
                    raw = true;
                    len += 1;
                }
                'u' | 'U' if len == 0 => len += 1,
                _ => return None,
            }
        }
        None
    }

    fn parse_quoted(&mut self, raw: bool) -> Result<String, LiteralParseError> {
        let start = self.pos;
        let Some(quote) = self.bump() else {
            return Err(self.error("expected a quote"));
        };
        let triple = self.peek() == Some(quote) && self.peek_nth(1) == Some(quote);
        if triple {
            self.pos += 2 * quote.len_utf8();
        }

        let mut out = String::new();
        loop {
            let Some(ch) = self.bump() else {
                return Err(LiteralParseError {
                    offset: start,
                    message: "unterminated string".to_string(),
                });
            };
            if ch == quote {
                if !triple {
                    return Ok(out);
                }
                if self.peek() == Some(quote) && self.peek_nth(1) == Some(quote) {
                    self.pos += 2 * quote.len_utf8();
                    return Ok(out);
                }
                out.push(ch);
                continue;
            }
            if ch == '\n' && !triple {
                return Err(LiteralParseError {
                    offset: start,
                    message: "unterminated string".to_string(),
                });
            }
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            let Some(escaped) = self.bump() else {
                return Err(self.error("unterminated escape"));
            };
            if raw {
                out.push('\\');
                out.push(escaped);
                continue;
            }
            self.push_escape(escaped, &mut out)?;
        }
    }

    fn push_escape(&mut self, escaped: char, out: &mut String) -> Result<(), LiteralParseError> {
        match escaped {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0C}'),
            'v' => out.push('\u{0B}'),
            'x' => out.push(self.hex_escape(2)?),
            'u' => out.push(self.hex_escape(4)?),
            'U' => out.push(self.hex_escape(8)?),
            '0'..='7' => {
                let mut code = escaped.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match self.peek().and_then(|ch| ch.to_digit(8)) {
                        Some(digit) => {
                            code = code * 8 + digit;
                            self.bump();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn hex_escape(&mut self, width: usize) -> Result<char, LiteralParseError> {
        let digits: String = self.rest().chars().take(width).collect();
        if digits.len() != width || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(self.error("truncated hex escape"));
        }
        self.pos += width;
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error("invalid unicode escape"))
    }
}

enum Numeric {
    Int(i64),
    Float(f64),
    Imaginary(f64),
}

impl Numeric {
    fn as_f64(&self) -> f64 {
        match self {
            Self::Int(value) => *value as f64,
            Self::Float(value) | Self::Imaginary(value) => *value,
        }
    }

    /// JSON has no complex or non-finite numbers; those become their
    /// literal spelling (`"1j"`, `"(2+3j)"`, `"inf"`).
    fn into_value(self) -> Value {
        match self {
            Self::Int(value) => Value::Number(Number::from(value)),
            Self::Float(value) => Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(format_component(value))),
            Self::Imaginary(value) => Value::String(format!("{}j", format_component(value))),
        }
    }
}

fn format_component(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e16 {
        return format!("{}", value as i64);
    }
    format!("{value}")
}

fn format_complex(real: f64, imag: f64) -> String {
    let sign = if imag.is_sign_negative() { '-' } else { '+' };
    format!(
        "({}{sign}{}j)",
        format_component(real),
        format_component(imag.abs())
    )
}

fn is_string_prefix_start(ch: char) -> bool {
    matches!(ch, 'r' | 'R' | 'u' | 'U')
}

fn dict_key(key: Value) -> String {
    match key {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
