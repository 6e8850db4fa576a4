//! Constrained parser for generated pipeline text
//!
//! Accepts the JSON-like aggregation syntax models produce (both JSON and
//! Python literal spellings), plus `datetime(...)`, `ObjectId("...")` and
//! `ISODate("...")` literals. Any other identifier or call is rejected.

use super::pipeline::{parse_datetime, Bson, Document, Pipeline};
use super::QueryError;
use crate::llm::strip_code_fence;
use chrono::NaiveDate;

/// Deepest array/document nesting accepted in generated text
pub(crate) const MAX_NESTING: usize = 64;

/// Parse generated text into a validated pipeline
pub fn parse_pipeline(text: &str) -> Result<Pipeline, QueryError> {
    let value = parse_value_text(text)?;
    Pipeline::from_bson(value)
}

/// Parse generated text into a bare value, without stage validation
pub(crate) fn parse_value_text(text: &str) -> Result<Bson, QueryError> {
    let mut parser = Parser::new(strip_code_fence(text));
    parser.skip_prelude();
    let value = parser.value()?;
    parser.skip_trivia();
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            depth: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn expect(&mut self, wanted: char) -> Result<(), QueryError> {
        self.skip_trivia();
        match self.peek() {
            Some(c) if c == wanted => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{wanted}', found '{c}'"))),
            None => Err(self.error(format!("expected '{wanted}', found end of input"))),
        }
    }

    fn starts_with(&self, word: &str) -> bool {
        let mut idx = self.pos;
        for c in word.chars() {
            if self.chars.get(idx) != Some(&c) {
                return false;
            }
            idx += 1;
        }
        true
    }

    /// Whitespace and `#` line comments
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '#' {
                self.skip_line();
            } else {
                break;
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    /// `import datetime` lines and a leading `name =` assignment
    fn skip_prelude(&mut self) {
        loop {
            self.skip_trivia();
            if self.starts_with("import datetime") || self.starts_with("from datetime import") {
                self.skip_line();
                continue;
            }
            let mark = self.pos;
            let ident = self.identifier();
            if !ident.is_empty() && !ident.contains('.') {
                self.skip_trivia();
                if self.peek() == Some('=') {
                    self.pos += 1;
                    continue;
                }
            }
            self.pos = mark;
            break;
        }
    }

    fn identifier(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || (c == '$' && out.is_empty()) {
                out.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        out
    }

    fn value(&mut self) -> Result<Bson, QueryError> {
        self.skip_trivia();
        match self.peek() {
            Some('[') => self.nested(Self::array),
            Some('{') => self.nested(Self::document).map(Bson::Document),
            Some('"' | '\'') => self.string().map(Bson::String),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.word(),
            Some(c) => Err(self.error(format!("unexpected character '{c}'"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, QueryError>,
    ) -> Result<T, QueryError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error(format!("nesting deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn array(&mut self) -> Result<Bson, QueryError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Ok(Bson::Array(items));
            }
            items.push(self.value()?);
            self.skip_trivia();
            match self.bump() {
                Some(',') => {}
                Some(']') => return Ok(Bson::Array(items)),
                Some(c) => {
                    self.pos -= 1;
                    return Err(self.error(format!("expected ',' or ']', found '{c}'")));
                }
                None => return Err(self.error("unterminated array")),
            }
        }
    }

    fn document(&mut self) -> Result<Document, QueryError> {
        self.expect('{')?;
        let mut doc = Document::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(doc);
            }
            let key = self.key()?;
            if doc.contains_key(&key) {
                return Err(self.error(format!("duplicate key '{key}'")));
            }
            self.expect(':')?;
            let value = self.value()?;
            doc.insert(key, value);
            self.skip_trivia();
            match self.bump() {
                Some(',') => {}
                Some('}') => return Ok(doc),
                Some(c) => {
                    self.pos -= 1;
                    return Err(self.error(format!("expected ',' or '}}', found '{c}'")));
                }
                None => return Err(self.error("unterminated document")),
            }
        }
    }

    fn key(&mut self) -> Result<String, QueryError> {
        match self.peek() {
            Some('"' | '\'') => self.string(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => Ok(self.identifier()),
            Some(c) => Err(self.error(format!("expected a key, found '{c}'"))),
            None => Err(self.error("expected a key, found end of input")),
        }
    }

    fn string(&mut self) -> Result<String, QueryError> {
        let Some(quote) = self.bump() else {
            return Err(self.error("expected a string"));
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('u') => self.unicode_escape()?,
                        Some(c @ ('"' | '\'' | '\\' | '/')) => c,
                        Some(c) => return Err(self.error(format!("unknown escape '\\{c}'"))),
                        None => return Err(self.error("unterminated string")),
                    };
                    out.push(escaped);
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn unicode_escape(&mut self) -> Result<char, QueryError> {
        let mut code = 0u32;
        for _ in 0..4 {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("invalid \\u escape"))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| self.error("invalid \\u escape"))
    }

    fn number(&mut self) -> Result<Bson, QueryError> {
        let start = self.pos;
        let mut text = String::new();
        let mut is_float = false;
        if self.peek() == Some('-') {
            text.push('-');
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => text.push(c),
                '.' | 'e' | 'E' => {
                    is_float = true;
                    text.push(c);
                }
                '+' | '-' if text.ends_with('e') || text.ends_with('E') => text.push(c),
                _ => break,
            }
            self.pos += 1;
        }

        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Bson::Int(i));
            }
        }
        text.parse::<f64>().map(Bson::Double).map_err(|_| QueryError::Parse {
            position: start,
            message: format!("invalid number '{text}'"),
        })
    }

    /// Keyword literals and the three permitted calls
    fn word(&mut self) -> Result<Bson, QueryError> {
        let start = self.pos;
        let ident = self.identifier();
        match ident.as_str() {
            "true" | "True" => Ok(Bson::Bool(true)),
            "false" | "False" => Ok(Bson::Bool(false)),
            "null" | "None" => Ok(Bson::Null),
            "datetime" | "datetime.datetime" => self.datetime_call(),
            "ObjectId" => {
                let hex = self.string_call()?;
                if hex.len() == 24 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    Ok(Bson::ObjectId(hex.to_ascii_lowercase()))
                } else {
                    Err(self.error(format!("invalid ObjectId '{hex}'")))
                }
            }
            "ISODate" => {
                let text = self.string_call()?;
                parse_datetime(&text)
                    .map(Bson::DateTime)
                    .ok_or_else(|| self.error(format!("invalid ISODate '{text}'")))
            }
            _ => {
                self.pos = start;
                Err(self.error(format!("unexpected identifier '{ident}'")))
            }
        }
    }

    fn string_call(&mut self) -> Result<String, QueryError> {
        self.expect('(')?;
        self.skip_trivia();
        let s = self.string()?;
        self.expect(')')?;
        Ok(s)
    }

    fn datetime_call(&mut self) -> Result<Bson, QueryError> {
        self.expect('(')?;
        let mut parts = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some(')') {
                self.pos += 1;
                break;
            }
            match self.number()? {
                Bson::Int(i) => parts.push(i),
                _ => return Err(self.error("datetime arguments must be integers")),
            }
            self.skip_trivia();
            match self.bump() {
                Some(',') => {}
                Some(')') => break,
                _ => return Err(self.error("expected ',' or ')' in datetime")),
            }
        }
        if !(3..=6).contains(&parts.len()) {
            return Err(self.error("datetime takes between 3 and 6 arguments"));
        }
        parts.resize(6, 0);

        let field = |i: usize| u32::try_from(parts[i]).ok();
        let year = i32::try_from(parts[0]).ok();
        let dt = year.zip(field(1)).zip(field(2)).and_then(|((y, m), d)| {
            NaiveDate::from_ymd_opt(y, m, d)?.and_hms_opt(field(3)?, field(4)?, field(5)?)
        });
        dt.map(Bson::DateTime)
            .ok_or_else(|| self.error("datetime arguments out of range"))
    }
}
