//! Token-level scanner for the normalizer.
//!
//! Literals are classified here but only strings are replaced at this
//! stage; number replacement needs the neighbouring tokens.

use super::keywords::KeywordTable;

/// Marker emitted in place of a collapsed list.
pub(crate) const COLLAPSE_MARKER: &str = "/* , ... */";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Keyword,
    String,
    Number,
    /// A `?` already present in the text
    Placeholder,
    Symbol,
    Identifier,
    /// A comment that survives normalization (the collapse marker)
    Comment,
    /// `/*! ... */` optimizer hint, kept verbatim
    HintComment,
    Whitespace,
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub output: bool,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            output: true,
        }
    }

    pub fn whitespace() -> Self {
        Self::new(TokenKind::Whitespace, " ")
    }

    pub fn marker() -> Self {
        Self::new(TokenKind::Comment, COLLAPSE_MARKER)
    }

    pub fn symbol(text: &str) -> Self {
        Self::new(TokenKind::Symbol, text)
    }

    /// Visible and neither whitespace nor a comment.
    pub fn is_real(&self) -> bool {
        self.output
            && !matches!(
                self.kind,
                TokenKind::Comment | TokenKind::HintComment | TokenKind::Whitespace
            )
    }

    pub fn is_symbol(&self, text: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text == text
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::String | TokenKind::Number | TokenKind::Placeholder
        )
    }
}

/// Split `sql` into tokens. Never fails: malformed input degrades to
/// verbatim tokens.
pub(crate) fn tokenize(sql: &str, keywords: &KeywordTable) -> Vec<Token> {
    Tokenizer {
        chars: sql.chars().collect(),
        pos: 0,
        tokens: Vec::new(),
        keywords,
    }
    .run()
}

struct Tokenizer<'k> {
    chars: Vec<char>,
    pos: usize,
    tokens: Vec<Token>,
    keywords: &'k KeywordTable,
}

impl Tokenizer<'_> {
    fn run(mut self) -> Vec<Token> {
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if matches!(c, '#' | '/' | '-') && self.consume_comment() {
                continue;
            }
            if c.is_whitespace() {
                self.consume_whitespace();
            } else if c == '\'' {
                self.consume_string();
            } else if c == '"' || c == '`' {
                self.consume_quoted_identifier(c);
            } else if !is_special(c) {
                self.consume_word();
            } else {
                self.consume_symbol();
            }
        }
        self.tokens
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }

    /// Returns false when the character does not actually open a comment.
    fn consume_comment(&mut self) -> bool {
        let c = self.chars[self.pos];
        let block = c == '/' && self.peek(1) == Some('*');
        let dash = c == '-' && self.peek(1) == Some('-') && self.peek(2).is_some_and(char::is_whitespace);
        if !(c == '#' || block || dash) {
            return false;
        }

        let start = self.pos;
        let end = if block {
            self.find("*/", start + 2)
                .map(|i| i + 2)
                .unwrap_or(self.chars.len())
        } else {
            // the newline is left to separate what follows
            self.find("\n", start).unwrap_or(self.chars.len())
        };
        self.pos = end;

        let text = self.slice(start, end);
        if block && text.starts_with("/*!") {
            self.tokens.push(Token::new(TokenKind::HintComment, text));
        } else if block && text == COLLAPSE_MARKER {
            self.tokens.push(Token::marker());
        } else {
            self.tokens.push(Token::whitespace());
        }
        true
    }

    fn find(&self, pattern: &str, from: usize) -> Option<usize> {
        let pattern: Vec<char> = pattern.chars().collect();
        (from..self.chars.len())
            .find(|&i| self.chars[i..].starts_with(&pattern))
    }

    fn consume_whitespace(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
        self.tokens.push(Token::whitespace());
    }

    /// Index just past the closing quote of the string opening at `start`,
    /// or None when it is unterminated.
    fn string_end(&self, start: usize) -> Option<usize> {
        let quote = self.chars[start];
        let mut escaped = false;
        let mut i = start + 1;
        while i < self.chars.len() {
            let c = self.chars[i];
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                if self.chars.get(i + 1) == Some(&quote) {
                    i += 2;
                    continue;
                }
                return Some(i + 1);
            }
            i += 1;
        }
        None
    }

    fn consume_string(&mut self) {
        match self.string_end(self.pos) {
            Some(end) => {
                self.pos = end;
                self.tokens.push(Token::new(TokenKind::String, "?"));
            }
            None => {
                let text = self.slice(self.pos, self.chars.len());
                self.pos = self.chars.len();
                self.tokens.push(Token::new(TokenKind::Identifier, text));
            }
        }
    }

    fn consume_quoted_identifier(&mut self, quote: char) {
        let start = self.pos;
        let mut i = start + 1;
        while i < self.chars.len() && self.chars[i] != quote {
            i += 1;
        }
        self.pos = (i + 1).min(self.chars.len());
        let text = self.slice(start, self.pos);
        self.tokens.push(Token::new(TokenKind::Identifier, text));
    }

    fn consume_word(&mut self) {
        let start = self.pos;
        while self.pos < self.chars.len() && !is_special(self.chars[self.pos]) {
            self.pos += 1;
        }
        self.extend_exponent(start);
        let word = self.slice(start, self.pos);

        if self.consume_introduced_string(&word) {
            return;
        }

        let token = if is_numeric_literal(&word) {
            Token::new(TokenKind::Number, word)
        } else if self.keywords.contains(&word) {
            Token::new(TokenKind::Keyword, word.to_ascii_uppercase())
        } else {
            Token::new(TokenKind::Identifier, word)
        };
        self.tokens.push(token);
    }

    /// `1e` followed by `-5` reads as the single literal `1e-5`.
    fn extend_exponent(&mut self, start: usize) {
        let word = self.slice(start, self.pos);
        let Some(mantissa) = word.strip_suffix(['e', 'E']) else {
            return;
        };
        if !is_numeric_literal(mantissa) || mantissa.starts_with("0x") {
            return;
        }
        if matches!(self.peek(0), Some('+' | '-')) && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.pos < self.chars.len() && self.chars[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
    }

    /// Charset introducers (`_binary '..'`) and `x'..'`/`b'..'`/`n'..'`
    /// literals collapse into one string token.
    fn consume_introduced_string(&mut self, word: &str) -> bool {
        let quote_at = if word.len() > 1 && word.starts_with('_') {
            let mut i = self.pos;
            while i < self.chars.len() && self.chars[i].is_whitespace() {
                i += 1;
            }
            i
        } else if matches!(word, "x" | "X" | "b" | "B" | "n" | "N") {
            self.pos
        } else {
            return false;
        };

        if self.chars.get(quote_at) != Some(&'\'') {
            return false;
        }
        match self.string_end(quote_at) {
            Some(end) => {
                self.pos = end;
                self.tokens.push(Token::new(TokenKind::String, "?"));
                true
            }
            None => false,
        }
    }

    fn consume_symbol(&mut self) {
        let c = self.chars[self.pos];
        self.pos += 1;
        let kind = if c == '?' {
            TokenKind::Placeholder
        } else {
            TokenKind::Symbol
        };
        self.tokens.push(Token::new(kind, c.to_string()));
    }
}

fn is_special(c: char) -> bool {
    !(c.is_alphanumeric() || c == '$' || c == '_' || c == '.')
}

/// Integer, decimal, exponent or `0x` hex literal.
fn is_numeric_literal(word: &str) -> bool {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        return !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    }

    let (mantissa, exponent) = match word.find(|c: char| c == 'e' || c == 'E') {
        Some(i) => (&word[..i], Some(&word[i + 1..])),
        None => (word, None),
    };

    let mut digits = 0;
    let mut dots = 0;
    for c in mantissa.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    if digits == 0 || dots > 1 {
        return false;
    }

    match exponent {
        None => true,
        Some(e) => {
            let e = e.strip_prefix(['+', '-']).unwrap_or(e);
            !e.is_empty() && e.chars().all(|c| c.is_ascii_digit())
        }
    }
}
