//! SQL normalization
//!
//! Turns free-form statement text into a grouping key by replacing
//! literals with `?` and collapsing literal lists, without parsing the
//! full grammar. The scan is token based:
//!
//! ```text
//! tokenize → statement type → signs & numbers → VALUES lists → IN lists → render
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use querytrace_core::normalizer::{KeywordTable, QueryNormalizer, QueryType};
//!
//! let normalizer = QueryNormalizer::new(Arc::new(KeywordTable::mysql()));
//! let normalized = normalizer.normalize("select * from t where id in (1, 2, 3)");
//! assert_eq!(normalized.text, "SELECT * FROM t WHERE id IN (? /* , ... */ )");
//! assert_eq!(normalized.query_type, QueryType::Select);
//! ```

mod keywords;
mod tokenizer;

pub use keywords::KeywordTable;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokenizer::{tokenize, Token, TokenKind};

/// Statement classification derived from the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QueryType {
    #[serde(rename = "SELECT")]
    Select,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "REPLACE")]
    Replace,
    /// Anything else (SHOW, SET, DDL, ...)
    #[default]
    #[serde(rename = "")]
    Other,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Call => "CALL",
            QueryType::Replace => "REPLACE",
            QueryType::Other => "",
        }
    }

    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" => QueryType::Select,
            "INSERT" => QueryType::Insert,
            "UPDATE" => QueryType::Update,
            "DELETE" => QueryType::Delete,
            "CALL" => QueryType::Call,
            "REPLACE" => QueryType::Replace,
            _ => QueryType::Other,
        }
    }

    /// Statements whose EXPLAIN output does not describe a SELECT.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            QueryType::Insert | QueryType::Update | QueryType::Delete | QueryType::Replace
        )
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of [`QueryNormalizer::normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    pub text: String,
    pub query_type: QueryType,
}

/// Re-entrant normalizer; clone freely, it only holds a shared keyword table.
#[derive(Debug, Clone)]
pub struct QueryNormalizer {
    keywords: Arc<KeywordTable>,
}

impl QueryNormalizer {
    pub fn new(keywords: Arc<KeywordTable>) -> Self {
        Self { keywords }
    }

    pub fn normalize(&self, sql: &str) -> NormalizedQuery {
        let mut tokens = tokenize(sql, &self.keywords);
        let query_type = statement_type(&tokens);
        process_numbers(&mut tokens);
        collapse_value_lists(&mut tokens);
        collapse_in_lists(&mut tokens);

        NormalizedQuery {
            text: render(&tokens),
            query_type,
        }
    }
}

fn next_real(tokens: &[Token], after: usize) -> Option<usize> {
    (after + 1..tokens.len()).find(|&i| tokens[i].is_real())
}

fn prev_real(tokens: &[Token], before: usize) -> Option<usize> {
    (0..before).rev().find(|&i| tokens[i].is_real())
}

/// Index of the `)` matching the `(` at `open`.
fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if !token.is_real() {
            continue;
        }
        if token.is_symbol("(") {
            depth += 1;
        } else if token.is_symbol(")") {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// First real token that is not an opening parenthesis.
fn statement_type(tokens: &[Token]) -> QueryType {
    tokens
        .iter()
        .filter(|t| t.is_real())
        .find(|t| !t.is_symbol("("))
        .filter(|t| t.kind == TokenKind::Keyword)
        .map(|t| QueryType::from_keyword(&t.text))
        .unwrap_or_default()
}

fn is_operand(token: &Token) -> bool {
    token.is_literal() || token.kind == TokenKind::Identifier || token.is_symbol(")")
}

/// Drops unary signs in front of literals and replaces numbers with `?`.
///
/// A number glued to an identifier through `+`/`-` (`a-1`) is left alone.
fn process_numbers(tokens: &mut [Token]) {
    for i in 0..tokens.len() {
        if !tokens[i].is_real() {
            continue;
        }

        if tokens[i].is_symbol("-") || tokens[i].is_symbol("+") {
            let binary = prev_real(tokens, i).is_some_and(|p| is_operand(&tokens[p]));
            let before_number =
                next_real(tokens, i).is_some_and(|n| tokens[n].kind == TokenKind::Number);
            if !binary && before_number {
                tokens[i].output = false;
            }
            continue;
        }

        if tokens[i].kind == TokenKind::Number {
            let glued_to_identifier = i >= 2
                && tokens[i - 1].output
                && (tokens[i - 1].is_symbol("-") || tokens[i - 1].is_symbol("+"))
                && tokens[i - 2].kind == TokenKind::Identifier;
            if !glued_to_identifier {
                tokens[i].text = "?".to_string();
            }
        }
    }
}

fn collapse_value_lists(tokens: &mut Vec<Token>) {
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        let is_values = token.is_real()
            && token.kind == TokenKind::Keyword
            && (token.text == "VALUES" || token.text == "VALUE");
        // `VALUES(col)` inside ON DUPLICATE KEY UPDATE is a function call
        let after_target = prev_real(tokens, i).is_some_and(|p| {
            tokens[p].kind == TokenKind::Identifier || tokens[p].is_symbol(")")
        });

        if is_values && after_target {
            if let Some(next) = collapse_value_list(tokens, i) {
                i = next;
                continue;
            }
        }
        i += 1;
    }
}

/// Keeps the first tuple and replaces the rest with the marker. Returns
/// the index to resume scanning from.
fn collapse_value_list(tokens: &mut Vec<Token>, values: usize) -> Option<usize> {
    let open = next_real(tokens, values).filter(|&j| tokens[j].is_symbol("("))?;
    let first_close = matching_paren(tokens, open)?;

    let mut last_close = first_close;
    let mut tuples = 1;
    loop {
        let Some(comma) = next_real(tokens, last_close).filter(|&j| tokens[j].is_symbol(",")) else {
            break;
        };
        let Some(open) = next_real(tokens, comma).filter(|&j| tokens[j].is_symbol("(")) else {
            break;
        };
        let Some(close) = matching_paren(tokens, open) else {
            break;
        };
        last_close = close;
        tuples += 1;
    }

    if tuples < 2 {
        return Some(first_close + 1);
    }

    for token in &mut tokens[first_close + 1..=last_close] {
        token.output = false;
    }
    tokens.splice(
        first_close + 1..first_close + 1,
        [Token::whitespace(), Token::marker()],
    );
    Some(last_close + 3)
}

fn collapse_in_lists(tokens: &mut Vec<Token>) {
    let mut i = 0;
    while i < tokens.len() {
        let token = &tokens[i];
        if token.is_real() && token.kind == TokenKind::Keyword && token.text == "IN" {
            if let Some(next) = collapse_in_list(tokens, i) {
                i = next;
                continue;
            }
        }
        i += 1;
    }
}

/// Collapses `IN (lit, lit, ...)`. Lists holding anything but literals
/// and commas are left untouched.
fn collapse_in_list(tokens: &mut Vec<Token>, keyword: usize) -> Option<usize> {
    let open = next_real(tokens, keyword).filter(|&j| tokens[j].is_symbol("("))?;

    let mut first_literal = None;
    let mut close = None;
    for (j, token) in tokens.iter().enumerate().skip(open + 1) {
        if token.kind == TokenKind::HintComment {
            return None;
        }
        if !token.is_real() {
            continue;
        }
        if token.is_literal() {
            first_literal.get_or_insert(j);
        } else if token.is_symbol(")") {
            close = Some(j);
            break;
        } else if !token.is_symbol(",") {
            return None;
        }
    }
    let (first, close) = (first_literal?, close?);

    tokens[first].text = "?".to_string();
    for token in &mut tokens[first + 1..=close] {
        token.output = false;
    }
    tokens.splice(
        first + 1..first + 1,
        [
            Token::whitespace(),
            Token::marker(),
            Token::whitespace(),
            Token::symbol(")"),
        ],
    );
    Some(close + 5)
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut last_was_space = true;
    for token in tokens.iter().filter(|t| t.output) {
        if token.kind == TokenKind::Whitespace {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
            continue;
        }
        out.push_str(&token.text);
        last_was_space = false;
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> QueryNormalizer {
        QueryNormalizer::new(Arc::new(KeywordTable::mysql()))
    }

    fn norm(sql: &str) -> String {
        normalizer().normalize(sql).text
    }

    #[test]
    fn test_simple_literal() {
        let n = normalizer().normalize("SELECT 1");
        assert_eq!(n.text, "SELECT ?");
        assert_eq!(n.query_type, QueryType::Select);
    }

    #[test]
    fn test_subtraction_keeps_spacing() {
        assert_eq!(norm("SELECT 1-1"), "SELECT ?-?");
        assert_eq!(norm("SELECT 1 - 1"), "SELECT ? - ?");
    }

    #[test]
    fn test_identifier_minus_literal_is_kept() {
        assert_eq!(norm("SELECT a-1 FROM t"), "SELECT a-1 FROM t");
        assert_eq!(norm("SELECT a - 1 FROM t"), "SELECT a - ? FROM t");
    }

    #[test]
    fn test_unary_minus_is_dropped() {
        assert_eq!(norm("SELECT -1"), "SELECT ?");
        assert_eq!(norm("SELECT - 1"), "SELECT ?");
        assert_eq!(norm("SELECT * FROM t WHERE x = -2.5"), "SELECT * FROM t WHERE x = ?");
        // not a literal, so the sign stays
        assert_eq!(norm("SELECT -a FROM t"), "SELECT -a FROM t");
    }

    #[test]
    fn test_arithmetic_with_functions() {
        assert_eq!(
            norm("SELECT ABS(-5) + 2 * 3 / 4"),
            "SELECT ABS(?) + ? * ? / ?"
        );
    }

    #[test]
    fn test_strings_are_replaced() {
        assert_eq!(
            norm(r"SELECT * FROM t WHERE name = 'O\'Brien' AND x = _binary 'ab'"),
            "SELECT * FROM t WHERE name = ? AND x = ?"
        );
        assert_eq!(norm("SELECT x'4D'"), "SELECT ?");
    }

    #[test]
    fn test_quoted_identifiers_are_kept() {
        assert_eq!(
            norm("SELECT `col 1` FROM `my table` WHERE \"c\" = 1"),
            "SELECT `col 1` FROM `my table` WHERE \"c\" = ?"
        );
    }

    #[test]
    fn test_in_list_collapse() {
        assert_eq!(
            norm("SELECT * FROM tbl WHERE fld IN ( 1, '2', 3.0, 4 )"),
            "SELECT * FROM tbl WHERE fld IN ( ? /* , ... */ )"
        );
    }

    #[test]
    fn test_in_list_with_expressions_is_preserved() {
        assert_eq!(
            norm("SELECT * FROM t WHERE a IN (b, 1)"),
            "SELECT * FROM t WHERE a IN (b, ?)"
        );
        assert_eq!(
            norm("SELECT * FROM t WHERE (a, b) IN ((1, 2), (3, 4))"),
            "SELECT * FROM t WHERE (a, b) IN ((?, ?), (?, ?))"
        );
    }

    #[test]
    fn test_in_list_with_subquery() {
        assert_eq!(
            norm("SELECT * FROM t WHERE id IN (SELECT id FROM u WHERE x = 5)"),
            "SELECT * FROM t WHERE id IN (SELECT id FROM u WHERE x = ?)"
        );
        assert_eq!(
            norm("SELECT * FROM t WHERE id IN (SELECT id FROM u WHERE x IN (1,2))"),
            "SELECT * FROM t WHERE id IN (SELECT id FROM u WHERE x IN (? /* , ... */ ))"
        );
    }

    #[test]
    fn test_incomplete_in_list_is_untouched() {
        assert_eq!(
            norm("SELECT * FROM t WHERE a IN (1,2,3"),
            "SELECT * FROM t WHERE a IN (?,?,?"
        );
    }

    #[test]
    fn test_values_collapse() {
        let n = normalizer().normalize("INSERT INTO tbl VALUES (1), (2), (3)");
        assert_eq!(n.text, "INSERT INTO tbl VALUES (?) /* , ... */");
        assert_eq!(n.query_type, QueryType::Insert);
    }

    #[test]
    fn test_single_values_tuple() {
        assert_eq!(norm("INSERT INTO tbl VALUES (1)"), "INSERT INTO tbl VALUES (?)");
        assert_eq!(
            norm("INSERT INTO tbl (a, b) VALUES (1, 'x')"),
            "INSERT INTO tbl (a, b) VALUES (?, ?)"
        );
    }

    #[test]
    fn test_values_with_nested_calls_and_upsert() {
        assert_eq!(
            norm(
                "INSERT INTO t (a, b) VALUES (1, NOW()), (2, NOW()) \
                 ON DUPLICATE KEY UPDATE b = VALUES(b)"
            ),
            "INSERT INTO t (a, b) VALUES (?, NOW()) /* , ... */ ON DUPLICATE KEY UPDATE b = VALUES(b)"
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            norm("SELECT /* note */ 1 -- trailing\nFROM t # more"),
            "SELECT ? FROM t"
        );
        assert_eq!(
            norm("SELECT /*! SQL_NO_CACHE */ a FROM t"),
            "SELECT /*! SQL_NO_CACHE */ a FROM t"
        );
    }

    #[test]
    fn test_comments_do_not_join_tokens() {
        assert_eq!(
            norm("SELECT a FROM t# note\nWHERE b = 1"),
            "SELECT a FROM t WHERE b = ?"
        );
        assert_eq!(
            norm("SELECT a FROM t-- note\nWHERE b IN (1, 2)"),
            "SELECT a FROM t WHERE b IN (? /* , ... */ )"
        );
        assert_eq!(norm("SELECT a/* x */FROM t"), "SELECT a FROM t");
    }

    #[test]
    fn test_whitespace_collapses() {
        assert_eq!(norm("  SELECT\n\t a\n FROM   t  "), "SELECT a FROM t");
    }

    #[test]
    fn test_query_types() {
        let n = normalizer();
        assert_eq!(n.normalize("update t set a = 1").query_type, QueryType::Update);
        assert_eq!(n.normalize("DELETE FROM t").query_type, QueryType::Delete);
        assert_eq!(n.normalize("call spTest1()").query_type, QueryType::Call);
        assert_eq!(n.normalize("REPLACE INTO t VALUES (1)").query_type, QueryType::Replace);
        assert_eq!(n.normalize("((SELECT 1))").query_type, QueryType::Select);
        assert_eq!(n.normalize("/* c */ SELECT 1").query_type, QueryType::Select);
        assert_eq!(n.normalize("SHOW WARNINGS").query_type, QueryType::Other);
        assert_eq!(n.normalize("mytable").query_type, QueryType::Other);
        assert_eq!(n.normalize("").query_type, QueryType::Other);
    }

    #[test]
    fn test_nested_parens_preserved() {
        assert_eq!(norm("((SELECT 1)) UNION (SELECT 2)"), "((SELECT ?)) UNION (SELECT ?)");
    }

    #[test]
    fn test_call_keeps_text() {
        assert_eq!(norm("call spTest1()"), "CALL spTest1()");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let n = normalizer();
        for sql in [
            "SELECT 1",
            "SELECT 1-1",
            "SELECT 1 - 1",
            "SELECT a-1 FROM t",
            "SELECT -1",
            "SELECT * FROM tbl WHERE fld IN ( 1, '2', 3.0, 4 )",
            "INSERT INTO tbl VALUES (1), (2), (3)",
            "INSERT INTO t (a, b) VALUES (1, NOW()), (2, NOW()) ON DUPLICATE KEY UPDATE b = VALUES(b)",
            "SELECT /*! SQL_NO_CACHE */ a FROM t WHERE b IN (SELECT c FROM d WHERE e = 'x')",
            "select * from t where a in (1,2) and b = 'it''s'",
        ] {
            let once = n.normalize(sql).text;
            let twice = n.normalize(&once).text;
            assert_eq!(once, twice, "not a fixed point for {sql:?}");
        }
    }

    #[test]
    fn test_query_type_serializes_as_verb() {
        assert_eq!(serde_json::to_string(&QueryType::Call).unwrap(), "\"CALL\"");
        assert_eq!(serde_json::to_string(&QueryType::Other).unwrap(), "\"\"");
    }
}
