//! SQL Lexer
//!
//! Token stream for static checks, produced by sqlparser's T-SQL tokenizer.
//! Every token carries its byte span so callers can rewrite the original text
//! in place. Lexing never fails: when the tokenizer stops on an unterminated
//! string, quoted identifier or block comment, the text before that run is
//! still tokenized and the run itself is recorded as an anomaly.

use sqlparser::dialect::MsSqlDialect;
use sqlparser::tokenizer::{Location, Token as SqlToken, TokenWithLocation, Tokenizer, TokenizerError, Whitespace};
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub token: SqlToken,
    pub text: &'a str,
    pub span: Span,
}

impl<'a> Token<'a> {
    /// Unquoted word matching `keyword`, ignoring case.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        match &self.token {
            SqlToken::Word(word) => word.quote_style.is_none() && word.value.eq_ignore_ascii_case(keyword),
            _ => false,
        }
    }

    /// Bare word (`Products`, `@var`, `#temp`); keywords included.
    pub fn is_word(&self) -> bool {
        matches!(&self.token, SqlToken::Word(word) if word.quote_style.is_none())
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self.token, SqlToken::Word(_))
    }

    /// Identifier value with quoting removed.
    pub fn ident_value(&self) -> String {
        match &self.token {
            SqlToken::Word(word) => word.value.clone(),
            _ => self.text.to_string(),
        }
    }

    pub fn number(&self) -> Option<&str> {
        match &self.token {
            SqlToken::Number(digits, _) => Some(digits),
            _ => None,
        }
    }
}

/// A run the tokenizer could not close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub message: String,
    pub at: usize,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (byte {})", self.message.trim_end_matches('.'), self.at)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Lexed<'a> {
    pub tokens: Vec<Token<'a>>,
    pub comments: Vec<Span>,
    pub anomalies: Vec<Anomaly>,
}

impl<'a> Lexed<'a> {
    /// Tokens grouped into `;`-separated statements, empty groups dropped.
    pub fn statements(&self) -> Vec<&[Token<'a>]> {
        self.tokens
            .split(|t| t.token == SqlToken::SemiColon)
            .filter(|group| !group.is_empty())
            .collect()
    }
}

/// Walks the text the way the tokenizer counts it: lines and chars from 1.
struct Cursor<'a> {
    chars: Peekable<CharIndices<'a>>,
    len: usize,
    line: u64,
    column: u64,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            len: text.len(),
            line: 1,
            column: 1,
        }
    }

    /// Byte offset of `location`. Locations must be visited in order.
    fn offset_of(&mut self, location: &Location) -> usize {
        while (self.line, self.column) < (location.line, location.column) {
            match self.chars.next() {
                Some((_, '\n')) => {
                    self.line += 1;
                    self.column = 1;
                }
                Some(_) => self.column += 1,
                None => break,
            }
        }
        self.chars.peek().map(|(at, _)| *at).unwrap_or(self.len)
    }
}

fn scan(sql: &str) -> Result<Lexed<'_>, TokenizerError> {
    let dialect = MsSqlDialect {};
    let located: Vec<TokenWithLocation> = Tokenizer::new(&dialect, sql).tokenize_with_location()?;

    let mut cursor = Cursor::new(sql);
    let starts: Vec<usize> = located.iter().map(|t| cursor.offset_of(&t.location)).collect();

    let mut lexed = Lexed::default();
    for (i, located) in located.into_iter().enumerate() {
        let span = Span {
            start: starts[i],
            end: starts.get(i + 1).copied().unwrap_or(sql.len()),
        };
        match located.token {
            SqlToken::Whitespace(Whitespace::SingleLineComment { .. }) | SqlToken::Whitespace(Whitespace::MultiLineComment(_)) => {
                // A line comment owns its newline; keep that out of the span
                let end = if sql[..span.end].ends_with('\n') && span.end > span.start { span.end - 1 } else { span.end };
                lexed.comments.push(Span { start: span.start, end })
            }
            SqlToken::Whitespace(_) | SqlToken::EOF => {}
            token => lexed.tokens.push(Token {
                token,
                text: &sql[span.start..span.end],
                span,
            }),
        }
    }
    Ok(lexed)
}

/// Where the run that stopped the tokenizer opens. Strings and quoted
/// identifiers report their opening quote; comments report the end of input,
/// so fall back to the last opener preceded by cleanly tokenized text.
fn unterminated_start(sql: &str, err: &TokenizerError) -> usize {
    let at = Cursor::new(sql).offset_of(&err.location);
    if at < sql.len() {
        return at;
    }
    sql.char_indices()
        .filter(|(i, ch)| matches!(ch, '\'' | '"' | '[') || sql[*i..].starts_with("/*"))
        .map(|(i, _)| i)
        .rev()
        .find(|&i| scan(&sql[..i]).is_ok())
        .unwrap_or(0)
}

pub fn tokenize(sql: &str) -> Lexed<'_> {
    match scan(sql) {
        Ok(lexed) => lexed,
        Err(err) => {
            let at = unterminated_start(sql, &err);
            let mut lexed = scan(&sql[..at]).unwrap_or_default();
            lexed.anomalies.push(Anomaly { message: err.message, at });
            lexed
        }
    }
}
