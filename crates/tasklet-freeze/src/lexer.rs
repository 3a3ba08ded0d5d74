//! Lexer for bootstrap source
//!
//! Uses the logos library to split source text into names, literals and
//! punctuation, tracking line and column of every token. Whitespace,
//! comments and line continuations are dropped.

use crate::error::CompileError;
use crate::opcode::punct_id;
use logos::Logos;

/// Location of a token in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset past the last character
    pub end: usize,
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
}

/// A lexed token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifier or keyword
    Name(String),
    /// Integer literal
    Int(i64),
    /// Floating point literal
    Float(f64),
    /// String literal, escapes resolved
    Str(String),
    /// Operator or delimiter, as an index into the punctuation table
    Punct(u8),
}

#[derive(Debug, Clone, Default, PartialEq)]
enum LexFault {
    #[default]
    UnexpectedCharacter,
    UnterminatedString,
    InvalidNumber,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexFault)]
enum LogosToken {
    #[regex(r"[ \t\f\r\n]+", logos::skip)]
    Whitespace,

    #[regex(r"#[^\n]*", logos::skip)]
    Comment,

    #[regex(r"\\\r?\n", logos::skip)]
    Continuation,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Name(String),

    #[regex(r"0[xX][0-9a-fA-F]+(_[0-9a-fA-F]+)*", |lex| parse_radix(lex, 16))]
    #[regex(r"0[bB][01]+(_[01]+)*", |lex| parse_radix(lex, 2))]
    #[regex(r"0[oO][0-7]+(_[0-7]+)*", |lex| parse_radix(lex, 8))]
    #[regex(r"[0-9]+(_[0-9]+)*", parse_int)]
    Int(i64),

    #[regex(r"[0-9]+(_[0-9]+)*\.([0-9]+(_[0-9]+)*)?([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9]+(_[0-9]+)*[eE][+-]?[0-9]+", parse_float)]
    #[regex(r"\.[0-9]+(_[0-9]+)*([eE][+-]?[0-9]+)?", parse_float)]
    Float(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    #[regex(r"'([^'\\\n]|\\.)*'", parse_string)]
    #[token("\"\"\"", lex_long_string)]
    #[token("'''", lex_long_string)]
    Str(String),

    #[regex(r#""([^"\\\n]|\\.)*"#)]
    #[regex(r"'([^'\\\n]|\\.)*")]
    Unterminated,

    #[regex(
        r"\*\*=|//=|>>=|<<=|\.\.\.|\*\*|//|==|!=|<=|>=|->|\+=|-=|\*=|/=|%=|&=|\|=|\^=|@=|>>|<<|:=|[-+*/%@&|^~<>()\[\]{},:.;=!]",
        |lex| punct_id(lex.slice())
    )]
    Punct(u8),
}

fn parse_radix(lex: &mut logos::Lexer<'_, LogosToken>, radix: u32) -> Result<i64, LexFault> {
    let digits = lex.slice()[2..].replace('_', "");
    i64::from_str_radix(&digits, radix).map_err(|_| LexFault::InvalidNumber)
}

fn parse_int(lex: &mut logos::Lexer<'_, LogosToken>) -> Result<i64, LexFault> {
    lex.slice()
        .replace('_', "")
        .parse()
        .map_err(|_| LexFault::InvalidNumber)
}

fn parse_float(lex: &mut logos::Lexer<'_, LogosToken>) -> Result<f64, LexFault> {
    lex.slice()
        .replace('_', "")
        .parse()
        .map_err(|_| LexFault::InvalidNumber)
}

fn parse_string(lex: &mut logos::Lexer<'_, LogosToken>) -> String {
    let s = lex.slice();
    unescape(&s[1..s.len() - 1])
}

// The opening triple quote has been consumed; find the matching one
fn lex_long_string(lex: &mut logos::Lexer<'_, LogosToken>) -> Result<String, LexFault> {
    let quote = lex.slice().to_string();
    let remainder = lex.remainder();
    match remainder.find(quote.as_str()) {
        Some(end) => {
            let body = unescape(&remainder[..end]);
            lex.bump(end + quote.len());
            Ok(body)
        }
        None => {
            lex.bump(remainder.len());
            Err(LexFault::UnterminatedString)
        }
    }
}

/// Resolve backslash escapes. Unknown escapes are kept verbatim.
pub fn unescape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('0') => result.push('\0'),
            Some('\\') => result.push('\\'),
            Some('"') => result.push('"'),
            Some('\'') => result.push('\''),
            Some('\n') => {}
            Some('x') => push_code_point(&mut result, &mut chars, 'x', 2),
            Some('u') => push_code_point(&mut result, &mut chars, 'u', 4),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }

    result
}

fn push_code_point(
    result: &mut String,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    marker: char,
    digits: usize,
) {
    let mut hex = String::with_capacity(digits);
    while hex.len() < digits {
        match chars.peek() {
            Some(c) if c.is_ascii_hexdigit() => {
                hex.push(*c);
                chars.next();
            }
            _ => break,
        }
    }
    let decoded = (hex.len() == digits)
        .then(|| u32::from_str_radix(&hex, 16).ok())
        .flatten()
        .and_then(char::from_u32);
    match decoded {
        Some(ch) => result.push(ch),
        None => {
            result.push('\\');
            result.push(marker);
            result.push_str(&hex);
        }
    }
}

/// Main lexer structure
pub struct Lexer<'a> {
    source: &'a str,
    tokens: Vec<(Token, Span)>,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `source`
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Split the whole source into tokens, collecting every error
    pub fn tokenize(mut self) -> Result<Vec<(Token, Span)>, Vec<CompileError>> {
        let mut logos_lexer = LogosToken::lexer(self.source);
        let mut line = 1u32;
        let mut column = 1u32;
        let mut last_end = 0;

        while let Some(result) = logos_lexer.next() {
            let range = logos_lexer.span();
            advance(&self.source[last_end..range.start], &mut line, &mut column);
            let span = Span {
                start: range.start,
                end: range.end,
                line,
                column,
            };

            match result {
                Ok(LogosToken::Unterminated) | Err(LexFault::UnterminatedString) => {
                    self.errors
                        .push(CompileError::UnterminatedString { line, column });
                }
                Ok(token) => {
                    if let Some(token) = convert(token) {
                        self.tokens.push((token, span));
                    }
                }
                Err(LexFault::InvalidNumber) => {
                    self.errors.push(CompileError::InvalidNumber {
                        text: logos_lexer.slice().to_string(),
                        line,
                        column,
                    });
                }
                Err(LexFault::UnexpectedCharacter) => {
                    let ch = self.source[range.start..].chars().next().unwrap_or('\0');
                    self.errors
                        .push(CompileError::UnexpectedCharacter { ch, line, column });
                }
            }

            advance(&self.source[range.start..range.end], &mut line, &mut column);
            last_end = range.end;
        }

        if self.errors.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.errors)
        }
    }
}

fn advance(text: &str, line: &mut u32, column: &mut u32) {
    for c in text.chars() {
        if c == '\n' {
            *line += 1;
            *column = 1;
        } else {
            *column += 1;
        }
    }
}

fn convert(token: LogosToken) -> Option<Token> {
    match token {
        LogosToken::Name(name) => Some(Token::Name(name)),
        LogosToken::Int(value) => Some(Token::Int(value)),
        LogosToken::Float(value) => Some(Token::Float(value)),
        LogosToken::Str(value) => Some(Token::Str(value)),
        LogosToken::Punct(id) => Some(Token::Punct(id)),
        LogosToken::Whitespace
        | LogosToken::Comment
        | LogosToken::Continuation
        | LogosToken::Unterminated => None,
    }
}
