/*
 * lex2.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Level-2 lexical analyzer.
//!
//! Tokenizes directive bodies handed over by the level-1 lexer: identifiers,
//! numbers, quoted strings with C-style escapes, operators and keywords.
//! Regex literals are recognized on demand (`next_regex`) where the grammar
//! expects a regex operand, so that `/` stays a division operator everywhere
//! else.

use crate::position::Position;

/// Directive keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    If,
    Elif,
    Else,
    Endif,
    Frag,
    Endfrag,
    Ctype,
    Endctype,
    Format,
    Endformat,
    Include,
    Set,
    Debug,
    Bytecode,
    Teng,
    Case,
    Endcase,
    Break,
}

fn keyword(ident: &str) -> Option<Keyword> {
    Some(match ident {
        "if" => Keyword::If,
        "elif" => Keyword::Elif,
        "else" => Keyword::Else,
        "endif" => Keyword::Endif,
        "frag" => Keyword::Frag,
        "endfrag" => Keyword::Endfrag,
        "ctype" => Keyword::Ctype,
        "endctype" => Keyword::Endctype,
        "format" => Keyword::Format,
        "endformat" => Keyword::Endformat,
        "include" => Keyword::Include,
        "set" => Keyword::Set,
        "debug" => Keyword::Debug,
        "bytecode" => Keyword::Bytecode,
        "teng" => Keyword::Teng,
        "case" => Keyword::Case,
        "endcase" => Keyword::Endcase,
        "break" => Keyword::Break,
        _ => return None,
    })
}

/// Level-2 token kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'b> {
    Ident(&'b str),
    Kw(Keyword),
    Integral(i64),
    Real(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Not,
    BitNot,
    MatchEq,
    MatchNe,
    Question,
    Colon,
    LParen,
    RParen,
    Comma,
    Assign,
    Dot,
    Unknown(char),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token2<'b> {
    pub kind: TokenKind<'b>,
    pub pos: Position,
}

/// The level-2 lexer over one directive body.
#[derive(Debug)]
pub struct Lex2<'b> {
    src: &'b str,
    offset: usize,
    pos: Position,
}

impl<'b> Lex2<'b> {
    /// Create a lexer over a directive body starting at `pos` in the
    /// template source.
    pub fn new(src: &'b str, pos: Position) -> Self {
        Lex2 {
            src,
            offset: 0,
            pos,
        }
    }

    fn bytes(&self) -> &'b [u8] {
        self.src.as_bytes()
    }

    fn peek_byte(&self, skip: usize) -> Option<u8> {
        self.bytes().get(self.offset + skip).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek_byte(0)?;
        self.pos.advance(byte);
        self.offset += 1;
        Some(byte)
    }

    fn bump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.bump();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek_byte(0).is_some_and(|b| b.is_ascii_whitespace()) {
            self.bump();
        }
    }

    /// True when a regex literal could start at the current position; used
    /// by the parser after `=~` / `!~`.
    pub fn regex_ahead(&mut self) -> bool {
        self.skip_whitespace();
        self.peek_byte(0) == Some(b'/')
    }

    /// Lex a regex literal `/pattern/flags`. The caller has established
    /// with `regex_ahead` that a slash is next.
    pub fn next_regex(&mut self) -> Result<(String, String), &'static str> {
        self.skip_whitespace();
        if self.bump() != Some(b'/') {
            return Err("expected regex literal");
        }
        let mut pattern = String::new();
        loop {
            match self.bump() {
                None => return Err("unterminated regex literal"),
                Some(b'/') => break,
                Some(b'\\') => match self.bump() {
                    None => return Err("unterminated regex literal"),
                    Some(b'/') => pattern.push('/'),
                    Some(escaped) => {
                        pattern.push('\\');
                        pattern.push(escaped as char);
                    }
                },
                Some(byte) => pattern.push(byte as char),
            }
        }
        let mut flags = String::new();
        while let Some(byte) = self.peek_byte(0) {
            if byte.is_ascii_alphabetic() {
                flags.push(byte as char);
                self.bump();
            } else {
                break;
            }
        }
        Ok((pattern, flags))
    }

    fn lex_string(&mut self, quote: u8) -> TokenKind<'b> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return TokenKind::Str(out),
                Some(b) if b == quote => return TokenKind::Str(out),
                Some(b'\\') => match self.bump() {
                    None => return TokenKind::Str(out),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'0') => out.push('\0'),
                    Some(escaped) => out.push(escaped as char),
                },
                Some(byte) if byte.is_ascii() => out.push(byte as char),
                Some(_) => {
                    // re-assemble a multi-byte character
                    let start = self.offset - 1;
                    let mut end = self.offset;
                    while end < self.src.len() && !self.src.is_char_boundary(end) {
                        end += 1;
                    }
                    out.push_str(&self.src[start..end]);
                    self.bump_n(end - self.offset);
                }
            }
        }
    }

    fn lex_number(&mut self) -> TokenKind<'b> {
        let start = self.offset;
        while self.peek_byte(0).is_some_and(|b| b.is_ascii_digit()) {
            self.bump();
        }
        let mut real = false;
        if self.peek_byte(0) == Some(b'.') && self.peek_byte(1).is_some_and(|b| b.is_ascii_digit()) {
            real = true;
            self.bump();
            while self.peek_byte(0).is_some_and(|b| b.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = &self.src[start..self.offset];
        if !real {
            if let Ok(i) = text.parse::<i64>() {
                return TokenKind::Integral(i);
            }
        }
        match text.parse::<f64>() {
            Ok(r) => TokenKind::Real(r),
            Err(_) => TokenKind::Unknown('0'),
        }
    }

    fn lex_ident(&mut self) -> TokenKind<'b> {
        let start = self.offset;
        while self
            .peek_byte(0)
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.bump();
        }
        let text = &self.src[start..self.offset];
        match keyword(text) {
            Some(kw) => TokenKind::Kw(kw),
            None => TokenKind::Ident(text),
        }
    }

    /// Return the next token, or `None` at the end of the body.
    pub fn next(&mut self) -> Option<Token2<'b>> {
        self.skip_whitespace();
        let pos = self.pos.clone();
        let byte = self.peek_byte(0)?;

        let kind = match byte {
            b'\'' | b'"' => {
                self.bump();
                self.lex_string(byte)
            }
            b'0'..=b'9' => self.lex_number(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_ident(),
            b'.' if self.peek_byte(1).is_some_and(|b| b.is_ascii_digit()) => {
                self.lex_number()
            }
            b'+' if self.peek_byte(1) == Some(b'+') => {
                self.bump_n(2);
                TokenKind::Concat
            }
            b'=' if self.peek_byte(1) == Some(b'=') => {
                self.bump_n(2);
                TokenKind::Eq
            }
            b'=' if self.peek_byte(1) == Some(b'~') => {
                self.bump_n(2);
                TokenKind::MatchEq
            }
            b'!' if self.peek_byte(1) == Some(b'=') => {
                self.bump_n(2);
                TokenKind::Ne
            }
            b'!' if self.peek_byte(1) == Some(b'~') => {
                self.bump_n(2);
                TokenKind::MatchNe
            }
            b'<' if self.peek_byte(1) == Some(b'=') => {
                self.bump_n(2);
                TokenKind::Le
            }
            b'>' if self.peek_byte(1) == Some(b'=') => {
                self.bump_n(2);
                TokenKind::Ge
            }
            b'&' if self.peek_byte(1) == Some(b'&') => {
                self.bump_n(2);
                TokenKind::And
            }
            b'|' if self.peek_byte(1) == Some(b'|') => {
                self.bump_n(2);
                TokenKind::Or
            }
            _ => {
                self.bump();
                match byte {
                    b'+' => TokenKind::Plus,
                    b'-' => TokenKind::Minus,
                    b'*' => TokenKind::Star,
                    b'/' => TokenKind::Slash,
                    b'%' => TokenKind::Percent,
                    b'<' => TokenKind::Lt,
                    b'>' => TokenKind::Gt,
                    b'&' => TokenKind::BitAnd,
                    b'|' => TokenKind::BitOr,
                    b'^' => TokenKind::BitXor,
                    b'!' => TokenKind::Not,
                    b'~' => TokenKind::BitNot,
                    b'?' => TokenKind::Question,
                    b':' => TokenKind::Colon,
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b',' => TokenKind::Comma,
                    b'=' => TokenKind::Assign,
                    b'.' => TokenKind::Dot,
                    other => TokenKind::Unknown(other as char),
                }
            }
        };
        Some(Token2 { kind, pos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind<'_>> {
        let mut lexer = Lex2::new(src, Position::anonymous());
        let mut out = Vec::new();
        while let Some(token) = lexer.next() {
            out.push(token.kind);
        }
        out
    }

    #[test]
    fn test_operators_and_idents() {
        assert_eq!(
            kinds("a ++ b == 2"),
            vec![
                TokenKind::Ident("a"),
                TokenKind::Concat,
                TokenKind::Ident("b"),
                TokenKind::Eq,
                TokenKind::Integral(2),
            ]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("frag row"),
            vec![TokenKind::Kw(Keyword::Frag), TokenKind::Ident("row")]
        );
        assert_eq!(kinds("endif"), vec![TokenKind::Kw(Keyword::Endif)]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 .5"),
            vec![
                TokenKind::Integral(1),
                TokenKind::Real(2.5),
                TokenKind::Real(0.5),
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\n\"b""#),
            vec![TokenKind::Str("a\n\"b".to_string())]
        );
        assert_eq!(kinds(r#"'it''s'"#), vec![
            TokenKind::Str("it".to_string()),
            TokenKind::Str("s".to_string()),
        ]);
    }

    #[test]
    fn test_match_operators() {
        assert_eq!(
            kinds("a =~ b !~ c"),
            vec![
                TokenKind::Ident("a"),
                TokenKind::MatchEq,
                TokenKind::Ident("b"),
                TokenKind::MatchNe,
                TokenKind::Ident("c"),
            ]
        );
    }

    #[test]
    fn test_regex_literal() {
        let mut lexer = Lex2::new(" /ab\\/c/ig ", Position::anonymous());
        assert!(lexer.regex_ahead());
        let (pattern, flags) = lexer.next_regex().unwrap();
        assert_eq!(pattern, "ab/c");
        assert_eq!(flags, "ig");
    }

    #[test]
    fn test_rooted_ident_tokens() {
        assert_eq!(
            kinds(".a.b"),
            vec![
                TokenKind::Dot,
                TokenKind::Ident("a"),
                TokenKind::Dot,
                TokenKind::Ident("b"),
            ]
        );
    }

    #[test]
    fn test_positions_track_lines() {
        let mut lexer = Lex2::new("a\n  b", Position::anonymous());
        let a = lexer.next().unwrap();
        let b = lexer.next().unwrap();
        assert_eq!((a.pos.line, a.pos.column), (1, 0));
        assert_eq!((b.pos.line, b.pos.column), (2, 2));
    }
}
