/*
 * lex1.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! Level-1 lexical analyzer.
//!
//! Splits raw template source into literal text and directive candidates;
//! directive bodies are handed to the level-2 lexer. The scanner works on one
//! token per call. When a directive start is found with text already
//! accumulated, the text token is returned first and the directive is
//! deferred to the next call.
//!
//! Directive bodies end at their closing delimiter, ignoring delimiters that
//! appear inside single- or double-quoted string literals. Comments
//! `<!--- ... --->` are swallowed entirely and produce no token.

use std::ops::Range;
use std::sync::Arc;

use crate::position::Position;

/// Level-1 token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lex1Kind {
    /// End of input, last token.
    EndOfInput,
    /// Scan error; the token carries a message.
    Error,
    /// General text.
    Text,
    /// Long directive `<?teng ...?>`.
    Teng,
    /// Short directive `<? ...?>`.
    TengShort,
    /// Escaped expression `${...}`.
    EscExpr,
    /// Raw expression `%{...}`.
    RawExpr,
    /// Dictionary lookup `#{...}`.
    Dict,
}

/// One level-1 token: kind, source position of its first character and the
/// byte range of its view within the source (delimiters included).
#[derive(Debug, Clone)]
pub struct Lex1Token {
    pub kind: Lex1Kind,
    pub pos: Position,
    pub range: Range<usize>,
    pub message: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    EndOfInput,
    LongDirective,
    ShortDirective,
    EscExprDirective,
    RawExprDirective,
    DictDirective,
    CommentDirective,
}

/// The level-1 lexer over one source buffer.
#[derive(Debug)]
pub struct Lex1 {
    source: Arc<str>,
    offset: usize,
    pos: Position,
    utf8: bool,
    short_tag: bool,
    print_escape: bool,
    state: State,
}

impl Lex1 {
    pub fn new(source: Arc<str>, filename: Option<Arc<str>>, utf8: bool, short_tag: bool, print_escape: bool) -> Self {
        let pos = Position::new(filename);
        Lex1 {
            source,
            offset: 0,
            pos,
            utf8,
            short_tag,
            print_escape,
            state: State::Initial,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The view of a token within this lexer's source.
    pub fn view(&self, token: &Lex1Token) -> &str {
        &self.source[token.range.clone()]
    }

    pub fn position(&self) -> &Position {
        &self.pos
    }

    fn byte(&self, offset: usize) -> Option<u8> {
        self.source.as_bytes().get(offset).copied()
    }

    fn matches(&self, what: &str, skip: usize) -> bool {
        let start = self.offset + skip;
        self.source
            .as_bytes()
            .get(start..start + what.len())
            .is_some_and(|bytes| bytes == what.as_bytes())
    }

    fn matches_space(&self, skip: usize) -> bool {
        self.byte(self.offset + skip)
            .is_some_and(|b| b.is_ascii_whitespace())
    }

    /// Consume one character, advancing the position UTF-8-aware when
    /// requested: multi-byte sequences advance one column, bytes are
    /// consumed per the leading-byte class.
    fn incr_pos(&mut self) {
        let Some(byte) = self.byte(self.offset) else {
            return;
        };
        if !self.utf8 {
            self.pos.advance(byte);
            self.offset += 1;
            return;
        }
        let step = match byte >> 4 {
            0b0000..=0b1011 => {
                self.pos.advance(byte);
                self.offset += 1;
                return;
            }
            0b1100 | 0b1101 => 2,
            0b1110 => 3,
            _ => match (byte & 0b0000_1100) >> 2 {
                0b00 | 0b01 => 4,
                0b10 => 5,
                _ => 6,
            },
        };
        self.pos.advance_column(1);
        self.offset = (self.offset + step).min(self.source.len());
    }

    /// Consume `n` known single-column characters.
    fn incr_col(&mut self, n: usize) {
        self.pos.advance_column(n as u32);
        self.offset = (self.offset + n).min(self.source.len());
    }

    /// Skip a quoted string literal after its opening quote; stops behind
    /// the closing quote.
    fn skip_quoted(&mut self, quote: u8) -> bool {
        while let Some(byte) = self.byte(self.offset) {
            match byte {
                b if b == quote => {
                    self.incr_col(1);
                    return true;
                }
                b'\\' => {
                    self.incr_col(1);
                    if self.offset >= self.source.len() {
                        return false;
                    }
                    self.incr_pos();
                }
                _ => self.incr_pos(),
            }
        }
        false
    }

    /// Advance behind the `}` that closes an expression body, ignoring
    /// braces inside string literals.
    fn read_expr_content(&mut self) -> bool {
        while let Some(byte) = self.byte(self.offset) {
            match byte {
                b'\'' => {
                    self.incr_col(1);
                    self.skip_quoted(b'\'');
                }
                b'"' => {
                    self.incr_col(1);
                    self.skip_quoted(b'"');
                }
                b'}' => {
                    self.incr_col(1);
                    return true;
                }
                _ => self.incr_pos(),
            }
        }
        false
    }

    /// Advance behind the `?>` that closes a directive body, ignoring
    /// closers inside string literals. `start` is the directive's first
    /// byte.
    fn read_directive_content(&mut self, start: usize) -> bool {
        while let Some(byte) = self.byte(self.offset) {
            match byte {
                b'\'' => {
                    self.incr_col(1);
                    self.skip_quoted(b'\'');
                }
                b'"' => {
                    self.incr_col(1);
                    self.skip_quoted(b'"');
                }
                b'>' => {
                    self.incr_col(1);
                    if self.offset >= 2
                        && self.byte(self.offset - 2) == Some(b'?')
                        && (self.offset - start) > "<?>".len()
                    {
                        return true;
                    }
                }
                _ => self.incr_pos(),
            }
        }
        false
    }

    /// Swallow a comment; assumes the offset sits at `<!---`. Ends at the
    /// first `--->` with at least one character in between. Returns false
    /// when the input ends inside the comment.
    fn skip_comment(&mut self, start: usize) -> bool {
        self.incr_col(5);
        while let Some(byte) = self.byte(self.offset) {
            if byte == b'>'
                && self.offset >= 3
                && self.byte(self.offset - 1) == Some(b'-')
                && self.byte(self.offset - 2) == Some(b'-')
                && self.byte(self.offset - 3) == Some(b'-')
                && (self.offset - start) > 8
            {
                self.incr_col(1);
                return true;
            }
            self.incr_pos();
        }
        false
    }

    fn token(&self, kind: Lex1Kind, pos: Position, range: Range<usize>) -> Lex1Token {
        Lex1Token {
            kind,
            pos,
            range,
            message: None,
        }
    }

    fn error_token(&self, pos: Position, range: Range<usize>, message: &'static str) -> Lex1Token {
        Lex1Token {
            kind: Lex1Kind::Error,
            pos,
            range,
            message: Some(message),
        }
    }

    fn end_token(&self, pos: Position) -> Lex1Token {
        self.token(Lex1Kind::EndOfInput, pos, self.offset..self.offset)
    }

    fn accept_long(&mut self, start: usize, pos: Position) -> Lex1Token {
        self.incr_col("<?teng".len());
        if self.read_directive_content(start) {
            self.token(Lex1Kind::Teng, pos, start..self.offset)
        } else {
            self.error_token(pos, start..self.offset, "Unterminated <?teng...?> directive")
        }
    }

    fn accept_short(&mut self, start: usize, pos: Position) -> Lex1Token {
        self.incr_col("<?".len());
        if self.read_directive_content(start) {
            self.token(Lex1Kind::TengShort, pos, start..self.offset)
        } else {
            self.error_token(pos, start..self.offset, "Unterminated <?...?> directive")
        }
    }

    fn accept_esc_expr(&mut self, start: usize, pos: Position) -> Lex1Token {
        self.incr_col("${".len());
        if self.read_expr_content() {
            self.token(Lex1Kind::EscExpr, pos, start..self.offset)
        } else {
            self.error_token(pos, start..self.offset, "Unterminated ${...} directive")
        }
    }

    fn accept_raw_expr(&mut self, start: usize, pos: Position) -> Lex1Token {
        self.incr_col("%{".len());
        if self.read_expr_content() {
            self.token(Lex1Kind::RawExpr, pos, start..self.offset)
        } else {
            self.error_token(pos, start..self.offset, "Unterminated %{...} directive")
        }
    }

    fn accept_dict(&mut self, start: usize, pos: Position) -> Lex1Token {
        self.incr_col("#{".len());
        while let Some(byte) = self.byte(self.offset) {
            if byte == b'}' {
                self.incr_col(1);
                return self.token(Lex1Kind::Dict, pos, start..self.offset);
            }
            self.incr_pos();
        }
        self.error_token(pos, start..self.offset, "Unterminated #{...} directive")
    }

    /// Return the next level-1 token.
    pub fn next(&mut self) -> Lex1Token {
        let mut start = self.offset;
        let mut start_pos = self.pos.clone();

        // deferred directives first
        match self.state {
            State::Initial => {}
            State::EndOfInput => return self.end_token(start_pos),
            State::CommentDirective => {
                self.state = State::Initial;
                self.skip_comment(start);
                start = self.offset;
                start_pos = self.pos.clone();
            }
            State::LongDirective => {
                self.state = State::Initial;
                return self.accept_long(start, start_pos);
            }
            State::ShortDirective => {
                self.state = State::Initial;
                return self.accept_short(start, start_pos);
            }
            State::EscExprDirective => {
                self.state = State::Initial;
                return self.accept_esc_expr(start, start_pos);
            }
            State::RawExprDirective => {
                self.state = State::Initial;
                return self.accept_raw_expr(start, start_pos);
            }
            State::DictDirective => {
                self.state = State::Initial;
                return self.accept_dict(start, start_pos);
            }
        }

        while let Some(byte) = self.byte(self.offset) {
            match byte {
                b'<' => {
                    if self.byte(self.offset + 1) == Some(b'?') {
                        if self.matches("teng", 2) && self.matches_space(6) {
                            if self.offset == start {
                                return self.accept_long(start, start_pos);
                            }
                            self.state = State::LongDirective;
                            return self.token(Lex1Kind::Text, start_pos, start..self.offset);
                        }
                        if self.short_tag {
                            if self.offset == start {
                                return self.accept_short(start, start_pos);
                            }
                            self.state = State::ShortDirective;
                            return self.token(Lex1Kind::Text, start_pos, start..self.offset);
                        }
                        self.incr_pos();
                        continue;
                    }
                    if self.byte(self.offset + 1) == Some(b'!') && self.matches("---", 2) {
                        if self.offset != start {
                            self.state = State::CommentDirective;
                            return self.token(Lex1Kind::Text, start_pos, start..self.offset);
                        }
                        if !self.skip_comment(start) {
                            return self.end_token(start_pos);
                        }
                        start = self.offset;
                        start_pos = self.pos.clone();
                        continue;
                    }
                    self.incr_pos();
                }
                b'$' => {
                    if self.byte(self.offset + 1) != Some(b'{') {
                        self.incr_pos();
                        continue;
                    }
                    if self.offset == start {
                        return self.accept_esc_expr(start, start_pos);
                    }
                    self.state = State::EscExprDirective;
                    return self.token(Lex1Kind::Text, start_pos, start..self.offset);
                }
                b'%' => {
                    if self.byte(self.offset + 1) != Some(b'{') || !self.print_escape {
                        self.incr_pos();
                        continue;
                    }
                    if self.offset == start {
                        return self.accept_raw_expr(start, start_pos);
                    }
                    self.state = State::RawExprDirective;
                    return self.token(Lex1Kind::Text, start_pos, start..self.offset);
                }
                b'#' => {
                    if self.byte(self.offset + 1) != Some(b'{') {
                        self.incr_pos();
                        continue;
                    }
                    if self.offset == start {
                        return self.accept_dict(start, start_pos);
                    }
                    self.state = State::DictDirective;
                    return self.token(Lex1Kind::Text, start_pos, start..self.offset);
                }
                _ => self.incr_pos(),
            }
        }

        // trailing text is emitted before the end-of-input token
        if self.offset == start {
            self.end_token(start_pos)
        } else {
            self.state = State::EndOfInput;
            self.token(Lex1Kind::Text, start_pos, start..self.offset)
        }
    }
}

/// Unescape literal text: the six escape sequences collapse to their
/// literal form, any other sequence is copied verbatim.
///
/// `$\{` and `#\{` become `${` / `#{`, `<\?` becomes `<?`, `?\>` becomes
/// `?>`, `\}` becomes `}`, and `%\{` becomes `%{` only when the print-escape
/// syntax is enabled. A `\}` immediately preceded by `%` stays verbatim.
pub fn unescape(source: &str, print_escape: bool) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    let mut prev: Option<char> = None;
    while !rest.is_empty() {
        let (replacement, consumed) = if rest.starts_with("$\\{") {
            (Some("${"), 3)
        } else if rest.starts_with("#\\{") {
            (Some("#{"), 3)
        } else if rest.starts_with("%\\{") && print_escape {
            (Some("%{"), 3)
        } else if rest.starts_with("<\\?") {
            (Some("<?"), 3)
        } else if rest.starts_with("?\\>") {
            (Some("?>"), 3)
        } else if rest.starts_with("\\}") && prev != Some('%') {
            (Some("}"), 2)
        } else {
            (None, 0)
        };
        match replacement {
            Some(text) => {
                out.push_str(text);
                rest = &rest[consumed..];
                prev = text.chars().last();
            }
            None => match rest.chars().next() {
                Some(ch) => {
                    out.push(ch);
                    rest = &rest[ch.len_utf8()..];
                    prev = Some(ch);
                }
                None => break,
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<(Lex1Kind, String)> {
        let mut lexer = Lex1::new(Arc::from(source), None, false, true, true);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next();
            let view = lexer.view(&token).to_string();
            let kind = token.kind;
            tokens.push((kind, view));
            if matches!(kind, Lex1Kind::EndOfInput | Lex1Kind::Error) {
                break;
            }
        }
        tokens
    }

    #[test]
    fn test_plain_text() {
        let tokens = lex("hello world");
        assert_eq!(tokens[0], (Lex1Kind::Text, "hello world".to_string()));
        assert_eq!(tokens[1].0, Lex1Kind::EndOfInput);
    }

    #[test]
    fn test_directive_with_prefix_and_suffix() {
        let tokens = lex("pre${name}post");
        assert_eq!(tokens[0], (Lex1Kind::Text, "pre".to_string()));
        assert_eq!(tokens[1], (Lex1Kind::EscExpr, "${name}".to_string()));
        assert_eq!(tokens[2], (Lex1Kind::Text, "post".to_string()));
    }

    #[test]
    fn test_long_directive_requires_whitespace() {
        let tokens = lex("<?teng if a?>");
        assert_eq!(tokens[0], (Lex1Kind::Teng, "<?teng if a?>".to_string()));
        // no whitespace after "teng" makes it a short directive
        let tokens = lex("<?tengif a?>");
        assert_eq!(tokens[0].0, Lex1Kind::TengShort);
    }

    #[test]
    fn test_short_tag_disabled() {
        let mut lexer = Lex1::new(Arc::from("<?x?>"), None, false, false, false);
        let token = lexer.next();
        assert_eq!(token.kind, Lex1Kind::Text);
        assert_eq!(lexer.view(&token), "<?x?>");
    }

    #[test]
    fn test_quoted_closer_is_ignored() {
        let tokens = lex("${a ++ \"}\"}");
        assert_eq!(tokens[0], (Lex1Kind::EscExpr, "${a ++ \"}\"}".to_string()));
        let tokens = lex("<?teng if a == '?>'?>x");
        assert_eq!(tokens[0], (Lex1Kind::Teng, "<?teng if a == '?>'?>".to_string()));
    }

    #[test]
    fn test_comment_is_swallowed() {
        let tokens = lex("a<!--- secret --->b");
        assert_eq!(tokens[0], (Lex1Kind::Text, "a".to_string()));
        assert_eq!(tokens[1], (Lex1Kind::Text, "b".to_string()));
        assert_eq!(tokens[2].0, Lex1Kind::EndOfInput);
    }

    #[test]
    fn test_comment_needs_inner_character() {
        // `<!------>` has no character between the markers
        let tokens = lex("<!------>");
        assert_eq!(tokens[0].0, Lex1Kind::EndOfInput);
    }

    #[test]
    fn test_dict_token() {
        let tokens = lex("x#{greeting}y");
        assert_eq!(tokens[1], (Lex1Kind::Dict, "#{greeting}".to_string()));
    }

    #[test]
    fn test_raw_expr_disabled() {
        let mut lexer = Lex1::new(Arc::from("%{a}"), None, false, false, false);
        let token = lexer.next();
        assert_eq!(token.kind, Lex1Kind::Text);
    }

    #[test]
    fn test_unterminated_directive() {
        let tokens = lex("${name");
        assert_eq!(tokens[0].0, Lex1Kind::Error);
        let mut lexer = Lex1::new(Arc::from("${name"), None, false, false, false);
        let token = lexer.next();
        assert_eq!(token.message, Some("Unterminated ${...} directive"));
    }

    #[test]
    fn test_positions() {
        let mut lexer = Lex1::new(Arc::from("ab\ncd${x}"), None, false, false, false);
        let text = lexer.next();
        assert_eq!((text.pos.line, text.pos.column), (1, 0));
        let expr = lexer.next();
        assert_eq!(expr.kind, Lex1Kind::EscExpr);
        assert_eq!((expr.pos.line, expr.pos.column), (2, 2));
    }

    #[test]
    fn test_utf8_positions_count_characters() {
        let mut lexer = Lex1::new(Arc::from("žluť${x}"), None, true, false, false);
        let text = lexer.next();
        assert_eq!(text.kind, Lex1Kind::Text);
        let expr = lexer.next();
        assert_eq!(expr.pos.column, 4);
    }

    #[test]
    fn test_unescape_sequences() {
        assert_eq!(unescape("$\\{a}", false), "${a}");
        assert_eq!(unescape("#\\{k}", false), "#{k}");
        assert_eq!(unescape("<\\? x ?\\>", false), "<? x ?>");
        assert_eq!(unescape("a\\}b", false), "a}b");
        assert_eq!(unescape("%\\{r}", true), "%{r}");
        assert_eq!(unescape("%\\{r}", false), "%\\{r}");
    }

    #[test]
    fn test_unescape_copies_unknown_sequences() {
        assert_eq!(unescape("c:\\temp\\x", false), "c:\\temp\\x");
        assert_eq!(unescape("\\{", false), "\\{");
        // a backslash-brace right after a percent stays verbatim
        assert_eq!(unescape("%\\}", false), "%\\}");
        assert_eq!(unescape("$\\}", false), "$}");
    }

    #[test]
    fn test_unescape_idempotent_on_clean_output() {
        let once = unescape("$\\{a} <\\? \\} ?\\>", true);
        assert_eq!(unescape(&once, true), once);
    }
}
