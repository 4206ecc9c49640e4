/*
 * parser.rs
 * Copyright (c) 2025 Posit, PBC
 */

//! The directive parser.
//!
//! Pulls level-1 tokens, tokenizes directive bodies with the level-2 lexer
//! and emits bytecode directly from the reductions -- no AST is retained.
//! Forward jumps are backpatched; every parse error is recorded in the
//! program's diagnostics and the parser resynchronizes at the next
//! directive boundary, so compilation always yields a (possibly degraded)
//! program.
//!
//! The parser tracks the open fragments per chain at compile time: plain
//! identifiers resolve against the innermost chain at the current depth,
//! rooted identifiers (`.a.b.c`) against the open-fragment prefix of the
//! current chain, and a rooted `frag` under an open fragment starts a new
//! chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::formatter::{resolve_mode, FormatterMode};
use crate::lex1::{unescape, Lex1, Lex1Kind, Lex1Token};
use crate::lex2::{Keyword, Lex2, Token2, TokenKind};
use crate::position::Position;
use crate::program::{Constant, Dependency, Identifier, OpCode, Program};
use crate::resolver::SourceResolver;
use crate::value::{RegexFlags, RegexValue};

/// Compilation environment: configuration flags that affect lexing and the
/// resolver used for `include` directives.
pub struct CompileParams<'a> {
    pub config: &'a Config,
    pub resolver: &'a dyn SourceResolver,
}

/// Compile a template given as a string.
pub fn compile_string(source: &str, filename: Option<Arc<str>>, params: &CompileParams) -> Program {
    let mut parser = Parser::new(params);
    parser.push_source(Arc::from(source), filename, None);
    parser.run()
}

/// Compile a template from a file resolved through the params' resolver.
pub fn compile_file(path: &Path, params: &CompileParams) -> Program {
    let mut parser = Parser::new(params);
    match params.resolver.load(path) {
        Some(source) => {
            parser.program.deps.push(Dependency {
                path: source.absolute.clone(),
                mtime: source.mtime,
            });
            let filename: Arc<str> = Arc::from(path.to_string_lossy().as_ref());
            parser.push_source(Arc::from(source.content.as_str()), Some(filename), Some(source.absolute));
        }
        None => {
            parser.program.deps.push(Dependency {
                path: path.to_path_buf(),
                mtime: None,
            });
            parser.program.diagnostics.fatal(
                Position::none(),
                format!("Cannot open template file '{}'", path.display()),
            );
        }
    }
    parser.run()
}

/// Marker for an abandoned directive; the diagnostic is already logged.
struct Abort;

type PResult<T> = Result<T, Abort>;

struct FragSegment {
    open_addr: usize,
    body_addr: usize,
}

enum Block {
    Frag {
        segments: Vec<FragSegment>,
        pops_chain: bool,
    },
    Cond {
        pending_end: Vec<usize>,
        pending_false: Option<usize>,
        in_else: bool,
    },
    Format,
    Ctype,
}

impl Block {
    fn name(&self) -> &'static str {
        match self {
            Block::Frag { .. } => "frag",
            Block::Cond { .. } => "if",
            Block::Format => "format",
            Block::Ctype => "ctype",
        }
    }
}

/// One-token-lookahead stream over a directive body.
struct TokenStream<'b> {
    lex: Lex2<'b>,
    peeked: Option<Option<Token2<'b>>>,
    start: Position,
}

impl<'b> TokenStream<'b> {
    fn new(body: &'b str, pos: Position) -> Self {
        TokenStream {
            lex: Lex2::new(body, pos.clone()),
            peeked: None,
            start: pos,
        }
    }

    fn next(&mut self) -> Option<Token2<'b>> {
        match self.peeked.take() {
            Some(token) => token,
            None => self.lex.next(),
        }
    }

    fn peek(&mut self) -> Option<&Token2<'b>> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex.next());
        }
        self.peeked.as_ref().and_then(|token| token.as_ref())
    }

    /// Position for diagnostics: the next token when there is one, else
    /// the directive start.
    fn pos(&mut self) -> Position {
        match self.peek() {
            Some(token) => token.pos.clone(),
            None => self.start.clone(),
        }
    }

    fn regex_ahead(&mut self) -> bool {
        self.peeked.is_none() && self.lex.regex_ahead()
    }

    fn next_regex(&mut self) -> Result<(String, String), &'static str> {
        self.lex.next_regex()
    }
}

struct Parser<'a> {
    config: &'a Config,
    resolver: &'a dyn SourceResolver,
    program: Program,
    blocks: Vec<Block>,
    /// Open fragment names, one vector per compile-time chain.
    chains: Vec<Vec<String>>,
    lexers: Vec<Lex1>,
    /// Absolute paths of the sources on the lexer stack, for include-cycle
    /// detection. Parallel to `lexers`; string sources have no path.
    source_paths: Vec<Option<PathBuf>>,
    last_pos: Position,
}

impl<'a> Parser<'a> {
    fn new(params: &CompileParams<'a>) -> Self {
        Parser {
            config: params.config,
            resolver: params.resolver,
            program: Program::new(),
            blocks: Vec::new(),
            chains: vec![Vec::new()],
            lexers: Vec::new(),
            source_paths: Vec::new(),
            last_pos: Position::anonymous(),
        }
    }

    fn push_source(&mut self, source: Arc<str>, filename: Option<Arc<str>>, path: Option<PathBuf>) {
        self.lexers.push(Lex1::new(
            source,
            filename,
            self.config.utf8,
            self.config.short_tag,
            self.config.print_escape,
        ));
        self.source_paths.push(path);
    }

    fn run(mut self) -> Program {
        loop {
            let Some(lexer) = self.lexers.last_mut() else {
                break;
            };
            let token = lexer.next();
            let view = lexer.view(&token).to_string();
            self.last_pos = token.pos.clone();
            match token.kind {
                Lex1Kind::EndOfInput => {
                    self.lexers.pop();
                    self.source_paths.pop();
                }
                Lex1Kind::Error => {
                    let message = token.message.unwrap_or("Lexical error");
                    self.program.diagnostics.error(token.pos, message);
                }
                Lex1Kind::Text => self.text(&view, &token),
                Lex1Kind::Teng => self.directive(&view, &token, "<?teng"),
                Lex1Kind::TengShort => self.directive(&view, &token, "<?"),
                Lex1Kind::EscExpr => self.print_expr(&view, &token, true),
                Lex1Kind::RawExpr => self.print_expr(&view, &token, false),
                Lex1Kind::Dict => self.dict_lookup(&view, &token),
            }
        }
        self.finish();
        self.program
    }

    fn finish(&mut self) {
        while let Some(block) = self.blocks.pop() {
            let pos = self.last_pos.clone();
            self.program
                .diagnostics
                .error(pos.clone(), format!("Missing end{} directive", block.name()));
            match block {
                Block::Frag {
                    segments,
                    pops_chain,
                } => self.emit_frag_closes(segments, pops_chain, &pos),
                Block::Cond {
                    pending_end,
                    pending_false,
                    ..
                } => {
                    let here = self.program.len();
                    if let Some(addr) = pending_false {
                        self.program.patch_jump(addr, here);
                    }
                    for addr in pending_end {
                        self.program.patch_jump(addr, here);
                    }
                }
                Block::Format => {
                    self.program.push(OpCode::PopFormat, pos);
                }
                Block::Ctype => {
                    self.program.push(OpCode::PopCtype, pos);
                }
            }
        }
        self.program.push(OpCode::Halt, self.last_pos.clone());
    }

    // ------------------------------------------------------------------
    // level-1 token handling

    fn text(&mut self, view: &str, token: &Lex1Token) {
        let unescaped = unescape(view, self.config.print_escape);
        if unescaped.is_empty() {
            return;
        }
        self.push_const(Constant::Str(unescaped), &token.pos);
        self.program.push(OpCode::Print, token.pos.clone());
    }

    /// Body of a delimited token, with the position of its first byte.
    fn body<'v>(&self, view: &'v str, token: &Lex1Token, prefix: &str, suffix: &str) -> (&'v str, Position) {
        let start = prefix.len().min(view.len());
        let end = view.len().saturating_sub(suffix.len()).max(start);
        let mut pos = token.pos.clone();
        pos.advance_column(prefix.len() as u32);
        (&view[start..end], pos)
    }

    fn directive(&mut self, view: &str, token: &Lex1Token, prefix: &str) {
        let (body, pos) = self.body(view, token, prefix, "?>");
        let mut stream = TokenStream::new(body, pos.clone());
        let Some(first) = stream.next() else {
            self.program.diagnostics.error(pos, "Empty directive");
            return;
        };
        // a leading `teng` keyword in short directives is tolerated
        let first = if first.kind == TokenKind::Kw(Keyword::Teng) {
            match stream.next() {
                Some(token) => token,
                None => {
                    self.program.diagnostics.error(pos, "Empty teng directive");
                    return;
                }
            }
        } else {
            first
        };

        let result = match first.kind {
            TokenKind::Kw(Keyword::Frag) => self.dir_frag(&mut stream, &first.pos),
            TokenKind::Kw(Keyword::Endfrag) => self.dir_endfrag(&first.pos),
            TokenKind::Kw(Keyword::If) => self.dir_if(&mut stream, &first.pos),
            TokenKind::Kw(Keyword::Elif) => self.dir_elif(&mut stream, &first.pos),
            TokenKind::Kw(Keyword::Else) => self.dir_else(&first.pos),
            TokenKind::Kw(Keyword::Endif) => self.dir_endif(&first.pos),
            TokenKind::Kw(Keyword::Set) => self.dir_set(&mut stream, &first.pos),
            TokenKind::Kw(Keyword::Ctype) => self.dir_ctype(&mut stream, &first.pos),
            TokenKind::Kw(Keyword::Endctype) => self.dir_endctype(&first.pos),
            TokenKind::Kw(Keyword::Format) => self.dir_format(&mut stream, &first.pos),
            TokenKind::Kw(Keyword::Endformat) => self.dir_endformat(&first.pos),
            TokenKind::Kw(Keyword::Include) => self.dir_include(&mut stream, &first.pos),
            TokenKind::Kw(Keyword::Debug) => {
                self.program.push(OpCode::Debug, first.pos.clone());
                Ok(())
            }
            TokenKind::Kw(Keyword::Bytecode) => {
                self.program.push(OpCode::Bytecode, first.pos.clone());
                Ok(())
            }
            TokenKind::Kw(Keyword::Case | Keyword::Endcase | Keyword::Break) => {
                self.program.diagnostics.error(
                    first.pos.clone(),
                    "Reserved word cannot start a directive",
                );
                return;
            }
            ref other => {
                self.program.diagnostics.error(
                    first.pos.clone(),
                    format!("Unknown teng directive starting with {:?}", other),
                );
                return;
            }
        };
        if result.is_ok() {
            self.expect_directive_end(&mut stream);
        }
    }

    fn expect_directive_end(&mut self, stream: &mut TokenStream<'_>) {
        if let Some(extra) = stream.next() {
            self.program.diagnostics.error(
                extra.pos,
                "Unexpected token after directive; rest ignored",
            );
        }
    }

    fn print_expr(&mut self, view: &str, token: &Lex1Token, escaped: bool) {
        let (body, pos) = self.body(view, token, if escaped { "${" } else { "%{" }, "}");
        let mut stream = TokenStream::new(body, pos.clone());
        let start = self.program.len();
        let ok = self.parse_expr(&mut stream).is_ok() && {
            match stream.next() {
                None => true,
                Some(extra) => {
                    self.program
                        .diagnostics
                        .error(extra.pos, "Unexpected token after expression");
                    false
                }
            }
        };
        if !ok {
            // degrade the whole expression to undefined, keeping the
            // operand stack balanced
            self.program.truncate(start);
            self.push_const(Constant::Undefined, &pos);
        }
        // an explicit escape() call suppresses the automatic escaping
        let explicit_escape = matches!(
            self.program.instrs().last().map(|i| &i.op),
            Some(OpCode::Func { name, .. }) if name == "escape"
        );
        let op = if escaped && !explicit_escape {
            OpCode::PrintEsc
        } else {
            OpCode::Print
        };
        self.program.push(op, pos);
    }

    fn dict_lookup(&mut self, view: &str, token: &Lex1Token) {
        let (body, pos) = self.body(view, token, "#{", "}");
        let key = body.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            self.program
                .diagnostics
                .error(pos, format!("Invalid dictionary key '{}'", key));
            return;
        }
        let index = self.program.add_constant(Constant::Str(key.to_string()));
        self.program.push(OpCode::PushDict { key: index }, pos.clone());
        self.program.push(OpCode::Print, pos);
    }

    // ------------------------------------------------------------------
    // directives

    fn syntax_error(&mut self, pos: Position, msg: impl Into<String>) -> Abort {
        self.program.diagnostics.error(pos, msg);
        Abort
    }

    fn cur_context(&self) -> u16 {
        (self.chains.len() - 1) as u16
    }

    fn cur_depth(&self) -> u16 {
        self.chains.last().map_or(0, |chain| chain.len()) as u16
    }

    fn open_frags(&self) -> &[String] {
        self.chains.last().map_or(&[], |chain| chain.as_slice())
    }

    fn push_const(&mut self, constant: Constant, pos: &Position) {
        let index = self.program.add_constant(constant);
        self.program.push(OpCode::PushConst { index }, pos.clone());
    }

    /// Parse a dotted name, optionally rooted with a leading dot. `first`
    /// is the already-consumed first segment, if any.
    fn parse_path(
        &mut self,
        stream: &mut TokenStream<'_>,
        first: Option<&str>,
    ) -> PResult<(bool, Vec<String>)> {
        let mut rooted = false;
        let mut path = Vec::new();
        match first {
            Some(name) => path.push(name.to_string()),
            None => match stream.next() {
                Some(Token2 {
                    kind: TokenKind::Dot,
                    ..
                }) => {
                    rooted = true;
                    match stream.next() {
                        Some(Token2 {
                            kind: TokenKind::Ident(name),
                            ..
                        }) => path.push(name.to_string()),
                        other => {
                            let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                            return Err(self.syntax_error(pos, "Expected name after '.'"));
                        }
                    }
                }
                Some(Token2 {
                    kind: TokenKind::Ident(name),
                    ..
                }) => path.push(name.to_string()),
                other => {
                    let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                    return Err(self.syntax_error(pos, "Expected name"));
                }
            },
        }
        while matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::Dot)) {
            stream.next();
            match stream.next() {
                Some(Token2 {
                    kind: TokenKind::Ident(name),
                    ..
                }) => path.push(name.to_string()),
                other => {
                    let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                    return Err(self.syntax_error(pos, "Expected name after '.'"));
                }
            }
        }
        Ok((rooted, path))
    }

    /// Resolve a variable identifier: plain names bind to the innermost
    /// chain at the current depth, rooted paths to the open-fragment
    /// prefix of the current chain.
    fn resolve_variable(
        &mut self,
        rooted: bool,
        path: &[String],
        pos: &Position,
    ) -> PResult<Identifier> {
        if !rooted {
            if path.len() != 1 {
                return Err(self.syntax_error(
                    pos.clone(),
                    "Dotted names are attribute accesses, not variables",
                ));
            }
            return Ok(Identifier {
                name: path[0].clone(),
                context: self.cur_context(),
                depth: self.cur_depth(),
            });
        }
        let prefix = &path[..path.len() - 1];
        let open = self.open_frags();
        if prefix.len() > open.len() || open[..prefix.len()] != *prefix {
            return Err(self.syntax_error(
                pos.clone(),
                format!(
                    "Rooted name '.{}' does not match the open fragments",
                    path.join(".")
                ),
            ));
        }
        Ok(Identifier {
            name: path[path.len() - 1].clone(),
            context: self.cur_context(),
            depth: prefix.len() as u16,
        })
    }

    fn dir_frag(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        let (rooted, path) = self.parse_path(stream, None)?;
        let mut pops_chain = false;
        if rooted && !self.open_frags().is_empty() {
            self.chains.push(Vec::new());
            pops_chain = true;
        }
        let mut segments = Vec::new();
        for (index, name) in path.iter().enumerate() {
            let context = if index == 0 && pops_chain {
                self.cur_context()
            } else {
                0
            };
            let ident = self.program.add_identifier(Identifier {
                name: name.clone(),
                context,
                depth: self.cur_depth(),
            });
            let op = if name == crate::fragment_stack::ERROR_FRAG_NAME {
                OpCode::OpenErrorFrag {
                    ident,
                    exit: usize::MAX,
                }
            } else {
                OpCode::OpenFrag {
                    ident,
                    exit: usize::MAX,
                }
            };
            let open_addr = self.program.push(op, pos.clone());
            segments.push(FragSegment {
                open_addr,
                body_addr: self.program.len(),
            });
            if let Some(chain) = self.chains.last_mut() {
                chain.push(name.clone());
            }
        }
        self.blocks.push(Block::Frag {
            segments,
            pops_chain,
        });
        Ok(())
    }

    fn emit_frag_closes(
        &mut self,
        segments: Vec<FragSegment>,
        pops_chain: bool,
        pos: &Position,
    ) {
        for segment in segments.iter().rev() {
            self.program.push(
                OpCode::RepeatFrag {
                    back: segment.body_addr,
                },
                pos.clone(),
            );
            self.program.push(OpCode::CloseFrag, pos.clone());
            let here = self.program.len();
            self.program.patch_jump(segment.open_addr, here);
            if let Some(chain) = self.chains.last_mut() {
                chain.pop();
            }
        }
        if pops_chain {
            self.chains.pop();
        }
    }

    fn dir_endfrag(&mut self, pos: &Position) -> PResult<()> {
        match self.blocks.pop() {
            Some(Block::Frag {
                segments,
                pops_chain,
            }) => {
                self.emit_frag_closes(segments, pops_chain, pos);
                Ok(())
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                Err(self.syntax_error(pos.clone(), "Unexpected endfrag directive"))
            }
        }
    }

    fn dir_if(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        let start = self.program.len();
        if self.parse_expr(stream).is_err() {
            self.program.truncate(start);
            self.push_const(Constant::Undefined, pos);
        }
        let jump = self
            .program
            .push(OpCode::JmpIfFalse { target: usize::MAX }, pos.clone());
        self.blocks.push(Block::Cond {
            pending_end: Vec::new(),
            pending_false: Some(jump),
            in_else: false,
        });
        Ok(())
    }

    fn dir_elif(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        match self.blocks.last_mut() {
            Some(Block::Cond {
                pending_end,
                pending_false,
                in_else: false,
            }) => {
                let skip = self
                    .program
                    .push(OpCode::Jmp { target: usize::MAX }, pos.clone());
                pending_end.push(skip);
                let false_target = pending_false.take();
                let here = self.program.len();
                if let Some(addr) = false_target {
                    self.program.patch_jump(addr, here);
                }
            }
            _ => return Err(self.syntax_error(pos.clone(), "Unexpected elif directive")),
        }
        let start = self.program.len();
        if self.parse_expr(stream).is_err() {
            self.program.truncate(start);
            self.push_const(Constant::Undefined, pos);
        }
        let jump = self
            .program
            .push(OpCode::JmpIfFalse { target: usize::MAX }, pos.clone());
        if let Some(Block::Cond { pending_false, .. }) = self.blocks.last_mut() {
            *pending_false = Some(jump);
        }
        Ok(())
    }

    fn dir_else(&mut self, pos: &Position) -> PResult<()> {
        let skip = self
            .program
            .push(OpCode::Jmp { target: usize::MAX }, pos.clone());
        match self.blocks.last_mut() {
            Some(Block::Cond {
                pending_end,
                pending_false,
                in_else,
            }) if !*in_else => {
                pending_end.push(skip);
                *in_else = true;
                let false_target = pending_false.take();
                if let Some(addr) = false_target {
                    let here = self.program.len();
                    self.program.patch_jump(addr, here);
                }
                Ok(())
            }
            _ => {
                // remove the speculative jump again
                self.program.truncate(self.program.len() - 1);
                Err(self.syntax_error(pos.clone(), "Unexpected else directive"))
            }
        }
    }

    fn dir_endif(&mut self, pos: &Position) -> PResult<()> {
        match self.blocks.pop() {
            Some(Block::Cond {
                pending_end,
                pending_false,
                ..
            }) => {
                let here = self.program.len();
                if let Some(addr) = pending_false {
                    self.program.patch_jump(addr, here);
                }
                for addr in pending_end {
                    self.program.patch_jump(addr, here);
                }
                Ok(())
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                Err(self.syntax_error(pos.clone(), "Unexpected endif directive"))
            }
        }
    }

    fn dir_set(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        let (rooted, path) = self.parse_path(stream, None)?;
        let ident = self.resolve_variable(rooted, &path, pos)?;
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Assign,
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected '=' in set directive"));
            }
        }
        self.parse_expr(stream)?;
        let index = self.program.add_identifier(ident);
        self.program.push(OpCode::SetVar { ident: index }, pos.clone());
        Ok(())
    }

    fn dir_ctype(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Str(name),
                ..
            }) => {
                let index = self.program.add_constant(Constant::Str(name));
                self.program
                    .push(OpCode::PushCtype { name: index }, pos.clone());
                self.blocks.push(Block::Ctype);
                Ok(())
            }
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                Err(self.syntax_error(pos, "Expected content type name string"))
            }
        }
    }

    fn dir_endctype(&mut self, pos: &Position) -> PResult<()> {
        match self.blocks.pop() {
            Some(Block::Ctype) => {
                self.program.push(OpCode::PopCtype, pos.clone());
                Ok(())
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                Err(self.syntax_error(pos.clone(), "Unexpected endctype directive"))
            }
        }
    }

    fn dir_format(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Ident("space"),
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected space=\"mode\" in format directive"));
            }
        }
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Assign,
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected '=' in format directive"));
            }
        }
        let mode = match stream.next() {
            Some(Token2 {
                kind: TokenKind::Str(name),
                pos: name_pos,
            }) => {
                let mode = resolve_mode(&name);
                if mode == FormatterMode::Invalid {
                    self.program
                        .diagnostics
                        .warning(name_pos, format!("Unknown format mode '{}'", name));
                }
                mode
            }
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected format mode string"));
            }
        };
        self.program.push(OpCode::PushFormat { mode }, pos.clone());
        self.blocks.push(Block::Format);
        Ok(())
    }

    fn dir_endformat(&mut self, pos: &Position) -> PResult<()> {
        match self.blocks.pop() {
            Some(Block::Format) => {
                self.program.push(OpCode::PopFormat, pos.clone());
                Ok(())
            }
            other => {
                if let Some(block) = other {
                    self.blocks.push(block);
                }
                Err(self.syntax_error(pos.clone(), "Unexpected endformat directive"))
            }
        }
    }

    fn dir_include(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Ident("file"),
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected file=\"path\" in include directive"));
            }
        }
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Assign,
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected '=' in include directive"));
            }
        }
        let path = match stream.next() {
            Some(Token2 {
                kind: TokenKind::Str(path),
                ..
            }) => path,
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected include path string"));
            }
        };

        if self.lexers.len() > self.config.max_include_depth {
            return Err(self.syntax_error(
                pos.clone(),
                format!("Include depth exceeded at '{}'", path),
            ));
        }
        let Some(source) = self.resolver.load(Path::new(&path)) else {
            self.program.deps.push(Dependency {
                path: PathBuf::from(&path),
                mtime: None,
            });
            return Err(self.syntax_error(
                pos.clone(),
                format!("Cannot open include file '{}'", path),
            ));
        };
        if self
            .source_paths
            .iter()
            .any(|p| p.as_deref() == Some(source.absolute.as_path()))
        {
            return Err(self.syntax_error(
                pos.clone(),
                format!("Cyclic include of '{}'", path),
            ));
        }
        self.program.deps.push(Dependency {
            path: source.absolute.clone(),
            mtime: source.mtime,
        });
        let filename: Arc<str> = Arc::from(path.as_str());
        self.push_source(
            Arc::from(source.content.as_str()),
            Some(filename),
            Some(source.absolute),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // expressions

    fn parse_expr(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_ternary(stream)
    }

    fn parse_ternary(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_or(stream)?;
        if !matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::Question)) {
            return Ok(());
        }
        let pos = stream.pos();
        stream.next();
        let skip_true = self
            .program
            .push(OpCode::JmpIfFalse { target: usize::MAX }, pos.clone());
        self.parse_expr(stream)?;
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Colon,
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected ':' in conditional expression"));
            }
        }
        let skip_false = self
            .program
            .push(OpCode::Jmp { target: usize::MAX }, pos);
        let here = self.program.len();
        self.program.patch_jump(skip_true, here);
        self.parse_expr(stream)?;
        let here = self.program.len();
        self.program.patch_jump(skip_false, here);
        Ok(())
    }

    fn parse_or(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_and(stream)?;
        let mut decided = Vec::new();
        while matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            let pos = stream.pos();
            stream.next();
            decided.push(
                self.program
                    .push(OpCode::JmpIfTrueKeep { target: usize::MAX }, pos),
            );
            self.parse_and(stream)?;
        }
        let here = self.program.len();
        for addr in decided {
            self.program.patch_jump(addr, here);
        }
        Ok(())
    }

    fn parse_and(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_bitor(stream)?;
        let mut decided = Vec::new();
        while matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            let pos = stream.pos();
            stream.next();
            decided.push(
                self.program
                    .push(OpCode::JmpIfFalseKeep { target: usize::MAX }, pos),
            );
            self.parse_bitor(stream)?;
        }
        let here = self.program.len();
        for addr in decided {
            self.program.patch_jump(addr, here);
        }
        Ok(())
    }

    fn parse_bitor(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_bitxor(stream)?;
        while matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::BitOr)) {
            let pos = stream.pos();
            stream.next();
            self.parse_bitxor(stream)?;
            self.program.push(OpCode::BitOr, pos);
        }
        Ok(())
    }

    fn parse_bitxor(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_bitand(stream)?;
        while matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::BitXor)) {
            let pos = stream.pos();
            stream.next();
            self.parse_bitand(stream)?;
            self.program.push(OpCode::BitXor, pos);
        }
        Ok(())
    }

    fn parse_bitand(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_equality(stream)?;
        while matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::BitAnd)) {
            let pos = stream.pos();
            stream.next();
            self.parse_equality(stream)?;
            self.program.push(OpCode::BitAnd, pos);
        }
        Ok(())
    }

    fn parse_equality(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_relational(stream)?;
        loop {
            let op = match stream.peek().map(|t| &t.kind) {
                Some(TokenKind::Eq) => OpCode::Eq,
                Some(TokenKind::Ne) => OpCode::Ne,
                Some(TokenKind::MatchEq) => OpCode::MatchRegex { negated: false },
                Some(TokenKind::MatchNe) => OpCode::MatchRegex { negated: true },
                _ => return Ok(()),
            };
            let pos = stream.pos();
            stream.next();
            if matches!(op, OpCode::MatchRegex { .. }) && stream.regex_ahead() {
                match stream.next_regex() {
                    Ok((pattern, flag_chars)) => {
                        let flags = RegexFlags::parse(&flag_chars).unwrap_or_else(|| {
                            self.program.diagnostics.error(
                                pos.clone(),
                                format!("Invalid regex flags '{}'", flag_chars),
                            );
                            RegexFlags::default()
                        });
                        match RegexValue::compile(&pattern, flags) {
                            Ok(regex) => {
                                self.push_const(Constant::Regex(Arc::new(regex)), &pos)
                            }
                            Err(err) => {
                                self.program.diagnostics.error(
                                    pos.clone(),
                                    format!("Invalid regex /{}/: {}", pattern, err),
                                );
                                self.push_const(Constant::Undefined, &pos);
                            }
                        }
                    }
                    Err(message) => return Err(self.syntax_error(pos, message)),
                }
            } else {
                self.parse_relational(stream)?;
            }
            self.program.push(op, pos);
        }
    }

    fn parse_relational(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_concat(stream)?;
        loop {
            let op = match stream.peek().map(|t| &t.kind) {
                Some(TokenKind::Lt) => OpCode::Lt,
                Some(TokenKind::Le) => OpCode::Le,
                Some(TokenKind::Gt) => OpCode::Gt,
                Some(TokenKind::Ge) => OpCode::Ge,
                _ => return Ok(()),
            };
            let pos = stream.pos();
            stream.next();
            self.parse_concat(stream)?;
            self.program.push(op, pos);
        }
    }

    fn parse_concat(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_additive(stream)?;
        while matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::Concat)) {
            let pos = stream.pos();
            stream.next();
            self.parse_additive(stream)?;
            self.program.push(OpCode::Concat, pos);
        }
        Ok(())
    }

    fn parse_additive(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_multiplicative(stream)?;
        loop {
            let op = match stream.peek().map(|t| &t.kind) {
                Some(TokenKind::Plus) => OpCode::Add,
                Some(TokenKind::Minus) => OpCode::Sub,
                _ => return Ok(()),
            };
            let pos = stream.pos();
            stream.next();
            self.parse_multiplicative(stream)?;
            self.program.push(op, pos);
        }
    }

    fn parse_multiplicative(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        self.parse_unary(stream)?;
        loop {
            let op = match stream.peek().map(|t| &t.kind) {
                Some(TokenKind::Star) => OpCode::Mul,
                Some(TokenKind::Slash) => OpCode::Div,
                Some(TokenKind::Percent) => OpCode::Mod,
                _ => return Ok(()),
            };
            let pos = stream.pos();
            stream.next();
            self.parse_unary(stream)?;
            self.program.push(op, pos);
        }
    }

    fn parse_unary(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        let op = match stream.peek().map(|t| &t.kind) {
            Some(TokenKind::Minus) => Some(OpCode::Minus),
            Some(TokenKind::Not) => Some(OpCode::Not),
            Some(TokenKind::BitNot) => Some(OpCode::BitNot),
            Some(TokenKind::Plus) => None,
            _ => return self.parse_primary(stream),
        };
        let pos = stream.pos();
        stream.next();
        self.parse_unary(stream)?;
        if let Some(op) = op {
            self.program.push(op, pos);
        }
        Ok(())
    }

    fn parse_primary(&mut self, stream: &mut TokenStream<'_>) -> PResult<()> {
        let Some(token) = stream.next() else {
            let pos = stream.start.clone();
            return Err(self.syntax_error(pos, "Unexpected end of expression"));
        };
        match token.kind {
            TokenKind::Integral(i) => {
                self.push_const(Constant::Integral(i), &token.pos);
                Ok(())
            }
            TokenKind::Real(r) => {
                self.push_const(Constant::Real(r), &token.pos);
                Ok(())
            }
            TokenKind::Str(s) => {
                self.push_const(Constant::Str(s), &token.pos);
                Ok(())
            }
            TokenKind::LParen => {
                self.parse_expr(stream)?;
                match stream.next() {
                    Some(Token2 {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(()),
                    other => {
                        let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                        Err(self.syntax_error(pos, "Expected ')'"))
                    }
                }
            }
            TokenKind::Kw(Keyword::Case) => self.parse_case(stream, &token.pos),
            TokenKind::Ident(name) => {
                if matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
                    stream.next();
                    self.parse_call(stream, name, &token.pos)
                } else {
                    let (_, path) = self.parse_path(stream, Some(name))?;
                    self.emit_variable(false, &path, &token.pos)
                }
            }
            TokenKind::Dot => {
                // re-assemble the rooted path; the dot was consumed
                match stream.next() {
                    Some(Token2 {
                        kind: TokenKind::Ident(name),
                        ..
                    }) => {
                        let (_, path) = self.parse_path(stream, Some(name))?;
                        self.emit_variable(true, &path, &token.pos)
                    }
                    other => {
                        let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                        Err(self.syntax_error(pos, "Expected name after '.'"))
                    }
                }
            }
            other => Err(self.syntax_error(
                token.pos,
                format!("Unexpected token {:?} in expression", other),
            )),
        }
    }

    /// Emit the lookup for a (possibly dotted, possibly rooted) name,
    /// including the `_this` / `_count` / `_index` / `_first` / `_last` /
    /// `_inner` specials.
    fn emit_variable(&mut self, rooted: bool, path: &[String], pos: &Position) -> PResult<()> {
        let this_ident = |parser: &mut Self| {
            parser.program.add_identifier(Identifier {
                name: String::new(),
                context: parser.cur_context(),
                depth: parser.cur_depth(),
            })
        };

        if !rooted && path.len() == 1 {
            match path[0].as_str() {
                "_this" => {
                    self.program.push(OpCode::PushFrag, pos.clone());
                }
                "_count" => {
                    let ident = this_ident(self);
                    self.program
                        .push(OpCode::PushFragCount { ident }, pos.clone());
                }
                "_index" => {
                    self.program.push(OpCode::PushThisFragIndex, pos.clone());
                }
                "_first" => {
                    self.program.push(OpCode::PushThisFragIndex, pos.clone());
                    self.push_const(Constant::Integral(0), pos);
                    self.program.push(OpCode::Eq, pos.clone());
                }
                "_last" => {
                    self.program.push(OpCode::PushThisFragIndex, pos.clone());
                    self.push_const(Constant::Integral(1), pos);
                    self.program.push(OpCode::Add, pos.clone());
                    let ident = this_ident(self);
                    self.program
                        .push(OpCode::PushFragCount { ident }, pos.clone());
                    self.program.push(OpCode::Eq, pos.clone());
                }
                "_inner" => {
                    // neither first nor last
                    self.program.push(OpCode::PushThisFragIndex, pos.clone());
                    self.push_const(Constant::Integral(0), pos);
                    self.program.push(OpCode::Gt, pos.clone());
                    self.program.push(OpCode::PushThisFragIndex, pos.clone());
                    self.push_const(Constant::Integral(1), pos);
                    self.program.push(OpCode::Add, pos.clone());
                    let ident = this_ident(self);
                    self.program
                        .push(OpCode::PushFragCount { ident }, pos.clone());
                    self.program.push(OpCode::Lt, pos.clone());
                    self.program.push(OpCode::BitAnd, pos.clone());
                }
                _ => {
                    let ident = Identifier {
                        name: path[0].clone(),
                        context: self.cur_context(),
                        depth: self.cur_depth(),
                    };
                    let index = self.program.add_identifier(ident);
                    self.program
                        .push(OpCode::PushVar { ident: index }, pos.clone());
                }
            }
            return Ok(());
        }

        if !rooted && path.len() == 2 && (path[1] == "_count" || path[1] == "_index") {
            // for an open fragment the name addresses its frame, otherwise
            // the sub-fragment of the current one
            let open_depth = self
                .open_frags()
                .iter()
                .rposition(|name| *name == path[0])
                .map(|at| (at + 1) as u16);
            let (name, depth) = match open_depth {
                Some(depth) => (String::new(), depth),
                None => (path[0].clone(), self.cur_depth()),
            };
            if path[1] == "_index" {
                let Some(depth) = open_depth else {
                    return Err(self.syntax_error(
                        pos.clone(),
                        format!("'{}' is not an open fragment", path[0]),
                    ));
                };
                let index = self.program.add_identifier(Identifier {
                    name: path[0].clone(),
                    context: self.cur_context(),
                    depth,
                });
                self.program
                    .push(OpCode::PushFragIndex { ident: index }, pos.clone());
            } else {
                let index = self.program.add_identifier(Identifier {
                    name,
                    context: self.cur_context(),
                    depth,
                });
                self.program
                    .push(OpCode::PushFragCount { ident: index }, pos.clone());
            }
            return Ok(());
        }

        if rooted {
            match self.resolve_variable(true, path, pos) {
                Ok(ident) => {
                    let index = self.program.add_identifier(ident);
                    self.program
                        .push(OpCode::PushVar { ident: index }, pos.clone());
                }
                Err(Abort) => {
                    // already reported; degrade to undefined
                    self.push_const(Constant::Undefined, pos);
                }
            }
            return Ok(());
        }

        // relative dotted path: attribute access from the current fragment
        self.program.push(OpCode::PushFrag, pos.clone());
        for segment in path {
            self.program.push(
                OpCode::PushAttr {
                    name: segment.clone(),
                },
                pos.clone(),
            );
        }
        Ok(())
    }

    fn parse_call(
        &mut self,
        stream: &mut TokenStream<'_>,
        name: &str,
        pos: &Position,
    ) -> PResult<()> {
        if name == "defined" || name == "exists" {
            let (rooted, path) = self.parse_path(stream, None)?;
            let ident = if rooted {
                self.resolve_variable(true, &path, pos)?
            } else if path.len() == 1 {
                Identifier {
                    name: path[0].clone(),
                    context: self.cur_context(),
                    depth: self.cur_depth(),
                }
            } else {
                return Err(self.syntax_error(
                    pos.clone(),
                    format!("{}() expects a plain or rooted name", name),
                ));
            };
            match stream.next() {
                Some(Token2 {
                    kind: TokenKind::RParen,
                    ..
                }) => {}
                other => {
                    let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                    return Err(self.syntax_error(pos, "Expected ')'"));
                }
            }
            let index = self.program.add_identifier(ident);
            let op = if name == "defined" {
                OpCode::Defined { ident: index }
            } else {
                OpCode::Exists { ident: index }
            };
            self.program.push(op, pos.clone());
            return Ok(());
        }

        let mut argc = 0;
        if matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::RParen)) {
            stream.next();
        } else {
            loop {
                self.parse_expr(stream)?;
                argc += 1;
                match stream.next() {
                    Some(Token2 {
                        kind: TokenKind::Comma,
                        ..
                    }) => {}
                    Some(Token2 {
                        kind: TokenKind::RParen,
                        ..
                    }) => break,
                    other => {
                        let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                        return Err(self.syntax_error(pos, "Expected ',' or ')'"));
                    }
                }
            }
        }
        self.program.push(
            OpCode::Func {
                name: name.to_string(),
                argc,
            },
            pos.clone(),
        );
        Ok(())
    }

    /// `case(selector, l1, l2: result, *: default)`. The selector's
    /// instructions are captured and re-emitted for each label comparison.
    fn parse_case(&mut self, stream: &mut TokenStream<'_>, pos: &Position) -> PResult<()> {
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::LParen,
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected '(' after case"));
            }
        }
        let start = self.program.len();
        self.parse_expr(stream)?;
        let selector = self.program.split_off(start);
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Comma,
                ..
            }) => {}
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                return Err(self.syntax_error(pos, "Expected ',' after case selector"));
            }
        }

        let mut pending_end = Vec::new();
        loop {
            if matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::Star)) {
                // default arm, must be last
                stream.next();
                match stream.next() {
                    Some(Token2 {
                        kind: TokenKind::Colon,
                        ..
                    }) => {}
                    other => {
                        let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                        return Err(self.syntax_error(pos, "Expected ':' after '*'"));
                    }
                }
                self.parse_expr(stream)?;
                match stream.next() {
                    Some(Token2 {
                        kind: TokenKind::RParen,
                        ..
                    }) => {}
                    other => {
                        let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                        return Err(self.syntax_error(pos, "Expected ')' after default arm"));
                    }
                }
                break;
            }

            // collect the labels of this arm
            let mut into_body = Vec::new();
            loop {
                let label = self.parse_case_label(stream)?;
                self.program.append(&selector);
                self.push_const(label, pos);
                self.program.push(OpCode::Eq, pos.clone());
                into_body.push(
                    self.program
                        .push(OpCode::JmpIfTrue { target: usize::MAX }, pos.clone()),
                );
                match stream.next() {
                    Some(Token2 {
                        kind: TokenKind::Comma,
                        ..
                    }) => {}
                    Some(Token2 {
                        kind: TokenKind::Colon,
                        ..
                    }) => break,
                    other => {
                        let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                        return Err(self.syntax_error(pos, "Expected ',' or ':' after case label"));
                    }
                }
            }
            let skip_arm = self
                .program
                .push(OpCode::Jmp { target: usize::MAX }, pos.clone());
            let here = self.program.len();
            for addr in into_body {
                self.program.patch_jump(addr, here);
            }
            self.parse_expr(stream)?;
            pending_end.push(
                self.program
                    .push(OpCode::Jmp { target: usize::MAX }, pos.clone()),
            );
            let here = self.program.len();
            self.program.patch_jump(skip_arm, here);

            match stream.next() {
                Some(Token2 {
                    kind: TokenKind::Comma,
                    ..
                }) => {}
                Some(Token2 {
                    kind: TokenKind::RParen,
                    ..
                }) => {
                    // no arm matched and there is no default
                    self.push_const(Constant::Undefined, pos);
                    break;
                }
                other => {
                    let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                    return Err(self.syntax_error(pos, "Expected ',' or ')' after case arm"));
                }
            }
        }
        let here = self.program.len();
        for addr in pending_end {
            self.program.patch_jump(addr, here);
        }
        Ok(())
    }

    fn parse_case_label(&mut self, stream: &mut TokenStream<'_>) -> PResult<Constant> {
        let negative = if matches!(stream.peek().map(|t| &t.kind), Some(TokenKind::Minus)) {
            stream.next();
            true
        } else {
            false
        };
        match stream.next() {
            Some(Token2 {
                kind: TokenKind::Integral(i),
                ..
            }) => Ok(Constant::Integral(if negative { -i } else { i })),
            Some(Token2 {
                kind: TokenKind::Real(r),
                ..
            }) => Ok(Constant::Real(if negative { -r } else { r })),
            Some(Token2 {
                kind: TokenKind::Str(s),
                pos,
            }) => {
                if negative {
                    return Err(self.syntax_error(pos, "Cannot negate a string label"));
                }
                Ok(Constant::Str(s))
            }
            other => {
                let pos = other.map_or_else(|| stream.start.clone(), |t| t.pos);
                Err(self.syntax_error(pos, "Expected literal case label"))
            }
        }
    }
}
