use std::{cell::Cell, fmt::Display, fs::File, path::Path, path::PathBuf};

use compact_str::format_compact;

use crate::{
    diagnostics::{self, WarningKind},
    fstack::Fstack,
    symbols::Symbols,
    Options,
};

pub mod lexer;
pub mod parser;
pub mod tokens;

use lexer::LexerState;
use tokens::Token;

/// What the driver reports back once a translation unit has been read.
#[derive(Debug)]
pub struct ParseResult {
    pub failed_on_missing_include: bool,
    pub dependencies: Vec<PathBuf>,
    pub missing_includes: Vec<PathBuf>,
}

/// Parses one translation unit (`-` is standard input).
pub fn parse_file(
    path: &Path,
    symbols: &mut Symbols,
    nb_errors_left: &Cell<usize>,
    options: &Options,
) -> ParseResult {
    let mut fstack = Fstack::new();
    if path == Path::new("-") {
        fstack.push_main(LexerState::from_stdin());
    } else {
        let state = match File::open(path)
            .and_then(|file| LexerState::from_file(format_compact!("{}", path.display()), file))
        {
            Ok(state) => state,
            Err(err) => diagnostics::fatal(
                None,
                format_args!("Failed to open \"{}\": {err}", path.display()),
            ),
        };
        fstack.record_dependency(path.to_owned());
        fstack.push_main(state);
    }

    let mut ctx = ParseCtx::new(fstack, symbols, nb_errors_left, options);
    if let Some(preinclude) = &options.preinclude {
        parser::run_include(&mut ctx, preinclude, None);
    }
    parser::parse_all(&mut ctx);

    let (dependencies, missing_includes) = ctx.fstack.dependencies();
    ParseResult {
        failed_on_missing_include: ctx.fstack.failed_on_missing_include(),
        dependencies: dependencies.to_vec(),
        missing_includes: missing_includes.to_vec(),
    }
}

/// The statement driver's working set: the file stack plus every collaborator
/// the lexer consults, and one token of pushback for the expression parser.
pub struct ParseCtx<'a> {
    pub fstack: Fstack,
    pub symbols: &'a mut Symbols,
    pub nb_errors_left: &'a Cell<usize>,
    pub options: &'a Options,
    peeked: Option<Token>,
    /// Set when parsing should wind down early (`-MG` missing include).
    pub stop: bool,
}

impl<'a> ParseCtx<'a> {
    pub fn new(
        fstack: Fstack,
        symbols: &'a mut Symbols,
        nb_errors_left: &'a Cell<usize>,
        options: &'a Options,
    ) -> Self {
        Self {
            fstack,
            symbols,
            nb_errors_left,
            options,
            peeked: None,
            stop: false,
        }
    }

    pub fn next_token(&mut self) -> Token {
        match self.peeked.take() {
            Some(token) => token,
            None => lexer::next_token(
                &mut self.fstack,
                self.symbols,
                self.nb_errors_left,
                self.options,
            ),
        }
    }

    /// Reads a token with string-equate expansion off, for contexts that name a
    /// symbol rather than use it (`def`, `purge`, `macro`, `DEF()`).
    pub fn next_token_no_equs(&mut self) -> Token {
        debug_assert!(self.peeked.is_none(), "Token already lexed with expansion on");
        self.fstack.active_state_mut().expand_strings = false;
        let token = self.next_token();
        self.fstack.active_state_mut().expand_strings = true;
        token
    }

    pub fn peek_token(&mut self) -> &Token {
        if self.peeked.is_none() {
            self.peeked = Some(lexer::next_token(
                &mut self.fstack,
                self.symbols,
                self.nb_errors_left,
                self.options,
            ));
        }
        self.peeked.as_ref().unwrap()
    }

    pub fn unget(&mut self, token: Token) {
        debug_assert!(self.peeked.is_none(), "Two tokens pushed back");
        self.peeked = Some(token);
    }

    pub fn error<M: Display>(&self, msg: M) {
        diagnostics::error(
            Some(&self.fstack.location()),
            msg,
            self.nb_errors_left,
            self.options,
        );
    }

    pub fn warn<M: Display>(&self, id: WarningKind, msg: M) {
        diagnostics::warn(
            id,
            Some(&self.fstack.location()),
            msg,
            self.nb_errors_left,
            self.options,
        );
    }
}
