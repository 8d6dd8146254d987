//! The innermost part of the language's processing.
//!
//! This lexer is unusual because of the language's design. In particular, macro
//! arguments (`\1` etc.) and interpolation (`{DUCK}`) work at a textual level;
//! this is enforced by their semantics, particularly the implicit token pasting.
//!
//! Handling them in the individual token functions would duplicate that handling
//! all over the place, so they are instead handled at the lowest level, in
//! [`peek`]/[`shift`], transparently to the rest of the lexer. The substituted
//! text of a macro argument is "painted blue": [`LexerState::macro_arg_scan_distance`]
//! counts how many upcoming bytes must not be scanned for another introducer, so
//! arguments cannot expand recursively.

use std::{cell::Cell, fmt::Display, io::Read, rc::Rc};

use compact_str::{format_compact, CompactString};
use unicase::UniCase;

use crate::{
    cond::IfFrame,
    diagnostics::{self, Location, WarningKind},
    fstack::Fstack,
    macro_args::MacroArgs,
    sources::{BufferedContent, Content, ContentSpan, ViewedContent},
    symbols::Symbols,
    Options,
};

use super::tokens::{tok, Token, KEYWORDS};

/// Which top-level recogniser runs on the next token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Splitting unparsed macro arguments on commas.
    Raw,
    SkipToElif,
    SkipToEndc,
    SkipToEndr,
}

/// Substituted text layered on top of the source; reads see it first.
#[derive(Debug)]
struct Expansion {
    /// Present for interpolations and string equates; absent for macro args.
    name: Option<Rc<str>>,
    contents: Rc<str>,
    offset: usize,
}

impl Expansion {
    /// Returns `true` when advancing moved past the end of the contents.
    fn advance(&mut self) -> bool {
        debug_assert!(self.offset <= self.contents.len());
        self.offset += 1;
        self.offset > self.contents.len()
    }
}

/// All lexing state of one source context. One of these lives in each file-stack
/// context; the file stack decides which one is active.
#[derive(Debug)]
pub struct LexerState {
    pub path: CompactString,
    pub content: Content,
    pub mode: Mode,
    pub at_line_start: bool,
    last_token_was_eol: bool,
    /// Pending token, used to retroactively lex the `]]` after its synthetic
    /// end of line.
    next_token: Option<Token>,
    pub if_stack: Vec<IfFrame>,
    expansions: Vec<Expansion>,
    disable_macro_args: bool,
    disable_interpolation: bool,
    /// Bytes that have already been scanned for macro args ("blue paint").
    macro_arg_scan_distance: usize,
    /// Whether string equates expand when their name is lexed.
    pub expand_strings: bool,
    capturing: bool,
    capture_buf: Option<Vec<u8>>,
    capture_size: usize,
    /// 1-based; incremented when a token is requested at a line start.
    pub line_no: u32,
}

impl LexerState {
    fn new(path: CompactString, content: Content) -> Self {
        Self {
            path,
            content,
            mode: Mode::Normal,
            at_line_start: true,
            last_token_was_eol: false,
            next_token: None,
            if_stack: vec![],
            expansions: vec![],
            disable_macro_args: false,
            disable_interpolation: false,
            macro_arg_scan_distance: 0,
            expand_strings: true,
            capturing: false,
            capture_buf: None,
            capture_size: 0,
            line_no: 0,
        }
    }

    pub fn from_file(path: CompactString, file: std::fs::File) -> std::io::Result<Self> {
        Ok(Self::new(path, Content::from_file(file)?))
    }

    pub fn from_stdin() -> Self {
        Self::new("<stdin>".into(), Content::from_stdin())
    }

    pub fn from_reader(path: CompactString, reader: Box<dyn Read>) -> Self {
        Self::new(path, Content::Buffered(BufferedContent::new(reader)))
    }

    pub fn from_view(path: &str, span: ContentSpan, line_no: u32) -> Self {
        let mut state = Self::new(path.into(), Content::Viewed(ViewedContent::new(span)));
        state.line_no = line_no;
        state
    }

    /// Rewinds a view-backed context for another loop iteration.
    pub fn restart_view(&mut self, line_no: u32) {
        if let Content::Viewed(view) = &mut self.content {
            view.offset = 0;
        }
        self.clear(line_no);
    }

    pub fn clear(&mut self, line_no: u32) {
        self.mode = Mode::Normal;
        self.at_line_start = true;
        self.last_token_was_eol = false;
        self.next_token = None;
        self.if_stack.clear();
        self.expansions.clear();
        self.disable_macro_args = false;
        self.disable_interpolation = false;
        self.macro_arg_scan_distance = 0;
        self.expand_strings = true;
        self.capturing = false;
        self.capture_buf = None;
        self.capture_size = 0;
        self.line_no = line_no;
    }

    pub fn location(&self) -> Location {
        Location {
            path: self.path.clone(),
            line_no: self.line_no,
        }
    }

    // The conditional stack.

    pub fn if_depth(&self) -> usize {
        self.if_stack.len()
    }

    pub fn inc_if_depth(&mut self) {
        self.if_stack.push(IfFrame::default());
    }

    pub fn dec_if_depth(&mut self) {
        if self.if_stack.pop().is_none() {
            diagnostics::fatal(
                Some(&self.location()),
                "Found ENDC outside of an IF construct",
            );
        }
    }

    pub fn ran_if_block(&self) -> bool {
        self.if_stack.last().is_some_and(|frame| frame.ran_if_block)
    }

    pub fn reached_else_block(&self) -> bool {
        self.if_stack
            .last()
            .is_some_and(|frame| frame.reached_else_block)
    }

    pub fn mark_ran_if(&mut self) {
        if let Some(frame) = self.if_stack.last_mut() {
            frame.ran_if_block = true;
        }
    }

    pub fn mark_reached_else(&mut self) {
        if let Some(frame) = self.if_stack.last_mut() {
            frame.reached_else_block = true;
        }
    }

    // Raw byte access, before any expansion processing.

    fn peek_char(&mut self) -> Option<u8> {
        // Expansions that have reached their end linger until the next shift;
        // skip over them.
        for exp in self.expansions.iter().rev() {
            if exp.offset < exp.contents.len() {
                return Some(exp.contents.as_bytes()[exp.offset]);
            }
        }
        self.content.peek(0, &self.path)
    }

    fn peek_char_ahead(&mut self) -> Option<u8> {
        // Only one byte of lookahead is ever needed, for macro-arg introducers.
        let mut distance = 1;
        for exp in self.expansions.iter().rev() {
            debug_assert!(exp.offset <= exp.contents.len());
            let idx = exp.offset + distance;
            if idx < exp.contents.len() {
                return Some(exp.contents.as_bytes()[idx]);
            }
            distance -= exp.contents.len() - exp.offset;
        }
        self.content.peek(distance, &self.path)
    }
}

/// Everything the lexer consults outside of its own state: the symbol table,
/// the active macro invocation, and the diagnostics plumbing.
pub struct LexEnv<'a> {
    pub symbols: &'a Symbols,
    pub macro_args: Option<Rc<MacroArgs>>,
    pub unique_id: Option<Rc<str>>,
    pub nb_errors_left: &'a Cell<usize>,
    pub options: &'a Options,
}

// Character classes.

pub fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t')
}

fn is_macro_char(c: u8) -> bool {
    matches!(c, b'@' | b'#' | b'<' | b'1'..=b'9')
}

pub fn starts_identifier(c: u8) -> bool {
    c.is_ascii_alphabetic() || matches!(c, b'_' | b'.' | b'@' | b'?' | b'$')
}

pub fn continues_identifier(c: u8) -> bool {
    starts_identifier(c) || c.is_ascii_digit()
}

fn print_char(c: Option<u8>) -> CompactString {
    match c {
        None => "end of input".into(),
        Some(c @ 0x20..=0x7E) => format_compact!("'{}'", c as char),
        Some(c) => format_compact!("0x{c:02X}"),
    }
}

fn lex_error<M: Display>(state: &LexerState, env: &LexEnv, msg: M) {
    diagnostics::error(
        Some(&state.location()),
        msg,
        env.nb_errors_left,
        env.options,
    );
}

fn lex_warn<M: Display>(state: &LexerState, env: &LexEnv, id: WarningKind, msg: M) {
    diagnostics::warn(
        id,
        Some(&state.location()),
        msg,
        env.nb_errors_left,
        env.options,
    );
}

fn disable_expansions(state: &mut LexerState) -> (bool, bool) {
    let saved = (state.disable_macro_args, state.disable_interpolation);
    state.disable_macro_args = true;
    state.disable_interpolation = true;
    saved
}

fn restore_expansions(state: &mut LexerState, (disable_macro_args, disable_interpolation): (bool, bool)) {
    state.disable_macro_args = disable_macro_args;
    state.disable_interpolation = disable_interpolation;
}

// The peek/shift primitive.

fn begin_expansion(state: &mut LexerState, contents: Rc<str>, name: Option<Rc<str>>, env: &LexEnv) {
    if name.is_some() {
        check_recursion_depth(state, env);
    }
    // Do not expand empty strings.
    if contents.is_empty() {
        return;
    }
    state.expansions.push(Expansion {
        name,
        contents,
        offset: 0,
    });
}

fn check_recursion_depth(state: &LexerState, env: &LexEnv) {
    let limit = env.options.runtime_opts.recursion_depth;
    if state.expansions.len() > limit + 1 {
        diagnostics::fatal(
            Some(&state.location()),
            format_args!("Recursion limit ({limit}) exceeded"),
        );
    }
}

/// Returns the next logical byte of the source, transparently descending into
/// expansions, and pushing new ones when a macro-arg introducer or an
/// interpolation is found. `None` is end of input.
fn peek(state: &mut LexerState, env: &mut LexEnv) -> Option<u8> {
    loop {
        let c = state.peek_char();

        if state.macro_arg_scan_distance > 0 {
            return c; // Painted-blue bytes are inert.
        }
        state.macro_arg_scan_distance += 1; // Do not consider this byte again.

        match c {
            Some(b'\\') if !state.disable_macro_args => {
                // Cover the introducer as well, so `\\1` cannot be processed as
                // a backslash and then macro arg 1.
                state.macro_arg_scan_distance += 1;
                if !state.peek_char_ahead().is_some_and(is_macro_char) {
                    return c;
                }

                shift(state);
                if let Some(arg) = read_macro_arg(state, env) {
                    let len = arg.len();
                    begin_expansion(state, arg, None, env);
                    // Mark the whole substituted text as scanned, so that macro
                    // args cannot be recursive.
                    state.macro_arg_scan_distance += len;
                }
                // Go again, reading from the new expansion.
            }

            Some(b'{') if !state.disable_interpolation => {
                shift(state);
                if let Some(text) = read_interpolation(state, env, 0) {
                    let name = Rc::clone(&text);
                    begin_expansion(state, text, Some(name), env);
                }
                // Go again, reading from the new expansion.
            }

            _ => return c,
        }
    }
}

/// Advances one byte, recording it if a capture is active.
fn shift(state: &mut LexerState) {
    if state.capturing {
        if let Some(c) = state.peek_char() {
            if let Some(buf) = &mut state.capture_buf {
                buf.push(c);
            }
        }
        state.capture_size += 1;
    }

    state.macro_arg_scan_distance = state.macro_arg_scan_distance.saturating_sub(1);

    loop {
        if let Some(exp) = state.expansions.last_mut() {
            if exp.advance() {
                // Advancing would go past the expansion's end; drop it and
                // advance its parent instead.
                state.expansions.pop();
                continue;
            }
        } else {
            state.content.advance();
        }
        return;
    }
}

fn bump_char(state: &mut LexerState, env: &mut LexEnv) -> Option<u8> {
    let c = peek(state, env);
    if c.is_some() {
        shift(state);
    }
    c
}

fn next_char(state: &mut LexerState, env: &mut LexEnv) -> Option<u8> {
    shift(state);
    peek(state, env)
}

/// A CR directly followed by a LF is a single line terminator; eat the LF.
fn handle_crlf(state: &mut LexerState, env: &mut LexEnv, c: u8) {
    if c == b'\r' && peek(state, env) == Some(b'\n') {
        shift(state);
    }
}

// Macro argument resolution.

fn read_macro_arg(state: &mut LexerState, env: &mut LexEnv) -> Option<Rc<str>> {
    match bump_char(state, env) {
        Some(b'@') => match &env.unique_id {
            Some(unique_id) => Some(Rc::clone(unique_id)),
            None => {
                lex_error(
                    state,
                    env,
                    "'\\@' cannot be used outside of a macro or REPT/FOR block",
                );
                None
            }
        },

        Some(b'#') => match &env.macro_args {
            Some(args) => Some(args.combined_args()),
            None => {
                lex_error(state, env, "'\\#' cannot be used outside of a macro");
                None
            }
        },

        Some(b'<') => {
            let num = read_bracketed_macro_arg_num(state, env)?;
            if num == 0 {
                // The error was already reported.
                return None;
            }
            let Some(args) = &env.macro_args else {
                lex_error(
                    state,
                    env,
                    format_args!("'\\<{num}>' cannot be used outside of a macro"),
                );
                return None;
            };
            match usize::try_from(num).ok().and_then(|idx| args.arg(idx)) {
                Some(arg) => Some(arg),
                None => {
                    lex_error(
                        state,
                        env,
                        format_args!("Macro argument '\\<{num}>' not defined"),
                    );
                    None
                }
            }
        }

        Some(c @ b'1'..=b'9') => {
            let Some(args) = &env.macro_args else {
                lex_error(
                    state,
                    env,
                    format_args!("'\\{}' cannot be used outside of a macro", c as char),
                );
                return None;
            };
            match args.arg((c - b'0') as usize) {
                Some(arg) => Some(arg),
                None => {
                    lex_error(
                        state,
                        env,
                        format_args!("Macro argument '\\{}' not defined", c as char),
                    );
                    None
                }
            }
        }

        c => unreachable!("read_macro_arg called on non-introducer {:?}", c),
    }
}

/// Reads the `…>` part of a `\<…>` bracketed macro argument.
///
/// Returns `None` if an error was reported; `Some(0)` means a symbol error was
/// reported and the reference should silently expand to nothing.
fn read_bracketed_macro_arg_num(state: &mut LexerState, env: &mut LexEnv) -> Option<i32> {
    // Inside the brackets, expansions are re-enabled, so that the index may
    // itself come from a macro arg or an interpolation.
    let saved = (state.disable_macro_args, state.disable_interpolation);
    state.disable_macro_args = false;
    state.disable_interpolation = false;
    let res = bracketed_num_inner(state, env);
    restore_expansions(state, saved);
    res
}

fn bracketed_num_inner(state: &mut LexerState, env: &mut LexEnv) -> Option<i32> {
    let mut c = peek(state, env);
    let negative = c == Some(b'-');
    if negative {
        c = next_char(state, env);
    }

    let mut num = 0i32;
    let mut empty = false;
    let mut symbol_error = false;

    match c {
        Some(digit @ b'0'..=b'9') => {
            shift(state);
            let n = read_decimal_number(state, env, u32::from(digit - b'0'));
            if n > i32::MAX as u32 {
                lex_error(state, env, "Number in bracketed macro argument is too large");
                return None;
            }
            num = if negative { -(n as i32) } else { n as i32 };
        }
        Some(first) if starts_identifier(first) || first == b'#' => {
            let mut c = c;
            if first == b'#' {
                c = next_char(state, env);
                if !c.is_some_and(starts_identifier) {
                    lex_error(state, env, "Empty raw symbol in bracketed macro argument");
                    return None;
                }
            }
            let mut sym_name = CompactString::default();
            while let Some(ch) = c.filter(|&ch| continues_identifier(ch)) {
                sym_name.push(ch as char);
                c = next_char(state, env);
            }

            match env.symbols.find_valid(&sym_name) {
                None => {
                    if env.symbols.is_purged(&sym_name) {
                        lex_error(
                            state,
                            env,
                            format_args!(
                                "Bracketed symbol \"{sym_name}\" does not exist; it was purged"
                            ),
                        );
                    } else {
                        lex_error(
                            state,
                            env,
                            format_args!("Bracketed symbol \"{sym_name}\" does not exist"),
                        );
                    }
                    symbol_error = true;
                }
                Some(sym) => match sym.get_number(env.macro_args.as_deref()) {
                    None => {
                        lex_error(
                            state,
                            env,
                            format_args!("Bracketed symbol \"{sym_name}\" is not numeric"),
                        );
                        symbol_error = true;
                    }
                    Some(value) => num = value,
                },
            }
        }
        _ => empty = true,
    }

    let c = bump_char(state, env);
    if c != Some(b'>') {
        lex_error(
            state,
            env,
            format_args!("Invalid character in bracketed macro argument {}", print_char(c)),
        );
        None
    } else if empty {
        lex_error(state, env, "Empty bracketed macro argument");
        None
    } else if num == 0 && !symbol_error {
        lex_error(state, env, "Invalid bracketed macro argument '\\<0>'");
        None
    } else {
        Some(num)
    }
}

// Symbol interpolation.

fn read_interpolation(state: &mut LexerState, env: &mut LexEnv, depth: usize) -> Option<Rc<str>> {
    let limit = env.options.runtime_opts.recursion_depth;
    if depth > limit {
        diagnostics::fatal(
            Some(&state.location()),
            format_args!("Recursion limit ({limit}) exceeded"),
        );
    }

    let mut fmt_buf: Vec<u8> = vec![];
    let mut fmt: Option<crate::format::FormatSpec> = None;

    // `peek` must not process nested interpolations: they are handled right
    // here, bumping `depth` each time, which bounds the recursion.
    let saved = state.disable_interpolation;
    state.disable_interpolation = true;

    loop {
        match peek(state, env) {
            Some(b'{') => {
                // Nested interpolation.
                shift(state);
                if let Some(text) = read_interpolation(state, env, depth + 1) {
                    let name = Rc::clone(&text);
                    begin_expansion(state, text, Some(name), env);
                }
                // Go again, reading from the new expansion.
            }
            None | Some(b'\r' | b'\n' | b'"') => {
                lex_error(state, env, "Missing }");
                break;
            }
            Some(b'}') => {
                shift(state);
                break;
            }
            Some(b':') if fmt.is_none() => {
                // Format spec, only once.
                shift(state);
                let spec_src = String::from_utf8_lossy(&fmt_buf);
                match crate::format::FormatSpec::parse(&spec_src) {
                    Ok(spec) => fmt = Some(spec),
                    Err(err) => {
                        lex_error(
                            state,
                            env,
                            format_args!("Invalid format spec '{spec_src}': {err}"),
                        );
                        fmt = Some(Default::default());
                    }
                }
                fmt_buf.clear(); // The symbol name starts after the ':'.
            }
            Some(c) => {
                shift(state);
                fmt_buf.push(c);
            }
        }
    }

    state.disable_interpolation = saved;

    let name_buf = String::from_utf8_lossy(&fmt_buf);
    // A leading '#' bypasses the keyword check.
    let (raw, name) = match name_buf.strip_prefix('#') {
        Some(rest) => (true, rest),
        None => (false, name_buf.as_ref()),
    };
    if !raw && KEYWORDS.get(&UniCase::ascii(name)).is_some() {
        lex_error(
            state,
            env,
            format_args!(
                "Interpolated symbol \"{name}\" is a reserved keyword; add a '#' prefix to use it as a raw symbol"
            ),
        );
        return None;
    }

    let fmt = fmt.unwrap_or_default();
    let mut buf = CompactString::default();
    let res = match env.symbols.find_valid(name) {
        None => {
            if env.symbols.is_purged(name) {
                lex_error(
                    state,
                    env,
                    format_args!("Interpolated symbol \"{name}\" does not exist; it was purged"),
                );
            } else {
                lex_error(
                    state,
                    env,
                    format_args!("Interpolated symbol \"{name}\" does not exist"),
                );
            }
            return None;
        }
        Some(sym) => {
            if let Some(contents) = sym.get_string() {
                fmt.write_str(&contents, &mut buf)
            } else if let Some(value) = sym.get_number(env.macro_args.as_deref()) {
                fmt.write_number(
                    value as u32,
                    env.options.runtime_opts.q_precision,
                    &mut buf,
                )
            } else {
                lex_error(
                    state,
                    env,
                    format_args!(
                        "Interpolated symbol \"{name}\" is not a numeric or string symbol"
                    ),
                );
                return None;
            }
        }
    };
    if let Err(err) = res {
        lex_error(state, env, format_args!("Cannot format \"{name}\": {err}"));
        return None;
    }
    Some(buf.as_str().into())
}

// Functions to discard non-tokenized characters.

fn discard_comment(state: &mut LexerState, env: &mut LexEnv) {
    let saved = disable_expansions(state);
    loop {
        match peek(state, env) {
            None | Some(b'\r' | b'\n') => break,
            _ => shift(state),
        }
    }
    restore_expansions(state, saved);
}

fn discard_block_comment(state: &mut LexerState, env: &mut LexEnv) {
    let saved = disable_expansions(state);
    loop {
        match bump_char(state, env) {
            None => diagnostics::fatal(Some(&state.location()), "Unterminated block comment"),
            Some(c @ (b'\r' | b'\n')) => {
                if c == b'\r' {
                    handle_crlf(state, env, c);
                }
                if state.expansions.is_empty() {
                    state.line_no += 1;
                }
            }
            Some(b'/') => {
                if peek(state, env) == Some(b'*') {
                    lex_warn(state, env, WarningKind::NestedComment, "/* in block comment");
                }
            }
            Some(b'*') => {
                if peek(state, env) == Some(b'/') {
                    shift(state);
                    break;
                }
            }
            _ => {}
        }
    }
    restore_expansions(state, saved);
}

fn discard_line_continuation(state: &mut LexerState, env: &mut LexEnv) {
    loop {
        match peek(state, env) {
            Some(c) if is_whitespace(c) => shift(state),
            Some(c @ (b'\r' | b'\n')) => {
                shift(state);
                handle_crlf(state, env, c);
                if state.expansions.is_empty() {
                    state.line_no += 1;
                }
                break;
            }
            Some(b';') => discard_comment(state, env),
            None => {
                lex_error(state, env, "Invalid line continuation at end of file");
                break;
            }
            c => {
                lex_error(
                    state,
                    env,
                    format_args!("Invalid character after line continuation {}", print_char(c)),
                );
                break;
            }
        }
    }
}

// Number readers.

fn read_decimal_number(state: &mut LexerState, env: &mut LexEnv, initial: u32) -> u32 {
    let mut value = initial;
    loop {
        match peek(state, env) {
            Some(b'_') => shift(state),
            Some(c @ b'0'..=b'9') => {
                let digit = u32::from(c - b'0');
                if value > (u32::MAX - digit) / 10 {
                    lex_warn(
                        state,
                        env,
                        WarningKind::LargeConstant,
                        "Integer constant is too large",
                    );
                }
                value = value.wrapping_mul(10).wrapping_add(digit);
                shift(state);
            }
            _ => break value,
        }
    }
}

fn read_hex_number(state: &mut LexerState, env: &mut LexEnv) -> u32 {
    let mut value = 0u32;
    let mut empty = true;
    loop {
        let digit = match peek(state, env) {
            Some(b'_') if !empty => {
                shift(state);
                continue;
            }
            Some(c) => match (c as char).to_digit(16) {
                Some(digit) => digit,
                None => break,
            },
            None => break,
        };
        if value > (u32::MAX - digit) / 16 {
            lex_warn(
                state,
                env,
                WarningKind::LargeConstant,
                "Integer constant is too large",
            );
        }
        value = value.wrapping_mul(16).wrapping_add(digit);
        empty = false;
        shift(state);
    }
    if empty {
        lex_error(state, env, "Invalid integer constant, no digits after '$'");
    }
    value
}

fn read_octal_number(state: &mut LexerState, env: &mut LexEnv) -> u32 {
    let mut value = 0u32;
    let mut empty = true;
    loop {
        let digit = match peek(state, env) {
            Some(b'_') if !empty => {
                shift(state);
                continue;
            }
            Some(c @ b'0'..=b'7') => u32::from(c - b'0'),
            _ => break,
        };
        if value > (u32::MAX - digit) / 8 {
            lex_warn(
                state,
                env,
                WarningKind::LargeConstant,
                "Integer constant is too large",
            );
        }
        value = value.wrapping_mul(8).wrapping_add(digit);
        empty = false;
        shift(state);
    }
    if empty {
        lex_error(state, env, "Invalid integer constant, no digits after '&'");
    }
    value
}

fn read_binary_number(state: &mut LexerState, env: &mut LexEnv) -> u32 {
    let digits = env.options.runtime_opts.binary_digits;
    let mut value = 0u32;
    let mut empty = true;
    loop {
        let bit = match peek(state, env) {
            Some(b'_') if !empty => {
                shift(state);
                continue;
            }
            Some(c) if c == b'0' || c == digits[0] => 0,
            Some(c) if c == b'1' || c == digits[1] => 1,
            _ => break,
        };
        if value > (u32::MAX - bit) / 2 {
            lex_warn(
                state,
                env,
                WarningKind::LargeConstant,
                "Integer constant is too large",
            );
        }
        value = value.wrapping_mul(2).wrapping_add(bit);
        empty = false;
        shift(state);
    }
    if empty {
        lex_error(state, env, "Invalid integer constant, no digits after '%'");
    }
    value
}

fn read_gfx_constant(state: &mut LexerState, env: &mut LexEnv) -> u32 {
    let digits = env.options.runtime_opts.gfx_digits;
    let mut bitplane_lower = 0u32;
    let mut bitplane_upper = 0u32;
    let mut width = 0u8;
    loop {
        let pixel: u32 = match peek(state, env) {
            Some(b'_') if width > 0 => {
                shift(state);
                continue;
            }
            Some(c) if c == b'0' || c == digits[0] => 0,
            Some(c) if c == b'1' || c == digits[1] => 1,
            Some(c) if c == b'2' || c == digits[2] => 2,
            Some(c) if c == b'3' || c == digits[3] => 3,
            _ => break,
        };
        if width < 8 {
            bitplane_lower = bitplane_lower << 1 | (pixel & 1);
            bitplane_upper = bitplane_upper << 1 | (pixel >> 1);
        }
        if width < 9 {
            width += 1;
        }
        shift(state);
    }

    if width == 0 {
        lex_error(state, env, "Invalid graphics constant, no digits after '`'");
    } else if width == 9 {
        lex_warn(
            state,
            env,
            WarningKind::LargeConstant,
            "Graphics constant is too long, only first 8 pixels considered",
        );
    }

    bitplane_upper << 8 | bitplane_lower
}

fn read_fractional_part(state: &mut LexerState, env: &mut LexEnv, integer: u32) -> u32 {
    #[derive(PartialEq, PartialOrd)]
    enum FracState {
        Digits,
        Precision,
        PrecisionDigits,
    }
    let mut value = 0u32;
    let mut divisor = 1u32;
    let mut precision = 0u8;
    let mut frac_state = FracState::Digits;

    loop {
        let c = peek(state, env);
        if frac_state == FracState::Digits {
            match c {
                Some(b'_') => shift(state),
                Some(b'q' | b'Q') => {
                    frac_state = FracState::Precision;
                    shift(state);
                }
                Some(c @ b'0'..=b'9') => {
                    let digit = u32::from(c - b'0');
                    if divisor > (u32::MAX - digit) / 10 {
                        lex_warn(
                            state,
                            env,
                            WarningKind::LargeConstant,
                            "Precision of fixed-point constant is too large",
                        );
                        // Discard any additional digits.
                        shift(state);
                        while matches!(peek(state, env), Some(b'0'..=b'9' | b'_')) {
                            shift(state);
                        }
                        break;
                    }
                    value = value * 10 + digit;
                    divisor *= 10;
                    shift(state);
                }
                _ => break,
            }
        } else {
            match c {
                Some(b'.') if frac_state == FracState::Precision => {
                    frac_state = FracState::PrecisionDigits;
                    shift(state);
                }
                Some(c @ b'0'..=b'9') => {
                    precision = precision.wrapping_mul(10).wrapping_add(c - b'0');
                    shift(state);
                }
                _ => break,
            }
        }
    }

    if precision == 0 {
        if frac_state > FracState::Digits {
            lex_error(
                state,
                env,
                "Invalid fixed-point constant, no significant digits after 'q'",
            );
        }
        precision = env.options.runtime_opts.q_precision;
    } else if precision > 31 {
        lex_error(
            state,
            env,
            "Fixed-point constant precision must be between 1 and 31",
        );
        precision = env.options.runtime_opts.q_precision;
    }

    if u64::from(integer) >= 1u64 << (32 - precision) {
        lex_warn(
            state,
            env,
            WarningKind::LargeConstant,
            "Magnitude of fixed-point constant is too large",
        );
    }

    let fractional =
        (f64::from(value) / f64::from(divisor) * f64::from(1u32 << precision)).round() as u32;
    (integer.wrapping_shl(u32::from(precision))) | fractional
}

// Identifiers and keywords.

fn read_identifier(state: &mut LexerState, env: &mut LexEnv, first_char: u8, raw: bool) -> Token {
    debug_assert!(starts_identifier(first_char));
    let mut identifier = CompactString::default();
    identifier.push(first_char as char);
    // A name containing a dot is a local label.
    let mut is_local = first_char == b'.';

    while let Some(c) = peek(state, env).filter(|&c| continues_identifier(c)) {
        shift(state);
        identifier.push(c as char);
        if c == b'.' {
            is_local = true;
        }
    }

    if !raw {
        // `LDIO` aliases `LDH`, but is not in the keyword table proper.
        if identifier.eq_ignore_ascii_case("LDIO") {
            lex_warn(
                state,
                env,
                WarningKind::Obsolete,
                "LDIO is deprecated; use LDH",
            );
            return tok!("ldh");
        }
        if let Some(keyword) = KEYWORDS.get(&UniCase::ascii(identifier.as_str())) {
            return keyword.clone();
        }
    }

    // Label scopes `.` and `..` are the only nonlocal identifiers made of dots.
    if identifier.bytes().all(|c| c == b'.') {
        is_local = false;
    }

    if is_local {
        tok!("local symbol"(identifier))
    } else {
        tok!("symbol"(identifier))
    }
}

fn read_anon_label_ref(state: &mut LexerState, env: &mut LexEnv, c: u8) -> Token {
    // The first sigil has been peeked, but not consumed.
    let mut n = 1;
    while next_char(state, env) == Some(c) {
        n += 1;
    }
    let mut name = CompactString::default();
    for _ in 0..n {
        name.push(c as char);
    }
    tok!("anonymous label reference"(name))
}

// String and character literals.

/// Appends expanded text to a literal; in raw mode, characters that would be
/// re-interpreted when the argument is lexed again get escaped.
fn append_expanded_string(state: &LexerState, dest: &mut Vec<u8>, expanded: &str) {
    if state.mode != Mode::Raw {
        dest.extend_from_slice(expanded.as_bytes());
        return;
    }
    for &c in expanded.as_bytes() {
        match c {
            b'\n' => dest.extend_from_slice(b"\\n"),
            b'\r' => dest.extend_from_slice(b"\\r"),
            b'\t' => dest.extend_from_slice(b"\\t"),
            0 => dest.extend_from_slice(b"\\0"),
            b'\\' | b'"' | b'\'' | b'{' => {
                dest.push(b'\\');
                dest.push(c);
            }
            _ => dest.push(c),
        }
    }
}

fn append_char_in_literal(state: &mut LexerState, env: &mut LexEnv, dest: &mut Vec<u8>, c: u8) {
    let raw_mode = state.mode == Mode::Raw;

    // Symbol interpolation.
    if c == b'{' {
        // Re-enable macro args for the interpolation body; interpolations
        // themselves are handled by `read_interpolation`.
        state.disable_macro_args = false;
        if let Some(interpolation) = read_interpolation(state, env, 0) {
            append_expanded_string(state, dest, &interpolation);
        }
        state.disable_macro_args = true;
        return;
    }

    // Regular characters just get copied.
    if c != b'\\' {
        dest.push(c);
        return;
    }

    match peek(state, env) {
        // Character escapes.
        Some(c @ (b'\\' | b'"' | b'\'' | b'{' | b'}')) => {
            if raw_mode {
                dest.push(b'\\');
            }
            dest.push(c);
            shift(state);
        }
        Some(b'n') => {
            dest.extend_from_slice(if raw_mode { b"\\n" } else { b"\n" });
            shift(state);
        }
        Some(b'r') => {
            dest.extend_from_slice(if raw_mode { b"\\r" } else { b"\r" });
            shift(state);
        }
        Some(b't') => {
            dest.extend_from_slice(if raw_mode { b"\\t" } else { b"\t" });
            shift(state);
        }
        Some(b'0') => {
            dest.extend_from_slice(if raw_mode { b"\\0" } else { b"\0" });
            shift(state);
        }

        // Line continuation.
        Some(b' ' | b'\t' | b'\r' | b'\n') => discard_line_continuation(state, env),

        // Macro args; these are not handled by `peek` inside literals.
        Some(c) if is_macro_char(c) => {
            if let Some(arg) = read_macro_arg(state, env) {
                append_expanded_string(state, dest, &arg);
            }
        }

        None => {
            lex_error(state, env, "Illegal character escape at end of input");
            dest.push(b'\\');
        }
        c => {
            lex_error(
                state,
                env,
                format_args!("Illegal character escape {}", print_char(c)),
            );
            dest.push(c.unwrap());
            shift(state);
        }
    }
}

/// Reads a string body; the opening quote (and `#`, if raw) must have been consumed.
fn read_string(state: &mut LexerState, env: &mut LexEnv, dest: &mut Vec<u8>, raw_string: bool) {
    let saved = disable_expansions(state);
    let raw_mode = state.mode == Mode::Raw;

    let mut multiline = false;
    if raw_mode {
        dest.push(b'"');
    }
    if peek(state, env) == Some(b'"') {
        if raw_mode {
            dest.push(b'"');
        }
        if next_char(state, env) != Some(b'"') {
            // `""` is an empty string.
            restore_expansions(state, saved);
            return;
        }
        // `"""` begins a multi-line string.
        shift(state);
        if raw_mode {
            dest.push(b'"');
        }
        multiline = true;
    }

    loop {
        let Some(c) = peek(state, env) else {
            lex_error(state, env, "Unterminated string");
            break;
        };
        // CR, LF, or EOF ends a single-line string early.
        if !multiline && matches!(c, b'\r' | b'\n') {
            lex_error(state, env, "Unterminated string");
            break;
        }

        // We're staying in the string, so the char can safely be consumed.
        shift(state);

        if matches!(c, b'\r' | b'\n') {
            handle_crlf(state, env, c);
            state.line_no += 1;
            dest.push(b'\n');
            continue;
        }

        if c != b'"' {
            // Raw strings keep escapes verbatim, but interpolations still apply.
            if raw_string && c != b'{' {
                dest.push(c);
            } else {
                append_char_in_literal(state, env, dest, c);
            }
            continue;
        }

        // Close the string if it's terminated.
        if !multiline {
            if raw_mode {
                dest.push(c);
            }
            break;
        }
        // Only `"""` ends a multi-line string.
        if peek(state, env) != Some(b'"') {
            dest.push(c);
            continue;
        }
        if next_char(state, env) != Some(b'"') {
            dest.extend_from_slice(b"\"\"");
            continue;
        }
        shift(state);
        if raw_mode {
            dest.extend_from_slice(b"\"\"\"");
        }
        break;
    }
    restore_expansions(state, saved);
}

/// Essentially a simplified [`read_string`], bounded by single quotes.
fn read_character(state: &mut LexerState, env: &mut LexEnv, dest: &mut Vec<u8>) {
    let saved = disable_expansions(state);
    let raw_mode = state.mode == Mode::Raw;

    if raw_mode {
        dest.push(b'\'');
    }
    loop {
        match peek(state, env) {
            None | Some(b'\r' | b'\n') => {
                lex_error(state, env, "Unterminated character");
                break;
            }
            Some(c @ b'\'') => {
                shift(state);
                if raw_mode {
                    dest.push(c);
                }
                break;
            }
            Some(c) => {
                shift(state);
                append_char_in_literal(state, env, dest, c);
            }
        }
    }
    restore_expansions(state, saved);
}

// The mode dispatcher.

/// Pulls the next token out of the active context, handling the pending context
/// switch and the per-mode recognisers.
pub fn next_token(
    fstack: &mut Fstack,
    symbols: &Symbols,
    nb_errors_left: &Cell<usize>,
    options: &Options,
) -> Token {
    // A context scheduled while mid-line only becomes active at a line boundary,
    // so that partially-lexed lines never straddle contexts.
    fstack.commit_scheduled_switch();

    let (state, macro_args, unique_id) = fstack.active_parts();
    // Newlines read within an expansion do not increase the line count.
    if state.at_line_start && state.expansions.is_empty() {
        state.line_no += 1;
    }
    let mut env = LexEnv {
        symbols,
        macro_args,
        unique_id,
        nb_errors_left,
        options,
    };

    let token = match state.mode {
        Mode::Normal => next_token_normal(state, &mut env),
        Mode::Raw => next_token_raw(state, &mut env),
        Mode::SkipToElif => skip_if_block(state, &mut env, false),
        Mode::SkipToEndc => skip_if_block(state, &mut env, true),
        Mode::SkipToEndr => skip_to_endr(state, &mut env),
    };

    // Captures end at their buffer's boundary no matter what.
    let token = if token == tok!("end of input") && !state.capturing {
        tok!("end of buffer")
    } else {
        token
    };
    state.last_token_was_eol = matches!(token, tok!("end of line") | tok!("end of buffer"));
    state.at_line_start = state.last_token_was_eol;
    token
}

fn next_token_normal(state: &mut LexerState, env: &mut LexEnv) -> Token {
    if let Some(token) = state.next_token.take() {
        return token;
    }

    'lexing: loop {
        let c = bump_char(state, env);
        match c {
            None => return tok!("end of input"),

            // Ignored: whitespace and comments.
            Some(b';') => {
                discard_comment(state, env);
                state.at_line_start = false;
            }
            Some(b' ' | b'\t') => state.at_line_start = false,

            // Unambiguous single-char tokens.
            Some(b'~') => return tok!("~"),
            Some(b'@') => return tok!("symbol"("@".into())),
            Some(b'(') => return tok!("("),
            Some(b')') => return tok!(")"),
            Some(b',') => return tok!(","),

            // 1- or 2-char tokens.
            Some(b'[') => {
                if peek(state, env) == Some(b'[') {
                    shift(state);
                    return tok!("[[");
                }
                return tok!("[");
            }
            Some(b']') => {
                if peek(state, env) == Some(b']') {
                    shift(state);
                    // `[[ fragment literals ]]` inject an end of line to close
                    // their contents even without a trailing newline;
                    // retroactively lex the `]]` after it.
                    state.next_token = Some(tok!("]]"));
                    return tok!("end of line");
                }
                return tok!("]");
            }
            Some(b'+') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("+=")
                    }
                    Some(b'+') => {
                        shift(state);
                        tok!("++")
                    }
                    _ => tok!("+"),
                }
            }
            Some(b'-') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("-=")
                    }
                    _ => tok!("-"),
                }
            }
            Some(b'*') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("*=")
                    }
                    Some(b'*') => {
                        shift(state);
                        tok!("**")
                    }
                    _ => tok!("*"),
                }
            }
            Some(b'/') => match peek(state, env) {
                Some(b'=') => {
                    shift(state);
                    return tok!("/=");
                }
                Some(b'*') => {
                    shift(state);
                    discard_block_comment(state, env);
                    state.at_line_start = false;
                }
                _ => return tok!("/"),
            },
            Some(b'|') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("|=")
                    }
                    Some(b'|') => {
                        shift(state);
                        tok!("||")
                    }
                    _ => tok!("|"),
                }
            }
            Some(b'^') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("^=")
                    }
                    _ => tok!("^"),
                }
            }
            Some(b'=') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("==")
                    }
                    _ => tok!("="),
                }
            }
            Some(b'!') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("!=")
                    }
                    _ => tok!("!"),
                }
            }

            // 1-, 2-, or 3-char tokens.
            Some(b'<') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("<=")
                    }
                    Some(b'<') => {
                        shift(state);
                        match peek(state, env) {
                            Some(b'=') => {
                                shift(state);
                                tok!("<<=")
                            }
                            _ => tok!("<<"),
                        }
                    }
                    _ => tok!("<"),
                }
            }
            Some(b'>') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!(">=")
                    }
                    Some(b'>') => {
                        shift(state);
                        match peek(state, env) {
                            Some(b'=') => {
                                shift(state);
                                tok!(">>=")
                            }
                            Some(b'>') => {
                                shift(state);
                                tok!(">>>")
                            }
                            _ => tok!(">>"),
                        }
                    }
                    _ => tok!(">"),
                }
            }
            Some(b':') => {
                return match peek(state, env) {
                    Some(b':') => {
                        shift(state);
                        tok!("::")
                    }
                    Some(c @ (b'+' | b'-')) => read_anon_label_ref(state, env, c),
                    _ => tok!(":"),
                }
            }

            // Numbers.
            Some(c @ b'0'..=b'9') => {
                if c == b'0' {
                    match peek(state, env) {
                        Some(b'x' | b'X') => {
                            shift(state);
                            return tok!("number"(read_hex_number(state, env)));
                        }
                        Some(b'o' | b'O') => {
                            shift(state);
                            return tok!("number"(read_octal_number(state, env)));
                        }
                        Some(b'b' | b'B') => {
                            shift(state);
                            return tok!("number"(read_binary_number(state, env)));
                        }
                        _ => {}
                    }
                }
                let mut value = read_decimal_number(state, env, u32::from(c - b'0'));
                if peek(state, env) == Some(b'.') {
                    shift(state);
                    value = read_fractional_part(state, env, value);
                }
                return tok!("number"(value));
            }
            Some(b'&') => {
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("&=")
                    }
                    Some(b'&') => {
                        shift(state);
                        tok!("&&")
                    }
                    Some(b'0'..=b'7') => tok!("number"(read_octal_number(state, env))),
                    _ => tok!("&"),
                }
            }
            Some(b'%') => {
                let digits = env.options.runtime_opts.binary_digits;
                return match peek(state, env) {
                    Some(b'=') => {
                        shift(state);
                        tok!("%=")
                    }
                    Some(c) if c == b'0' || c == b'1' || c == digits[0] || c == digits[1] => {
                        tok!("number"(read_binary_number(state, env)))
                    }
                    _ => tok!("%"),
                };
            }
            Some(b'$') => return tok!("number"(read_hex_number(state, env))),
            Some(b'`') => return tok!("number"(read_gfx_constant(state, env))),

            // String and character literals.
            Some(b'"') => {
                let mut string = vec![];
                read_string(state, env, &mut string, false);
                return tok!("string"(CompactString::from_utf8_lossy(&string)));
            }
            Some(b'\'') => {
                let mut string = vec![];
                read_character(state, env, &mut string);
                return tok!("character literal"(CompactString::from_utf8_lossy(&string)));
            }

            // Newlines.
            Some(c @ b'\r') => {
                handle_crlf(state, env, c);
                return tok!("end of line");
            }
            Some(b'\n') => return tok!("end of line"),

            // Line continuations. Macro args were handled by `peek`, and
            // character escapes do not exist outside of string literals.
            Some(b'\\') => {
                discard_line_continuation(state, env);
                state.at_line_start = false;
            }

            // Raw strings, raw identifiers, identifiers, or garbage.
            Some(c) => {
                let raw = c == b'#';
                let first_char = if raw {
                    match peek(state, env) {
                        Some(b'"') => {
                            shift(state);
                            let mut string = vec![];
                            read_string(state, env, &mut string, true);
                            return tok!("string"(CompactString::from_utf8_lossy(&string)));
                        }
                        Some(first) if starts_identifier(first) => {
                            shift(state);
                            first
                        }
                        _ => {
                            report_garbage_chars(state, env, c);
                            state.at_line_start = false;
                            continue 'lexing;
                        }
                    }
                } else if starts_identifier(c) {
                    c
                } else {
                    report_garbage_chars(state, env, c);
                    state.at_line_start = false;
                    continue 'lexing;
                };

                let token = read_identifier(state, env, first_char, raw);

                // An ELIF after a taken IF must not evaluate its condition.
                if token == tok!("elif")
                    && state.last_token_was_eol
                    && state.ran_if_block()
                    && !state.reached_else_block()
                {
                    return skip_if_block(state, env, true);
                }

                return match token {
                    tok!("symbol"(name)) => {
                        // A symbol naming a string equate lexes as its contents.
                        if !raw && state.expand_strings {
                            if let Some(contents) = env.symbols.find_equs(&name) {
                                begin_expansion(
                                    state,
                                    contents,
                                    Some(name.as_str().into()),
                                    env,
                                );
                                continue 'lexing;
                            }
                        }
                        // Label definitions and macro invocations both start
                        // with an identifier; lexing as a label when a ':'
                        // *immediately* follows sidesteps a grammar ambiguity,
                        // since macro arguments may not even be valid tokens.
                        if peek(state, env) == Some(b':') {
                            tok!("label"(name))
                        } else {
                            tok!("symbol"(name))
                        }
                    }
                    token => token,
                };
            }
        }
    }
}

// Must stay in sync with the recognisers of `next_token_normal`.
fn is_garbage_char(c: Option<u8>) -> bool {
    let Some(c) = c else { return false };
    !continues_identifier(c) && !b"; \t~[](),+-*/|^=!<>:&%`\"'\r\n\\#".contains(&c)
}

fn report_garbage_chars(state: &mut LexerState, env: &mut LexEnv, c: u8) {
    if is_garbage_char(peek(state, env)) {
        // At least two garbage characters; group them into one report.
        let mut garbage = print_char(Some(c));
        while is_garbage_char(peek(state, env)) {
            let c = bump_char(state, env);
            garbage.push_str(", ");
            garbage.push_str(&print_char(c));
        }
        lex_error(state, env, format_args!("Unknown characters {garbage}"));
    } else {
        lex_error(
            state,
            env,
            format_args!("Unknown character {}", print_char(Some(c))),
        );
    }
}

/// Splits the rest of the line into unparsed macro arguments on commas,
/// honouring balanced parentheses, literals, and line continuations.
fn next_token_raw(state: &mut LexerState, env: &mut LexEnv) -> Token {
    let mut dest: Vec<u8> = vec![];
    let mut paren_depth = 0usize;

    // Trim leading whitespace (but stop at a block comment).
    loop {
        match peek(state, env) {
            Some(c) if is_whitespace(c) => shift(state),
            Some(b'\\') => {
                match next_char(state, env) {
                    // Line continuations count as whitespace.
                    Some(b' ' | b'\t' | b'\r' | b'\n') => discard_line_continuation(state, env),
                    c => {
                        // Not a line continuation; process it as an escape.
                        append_raw_escape(state, env, &mut dest, c);
                        break;
                    }
                }
            }
            _ => break,
        }
    }

    let last = loop {
        match peek(state, env) {
            // Literals inside macro args.
            Some(b'"') => {
                shift(state);
                read_string(state, env, &mut dest, false);
            }
            Some(b'\'') => {
                shift(state);
                read_character(state, env, &mut dest);
            }
            Some(c @ b'#') => {
                dest.push(c);
                if next_char(state, env) == Some(b'"') {
                    shift(state);
                    read_string(state, env, &mut dest, true);
                }
            }

            // Comments inside macro args.
            Some(b';') => {
                discard_comment(state, env);
                break peek(state, env);
            }
            Some(b'/') => {
                if next_char(state, env) == Some(b'*') {
                    shift(state);
                    discard_block_comment(state, env);
                } else {
                    dest.push(b'/');
                }
            }

            c @ (None | Some(b'\r' | b'\n')) => break c,

            // A comma at depth 0 ends the argument.
            Some(b',') if paren_depth == 0 => break Some(b','),
            Some(c @ b'(') => {
                paren_depth += 1;
                dest.push(c);
                shift(state);
            }
            Some(c @ b')') => {
                if paren_depth > 0 {
                    paren_depth -= 1;
                }
                dest.push(c);
                shift(state);
            }

            Some(b'\\') => {
                let c = next_char(state, env);
                append_raw_escape(state, env, &mut dest, c);
            }

            Some(c) => {
                dest.push(c);
                shift(state);
            }
        }
    };

    // Trim trailing whitespace.
    let trimmed_len = dest.len() - dest.iter().rev().take_while(|&&c| is_whitespace(c)).count();
    dest.truncate(trimmed_len);
    let string = CompactString::from_utf8_lossy(&dest);

    // Returning commas would mean that two consecutive commas (an empty
    // argument) need two different tokens without consuming any input; instead,
    // commas end the current argument but are not tokenized themselves.
    if last == Some(b',') {
        shift(state);
        return tok!("string"(string));
    }

    // The last argument may end in a trailing comma, newline, or EOF. To allow
    // trailing commas, what would be the last argument is not emitted if empty;
    // a second trailing comma passes an empty last argument.
    if !string.is_empty() {
        return tok!("string"(string));
    }

    state.mode = Mode::Normal;
    match last {
        Some(c @ (b'\r' | b'\n')) => {
            shift(state);
            handle_crlf(state, env, c);
            tok!("end of line")
        }
        _ => tok!("end of input"),
    }
}

fn append_raw_escape(state: &mut LexerState, env: &mut LexEnv, dest: &mut Vec<u8>, c: Option<u8>) {
    match c {
        // Escapes only valid inside a macro arg, and escapes shared with
        // string literals.
        Some(c @ (b',' | b'(' | b')' | b'\\' | b'"' | b'\'' | b'{' | b'}')) => {
            dest.push(c);
            shift(state);
        }
        Some(b'n') => {
            dest.push(b'\n');
            shift(state);
        }
        Some(b'r') => {
            dest.push(b'\r');
            shift(state);
        }
        Some(b't') => {
            dest.push(b'\t');
            shift(state);
        }
        Some(b'0') => {
            dest.push(b'\0');
            shift(state);
        }

        Some(b' ' | b'\t' | b'\r' | b'\n') => discard_line_continuation(state, env),

        // Macro args were already handled by `peek`, so `\@`, `\#` and
        // `\1`-`\9` cannot occur here.
        None => {
            lex_error(state, env, "Illegal character escape at end of input");
            dest.push(b'\\');
        }
        Some(c) => {
            lex_error(
                state,
                env,
                format_args!("Illegal character escape {}", print_char(Some(c))),
            );
            dest.push(c);
            shift(state);
        }
    }
}

/// Discards bytes until a first-on-line conditional keyword at the right depth.
///
/// Only tokens at the start of a line are meaningful here; this matters because
/// macro args are not expanded in skip modes, and lexing them normally could
/// produce spurious tokens.
fn skip_if_block(state: &mut LexerState, env: &mut LexEnv, to_endc: bool) -> Token {
    state.mode = Mode::Normal;
    let starting_depth = state.if_depth();
    let mut at_line_start = state.at_line_start;
    let saved = disable_expansions(state);

    let token = 'skip: loop {
        // Read chars until EOL.
        while !at_line_start {
            let mut c = bump_char(state, env);
            match c {
                None => break 'skip tok!("end of input"),
                Some(b'\\') => {
                    // Unconditionally skip the next char, including line continuations.
                    c = bump_char(state, env);
                }
                Some(b'\r' | b'\n') => at_line_start = true,
                _ => {}
            }
            if let Some(c @ (b'\r' | b'\n')) = c {
                // Do this both on line continuations and plain newlines.
                handle_crlf(state, env, c);
                state.line_no += 1;
            }
        }
        at_line_start = false;

        while peek(state, env).is_some_and(is_whitespace) {
            shift(state);
        }
        let Some(first_char) = peek(state, env).filter(|&c| starts_identifier(c)) else {
            continue;
        };
        shift(state);
        match read_identifier(state, env, first_char, false) {
            tok!("if") => state.inc_if_depth(),

            token @ tok!("elif") => {
                if state.reached_else_block() {
                    diagnostics::fatal(Some(&state.location()), "Found ELIF after an ELSE block");
                }
                if !to_endc && state.if_depth() == starting_depth {
                    break token;
                }
            }

            token @ tok!("else") => {
                if state.reached_else_block() {
                    diagnostics::fatal(Some(&state.location()), "Found ELSE after an ELSE block");
                }
                if !to_endc && state.if_depth() == starting_depth {
                    // The `else` is handed to the parser, which records it.
                    break token;
                }
                state.mark_reached_else();
            }

            token @ tok!("endc") => {
                if state.if_depth() == starting_depth {
                    break token;
                }
                state.dec_if_depth();
            }

            _ => {}
        }
    };

    restore_expansions(state, saved);
    token
}

/// Discards the rest of a loop body after `break`, maintaining the IF stack.
fn skip_to_endr(state: &mut LexerState, env: &mut LexEnv) -> Token {
    state.mode = Mode::Normal;
    let mut at_line_start = state.at_line_start;
    let saved = disable_expansions(state);

    let token = 'skip: loop {
        while !at_line_start {
            let mut c = bump_char(state, env);
            match c {
                None => break 'skip tok!("end of input"),
                Some(b'\\') => {
                    c = bump_char(state, env);
                }
                Some(b'\r' | b'\n') => at_line_start = true,
                _ => {}
            }
            if let Some(c @ (b'\r' | b'\n')) = c {
                handle_crlf(state, env, c);
                state.line_no += 1;
            }
        }
        at_line_start = false;

        while peek(state, env).is_some_and(is_whitespace) {
            shift(state);
        }
        let Some(first_char) = peek(state, env).filter(|&c| starts_identifier(c)) else {
            continue;
        };
        shift(state);
        match read_identifier(state, env, first_char, false) {
            tok!("if") => state.inc_if_depth(),
            tok!("endc") => state.dec_if_depth(),
            _ => {}
        }
    };

    restore_expansions(state, saved);
    token
}

// The capture recorder.

/// Raw bytes recorded for later replay. A `None` span means end of input was
/// reached before the closing keyword.
#[derive(Debug)]
pub struct Capture {
    pub line_no: u32,
    pub span: Option<ContentSpan>,
}

fn start_capture(state: &mut LexerState) -> Capture {
    // The directive line that requested the capture has been fully read,
    // including its newline.
    debug_assert!(state.at_line_start, "Capture not started at a line start");
    debug_assert!(!state.capturing && state.capture_buf.is_none());
    state.capturing = true;
    state.capture_size = 0;

    let line_no = state.line_no;
    match (&state.content, state.expansions.is_empty()) {
        // Zero-copy: reference the context's own buffer.
        (Content::Viewed(view), true) => Capture {
            line_no,
            span: Some(view.window_at_cursor()),
        },
        // Otherwise, collect every shifted byte into a fresh buffer.
        _ => {
            state.capture_buf = Some(Vec::new());
            Capture {
                line_no,
                span: None, // Retrieved from the buffer when the capture ends.
            }
        }
    }
}

fn end_capture(state: &mut LexerState, capture: &mut Capture) {
    // A buffer-backed capture reallocates while recording, so the span can only
    // be produced once it is over.
    if capture.span.is_none() {
        if let Some(buf) = state.capture_buf.take() {
            capture.span = Some(buf.into());
        }
    }
    if let Some(span) = &mut capture.span {
        span.resize(state.capture_size);
    }

    // The closing keyword (or EOF) leaves us past the start of the line.
    state.at_line_start = false;
    state.capturing = false;
    state.capture_buf = None;
}

pub fn capture_rept(
    fstack: &mut Fstack,
    symbols: &Symbols,
    nb_errors_left: &Cell<usize>,
    options: &Options,
) -> Capture {
    capture_block(
        fstack,
        symbols,
        nb_errors_left,
        options,
        &|token| matches!(token, tok!("rept") | tok!("for")),
        &|token| matches!(token, tok!("endr")),
        "ENDR",
        "Unterminated REPT/FOR block",
    )
}

pub fn capture_macro(
    fstack: &mut Fstack,
    symbols: &Symbols,
    nb_errors_left: &Cell<usize>,
    options: &Options,
) -> Capture {
    capture_block(
        fstack,
        symbols,
        nb_errors_left,
        options,
        &|_token| false, // Macro definitions do not nest.
        &|token| matches!(token, tok!("endm")),
        "ENDM",
        "Unterminated macro definition",
    )
}

#[allow(clippy::too_many_arguments)]
fn capture_block(
    fstack: &mut Fstack,
    symbols: &Symbols,
    nb_errors_left: &Cell<usize>,
    options: &Options,
    nests: &dyn Fn(&Token) -> bool,
    ends: &dyn Fn(&Token) -> bool,
    end_keyword: &str,
    unterminated_msg: &str,
) -> Capture {
    let (state, macro_args, unique_id) = fstack.active_parts();
    let mut env = LexEnv {
        symbols,
        macro_args,
        unique_id,
        nb_errors_left,
        options,
    };

    let mut capture = start_capture(state);
    let saved = disable_expansions(state);
    let mut depth = 0usize;
    let mut unterminated = false;

    'lines: loop {
        state.line_no += 1;
        // We're at a line start, so try to match a whole first-on-line keyword.
        let mut c = bump_char(state, &mut env);
        while c.is_some_and(is_whitespace) {
            c = bump_char(state, &mut env);
        }
        if let Some(first_char) = c.filter(|&ch| starts_identifier(ch)) {
            // Since expansions are disabled, this reads the keyword itself, and
            // not e.g. a string equate that would expand to it.
            let token = read_identifier(state, &mut env, first_char, false);
            if nests(&token) {
                depth += 1;
            } else if ends(&token) {
                match depth.checked_sub(1) {
                    Some(new_depth) => depth = new_depth,
                    None => break 'lines,
                }
            }
        }

        // Consume the rest of the line.
        loop {
            match c {
                None => {
                    unterminated = true;
                    break 'lines;
                }
                Some(c @ (b'\r' | b'\n')) => {
                    handle_crlf(state, &mut env, c);
                    break;
                }
                _ => c = bump_char(state, &mut env),
            }
        }
    }

    restore_expansions(state, saved);
    end_capture(state, &mut capture);
    if unterminated {
        lex_error(state, &env, unterminated_msg);
        capture.span = None; // Signals that EOF came before the closing keyword.
    } else if let Some(span) = &mut capture.span {
        // The closing keyword was captured too, but is not part of the body.
        span.shrink_by(end_keyword.len());
    }
    capture
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{macro_args::MacroArgs, symbols::MacroBody};

    struct Session {
        fstack: Fstack,
        symbols: Symbols,
        nb_errors_left: Cell<usize>,
        options: Options,
    }

    fn span_of(src: &str) -> ContentSpan {
        src.as_bytes().to_vec().into()
    }

    fn session(src: &str) -> Session {
        let mut fstack = Fstack::new();
        fstack.push_main(LexerState::from_view("<test>", span_of(src), 0));
        Session {
            fstack,
            symbols: Symbols::new(),
            nb_errors_left: Cell::new(100),
            options: Options::default(),
        }
    }

    impl Session {
        fn next(&mut self) -> Token {
            next_token(
                &mut self.fstack,
                &self.symbols,
                &self.nb_errors_left,
                &self.options,
            )
        }

        fn drain(&mut self) -> Vec<Token> {
            let mut tokens = vec![];
            loop {
                match self.next() {
                    tok!("end of buffer") => {
                        if !self.fstack.handle_end_of_buffer(
                            &mut self.symbols,
                            &self.nb_errors_left,
                            &self.options,
                        ) {
                            break tokens;
                        }
                    }
                    token => tokens.push(token),
                }
            }
        }

        fn nb_errors(&self) -> usize {
            100 - self.nb_errors_left.get()
        }
    }

    fn lex(src: &str) -> Vec<Token> {
        let mut session = session(src);
        let tokens = session.drain();
        assert_eq!(session.nb_errors(), 0, "unexpected diagnostics for {src:?}");
        tokens
    }

    #[test]
    fn numbers() {
        assert_eq!(
            lex("%1010 %0110_1010 $FF 010 123"),
            vec![
                tok!("number"(10)),
                tok!("number"(106)),
                tok!("number"(255)),
                tok!("number"(10)),
                tok!("number"(123)),
            ],
        );
        assert_eq!(
            lex("0x2A 0o17 0b101 &17"),
            vec![
                tok!("number"(42)),
                tok!("number"(15)),
                tok!("number"(5)),
                tok!("number"(15)),
            ],
        );
    }

    #[test]
    fn gfx_and_fixed_point() {
        // Pixels 0,1,2,3: low bitplane 0b0101, high bitplane 0b0011.
        assert_eq!(lex("`0123"), vec![tok!("number"(0x0305))]);
        assert_eq!(lex("1.5"), vec![tok!("number"(0x0001_8000))]);
        assert_eq!(lex("1.5q8"), vec![tok!("number"(0x0180))]);
    }

    #[test]
    fn number_reader_errors() {
        let mut session = session("$ 0x");
        session.drain();
        assert_eq!(session.nb_errors(), 2);
    }

    #[test]
    fn operators() {
        assert_eq!(
            lex("<<= >>> ** ++ :: != <= + - ~"),
            vec![
                tok!("<<="),
                tok!(">>>"),
                tok!("**"),
                tok!("++"),
                tok!("::"),
                tok!("!="),
                tok!("<="),
                tok!("+"),
                tok!("-"),
                tok!("~"),
            ],
        );
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(
            lex("IF xor Endc REPT"),
            vec![tok!("if"), tok!("xor"), tok!("endc"), tok!("rept")],
        );
    }

    #[test]
    fn ldio_aliases_ldh() {
        assert_eq!(lex("LDIO"), vec![tok!("ldh")]);
    }

    #[test]
    fn identifiers_and_labels() {
        assert_eq!(
            lex("foo: bar Parent.child .local ..."),
            vec![
                tok!("label"("foo".into())),
                tok!(":"),
                tok!("symbol"("bar".into())),
                tok!("local symbol"("Parent.child".into())),
                tok!("local symbol"(".local".into())),
                tok!("symbol"("...".into())),
            ],
        );
        // A raw identifier bypasses the keyword table.
        assert_eq!(lex("#if"), vec![tok!("symbol"("if".into()))]);
    }

    #[test]
    fn anonymous_label_refs() {
        assert_eq!(
            lex(":++ :-"),
            vec![
                tok!("anonymous label reference"("++".into())),
                tok!("anonymous label reference"("-".into())),
            ],
        );
    }

    #[test]
    fn strings() {
        assert_eq!(
            lex(r#""abc" "a\tb" #"a\tb" 'x'"#),
            vec![
                tok!("string"("abc".into())),
                tok!("string"("a\tb".into())),
                tok!("string"("a\\tb".into())),
                tok!("character literal"("x".into())),
            ],
        );
    }

    #[test]
    fn multiline_string() {
        assert_eq!(
            lex("\"\"\"a\nb\"\"\""),
            vec![tok!("string"("a\nb".into()))],
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut session = session("\"oops\n");
        let tokens = session.drain();
        assert_eq!(session.nb_errors(), 1);
        assert_eq!(
            tokens,
            vec![tok!("string"("oops".into())), tok!("end of line")],
        );
    }

    #[test]
    fn comments_and_continuations() {
        assert_eq!(
            lex("1 ; comment\n2 /* mid */ 3\n4 \\\n5\n"),
            vec![
                tok!("number"(1)),
                tok!("end of line"),
                tok!("number"(2)),
                tok!("number"(3)),
                tok!("end of line"),
                tok!("number"(4)),
                tok!("number"(5)),
                tok!("end of line"),
            ],
        );
    }

    #[test]
    fn crlf_is_one_newline() {
        assert_eq!(
            lex("1\r\n2\n"),
            vec![
                tok!("number"(1)),
                tok!("end of line"),
                tok!("number"(2)),
                tok!("end of line"),
            ],
        );
    }

    #[test]
    fn fragment_brackets_inject_newline() {
        assert_eq!(
            lex("[[ 1 ]]"),
            vec![
                tok!("[["),
                tok!("number"(1)),
                tok!("end of line"),
                tok!("]]"),
            ],
        );
    }

    fn macro_session(body: &str, args: &[&str]) -> Session {
        let mut session = session("");
        let macro_body = MacroBody {
            contents: span_of(body),
            line_no: 0,
            path: "<test>".into(),
        };
        let args = MacroArgs::new(args.iter().map(|&arg| arg.into()).collect());
        session
            .fstack
            .push_macro("m", &macro_body, args, None, &session.options);
        session
    }

    #[test]
    fn positional_macro_args() {
        let mut session = macro_session("db \\1, \\2\n", &["3", "4"]);
        assert_eq!(
            session.drain(),
            vec![
                tok!("db"),
                tok!("number"(3)),
                tok!(","),
                tok!("number"(4)),
                tok!("end of line"),
            ],
        );
        assert_eq!(session.nb_errors(), 0);
    }

    #[test]
    fn combined_macro_args() {
        let mut session = macro_session("\\#\n", &["1", "2"]);
        assert_eq!(
            session.drain(),
            vec![
                tok!("number"(1)),
                tok!(","),
                tok!("number"(2)),
                tok!("end of line"),
            ],
        );
        assert_eq!(session.nb_errors(), 0);
    }

    #[test]
    fn bracketed_macro_args() {
        let mut session = macro_session("\\<2> \\<IDX>\n", &["9", "8"]);
        session.symbols.def_constant(
            "IDX",
            1,
            false,
            None,
            &session.nb_errors_left,
            &session.options,
        );
        assert_eq!(
            session.drain(),
            vec![tok!("number"(8)), tok!("number"(9)), tok!("end of line")],
        );
        assert_eq!(session.nb_errors(), 0);
    }

    #[test]
    fn undefined_macro_arg_is_an_error() {
        let mut session = macro_session("\\3\n", &["1", "2"]);
        session.drain();
        assert_eq!(session.nb_errors(), 1);
    }

    #[test]
    fn unique_id_in_macro() {
        let mut session = macro_session("\\@\n", &[]);
        assert_eq!(
            session.drain(),
            vec![tok!("symbol"("_u1".into())), tok!("end of line")],
        );
    }

    #[test]
    fn macro_args_are_painted_blue() {
        // `\1` expands to text containing `\2`; that text must not be rescanned
        // for introducers, so the second argument never leaks through.
        let mut session = macro_session("db \"\\1\"\n", &["\\2", "ZZZ"]);
        let tokens = session.drain();
        assert_eq!(
            tokens,
            vec![
                tok!("db"),
                tok!("string"("\\2".into())),
                tok!("end of line"),
            ],
        );
    }

    #[test]
    fn interpolation_of_numeric_symbol() {
        let mut session = session("{NUM} {d:NUM}\n");
        session.symbols.def_constant(
            "NUM",
            42,
            false,
            None,
            &session.nb_errors_left,
            &session.options,
        );
        // The default format is `$`-prefixed hex, which lexes right back into
        // the same number.
        assert_eq!(
            session.drain(),
            vec![tok!("number"(42)), tok!("number"(42)), tok!("end of line")],
        );
        assert_eq!(session.nb_errors(), 0);
    }

    #[test]
    fn interpolation_of_undefined_symbol() {
        let mut session = session("{NOPE}\n");
        let tokens = session.drain();
        assert_eq!(session.nb_errors(), 1);
        assert_eq!(tokens, vec![tok!("end of line")]);
    }

    #[test]
    fn interpolation_rejects_keywords() {
        let mut session = session("{wram0}\n");
        session.drain();
        assert_eq!(session.nb_errors(), 1);
    }

    #[test]
    fn equs_expands_in_place() {
        let mut session = session("GREETING\n");
        session.symbols.def_string(
            "GREETING",
            "\"hello\"".into(),
            false,
            None,
            &session.nb_errors_left,
            &session.options,
        );
        assert_eq!(
            session.drain(),
            vec![tok!("string"("hello".into())), tok!("end of line")],
        );
    }

    #[test]
    fn capture_rept_body() {
        let mut session = session("db 1\n\tdb 2\nENDR\n");
        let capture = capture_rept(
            &mut session.fstack,
            &session.symbols,
            &session.nb_errors_left,
            &session.options,
        );
        assert_eq!(
            capture.span.as_ref().map(ContentSpan::as_bytes),
            Some(&b"db 1\n\tdb 2\n"[..]),
        );
        assert_eq!(session.nb_errors(), 0);
    }

    #[test]
    fn capture_rept_nests() {
        let mut session = session("rept 2\ndb 1\nendr\nENDR\n");
        let capture = capture_rept(
            &mut session.fstack,
            &session.symbols,
            &session.nb_errors_left,
            &session.options,
        );
        assert_eq!(
            capture.span.as_ref().map(ContentSpan::as_bytes),
            Some(&b"rept 2\ndb 1\nendr\n"[..]),
        );
    }

    #[test]
    fn capture_macro_does_not_nest() {
        let mut session = session("db 1\nENDM\nENDM\n");
        let capture = capture_macro(
            &mut session.fstack,
            &session.symbols,
            &session.nb_errors_left,
            &session.options,
        );
        assert_eq!(
            capture.span.as_ref().map(ContentSpan::as_bytes),
            Some(&b"db 1\n"[..]),
        );
    }

    #[test]
    fn unterminated_capture_returns_no_span() {
        let mut session = session("db 1\n");
        let capture = capture_macro(
            &mut session.fstack,
            &session.symbols,
            &session.nb_errors_left,
            &session.options,
        );
        assert!(capture.span.is_none());
        assert_eq!(session.nb_errors(), 1);
    }

    #[test]
    fn buffered_capture_owns_its_bytes() {
        let reader = Box::new(std::io::Cursor::new(b"db 1\nENDR\n".to_vec()));
        let mut fstack = Fstack::new();
        fstack.push_main(LexerState::from_reader("<test>".into(), reader));
        let symbols = Symbols::new();
        let nb_errors_left = Cell::new(100);
        let options = Options::default();

        let capture = capture_rept(&mut fstack, &symbols, &nb_errors_left, &options);
        assert_eq!(
            capture.span.as_ref().map(ContentSpan::as_bytes),
            Some(&b"db 1\n"[..]),
        );
        assert_eq!(nb_errors_left.get(), 100);
    }

    #[test]
    fn fragment_contexts_lex_inline() {
        let mut session = session("");
        session
            .fstack
            .push_fragment(span_of("db 7\n"), 3, None, &session.options);
        assert_eq!(
            session.drain(),
            vec![tok!("db"), tok!("number"(7)), tok!("end of line")],
        );
    }

    #[test]
    fn line_numbers_follow_newlines() {
        let mut session = session("1\n2\n3");
        while session.next() != tok!("end of buffer") {}
        assert_eq!(session.fstack.active_state().line_no, 3);
    }
}
