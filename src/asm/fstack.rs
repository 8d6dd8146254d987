//! The file stack: one context per active source unit (included file, macro
//! invocation, `rept`/`for` replay, or fragment literal).
//!
//! At most one context is active at a time. A freshly pushed context only
//! becomes active at the next line boundary, so that a partially-lexed line is
//! never split across two contexts; until then it sits on top of the stack,
//! scheduled.

use std::{cell::Cell, path::PathBuf, rc::Rc};

use compact_str::{format_compact, CompactString};

use crate::{
    common::S,
    diagnostics::{self, Location},
    macro_args::MacroArgs,
    sources::ContentSpan,
    symbols::{MacroBody, Symbols},
    syntax::lexer::LexerState,
    Options,
};

#[derive(Debug)]
pub struct Fstack {
    contexts: Vec<Context>,
    /// Index of the context being lexed; anything above it is scheduled.
    active: usize,
    next_unique_id: u32,
    /// Every file opened, in order, for dependency output.
    dependencies: Vec<PathBuf>,
    /// Includes that were not found but recorded as dependencies.
    missing_includes: Vec<PathBuf>,
    failed_on_missing_include: bool,
}

#[derive(Debug)]
pub struct Context {
    pub lexer_state: LexerState,
    pub kind: ContextKind,
    /// Inherited by includes; fresh for macros and loops.
    macro_args: Option<Rc<MacroArgs>>,
    unique_id: Option<Rc<str>>,
}

#[derive(Debug)]
pub enum ContextKind {
    File,
    Macro {
        name: CompactString,
    },
    Rept {
        iters_remaining: u32,
        body_line_no: u32,
        broken: bool,
    },
    For {
        var: CompactString,
        value: i32,
        step: i32,
        iters_remaining: u32,
        body_line_no: u32,
        broken: bool,
    },
    Fragment,
}

impl ContextKind {
    fn description(&self) -> CompactString {
        match self {
            Self::File => "file".into(),
            Self::Macro { name } => format_compact!("macro \"{name}\""),
            Self::Rept { .. } | Self::For { .. } => "loop body".into(),
            Self::Fragment => "fragment".into(),
        }
    }
}

impl Fstack {
    pub fn new() -> Self {
        Self {
            contexts: vec![],
            active: 0,
            next_unique_id: 0,
            dependencies: vec![],
            missing_includes: vec![],
            failed_on_missing_include: false,
        }
    }

    fn new_unique_id(&mut self) -> Rc<str> {
        self.next_unique_id += 1;
        format!("_u{}", self.next_unique_id).into()
    }

    fn push_context(&mut self, context: Context, loc: Option<&Location>, options: &Options) {
        let limit = options.runtime_opts.recursion_depth;
        if self.contexts.len() > limit {
            diagnostics::fatal(loc, format_args!("Recursion limit ({limit}) exceeded"));
        }
        debug_assert!(
            self.contexts.len() <= self.active + 1,
            "Two contexts scheduled at once",
        );
        self.contexts.push(context);
    }

    /// Pushes the translation unit's root context; active immediately.
    pub fn push_main(&mut self, lexer_state: LexerState) {
        debug_assert!(self.contexts.is_empty());
        self.contexts.push(Context {
            lexer_state,
            kind: ContextKind::File,
            macro_args: None,
            unique_id: None,
        });
        self.active = 0;
    }

    pub fn push_include(
        &mut self,
        lexer_state: LexerState,
        loc: Option<&Location>,
        options: &Options,
    ) {
        let (macro_args, unique_id) = self.inherited();
        self.push_context(
            Context {
                lexer_state,
                kind: ContextKind::File,
                macro_args,
                unique_id,
            },
            loc,
            options,
        );
    }

    pub fn push_macro(
        &mut self,
        name: &str,
        body: &MacroBody,
        args: MacroArgs,
        loc: Option<&Location>,
        options: &Options,
    ) {
        let unique_id = Some(self.new_unique_id());
        self.push_context(
            Context {
                lexer_state: LexerState::from_view(&body.path, body.contents.clone(), body.line_no),
                kind: ContextKind::Macro { name: name.into() },
                macro_args: Some(Rc::new(args)),
                unique_id,
            },
            loc,
            options,
        );
    }

    pub fn push_rept(
        &mut self,
        body: ContentSpan,
        body_line_no: u32,
        nb_iters: u32,
        loc: Option<&Location>,
        options: &Options,
    ) {
        debug_assert!(nb_iters > 0);
        let path = self.active_state().path.clone();
        let (macro_args, _unique_id) = self.inherited();
        let unique_id = Some(self.new_unique_id());
        self.push_context(
            Context {
                lexer_state: LexerState::from_view(&path, body, body_line_no),
                kind: ContextKind::Rept {
                    iters_remaining: nb_iters,
                    body_line_no,
                    broken: false,
                },
                macro_args,
                unique_id,
            },
            loc,
            options,
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_for(
        &mut self,
        var: &str,
        start: i32,
        step: i32,
        nb_iters: u32,
        body: ContentSpan,
        body_line_no: u32,
        symbols: &mut Symbols,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        debug_assert!(nb_iters > 0);
        symbols.def_variable(var, start, loc, nb_errors_left, options);
        let path = self.active_state().path.clone();
        let (macro_args, _unique_id) = self.inherited();
        let unique_id = Some(self.new_unique_id());
        self.push_context(
            Context {
                lexer_state: LexerState::from_view(&path, body, body_line_no),
                kind: ContextKind::For {
                    var: var.into(),
                    value: start,
                    step,
                    iters_remaining: nb_iters,
                    body_line_no,
                    broken: false,
                },
                macro_args,
                unique_id,
            },
            loc,
            options,
        );
    }

    /// Pushes a `[[ … ]]` fragment literal's body as its own context.
    pub fn push_fragment(
        &mut self,
        body: ContentSpan,
        line_no: u32,
        loc: Option<&Location>,
        options: &Options,
    ) {
        let path = self.active_state().path.clone();
        let (macro_args, unique_id) = self.inherited();
        self.push_context(
            Context {
                lexer_state: LexerState::from_view(&path, body, line_no),
                kind: ContextKind::Fragment,
                macro_args,
                unique_id,
            },
            loc,
            options,
        );
    }

    fn inherited(&self) -> (Option<Rc<MacroArgs>>, Option<Rc<str>>) {
        match self.contexts.get(self.active) {
            Some(ctx) => (ctx.macro_args.clone(), ctx.unique_id.clone()),
            None => (None, None),
        }
    }

    /// Makes a scheduled context active, if the current one is at a line start.
    pub fn commit_scheduled_switch(&mut self) {
        if self.active + 1 < self.contexts.len()
            && self.contexts[self.active].lexer_state.at_line_start
        {
            self.active = self.contexts.len() - 1;
        }
    }

    pub fn has_scheduled_context(&self) -> bool {
        self.active + 1 < self.contexts.len()
    }

    pub fn active_state(&self) -> &LexerState {
        &self.contexts[self.active].lexer_state
    }

    pub fn active_state_mut(&mut self) -> &mut LexerState {
        &mut self.contexts[self.active].lexer_state
    }

    pub fn active_parts(&mut self) -> (&mut LexerState, Option<Rc<MacroArgs>>, Option<Rc<str>>) {
        let ctx = &mut self.contexts[self.active];
        let macro_args = ctx.macro_args.clone();
        let unique_id = ctx.unique_id.clone();
        (&mut ctx.lexer_state, macro_args, unique_id)
    }

    pub fn macro_args(&self) -> Option<&Rc<MacroArgs>> {
        self.contexts[self.active].macro_args.as_ref()
    }

    pub fn location(&self) -> Location {
        self.active_state().location()
    }

    /// Stops the active loop context: the current iteration's remainder is
    /// still skipped by the lexer, but no further iteration runs.
    pub fn mark_loop_broken(&mut self) -> bool {
        match &mut self.contexts[self.active].kind {
            ContextKind::Rept { broken, .. } | ContextKind::For { broken, .. } => {
                *broken = true;
                true
            }
            _ => false,
        }
    }

    /// Handles the active context reaching its end of buffer: replays loops
    /// with iterations left, and pops anything else. Returns whether there is
    /// still something to lex.
    #[must_use]
    pub fn handle_end_of_buffer(
        &mut self,
        symbols: &mut Symbols,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) -> bool {
        // A context scheduled mid-line takes over before this one is torn down.
        if self.has_scheduled_context() {
            return true;
        }

        let ctx = self.contexts.last_mut().expect("No context at end of buffer");
        match &mut ctx.kind {
            ContextKind::Rept {
                iters_remaining,
                body_line_no,
                broken: false,
            } if *iters_remaining > 1 => {
                *iters_remaining -= 1;
                let line_no = *body_line_no;
                report_unterminated_ifs(&ctx.lexer_state, "loop body", nb_errors_left, options);
                ctx.lexer_state.restart_view(line_no);
                self.next_unique_id += 1;
                ctx.unique_id = Some(format!("_u{}", self.next_unique_id).into());
                return true;
            }
            ContextKind::For {
                var,
                value,
                step,
                iters_remaining,
                body_line_no,
                broken: false,
            } if *iters_remaining > 1 => {
                *iters_remaining -= 1;
                *value = value.wrapping_add(*step);
                let line_no = *body_line_no;
                symbols.def_variable(var, *value, None, nb_errors_left, options);
                report_unterminated_ifs(&ctx.lexer_state, "loop body", nb_errors_left, options);
                ctx.lexer_state.restart_view(line_no);
                self.next_unique_id += 1;
                ctx.unique_id = Some(format!("_u{}", self.next_unique_id).into());
                return true;
            }
            _ => {}
        }

        let ctx = self.contexts.pop().unwrap();
        let what = ctx.kind.description();
        report_unterminated_ifs(&ctx.lexer_state, &what, nb_errors_left, options);
        self.active = self.contexts.len().saturating_sub(1);
        !self.contexts.is_empty()
    }

    // Dependency bookkeeping.

    pub fn record_dependency(&mut self, path: PathBuf) {
        self.dependencies.push(path);
    }

    pub fn record_missing_include(&mut self, path: PathBuf) {
        self.missing_includes.push(path);
    }

    pub fn set_failed_on_missing_include(&mut self) {
        self.failed_on_missing_include = true;
    }

    pub fn failed_on_missing_include(&self) -> bool {
        self.failed_on_missing_include
    }

    pub fn dependencies(&self) -> (&[PathBuf], &[PathBuf]) {
        (&self.dependencies, &self.missing_includes)
    }
}

fn report_unterminated_ifs(
    state: &LexerState,
    what: &str,
    nb_errors_left: &Cell<usize>,
    options: &Options,
) {
    let nb_ifs = state.if_depth();
    if nb_ifs != 0 {
        diagnostics::error(
            Some(&state.location()),
            format_args!(
                "Ended {what} with {nb_ifs} unterminated IF construct{}",
                S::from(nb_ifs)
            ),
            nb_errors_left,
            options,
        );
    }
}
