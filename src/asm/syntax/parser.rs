//! The hand-written statement driver.
//!
//! One statement per line. Anything that affects the front end (conditionals,
//! macros, loops, includes, symbol definitions) is handled here; data and
//! instruction statements are scanned and dropped, since code generation is a
//! separate concern.

use std::{path::Path, rc::Rc};

use compact_str::CompactString;

use crate::{
    diagnostics::{self, Location, WarningKind},
    expr::const_expr,
    macro_args::MacroArgs,
    symbols::MacroBody,
    MissingInclude,
};

use super::{
    lexer::{self, LexerState, Mode},
    tokens::{tok, Token},
    ParseCtx,
};

pub fn parse_all(ctx: &mut ParseCtx) {
    loop {
        if ctx.stop {
            break;
        }
        match ctx.next_token() {
            tok!("end of buffer") => {
                if !ctx
                    .fstack
                    .handle_end_of_buffer(ctx.symbols, ctx.nb_errors_left, ctx.options)
                {
                    break;
                }
            }
            tok!("end of line") => {}
            token => parse_statement(ctx, token),
        }
    }
}

fn parse_statement(ctx: &mut ParseCtx, first: Token) {
    match first {
        tok!("label"(name)) => stmt_label(ctx, name),
        tok!("local symbol"(name)) => stmt_local_label(ctx, name),
        tok!("symbol"(name)) => stmt_macro_invocation(ctx, name),

        tok!("include") => stmt_include(ctx),

        tok!("if") => stmt_if(ctx),
        tok!("elif") => stmt_elif(ctx),
        tok!("else") => stmt_else(ctx),
        tok!("endc") => {
            ctx.fstack.active_state_mut().dec_if_depth();
            expect_eol(ctx);
        }

        tok!("macro") => stmt_macro_def(ctx),
        tok!("endm") => {
            ctx.error("ENDM found outside of a macro definition");
            skim_line(ctx);
        }

        tok!("rept") => stmt_rept(ctx),
        tok!("for") => stmt_for(ctx),
        tok!("endr") => {
            ctx.error("ENDR found outside of a REPT/FOR block");
            skim_line(ctx);
        }
        tok!("break") => stmt_break(ctx),

        tok!("def") => stmt_def(ctx, false),
        tok!("redef") => stmt_def(ctx, true),
        tok!("purge") => stmt_purge(ctx),
        tok!("shift") => stmt_shift(ctx),

        tok!("print") => stmt_print(ctx, false),
        tok!("println") => stmt_print(ctx, true),
        tok!("warn") => stmt_warn(ctx),
        tok!("fail") => stmt_fail(ctx),
        tok!("fatal") => stmt_fatal(ctx),

        token @ (tok!("number"(..)) | tok!("string"(..)) | tok!("character literal"(..))) => {
            ctx.error(format_args!("Unexpected {token} at the start of a statement"));
            skim_line(ctx);
        }

        // Instructions, data directives, and section plumbing don't affect the
        // front end; scan their operands and move on.
        _ => skim_line(ctx),
    }
}

fn expect_eol(ctx: &mut ParseCtx) {
    match ctx.next_token() {
        tok!("end of line") => {}
        token @ tok!("end of buffer") => ctx.unget(token),
        token => {
            ctx.error(format_args!("Expected the end of the line, got {token}"));
            skim_line(ctx);
        }
    }
}

fn skim_line(ctx: &mut ParseCtx) {
    loop {
        match ctx.next_token() {
            tok!("end of line") => break,
            token @ tok!("end of buffer") => {
                ctx.unget(token);
                break;
            }
            _ => {}
        }
    }
}

// Labels.

fn stmt_label(ctx: &mut ParseCtx, name: CompactString) {
    // The ':' (or '::') that made this lex as a label.
    let exported = match ctx.next_token() {
        tok!("::") => true,
        tok!(":") => false,
        _ => {
            ctx.error(format_args!("Expected ':' after the label name \"{name}\""));
            false
        }
    };

    // Legacy `Name: MACRO` definitions.
    if matches!(ctx.peek_token(), tok!("macro")) {
        ctx.next_token();
        ctx.warn(
            WarningKind::Obsolete,
            format_args!("`{name}: MACRO` is deprecated; use `MACRO {name}`"),
        );
        finish_macro_def(ctx, name);
        return;
    }

    define_label(ctx, &name, exported);
    finish_label_line(ctx);
}

fn stmt_local_label(ctx: &mut ParseCtx, name: CompactString) {
    // Local labels may be defined with or without a colon.
    let exported = match ctx.peek_token() {
        tok!("::") => {
            ctx.next_token();
            true
        }
        tok!(":") => {
            ctx.next_token();
            false
        }
        _ => false,
    };
    define_label(ctx, &name, exported);
    finish_label_line(ctx);
}

fn define_label(ctx: &mut ParseCtx, name: &str, exported: bool) {
    let loc = ctx.fstack.location();
    ctx.symbols
        .def_label(name, exported, Some(&loc), ctx.nb_errors_left, ctx.options);
}

/// A label may share its line with another statement.
fn finish_label_line(ctx: &mut ParseCtx) {
    match ctx.next_token() {
        tok!("end of line") => {}
        token @ tok!("end of buffer") => ctx.unget(token),
        token => parse_statement(ctx, token),
    }
}

// Macros.

fn stmt_macro_invocation(ctx: &mut ParseCtx, name: CompactString) {
    let loc = ctx.fstack.location();
    // The rest of the line is unparsed macro arguments.
    ctx.fstack.active_state_mut().mode = Mode::Raw;
    let mut args: Vec<Rc<str>> = vec![];
    loop {
        match ctx.next_token() {
            tok!("string"(arg)) => args.push(arg.as_str().into()),
            tok!("end of line") => break,
            token @ tok!("end of buffer") => {
                ctx.unget(token);
                break;
            }
            _ => break,
        }
    }

    let Some(body) = ctx.symbols.find_macro(&name) else {
        ctx.error(format_args!("Macro \"{name}\" not defined"));
        return;
    };
    ctx.fstack
        .push_macro(&name, &body, MacroArgs::new(args), Some(&loc), ctx.options);
}

fn stmt_macro_def(ctx: &mut ParseCtx) {
    match ctx.next_token_no_equs() {
        tok!("symbol"(name)) => finish_macro_def(ctx, name),
        token => {
            ctx.error(format_args!("Expected a macro name after MACRO, got {token}"));
            ctx.unget(token);
            skim_line(ctx);
        }
    }
}

fn finish_macro_def(ctx: &mut ParseCtx, name: CompactString) {
    let loc = ctx.fstack.location();
    expect_eol(ctx);
    let capture = lexer::capture_macro(
        &mut ctx.fstack,
        ctx.symbols,
        ctx.nb_errors_left,
        ctx.options,
    );
    // A `None` span means EOF came before the ENDM; already reported.
    let Some(contents) = capture.span else { return };
    let body = MacroBody {
        contents,
        line_no: capture.line_no,
        path: ctx.fstack.active_state().path.clone(),
    };
    ctx.symbols
        .def_macro(&name, body, Some(&loc), ctx.nb_errors_left, ctx.options);
}

// Conditionals.

fn stmt_if(ctx: &mut ParseCtx) {
    let condition = const_expr(ctx).unwrap_or(0);
    expect_eol(ctx);
    let state = ctx.fstack.active_state_mut();
    state.inc_if_depth();
    if condition != 0 {
        state.mark_ran_if();
    } else {
        state.mode = Mode::SkipToElif;
    }
}

fn stmt_elif(ctx: &mut ParseCtx) {
    let state = ctx.fstack.active_state();
    if state.if_depth() == 0 {
        ctx.error("ELIF found outside of an IF construct");
        skim_line(ctx);
        return;
    }
    if state.reached_else_block() {
        diagnostics::fatal(Some(&state.location()), "Found ELIF after an ELSE block");
    }
    if state.ran_if_block() {
        // A branch already ran; its condition must not even be evaluated.
        ctx.fstack.active_state_mut().mode = Mode::SkipToEndc;
        return;
    }

    let condition = const_expr(ctx).unwrap_or(0);
    expect_eol(ctx);
    let state = ctx.fstack.active_state_mut();
    if condition != 0 {
        state.mark_ran_if();
    } else {
        state.mode = Mode::SkipToElif;
    }
}

fn stmt_else(ctx: &mut ParseCtx) {
    let state = ctx.fstack.active_state();
    if state.if_depth() == 0 {
        ctx.error("ELSE found outside of an IF construct");
        skim_line(ctx);
        return;
    }
    if state.reached_else_block() {
        diagnostics::fatal(Some(&state.location()), "Found ELSE after an ELSE block");
    }
    let ran = state.ran_if_block();
    let state = ctx.fstack.active_state_mut();
    state.mark_reached_else();
    if ran {
        state.mode = Mode::SkipToEndc;
    } else {
        state.mark_ran_if();
        expect_eol(ctx);
    }
}

// Loops.

fn stmt_rept(ctx: &mut ParseCtx) {
    let loc = ctx.fstack.location();
    let count = const_expr(ctx).unwrap_or(0);
    if count < 0 {
        ctx.error(format_args!("REPT count must not be negative (got {count})"));
    }
    expect_eol(ctx);
    let capture = lexer::capture_rept(
        &mut ctx.fstack,
        ctx.symbols,
        ctx.nb_errors_left,
        ctx.options,
    );
    if let Some(body) = capture.span {
        if count > 0 {
            ctx.fstack
                .push_rept(body, capture.line_no, count as u32, Some(&loc), ctx.options);
        }
    }
}

fn stmt_for(ctx: &mut ParseCtx) {
    let loc = ctx.fstack.location();

    let var = match ctx.next_token_no_equs() {
        tok!("symbol"(name)) => Some(name),
        token => {
            ctx.error(format_args!("Expected a symbol name after FOR, got {token}"));
            ctx.unget(token);
            skim_line(ctx);
            None
        }
    };

    let mut bounds = vec![];
    if var.is_some() {
        loop {
            match ctx.next_token() {
                tok!(",") => bounds.push(const_expr(ctx).unwrap_or(0)),
                token => {
                    ctx.unget(token);
                    break;
                }
            }
        }
        expect_eol(ctx);
    }

    // The loop body is captured even if the directive itself is malformed, so
    // that its ENDR is not left dangling.
    let capture = lexer::capture_rept(
        &mut ctx.fstack,
        ctx.symbols,
        ctx.nb_errors_left,
        ctx.options,
    );

    let Some(var) = var else { return };
    let (start, stop, step) = match bounds[..] {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        _ => {
            ctx.error("FOR expects 1 to 3 bounds after the symbol name");
            return;
        }
    };
    if step == 0 {
        ctx.error("FOR cannot have a step of 0");
        return;
    }

    let nb_iters = if step > 0 && start < stop {
        ((i64::from(stop) - i64::from(start) - 1) / i64::from(step) + 1) as u32
    } else if step < 0 && start > stop {
        ((i64::from(start) - i64::from(stop) - 1) / i64::from(-step) + 1) as u32
    } else {
        0
    };

    let Some(body) = capture.span else { return };
    if nb_iters == 0 {
        // The variable is still defined, as if the loop had run zero times.
        ctx.symbols
            .def_variable(&var, start, Some(&loc), ctx.nb_errors_left, ctx.options);
        return;
    }
    ctx.fstack.push_for(
        &var,
        start,
        step,
        nb_iters,
        body,
        capture.line_no,
        ctx.symbols,
        Some(&loc),
        ctx.nb_errors_left,
        ctx.options,
    );
}

fn stmt_break(ctx: &mut ParseCtx) {
    if !ctx.fstack.mark_loop_broken() {
        ctx.error("BREAK found outside of a REPT/FOR block");
        skim_line(ctx);
        return;
    }
    // Skip the rest of this iteration; the loop will not restart.
    ctx.fstack.active_state_mut().mode = Mode::SkipToEndr;
}

// Symbol definitions.

fn stmt_def(ctx: &mut ParseCtx, redef: bool) {
    let loc = ctx.fstack.location();
    let directive = if redef { "REDEF" } else { "DEF" };

    let name = match ctx.next_token_no_equs() {
        tok!("symbol"(name)) | tok!("local symbol"(name)) => name,
        token => {
            ctx.error(format_args!(
                "Expected a symbol name after {directive}, got {token}"
            ));
            ctx.unget(token);
            skim_line(ctx);
            return;
        }
    };

    match ctx.next_token() {
        tok!("equ") => {
            let value = const_expr(ctx).unwrap_or(0);
            ctx.symbols
                .def_constant(&name, value, redef, Some(&loc), ctx.nb_errors_left, ctx.options);
            expect_eol(ctx);
        }
        tok!("=") => {
            let value = const_expr(ctx).unwrap_or(0);
            ctx.symbols
                .def_variable(&name, value, Some(&loc), ctx.nb_errors_left, ctx.options);
            expect_eol(ctx);
        }
        tok!("equs") => match ctx.next_token() {
            tok!("string"(contents)) => {
                ctx.symbols.def_string(
                    &name,
                    contents.as_str().into(),
                    redef,
                    Some(&loc),
                    ctx.nb_errors_left,
                    ctx.options,
                );
                expect_eol(ctx);
            }
            token => {
                ctx.error(format_args!("Expected a string after EQUS, got {token}"));
                ctx.unget(token);
                skim_line(ctx);
            }
        },
        token => {
            ctx.error(format_args!(
                "Expected EQU, EQUS or = after the symbol name, got {token}"
            ));
            ctx.unget(token);
            skim_line(ctx);
        }
    }
}

fn stmt_purge(ctx: &mut ParseCtx) {
    let loc = ctx.fstack.location();
    loop {
        match ctx.next_token_no_equs() {
            tok!("symbol"(name)) | tok!("local symbol"(name)) => {
                ctx.symbols
                    .purge(&name, Some(&loc), ctx.nb_errors_left, ctx.options);
            }
            token => {
                ctx.error(format_args!("Expected a symbol name after PURGE, got {token}"));
                ctx.unget(token);
                skim_line(ctx);
                return;
            }
        }
        match ctx.next_token() {
            tok!(",") => {}
            tok!("end of line") => break,
            token @ tok!("end of buffer") => {
                ctx.unget(token);
                break;
            }
            token => {
                ctx.error(format_args!("Expected the end of the line, got {token}"));
                skim_line(ctx);
                break;
            }
        }
    }
}

fn stmt_shift(ctx: &mut ParseCtx) {
    let amount = match ctx.peek_token() {
        tok!("end of line") | tok!("end of buffer") => 1,
        _ => const_expr(ctx).unwrap_or(1),
    };
    expect_eol(ctx);
    match ctx.fstack.macro_args() {
        Some(args) => {
            if args.shift_by(amount).is_err() {
                ctx.warn(
                    WarningKind::MacroShift,
                    format_args!("Cannot shift macro arguments by {amount}"),
                );
            }
        }
        None => ctx.error("SHIFT cannot be used outside of a macro"),
    }
}

// Output directives.

fn stmt_print(ctx: &mut ParseCtx, newline: bool) {
    if !matches!(
        ctx.peek_token(),
        tok!("end of line") | tok!("end of buffer")
    ) {
        loop {
            if matches!(ctx.peek_token(), tok!("string"(..))) {
                let tok!("string"(string)) = ctx.next_token() else {
                    unreachable!();
                };
                print!("{string}");
            } else {
                match const_expr(ctx) {
                    Some(value) => print!("${:X}", value as u32),
                    None => {
                        skim_line(ctx);
                        return;
                    }
                }
            }
            match ctx.next_token() {
                tok!(",") => {}
                token => {
                    ctx.unget(token);
                    break;
                }
            }
        }
    }
    expect_eol(ctx);
    if newline {
        println!();
    }
}

fn stmt_warn(ctx: &mut ParseCtx) {
    match ctx.next_token() {
        tok!("string"(msg)) => {
            ctx.warn(WarningKind::User, msg);
            expect_eol(ctx);
        }
        token => {
            ctx.error(format_args!("Expected a string after WARN, got {token}"));
            ctx.unget(token);
            skim_line(ctx);
        }
    }
}

fn stmt_fail(ctx: &mut ParseCtx) {
    match ctx.next_token() {
        tok!("string"(msg)) => {
            ctx.error(msg);
            expect_eol(ctx);
        }
        token => {
            ctx.error(format_args!("Expected a string after FAIL, got {token}"));
            ctx.unget(token);
            skim_line(ctx);
        }
    }
}

fn stmt_fatal(ctx: &mut ParseCtx) {
    match ctx.next_token() {
        tok!("string"(msg)) => diagnostics::fatal(Some(&ctx.fstack.location()), msg),
        token => {
            ctx.error(format_args!("Expected a string after FATAL, got {token}"));
            ctx.unget(token);
            skim_line(ctx);
        }
    }
}

// Includes.

fn stmt_include(ctx: &mut ParseCtx) {
    match ctx.next_token() {
        tok!("string"(path)) => {
            expect_eol(ctx);
            let loc = ctx.fstack.location();
            run_include(ctx, Path::new(path.as_str()), Some(&loc));
        }
        token => {
            ctx.error(format_args!("Expected a string after INCLUDE, got {token}"));
            ctx.unget(token);
            skim_line(ctx);
        }
    }
}

pub(crate) fn run_include(ctx: &mut ParseCtx, path: &Path, loc: Option<&Location>) {
    match ctx.options.search_file(path) {
        Some(Ok((file, resolved))) => {
            let name = compact_str::format_compact!("{}", resolved.display());
            match LexerState::from_file(name, file) {
                Ok(state) => {
                    ctx.fstack.record_dependency(resolved);
                    ctx.fstack.push_include(state, loc, ctx.options);
                }
                Err(err) => diagnostics::fatal(
                    loc,
                    format_args!("Failed to read \"{}\": {err}", resolved.display()),
                ),
            }
        }
        Some(Err((err, failed_path))) => diagnostics::fatal(
            loc,
            format_args!("Unable to open \"{}\": {err}", failed_path.display()),
        ),
        None => {
            // Not found in any include directory.
            if ctx.options.dependfile.is_some()
                && ctx.options.missing_include != MissingInclude::Error
            {
                ctx.fstack.record_missing_include(path.to_owned());
                if ctx.options.missing_include == MissingInclude::RecordAndExit {
                    ctx.fstack.set_failed_on_missing_include();
                    ctx.stop = true;
                }
                // With `-MC`, the include is skipped and assembly continues.
            } else {
                diagnostics::fatal(
                    loc,
                    format_args!(
                        "Unable to open \"{}\": No such file or directory",
                        path.display()
                    ),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{fstack::Fstack, symbols::Symbols, Options};

    fn parse_str(src: &str) -> (Symbols, usize) {
        let mut symbols = Symbols::new();
        let nb_errors_left = Cell::new(100);
        let options = Options::default();
        let mut fstack = Fstack::new();
        fstack.push_main(LexerState::from_view(
            "<test>",
            src.as_bytes().to_vec().into(),
            0,
        ));
        let mut ctx = ParseCtx::new(fstack, &mut symbols, &nb_errors_left, &options);
        parse_all(&mut ctx);
        drop(ctx);
        (symbols, 100 - nb_errors_left.get())
    }

    fn value_of(symbols: &Symbols, name: &str) -> Option<i32> {
        symbols.find_valid(name)?.get_number(None)
    }

    #[test]
    fn constant_definitions() {
        let (symbols, nb_errors) = parse_str("def K equ 2 + 3 * 4\ndef V = 10\ndef V = V + 1\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "K"), Some(14));
        assert_eq!(value_of(&symbols, "V"), Some(11));
    }

    #[test]
    fn expression_precedence() {
        let (symbols, nb_errors) = parse_str(
            "def A equ (2 + 3) * 4\n\
             def B equ 2 ** 3 ** 2\n\
             def C equ -2 ** 2\n\
             def D equ 1 << 4 | 3\n\
             def E equ high($1234)\n\
             def F equ low($1234)\n",
        );
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "A"), Some(20));
        assert_eq!(value_of(&symbols, "B"), Some(512));
        assert_eq!(value_of(&symbols, "C"), Some(-4));
        assert_eq!(value_of(&symbols, "D"), Some(19));
        assert_eq!(value_of(&symbols, "E"), Some(0x12));
        assert_eq!(value_of(&symbols, "F"), Some(0x34));
    }

    #[test]
    fn if_elif_selects_one_branch() {
        let (symbols, nb_errors) =
            parse_str("if 0\ndef A equ 1\nelif 1\ndef A equ 2\nendc\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "A"), Some(2));
    }

    #[test]
    fn elif_after_taken_if_is_skipped() {
        let (symbols, nb_errors) =
            parse_str("if 1\ndef A equ 1\nelif 1\ndef A equ 2\nendc\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "A"), Some(1));
    }

    #[test]
    fn else_runs_when_no_branch_taken() {
        let (symbols, nb_errors) = parse_str(
            "if 0\ndef A equ 1\nelse\ndef A equ 2\nendc\n\
             if 1\ndef B equ 1\nelse\ndef B equ 2\nendc\n",
        );
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "A"), Some(2));
        assert_eq!(value_of(&symbols, "B"), Some(1));
    }

    #[test]
    fn skipped_branches_handle_nesting() {
        let (symbols, nb_errors) = parse_str(
            "if 0\nif 1\ndef A equ 9\nendc\nelse\ndef A equ 3\nendc\n",
        );
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "A"), Some(3));
    }

    #[test]
    fn unterminated_if_is_reported() {
        let (_symbols, nb_errors) = parse_str("if 1\ndef A equ 1\n");
        assert_eq!(nb_errors, 1);
    }

    #[test]
    fn rept_replays_its_body() {
        let (symbols, nb_errors) = parse_str("def N = 0\nrept 3\ndef N = N + 1\nendr\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "N"), Some(3));
    }

    #[test]
    fn rept_zero_skips_its_body() {
        let (symbols, nb_errors) = parse_str("def N = 0\nrept 0\ndef N = N + 1\nendr\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "N"), Some(0));
    }

    #[test]
    fn for_iterates_with_step() {
        let (symbols, nb_errors) =
            parse_str("def N = 0\nfor I, 1, 7, 2\ndef N = N + I\nendr\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "N"), Some(9)); // 1 + 3 + 5
        assert_eq!(value_of(&symbols, "I"), Some(5));
    }

    #[test]
    fn break_stops_a_loop() {
        let (symbols, nb_errors) =
            parse_str("def N = 0\nrept 5\ndef N = N + 1\nbreak\nendr\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "N"), Some(1));
    }

    #[test]
    fn macro_definition_and_invocation() {
        let (symbols, nb_errors) =
            parse_str("macro m\ndef R equ \\1 + \\2\nendm\nm 2, 3\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "R"), Some(5));
    }

    #[test]
    fn legacy_macro_definition() {
        let (symbols, nb_errors) = parse_str("m: MACRO\ndef R equ 7\nendm\nm\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "R"), Some(7));
    }

    #[test]
    fn nargs_and_shift() {
        let (symbols, nb_errors) = parse_str(
            "macro m\ndef N equ _NARG\nshift\ndef R equ \\1\nendm\nm 1, 2, 3\n",
        );
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "N"), Some(3));
        assert_eq!(value_of(&symbols, "R"), Some(2));
    }

    #[test]
    fn unique_ids_differ_between_invocations() {
        let (symbols, nb_errors) =
            parse_str("macro m\ndef X\\@ equ 1\nendm\nm\nm\n");
        assert_eq!(nb_errors, 0);
        assert!(symbols.find_valid("X_u1").is_some());
        assert!(symbols.find_valid("X_u2").is_some());
    }

    #[test]
    fn unique_ids_differ_between_rept_iterations() {
        let (symbols, nb_errors) = parse_str("rept 2\ndef Y\\@ equ 1\nendr\n");
        assert_eq!(nb_errors, 0);
        assert!(symbols.find_valid("Y_u1").is_some());
        assert!(symbols.find_valid("Y_u2").is_some());
    }

    #[test]
    fn equs_expands_in_expressions() {
        let (symbols, nb_errors) = parse_str("def S equs \"4 + 5\"\ndef R equ S\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "R"), Some(9));
    }

    #[test]
    fn purge_and_def_query() {
        let (symbols, nb_errors) = parse_str(
            "def K equ 1\npurge K\nif !def(K)\ndef P equ 1\nendc\n",
        );
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "P"), Some(1));
        assert!(symbols.is_purged("K"));
    }

    #[test]
    fn labels_define_scopes() {
        let (symbols, nb_errors) =
            parse_str("Global::\n.local\ndef K equ def(Global.local)\n");
        assert_eq!(nb_errors, 0);
        assert_eq!(value_of(&symbols, "K"), Some(1));
        assert!(symbols.find_valid("Global").is_some_and(|sym| sym.exported));
    }

    #[test]
    fn undefined_macro_is_an_error() {
        let (_symbols, nb_errors) = parse_str("nope 1, 2\n");
        assert_eq!(nb_errors, 1);
    }

    #[test]
    fn stray_closers_are_errors() {
        let (_symbols, nb_errors) = parse_str("endm\nendr\nbreak\n");
        assert_eq!(nb_errors, 3);
    }

    #[test]
    fn instruction_statements_are_scanned_over() {
        let (_symbols, nb_errors) = parse_str("ld a, 1 + 2\nxor a\nret\n");
        assert_eq!(nb_errors, 0);
    }
}
