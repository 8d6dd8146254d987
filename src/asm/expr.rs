//! Constant-expression evaluation over the token stream.
//!
//! A precedence-climbing loop; everything is computed on 32-bit wrapping
//! arithmetic. Errors are reported and `None` is returned, so callers can fall
//! back to a sentinel value and keep parsing.

use crate::{
    diagnostics::WarningKind,
    syntax::{
        tokens::{tok, Token},
        ParseCtx,
    },
};

/// Binding power just above `*`/`/`/`%`, just below `**`.
const UNARY_BP: u8 = 16;

fn binary_bp(token: &Token) -> Option<(u8, u8)> {
    Some(match token {
        tok!("||") => (2, 3),
        tok!("&&") => (4, 5),
        tok!("==") | tok!("!=") | tok!("<") | tok!(">") | tok!("<=") | tok!(">=") => (6, 7),
        tok!("+") | tok!("-") => (8, 9),
        tok!("&") | tok!("|") | tok!("^") => (10, 11),
        tok!("<<") | tok!(">>") | tok!(">>>") => (12, 13),
        tok!("*") | tok!("/") | tok!("%") => (14, 15),
        // Right-associative.
        tok!("**") => (18, 17),
        _ => return None,
    })
}

pub fn const_expr(ctx: &mut ParseCtx) -> Option<i32> {
    expr_bp(ctx, 0)
}

fn expr_bp(ctx: &mut ParseCtx, min_bp: u8) -> Option<i32> {
    let mut lhs = match ctx.next_token() {
        tok!("number"(value)) => value as i32,
        tok!("symbol"(name)) | tok!("local symbol"(name)) => symbol_value(ctx, &name)?,

        tok!("(") => {
            let value = expr_bp(ctx, 0)?;
            expect(ctx, tok!(")"))?;
            value
        }

        tok!("+") => expr_bp(ctx, UNARY_BP)?,
        tok!("-") => expr_bp(ctx, UNARY_BP)?.wrapping_neg(),
        tok!("~") => !expr_bp(ctx, UNARY_BP)?,
        tok!("!") => (expr_bp(ctx, UNARY_BP)? == 0) as i32,

        tok!("def") => {
            expect(ctx, tok!("("))?;
            let defined = match ctx.next_token_no_equs() {
                tok!("symbol"(name)) | tok!("local symbol"(name)) => {
                    let defined = ctx.symbols.find_valid(&name).is_some();
                    if !defined && ctx.symbols.is_purged(&name) {
                        ctx.warn(
                            WarningKind::Purged,
                            format_args!("Querying purged symbol \"{name}\""),
                        );
                    }
                    defined
                }
                token => {
                    ctx.error(format_args!("Expected a symbol name inside DEF(), got {token}"));
                    ctx.unget(token);
                    return None;
                }
            };
            expect(ctx, tok!(")"))?;
            defined as i32
        }
        tok!("high") => {
            expect(ctx, tok!("("))?;
            let value = expr_bp(ctx, 0)?;
            expect(ctx, tok!(")"))?;
            (value >> 8) & 0xFF
        }
        tok!("low") => {
            expect(ctx, tok!("("))?;
            let value = expr_bp(ctx, 0)?;
            expect(ctx, tok!(")"))?;
            value & 0xFF
        }

        tok!("string"(..)) => {
            ctx.error("String constants are not valid in numeric expressions");
            return None;
        }
        token => {
            ctx.error(format_args!("Unexpected {token} in expression"));
            ctx.unget(token);
            return None;
        }
    };

    loop {
        let Some((left_bp, right_bp)) = binary_bp(ctx.peek_token()) else {
            break;
        };
        if left_bp < min_bp {
            break;
        }
        let op = ctx.next_token();
        let rhs = expr_bp(ctx, right_bp)?;
        lhs = apply_binary(ctx, &op, lhs, rhs)?;
    }
    Some(lhs)
}

fn apply_binary(ctx: &ParseCtx, op: &Token, lhs: i32, rhs: i32) -> Option<i32> {
    Some(match op {
        tok!("||") => (lhs != 0 || rhs != 0) as i32,
        tok!("&&") => (lhs != 0 && rhs != 0) as i32,

        tok!("==") => (lhs == rhs) as i32,
        tok!("!=") => (lhs != rhs) as i32,
        tok!("<") => (lhs < rhs) as i32,
        tok!(">") => (lhs > rhs) as i32,
        tok!("<=") => (lhs <= rhs) as i32,
        tok!(">=") => (lhs >= rhs) as i32,

        tok!("+") => lhs.wrapping_add(rhs),
        tok!("-") => lhs.wrapping_sub(rhs),

        tok!("&") => lhs & rhs,
        tok!("|") => lhs | rhs,
        tok!("^") => lhs ^ rhs,

        tok!("<<") => lhs.wrapping_shl(rhs as u32),
        tok!(">>") => lhs.wrapping_shr(rhs as u32),
        tok!(">>>") => (lhs as u32).wrapping_shr(rhs as u32) as i32,

        tok!("*") => lhs.wrapping_mul(rhs),
        tok!("/") => {
            if rhs == 0 {
                ctx.error("Division by zero");
                return None;
            }
            lhs.wrapping_div(rhs)
        }
        tok!("%") => {
            if rhs == 0 {
                ctx.error("Modulo by zero");
                return None;
            }
            lhs.wrapping_rem(rhs)
        }
        tok!("**") => {
            if rhs < 0 {
                ctx.error("Exponents cannot be negative");
                return None;
            }
            lhs.wrapping_pow(rhs as u32)
        }

        _ => unreachable!("not a binary operator: {op}"),
    })
}

fn symbol_value(ctx: &mut ParseCtx, name: &str) -> Option<i32> {
    match ctx.symbols.find_valid(name) {
        Some(sym) => match sym.get_number(ctx.fstack.macro_args().map(|args| args.as_ref())) {
            Some(value) => Some(value),
            None => {
                ctx.error(format_args!(
                    "\"{name}\" is a {}, not a numeric constant",
                    sym.kind_name()
                ));
                None
            }
        },
        None => {
            if ctx.symbols.is_purged(name) {
                ctx.error(format_args!("\"{name}\" does not exist; it was purged"));
            } else {
                ctx.error(format_args!("\"{name}\" does not exist"));
            }
            None
        }
    }
}

fn expect(ctx: &mut ParseCtx, want: Token) -> Option<()> {
    let token = ctx.next_token();
    if token == want {
        Some(())
    } else {
        ctx.error(format_args!("Expected {want}, got {token}"));
        ctx.unget(token);
        None
    }
}
