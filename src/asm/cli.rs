/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * SPDX-License-Identifier: MPL-2.0
 */

use std::{fmt::Display, path::PathBuf, str::FromStr};

use clap::{ColorChoice, Parser};

use crate::{
    diagnostics::WarningSettings,
    state::{self, StateFeature},
    MissingInclude, Options, RuntimeOptions,
};

/// The command-line interface.
#[derive(Debug, Parser)]
#[command(
    name = "gbasm",
    version,
    about = "Game Boy assembler",
    long_about = "Assembles some Game Boy assembly, checking the program's structure and directives.",
    arg_required_else_help = true,
    infer_long_args = true,
    help_expected = true
)]
pub(super) struct Cli {
    /// The two characters to use for binary constants
    #[arg(short, long, default_value_t = Chars(['0', '1']), value_name = "chars")]
    binary_digits: Chars<2>,
    /// Controls when to use color
    #[arg(long, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,
    /// Define a string symbol before assembling the source code
    #[arg(short = 'D', long = "define", value_name = "name[=value]")]
    defines: Vec<String>,
    /// Export all labels, even unreferenced and local ones
    #[arg(short = 'E', long)]
    export_all: bool,
    /// The four characters to use for graphics constants
    #[arg(short, long, default_value_t = Chars(['0', '1', '2', '3']), value_name = "chars")]
    gfx_chars: Chars<4>,
    /// Add a new include path
    #[arg(short = 'I', long = "include", value_name = "path")]
    inc_paths: Vec<PathBuf>,
    /// Print Make-style dependencies to this file (`-` is standard output)
    #[arg(short = 'M', long, value_name = "path")]
    dependfile: Option<PathBuf>,
    /// Continue assembling after a missing include, recording it as a dependency
    #[arg(long = "MC", requires = "dependfile")]
    dep_continue: bool,
    /// Exit successfully on a missing include, recording it as a dependency
    #[arg(long = "MG", requires = "dependfile")]
    dep_generate: bool,
    /// Add phony targets for all dependencies
    #[arg(long = "MP", requires = "dependfile")]
    dep_phony: bool,
    /// Add a target to the dependency rules
    #[arg(long = "MT", value_name = "target")]
    dep_targets: Vec<String>,
    /// Add a Make-escaped target to the dependency rules
    #[arg(long = "MQ", value_name = "target")]
    dep_quoted_targets: Vec<String>,
    /// Write an object file to this path
    #[arg(short, long, value_name = "path")]
    output: Option<PathBuf>,
    /// Include this file before starting to read the input
    #[arg(short = 'P', long, value_name = "path")]
    preinclude: Option<PathBuf>,
    /// Use this as the default byte for `ds`
    #[arg(
        short,
        long,
        default_value_t = 0,
        value_name = "byte",
        value_parser = crate::common::cli::parse_number::<u8>
    )]
    pad_value: u8,
    /// Use this as the default precision of fixed-point numbers
    #[arg(
        short = 'Q',
        long,
        default_value_t = 16,
        value_name = "precision",
        value_parser = parse_precision
    )]
    q_precision: u8,
    /// Recursion depth past which an infinite loop is assumed
    #[arg(short, long, default_value_t = 64, value_name = "max depth")]
    recursion_depth: usize,
    /// Write the assembly state to a file
    #[arg(short = 's', long = "state", value_name = "features:path")]
    state_files: Vec<String>,
    /// Print progress information
    #[arg(short, long)]
    verbose: bool,
    /// Enable or disable a warning
    #[arg(short = 'W', long = "warning", value_name = "flag")]
    warnings: Vec<String>,
    /// Inhibit all warnings, even those turned into errors
    #[arg(short = 'w')]
    inhibit_warnings: bool,
    /// Abort if more than this many errors are generated (0 disables the limit)
    #[arg(short = 'X', long, default_value_t = 100, value_name = "max")]
    max_errors: usize,

    /// Path to the file to assemble (`-` reads from standard input)
    input: PathBuf,
}

fn parse_precision(arg: &str) -> Result<u8, String> {
    let precision: u8 = arg
        .strip_prefix('.')
        .unwrap_or(arg)
        .parse()
        .map_err(|err| format!("{err}"))?;
    if (1..=31).contains(&precision) {
        Ok(precision)
    } else {
        Err("precision must be between 1 and 31".into())
    }
}

/// An argument made of exactly `N` characters.
#[derive(Debug, Clone)]
struct Chars<const N: usize>([char; N]);

impl<const N: usize> FromStr for Chars<N> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        (|| {
            let mut c = s.chars();
            let mut chars = [char::default(); N];
            for (i, slot) in chars.iter_mut().enumerate() {
                *slot = c.next().ok_or(i)?;
            }

            let rest = c.count();
            if rest == 0 {
                Ok(Self(chars))
            } else {
                Err(N + rest)
            }
        })()
        .map_err(|got| format!("expected {N} characters, got {got}"))
    }
}

impl<const N: usize> Display for Chars<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in &self.0 {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Checks digit aliases: legal characters, no repeats, and fixed digits only in
/// their own position.
fn check_digit_aliases<const N: usize>(
    digits: &[char; N],
    kind: &str,
) -> Result<[u8; N], String> {
    let mut out = [0u8; N];
    for (i, &c) in digits.iter().enumerate() {
        if !c.is_ascii() || !(c.is_ascii_alphanumeric() || matches!(c, '.' | '#' | '@')) {
            return Err(format!("Invalid digit for {kind} constant '{c}'"));
        }
        let value = c as u8;
        if (b'0'..b'0' + N as u8).contains(&value) && value != b'0' + i as u8 {
            return Err(format!("Changed digit for {kind} constant '{c}'"));
        }
        if digits[i + 1..].contains(&c) {
            return Err(format!("Repeated digit for {kind} constant '{c}'"));
        }
        out[i] = value;
    }
    Ok(out)
}

fn make_escape(target: &str) -> String {
    // Every dollar must be doubled for Make.
    target.replace('$', "$$")
}

impl Cli {
    #[allow(clippy::type_complexity)]
    pub(super) fn finish(
        self,
    ) -> Result<(Options, PathBuf, Vec<String>, Vec<(PathBuf, Vec<StateFeature>)>), ()> {
        crate::common::cli::apply_color_choice(self.color);

        fn report<T>(res: Result<T, String>) -> Result<T, ()> {
            res.map_err(|msg| eprintln!("error: {msg}"))
        }

        let binary_digits = report(check_digit_aliases(&self.binary_digits.0, "binary"))?;
        let gfx_digits = report(check_digit_aliases(&self.gfx_chars.0, "graphics"))?;

        let mut warnings = WarningSettings::default();
        for flag in &self.warnings {
            if warnings.process_flag(flag).is_err() {
                eprintln!("warning: Unknown warning flag \"{flag}\"");
            }
        }

        let missing_include = if self.dep_continue {
            MissingInclude::RecordAndContinue
        } else if self.dep_generate {
            MissingInclude::RecordAndExit
        } else {
            MissingInclude::Error
        };

        let mut dep_targets = self.dep_targets;
        dep_targets.extend(self.dep_quoted_targets.iter().map(|t| make_escape(t)));
        if dep_targets.is_empty() {
            if let Some(output) = &self.output {
                dep_targets.push(output.display().to_string());
            }
        }
        if self.dependfile.is_some() && dep_targets.is_empty() {
            eprintln!(
                "error: Dependency files can only be created if a target file is specified with either -o, -MQ or -MT"
            );
            return Err(());
        }

        let state_files = report(
            self.state_files
                .iter()
                .map(|spec| state::parse_state_spec(spec))
                .collect::<Result<Vec<_>, _>>(),
        )?;

        Ok((
            Options {
                verbose: self.verbose,
                export_all: self.export_all,
                inc_paths: self.inc_paths,
                dependfile: self.dependfile,
                missing_include,
                dep_phony: self.dep_phony,
                dep_targets,
                output: self.output,
                preinclude: self.preinclude,
                inhibit_warnings: self.inhibit_warnings,
                max_errors: self.max_errors,
                runtime_opts: RuntimeOptions {
                    binary_digits,
                    gfx_digits,
                    pad_byte: self.pad_value,
                    q_precision: self.q_precision,
                    recursion_depth: self.recursion_depth,
                    warnings,
                },
            },
            self.input,
            self.defines,
            state_files,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_alias_rules() {
        assert_eq!(check_digit_aliases(&['0', '1'], "binary"), Ok([b'0', b'1']));
        assert_eq!(check_digit_aliases(&['.', '#'], "binary"), Ok([b'.', b'#']));
        // A fixed digit in the wrong slot.
        assert!(check_digit_aliases(&['1', '0'], "binary").is_err());
        // Repeats and illegal characters.
        assert!(check_digit_aliases(&['x', 'x'], "binary").is_err());
        assert!(check_digit_aliases(&['!', '1'], "binary").is_err());
    }

    #[test]
    fn make_escaping() {
        assert_eq!(make_escape("a$b"), "a$$b");
    }
}
