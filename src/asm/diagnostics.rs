//! The three kinds of diagnostics: warnings (categorised, possibly promoted to
//! errors), errors (counted against the `-X` cap), and fatal errors (which
//! terminate the process).
//!
//! Lexer and parser code never propagates failures upwards; it reports here and
//! carries on with a sentinel value.

use std::{cell::Cell, fmt::Display};

use compact_str::CompactString;
use strum::EnumCount;
use yansi::Paint;

use crate::{common::S, Options};

/// Where a diagnostic points. Sub-line positions are not tracked; line numbers are
/// all the assembler reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: CompactString,
    pub line_no: u32,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.path, self.line_no)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumCount,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
pub enum WarningKind {
    /// A constant too large for its representation.
    LargeConstant,
    /// `shift` moving past the ends of the argument list.
    MacroShift,
    /// `/*` inside a block comment.
    NestedComment,
    /// Deprecated syntax, such as the `LDIO` alias.
    Obsolete,
    /// Querying a purged symbol.
    Purged,
    /// A directive without its matching opener.
    UnmatchedDirective,
    /// The `warn` directive.
    User,
}

/// Per-category override state; `None` means "not overridden on the command line".
#[derive(Debug, Clone, Copy, Default)]
pub struct WarningState {
    pub enabled: Option<bool>,
    pub error: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct WarningSettings {
    states: [WarningState; WarningKind::COUNT],
    /// `-Werror`: promote all warnings not explicitly exempted.
    pub warnings_are_errors: bool,
}

impl WarningSettings {
    /// Processes one `-W` command-line flag.
    pub fn process_flag(&mut self, flag: &str) -> Result<(), ()> {
        if flag == "error" {
            self.warnings_are_errors = true;
            return Ok(());
        }
        if let Some(name) = flag.strip_prefix("error=") {
            self.state_mut(name)?.error = Some(true);
            return Ok(());
        }
        if let Some(name) = flag.strip_prefix("no-error=") {
            self.state_mut(name)?.error = Some(false);
            return Ok(());
        }
        if flag == "all" || flag == "everything" || flag == "extra" {
            for state in &mut self.states {
                state.enabled = Some(true);
            }
            return Ok(());
        }
        if let Some(name) = flag.strip_prefix("no-") {
            self.state_mut(name)?.enabled = Some(false);
            return Ok(());
        }
        self.state_mut(flag)?.enabled = Some(true);
        Ok(())
    }

    fn state_mut(&mut self, name: &str) -> Result<&mut WarningState, ()> {
        let kind: WarningKind = name.parse().map_err(|_err| ())?;
        Ok(&mut self.states[kind as usize])
    }

    fn state(&self, kind: WarningKind) -> &WarningState {
        &self.states[kind as usize]
    }
}

fn prefix(loc: Option<&Location>) -> String {
    match loc {
        Some(loc) => format!("{loc}: "),
        None => String::new(),
    }
}

pub fn warn<M: Display>(
    id: WarningKind,
    loc: Option<&Location>,
    msg: M,
    nb_errors_left: &Cell<usize>,
    options: &Options,
) {
    if options.inhibit_warnings {
        return;
    }
    let settings = &options.runtime_opts.warnings;
    let state = settings.state(id);
    if state.enabled == Some(false) {
        return;
    }
    let as_error = state.error.unwrap_or(settings.warnings_are_errors);

    if as_error {
        let flag = format!("-Werror={id}");
        eprintln!(
            "{} {}{msg} [{}]",
            "error:".red().bold(),
            prefix(loc),
            flag.red(),
        );
        count_error(nb_errors_left, options);
    } else {
        let flag = format!("-W{id}");
        eprintln!(
            "{} {}{msg} [{}]",
            "warning:".yellow().bold(),
            prefix(loc),
            flag.yellow(),
        );
    }
}

pub fn error<M: Display>(
    loc: Option<&Location>,
    msg: M,
    nb_errors_left: &Cell<usize>,
    options: &Options,
) {
    eprintln!("{} {}{msg}", "error:".red().bold(), prefix(loc));
    count_error(nb_errors_left, options);
}

fn count_error(nb_errors_left: &Cell<usize>, options: &Options) {
    nb_errors_left.set(nb_errors_left.get() - 1);
    if nb_errors_left.get() == 0 {
        let nb_errors = options.max_errors;
        eprintln!(
            "{} Assembly aborted after {nb_errors} error{}!",
            "fatal:".red().bold(),
            S::from(nb_errors),
        );
        std::process::exit(sysexits::ExitCode::DataErr as i32);
    }
}

/// Reports a non-recoverable condition and terminates the process.
pub fn fatal<M: Display>(loc: Option<&Location>, msg: M) -> ! {
    eprintln!("{} {}{msg}", "fatal:".red().bold(), prefix(loc));
    std::process::exit(sysexits::ExitCode::DataErr as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_names_round_trip() {
        use strum::IntoEnumIterator;

        for kind in WarningKind::iter() {
            let name = kind.to_string();
            assert_eq!(name.parse::<WarningKind>(), Ok(kind), "{name}");
        }
    }

    #[test]
    fn flag_processing() {
        let mut settings = WarningSettings::default();
        settings.process_flag("no-obsolete").unwrap();
        settings.process_flag("error=large-constant").unwrap();
        assert_eq!(settings.state(WarningKind::Obsolete).enabled, Some(false));
        assert_eq!(settings.state(WarningKind::LargeConstant).error, Some(true));
        assert!(settings.process_flag("not-a-warning").is_err());

        settings.process_flag("error").unwrap();
        assert!(settings.warnings_are_errors);
    }
}
