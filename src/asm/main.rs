use std::{
    cell::Cell,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::Parser;
use sysexits::ExitCode;

mod cli;
use cli::Cli;
#[path = "../common/mod.rs"]
mod common;
use common::S;
mod cond;
mod diagnostics;
use diagnostics::WarningSettings;
mod expr;
mod format;
mod fstack;
mod macro_args;
mod sources;
mod state;
mod symbols;
use symbols::Symbols;
mod syntax;

#[derive(Debug, Clone)]
pub struct Options {
    verbose: bool,
    pub export_all: bool,
    inc_paths: Vec<PathBuf>,
    pub dependfile: Option<PathBuf>,
    pub missing_include: MissingInclude,
    dep_phony: bool,
    dep_targets: Vec<String>,
    output: Option<PathBuf>,
    pub preinclude: Option<PathBuf>,
    pub inhibit_warnings: bool,
    pub max_errors: usize,
    pub runtime_opts: RuntimeOptions,
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub binary_digits: [u8; 2],
    pub gfx_digits: [u8; 4],
    pub pad_byte: u8,
    pub q_precision: u8,
    pub recursion_depth: usize,
    pub warnings: WarningSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingInclude {
    /// A missing include is fatal.
    #[default]
    Error,
    /// `-MG`: record it as a dependency and end assembly successfully.
    RecordAndExit,
    /// `-MC`: record it as a dependency and keep assembling past it.
    RecordAndContinue,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verbose: false,
            export_all: false,
            inc_paths: vec![],
            dependfile: None,
            missing_include: MissingInclude::Error,
            dep_phony: false,
            dep_targets: vec![],
            output: None,
            preinclude: None,
            inhibit_warnings: false,
            max_errors: 100,
            runtime_opts: RuntimeOptions {
                binary_digits: [b'0', b'1'],
                gfx_digits: [b'0', b'1', b'2', b'3'],
                pad_byte: 0,
                q_precision: 16,
                recursion_depth: 64,
                warnings: WarningSettings::default(),
            },
        }
    }
}

impl Options {
    /// Looks a file up, trying each include directory in turn on `NotFound`.
    /// `None` means the file exists nowhere; `Some(Err(..))` is any other error.
    pub fn search_file(
        &self,
        path: &Path,
    ) -> Option<Result<(File, PathBuf), (io::Error, PathBuf)>> {
        let mut loaded_path = path.to_owned();
        let mut res = File::open(&loaded_path);

        let mut inc_path = self.inc_paths.iter();
        while matches!(&res, Err(err) if err.kind() == io::ErrorKind::NotFound) {
            loaded_path = inc_path.next()?.join(path);
            res = File::open(&loaded_path);
        }
        Some(match res {
            Ok(file) => Ok((file, loaded_path)),
            Err(err) => Err((err, loaded_path)),
        })
    }
}

fn main() -> ExitCode {
    let Ok((options, input, defines, state_specs)) = Cli::parse().finish() else {
        return ExitCode::Usage;
    };

    // `-X 0` disables the error cap.
    let max_errors = if options.max_errors == 0 {
        usize::MAX
    } else {
        options.max_errors
    };
    let nb_errors_left = Cell::new(max_errors);

    let mut symbols = Symbols::new();
    for define in &defines {
        let (name, value) = match define.split_once('=') {
            Some((name, value)) => (name, value),
            None => (define.as_str(), "1"),
        };
        symbols.def_string(name, value.into(), false, None, &nb_errors_left, &options);
    }

    if options.verbose {
        eprintln!("Assembling {}", input.display());
        if let Some(output) = &options.output {
            eprintln!("Output filename {}", output.display());
        }
        eprintln!(
            "Options: pad byte 0x{:02X}, Q{} fixed-point precision, {} recursion depth",
            options.runtime_opts.pad_byte,
            options.runtime_opts.q_precision,
            options.runtime_opts.recursion_depth,
        );
    }

    let result = syntax::parse_file(&input, &mut symbols, &nb_errors_left, &options);

    if let Err(err) = write_dependfile(&options, &result) {
        diagnostics::fatal(None, format_args!("Failed to write dependency file: {err}"));
    }

    let nb_errors = max_errors - nb_errors_left.get();
    if nb_errors != 0 {
        eprintln!("{nb_errors} error{} generated.", S::from(nb_errors));
        return ExitCode::DataErr;
    }

    // Assembly was cut short by `-MG`; the dependencies were still written.
    if result.failed_on_missing_include {
        return ExitCode::Ok;
    }

    for (path, features) in &state_specs {
        if options.verbose {
            eprintln!("Writing state file {}", path.display());
        }
        if let Err(err) = state::write_state_file(path, features, &symbols) {
            diagnostics::fatal(
                None,
                format_args!("Failed to write state file \"{}\": {err}", path.display()),
            );
        }
    }

    ExitCode::Ok
}

fn write_dependfile(options: &Options, result: &syntax::ParseResult) -> io::Result<()> {
    let Some(dep_path) = &options.dependfile else {
        return Ok(());
    };
    let targets = options.dep_targets.join(" ");
    let mut out: Box<dyn Write> = if dep_path == Path::new("-") {
        Box::new(io::stdout().lock())
    } else {
        Box::new(io::BufWriter::new(File::create(dep_path)?))
    };

    let deps = || result.dependencies.iter().chain(&result.missing_includes);
    for dep in deps() {
        writeln!(out, "{targets}: {}", dep.display())?;
    }
    if options.dep_phony {
        for dep in deps() {
            writeln!(out, "{}:", dep.display())?;
        }
    }
    out.flush()
}
