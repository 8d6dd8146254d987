//! `-s` state files: a line-oriented dump of the definitions reached by the end
//! of assembly, replayable as source.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::symbols::{SymbolKind, Symbols};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFeature {
    Equ,
    Var,
    Equs,
    Char,
    Macro,
}

const ALL_FEATURES: [StateFeature; 5] = [
    StateFeature::Equ,
    StateFeature::Var,
    StateFeature::Equs,
    StateFeature::Char,
    StateFeature::Macro,
];

/// Parses a `-s <features>:<path>` argument.
pub fn parse_state_spec(arg: &str) -> Result<(PathBuf, Vec<StateFeature>), String> {
    let Some((features, path)) = arg.split_once(':') else {
        return Err(format!(
            "Invalid argument for option 's': expected <features>:<path>, got \"{arg}\""
        ));
    };

    let mut list: Vec<StateFeature> = vec![];
    for feature in features.split(',') {
        let feature = feature.trim_matches([' ', '\t']);
        if feature.is_empty() {
            return Err("Empty feature for option 's'".into());
        }
        if feature.eq_ignore_ascii_case("all") {
            if !list.is_empty() {
                eprintln!("warning: Redundant feature before \"all\" for option 's'");
            }
            list = ALL_FEATURES.to_vec();
            continue;
        }
        let value = match feature.to_ascii_lowercase().as_str() {
            "equ" => StateFeature::Equ,
            "var" => StateFeature::Var,
            "equs" => StateFeature::Equs,
            "char" => StateFeature::Char,
            "macro" => StateFeature::Macro,
            _ => return Err(format!("Invalid feature for option 's': \"{feature}\"")),
        };
        if list.contains(&value) {
            eprintln!("warning: Ignoring duplicate feature for option 's': \"{feature}\"");
        } else {
            list.push(value);
        }
    }
    Ok((path.into(), list))
}

pub fn write_state_file(
    path: &Path,
    features: &[StateFeature],
    symbols: &Symbols,
) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);

    for feature in features {
        for (name, data) in symbols.defs() {
            match (&data.kind, feature) {
                (SymbolKind::Constant(value), StateFeature::Equ) => {
                    writeln!(file, "def {name} equ {value}")?;
                }
                (SymbolKind::Variable(value), StateFeature::Var) => {
                    writeln!(file, "def {name} = {value}")?;
                }
                (SymbolKind::String(contents), StateFeature::Equs) => {
                    writeln!(file, "def {name} equs \"{}\"", escape_string(contents))?;
                }
                // Charmaps are not modelled; the `char` feature has nothing to dump.
                (SymbolKind::Macro(body), StateFeature::Macro) => {
                    writeln!(file, "macro {name}")?;
                    file.write_all(body.contents.as_bytes())?;
                    writeln!(file, "endm")?;
                }
                _ => {}
            }
        }
    }
    file.flush()
}

fn escape_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' | '"' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            '\0' => escaped.push_str("\\0"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        let (path, features) = parse_state_spec("equ,macro:out.txt").unwrap();
        assert_eq!(path, PathBuf::from("out.txt"));
        assert_eq!(features, vec![StateFeature::Equ, StateFeature::Macro]);

        let (_path, features) = parse_state_spec("all:dump").unwrap();
        assert_eq!(features.len(), 5);

        assert!(parse_state_spec("equ").is_err());
        assert!(parse_state_spec("bogus:out").is_err());
        assert!(parse_state_spec(":out").is_err());
    }

    #[test]
    fn string_escapes() {
        assert_eq!(escape_string("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}
