use std::{cell::Cell, rc::Rc};

use chrono::prelude::*;
use compact_str::{format_compact, CompactString, ToCompactString};
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;

use crate::{
    diagnostics::{self, Location},
    macro_args::MacroArgs,
    sources::ContentSpan,
    Options,
};

#[derive(Debug)]
pub struct Symbols {
    /// Definition order is preserved, which the state-file dump relies on.
    symbols: IndexMap<CompactString, SymbolData, FxBuildHasher>,
    /// The global label most recently defined, under which local names resolve.
    scope: Option<CompactString>,
}

#[derive(Debug)]
pub struct SymbolData {
    pub kind: SymbolKind,
    pub builtin: bool,
    pub exported: bool,
}

#[derive(Debug)]
pub enum SymbolKind {
    /// `def … equ`; immutable.
    Constant(i32),
    /// `def … =`; mutable.
    Variable(i32),
    /// `def … equs`; lexed in place of its name.
    String(Rc<str>),
    Macro(MacroBody),
    Label,
    /// The argument count of the enclosing macro; computed on lookup.
    Narg,
    /// Placeholder left behind by `purge`, to improve later error messages.
    Deleted,
}

#[derive(Debug, Clone)]
pub struct MacroBody {
    pub contents: ContentSpan,
    /// Line of the `macro` directive, so diagnostics inside the body line up.
    pub line_no: u32,
    pub path: CompactString,
}

impl Symbols {
    pub fn new() -> Self {
        let mut this = Self {
            symbols: IndexMap::default(),
            scope: None,
        };

        let mut def_builtin = |name: &str, kind| {
            let res = this.symbols.insert(
                name.to_compact_string(),
                SymbolData {
                    kind,
                    builtin: true,
                    exported: false,
                },
            );
            debug_assert!(res.is_none());
        };
        let string = |value: String| SymbolKind::String(value.into());

        def_builtin("@", SymbolKind::Label);
        def_builtin("_NARG", SymbolKind::Narg);
        def_builtin(
            "__GBASM_VERSION__",
            string(format!("\"{}\"", env!("CARGO_PKG_VERSION"))),
        );

        // `SOURCE_DATE_EPOCH` pins the time symbols for reproducible builds.
        let now_utc = std::env::var("SOURCE_DATE_EPOCH")
            .ok()
            .and_then(|epoch| epoch.parse().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        def_builtin(
            "__ISO_8601_UTC__",
            string(format!(
                "\"{}\"",
                now_utc.to_rfc3339_opts(SecondsFormat::Secs, true)
            )),
        );
        def_builtin("__UTC_YEAR__", SymbolKind::Constant(now_utc.year()));
        def_builtin("__UTC_MONTH__", SymbolKind::Constant(now_utc.month() as i32));
        def_builtin("__UTC_DAY__", SymbolKind::Constant(now_utc.day() as i32));
        def_builtin("__UTC_HOUR__", SymbolKind::Constant(now_utc.hour() as i32));
        def_builtin("__UTC_MINUTE__", SymbolKind::Constant(now_utc.minute() as i32));
        def_builtin("__UTC_SECOND__", SymbolKind::Constant(now_utc.second() as i32));

        this
    }

    /// Resolves a possibly-local name against the current label scope.
    pub fn scoped_name(&self, name: &str) -> CompactString {
        match (&self.scope, name.starts_with('.')) {
            (Some(scope), true) => format_compact!("{scope}{name}"),
            _ => name.to_compact_string(),
        }
    }

    /// Scoped lookup, excluding purged symbols.
    pub fn find_valid(&self, name: &str) -> Option<&SymbolData> {
        let data = self.symbols.get(self.scoped_name(name).as_str())?;
        (!matches!(data.kind, SymbolKind::Deleted)).then_some(data)
    }

    /// Whether a slot for this name exists but was purged.
    pub fn is_purged(&self, name: &str) -> bool {
        matches!(
            self.symbols.get(self.scoped_name(name).as_str()),
            Some(SymbolData {
                kind: SymbolKind::Deleted,
                ..
            })
        )
    }

    /// Exact-name lookup of a string equate, for in-place expansion.
    pub fn find_equs(&self, name: &str) -> Option<Rc<str>> {
        match self.symbols.get(name) {
            Some(SymbolData {
                kind: SymbolKind::String(contents),
                ..
            }) => Some(Rc::clone(contents)),
            _ => None,
        }
    }

    pub fn find_macro(&self, name: &str) -> Option<MacroBody> {
        match self.symbols.get(name) {
            Some(SymbolData {
                kind: SymbolKind::Macro(body),
                ..
            }) => Some(body.clone()),
            _ => None,
        }
    }

    /// Iterates user-defined symbols in definition order.
    pub fn defs(&self) -> impl Iterator<Item = (&CompactString, &SymbolData)> {
        self.symbols
            .iter()
            .filter(|(_name, data)| !data.builtin && !matches!(data.kind, SymbolKind::Deleted))
    }

    fn define(
        &mut self,
        name: &str,
        kind: SymbolKind,
        redef: bool,
        exported: bool,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        let name = self.scoped_name(name);
        match self.symbols.get_mut(name.as_str()) {
            None => {
                self.symbols.insert(
                    name,
                    SymbolData {
                        kind,
                        builtin: false,
                        exported,
                    },
                );
            }
            Some(existing) if existing.builtin => {
                diagnostics::error(
                    loc,
                    format_args!("'{name}' is a built-in symbol and cannot be redefined"),
                    nb_errors_left,
                    options,
                );
            }
            Some(existing) => {
                let replaceable = redef
                    || matches!(existing.kind, SymbolKind::Deleted)
                    // Variables may be reassigned without `redef`.
                    || matches!(
                        (&existing.kind, &kind),
                        (SymbolKind::Variable(..), SymbolKind::Variable(..))
                    );
                if replaceable {
                    existing.kind = kind;
                    existing.exported |= exported;
                } else {
                    diagnostics::error(
                        loc,
                        format_args!("'{name}' already defined"),
                        nb_errors_left,
                        options,
                    );
                }
            }
        }
    }

    pub fn def_constant(
        &mut self,
        name: &str,
        value: i32,
        redef: bool,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        self.define(
            name,
            SymbolKind::Constant(value),
            redef,
            false,
            loc,
            nb_errors_left,
            options,
        );
    }

    pub fn def_variable(
        &mut self,
        name: &str,
        value: i32,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        self.define(
            name,
            SymbolKind::Variable(value),
            false,
            false,
            loc,
            nb_errors_left,
            options,
        );
    }

    pub fn def_string(
        &mut self,
        name: &str,
        contents: Rc<str>,
        redef: bool,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        self.define(
            name,
            SymbolKind::String(contents),
            redef,
            false,
            loc,
            nb_errors_left,
            options,
        );
    }

    pub fn def_macro(
        &mut self,
        name: &str,
        body: MacroBody,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        self.define(
            name,
            SymbolKind::Macro(body),
            false,
            false,
            loc,
            nb_errors_left,
            options,
        );
    }

    pub fn def_label(
        &mut self,
        name: &str,
        exported: bool,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        let scoped = self.scoped_name(name);
        self.define(
            &scoped,
            SymbolKind::Label,
            false,
            exported || options.export_all,
            loc,
            nb_errors_left,
            options,
        );
        if !name.contains('.') {
            self.scope = Some(scoped);
        }
    }

    pub fn purge(
        &mut self,
        name: &str,
        loc: Option<&Location>,
        nb_errors_left: &Cell<usize>,
        options: &Options,
    ) {
        let name = self.scoped_name(name);
        match self.symbols.get_mut(name.as_str()) {
            Some(data) if data.builtin => diagnostics::error(
                loc,
                format_args!("Built-in symbol '{name}' cannot be purged"),
                nb_errors_left,
                options,
            ),
            Some(data) => {
                data.kind = SymbolKind::Deleted;
                data.exported = false;
            }
            None => diagnostics::error(
                loc,
                format_args!("'{name}' not defined"),
                nb_errors_left,
                options,
            ),
        }
    }
}

impl SymbolData {
    /// The symbol's numeric value, if it is a numeric constant.
    pub fn get_number(&self, macro_args: Option<&MacroArgs>) -> Option<i32> {
        match &self.kind {
            SymbolKind::Constant(value) | SymbolKind::Variable(value) => Some(*value),
            SymbolKind::Narg => macro_args.map(|args| args.nb_args() as i32),
            _ => None,
        }
    }

    pub fn get_string(&self) -> Option<Rc<str>> {
        match &self.kind {
            SymbolKind::String(contents) => Some(Rc::clone(contents)),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            SymbolKind::Constant(..) => "constant",
            SymbolKind::Variable(..) => "variable",
            SymbolKind::String(..) => "string equate",
            SymbolKind::Macro(..) => "macro",
            SymbolKind::Label | SymbolKind::Narg => "label",
            SymbolKind::Deleted => "purged symbol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Symbols, Cell<usize>, Options) {
        (Symbols::new(), Cell::new(100), Options::default())
    }

    #[test]
    fn scoped_lookup() {
        let (mut symbols, nb, options) = fixture();
        symbols.def_label("Parent", false, None, &nb, &options);
        symbols.def_label(".child", false, None, &nb, &options);
        assert!(symbols.find_valid("Parent.child").is_some());
        assert!(symbols.find_valid(".child").is_some());
        assert_eq!(nb.get(), 100);
    }

    #[test]
    fn purge_leaves_placeholder() {
        let (mut symbols, nb, options) = fixture();
        symbols.def_constant("GONE", 1, false, None, &nb, &options);
        symbols.purge("GONE", None, &nb, &options);
        assert!(symbols.find_valid("GONE").is_none());
        assert!(symbols.is_purged("GONE"));
        assert!(!symbols.is_purged("NEVER_WAS"));
        // A purged name can be defined again.
        symbols.def_constant("GONE", 2, false, None, &nb, &options);
        assert!(symbols.find_valid("GONE").is_some());
        assert_eq!(nb.get(), 100);
    }

    #[test]
    fn constants_are_immutable_variables_not() {
        let (mut symbols, nb, options) = fixture();
        symbols.def_constant("K", 1, false, None, &nb, &options);
        symbols.def_constant("K", 2, false, None, &nb, &options);
        assert_eq!(nb.get(), 99); // One error.
        symbols.def_constant("K", 3, true, None, &nb, &options);
        assert_eq!(
            symbols.find_valid("K").unwrap().get_number(None),
            Some(3)
        );

        symbols.def_variable("V", 1, None, &nb, &options);
        symbols.def_variable("V", 2, None, &nb, &options);
        assert_eq!(
            symbols.find_valid("V").unwrap().get_number(None),
            Some(2)
        );
        assert_eq!(nb.get(), 99);
    }
}
