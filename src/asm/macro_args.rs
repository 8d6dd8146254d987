use std::{cell::Cell, rc::Rc};

/// The unparsed arguments of the macro invocation being expanded.
///
/// Arguments are shared strings, since their expansions may still be alive after
/// `shift` discards the argument, or after the macro context itself is exited.
#[derive(Debug)]
pub struct MacroArgs {
    args: Vec<Rc<str>>,
    shift: Cell<usize>,
}

impl MacroArgs {
    pub fn new(args: Vec<Rc<str>>) -> Self {
        Self {
            args,
            shift: Cell::new(0),
        }
    }

    /// The `idx`-th (1-based) argument, accounting for any prior `shift`.
    pub fn arg(&self, idx: usize) -> Option<Rc<str>> {
        if idx == 0 {
            return None;
        }
        self.args.get(self.shift.get() + idx - 1).map(Rc::clone)
    }

    /// How many arguments are currently reachable.
    pub fn nb_args(&self) -> usize {
        self.args.len() - self.shift.get()
    }

    /// All reachable arguments, joined by commas (this is what `\#` expands to).
    pub fn combined_args(&self) -> Rc<str> {
        let mut combined = String::new();
        for (i, arg) in self.args[self.shift.get()..].iter().enumerate() {
            if i != 0 {
                combined.push(',');
            }
            combined.push_str(arg);
        }
        combined.into()
    }

    /// Shifts arguments left (`amount` may be negative to shift back right).
    pub fn shift_by(&self, amount: i32) -> Result<(), ()> {
        let shift = self.shift.get() as i64 + i64::from(amount);
        if (0..=self.args.len() as i64).contains(&shift) {
            self.shift.set(shift as usize);
            Ok(())
        } else {
            Err(())
        }
    }
}
