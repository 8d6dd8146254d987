//! Format specifications for `{…}` interpolations.
//!
//! A spec looks like `[+| ][#][-][0][<width>][.<frac>][q<precision>]<kind>`, e.g.
//! `{08x:SYM}` or `{.3qf:VALUE}`. With no spec at all, numbers print as `$`-prefixed
//! uppercase hexadecimal and strings print verbatim.

use std::fmt::Write;

use compact_str::CompactString;

#[derive(Debug)]
pub struct FormatSpec {
    force_sign: Option<char>,
    exact: bool,
    align_left: bool,
    pad_with_zeros: bool,
    width: usize,
    frac: Option<usize>,
    precision: Option<u8>,
    kind: FormatKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, displaydoc::Display)]
pub enum FormatKind {
    /// default
    Default,
    /// signed number
    Signed,
    /// unsigned number
    Unsigned,
    /// lower-hex number
    LowerHex,
    /// upper-hex number
    UpperHex,
    /// binary number
    Binary,
    /// octal number
    Octal,
    /// fixed-point number
    FixedPoint,
    /// string
    String,
}

#[derive(Debug, displaydoc::Display)]
pub enum FormatError {
    /// unexpected character '{0}' in format spec
    UnexpectedChar(char),
    /// missing print type at the end of the format spec
    MissingKind,
    /// {flag_name} is incompatible with {what}
    IncompatibleFlag {
        flag_name: &'static str,
        what: &'static str,
    },
    /// missing number after 'q'
    MissingPrecision,
    /// fractional width cannot be more than 255
    FracWidthOver255,
    /// fixed-point precision cannot be 0
    FixPointZero,
    /// fixed-point precision cannot be more than 31
    FixPointPrecOver31,
    /// a {sym_kind} cannot be formatted as a {fmt_kind}
    BadKind {
        sym_kind: &'static str,
        fmt_kind: FormatKind,
    },
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            force_sign: None,
            exact: true, // The default numeric format prints its '$' prefix.
            align_left: false,
            pad_with_zeros: false,
            width: 0,
            frac: None,
            precision: None,
            kind: FormatKind::Default,
        }
    }
}

impl FormatKind {
    /// The base prefix the `#` flag selects, or `None` if the flag is invalid
    /// for this kind. Fixed-point and string formatting accept the flag without
    /// printing a prefix (it selects the `q` suffix and escaping instead).
    fn exact_prefix(self) -> Option<&'static str> {
        match self {
            Self::Default | Self::LowerHex | Self::UpperHex => Some("$"),
            Self::Binary => Some("%"),
            Self::Octal => Some("&"),
            Self::FixedPoint | Self::String => Some(""),
            Self::Signed | Self::Unsigned => None,
        }
    }
}

impl FormatSpec {
    pub fn parse(src: &str) -> Result<Self, FormatError> {
        let mut chars = src.chars().peekable();

        let force_sign = chars.next_if(|ch| matches!(ch, '+' | ' '));
        let exact = chars.next_if_eq(&'#').is_some();
        let align_left = chars.next_if_eq(&'-').is_some();
        let pad_with_zeros = chars.next_if_eq(&'0').is_some();

        fn read_decimal(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<usize> {
            let mut value = chars.peek().and_then(|ch| ch.to_digit(10))? as usize;
            chars.next();
            while let Some(digit) = chars.peek().and_then(|ch| ch.to_digit(10)) {
                chars.next();
                value = value * 10 + digit as usize;
            }
            Some(value)
        }

        let width = read_decimal(&mut chars).unwrap_or(0);
        let frac = chars
            .next_if_eq(&'.')
            .map(|_dot| read_decimal(&mut chars).unwrap_or(0));
        let precision = chars
            .next_if_eq(&'q')
            .map(|_q| read_decimal(&mut chars).ok_or(FormatError::MissingPrecision))
            .transpose()?;

        let kind = match chars.next() {
            Some('d') => FormatKind::Signed,
            Some('u') => FormatKind::Unsigned,
            Some('x') => FormatKind::LowerHex,
            Some('X') => FormatKind::UpperHex,
            Some('b') => FormatKind::Binary,
            Some('o') => FormatKind::Octal,
            Some('f') => FormatKind::FixedPoint,
            Some('s') => FormatKind::String,
            Some(unexpected) => return Err(FormatError::UnexpectedChar(unexpected)),
            None => return Err(FormatError::MissingKind),
        };
        if let Some(unexpected) = chars.next() {
            return Err(FormatError::UnexpectedChar(unexpected));
        }

        if kind != FormatKind::FixedPoint {
            if frac.is_some() {
                return Err(FormatError::IncompatibleFlag {
                    flag_name: "a fractional width",
                    what: "this print type",
                });
            }
            if precision.is_some() {
                return Err(FormatError::IncompatibleFlag {
                    flag_name: "a fixed-point precision",
                    what: "this print type",
                });
            }
        }
        if kind == FormatKind::String && (force_sign.is_some() || pad_with_zeros) {
            return Err(FormatError::IncompatibleFlag {
                flag_name: "a numeric flag",
                what: "string formatting",
            });
        }
        if exact && kind.exact_prefix().is_none() {
            return Err(FormatError::IncompatibleFlag {
                flag_name: "an exact prefix",
                what: "this print type",
            });
        }
        if pad_with_zeros && align_left {
            return Err(FormatError::IncompatibleFlag {
                flag_name: "zero padding",
                what: "left alignment",
            });
        }
        match precision {
            Some(0) => return Err(FormatError::FixPointZero),
            Some(32..) => return Err(FormatError::FixPointPrecOver31),
            _ => {}
        }
        if let Some(256..) = frac {
            return Err(FormatError::FracWidthOver255);
        }

        Ok(Self {
            force_sign,
            exact,
            align_left,
            pad_with_zeros,
            width,
            frac,
            precision: precision.map(|prec| prec as u8),
            kind,
        })
    }

    pub fn write_number(
        &self,
        value: u32,
        default_precision: u8,
        buf: &mut CompactString,
    ) -> Result<(), FormatError> {
        let mut body = CompactString::default();
        match self.kind {
            FormatKind::Signed => write!(body, "{}", value as i32),
            FormatKind::Unsigned => write!(body, "{value}"),
            FormatKind::LowerHex => write!(body, "{value:x}"),
            FormatKind::Default | FormatKind::UpperHex => write!(body, "{value:X}"),
            FormatKind::Binary => write!(body, "{value:b}"),
            FormatKind::Octal => write!(body, "{value:o}"),
            FormatKind::FixedPoint => {
                let precision = self.precision.unwrap_or(default_precision);
                let scaled = value as i32 as f64 / f64::from(1u32 << precision);
                write!(body, "{:.*}", self.frac.unwrap_or(5), scaled).unwrap();
                if self.exact {
                    write!(body, "q{precision}")
                } else {
                    Ok(())
                }
            }
            FormatKind::String => {
                return Err(FormatError::BadKind {
                    sym_kind: "numeric symbol",
                    fmt_kind: self.kind,
                })
            }
        }
        .unwrap();

        // The sign of negative values is part of the digits themselves.
        let sign = match self.force_sign {
            Some(sign) if !body.starts_with('-') => sign.to_string(),
            _ => String::new(),
        };
        let prefix = if self.exact {
            self.kind.exact_prefix().unwrap_or("")
        } else {
            ""
        };

        let used = sign.len() + prefix.len() + body.len();
        let padding = self.width.saturating_sub(used);
        if self.pad_with_zeros {
            // Zero padding goes between the prefix and the digits.
            write!(buf, "{sign}{prefix}{:0>padding$}{body}", "").unwrap();
        } else if self.align_left {
            write!(buf, "{sign}{prefix}{body}{:padding$}", "").unwrap();
        } else {
            write!(buf, "{:padding$}{sign}{prefix}{body}", "").unwrap();
        }
        Ok(())
    }

    pub fn write_str(&self, string: &str, buf: &mut CompactString) -> Result<(), FormatError> {
        if !matches!(self.kind, FormatKind::String | FormatKind::Default) {
            return Err(FormatError::BadKind {
                sym_kind: "string symbol",
                fmt_kind: self.kind,
            });
        }

        let body = if self.exact && self.kind == FormatKind::String {
            string.escape_default().to_string()
        } else {
            string.to_string()
        };
        let padding = self.width.saturating_sub(body.chars().count());
        if self.align_left {
            write!(buf, "{body}{:padding$}", "").unwrap();
        } else {
            write!(buf, "{:padding$}{body}", "").unwrap();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(spec: &str, value: u32) -> CompactString {
        let mut buf = CompactString::default();
        FormatSpec::parse(spec)
            .unwrap()
            .write_number(value, 16, &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn default_is_dollar_hex() {
        let mut buf = CompactString::default();
        FormatSpec::default().write_number(0x2A, 16, &mut buf).unwrap();
        assert_eq!(buf, "$2A");
    }

    #[test]
    fn numeric_kinds() {
        assert_eq!(format("d", -5i32 as u32), "-5");
        assert_eq!(format("u", 42), "42");
        assert_eq!(format("x", 0xBEEF), "beef");
        assert_eq!(format("#X", 0xBEEF), "$BEEF");
        assert_eq!(format("b", 5), "101");
        assert_eq!(format("o", 8), "10");
    }

    #[test]
    fn widths_and_padding() {
        assert_eq!(format("8x", 0xFF), "      ff");
        assert_eq!(format("08x", 0xFF), "000000ff");
        assert_eq!(format("#08x", 0xFF), "$00000ff");
        assert_eq!(format("-4d", 7), "7   ");
        assert_eq!(format("+d", 7), "+7");
    }

    #[test]
    fn fixed_point() {
        assert_eq!(format(".3f", 0x0001_8000), "1.500");
        assert_eq!(format(".1q8f", 0x180), "1.5");
    }

    #[test]
    fn string_formatting() {
        let mut buf = CompactString::default();
        FormatSpec::parse("10s")
            .unwrap()
            .write_str("hello", &mut buf)
            .unwrap();
        assert_eq!(buf, "     hello");
    }

    #[test]
    fn rejected_specs() {
        assert!(matches!(FormatSpec::parse(""), Err(FormatError::MissingKind)));
        assert!(matches!(
            FormatSpec::parse("y"),
            Err(FormatError::UnexpectedChar('y'))
        ));
        assert!(matches!(
            FormatSpec::parse("q0f"),
            Err(FormatError::FixPointZero)
        ));
        assert!(matches!(
            FormatSpec::parse(".3d"),
            Err(FormatError::IncompatibleFlag { .. })
        ));
        // The exact-prefix flag has nothing to print for plain decimal kinds.
        assert!(matches!(
            FormatSpec::parse("#d"),
            Err(FormatError::IncompatibleFlag { .. })
        ));
        assert!(matches!(
            FormatSpec::parse("#u"),
            Err(FormatError::IncompatibleFlag { .. })
        ));
        assert!(matches!(
            FormatSpec::parse("-0d"),
            Err(FormatError::IncompatibleFlag { .. })
        ));
    }
}
