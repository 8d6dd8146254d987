/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * SPDX-License-Identifier: MPL-2.0
 */

use clap::ColorChoice;

pub fn apply_color_choice(choice: ColorChoice) {
    match choice {
        ColorChoice::Auto => yansi::whenever(yansi::Condition::TTY_AND_COLOR),
        ColorChoice::Always => yansi::enable(),
        ColorChoice::Never => yansi::disable(),
    }
}

/// Parses a number, accepting the same prefixes as assembly source does.
pub fn parse_number<T: TryFrom<u32>>(arg: &str) -> Result<T, String> {
    let (digits, radix) = if let Some(rest) = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")).or_else(|| arg.strip_prefix('$')) {
        (rest, 16)
    } else if let Some(rest) = arg.strip_prefix("0o").or_else(|| arg.strip_prefix("0O")).or_else(|| arg.strip_prefix('&')) {
        (rest, 8)
    } else if let Some(rest) = arg.strip_prefix("0b").or_else(|| arg.strip_prefix("0B")).or_else(|| arg.strip_prefix('%')) {
        (rest, 2)
    } else {
        (arg, 10)
    };
    let value = u32::from_str_radix(digits, radix).map_err(|err| err.to_string())?;
    T::try_from(value).map_err(|_err| format!("{value} is out of range"))
}
