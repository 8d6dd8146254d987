/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * SPDX-License-Identifier: MPL-2.0
 */

//! Convenience functionality shared between the executables.

use std::fmt::Display;

pub mod cli;

/// Pluralisation helper: `format!("{n} error{}", S::from(n))`.
#[derive(Debug, Clone, Copy)]
pub enum S {
    One,
    Other,
}
macro_rules! impl_from {
    ($t:ty) => {
        impl From<$t> for S {
            fn from(value: $t) -> Self {
                match value {
                    1 => Self::One,
                    _ => Self::Other,
                }
            }
        }
    };
}
impl_from!(u32);
impl_from!(u64);
impl_from!(usize);
impl Display for S {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Self::Other = self {
            f.write_str("s")?;
        }
        Ok(())
    }
}
