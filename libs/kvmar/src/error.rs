// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad alignment, zero size, a range outside the parent, or conflicting flags.
    InvalidArgument,
    /// Permission escalation beyond the parent's grant, specific placement without the capability,
    /// or an attempt to touch the system image mapping.
    AccessDenied,
    /// The operation targets an unmapped address or a range that is not fully covered.
    NotFound,
    /// No spot satisfies the placement constraints, or the node arena is exhausted.
    NoMemory,
    /// The node is not alive (not yet activated, or already destroyed).
    BadState,
    /// Arithmetic overflow caught while computing a candidate address.
    Internal(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidArgument => f.write_str("invalid argument"),
            Error::AccessDenied => f.write_str("access denied"),
            Error::NotFound => f.write_str("address range is not mapped"),
            Error::NoMemory => f.write_str("no address range satisfies the request"),
            Error::BadState => f.write_str("address region is not alive"),
            Error::Internal(what) => f.write_fmt(format_args!("internal error: {what}")),
        }
    }
}

impl core::error::Error for Error {}
