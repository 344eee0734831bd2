/*
 * Created on Tue Jan 09 2024
 *
 * This file is a part of Skymap
 * Skymap is a free and open-source embedded key/value store that maps a
 * single file into memory and indexes records in a concurrent hash trie,
 * written by Sayan Nandan ("the Author") with the vision to provide
 * predictable sub-microsecond lookups on the hot path of high-throughput
 * network services.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use std::{fmt, io};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
/// Store errors
pub enum StoreError {
    /// allocation failed and the backing file cannot grow any further
    NoSpace,
    /// no record matched the given key
    KeyAbsent,
    /// malformed arguments (bad geometry, zero-length record, bad table path)
    BadInput,
    /// the mapped image failed validation: bad magic/version/checksum, an
    /// out-of-range offset, or an unclean shutdown
    Corrupted,
    /// an optimistic read exhausted its retry budget
    Transient,
    /// a system-level I/O failure
    Io(io::Error),
}

impl PartialEq for StoreError {
    fn eq(&self, other: &Self) -> bool {
        use StoreError::*;
        match (self, other) {
            (NoSpace, NoSpace)
            | (KeyAbsent, KeyAbsent)
            | (BadInput, BadInput)
            | (Corrupted, Corrupted)
            | (Transient, Transient) => true,
            (Io(a), Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpace => write!(f, "out of space in backing file"),
            Self::KeyAbsent => write!(f, "no record for key"),
            Self::BadInput => write!(f, "bad input"),
            Self::Corrupted => write!(f, "mapped image failed validation"),
            Self::Transient => write!(f, "optimistic read retry budget exhausted"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
