// Copyright (c) 2024 the Lantern contributors.
// SPDX-License-Identifier: AGPL-3.0-or-later
//
// This file is part of Lantern.
//
// Lantern is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Lantern is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with Lantern. If not, see <https://www.gnu.org/licenses/>.

//! The ordering authority for transactions and node destruction.

use std::sync::atomic::{AtomicU64, Ordering};

/// Issues the 64-bit sequence numbers that order transactions and node
/// destruction against each other.
///
/// Committed values are even and strictly increasing by construction; the low
/// bit is reserved to mark queue entries that are still staging. A staging
/// reservation taken via [Clock::stage] is therefore odd, and every sequence
/// committed after the reservation was taken is strictly greater than it.
///
/// Callers must take a staging reservation under the destination peer's lock,
/// at the point the staged entry is linked. This guarantees no committed
/// entry already in that queue carries a larger sequence.
#[derive(Debug)]
pub struct Clock {
    seq: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
        }
    }

    /// Reserves a staging slot: an odd value no later than any sequence
    /// committed from now on.
    pub fn stage(&self) -> u64 {
        self.seq.load(Ordering::Acquire) + 1
    }

    /// Commits the next transaction sequence: even, nonzero, strictly
    /// increasing.
    pub fn commit(&self) -> u64 {
        self.seq.fetch_add(2, Ordering::AcqRel) + 2
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Asserts that committed sequences are even, nonzero and strictly
    /// increasing.
    #[test]
    fn commit_monotonic() {
        let clock = Clock::new();
        let mut last = 0;
        for _ in 0..8 {
            let seq = clock.commit();
            assert_eq!(seq & 1, 0);
            assert!(seq > last);
            last = seq;
        }
    }

    /// Asserts that a staging reservation is odd and ordered before any
    /// later commit.
    #[test]
    fn stage_orders_before_commit() {
        let clock = Clock::new();
        clock.commit();
        let staged = clock.stage();
        assert_eq!(staged & 1, 1);
        assert!(clock.commit() > staged);
    }
}
