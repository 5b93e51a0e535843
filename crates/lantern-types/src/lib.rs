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

use std::fmt::{Display, Formatter, Result as FmtResult};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

bitflags! {
    /// Flag bits carried in the low bits of a handle id.
    ///
    /// Managed ids are assigned by the bus; the allocate bit is only ever set
    /// by a caller requesting a fresh node during a send.
    #[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
    pub struct NodeFlags: u64 {
        const MANAGED = 1 << 0;
        const ALLOCATE = 1 << 1;
    }
}

/// A peer-local capability id naming a node.
///
/// Ids are assigned monotonically per peer and are never reused. The two low
/// bits carry [NodeFlags]; the all-ones value is reserved as [HandleId::INVALID].
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct HandleId(pub u64);

impl HandleId {
    /// The sentinel id: never names a handle, reported for destroyed nodes.
    pub const INVALID: Self = Self(u64::MAX);

    /// The id a caller passes to request allocation of a fresh managed node.
    pub const ALLOCATE_MANAGED: Self =
        Self(NodeFlags::ALLOCATE.bits() | NodeFlags::MANAGED.bits());

    /// Packs a peer-local counter value into a managed handle id.
    pub fn from_counter(counter: u64) -> Self {
        Self((counter << 2) | NodeFlags::MANAGED.bits())
    }

    /// The flag bits of this id.
    pub fn flags(self) -> NodeFlags {
        NodeFlags::from_bits_truncate(self.0)
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// True iff this id requests allocation of a new node rather than naming
    /// an existing handle.
    pub fn is_allocation_request(self) -> bool {
        self.flags().contains(NodeFlags::ALLOCATE)
    }
}

impl Display for HandleId {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        if self.is_valid() {
            write!(fmt, "{:#x}", self.0)
        } else {
            write!(fmt, "<invalid>")
        }
    }
}

/// Identifier of a peer on the bus.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerId(pub u32);

/// Identifier of a user owning peers and quota.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Deserialize, Serialize)]
pub struct Uid(pub u32);

/// Errors surfaced by the bus core.
///
/// Destroyed nodes are not an error: sends deliver [HandleId::INVALID] for
/// them instead, since destruction is asynchronous and callers must tolerate
/// it anyway.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The id does not refer to any handle on this peer.
    #[error("no handle with this id on the peer")]
    NotFound,
    /// The caller does not hold a user reference on this handle.
    #[error("no user reference held on this handle")]
    Stale,
    /// Destruction of this node is already underway.
    #[error("node destruction already in progress")]
    InProgress,
    /// Only the owner of a node may destroy it.
    #[error("operation reserved to the node owner")]
    Permission,
    /// Malformed id or request.
    #[error("malformed id or request")]
    InvalidArgument,
    /// A budget check failed; no partial accounting was applied.
    #[error("user quota exceeded")]
    QuotaExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Asserts that managed ids survive counter packing and carry the
    /// managed flag.
    #[test]
    fn id_packing() {
        let tests = &[1u64, 2, 1000, u64::MAX >> 2];
        for counter in tests.iter() {
            let id = HandleId::from_counter(*counter);
            assert!(id.flags().contains(NodeFlags::MANAGED));
            assert!(!id.is_allocation_request());
            assert_eq!(id.0 >> 2, *counter);
        }
    }

    /// Asserts that the allocation request id carries exactly the allocate
    /// and managed bits.
    #[test]
    fn allocation_request() {
        let id = HandleId::ALLOCATE_MANAGED;
        assert!(id.is_allocation_request());
        assert_eq!(id.flags(), NodeFlags::ALLOCATE | NodeFlags::MANAGED);
    }

    /// Asserts that the invalid sentinel is not a valid id.
    #[test]
    fn invalid_sentinel() {
        assert!(!HandleId::INVALID.is_valid());
        assert!(HandleId::from_counter(1).is_valid());
    }
}
