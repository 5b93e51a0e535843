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

//! Transaction-wide handle contexts.
//!
//! A send builds one [Transfer] on the sender, resolving the requested ids
//! and allocating fresh nodes, and one [Inflight] per destination,
//! instantiated from the transfer. Handles stay pinned in these contexts
//! until the transaction commits; dropping a context releases whatever pins
//! a commit did not consume, which is also the whole rollback story for
//! failed sends.

use std::sync::Arc;

use tracing::trace;

use lantern_types::{Error, HandleId};

use crate::peer::{Peer, PeerInfo, PeerInner};

use super::batch::{HandleBatch, Slot};
use super::handle::{find_by_id, find_by_node, Handle};

/// True if the node behind `handle` is owned by `peer`. Fresh private
/// handles count as owned by the sender about to attach their owner.
fn owned_by(handle: &Arc<Handle>, peer: &Arc<Peer>) -> bool {
    match handle.node().owner_peer() {
        Some(owner) => Arc::ptr_eq(&owner, peer),
        None => !handle.is_public(),
    }
}

/// The sender-side context of one transaction.
#[derive(Debug)]
pub struct Transfer {
    batch: HandleBatch,
    /// Entries requesting allocation of a fresh node.
    n_new: usize,
}

impl Transfer {
    pub fn new(n_entries: usize) -> Self {
        Self {
            batch: HandleBatch::new(n_entries),
            n_new: 0,
        }
    }

    pub fn n_entries(&self) -> usize {
        self.batch.n_entries()
    }

    /// Imports the requested ids and resolves each to a pinned handle.
    ///
    /// An id carrying the allocate flag creates a fresh private node and
    /// owner handle; nothing is attached or installed yet, the allocation
    /// just makes sure the later commit cannot fail. Any other id is looked
    /// up on the sender; destroyed or unknown ids resolve to an empty slot,
    /// since destruction is asynchronous and callers must tolerate it.
    ///
    /// Single-shot per transfer.
    pub(crate) fn instantiate(
        &mut self,
        src_info: &PeerInfo,
        ids: &[u64],
    ) -> Result<(), Error> {
        self.batch.import(ids)?;

        let n_new = &mut self.n_new;
        self.batch.resolve_ids(|raw| {
            let id = HandleId(raw);
            if id.is_allocation_request() {
                // only allocation of managed nodes is supported; the upper
                // flag bits are reserved
                if raw != HandleId::ALLOCATE_MANAGED.0 {
                    return Err(Error::InvalidArgument);
                }
                *n_new += 1;
                Ok(Some(Handle::new_node()))
            } else {
                let handle = find_by_id(src_info, id).filter(|h| h.acquire());
                Ok(handle)
            }
        })
    }

    /// Attaches and installs the freshly allocated nodes on the sender and
    /// hands their first user reference to it. Requires the sender's lock.
    pub(crate) fn install_locked(
        &mut self,
        src: &Arc<Peer>,
        info: &PeerInfo,
        inner: &mut PeerInner,
    ) {
        let n_new = &mut self.n_new;
        for slot in self.batch.iter_mut() {
            if *n_new == 0 {
                break;
            }
            let handle = match slot {
                Slot::Handle(Some(h)) if !h.is_public() => h.clone(),
                _ => continue,
            };
            *n_new -= 1;

            // a fresh node is disjoint, so neither attach nor install can
            // lose a race here
            let attached = handle.attach_locked(src, inner);
            debug_assert!(attached);
            let installed = handle.install_locked(info, inner);
            debug_assert!(installed.as_ref().is_some_and(|h| Arc::ptr_eq(h, &handle)));

            // the attach reference becomes the sender's user reference
            *slot = Slot::Done(handle.release_to_user(0));
        }
        debug_assert_eq!(*n_new, 0);
    }

    /// Locking wrapper around [Transfer::install_locked] for sends without
    /// destinations.
    pub(crate) fn install(&mut self, src: &Arc<Peer>) {
        if self.n_new == 0 {
            return;
        }
        let info = src.info();
        let mut inner = info.lock.lock();
        self.install_locked(src, info, &mut inner);
    }

    /// The ids to report back to the sender, in request order: the assigned
    /// id for allocations, the existing id for transferred handles, the
    /// invalid id for unresolved slots.
    pub(crate) fn ids(&self) -> Vec<HandleId> {
        self.batch
            .iter()
            .map(|slot| match slot {
                Slot::Done(id) => *id,
                Slot::Handle(Some(h)) => h.id(),
                _ => HandleId::INVALID,
            })
            .collect()
    }

}

/// The per-destination context of one transaction.
#[derive(Debug)]
pub struct Inflight {
    batch: HandleBatch,
    /// Fresh destination-side handles needing attach.
    n_new: usize,
    /// The subset of `n_new` whose node is owned by the sender, attachable
    /// under the sender's lock in one go.
    n_new_local: usize,
}

impl Inflight {
    pub fn new(n_entries: usize) -> Self {
        Self {
            batch: HandleBatch::new(n_entries),
            n_new: 0,
            n_new_local: 0,
        }
    }

    /// Instantiates the destination's handles from the sender's transfer:
    /// an existing handle for the same node is acquired, anything else gets
    /// a fresh private handle bound to the node.
    ///
    /// Single-shot per inflight; entry counts must match the transfer.
    pub(crate) fn instantiate(
        &mut self,
        dst_info: &PeerInfo,
        src: &Arc<Peer>,
        transfer: &Transfer,
    ) -> Result<(), Error> {
        if self.batch.n_entries() != transfer.batch.n_entries() {
            return Err(Error::InvalidArgument);
        }

        for slot in transfer.batch.iter() {
            let handle = match slot {
                Slot::Handle(Some(from)) => {
                    match find_by_node(dst_info, from).filter(|h| h.acquire()) {
                        Some(existing) => Some(existing),
                        None => {
                            let fresh = Handle::new_copy(from);
                            self.n_new += 1;
                            if owned_by(from, src) {
                                self.n_new_local += 1;
                            }
                            Some(fresh)
                        }
                    }
                }
                _ => None,
            };
            self.batch.push_pinned(handle);
        }

        trace!(
            "instantiated inflight: {} new, {} local",
            self.n_new,
            self.n_new_local
        );
        Ok(())
    }

    /// Installs the destination's handles, in up to three phases.
    ///
    /// Under the sender's lock, the transfer's fresh nodes are installed and
    /// every fresh destination handle whose owner is the sender is attached.
    /// Remaining fresh handles attach one by one under their owner's lock.
    /// Finally, under the destination's lock, every handle without an id is
    /// installed; losing an install race swaps the slot over to the winner
    /// and releases the loser.
    pub(crate) fn install(
        &mut self,
        dst: &Arc<Peer>,
        src: &Arc<Peer>,
        transfer: &mut Transfer,
    ) {
        let Inflight {
            batch,
            n_new,
            n_new_local,
        } = self;
        let mut n_installs = *n_new;

        if transfer.n_new > 0 || *n_new_local > 0 {
            let info = src.info();
            let mut inner = info.lock.lock();

            transfer.install_locked(src, info, &mut inner);

            for slot in batch.iter_mut() {
                if *n_new_local == 0 {
                    break;
                }
                let handle = match slot {
                    Slot::Handle(Some(h)) if !h.is_public() && owned_by(h, src) => h.clone(),
                    _ => continue,
                };
                *n_new -= 1;
                *n_new_local -= 1;
                if !handle.attach_locked(dst, &mut inner) {
                    *slot = Slot::Handle(None);
                }
            }
            debug_assert_eq!(*n_new_local, 0);
        }

        if *n_new > 0 {
            for slot in batch.iter_mut() {
                if *n_new == 0 {
                    break;
                }
                let handle = match slot {
                    Slot::Handle(Some(h)) if !h.is_public() => h.clone(),
                    _ => continue,
                };
                *n_new -= 1;
                if !handle.attach(dst) {
                    // the node went away; the slot reports the invalid id
                    *slot = Slot::Handle(None);
                }
            }
            debug_assert_eq!(*n_new, 0);
        }

        if n_installs > 0 {
            let info = dst.info();
            let mut inner = info.lock.lock();
            for slot in batch.iter_mut() {
                if n_installs == 0 {
                    break;
                }
                let handle = match slot {
                    Slot::Handle(Some(h)) if !h.has_id() => h.clone(),
                    _ => continue,
                };
                if !handle.is_public() {
                    continue;
                }
                n_installs -= 1;

                match handle.install_locked(info, &mut inner) {
                    Some(winner) if Arc::ptr_eq(&winner, &handle) => {}
                    other => {
                        // drop the destination lock before releasing the
                        // loser; its release may chase the owner
                        drop(inner);
                        handle.release();
                        *slot = Slot::Handle(other);
                        inner = info.lock.lock();
                    }
                }
            }
        }
    }

    /// Commits the inflight context at the transaction sequence `seq`,
    /// converting every surviving pin into a user reference and recording
    /// the ids to report. Nodes destroyed at or before `seq` report the
    /// invalid id.
    pub(crate) fn commit(&mut self, seq: u64) -> Vec<HandleId> {
        for slot in self.batch.iter_mut() {
            let id = match slot {
                Slot::Handle(Some(handle)) => handle.release_to_user(seq),
                _ => HandleId::INVALID,
            };
            *slot = Slot::Done(id);
        }
        self.batch.consume();
        self.batch.ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::{Bus, Limits};
    use lantern_types::{NodeFlags, Uid};

    fn make_peers(n: u32) -> Vec<Arc<Peer>> {
        let bus = Bus::new(Limits::default());
        (0..n).map(|i| bus.create_peer(Uid(i))).collect()
    }

    /// Asserts that an allocation request creates a fresh private node and
    /// is counted in `n_new`.
    #[test]
    fn instantiate_allocates() {
        let peers = make_peers(1);
        let mut transfer = Transfer::new(1);
        transfer
            .instantiate(peers[0].info(), &[HandleId::ALLOCATE_MANAGED.0])
            .unwrap();
        assert_eq!(transfer.n_new, 1);
        let mut iter = transfer.batch.iter();
        match iter.next().unwrap() {
            Slot::Handle(Some(h)) => {
                assert!(h.is_owner());
                assert!(!h.is_public());
            }
            _ => panic!("expected a pinned handle"),
        }
    }

    /// Asserts that unknown allocation flags are rejected.
    #[test]
    fn instantiate_rejects_bad_flags() {
        let peers = make_peers(1);
        let raw = NodeFlags::ALLOCATE.bits() | (1 << 5);
        let mut transfer = Transfer::new(1);
        assert_eq!(
            transfer.instantiate(peers[0].info(), &[raw]),
            Err(Error::InvalidArgument)
        );
    }

    /// Asserts that missing ids silently resolve to empty slots.
    #[test]
    fn instantiate_tolerates_missing() {
        let peers = make_peers(1);
        let mut transfer = Transfer::new(1);
        transfer
            .instantiate(peers[0].info(), &[HandleId::from_counter(99).0])
            .unwrap();
        assert!(matches!(
            transfer.batch.iter().next().unwrap(),
            Slot::Handle(None)
        ));
        assert_eq!(transfer.ids(), vec![HandleId::INVALID]);
    }

    /// Asserts that installing a transfer reports the fresh node's id to
    /// the sender and grants it a user reference.
    #[test]
    fn transfer_install_grants_user_ref() {
        let peers = make_peers(1);
        let mut transfer = Transfer::new(1);
        transfer
            .instantiate(peers[0].info(), &[HandleId::ALLOCATE_MANAGED.0])
            .unwrap();
        transfer.install(&peers[0]);

        let ids = transfer.ids();
        assert!(ids[0].is_valid());
        let handle = find_by_id(peers[0].info(), ids[0]).unwrap();
        assert!(handle.is_owner());
        assert_eq!(handle.user_refs(), 1);
        assert_eq!(handle.inflight_refs(), 1);
    }

    /// Asserts that an inflight reuses the destination's existing handle
    /// for a node and clones a fresh one otherwise, counting sender-owned
    /// nodes as local.
    #[test]
    fn inflight_reuse_and_clone() {
        let peers = make_peers(2);

        // give the sender an installed node
        let mut transfer = Transfer::new(1);
        transfer
            .instantiate(peers[0].info(), &[HandleId::ALLOCATE_MANAGED.0])
            .unwrap();
        transfer.install(&peers[0]);
        let sender_id = transfer.ids()[0];
        drop(transfer);

        // first transfer to the destination clones a fresh local handle
        let mut transfer = Transfer::new(1);
        transfer
            .instantiate(peers[0].info(), &[sender_id.0])
            .unwrap();
        let mut inflight = Inflight::new(1);
        inflight
            .instantiate(peers[1].info(), &peers[0], &transfer)
            .unwrap();
        assert_eq!(inflight.n_new, 1);
        assert_eq!(inflight.n_new_local, 1);
        inflight.install(&peers[1], &peers[0], &mut transfer);
        let ids = inflight.commit(0);
        assert!(ids[0].is_valid());
        drop(transfer);

        // the second transfer finds and reuses that handle
        let mut transfer = Transfer::new(1);
        transfer
            .instantiate(peers[0].info(), &[sender_id.0])
            .unwrap();
        let mut inflight = Inflight::new(1);
        inflight
            .instantiate(peers[1].info(), &peers[0], &transfer)
            .unwrap();
        assert_eq!(inflight.n_new, 0);
        inflight.install(&peers[1], &peers[0], &mut transfer);
        let again = inflight.commit(0);
        assert_eq!(again[0], ids[0]);
    }
}
