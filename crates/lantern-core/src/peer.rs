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

//! Peers: the endpoints of the bus.
//!
//! A peer owns its delivery queue, payload pool, quota state and id
//! allocator behind one mutex — the peer lock of the protocol. The handle
//! lookup maps live beside it in a read/write lock so lookups do not take
//! the peer lock at all; mutations hold both and bump the peer's sequence
//! count, which timestamp readers use to observe destruction commits
//! stably.
//!
//! At most two peer locks may be held at once, in the prescribed orders:
//! holder before owner, or sender before destination.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use lantern_types::{Error, HandleId, PeerId, Uid};

use crate::clock::Clock;
use crate::node::handle::{destroy_by_id, finalize_destruction, release_by_id, NodeId};
use crate::node::Handle;
use crate::pool::Pool;
use crate::queue::{EntryKind, Queue};
use crate::transaction::{Delivery, Message};
use crate::user::{QuotaTracker, User};

use crate::bus::Limits;

/// A writer-versioned counter in the style of a sequence lock.
///
/// Writers wrap mutations in [SeqCount::write], leaving the count odd for
/// the duration. Readers sample an even count, read, and retry if the count
/// moved.
#[derive(Debug)]
pub(crate) struct SeqCount(AtomicU64);

impl SeqCount {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Waits for a quiescent version and returns it.
    pub(crate) fn read(&self) -> u64 {
        loop {
            let seq = self.0.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            std::hint::spin_loop();
        }
    }

    /// True if a writer ran since `seq` was sampled.
    pub(crate) fn retry(&self, seq: u64) -> bool {
        self.0.load(Ordering::Acquire) != seq
    }

    /// Runs `f` between two version bumps.
    pub(crate) fn write<R>(&self, f: impl FnOnce() -> R) -> R {
        self.0.fetch_add(1, Ordering::AcqRel);
        let result = f();
        self.0.fetch_add(1, Ordering::AcqRel);
        result
    }
}

/// The handle lookup maps of one peer. Readable without the peer lock;
/// mutated only with the peer lock held, under the sequence count.
#[derive(Debug, Default)]
pub(crate) struct HandleMaps {
    pub(crate) by_id: BTreeMap<HandleId, Arc<Handle>>,
    pub(crate) by_node: BTreeMap<NodeId, Arc<Handle>>,
}

/// The state behind the peer lock.
#[derive(Debug)]
pub(crate) struct PeerInner {
    pub(crate) queue: Queue,
    pub(crate) pool: Pool,
    pub(crate) quota: QuotaTracker,
    /// Monotonic id allocator; ids are never reused.
    pub(crate) handle_ids: u64,
}

/// Everything a peer exposes to the handle and transaction machinery.
#[derive(Debug)]
pub(crate) struct PeerInfo {
    pub(crate) lock: Mutex<PeerInner>,
    pub(crate) maps: RwLock<HandleMaps>,
    pub(crate) seqcount: SeqCount,
    pub(crate) clock: Arc<Clock>,
    pub(crate) user: Arc<User>,
}

/// One endpoint of the bus.
pub struct Peer {
    id: PeerId,
    active: AtomicBool,
    /// Back-reference to our own allocation, handed out by [Peer::acquire].
    weak_self: std::sync::Weak<Peer>,
    info: PeerInfo,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Peer")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(
        id: PeerId,
        user: Arc<User>,
        clock: Arc<Clock>,
        limits: &Limits,
    ) -> Arc<Peer> {
        Arc::new_cyclic(|weak| Peer {
            id,
            active: AtomicBool::new(true),
            weak_self: weak.clone(),
            info: PeerInfo {
                lock: Mutex::new(PeerInner {
                    queue: Queue::new(),
                    pool: Pool::new(limits.pool_size),
                    quota: QuotaTracker::new(limits),
                    handle_ids: 0,
                }),
                maps: RwLock::new(HandleMaps::default()),
                seqcount: SeqCount::new(),
                clock,
                user,
            },
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn uid(&self) -> Uid {
        self.info.user.uid()
    }

    pub(crate) fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Pins the peer for an operation, or `None` once disconnect began.
    pub fn acquire(&self) -> Option<Arc<Peer>> {
        if self.active.load(Ordering::Acquire) {
            self.weak_self.upgrade()
        } else {
            None
        }
    }

    /// Releases one user reference on the handle with the given id.
    pub fn release_handle(&self, id: HandleId) -> Result<(), Error> {
        release_by_id(self, id)
    }

    /// Destroys the node behind the handle with the given id. Owner only.
    pub fn destroy_node(&self, id: HandleId) -> Result<(), Error> {
        destroy_by_id(self, id)
    }

    /// Dequeues the next committed delivery, if any.
    ///
    /// Messages settle their in-flight quota charge on this peer; a
    /// destruction notification drops the destroyed handle's remaining user
    /// references before it is surfaced.
    pub fn recv(&self) -> Option<Delivery> {
        let info = self.info();
        let mut inner = info.lock.lock();
        let key = inner.queue.peek()?.0;
        let (entry, _) = inner.queue.unlink(key)?;

        match entry.kind {
            EntryKind::Message {
                slice,
                ids,
                charge,
            } => {
                let PeerInner { pool, quota, .. } = &mut *inner;
                if let Some(charge) = charge {
                    quota.commit(&charge);
                    quota.deaccount(&charge);
                }
                let payload = match slice {
                    Some(slice) => {
                        let payload = slice.bytes().to_vec();
                        pool.release(slice);
                        payload
                    }
                    None => Vec::new(),
                };
                trace!("peer {:?} dequeued message", self.id);
                Some(Delivery::Message(Message { payload, ids }))
            }
            EntryKind::NodeDestroyed { handle } => {
                drop(inner);
                let id = handle.id();
                handle.drain_user_refs(self);
                trace!("peer {:?} dequeued destruction of {}", self.id, id);
                Some(Delivery::NodeDestroyed { id })
            }
        }
    }

    /// Disconnects the peer: cancels all outstanding references and drains
    /// the queue.
    ///
    /// The reset runs in two phases. Under the peer lock, the queue is
    /// flushed and both lookup maps are snapshotted and cleared in one
    /// sequence-count write, which is observationally an atomic removal of
    /// every handle. The snapshot is then walked without the lock: owned
    /// nodes run through the regular destruction commit, other handles get
    /// their user references drained against the still-pinned peer.
    pub fn disconnect(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("peer {:?} disconnecting", self.id);

        let info = self.info();
        let mut inner = info.lock.lock();
        {
            let PeerInner { queue, pool, quota, .. } = &mut *inner;
            queue.flush(pool, quota);
        }

        let snapshot = {
            let mut maps = info.maps.write();
            info.seqcount.write(|| std::mem::take(&mut *maps))
        };
        // release paths racing us skip map removal from here on
        for handle in snapshot.by_id.values() {
            handle.mark_unlinked();
        }
        drop(inner);

        for (_, handle) in snapshot.by_id {
            if handle.is_owner() {
                let inner = info.lock.lock();
                if handle.node().timestamp() == 0 {
                    let (guard, drained) = handle.commit_destruction(self, inner);
                    drop(guard);
                    finalize_destruction(drained);
                }
            } else {
                handle.drain_user_refs(self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bus::Bus;
    use crate::transaction::send;

    fn make_bus() -> Arc<Bus> {
        Bus::new(Limits::default())
    }

    /// Asserts that acquire pins an active peer and refuses a disconnected
    /// one.
    #[test]
    fn acquire_gate() {
        let bus = make_bus();
        let peer = bus.create_peer(Uid(0));
        assert!(peer.acquire().is_some());
        peer.disconnect();
        assert!(peer.acquire().is_none());
        // disconnecting twice is a no-op
        peer.disconnect();
    }

    /// Asserts that receiving on an empty queue yields nothing.
    #[test]
    fn recv_empty() {
        let bus = make_bus();
        let peer = bus.create_peer(Uid(0));
        assert!(peer.recv().is_none());
    }

    /// Asserts that disconnecting the owner destroys its nodes: the
    /// equivalent of destroying every owned node atomically.
    #[test]
    fn disconnect_destroys_owned_nodes() {
        let bus = make_bus();
        let a = bus.create_peer(Uid(0));
        let b = bus.create_peer(Uid(1));

        let ids = send(&a, &[], b"", &[HandleId::ALLOCATE_MANAGED.0]).unwrap();
        send(&a, &[b.clone()], b"", &[ids[0].0]).unwrap();
        let delivered = match b.recv().unwrap() {
            Delivery::Message(m) => m.ids[0],
            other => panic!("unexpected delivery: {:?}", other),
        };

        a.disconnect();

        // the destruction notification arrives with the committed timestamp
        match b.recv().unwrap() {
            Delivery::NodeDestroyed { id } => assert_eq!(id, delivered),
            other => panic!("unexpected delivery: {:?}", other),
        }
        // the notification dropped b's user reference
        assert_eq!(b.release_handle(delivered), Err(Error::NotFound));
    }

    /// Asserts that disconnecting a holder releases its handles so the
    /// owner's node loses the reference.
    #[test]
    fn disconnect_releases_held_handles() {
        let bus = make_bus();
        let a = bus.create_peer(Uid(0));
        let b = bus.create_peer(Uid(1));

        let ids = send(&a, &[], b"", &[HandleId::ALLOCATE_MANAGED.0]).unwrap();
        send(&a, &[b.clone()], b"", &[ids[0].0]).unwrap();
        let Some(Delivery::Message(m)) = b.recv() else {
            panic!("expected message");
        };
        assert!(m.ids[0].is_valid());

        b.disconnect();

        // a still owns the node and can destroy it normally
        a.destroy_node(ids[0]).unwrap();
        assert_eq!(a.destroy_node(ids[0]), Err(Error::NotFound));
    }
}
