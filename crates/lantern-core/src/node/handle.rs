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

//! Nodes and the handles referring to them.
//!
//! Callers only ever deal with handles; the node behind them is a dumb
//! aggregate holding the list of attached handles and the destruction
//! timestamp. Exactly one handle per node is the owner; the owner's peer
//! anchors the node, and every other handle links a holder peer to it.
//!
//! A handle carries two disjoint reference counts. The memory count is the
//! `Arc` it lives in. The logical count `n_inflight` tracks live references
//! taking part in the protocol: `-1` while the handle is private, `1` from
//! attach onwards, incremented per transaction pin. `n_user` counts the
//! subset of inflight references that have been reported to the user; every
//! user reference retains one backing inflight reference, so
//! `n_user <= n_inflight` holds whenever the handle is public.
//!
//! Attach and the node handle list are protected by the node owner's peer
//! lock. Install and the lookup maps are protected by the holder's peer
//! lock. A holder may drop all backlinks to itself at any time, which is why
//! releasing a handle on one peer may have to chase the owner afterwards,
//! with the holder lock dropped in between.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::trace;

use lantern_types::{Error, HandleId};

use crate::peer::{Peer, PeerInfo, PeerInner};
use crate::queue::{EntryKey, QueueEntry};

/// Globally unique node identity; keys the per-peer by-node lookups.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The shared object a set of handles refers to.
///
/// The timestamp is `0` while the node is alive, `1` while a destruction is
/// committing, and the even committed destruction sequence afterwards.
pub struct Node {
    pub(crate) id: NodeId,
    timestamp: AtomicU64,
    /// The owner handle. Upgradeable as long as the node can be reached
    /// through it: the handle list and the owner's lookup maps keep it
    /// alive until destruction unlinks it.
    owner: OnceLock<Weak<Handle>>,
    /// All attached handles; the node keeps each of them alive until it is
    /// detached. Mutated only with the owner peer's lock held.
    list: Mutex<Vec<Arc<Handle>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Node")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp())
            .finish_non_exhaustive()
    }
}

impl Node {
    pub(crate) fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    fn owner_handle(&self) -> Option<Arc<Handle>> {
        self.owner.get()?.upgrade()
    }

    /// Pins the peer owning this node, or `None` if the owner is shutting
    /// down or destruction already committed.
    pub(crate) fn owner_peer(&self) -> Option<Arc<Peer>> {
        let owner = self.owner_handle()?;
        let peer = owner.raw_holder()?;
        peer.acquire()
    }

    /// The owner's peer without the liveness gate; timestamp readers only
    /// need its sequence count, which stays valid through shutdown.
    fn owner_peer_raw(&self) -> Option<Arc<Peer>> {
        self.owner_handle()?.raw_holder()
    }

    fn detach(&self, handle: &Handle) {
        self.list
            .lock()
            .retain(|h| !std::ptr::eq(Arc::as_ptr(h), handle as *const Handle));
    }

    fn take_list(&self) -> Vec<Arc<Handle>> {
        std::mem::take(&mut *self.list.lock())
    }

    fn list_is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

/// A per-peer capability referring to a [Node].
#[derive(Debug)]
pub struct Handle {
    node: Arc<Node>,
    is_owner: bool,
    /// Back-reference to our own allocation, for linking this handle into
    /// node lists and lookup maps.
    weak_self: Weak<Handle>,
    /// Peer-local id bits; [HandleId::INVALID] until installed.
    id: AtomicU64,
    /// The peer holding this handle. Weak: the handle remembers its holder
    /// but does not keep it alive.
    holder: RwLock<Option<Weak<Peer>>>,
    /// Whether the handle sits in its holder's lookup maps. Cleared early
    /// by a peer reset so release paths skip map removal.
    linked: AtomicBool,
    /// Logical live references; `-1` while private.
    n_inflight: AtomicI64,
    /// User-visible references; each retains one inflight reference.
    n_user: AtomicU64,
}

impl Handle {
    fn init(node: Arc<Node>, is_owner: bool, weak_self: Weak<Handle>) -> Self {
        Self {
            node,
            is_owner,
            weak_self,
            id: AtomicU64::new(HandleId::INVALID.0),
            holder: RwLock::new(None),
            linked: AtomicBool::new(false),
            n_inflight: AtomicI64::new(-1),
            n_user: AtomicU64::new(0),
        }
    }

    /// Allocates a fresh node together with its owner handle. Nothing but
    /// the returned handle has access to the node until it is installed.
    pub fn new_node() -> Arc<Handle> {
        let node = Arc::new(Node {
            id: NodeId::next(),
            timestamp: AtomicU64::new(0),
            owner: OnceLock::new(),
            list: Mutex::new(Vec::new()),
        });
        Arc::new_cyclic(|weak| {
            let _ = node.owner.set(weak.clone());
            Handle::init(node.clone(), true, weak.clone())
        })
    }

    /// Allocates a new detached handle for the node of `existing`.
    pub fn new_copy(existing: &Arc<Handle>) -> Arc<Handle> {
        let node = existing.node.clone();
        Arc::new_cyclic(|weak| Handle::init(node, false, weak.clone()))
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// A handle is public once it was attached to its node. It never leaves
    /// that state again.
    pub fn is_public(&self) -> bool {
        self.n_inflight.load(Ordering::Acquire) >= 0
    }

    pub fn id(&self) -> HandleId {
        HandleId(self.id.load(Ordering::Acquire))
    }

    pub fn has_id(&self) -> bool {
        self.id().is_valid()
    }

    /// Current number of user-visible references.
    pub fn user_refs(&self) -> u64 {
        self.n_user.load(Ordering::Acquire)
    }

    /// Current number of logical live references; `-1` while private.
    pub fn inflight_refs(&self) -> i64 {
        self.n_inflight.load(Ordering::Acquire)
    }

    fn raw_holder(&self) -> Option<Arc<Peer>> {
        self.holder.read().as_ref()?.upgrade()
    }

    /// Pins the holder of this handle, or `None` if it is shutting down.
    pub(crate) fn holder_peer(&self) -> Option<Arc<Peer>> {
        self.raw_holder()?.acquire()
    }

    /// Tries to take an inflight reference.
    ///
    /// Fails if the count already decayed to zero: the handle is then
    /// guaranteed to be unlinked, or getting unlinked with the holder lock
    /// held, and the caller should create a fresh handle instead. Owner
    /// handles always succeed; their validity is decided at commit time
    /// against the node timestamp, and this merely keeps them the unique
    /// handle of the owning peer.
    #[must_use]
    pub(crate) fn acquire(&self) -> bool {
        debug_assert!(self.is_public());
        let acquired = self
            .n_inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v != 0).then(|| v + 1)
            })
            .is_ok();
        if !acquired {
            if !self.is_owner {
                return false;
            }
            self.n_inflight.fetch_add(1, Ordering::AcqRel);
        }
        true
    }

    /// Releases an inflight reference, chasing the holder if this might be
    /// the last one.
    pub(crate) fn release(&self) {
        debug_assert!(self.is_public());
        if self
            .n_inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > 1).then(|| v - 1)
            })
            .is_ok()
        {
            return;
        }

        // we may be the last reference; pin and lock the holder
        if let Some(peer) = self.holder_peer() {
            self.release_last(&peer);
        } else {
            // holder is already shutting down; its reset drains the handle
            self.n_inflight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Same as [Handle::release], for callers that already pinned the
    /// holder of this handle.
    pub(crate) fn release_pinned(&self, peer: &Peer) {
        debug_assert!(self.is_public());
        if self
            .n_inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > 1).then(|| v - 1)
            })
            .is_ok()
        {
            return;
        }
        self.release_last(peer);
    }

    fn release_last(&self, peer: &Peer) {
        if self.is_owner {
            self.release_owner(peer);
        } else {
            self.release_holder(peer);
        }
    }

    fn release_owner(&self, peer: &Peer) {
        debug_assert!(self.is_owner);
        let info = peer.info();
        let mut inner = info.lock.lock();
        if self.n_inflight.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        debug_assert_eq!(self.user_refs(), 0);

        let mut drained = None;
        if self.node.timestamp() == 0 {
            self.node.detach(self);
            if self.node.list_is_empty() {
                let (guard, d) = self.commit_destruction(peer, inner);
                inner = guard;
                drained = Some(d);
            }
        }
        drop(inner);

        if let Some(drained) = drained {
            finalize_destruction(drained);
        }
    }

    fn release_holder(&self, peer: &Peer) {
        debug_assert!(!self.is_owner);
        let info = peer.info();
        let inner = info.lock.lock();
        if self.n_inflight.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        debug_assert_eq!(self.user_refs(), 0);

        let mut dropped = false;
        if self.raw_holder().is_some() {
            *self.holder.write() = None;
            self.unlink_maps(info);
            dropped = true;
        }
        drop(inner);

        // bail out if node destruction detached us concurrently
        if !dropped {
            return;
        }

        // the holder lock is gone; now detach from the node under the owner
        let Some(owner) = self.node.owner_peer() else {
            return;
        };
        let owner_info = owner.info();
        let mut owner_inner = owner_info.lock.lock();
        let mut drained = None;
        if self.node.timestamp() == 0 {
            self.node.detach(self);
            if self.node.list_is_empty() {
                if let Some(owner_handle) = self.node.owner_handle() {
                    let (guard, d) = owner_handle.commit_destruction(&owner, owner_inner);
                    owner_inner = guard;
                    drained = Some(d);
                }
            }
        }
        drop(owner_inner);

        if let Some(drained) = drained {
            finalize_destruction(drained);
        }
    }

    /// Attaches a private handle to its node for `holder`.
    ///
    /// The caller must hold the lock of the node's owner peer; for the owner
    /// handle itself the node is still fully disjoint and the holder's own
    /// lock qualifies. Fails if destruction already committed, in which case
    /// neither the handle nor the holder is touched.
    ///
    /// On success the handle is public and holds one inflight reference.
    pub(crate) fn attach_locked(
        &self,
        holder: &Arc<Peer>,
        _owner_inner: &mut PeerInner,
    ) -> bool {
        if self.is_public() || self.raw_holder().is_some() {
            debug_assert!(false, "handle already attached");
            return true;
        }

        // Destruction resets the owner's holder once it commits; attaches
        // after that must behave as if the node never existed. The owner
        // itself bootstraps a node nobody else can reach yet.
        let owner_live = self
            .node
            .owner_handle()
            .is_some_and(|owner| owner.raw_holder().is_some());
        if !owner_live && !self.is_owner {
            return false;
        }
        let Some(this) = self.weak_self.upgrade() else {
            return false;
        };

        self.n_inflight.store(1, Ordering::Release);
        *self.holder.write() = Some(Arc::downgrade(holder));
        self.node.list.lock().push(this);
        trace!("attached handle to node {:?}", self.node.id);
        true
    }

    /// Attach for third-party handles: pins and locks the owner of the
    /// underlying node (or the holder itself when attaching the owner).
    pub(crate) fn attach(&self, holder: &Arc<Peer>) -> bool {
        if self.is_owner {
            let mut inner = holder.info().lock.lock();
            self.attach_locked(holder, &mut inner)
        } else {
            let Some(owner) = self.node.owner_peer() else {
                return false;
            };
            let mut inner = owner.info().lock.lock();
            self.attach_locked(holder, &mut inner)
        }
    }

    /// Installs an attached handle into its holder: allocates the id and
    /// links the lookup maps. The caller must hold the holder's lock.
    ///
    /// Returns `None` if the node was destroyed between attach and install.
    /// If another handle for the same node won the install race, that handle
    /// is returned instead, already acquired and referenced; the caller
    /// should release and drop its own handle and switch over.
    pub(crate) fn install_locked(
        &self,
        info: &PeerInfo,
        inner: &mut PeerInner,
    ) -> Option<Arc<Handle>> {
        debug_assert!(self.is_public());
        let this = self.weak_self.upgrade()?;
        if self.has_id() {
            return Some(this);
        }

        // destruction between attach and install already detached us
        self.raw_holder()?;

        let mut maps = info.maps.write();
        if let Some(existing) = maps.by_node.get(&self.node.id) {
            // Someone raced us installing a handle for this node. Take the
            // winner, acquired, and let the caller switch over.
            let existing = existing.clone();
            debug_assert!(existing.has_id());
            let acquired = existing.acquire();
            debug_assert!(acquired);
            return Some(existing);
        }

        inner.handle_ids += 1;
        let id = HandleId::from_counter(inner.handle_ids);
        self.id.store(id.0, Ordering::Release);
        info.seqcount.write(|| {
            maps.by_id.insert(id, this.clone());
            maps.by_node.insert(self.node.id, this.clone());
        });
        self.linked.store(true, Ordering::Release);
        trace!("installed handle {} for node {:?}", id, self.node.id);
        Some(this)
    }

    /// Records that a peer reset disconnected the lookup maps wholesale;
    /// release paths skip map removal from here on.
    pub(crate) fn mark_unlinked(&self) {
        self.linked.store(false, Ordering::Release);
    }

    /// Removes the handle from its holder's lookup maps, unless a peer
    /// reset already disconnected them.
    fn unlink_maps(&self, info: &PeerInfo) {
        if !self.linked.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut maps = info.maps.write();
        info.seqcount.write(|| {
            maps.by_id.remove(&self.id());
            maps.by_node.remove(&self.node.id);
        });
    }

    /// The handle id as ordered against a transaction at `timestamp`: the
    /// real id if the node destruction, if any, committed after the
    /// transaction, the invalid id otherwise.
    ///
    /// A `timestamp` of 0 always orders before any destruction.
    pub(crate) fn inorder_id(&self, timestamp: u64) -> HandleId {
        debug_assert!(self.has_id());

        let ts = match self.node.owner_peer_raw() {
            // The owner is reset only after the destruction timestamp was
            // committed, so the plain read is stable here.
            None => self.node.timestamp(),
            Some(peer) => {
                let info = peer.info();
                loop {
                    let seq = info.seqcount.read();
                    let ts = self.node.timestamp();
                    if !info.seqcount.retry(seq) {
                        break ts;
                    }
                }
            }
        };

        if ts > 0 && ts & 1 == 0 && ts <= timestamp {
            HandleId::INVALID
        } else {
            self.id()
        }
    }

    /// Converts the caller's inflight reference into a user reference,
    /// ordered against the transaction at `seq`.
    ///
    /// If the node was destroyed before the transaction, the inflight
    /// reference is released instead and the invalid id is returned.
    pub(crate) fn release_to_user(&self, seq: u64) -> HandleId {
        let id = self.inorder_id(seq);
        if id == HandleId::INVALID {
            self.release();
        } else {
            // the inflight reference stays as the user reference's backing
            self.n_user.fetch_add(1, Ordering::AcqRel);
        }
        id
    }

    /// Drops every user reference at once, releasing their backing inflight
    /// references. Used by destruction notifications and peer reset.
    pub(crate) fn drain_user_refs(&self, peer: &Peer) {
        let users = self.n_user.swap(0, Ordering::AcqRel);
        for _ in 0..users {
            self.release_pinned(peer);
        }
    }

    /// Commits destruction of this owner handle's node.
    ///
    /// Entered with the owner peer's lock held and the timestamp at 0; the
    /// lock is dropped while holders are notified, so attaches racing in
    /// refill the handle list and are drained in further rounds. On return
    /// the committed timestamp is published under the sequence count, the
    /// owner is unlinked, and the drained handles await
    /// [finalize_destruction].
    pub(crate) fn commit_destruction<'a>(
        &self,
        owner_peer: &'a Peer,
        mut inner: MutexGuard<'a, PeerInner>,
    ) -> (MutexGuard<'a, PeerInner>, Vec<DrainedHandle>) {
        debug_assert!(self.is_owner);
        debug_assert_eq!(self.node.timestamp(), 0);

        // 1 keeps concurrent destroyers out; async readers treat it as
        // not-yet-destroyed
        self.node.timestamp.store(1, Ordering::Release);

        // the owner takes no part in the destruction broadcast
        self.node.detach(self);

        let mut drained = Vec::new();
        loop {
            let batch = self.node.take_list();
            if batch.is_empty() {
                break;
            }
            drop(inner);
            for handle in batch {
                let note = stage_destruction_note(&handle);
                drained.push(DrainedHandle { handle, note });
            }
            inner = owner_peer.info().lock.lock();
        }

        let info = owner_peer.info();
        let ts = info.clock.commit();
        info.seqcount
            .write(|| self.node.timestamp.store(ts, Ordering::Release));
        trace!("committed destruction of node {:?} at {}", self.node.id, ts);

        *self.holder.write() = None;
        self.unlink_maps(info);

        (inner, drained)
    }
}

/// A handle drained from a destroyed node, together with the staged
/// notification awaiting the committed timestamp.
pub(crate) struct DrainedHandle {
    handle: Arc<Handle>,
    note: Option<(Weak<Peer>, EntryKey)>,
}

/// Stages a destruction notification on the holder of `handle`. Skipped if
/// the holder is already shutting down; its reset drains the handle anyway.
fn stage_destruction_note(handle: &Arc<Handle>) -> Option<(Weak<Peer>, EntryKey)> {
    let peer = handle.holder_peer()?;
    let info = peer.info();
    let mut inner = info.lock.lock();
    let seq = info.clock.stage();
    let (key, _) = inner.queue.link(QueueEntry::destruction(seq, handle.clone()));
    Some((Arc::downgrade(&peer), key))
}

/// Finishes a committed destruction without any lock held: detaches every
/// drained handle from its holder and exposes the staged notifications at
/// the committed destruction time.
pub(crate) fn finalize_destruction(drained: Vec<DrainedHandle>) {
    for DrainedHandle { handle, note } in drained {
        if let Some(peer) = handle.holder_peer() {
            let info = peer.info();
            let inner = info.lock.lock();
            if handle.raw_holder().is_some() {
                *handle.holder.write() = None;
                handle.unlink_maps(info);
            }
            drop(inner);
        }

        if let Some((weak, key)) = note {
            if let Some(peer) = weak.upgrade() {
                let ts = handle.node().timestamp();
                let mut inner = peer.info().lock.lock();
                // gone already if the peer flushed in between
                let _ = inner.queue.relink(key, ts);
            }
        }
    }
}

/// Finds the handle with the given peer-local id.
///
/// The optimistic pass does not block on a racing writer: a positive lookup
/// is authoritative regardless, since ids are never reused. Only a lookup
/// that cannot get the read side immediately falls back to the blocking
/// reader for an authoritative miss.
pub(crate) fn find_by_id(info: &PeerInfo, id: HandleId) -> Option<Arc<Handle>> {
    let maps = match info.maps.try_read() {
        Some(maps) => maps,
        None => info.maps.read(),
    };
    maps.by_id.get(&id).cloned()
}

/// Finds the peer's handle for the node of `existing`, if any.
pub(crate) fn find_by_node(info: &PeerInfo, existing: &Arc<Handle>) -> Option<Arc<Handle>> {
    let maps = match info.maps.try_read() {
        Some(maps) => maps,
        None => info.maps.read(),
    };
    maps.by_node.get(&existing.node.id).cloned()
}

/// Releases one user reference on the handle with the given id.
pub fn release_by_id(peer: &Peer, id: HandleId) -> Result<(), Error> {
    let info = peer.info();
    let handle = find_by_id(info, id).ok_or(Error::NotFound)?;
    handle
        .n_user
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
        .map_err(|_| Error::Stale)?;
    handle.release_pinned(peer);
    Ok(())
}

/// Destroys the node behind the handle with the given id. Reserved to the
/// node owner; destruction is never rolled back.
pub fn destroy_by_id(peer: &Peer, id: HandleId) -> Result<(), Error> {
    let info = peer.info();
    let handle = find_by_id(info, id).ok_or(Error::NotFound)?;

    let inner = info.lock.lock();
    if !handle.is_owner() {
        return Err(Error::Permission);
    }
    if handle.node().timestamp() != 0 {
        return Err(Error::InProgress);
    }
    let (inner, drained) = handle.commit_destruction(peer, inner);
    drop(inner);

    finalize_destruction(drained);
    Ok(())
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

    fn install(handle: &Arc<Handle>, peer: &Arc<Peer>) -> Arc<Handle> {
        let info = peer.info();
        let mut inner = info.lock.lock();
        handle.install_locked(info, &mut inner).unwrap()
    }

    /// Asserts that a fresh node's owner handle starts private and without
    /// an id.
    #[test]
    fn new_node_is_private() {
        let owner = Handle::new_node();
        assert!(owner.is_owner());
        assert!(!owner.is_public());
        assert!(!owner.has_id());
        assert_eq!(owner.inflight_refs(), -1);
    }

    /// Asserts that attach makes a handle public with one inflight
    /// reference and install assigns a managed id.
    #[test]
    fn attach_install_lifecycle() {
        let peers = make_peers(1);
        let owner = Handle::new_node();
        assert!(owner.attach(&peers[0]));
        assert!(owner.is_public());
        assert_eq!(owner.inflight_refs(), 1);
        assert!(!owner.has_id());

        let installed = install(&owner, &peers[0]);
        assert!(Arc::ptr_eq(&installed, &owner));
        assert!(owner.has_id());
        assert!(owner.id().flags().contains(NodeFlags::MANAGED));
    }

    /// Asserts that installed handles are found by id and by node, and that
    /// the lookup returns the same object.
    #[test]
    fn lookup_roundtrip() {
        let peers = make_peers(1);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let by_id = find_by_id(peers[0].info(), owner.id()).unwrap();
        assert!(Arc::ptr_eq(&by_id, &owner));
        let by_node = find_by_node(peers[0].info(), &owner).unwrap();
        assert!(Arc::ptr_eq(&by_node, &owner));
    }

    /// Asserts that peer-local ids are strictly increasing.
    #[test]
    fn ids_are_monotonic() {
        let peers = make_peers(1);
        let mut last = 0;
        for _ in 0..4 {
            let owner = Handle::new_node();
            owner.attach(&peers[0]);
            install(&owner, &peers[0]);
            assert!(owner.id().0 > last);
            last = owner.id().0;
        }
    }

    /// Asserts that a second handle for the same node loses the install
    /// race and the caller is handed the acquired winner.
    #[test]
    fn install_conflict_returns_winner() {
        let peers = make_peers(2);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let first = Handle::new_copy(&owner);
        assert!(first.attach(&peers[1]));
        let first = install(&first, &peers[1]);

        let second = Handle::new_copy(&owner);
        assert!(second.attach(&peers[1]));
        let winner = install(&second, &peers[1]);
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(!Arc::ptr_eq(&winner, &second));
        assert_eq!(first.inflight_refs(), 2);

        // the loser is released and dropped, the winner keeps both refs
        second.release();
        winner.release();
        assert_eq!(first.inflight_refs(), 1);
    }

    /// Asserts that acquire fails on a released non-owner handle but always
    /// succeeds on the owner.
    #[test]
    fn acquire_after_release() {
        let peers = make_peers(2);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let handle = Handle::new_copy(&owner);
        handle.attach(&peers[1]);
        install(&handle, &peers[1]);

        assert!(handle.acquire());
        handle.release();
        handle.release();
        assert_eq!(handle.inflight_refs(), 0);
        assert!(!handle.acquire());

        // the owner resurrects from zero; validity is checked at commit
        assert!(owner.acquire());
        owner.release();
    }

    /// Asserts that releasing the last reference of a non-owner handle
    /// unlinks it from its holder without destroying the node.
    #[test]
    fn release_last_unlinks_holder() {
        let peers = make_peers(2);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let handle = Handle::new_copy(&owner);
        handle.attach(&peers[1]);
        install(&handle, &peers[1]);
        let id = handle.id();

        handle.release();
        assert!(find_by_id(peers[1].info(), id).is_none());
        assert_eq!(owner.node().timestamp(), 0);
        assert!(find_by_id(peers[0].info(), owner.id()).is_some());
    }

    /// Asserts that releasing the owner's last reference with an empty
    /// handle list commits destruction and unlinks the owner.
    #[test]
    fn owner_release_destroys_node() {
        let peers = make_peers(1);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);
        let id = owner.id();

        owner.release();
        let ts = owner.node().timestamp();
        assert!(ts > 0 && ts & 1 == 0);
        assert!(find_by_id(peers[0].info(), id).is_none());
    }

    /// Asserts that attaching to a destroyed node fails.
    #[test]
    fn attach_after_destroy_fails() {
        let peers = make_peers(2);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let copy = Handle::new_copy(&owner);
        owner.release();

        assert!(!copy.attach(&peers[1]));
        assert!(!copy.is_public());
    }

    /// Asserts the timestamp ordering rule: a handle is invalid for a
    /// transaction iff the destruction committed at or before it.
    #[test]
    fn inorder_id_ordering() {
        let peers = make_peers(2);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let handle = Handle::new_copy(&owner);
        handle.attach(&peers[1]);
        install(&handle, &peers[1]);
        let id = handle.id();

        assert_eq!(handle.inorder_id(0), id);
        assert_eq!(handle.inorder_id(u64::MAX - 1), id);

        destroy_by_id(&peers[0], owner.id()).unwrap();
        let ts = handle.node().timestamp();
        assert_eq!(handle.inorder_id(ts), HandleId::INVALID);
        assert_eq!(handle.inorder_id(ts + 2), HandleId::INVALID);
        assert_eq!(handle.inorder_id(ts - 2), id);

        handle.release();
    }

    /// Asserts that releasing an id without a user reference yields Stale
    /// and changes nothing.
    #[test]
    fn stale_release_is_idempotent() {
        let peers = make_peers(1);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        assert_eq!(release_by_id(&peers[0], owner.id()), Err(Error::Stale));
        assert_eq!(owner.inflight_refs(), 1);
        assert!(find_by_id(peers[0].info(), owner.id()).is_some());

        owner.release();
    }

    /// Asserts that user references are granted and released one backing
    /// inflight reference at a time.
    #[test]
    fn user_refs_are_backed() {
        let peers = make_peers(2);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let handle = Handle::new_copy(&owner);
        handle.attach(&peers[1]);
        install(&handle, &peers[1]);
        assert!(handle.acquire());

        // both inflight references become user references
        assert_eq!(handle.release_to_user(0), handle.id());
        assert_eq!(handle.release_to_user(0), handle.id());
        assert_eq!(handle.user_refs(), 2);
        assert_eq!(handle.inflight_refs(), 2);
        assert!(handle.user_refs() <= handle.inflight_refs() as u64);

        let id = handle.id();
        release_by_id(&peers[1], id).unwrap();
        assert_eq!(handle.user_refs(), 1);
        release_by_id(&peers[1], id).unwrap();
        assert_eq!(release_by_id(&peers[1], id), Err(Error::NotFound));
    }

    /// Asserts that destroy is reserved to the owner and refuses a node
    /// whose destruction is already underway.
    #[test]
    fn destroy_permissions() {
        let peers = make_peers(2);
        let owner = Handle::new_node();
        owner.attach(&peers[0]);
        install(&owner, &peers[0]);

        let handle = Handle::new_copy(&owner);
        handle.attach(&peers[1]);
        install(&handle, &peers[1]);

        assert_eq!(
            destroy_by_id(&peers[1], handle.id()),
            Err(Error::Permission)
        );

        owner.node().timestamp.store(1, Ordering::Release);
        assert_eq!(destroy_by_id(&peers[0], owner.id()), Err(Error::InProgress));
        owner.node().timestamp.store(0, Ordering::Release);

        destroy_by_id(&peers[0], owner.id()).unwrap();
        assert_eq!(destroy_by_id(&peers[0], owner.id()), Err(Error::NotFound));

        owner.release();
        handle.release();
    }
}
