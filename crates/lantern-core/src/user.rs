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

//! User objects and quota accounting.
//!
//! Each uid maps to one reference-counted [User] carrying the global budgets
//! for that user. Peers additionally keep local per-(peer, user) consumption
//! in a [QuotaTracker], indexed by the user's recycled small integer id.
//!
//! All budgets count *remaining* units. The charge discipline is shared by
//! every resource type: a user may take at most half of what is currently
//! left, counting their own share twice. Charging `c` with current share `s`
//! against remaining `r` requires `r - c >= s + c`, so after the charge the
//! remainder still covers everything the user has taken. This throttles a
//! single user under contention while leaving idle budgets mostly usable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use lantern_types::{Error, Uid};

use crate::bus::Limits;

/// A reference-counted user, looked up by uid through [Users].
#[derive(Debug)]
pub struct User {
    uid: Uid,
    /// Small recycled integer indexing per-peer stats arrays.
    id: usize,
    pub(crate) n_messages: AtomicU64,
    pub(crate) n_handles: AtomicU64,
    pub(crate) n_fds: AtomicU64,
    max_messages: u64,
    max_handles: u64,
    max_fds: u64,
    registry: Weak<UsersInner>,
}

impl User {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub(crate) fn slot(&self) -> usize {
        self.id
    }

    /// Remaining global message budget.
    pub fn messages_left(&self) -> u64 {
        self.n_messages.load(Ordering::Acquire)
    }

    /// Remaining global handle budget.
    pub fn handles_left(&self) -> u64 {
        self.n_handles.load(Ordering::Acquire)
    }
}

impl Drop for User {
    fn drop(&mut self) {
        debug_assert_eq!(self.n_messages.load(Ordering::Acquire), self.max_messages);
        debug_assert_eq!(self.n_handles.load(Ordering::Acquire), self.max_handles);
        debug_assert_eq!(self.n_fds.load(Ordering::Acquire), self.max_fds);

        if let Some(inner) = self.registry.upgrade() {
            let mut map = inner.map.lock();
            // Only drop the map entry if it still refers to this dead user;
            // a fresh user for the same uid may have replaced it already.
            if let Some(weak) = map.get(&self.uid) {
                if weak.upgrade().is_none() {
                    map.remove(&self.uid);
                }
            }
            drop(map);
            inner.ids.lock().free(self.id);
        }
    }
}

/// Allocator for the small per-user ids, reusing freed slots first.
#[derive(Debug, Default)]
struct IdPool {
    next: usize,
    free: Vec<usize>,
}

impl IdPool {
    fn alloc(&mut self) -> usize {
        if let Some(id) = self.free.pop() {
            id
        } else {
            let id = self.next;
            self.next += 1;
            id
        }
    }

    fn free(&mut self, id: usize) {
        self.free.push(id);
    }
}

#[derive(Debug)]
struct UsersInner {
    map: Mutex<HashMap<Uid, Weak<User>>>,
    ids: Mutex<IdPool>,
    limits: Limits,
}

/// The uid-keyed registry of [User] objects.
///
/// Entries hold weak references: a user lives exactly as long as someone
/// (usually a peer) keeps it referenced, and a lookup racing the teardown of
/// a dying user simply replaces the dead entry with a fresh one.
#[derive(Debug, Clone)]
pub struct Users {
    inner: Arc<UsersInner>,
}

impl Users {
    pub fn new(limits: Limits) -> Self {
        Self {
            inner: Arc::new(UsersInner {
                map: Mutex::new(HashMap::new()),
                ids: Mutex::new(IdPool::default()),
                limits,
            }),
        }
    }

    /// Finds the user object for `uid`, creating it if it does not exist or
    /// its previous incarnation is already being dropped.
    pub fn get(&self, uid: Uid) -> Arc<User> {
        let mut map = self.inner.map.lock();
        if let Some(weak) = map.get(&uid) {
            if let Some(user) = weak.upgrade() {
                return user;
            }
        }

        let limits = &self.inner.limits;
        let id = self.inner.ids.lock().alloc();
        trace!("creating user {:?} with slot {}", uid, id);
        let user = Arc::new(User {
            uid,
            id,
            n_messages: AtomicU64::new(limits.max_messages),
            n_handles: AtomicU64::new(limits.max_handles),
            n_fds: AtomicU64::new(limits.max_fds),
            max_messages: limits.max_messages,
            max_handles: limits.max_handles,
            max_fds: limits.max_fds,
            registry: Arc::downgrade(&self.inner),
        });
        map.insert(uid, Arc::downgrade(&user));
        user
    }
}

/// One message's worth of in-flight quota, discharged or committed when the
/// queue entry settles.
#[derive(Debug)]
pub(crate) struct Charge {
    pub(crate) user: Arc<User>,
    pub(crate) size: usize,
    pub(crate) n_handles: u64,
    pub(crate) n_fds: u64,
}

/// Per-(peer, user) consumption of one resource type. Unlike the budgets,
/// these count consumed units.
#[derive(Debug, Default, Clone)]
struct UserStats {
    n_allocated: usize,
    n_messages: u64,
    n_handles: u64,
    n_fds: u64,
}

/// Per-peer quota state: the local remaining budgets plus per-user shares.
#[derive(Debug)]
pub(crate) struct QuotaTracker {
    n_allocated: usize,
    n_messages: u64,
    n_handles: u64,
    n_fds: u64,
    stats: Vec<UserStats>,
}

/// Checks one resource type against the half-of-remaining rule and applies
/// the global side of the charge. The local side is applied by the caller so
/// a later failure can unwind without touching it.
fn charge_one(
    global: Option<&AtomicU64>,
    local: u64,
    share: u64,
    charge: u64,
) -> Result<(), Error> {
    if local < charge || local - charge < share.saturating_add(charge) {
        return Err(Error::QuotaExceeded);
    }

    if let Some(global) = global {
        let floor = share.saturating_add(charge.saturating_mul(2));
        global
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v >= floor).then(|| v - charge)
            })
            .map_err(|_| Error::QuotaExceeded)?;
    }

    Ok(())
}

impl QuotaTracker {
    pub(crate) fn new(limits: &Limits) -> Self {
        Self {
            n_allocated: limits.pool_size,
            n_messages: limits.max_messages,
            n_handles: limits.max_handles,
            n_fds: limits.max_fds,
            stats: Vec::new(),
        }
    }

    fn stats_mut(&mut self, slot: usize) -> &mut UserStats {
        if slot >= self.stats.len() {
            let n = ((slot + 8) & !7).max(slot + 1);
            self.stats.resize_with(n, Default::default);
        }
        &mut self.stats[slot]
    }

    /// Charges one message of `size` bytes carrying `n_handles` handles and
    /// `n_fds` file descriptors. Either all four resources are charged, or
    /// none are.
    pub(crate) fn charge(
        &mut self,
        user: &Arc<User>,
        size: usize,
        n_handles: u64,
        n_fds: u64,
    ) -> Result<(), Error> {
        let share = self.stats_mut(user.slot()).clone();

        // Message size has no global per-user budget; the local share rule
        // still applies.
        charge_one(
            None,
            self.n_allocated as u64,
            share.n_allocated as u64,
            size as u64,
        )?;
        charge_one(
            Some(&user.n_messages),
            self.n_messages,
            share.n_messages,
            1,
        )?;
        if let Err(err) = charge_one(
            Some(&user.n_handles),
            self.n_handles,
            share.n_handles,
            n_handles,
        ) {
            user.n_messages.fetch_add(1, Ordering::AcqRel);
            return Err(err);
        }
        if let Err(err) = charge_one(Some(&user.n_fds), self.n_fds, share.n_fds, n_fds) {
            user.n_handles.fetch_add(n_handles, Ordering::AcqRel);
            user.n_messages.fetch_add(1, Ordering::AcqRel);
            return Err(err);
        }

        self.n_allocated -= size;
        self.n_messages -= 1;
        self.n_handles -= n_handles;
        self.n_fds -= n_fds;
        let stats = self.stats_mut(user.slot());
        stats.n_allocated += size;
        stats.n_messages += 1;
        stats.n_handles += n_handles;
        stats.n_fds += n_fds;

        Ok(())
    }

    /// Reverts a charge that will never be delivered.
    pub(crate) fn discharge(&mut self, charge: &Charge) {
        self.n_allocated += charge.size;
        self.n_messages += 1;
        self.n_handles += charge.n_handles;
        self.n_fds += charge.n_fds;
        let stats = self.stats_mut(charge.user.slot());
        stats.n_allocated -= charge.size;
        stats.n_messages -= 1;
        stats.n_handles -= charge.n_handles;
        stats.n_fds -= charge.n_fds;
        charge.user.n_messages.fetch_add(1, Ordering::AcqRel);
        charge
            .user
            .n_handles
            .fetch_add(charge.n_handles, Ordering::AcqRel);
        charge.user.n_fds.fetch_add(charge.n_fds, Ordering::AcqRel);
    }

    /// Commits an in-flight charge at delivery. The sender's share is
    /// released; the delivered objects remain charged until they are
    /// destructed. Delivered file descriptors are accounted externally, so
    /// their in-flight budget is returned in full.
    pub(crate) fn commit(&mut self, charge: &Charge) {
        let stats = self.stats_mut(charge.user.slot());
        stats.n_allocated -= charge.size;
        stats.n_messages -= 1;
        stats.n_handles -= charge.n_handles;
        stats.n_fds -= charge.n_fds;

        charge.user.n_fds.fetch_add(charge.n_fds, Ordering::AcqRel);
    }

    /// De-accounts the delivered objects of a committed charge once they are
    /// destructed. The receive path settles the payload slice immediately and
    /// closes the handle budgets at delivery, so this follows a commit as
    /// soon as the entry is consumed.
    pub(crate) fn deaccount(&mut self, charge: &Charge) {
        self.n_allocated += charge.size;
        self.n_messages += 1;
        self.n_handles += charge.n_handles;
        self.n_fds += charge.n_fds;
        charge.user.n_messages.fetch_add(1, Ordering::AcqRel);
        charge
            .user
            .n_handles
            .fetch_add(charge.n_handles, Ordering::AcqRel);
    }
}
