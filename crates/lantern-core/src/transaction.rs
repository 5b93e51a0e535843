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

//! Send orchestration.
//!
//! A send resolves the sender's handles into a transfer, instantiates one
//! inflight context per destination, charges quota and reserves a staging
//! slot on every destination queue, installs all new handles under the
//! prescribed locks, and finally commits: one even sequence orders the
//! transaction against every concurrent node destruction, each inflight
//! writes its committed ids, and the staged entries relink to the committed
//! sequence, becoming visible to readers.
//!
//! Failures before the commit unwind completely: staged entries are
//! unlinked and discharged, and dropping the transfer and inflight contexts
//! releases every pinned handle.

use std::sync::Arc;

use tracing::{debug, trace};

use lantern_types::{Error, HandleId};

use crate::node::{Inflight, Transfer};
use crate::peer::{Peer, PeerInner};
use crate::queue::{EntryKey, EntryKind, QueueEntry};
use crate::user::Charge;

/// A delivered message: the payload bytes and the receiver-local ids of the
/// transferred handles, in the order the sender passed them. Destroyed
/// nodes deliver [HandleId::INVALID].
#[derive(Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub ids: Vec<HandleId>,
}

/// One dequeued item of a peer's queue.
#[derive(Debug)]
pub enum Delivery {
    Message(Message),
    /// A node this peer held a handle to was destroyed; the peer's user
    /// references on it are already dropped.
    NodeDestroyed { id: HandleId },
}

/// Unwinds staged entries of a send that failed before its commit.
fn unstage(dsts: &[Arc<Peer>], staged: &[EntryKey]) {
    for (dst, key) in dsts.iter().zip(staged) {
        let info = dst.info();
        let mut inner = info.lock.lock();
        if let Some((entry, _)) = inner.queue.unlink(*key) {
            let PeerInner { pool, quota, .. } = &mut *inner;
            if let EntryKind::Message { slice, charge, .. } = entry.kind {
                if let Some(slice) = slice {
                    pool.release(slice);
                }
                if let Some(charge) = charge {
                    quota.discharge(&charge);
                }
            }
        }
    }
}

/// Sends `payload` and the handles named by `ids` from `src` to every peer
/// in `dsts`.
///
/// An id carrying the allocate flag creates a fresh node owned by `src`;
/// ids naming destroyed or unknown handles are delivered as
/// [HandleId::INVALID] rather than failing, since destruction is
/// asynchronous. Destinations already shutting down simply miss the
/// message.
///
/// Returns the sender-side ids, in request order: the assigned id for each
/// allocation, the existing id otherwise.
pub fn send(
    src: &Arc<Peer>,
    dsts: &[Arc<Peer>],
    payload: &[u8],
    ids: &[u64],
) -> Result<Vec<HandleId>, Error> {
    let mut transfer = Transfer::new(ids.len());
    transfer.instantiate(src.info(), ids)?;

    let dsts: Vec<Arc<Peer>> = dsts.iter().filter_map(|dst| dst.acquire()).collect();

    let mut inflights = Vec::with_capacity(dsts.len());
    for dst in &dsts {
        let mut inflight = Inflight::new(ids.len());
        inflight.instantiate(dst.info(), src, &transfer)?;
        inflights.push(inflight);
    }

    // charge and reserve a staging slot on every destination, all-or-nothing
    let user = src.info().user.clone();
    let n_handles = ids.len() as u64;
    let mut staged: Vec<EntryKey> = Vec::with_capacity(dsts.len());
    for (i, dst) in dsts.iter().enumerate() {
        let info = dst.info();
        let mut inner = info.lock.lock();
        let PeerInner { queue, pool, quota, .. } = &mut *inner;

        if let Err(err) = quota.charge(&user, payload.len(), n_handles, 0) {
            drop(inner);
            unstage(&dsts[..i], &staged);
            debug!("send aborted: {}", err);
            return Err(err);
        }

        let mut slice = pool.alloc(payload.len());
        let written = pool.write(&mut slice, 0, payload);
        debug_assert!(written.is_ok());

        let charge = Charge {
            user: user.clone(),
            size: payload.len(),
            n_handles,
            n_fds: 0,
        };
        // the reservation must be taken under this lock so no committed
        // entry in the queue can order after it
        let seq = info.clock.stage();
        let (key, _) = queue.link(QueueEntry::message(seq, slice, charge));
        staged.push(key);
    }

    // install every new handle; sends without destinations still install
    // the sender's fresh nodes
    if dsts.is_empty() {
        transfer.install(src);
    }
    for (dst, inflight) in dsts.iter().zip(&mut inflights) {
        inflight.install(dst, src, &mut transfer);
    }

    // the committed sequence orders the whole transaction
    let seq = src.info().clock.commit();
    trace!("committing send at seq {}", seq);
    for ((dst, inflight), key) in dsts.iter().zip(&mut inflights).zip(&staged) {
        let delivered = inflight.commit(seq);
        let info = dst.info();
        let mut inner = info.lock.lock();
        if let Some(entry) = inner.queue.get_mut(*key) {
            if let EntryKind::Message { ids, .. } = &mut entry.kind {
                *ids = delivered;
            }
        }
        // gone only if the destination flushed in the meantime
        let _ = inner.queue.relink(*key, seq);
    }

    Ok(transfer.ids())
}
