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

//! Chunked handle containers for transactions.
//!
//! A send may carry large handle sets; batches store them in fixed-size
//! chunks so no single allocation scales with the transaction. A slot starts
//! as a raw requested id, is resolved to a pinned handle during
//! instantiation, and ends as the committed id reported to the receiver.

use std::sync::Arc;

use lantern_types::{Error, HandleId};

use super::handle::Handle;

const BATCH_SIZE: usize = 64;

/// One position in a batch, tracking its place in the transaction lifecycle.
#[derive(Debug)]
pub(crate) enum Slot {
    /// A raw id as requested by the sender; may carry the allocate flag.
    Id(u64),
    /// A resolved handle, pinned with an inflight reference, or nothing if
    /// the requested id named a destroyed or unknown handle.
    Handle(Option<Arc<Handle>>),
    /// The committed result: a valid id, or [HandleId::INVALID] if the node
    /// was destroyed before the transaction.
    Done(HandleId),
}

/// A bounded list of handle slots stored in chunks.
#[derive(Debug)]
pub(crate) struct HandleBatch {
    chunks: Vec<Vec<Slot>>,
    n_entries: usize,
    /// Number of slots currently holding pinned handles. Pins are released
    /// when the batch is dropped, unless a commit consumed them first.
    n_pinned: usize,
}

impl HandleBatch {
    pub(crate) fn new(n_entries: usize) -> Self {
        let n_chunks = n_entries.div_ceil(BATCH_SIZE);
        let chunks = (0..n_chunks)
            .map(|i| Vec::with_capacity((n_entries - i * BATCH_SIZE).min(BATCH_SIZE)))
            .collect();
        Self {
            chunks,
            n_entries,
            n_pinned: 0,
        }
    }

    pub(crate) fn n_entries(&self) -> usize {
        self.n_entries
    }

    fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    fn push(&mut self, slot: Slot) {
        debug_assert!(self.len() < self.n_entries);
        for chunk in &mut self.chunks {
            if chunk.len() < chunk.capacity() {
                chunk.push(slot);
                return;
            }
        }
    }

    /// Copies raw requested ids into the batch. Single-shot: fails if the
    /// batch was already used or the count does not match.
    pub(crate) fn import(&mut self, ids: &[u64]) -> Result<(), Error> {
        if ids.len() != self.n_entries || self.n_pinned > 0 || self.len() > 0 {
            return Err(Error::InvalidArgument);
        }
        for id in ids {
            self.push(Slot::Id(*id));
        }
        Ok(())
    }

    /// Appends a resolved slot, accounting it as pinned.
    pub(crate) fn push_pinned(&mut self, handle: Option<Arc<Handle>>) {
        self.push(Slot::Handle(handle));
        self.n_pinned += 1;
    }

    /// Resolves every imported id slot in place through `f`. Slots resolved
    /// before an error stay pinned and are released when the batch drops.
    pub(crate) fn resolve_ids(
        &mut self,
        mut f: impl FnMut(u64) -> Result<Option<Arc<Handle>>, Error>,
    ) -> Result<(), Error> {
        for slot in self.chunks.iter_mut().flatten() {
            if let Slot::Id(raw) = slot {
                let resolved = f(*raw)?;
                *slot = Slot::Handle(resolved);
                self.n_pinned += 1;
            }
        }
        Ok(())
    }

    /// Marks every slot consumed; the caller has converted or released all
    /// pins itself.
    pub(crate) fn consume(&mut self) {
        self.n_pinned = 0;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.chunks.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.chunks.iter_mut().flatten()
    }

    /// The committed ids, in slot order. Unresolved slots report the
    /// invalid id.
    pub(crate) fn ids(&self) -> Vec<HandleId> {
        self.iter()
            .map(|slot| match slot {
                Slot::Done(id) => *id,
                _ => HandleId::INVALID,
            })
            .collect()
    }
}

impl Drop for HandleBatch {
    fn drop(&mut self) {
        if self.n_pinned == 0 {
            return;
        }
        // release whatever pins a commit did not consume
        for slot in self.chunks.iter().flatten() {
            if let Slot::Handle(Some(handle)) = slot {
                if handle.is_public() {
                    handle.release();
                }
            }
        }
    }
}
