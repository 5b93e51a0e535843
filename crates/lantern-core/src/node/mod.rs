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

//! Nodes, handles and the transaction contexts moving them between peers.

mod batch;

pub(crate) mod handle;
pub(crate) mod transfer;

pub use handle::{Handle, Node};
pub use transfer::{Inflight, Transfer};
