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

//! The Lantern bus core: capability handles over shared nodes, moved
//! between peers by ordered, atomically committed transactions.
//!
//! To get started, build a [bus::Bus], create peers from it, and move
//! handles with [transaction::send]. Payloads and handle ids arrive through
//! [peer::Peer::recv] in per-destination send order.

use tracing::Level;
use tracing_subscriber::prelude::*;

/// Bus construction and limits.
pub mod bus;

/// Transaction and destruction ordering.
pub mod clock;

/// Nodes, handles and transaction contexts.
pub mod node;

/// Peers and their locked state.
pub mod peer;

/// Payload slice pools.
pub mod pool;

/// Ordered delivery queues with staging.
pub mod queue;

/// Send orchestration and deliveries.
pub mod transaction;

/// Users and quota accounting.
pub mod user;

pub use bus::{Bus, Limits};
pub use peer::Peer;
pub use transaction::{send, Delivery, Message};

/// Helper function to set up console logging with reasonable defaults.
pub fn init_logging() {
    let filter = tracing_subscriber::filter::Targets::new().with_default(Level::DEBUG);

    let format = tracing_subscriber::fmt::layer().compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .init();
}
