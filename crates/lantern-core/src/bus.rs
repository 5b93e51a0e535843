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

//! Bus construction.
//!
//! A [Bus] ties together the shared pieces every peer needs: the ordering
//! clock and the user registry. Peers are created from it and interact only
//! through handles and sends afterwards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use lantern_types::{PeerId, Uid};

use crate::clock::Clock;
use crate::peer::Peer;
use crate::user::Users;

/// Resource limits for a bus.
///
/// The `max_*` budgets apply globally per user; `pool_size` bounds each
/// peer's payload pool and doubles as the local byte budget.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_messages: u64,
    pub max_handles: u64,
    pub max_fds: u64,
    pub pool_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_messages: 1024,
            max_handles: 4096,
            max_fds: 1024,
            pool_size: 1 << 20,
        }
    }
}

impl Limits {
    /// Loads limits from a table in a config file, falling back to the
    /// defaults for anything unset.
    pub fn from_config(config: &toml::Table, table: &str) -> anyhow::Result<Self> {
        let Some(value) = config.get(table) else {
            return Ok(Self::default());
        };

        Self::deserialize(value.to_owned())
            .map_err(|err| anyhow::anyhow!("Failed to deserialize '{}' in config: {:?}", table, err))
    }
}

/// An instance of the message bus: the composition root all peers hang off.
#[derive(Debug)]
pub struct Bus {
    limits: Limits,
    clock: Arc<Clock>,
    users: Users,
    peer_ids: AtomicU32,
}

impl Bus {
    pub fn new(limits: Limits) -> Arc<Bus> {
        Arc::new(Bus {
            users: Users::new(limits.clone()),
            clock: Arc::new(Clock::new()),
            limits,
            peer_ids: AtomicU32::new(0),
        })
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Creates a new active peer for the given uid.
    pub fn create_peer(&self, uid: Uid) -> Arc<Peer> {
        let id = PeerId(self.peer_ids.fetch_add(1, Ordering::Relaxed));
        let user = self.users.get(uid);
        debug!("creating peer {:?} for {:?}", id, uid);
        Peer::new(id, user, self.clock.clone(), &self.limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Asserts that peers get distinct ids and peers of one uid share the
    /// user object.
    #[test]
    fn peer_creation() {
        let bus = Bus::new(Limits::default());
        let a = bus.create_peer(Uid(7));
        let b = bus.create_peer(Uid(7));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.uid(), b.uid());
    }

    /// Asserts that limits load from a config table and fall back to
    /// defaults when the table is missing.
    #[test]
    fn limits_from_config() {
        let config: toml::Table = toml::from_str(
            r#"
            [bus]
            max_messages = 64
            "#,
        )
        .unwrap();

        let limits = Limits::from_config(&config, "bus").unwrap();
        assert_eq!(limits.max_messages, 64);
        assert_eq!(limits.max_handles, Limits::default().max_handles);

        let fallback = Limits::from_config(&config, "missing").unwrap();
        assert_eq!(fallback.max_messages, Limits::default().max_messages);
    }
}
