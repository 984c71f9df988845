// This file is part of Dagsync.
//
// Copyright (C) 2025 Dagsync Technologies.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Registry of which peer is known to possess which root sequences.

use crate::peer::{Conn, PeerId};
use indexmap::IndexMap;
use std::collections::VecDeque;

/// Per-head map from peer to the ascending sequence numbers it has
/// announced roots at. Enumeration follows announcement order, which keeps
/// the eligible-connection list deterministic within a run.
///
/// Accessed only from the head's event loop; no locking.
#[derive(Default)]
pub(crate) struct KnownRoots {
    peers: IndexMap<PeerId, PeerRoots>,
}

struct PeerRoots {
    conn: Conn,
    /// Ascending, without duplicates.
    seqs: Vec<u64>,
}

impl KnownRoots {
    /// Record that the peer possesses a root at `seq`. Idempotent.
    pub(crate) fn add_known(&mut self, conn: &Conn, seq: u64) {
        let entry = self
            .peers
            .entry(conn.peer_id())
            .or_insert_with(|| PeerRoots {
                conn: conn.clone(),
                seqs: Vec::new(),
            });

        if let Err(at) = entry.seqs.binary_search(&seq) {
            entry.seqs.insert(at, seq);
        }
    }

    /// Forget one sequence of a peer; no-op when absent.
    pub(crate) fn remove_known(&mut self, peer: PeerId, seq: u64) {
        if let Some(entry) = self.peers.get_mut(&peer) {
            if let Ok(at) = entry.seqs.binary_search(&seq) {
                entry.seqs.remove(at);
            }
        }
    }

    /// A root at `seq` was filled; forget all older sequences.
    pub(crate) fn move_forward(&mut self, seq: u64) {
        for entry in self.peers.values_mut() {
            entry.seqs.retain(|&known| known >= seq);
        }
    }

    /// Connections of every peer possessing `seq`, in announcement order.
    pub(crate) fn conns_for(&self, seq: u64) -> VecDeque<Conn> {
        self.peers
            .values()
            .filter(|entry| entry.seqs.binary_search(&seq).is_ok())
            .map(|entry| entry.conn.clone())
            .collect()
    }

    /// Forget the peer entirely (disconnect or eviction).
    pub(crate) fn remove_peer(&mut self, peer: PeerId) {
        self.peers.shift_remove(&peer);
    }

    pub(crate) fn contains_peer(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    #[cfg(test)]
    pub(crate) fn seqs_of(&self, peer: PeerId) -> Vec<u64> {
        self.peers
            .get(&peer)
            .map(|entry| entry.seqs.clone())
            .unwrap_or_default()
    }
}
