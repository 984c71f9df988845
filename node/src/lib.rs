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

//! dagsync node: per-feed replication of content-addressed object graphs.
//!
//! Peers announce [`Root`]s (apexes of immutable Merkle graphs) per feed
//! and branch. For every branch of a subscribed feed the node keeps one
//! [`Head`] that selects which root to fill next and pulls the graph's
//! missing objects from the peers known to possess that root. Transport,
//! signature verification and the store backend stay outside; the seams
//! are [`PeerConnection`], [`NodeEvents`] and
//! [`ContentStorage`](dagsync_db::ContentStorage).

pub mod config;
pub mod head;
pub mod known;
pub mod peer;


pub use config::NodeConfig;
pub use head::{Head, HeadId};
pub use peer::{Conn, PeerConnection, PeerId, RequestError};

pub use dagsync_common as common;
pub use dagsync_db as db;

use anyhow::Result;
use dagsync_common::{FeedId, Root};
use dagsync_db::ContentStorage;
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

/// Callbacks a node emits upward. All of them are invoked from head event
/// loops and must not block.
pub trait NodeEvents: Send + Sync + 'static {
    /// A root announcement is about to be adopted for filling or as the
    /// pending successor. Returning an error rejects the root: no fill is
    /// started and the pending slot is left untouched.
    fn on_root_received(&self, conn: &Conn, root: &Root) -> Result<()> {
        let _ = (conn, root);
        Ok(())
    }

    /// The graph under `root` is fully local.
    fn on_root_filled(&self, root: &Root) {
        let _ = root;
    }

    /// The graph under `root` cannot be completed.
    fn on_filling_breaks(&self, root: &Root, err: &anyhow::Error) {
        let _ = (root, err);
    }

    /// Process-level failure (the content store refused a write).
    fn on_fatal(&self, message: &str, err: &anyhow::Error) {
        let _ = (message, err);
    }
}

/// Head-terminating errors.
#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    /// No live peer can serve the filling root and no request is
    /// outstanding to deliver one back.
    #[error("no connections to fill the root from")]
    NoPeersForRoot,
    /// The per-feed heads limit was reached; the new head is terminated.
    #[error("feed heads limit reached ({0})")]
    HeadCapacityExceeded(usize),
}

/// Per-feed set of filling heads, keyed by root branch.
#[derive(Default)]
struct Feed {
    heads: HashMap<u64, Head>,
}

impl Feed {
    fn receive_root<S: ContentStorage>(
        &mut self,
        db: &S,
        config: &NodeConfig,
        events: &Arc<dyn NodeEvents>,
        conn: Conn,
        root: Root,
    ) {
        let at_capacity = config.max_heads != 0 && self.heads.len() >= config.max_heads;

        let head = match self.heads.entry(root.branch) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let id = HeadId {
                    feed: root.feed,
                    branch: root.branch,
                };
                let head = Head::spawn(db.clone(), config.clone(), events.clone(), id);

                if at_capacity {
                    // Terminate through the head's fatal path; the dead
                    // handle keeps later announcements for this branch
                    // cheap no-ops.
                    log::warn!("[{id}] heads limit reached, branch refused");
                    head.close_by_error(anyhow::Error::new(HeadError::HeadCapacityExceeded(
                        config.max_heads,
                    )));
                    entry.insert(head);
                    return;
                }

                entry.insert(head)
            }
        };

        head.receive_root(conn, root);
    }

    fn del_conn(&self, peer: PeerId) {
        for head in self.heads.values() {
            head.del_conn(peer);
        }
    }

    async fn close(&mut self) {
        for (_, mut head) in self.heads.drain() {
            head.close().await;
        }
    }
}

/// Node-wide replication service: routes announcements and connection
/// events of subscribed feeds into per-branch heads.
pub struct Node<S: ContentStorage> {
    config: NodeConfig,
    db: S,
    events: Arc<dyn NodeEvents>,
    feeds: HashMap<FeedId, Feed>,
}

impl<S: ContentStorage> Node<S> {
    pub fn new(config: NodeConfig, db: S, events: Arc<dyn NodeEvents>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            db,
            events,
            feeds: HashMap::new(),
        })
    }

    /// Start tracking a feed. Announcements of unsubscribed feeds are
    /// dropped.
    pub fn subscribe(&mut self, feed: FeedId) {
        self.feeds.entry(feed).or_default();
        log::debug!("subscribed to feed {feed}");
    }

    /// Stop tracking a feed, terminating its heads.
    pub async fn unsubscribe(&mut self, feed: FeedId) {
        let Some(mut removed) = self.feeds.remove(&feed) else {
            return;
        };

        removed.close().await;
        log::debug!("unsubscribed from feed {feed}");
    }

    pub fn is_subscribed(&self, feed: &FeedId) -> bool {
        self.feeds.contains_key(feed)
    }

    /// Deliver a root announcement received from a peer. Signature checks
    /// happened upstream.
    pub fn receive_root(&mut self, conn: Conn, root: Root) {
        let Some(feed) = self.feeds.get_mut(&root.feed) else {
            log::debug!(
                "dropping root #{} of unsubscribed feed {}",
                root.seq,
                root.feed
            );
            return;
        };

        feed.receive_root(&self.db, &self.config, &self.events, conn, root);
    }

    /// A peer connection was dropped by the transport.
    pub fn del_conn(&mut self, peer: PeerId) {
        for feed in self.feeds.values() {
            feed.del_conn(peer);
        }
    }

    /// Shut the node down, terminating every head. Idempotent.
    pub async fn close(&mut self) {
        for (_, mut feed) in self.feeds.drain() {
            feed.close().await;
        }
    }
}
