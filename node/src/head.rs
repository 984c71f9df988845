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

//! Per-branch filling head.
//!
//! A head tracks the latest root of one feed branch and pulls the missing
//! objects of its graph from the peers known to possess it. The filling
//! slot moves through three states: idle (no root), filling (one active
//! walker, optionally a newer pending root waiting its turn), terminated
//! (after shutdown or a fatal error).
//!
//! One event-loop task per head is the sole writer of head state; the
//! walker, per-request workers and the outside world reach it over
//! channels only, so no locking is involved.

use crate::{
    HeadError, NodeEvents,
    config::NodeConfig,
    known::KnownRoots,
    peer::{Conn, PeerId, RequestError},
};
use anyhow::anyhow;
use dagsync_common::{FeedId, H256, Root, content_hash, network::NetworkMessage};
use dagsync_db::{ContentStorage, FillError, FillStorage, FillerCloser, StorageError};
use futures::future;
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};

/// Identity of a head, for routing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadId {
    pub feed: FeedId,
    pub branch: u64,
}

impl fmt::Display for HeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.feed, self.branch)
    }
}

/// Workers park on these when the loop is busy; the capacity only bounds
/// how many outcomes queue up before senders start to wait.
const OUTCOME_CHANNEL_CAPACITY: usize = 8;

/// Handle of a spawned head. Every delivery method is non-blocking and
/// becomes a no-op once the head terminates.
pub struct Head {
    rrq: mpsc::UnboundedSender<(Conn, Root)>,
    delcq: mpsc::UnboundedSender<PeerId>,
    errq: mpsc::UnboundedSender<anyhow::Error>,
    close_tx: Option<oneshot::Sender<()>>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl Head {
    /// Spawn the event-loop task of a new head.
    pub fn spawn<S: ContentStorage>(
        db: S,
        config: NodeConfig,
        events: Arc<dyn NodeEvents>,
        id: HeadId,
    ) -> Self {
        let (rrq_tx, rrq_rx) = mpsc::unbounded_channel();
        let (delcq_tx, delcq_rx) = mpsc::unbounded_channel();
        let (errq_tx, errq_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (successq_tx, successq_rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        let (failureq_tx, failureq_rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);

        let task = HeadTask {
            id,
            db,
            config,
            events,
            errq: errq_tx.clone(),
            successq: successq_tx,
            failureq: failureq_tx,
            known: KnownRoots::default(),
            filling: None,
            pending: None,
            rq: None,
            done: None,
            generation: 0,
            tasks: JoinSet::new(),
        };

        let join = tokio::spawn(task.run(
            rrq_rx, delcq_rx, errq_rx, successq_rx, failureq_rx, close_rx,
        ));

        Self {
            rrq: rrq_tx,
            delcq: delcq_tx,
            errq: errq_tx,
            close_tx: Some(close_tx),
            join: Some(join),
        }
    }

    /// Deliver a root announcement from a peer.
    pub fn receive_root(&self, conn: Conn, root: Root) {
        let _ = self.rrq.send((conn, root));
    }

    /// Deliver a connection-removal notification.
    pub fn del_conn(&self, peer: PeerId) {
        let _ = self.delcq.send(peer);
    }

    /// Terminate the head with a fatal error.
    pub fn close_by_error(&self, err: anyhow::Error) {
        let _ = self.errq.send(err);
    }

    /// Shut the head down and await the loop and all of its spawned tasks.
    /// Idempotent.
    pub async fn close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }

        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Outcome of a request a peer answered correctly; the connection comes
/// back for the next dispatch.
struct ServedRequest {
    conn: Conn,
    generation: u64,
}

/// Outcome of a request that did not produce a stored object.
struct FailedRequest {
    conn: Conn,
    generation: u64,
    /// Sequence of the root the request was filling.
    seq: u64,
    hash: H256,
    kind: RequestError,
}

/// State of the active fill.
struct Filling {
    root: Root,
    closer: FillerCloser,
    /// Object hashes awaiting dispatch, front first.
    rqo: VecDeque<H256>,
    /// Idle connections eligible for the filling root. Entries can go
    /// stale on disconnect; they are filtered against `known` at pop time.
    fc: VecDeque<Conn>,
    /// Requests currently in flight for this fill.
    requesting: usize,
}

struct HeadTask<S> {
    id: HeadId,
    db: S,
    config: NodeConfig,
    events: Arc<dyn NodeEvents>,

    /// Workers inject store-write failures here; the fan-out injects
    /// capacity errors through the handle side of the same channel.
    errq: mpsc::UnboundedSender<anyhow::Error>,
    successq: mpsc::Sender<ServedRequest>,
    failureq: mpsc::Sender<FailedRequest>,

    known: KnownRoots,
    filling: Option<Filling>,
    /// Newer root waiting for the current fill to finish. One deep,
    /// replaced by newer sequences only.
    pending: Option<Root>,
    /// Walker requests of the active fill; `None` once the walker is done.
    rq: Option<mpsc::Receiver<H256>>,
    /// Walker completion of the active fill.
    done: Option<oneshot::Receiver<Result<(), FillError>>>,
    /// Bumped per created filler; outcomes of superseded fills are
    /// discarded by comparing against this.
    generation: u64,
    tasks: JoinSet<()>,
}

impl<S: ContentStorage> HeadTask<S> {
    async fn run(
        mut self,
        mut rrq: mpsc::UnboundedReceiver<(Conn, Root)>,
        mut delcq: mpsc::UnboundedReceiver<PeerId>,
        mut errq: mpsc::UnboundedReceiver<anyhow::Error>,
        mut successq: mpsc::Receiver<ServedRequest>,
        mut failureq: mpsc::Receiver<FailedRequest>,
        mut close_rx: oneshot::Receiver<()>,
    ) {
        log::debug!("[{}] head started", self.id);

        loop {
            tokio::select! {
                request = maybe_recv(self.rq.as_mut()) => match request {
                    Some(hash) => self.handle_request(hash),
                    None => self.rq = None, // walker dropped its sender
                },
                result = maybe_fill_result(self.done.as_mut()) => {
                    self.rq = None;
                    self.done = None;
                    self.handle_filling_result(result);
                }
                Some(served) = successq.recv() => self.handle_success(served),
                Some(failed) = failureq.recv() => self.handle_failure(failed),
                received = rrq.recv() => match received {
                    Some((conn, root)) => self.handle_received_root(conn, root),
                    None => break, // handle dropped, shut down
                },
                Some(peer) = delcq.recv() => self.handle_del_conn(peer),
                Some(err) = errq.recv() => {
                    log::debug!("[{}] fatal error injected: {err}", self.id);
                    self.pending = None;
                    self.handle_filling_result(Err(err));
                    break;
                }
                _ = &mut close_rx => break,
            }
        }

        log::debug!("[{}] head terminating", self.id);
        self.close_filler();

        // Workers may be parked sending an outcome; without the receivers
        // their sends fail immediately, so the drain cannot deadlock.
        drop(successq);
        drop(failureq);
        while self.tasks.join_next().await.is_some() {}
    }

    /// The walker wants an object.
    fn handle_request(&mut self, hash: H256) {
        let Some(filling) = self.filling.as_mut() else {
            return;
        };

        filling.rqo.push_back(hash);
        self.trigger_request();
    }

    /// A request was answered and the object persisted; recycle the
    /// connection to the back of the eligible queue.
    fn handle_success(&mut self, served: ServedRequest) {
        if served.generation != self.generation {
            return; // outcome of a superseded fill
        }

        let Some(filling) = self.filling.as_mut() else {
            return;
        };

        filling.requesting -= 1;
        filling.fc.push_back(served.conn);
        self.trigger_request();
    }

    /// A request failed; punish the peer according to the failure kind and
    /// put the hash back at the front so walker ordering is preserved.
    fn handle_failure(&mut self, failed: FailedRequest) {
        if failed.generation != self.generation {
            return; // outcome of a superseded fill
        }

        let Some(filling) = self.filling.as_mut() else {
            return;
        };

        filling.requesting -= 1;
        filling.rqo.push_front(failed.hash);

        let peer = failed.conn.peer_id();
        log::debug!(
            "[{}] request for {} to {peer} failed: {}",
            self.id,
            failed.hash,
            failed.kind
        );

        match failed.kind {
            RequestError::InvalidResponse => {
                // The peer is untrusted henceforth; the transport closes it.
                failed.conn.fatality(failed.kind.clone().into());
                self.known.remove_peer(peer);
            }
            RequestError::Closed | RequestError::TerminatedStore => {
                self.known.remove_peer(peer);
            }
            RequestError::Timeout | RequestError::Other(_) => {
                // The peer probably no longer holds the root at this seq.
                self.known.remove_known(peer, failed.seq);
            }
        }

        self.trigger_request();
    }

    /// Root-selection state machine.
    fn handle_received_root(&mut self, conn: Conn, root: Root) {
        let Some(current_seq) = self.filling.as_ref().map(|filling| filling.root.seq) else {
            // Idle: adopt the root right away.
            self.known.add_known(&conn, root.seq);

            if let Err(reject) = self.events.on_root_received(&conn, &root) {
                log::debug!("[{}] root #{} rejected: {reject}", self.id, root.seq);
                return;
            }

            self.create_filler(root);
            return;
        };

        if root.seq < current_seq {
            return; // ignore the old root
        }

        self.known.add_known(&conn, root.seq);

        if root.seq == current_seq {
            // One more source for the root being filled right now.
            if let Some(filling) = self.filling.as_mut() {
                filling.fc.push_back(conn);
            }
            self.trigger_request();
            return;
        }

        // Newer than the current fill: keep the newest as pending.
        let replaces = match self.pending.as_ref() {
            None => true,
            Some(pending) => pending.seq < root.seq,
        };

        if replaces {
            if let Err(reject) = self.events.on_root_received(&conn, &root) {
                log::debug!("[{}] root #{} rejected: {reject}", self.id, root.seq);
                return;
            }
            self.pending = Some(root);
        }
    }

    fn handle_del_conn(&mut self, peer: PeerId) {
        // Stale entries the peer left in `fc` are filtered at dispatch.
        self.known.remove_peer(peer);
    }

    /// The fill finished, successfully or not. Report it upward, then
    /// promote the pending root if one queued up meanwhile.
    fn handle_filling_result(&mut self, result: Result<(), anyhow::Error>) {
        let Some(filling) = self.close_filler() else {
            // A late walker result of a fill already reported (e.g. broken
            // for lack of peers); nothing to do.
            return;
        };

        match result {
            Ok(()) => {
                log::info!("[{}] root #{} filled", self.id, filling.root.seq);
                self.events.on_root_filled(&filling.root);
                self.known.move_forward(filling.root.seq);
            }
            Err(err) => {
                log::info!(
                    "[{}] filling of root #{} broke: {err}",
                    self.id,
                    filling.root.seq
                );
                self.events.on_filling_breaks(&filling.root, &err);
            }
        }

        if let Some(pending) = self.pending.take() {
            self.create_filler(pending);
        }
    }

    /// Start filling `root`: fresh queues, fresh walker, eligible
    /// connections snapshotted from the registry.
    fn create_filler(&mut self, root: Root) {
        let fc = self.known.conns_for(root.seq);
        if fc.is_empty() {
            // No peer possesses this root; fail fast.
            log::debug!(
                "[{}] no connections to fill root #{} from",
                self.id,
                root.seq
            );
            let err = anyhow::Error::new(HeadError::NoPeersForRoot);
            self.events.on_filling_breaks(&root, &err);
            return;
        }

        log::info!(
            "[{}] 📥 filling root #{} from {} peer(s)",
            self.id,
            root.seq,
            fc.len()
        );

        let max_parallel = self.config.filling_parallel();
        let (rq_tx, rq_rx) = mpsc::channel(max_parallel);
        let filler = self.db.fill(root.clone(), rq_tx, max_parallel);
        let closer = filler.closer();
        let (done_tx, done_rx) = oneshot::channel();

        self.tasks.spawn(async move {
            let _ = done_tx.send(filler.run().await);
        });

        self.generation += 1;
        self.rq = Some(rq_rx);
        self.done = Some(done_rx);
        self.filling = Some(Filling {
            root,
            closer,
            rqo: VecDeque::new(),
            fc,
            requesting: 0,
        });
    }

    /// Tear down the active fill, if any, and return it.
    fn close_filler(&mut self) -> Option<Filling> {
        self.rq = None;
        self.done = None;

        let filling = self.filling.take()?;
        filling.closer.close();

        Some(filling)
    }

    fn trigger_request(&mut self) {
        if self.try_request() {
            // No live peer can serve the graph and nothing outstanding can
            // deliver one back: fatal for this root.
            self.handle_filling_result(Err(anyhow::Error::new(HeadError::NoPeersForRoot)));
        }
    }

    /// Pair one queued hash with one idle eligible connection. Returns
    /// true when the fill can no longer progress at all.
    fn try_request(&mut self) -> bool {
        let Some(filling) = self.filling.as_mut() else {
            return false;
        };

        if filling.rqo.is_empty() {
            return false;
        }

        let conn = loop {
            let Some(conn) = filling.fc.pop_front() else {
                return filling.requesting == 0;
            };

            if self.known.contains_peer(conn.peer_id()) {
                break conn;
            }
            // stale entry left behind by a disconnect
        };

        let Some(hash) = filling.rqo.pop_front() else {
            // Checked non-empty above; keep the connection either way.
            filling.fc.push_front(conn);
            return false;
        };

        filling.requesting += 1;
        let seq = filling.root.seq;

        log::debug!(
            "[{}] requesting {hash} from {} (seq {seq})",
            self.id,
            conn.peer_id()
        );

        self.tasks.spawn(request_object(
            self.db.clone(),
            conn,
            self.generation,
            seq,
            hash,
            self.config.request_timeout,
            self.successq.clone(),
            self.failureq.clone(),
            self.events.clone(),
            self.errq.clone(),
        ));

        false
    }
}

/// Request one object from a peer, verify and persist it, and report the
/// outcome back to the event loop.
#[allow(clippy::too_many_arguments)]
async fn request_object<S: ContentStorage>(
    db: S,
    conn: Conn,
    generation: u64,
    seq: u64,
    hash: H256,
    deadline: Duration,
    successq: mpsc::Sender<ServedRequest>,
    failureq: mpsc::Sender<FailedRequest>,
    events: Arc<dyn NodeEvents>,
    errq: mpsc::UnboundedSender<anyhow::Error>,
) {
    let request = conn.request(NetworkMessage::RequestObject(hash));

    let kind = match tokio::time::timeout(deadline, request).await {
        Err(_elapsed) => RequestError::Timeout,
        Ok(Err(err)) => err,
        Ok(Ok(NetworkMessage::Object(payload))) => {
            if content_hash(&payload) != hash {
                RequestError::InvalidResponse
            } else {
                match db.set(hash, payload, 1) {
                    Ok(()) => {
                        let _ = successq.send(ServedRequest { conn, generation }).await;
                        return;
                    }
                    Err(StorageError::Terminated) => RequestError::TerminatedStore,
                    Err(err) => {
                        // Disk/database failure: fatal for the process, not
                        // just for this fill.
                        let err = anyhow!(err).context("content store write failed");
                        events.on_fatal("content store write failed", &err);
                        let _ = errq.send(err);
                        return;
                    }
                }
            }
        }
        Ok(Ok(_)) => RequestError::InvalidResponse,
    };

    let _ = failureq
        .send(FailedRequest {
            conn,
            generation,
            seq,
            hash,
            kind,
        })
        .await;
}

/// Pending forever when the walker channel is absent.
async fn maybe_recv(rq: Option<&mut mpsc::Receiver<H256>>) -> Option<H256> {
    match rq {
        Some(rq) => rq.recv().await,
        None => future::pending().await,
    }
}

/// Pending forever when no fill is running.
async fn maybe_fill_result(
    done: Option<&mut oneshot::Receiver<Result<(), FillError>>>,
) -> Result<(), anyhow::Error> {
    match done {
        Some(done) => match done.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(anyhow!("filler task dropped without a result")),
        },
        None => future::pending().await,
    }
}
