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

//! Mock peers, an event recorder and graph fixtures for scenario tests.

use crate::{
    Head, HeadId, NodeConfig, NodeEvents,
    peer::{Conn, PeerConnection, PeerId, RequestError},
};
use anyhow::Result;
use dagsync_common::{FeedId, H256, Object, Root, network::NetworkMessage};
use dagsync_db::{ContentStorage, Database};
use parity_scale_codec::Encode;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{mpsc, watch};

/// How a [`MockPeer`] answers object requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Serve {
    /// Answer from the peer's local object map.
    Ok,
    /// Answer with bytes hashing to a different address.
    Corrupt,
    /// Answer with a reply of the wrong variant.
    WrongVariant,
    /// Hang until the peer is closed, then fail with `Closed`.
    Stall,
}

pub(crate) struct MockPeer {
    id: PeerId,
    mode: Mutex<Serve>,
    objects: Mutex<HashMap<H256, Vec<u8>>>,
    requested: Mutex<Vec<H256>>,
    fatalities: Mutex<Vec<String>>,
    closed: watch::Sender<bool>,
    gate: watch::Sender<bool>,
}

impl MockPeer {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let (gate, _) = watch::channel(true);

        Arc::new(Self {
            id: PeerId(id),
            mode: Mutex::new(Serve::Ok),
            objects: Mutex::new(HashMap::new()),
            requested: Mutex::new(Vec::new()),
            fatalities: Mutex::new(Vec::new()),
            closed,
            gate,
        })
    }

    pub(crate) fn put(&self, object: &Object) {
        self.objects
            .lock()
            .unwrap()
            .insert(object.hash(), object.encode());
    }

    pub(crate) fn set_mode(&self, mode: Serve) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Park incoming requests until [`release`](Self::release).
    pub(crate) fn hold(&self) {
        let _ = self.gate.send(false);
    }

    /// Let held requests through.
    pub(crate) fn release(&self) {
        let _ = self.gate.send(true);
    }

    /// Simulate the transport dropping the connection: stalled requests
    /// fail with `Closed`.
    pub(crate) fn close(&self) {
        let _ = self.closed.send(true);
    }

    pub(crate) fn requested(&self) -> Vec<H256> {
        self.requested.lock().unwrap().clone()
    }

    pub(crate) fn fatalities(&self) -> Vec<String> {
        self.fatalities.lock().unwrap().clone()
    }

    fn serve(&self, hash: H256) -> Result<NetworkMessage, RequestError> {
        match self.objects.lock().unwrap().get(&hash) {
            Some(data) => Ok(NetworkMessage::Object(data.clone())),
            None => Err(RequestError::Other(format!("no object {hash}"))),
        }
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Returns true when the peer closed before it was released.
    async fn wait_released(&self) -> bool {
        let mut gate = self.gate.subscribe();
        let mut closed = self.closed.subscribe();

        tokio::select! {
            _ = gate.wait_for(|open| *open) => false,
            _ = closed.wait_for(|closed| *closed) => true,
        }
    }
}

#[async_trait::async_trait]
impl PeerConnection for MockPeer {
    fn peer_id(&self) -> PeerId {
        self.id
    }

    async fn request(&self, msg: NetworkMessage) -> Result<NetworkMessage, RequestError> {
        let NetworkMessage::RequestObject(hash) = msg else {
            return Err(RequestError::Other("unexpected request variant".into()));
        };

        self.requested.lock().unwrap().push(hash);

        if self.wait_released().await {
            return Err(RequestError::Closed);
        }

        let mode = *self.mode.lock().unwrap();
        match mode {
            Serve::Ok => self.serve(hash),
            Serve::Corrupt => Ok(NetworkMessage::Object(b"bogus payload".to_vec())),
            Serve::WrongVariant => Ok(NetworkMessage::AnnounceRoot(Root::default())),
            Serve::Stall => {
                self.wait_closed().await;
                Err(RequestError::Closed)
            }
        }
    }

    fn fatality(&self, err: anyhow::Error) {
        self.fatalities.lock().unwrap().push(err.to_string());
    }
}

/// Everything a head reported upward, in arrival order.
#[derive(Debug)]
pub(crate) enum Event {
    Received(PeerId, Root),
    Filled(Root),
    Broke(Root, String),
    Fatal(String),
}

pub(crate) struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
    reject_from_seq: Mutex<Option<u64>>,
}

impl Recorder {
    pub(crate) fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                tx,
                reject_from_seq: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Reject every announced root with `seq >= from` (after recording it).
    pub(crate) fn reject_from_seq(&self, from: u64) {
        *self.reject_from_seq.lock().unwrap() = Some(from);
    }
}

impl NodeEvents for Recorder {
    fn on_root_received(&self, conn: &Conn, root: &Root) -> Result<()> {
        let _ = self.tx.send(Event::Received(conn.peer_id(), root.clone()));

        if let Some(from) = *self.reject_from_seq.lock().unwrap() {
            if root.seq >= from {
                anyhow::bail!("rejected by test policy");
            }
        }

        Ok(())
    }

    fn on_root_filled(&self, root: &Root) {
        let _ = self.tx.send(Event::Filled(root.clone()));
    }

    fn on_filling_breaks(&self, root: &Root, err: &anyhow::Error) {
        let _ = self.tx.send(Event::Broke(root.clone(), err.to_string()));
    }

    fn on_fatal(&self, message: &str, _err: &anyhow::Error) {
        let _ = self.tx.send(Event::Fatal(message.to_string()));
    }
}

pub(crate) fn test_feed() -> FeedId {
    FeedId(H256::repeat_byte(0xfe))
}

pub(crate) fn root(seq: u64, object: H256) -> Root {
    Root {
        feed: test_feed(),
        branch: 0,
        seq,
        object,
    }
}

/// Store a three-leaf apex in `db` and return its hash plus the leaves the
/// peers are expected to serve.
pub(crate) fn seed_graph(db: &Database) -> (H256, Vec<Object>) {
    let leaves: Vec<Object> = (0u8..3).map(|i| Object::leaf(vec![i; 4])).collect();
    let apex = Object::with_refs(leaves.iter().map(Object::hash).collect(), b"apex".to_vec());
    db.set(apex.hash(), apex.encode(), 1).expect("store is open");

    (apex.hash(), leaves)
}

pub(crate) fn spawn_head<S: ContentStorage>(
    db: &S,
    events: Arc<Recorder>,
    request_timeout: Duration,
) -> Head {
    let config = NodeConfig {
        request_timeout,
        ..Default::default()
    };

    Head::spawn(
        db.clone(),
        config,
        events,
        HeadId {
            feed: test_feed(),
            branch: 0,
        },
    )
}

pub(crate) async fn expect_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("events channel closed")
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}
