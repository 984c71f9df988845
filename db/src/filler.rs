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

//! Graph walker filling the local store with a root's missing objects.

use crate::{ContentStorage, StorageError};
use dagsync_common::{H256, Object, Root};
use futures::{
    FutureExt,
    future::BoxFuture,
    stream::{FuturesUnordered, StreamExt},
};
use parity_scale_codec::Decode;
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Notify, mpsc};

/// Failure modes of a graph fill.
#[derive(Debug, thiserror::Error)]
pub enum FillError {
    /// A payload under this address does not decode as a graph object.
    #[error("object {0} is malformed")]
    MalformedObject(H256),
    /// The filler was closed before the graph became complete.
    #[error("filling closed")]
    Closed,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Default)]
struct Cancel {
    closed: AtomicBool,
    notify: Notify,
}

/// Terminates a running [`Filler`] from another task.
#[derive(Clone)]
pub struct FillerCloser {
    cancel: Arc<Cancel>,
}

impl FillerCloser {
    /// Stop the walk promptly. Idempotent.
    pub fn close(&self) {
        self.cancel.closed.store(true, Ordering::SeqCst);
        // `notify_one` stores a permit, so the single run task observes the
        // close even when it is not parked on `notified` yet.
        self.cancel.notify.notify_one();
    }
}

/// Walker of a root's object graph.
///
/// Objects are visited breadth-first with bounded parallelism. For every
/// referenced object missing from the store the walker emits the address on
/// the request channel and parks until the object shows up; the channel is
/// bounded, so a saturated request pipeline throttles graph exploration.
pub struct Filler<S> {
    db: S,
    root: Root,
    requests: mpsc::Sender<H256>,
    max_parallel: usize,
    cancel: Arc<Cancel>,
}

impl<S: ContentStorage> Filler<S> {
    pub(crate) fn new(
        db: S,
        root: Root,
        requests: mpsc::Sender<H256>,
        max_parallel: usize,
    ) -> Self {
        Self {
            db,
            root,
            requests,
            max_parallel: max_parallel.max(1),
            cancel: Arc::default(),
        }
    }

    /// Handle terminating this filler.
    pub fn closer(&self) -> FillerCloser {
        FillerCloser {
            cancel: self.cancel.clone(),
        }
    }

    /// Run until every object reachable from the root is local. Each
    /// distinct address is emitted at most once per fill.
    pub async fn run(self) -> Result<(), FillError> {
        if self.root.is_empty() {
            return Ok(());
        }

        let mut queue = VecDeque::from([self.root.object]);
        let mut visited = HashSet::from([self.root.object]);
        let mut active: FuturesUnordered<BoxFuture<'static, Result<Vec<H256>, FillError>>> =
            FuturesUnordered::new();

        loop {
            while active.len() < self.max_parallel {
                let Some(hash) = queue.pop_front() else { break };
                active.push(visit(self.db.clone(), self.requests.clone(), hash).boxed());
            }

            if active.is_empty() {
                log::debug!(
                    "graph of root #{} complete, {} object(s) visited",
                    self.root.seq,
                    visited.len()
                );
                return Ok(());
            }

            if self.cancel.closed.load(Ordering::SeqCst) {
                return Err(FillError::Closed);
            }

            let refs = tokio::select! {
                _ = self.cancel.notify.notified() => return Err(FillError::Closed),
                next = active.next() => match next {
                    Some(refs) => refs?,
                    None => return Ok(()),
                },
            };

            for child in refs {
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }
}

/// Ensure one object is local and return its child references.
async fn visit<S: ContentStorage>(
    db: S,
    requests: mpsc::Sender<H256>,
    hash: H256,
) -> Result<Vec<H256>, FillError> {
    let data = match db.get(&hash) {
        Some(data) => data,
        None => {
            requests.send(hash).await.map_err(|_| FillError::Closed)?;
            db.wait(hash).await?
        }
    };

    let object =
        Object::decode(&mut data.as_slice()).map_err(|_| FillError::MalformedObject(hash))?;

    Ok(object.refs)
}
