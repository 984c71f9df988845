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

//! dagsync content-addressed store.
//!
//! Objects are stored under the Blake2b-256 hash of their encoded bytes and
//! carry a reference count. The store also hands out [`Filler`]s: graph
//! walkers that drive replication of a root's missing objects.

mod filler;

pub use filler::{FillError, Filler, FillerCloser};

use dagsync_common::{H256, Root};
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{mpsc, oneshot};

/// Errors of the content store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store has been shut down; reads may still be answered from what
    /// is already resident, but waits and writes are rejected.
    #[error("content store terminated")]
    Terminated,
    /// The backend failed to persist an object. Fatal for the process.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Content-addressed object store as the replication core consumes it.
#[async_trait::async_trait]
pub trait ContentStorage: Clone + Send + Sync + 'static {
    /// Object bytes by content address.
    fn get(&self, hash: &H256) -> Option<Vec<u8>>;

    fn contains(&self, hash: &H256) -> bool {
        self.get(hash).is_some()
    }

    /// Store object bytes under `hash`, adjusting its reference count by
    /// `rc`. The caller is responsible for `hash` matching the bytes.
    fn set(&self, hash: H256, data: Vec<u8>, rc: i64) -> Result<(), StorageError>;

    /// Resolve once the object is present, returning its bytes.
    async fn wait(&self, hash: H256) -> Result<Vec<u8>, StorageError>;
}

/// Graph-filling extension of any content store.
pub trait FillStorage: ContentStorage {
    /// Build a walker of `root`'s graph. Missing object addresses are
    /// emitted on `requests` (which should be bounded to `max_parallel`);
    /// the walker then parks until the object shows up in the store.
    fn fill(&self, root: Root, requests: mpsc::Sender<H256>, max_parallel: usize) -> Filler<Self> {
        Filler::new(self.clone(), root, requests, max_parallel)
    }
}

impl<S: ContentStorage> FillStorage for S {}

struct StoredObject {
    data: Vec<u8>,
    rc: i64,
}

#[derive(Default)]
struct Inner {
    objects: DashMap<H256, StoredObject>,
    waiters: Mutex<HashMap<H256, Vec<oneshot::Sender<Vec<u8>>>>>,
    terminated: AtomicBool,
}

/// In-memory content-addressed database with per-object reference counts.
///
/// Cheap to clone; all clones share the same storage.
#[derive(Clone, Default)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Create an empty in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Reference count of a stored object.
    pub fn refs_count(&self, hash: &H256) -> Option<i64> {
        self.inner.objects.get(hash).map(|object| object.rc)
    }

    /// Terminate the store: parked waiters are woken with
    /// [`StorageError::Terminated`] and further writes are rejected.
    pub fn close(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        // Dropping the senders wakes the parked receivers with an error.
        self.inner.waiters.lock().clear();
        log::debug!("in-memory content store terminated");
    }

    fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ContentStorage for Database {
    fn get(&self, hash: &H256) -> Option<Vec<u8>> {
        self.inner.objects.get(hash).map(|object| object.data.clone())
    }

    fn contains(&self, hash: &H256) -> bool {
        self.inner.objects.contains_key(hash)
    }

    fn set(&self, hash: H256, data: Vec<u8>, rc: i64) -> Result<(), StorageError> {
        if self.is_terminated() {
            return Err(StorageError::Terminated);
        }

        match self.inner.objects.entry(hash) {
            Entry::Occupied(mut entry) => {
                let object = entry.get_mut();
                object.rc = (object.rc + rc).max(0);
            }
            Entry::Vacant(entry) => {
                entry.insert(StoredObject {
                    data: data.clone(),
                    rc: rc.max(0),
                });
            }
        }

        if let Some(parked) = self.inner.waiters.lock().remove(&hash) {
            for waiter in parked {
                let _ = waiter.send(data.clone());
            }
        }

        Ok(())
    }

    async fn wait(&self, hash: H256) -> Result<Vec<u8>, StorageError> {
        let receiver = {
            // The lock is held across the presence check, so a concurrent
            // `set` (which drains waiters under the same lock) cannot slip
            // between the check and the registration.
            let mut waiters = self.inner.waiters.lock();

            if self.is_terminated() {
                return Err(StorageError::Terminated);
            }

            if let Some(data) = self.get(&hash) {
                return Ok(data);
            }

            let (sender, receiver) = oneshot::channel();
            waiters.entry(hash).or_default().push(sender);
            receiver
        };

        receiver.await.map_err(|_| StorageError::Terminated)
    }
}
