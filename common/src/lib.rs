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

//! dagsync common types: content addresses, feeds, roots and graph objects.

pub mod network;

use blake2::{Blake2b, Digest, digest::consts::U32};
use parity_scale_codec::{Decode, Encode};

pub use parity_scale_codec as codec;
pub use primitive_types::H256;

type Blake2b256 = Blake2b<U32>;

/// Content address of raw object bytes.
pub fn content_hash(data: &[u8]) -> H256 {
    let hash: [u8; 32] = Blake2b256::digest(data).into();
    H256(hash)
}

/// Identifier of a feed: a logical stream of [`Root`]s from one publisher,
/// totally ordered by sequence number.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    derive_more::Display,
    derive_more::From,
)]
#[display("{_0}")]
pub struct FeedId(pub H256);

/// Apex of an immutable content-addressed object graph of a feed at a given
/// sequence. Signature verification happens before a root reaches this
/// crate; here a root is plain data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Root {
    pub feed: FeedId,
    /// Feed-local branch the root belongs to; each branch is filled by its
    /// own head.
    pub branch: u64,
    /// Position of the root within its feed.
    pub seq: u64,
    /// Address of the apex object; zero denotes an empty graph.
    pub object: H256,
}

impl Root {
    /// The root references no objects at all.
    pub fn is_empty(&self) -> bool {
        self.object.is_zero()
    }
}

/// One node of an object graph: opaque payload bytes plus the addresses of
/// the children the graph walker follows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Object {
    /// Addresses of child objects.
    pub refs: Vec<H256>,
    /// Opaque payload bytes.
    pub data: Vec<u8>,
}

impl Object {
    /// An object without children.
    pub fn leaf(data: Vec<u8>) -> Self {
        Self {
            refs: Vec::new(),
            data,
        }
    }

    /// An interior object referencing `refs`.
    pub fn with_refs(refs: Vec<H256>, data: Vec<u8>) -> Self {
        Self { refs, data }
    }

    /// Content address of the encoded object.
    pub fn hash(&self) -> H256 {
        content_hash(&self.encode())
    }
}
