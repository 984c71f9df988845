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

//! Peer-connection seam between the node and its transport.

use dagsync_common::network::NetworkMessage;
use std::sync::Arc;

/// Transport-assigned identity of a live peer connection.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
)]
#[display("peer-{_0}")]
pub struct PeerId(pub u64);

/// Failure kinds of a single object request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The peer replied with a wrong variant or a payload hashing to a
    /// different address. The peer is untrusted henceforth.
    #[error("peer returned an invalid response")]
    InvalidResponse,
    /// The request exceeded its deadline; the peer may simply not hold the
    /// object at this sequence anymore.
    #[error("object request timed out")]
    Timeout,
    /// The connection terminated mid-request.
    #[error("connection closed")]
    Closed,
    /// The content store shut down while the response was being handled.
    #[error("content store terminated")]
    TerminatedStore,
    /// Any other transport-reported failure.
    #[error("request failed: {0}")]
    Other(String),
}

/// An open connection to a peer, provided by the transport. The node never
/// closes a connection itself, it only signals fatality.
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync + 'static {
    fn peer_id(&self) -> PeerId;

    /// Send a request and await the correlated reply. Correlation is the
    /// transport's concern.
    async fn request(&self, msg: NetworkMessage) -> Result<NetworkMessage, RequestError>;

    /// Asynchronous notice that the peer misbehaved; the transport is
    /// expected to close it. Must not block.
    fn fatality(&self, err: anyhow::Error);
}

/// Shared handle to a peer connection.
pub type Conn = Arc<dyn PeerConnection>;
