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

//! Wire-level messages exchanged between peers.

use crate::{H256, Root};
use parity_scale_codec::{Decode, Encode};

/// Messages of the replication protocol. Request/response correlation is
/// the transport's concern; receivers validate reply variants structurally.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, derive_more::From)]
pub enum NetworkMessage {
    /// A peer announces the latest root it possesses.
    AnnounceRoot(Root),
    /// Ask a peer for the object with the given content address.
    RequestObject(H256),
    /// Raw object payload; the receiver derives the address itself.
    Object(Vec<u8>),
}
