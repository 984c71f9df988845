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

//! Node configuration.

use anyhow::{Result, ensure};
use std::time::Duration;

/// Default per-feed limit of simultaneously tracked branches (heads).
pub const DEFAULT_MAX_HEADS: usize = 16;

/// Substituted for a zero `max_filling_parallel`: the walker's request
/// channel cannot be unbounded, so "unlimited" is capped here.
pub const MAX_FILLING_PARALLEL_FALLBACK: usize = 1024;

/// Default deadline of a single object request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration of a [`Node`](crate::Node) and its heads.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Per-feed limit of heads; 0 means unlimited.
    pub max_heads: usize,
    /// Cap of the graph walker's concurrency per head; 0 selects
    /// [`MAX_FILLING_PARALLEL_FALLBACK`].
    pub max_filling_parallel: usize,
    /// Deadline of a single object request to a peer.
    pub request_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_heads: DEFAULT_MAX_HEADS,
            max_filling_parallel: 0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.request_timeout.is_zero(),
            "request timeout must be non-zero"
        );

        Ok(())
    }

    /// Effective walker concurrency cap.
    pub fn filling_parallel(&self) -> usize {
        if self.max_filling_parallel == 0 {
            MAX_FILLING_PARALLEL_FALLBACK
        } else {
            self.max_filling_parallel
        }
    }
}
