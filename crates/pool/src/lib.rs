// Copyright 2026 The TrieDB Authors.
// This file is part of triedb.

// triedb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// triedb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with triedb.  If not, see <http://www.gnu.org/licenses/>.

//! Raw chunked storage pool.
//!
//! Carves one or more backing devices (block devices or plain files) into
//! fixed-capacity chunks, keeps two redundant on-device metadata mirrors, and
//! hands out read/write activations to chunks on the free/fast/slow lists.
//! This crate owns nothing above the byte level: node layout, caching and
//! trie semantics live in `triedb-mpt`.

#[macro_use]
extern crate log;

pub mod config;
pub mod device;
pub mod error;
pub mod metadata;
pub mod offset;
pub mod ring;

pub use config::{PoolConfig, PoolMode};
pub use device::{ChunkActivation, ChunkKind, Device, StoragePool};
pub use error::{PoolError, PoolResult};
pub use metadata::{ChunkList, ChunkMetadata, MetadataMirror};
pub use offset::{PhysicalOffset, VirtualOffset};
pub use ring::RootOffsetRing;

/// Page granularity used for aligned reads throughout the pool.
pub const DISK_PAGE: u64 = 4096;

/// 4-byte magic written to the tail footer of every device.
pub const DEVICE_MAGIC: [u8; 4] = *b"MND0";

/// Number of conventional (random-access) chunks reserved per device for
/// metadata mirrors and externally supplied boot state.
pub const CONVENTIONAL_CHUNKS_PER_DEVICE: usize = 3;
