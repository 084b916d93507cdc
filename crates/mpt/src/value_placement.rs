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

//! The second external seam an upsert consults, alongside [`crate::statemachine::StateMachine`]
//! and [`crate::hash::HashProvider`]: how a leaf's own value bytes carry the
//! root of a nested subtrie (§4.6's "nested updates" — an account leaf's
//! value embedding its storage subtrie's root). The core treats value bytes
//! as opaque everywhere else; this is the one place it needs to read and
//! rewrite a slice of them, and only when a caller actually submits nested
//! updates.

use triedb_pool::offset::PhysicalOffset;

/// Implemented by the external caller that wants nested updates (§4.6).
/// Never consulted unless an [`crate::engine::Update::Upsert`] carries a
/// non-empty `nested` list.
pub trait ValuePlacement: Send + Sync {
    /// Recovers the nested subtrie's current root from a leaf's existing
    /// value bytes, or `None` if this value doesn't carry one yet.
    fn extract_nested_root(&self, value: &[u8]) -> Option<PhysicalOffset>;

    /// Produces new value bytes with `nested_root` embedded, replacing
    /// whatever root `value` previously carried (if any).
    fn embed_nested_root(&self, value: &[u8], nested_root: PhysicalOffset) -> Vec<u8>;
}

/// A fixed-layout placement that appends the nested root's packed 8-byte
/// encoding to the end of the value, after stripping any root a previous
/// call had appended. Simple, self-delimiting (the packed offset has a
/// known width), and a reasonable default for callers whose value format
/// doesn't otherwise reserve a slot for this — most don't need more.
pub struct TrailingOffsetPlacement;

const PACKED_OFFSET_LEN: usize = 8;

impl ValuePlacement for TrailingOffsetPlacement {
    fn extract_nested_root(&self, value: &[u8]) -> Option<PhysicalOffset> {
        if value.len() < PACKED_OFFSET_LEN {
            return None;
        }
        let (_, tail) = value.split_at(value.len() - PACKED_OFFSET_LEN);
        let mut packed = [0u8; PACKED_OFFSET_LEN];
        packed.copy_from_slice(tail);
        let offset = PhysicalOffset::from_raw(u64::from_le_bytes(packed));
        if offset.is_invalid() {
            None
        } else {
            Some(offset)
        }
    }

    fn embed_nested_root(&self, value: &[u8], nested_root: PhysicalOffset) -> Vec<u8> {
        let base = if value.len() >= PACKED_OFFSET_LEN && self.extract_nested_root(value).is_some() {
            &value[..value.len() - PACKED_OFFSET_LEN]
        } else {
            value
        };
        let mut out = Vec::with_capacity(base.len() + PACKED_OFFSET_LEN);
        out.extend_from_slice(base);
        out.extend_from_slice(&nested_root.raw().to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_embed_then_extract() {
        let placement = TrailingOffsetPlacement;
        let root = PhysicalOffset::new(3, 4096, 1);
        let value = placement.embed_nested_root(b"account-body", root);
        assert_eq!(placement.extract_nested_root(&value), Some(root));
        assert!(value.starts_with(b"account-body"));
    }

    #[test]
    fn re_embedding_replaces_the_prior_root_rather_than_appending() {
        let placement = TrailingOffsetPlacement;
        let first = PhysicalOffset::new(1, 0, 1);
        let second = PhysicalOffset::new(2, 4096, 1);
        let v1 = placement.embed_nested_root(b"body", first);
        let v2 = placement.embed_nested_root(&v1, second);
        assert_eq!(v2.len(), v1.len());
        assert_eq!(placement.extract_nested_root(&v2), Some(second));
    }

    #[test]
    fn short_values_with_no_embedded_root_extract_none() {
        let placement = TrailingOffsetPlacement;
        assert_eq!(placement.extract_nested_root(b"tiny"), None);
    }
}
