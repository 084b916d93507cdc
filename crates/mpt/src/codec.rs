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

//! On-disk node layout (§4.4, §6): a compact bitmask-addressed radix-16
//! node with packed path nibbles, child offsets carrying a pages-to-read
//! hint, an optional value, and an optional precomputed subtree hash.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use triedb_pool::offset::PhysicalOffset;

use crate::nibble::{self, NibbleVec};

const FLAG_HAS_VALUE: u8 = 0b0000_0001;
const FLAG_HAS_HASH: u8 = 0b0000_0010;
const FLAG_ODD_NIBBLES: u8 = 0b0000_0100;

/// One trie node in its in-memory, already-deserialized form.
#[derive(Debug, Clone)]
pub struct Node {
    /// One bit per nibble (0..16); bit `i` set means child `i` is present.
    pub child_mask: u16,
    pub path: NibbleVec,
    /// Physical offsets of present children, in ascending nibble-index
    /// order (i.e. aligned with the set bits of `child_mask`).
    pub children: Vec<PhysicalOffset>,
    pub value: Option<Vec<u8>>,
    pub cached_hash: Option<[u8; 32]>,
}

impl Node {
    pub fn leaf(path: NibbleVec, value: Vec<u8>) -> Self {
        Node {
            child_mask: 0,
            path,
            children: Vec::new(),
            value: Some(value),
            cached_hash: None,
        }
    }

    pub fn branch(path: NibbleVec, child_mask: u16, children: Vec<PhysicalOffset>, value: Option<Vec<u8>>) -> Self {
        Node {
            child_mask,
            path,
            children,
            value,
            cached_hash: None,
        }
    }

    /// A node is a leaf if its path reaches full key depth (no children)
    /// and it carries a value; otherwise it is a branch, which may itself
    /// carry a value for nested tries (e.g. an account leaf whose value is
    /// itself the root of a storage subtrie).
    pub fn is_leaf(&self) -> bool {
        self.child_mask == 0 && self.value.is_some()
    }

    pub fn child_count(&self) -> u32 {
        self.child_mask.count_ones()
    }

    /// Index into `children`/iteration order for nibble `n`, if present.
    pub fn child_slot(&self, n: u8) -> Option<usize> {
        if self.child_mask & (1 << n) == 0 {
            return None;
        }
        let lower_mask = (1u16 << n) - 1;
        Some((self.child_mask & lower_mask).count_ones() as usize)
    }

    pub fn present_nibbles(&self) -> impl Iterator<Item = u8> + '_ {
        (0..16u8).filter(move |&n| self.child_mask & (1 << n) != 0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf).expect("writing to a Vec never fails");
        buf
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let odd = self.path.len() % 2 == 1;
        let mut flags = 0u8;
        if self.value.is_some() {
            flags |= FLAG_HAS_VALUE;
        }
        if self.cached_hash.is_some() {
            flags |= FLAG_HAS_HASH;
        }
        if odd {
            flags |= FLAG_ODD_NIBBLES;
        }
        w.write_u8(flags)?;
        w.write_u16::<LittleEndian>(self.child_mask)?;
        w.write_u8(self.path.len() as u8)?;
        w.write_all(&nibble::pack(&self.path))?;

        for &offset in &self.children {
            w.write_u64::<LittleEndian>(offset.raw())?;
        }

        if let Some(value) = &self.value {
            w.write_u32::<LittleEndian>(value.len() as u32)?;
            w.write_all(value)?;
        }

        if let Some(hash) = &self.cached_hash {
            w.write_all(hash)?;
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Node> {
        let mut cur = io::Cursor::new(bytes);
        Self::read_from(&mut cur)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Node> {
        let flags = r.read_u8()?;
        let has_value = flags & FLAG_HAS_VALUE != 0;
        let has_hash = flags & FLAG_HAS_HASH != 0;

        let child_mask = r.read_u16::<LittleEndian>()?;
        let n = r.read_u8()? as usize;
        let mut packed = vec![0u8; (n + 1) / 2];
        r.read_exact(&mut packed)?;
        let path = nibble::unpack(&packed, n);

        let child_count = child_mask.count_ones() as usize;
        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            children.push(PhysicalOffset::from_raw(r.read_u64::<LittleEndian>()?));
        }

        let value = if has_value {
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            Some(buf)
        } else {
            None
        };

        let cached_hash = if has_hash {
            let mut buf = [0u8; 32];
            r.read_exact(&mut buf)?;
            Some(buf)
        } else {
            None
        };

        Ok(Node {
            child_mask,
            path,
            children,
            value,
            cached_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn leaf_round_trips() {
        let node = Node::leaf(smallvec![0xa, 0xb, 0xc], b"value".to_vec());
        let encoded = node.encode();
        let decoded = Node::decode(&encoded).unwrap();
        assert_eq!(decoded.path.as_slice(), node.path.as_slice());
        assert_eq!(decoded.value, node.value);
        assert!(decoded.is_leaf());
    }

    #[test]
    fn branch_with_children_and_hash_round_trips() {
        let mut node = Node::branch(
            smallvec![0x1],
            (1 << 0) | (1 << 5),
            vec![PhysicalOffset::new(1, 100, 1), PhysicalOffset::new(2, 200, 2)],
            None,
        );
        node.cached_hash = Some([7u8; 32]);
        let encoded = node.encode();
        let decoded = Node::decode(&encoded).unwrap();
        assert_eq!(decoded.children.len(), 2);
        assert_eq!(decoded.cached_hash, Some([7u8; 32]));
        assert!(!decoded.is_leaf());
    }

    #[test]
    fn child_slot_counts_lower_set_bits() {
        let node = Node::branch(smallvec![], (1 << 2) | (1 << 5) | (1 << 9), vec![
            PhysicalOffset::new(0, 0, 1),
            PhysicalOffset::new(0, 0, 1),
            PhysicalOffset::new(0, 0, 1),
        ], None);
        assert_eq!(node.child_slot(2), Some(0));
        assert_eq!(node.child_slot(5), Some(1));
        assert_eq!(node.child_slot(9), Some(2));
        assert_eq!(node.child_slot(3), None);
    }

    #[test]
    fn odd_nibble_path_round_trips() {
        let node = Node::leaf(smallvec![0x1, 0x2, 0x3], b"v".to_vec());
        let encoded = node.encode();
        let decoded = Node::decode(&encoded).unwrap();
        assert_eq!(decoded.path.as_slice(), &[0x1, 0x2, 0x3]);
    }
}
