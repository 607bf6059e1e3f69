// Copyright 2024 kisekifs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    cmp::min,
    fmt::{Debug, Formatter},
};

use crate::{PartIndex, PartOffset};

/// Chunk holds the resident bytes of one partition of a block file.
///
/// The logical length never exceeds the partition size, every byte between
/// the logical length and the partition size reads as zero.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    part_idx: PartIndex,
    data:     Vec<u8>,
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chunk {{ part_idx: {}, len: {} }}", self.part_idx, self.data.len())
    }
}

impl Chunk {
    pub fn new(part_idx: PartIndex, part_size: usize) -> Self {
        Self {
            part_idx,
            data: Vec::with_capacity(part_size),
        }
    }

    /// Builds a chunk from bytes fetched from the durable store.
    pub fn from_data(part_idx: PartIndex, data: Vec<u8>) -> Self { Self { part_idx, data } }

    pub fn part_idx(&self) -> PartIndex { self.part_idx }

    pub fn len(&self) -> usize { self.data.len() }

    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    pub fn as_slice(&self) -> &[u8] { &self.data }

    /// Writes as much of `data` as fits before the partition boundary and
    /// returns how many bytes were taken. Growing the chunk zero-fills the
    /// gap between the old length and `part_offset`.
    pub fn write_at(&mut self, part_offset: PartOffset, data: &[u8], part_size: usize) -> usize {
        debug_assert!(
            part_offset < part_size,
            "part_offset: {} should be less than part_size: {}",
            part_offset,
            part_size
        );
        let to_write = min(part_size - part_offset, data.len());
        let end = part_offset + to_write;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[part_offset..end].copy_from_slice(&data[..to_write]);
        to_write
    }

    /// Copies `[part_offset, part_offset + dst.len())` into `dst`, bytes
    /// past the logical length are zero.
    pub fn read_at(&self, part_offset: PartOffset, dst: &mut [u8]) {
        let end = part_offset + dst.len();
        let avail = min(end, self.data.len());
        let copied = if part_offset < avail {
            let n = avail - part_offset;
            dst[..n].copy_from_slice(&self.data[part_offset..avail]);
            n
        } else {
            0
        };
        dst[copied..].fill(0);
    }
}
