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

use std::collections::BTreeMap;

use blockcache_common::{align_to_partition, locate_parts, PartSpan};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{key::CacheKey, now_millis, FileOffset, PartIndex};

/// Free-form user metadata attached to a block file.
pub type UserMeta = serde_json::Map<String, Value>;

/// How a block file stores its bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOpts {
    /// The retained byte budget of a circular file, ignored otherwise.
    pub max_size: FileOffset,
    /// A circular file keeps only its latest `max_size` bytes, older
    /// partitions are overwritten in place.
    pub circular: bool,
}

impl FileOpts {
    pub fn circular(max_size: FileOffset) -> Self {
        Self {
            max_size,
            circular: true,
        }
    }

    /// Rounds `max_size` up to a whole number of partitions.
    pub fn aligned(self, part_size: usize) -> Self {
        Self {
            max_size: align_to_partition(self.max_size, part_size),
            ..self
        }
    }
}

/// The metadata of a block file: its identity, size and options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub block_id:   String,
    pub name:       String,
    /// The logical size, it only grows for circular files even though just
    /// the last `opts.max_size` bytes can be read back.
    pub size:       FileOffset,
    pub created_ts: i64,
    pub mod_ts:     i64,
    pub opts:       FileOpts,
    #[serde(default)]
    pub meta:       UserMeta,
}

impl FileMeta {
    pub fn new(
        block_id: impl Into<String>,
        name: impl Into<String>,
        opts: FileOpts,
        meta: UserMeta,
    ) -> Self {
        let now = now_millis();
        Self {
            block_id: block_id.into(),
            name: name.into(),
            size: 0,
            created_ts: now,
            mod_ts: now,
            opts,
            meta,
        }
    }

    pub fn key(&self) -> CacheKey { CacheKey::new(self.block_id.clone(), self.name.clone()) }

    /// How many partitions a circular file cycles through, `None` for a
    /// plain file. An unaligned `max_size` rounds up, so the partitions
    /// always hold at least the last `max_size` bytes.
    pub fn max_parts(&self, part_size: usize) -> Option<usize> {
        if self.opts.circular && self.opts.max_size > 0 {
            Some((self.opts.max_size as usize).div_ceil(part_size))
        } else {
            None
        }
    }

    pub fn locate(&self, offset: FileOffset, len: usize, part_size: usize) -> Vec<PartSpan> {
        locate_parts(offset, len, part_size, self.max_parts(part_size))
    }

    /// The partitions a write of `len` bytes at `offset` only covers partly.
    /// Those must be resident before the write, otherwise the flushed
    /// partition would lose the bytes around the written range.
    pub fn incomplete_parts(
        &self,
        offset: FileOffset,
        len: usize,
        part_size: usize,
    ) -> Vec<PartIndex> {
        // a circular write may visit the same partition twice, the last
        // visit decides.
        let mut covered = BTreeMap::new();
        for span in self.locate(offset, len, part_size) {
            covered.insert(span.part_idx, span.is_full(part_size));
        }
        covered
            .into_iter()
            .filter_map(|(idx, full)| (!full).then_some(idx))
            .collect()
    }

    /// Merges `update` into the user metadata, a `null` value removes the
    /// key.
    pub fn merge_meta(&mut self, update: UserMeta) {
        for (k, v) in update {
            if v.is_null() {
                self.meta.remove(&k);
            } else {
                self.meta.insert(k, v);
            }
        }
    }
}
