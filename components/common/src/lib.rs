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

use std::{cmp::min, time::Duration};

// 64 KiB
pub const DEFAULT_PARTITION_SIZE: usize = 64 << 10;

/// Consecutive counted flush failures tolerated before an entry is dropped.
pub const MAX_FLUSH_FAILURES: u32 = 3;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub type PartIndex = usize;
pub type PartOffset = usize;
/// Offsets and sizes are signed so that callers can hand us a negative
/// offset and get a proper error back instead of a wrapped value.
pub type FileOffset = i64;

/// Returns the partition an offset falls into, wrapping around `max_parts`
/// for circular files.
pub fn cal_part_idx(offset: FileOffset, part_size: usize, max_parts: Option<usize>) -> PartIndex {
    debug_assert!(offset >= 0, "offset {} should not be negative", offset);
    let idx = (offset as u64 / part_size as u64) as usize;
    match max_parts {
        Some(max) if max > 0 => idx % max,
        _ => idx,
    }
}

pub fn cal_part_offset(offset: FileOffset, part_size: usize) -> PartOffset {
    (offset as u64 % part_size as u64) as usize
}

/// The earliest offset still retrievable from a circular file.
pub fn circular_floor(file_size: FileOffset, max_size: FileOffset) -> FileOffset {
    if file_size > max_size {
        file_size - max_size
    } else {
        0
    }
}

/// Rounds `size` up to a whole number of partitions.
pub fn align_to_partition(size: FileOffset, part_size: usize) -> FileOffset {
    let part_size = part_size as FileOffset;
    let rem = size % part_size;
    if rem == 0 {
        size
    } else {
        size - rem + part_size
    }
}

/// One piece of a file range that lies inside a single partition.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct PartSpan {
    /// where this piece starts in the file
    pub file_offset: FileOffset,
    /// the partition it lands in, already wrapped for circular files
    pub part_idx: PartIndex,
    /// where this piece starts inside the partition
    pub part_offset: PartOffset,
    /// the length of this piece
    pub len: usize,
    /// where this piece starts in the caller's buffer
    pub buf_start_at: usize,
}

impl PartSpan {
    /// Whether the span covers its whole partition.
    pub fn is_full(&self, part_size: usize) -> bool { self.len == part_size }
}

/// Splits `[offset, offset + len)` into pieces that never cross a partition
/// boundary, in ascending file order.
pub fn locate_parts(
    offset: FileOffset,
    len: usize,
    part_size: usize,
    max_parts: Option<usize>,
) -> Vec<PartSpan> {
    debug_assert!(part_size > 0, "partition size should be positive");
    let mut spans = Vec::with_capacity(len / part_size + 2);
    let mut file_offset = offset;
    let mut buf_start_at = 0;
    while buf_start_at < len {
        let part_offset = cal_part_offset(file_offset, part_size);
        // don't exceed the partition boundary.
        let span_len = min(part_size - part_offset, len - buf_start_at);
        spans.push(PartSpan {
            file_offset,
            part_idx: cal_part_idx(file_offset, part_size, max_parts),
            part_offset,
            len: span_len,
            buf_start_at,
        });
        buf_start_at += span_len;
        file_offset += span_len as FileOffset;
    }
    spans
}
