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
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use blockcache_common::circular_floor;
use blockcache_storage::Backend;
use blockcache_types::{
    chunk::Chunk,
    file::{FileMeta, FileOpts, UserMeta},
    key::CacheKey,
    now_millis, FileOffset, PartIndex,
};
use bytes::{Bytes, BytesMut};
use snafu::{ensure, OptionExt, ResultExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::err::{AlreadyExistsSnafu, BackendSnafu, InvalidArgumentSnafu, NotFoundSnafu, Result};

/// CacheEntry is the cached state of one block file.
///
/// The state lives behind the entry's own lock, which is held for the whole
/// of a read, write or flush, backend calls included. `loaded` mirrors
/// whether the state holds metadata, so the store can decide on eviction
/// under its own lock without waiting for the entry lock.
pub(crate) struct CacheEntry {
    key:    CacheKey,
    loaded: Arc<AtomicBool>,
    state:  Mutex<EntryState>,
}

impl CacheEntry {
    pub(crate) fn new(key: CacheKey, part_size: usize) -> Self {
        let loaded = Arc::new(AtomicBool::new(false));
        Self {
            state: Mutex::new(EntryState {
                key: key.clone(),
                part_size,
                meta: None,
                chunks: BTreeMap::new(),
                flush_failures: 0,
                truncate: false,
                loaded: loaded.clone(),
            }),
            key,
            loaded,
        }
    }

    pub(crate) fn key(&self) -> &CacheKey { &self.key }

    /// Whether the entry holds metadata, which also means it may be dirty.
    pub(crate) fn is_loaded(&self) -> bool { self.loaded.load(Ordering::Acquire) }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, EntryState> { self.state.lock().await }
}

/// EntryState is what the entry lock protects.
///
/// When `meta` is present the entry is dirty: `meta` and every resident
/// chunk are newer than (or equal to) what the backend holds, and they are
/// cleared together once flushed.
pub struct EntryState {
    key:                       CacheKey,
    part_size:                 usize,
    pub(crate) meta:           Option<FileMeta>,
    pub(crate) chunks:         BTreeMap<PartIndex, Chunk>,
    pub(crate) flush_failures: u32,
    /// a replacing write happened, the next persist drops the partitions
    /// the backend still has.
    pub(crate) truncate:       bool,
    loaded:                    Arc<AtomicBool>,
}

impl EntryState {
    pub fn key(&self) -> &CacheKey { &self.key }

    pub fn meta(&self) -> Option<&FileMeta> { self.meta.as_ref() }

    pub fn is_dirty(&self) -> bool { self.meta.is_some() }

    pub fn chunk_count(&self) -> usize { self.chunks.len() }

    pub fn flush_failures(&self) -> u32 { self.flush_failures }

    /// Drops the metadata and all resident chunks and resets the failure
    /// counter, after this the entry may be evicted.
    pub fn clear(&mut self) {
        self.meta = None;
        self.chunks.clear();
        self.flush_failures = 0;
        self.truncate = false;
        self.loaded.store(false, Ordering::Release);
    }

    /// Loads the metadata into the entry, making it eligible for writes.
    pub async fn load(&mut self, backend: &dyn Backend) -> Result<&mut FileMeta> {
        let meta = match self.meta.take() {
            Some(meta) => meta,
            None => {
                let meta = self.fetch_meta(backend).await?;
                debug!("{} loaded, size: {}", self.key, meta.size);
                meta
            }
        };
        self.loaded.store(true, Ordering::Release);
        Ok(self.meta.insert(meta))
    }

    /// The cached metadata if loaded, otherwise the backend's.
    pub async fn stat(&self, backend: &dyn Backend) -> Result<FileMeta> {
        Ok(self.load_for_read(backend).await?.into_owned())
    }

    /// Creates the file in the backend, it must not exist in the cache nor
    /// in the backend.
    pub async fn create(
        &self,
        backend: &dyn Backend,
        opts: FileOpts,
        meta: UserMeta,
    ) -> Result<()> {
        let exists = self.is_dirty()
            || backend
                .get_file_meta(&self.key.block_id, &self.key.name)
                .await
                .context(BackendSnafu)?
                .is_some();
        ensure!(!exists, AlreadyExistsSnafu {
            block_id: self.key.block_id.clone(),
            name:     self.key.name.clone(),
        });

        let file = FileMeta::new(self.key.block_id.clone(), self.key.name.clone(), opts, meta);
        backend.insert_file(&file).await.context(BackendSnafu)?;
        debug!("{} created", self.key);
        Ok(())
    }

    /// Deletes the file from the backend and drops everything cached.
    pub async fn delete(&mut self, backend: &dyn Backend) -> Result<()> {
        backend
            .delete_file(&self.key.block_id, &self.key.name)
            .await
            .context(BackendSnafu)?;
        self.clear();
        Ok(())
    }

    /// Replaces the user metadata, or with `merge` set merges into it.
    pub async fn write_meta(
        &mut self,
        backend: &dyn Backend,
        meta: UserMeta,
        merge: bool,
    ) -> Result<()> {
        let file = self.load(backend).await?;
        if merge {
            file.merge_meta(meta);
        } else {
            file.meta = meta;
        }
        file.mod_ts = now_millis();
        Ok(())
    }

    /// Returns the metadata without populating the entry, a read never
    /// makes an entry dirty.
    async fn load_for_read(&self, backend: &dyn Backend) -> Result<Cow<'_, FileMeta>> {
        match &self.meta {
            Some(meta) => Ok(Cow::Borrowed(meta)),
            None => Ok(Cow::Owned(self.fetch_meta(backend).await?)),
        }
    }

    async fn fetch_meta(&self, backend: &dyn Backend) -> Result<FileMeta> {
        backend
            .get_file_meta(&self.key.block_id, &self.key.name)
            .await
            .context(BackendSnafu)?
            .context(NotFoundSnafu {
                block_id: self.key.block_id.clone(),
                name:     self.key.name.clone(),
            })
    }

    /// The partitions to fetch from the backend. None while a replacing
    /// write is unflushed: the backend still holds the replaced content, the
    /// partitions not resident are holes.
    fn missing_parts(&self, parts: &[PartIndex]) -> Vec<PartIndex> {
        if self.truncate {
            return Vec::new();
        }
        let mut missing = parts
            .iter()
            .copied()
            .filter(|idx| !self.chunks.contains_key(idx))
            .collect::<Vec<_>>();
        missing.sort_unstable();
        missing.dedup();
        missing
    }

    /// Makes the given partitions resident, fetching those not in memory yet
    /// in one backend call. Partitions the backend doesn't have stay absent,
    /// and so do all of them after a replacing write.
    pub async fn load_parts(&mut self, backend: &dyn Backend, parts: &[PartIndex]) -> Result<()> {
        let missing = self.missing_parts(parts);
        if missing.is_empty() {
            return Ok(());
        }
        let fetched = backend
            .get_chunks(&self.key.block_id, &self.key.name, &missing)
            .await
            .context(BackendSnafu)?;
        debug!(
            "{} loaded {}/{} partitions",
            self.key,
            fetched.len(),
            missing.len()
        );
        self.chunks.extend(fetched);
        Ok(())
    }

    /// Writes `data` at `offset` into the resident partitions, never touching
    /// the backend. With `replace` set all resident partitions are dropped
    /// first and the size becomes the end of this write.
    ///
    /// The metadata must be loaded. Both checks happen before anything is
    /// modified, so a failed write leaves the entry as it was.
    pub fn write_at(&mut self, offset: FileOffset, data: &[u8], replace: bool) -> Result<()> {
        ensure!(offset >= 0, InvalidArgumentSnafu {
            reason: format!("offset cannot be negative: {}", offset),
        });
        let Some(end) = offset.checked_add(data.len() as FileOffset) else {
            return InvalidArgumentSnafu {
                reason: format!("write of {} bytes at {} overflows", data.len(), offset),
            }
            .fail();
        };
        let part_size = self.part_size;
        let Some(meta) = self.meta.as_mut() else {
            return InvalidArgumentSnafu {
                reason: format!("{} is not loaded", self.key),
            }
            .fail();
        };

        if replace {
            self.chunks.clear();
            self.truncate = true;
        }
        for span in meta.locate(offset, data.len(), part_size) {
            let chunk = self
                .chunks
                .entry(span.part_idx)
                .or_insert_with(|| Chunk::new(span.part_idx, part_size));
            let written = chunk.write_at(
                span.part_offset,
                &data[span.buf_start_at..span.buf_start_at + span.len],
                part_size,
            );
            debug_assert_eq!(written, span.len);
        }

        if replace || end > meta.size {
            meta.size = end;
        }
        meta.mod_ts = now_millis();
        Ok(())
    }

    /// Reads up to `size` bytes at `offset`, or everything from `offset` on
    /// with `read_full`. Returns the offset actually served together with
    /// the data: a circular file only keeps its latest `max_size` bytes, a
    /// read starting before them is moved forward.
    ///
    /// Partitions that were never written nor persisted read as zeros.
    pub async fn read_at(
        &self,
        backend: &dyn Backend,
        offset: FileOffset,
        size: FileOffset,
        read_full: bool,
    ) -> Result<(FileOffset, Bytes)> {
        ensure!(offset >= 0, InvalidArgumentSnafu {
            reason: format!("offset cannot be negative: {}", offset),
        });
        ensure!(read_full || size >= 0, InvalidArgumentSnafu {
            reason: format!("size cannot be negative: {}", size),
        });
        let file = self.load_for_read(backend).await?;

        // both sides are non-negative, the differences can't overflow.
        let mut offset = offset;
        let mut size = if read_full {
            file.size - offset
        } else {
            size.min(file.size - offset)
        };
        if file.opts.circular {
            let floor = circular_floor(file.size, file.opts.max_size);
            if offset < floor {
                debug!("{} read at {} moved to {}", self.key, offset, floor);
                offset = floor;
            }
            size = size.min(file.size - offset);
        }
        if size <= 0 {
            return Ok((offset, Bytes::new()));
        }

        let spans = file.locate(offset, size as usize, self.part_size);
        let wanted = spans.iter().map(|s| s.part_idx).collect::<Vec<_>>();
        let missing = self.missing_parts(&wanted);
        let fetched = if missing.is_empty() {
            HashMap::new()
        } else {
            backend
                .get_chunks(&self.key.block_id, &self.key.name, &missing)
                .await
                .context(BackendSnafu)?
        };

        let mut buf = BytesMut::zeroed(size as usize);
        for span in spans {
            let chunk = self
                .chunks
                .get(&span.part_idx)
                .or_else(|| fetched.get(&span.part_idx));
            // an absent partition is a hole, the buffer is already zeroed.
            if let Some(chunk) = chunk {
                chunk.read_at(
                    span.part_offset,
                    &mut buf[span.buf_start_at..span.buf_start_at + span.len],
                );
            }
        }
        Ok((offset, buf.freeze()))
    }
}
