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

//! The block store: a registry of cache entries keyed by (block id, name).
//!
//! Two lock levels are involved:
//! 1. the store lock guards the map and the pin counts, it is only held for
//!    map lookups and counter arithmetic, never across a backend call.
//! 2. each entry's own lock serializes everything done to that entry, backend
//!    calls included, without blocking other entries.
//!
//! A pin bridges the two: an entry is found and pinned under the store lock,
//! then used under its own lock, and it can't be evicted in between. An
//! entry is evicted on unpin once nobody pins it and it holds no metadata.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use blockcache_storage::{Backend, BackendRef};
use blockcache_types::{
    file::{FileMeta, FileOpts, UserMeta},
    key::CacheKey,
    FileOffset,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use snafu::{ensure, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};

use crate::{
    config::Config,
    entry::{CacheEntry, EntryState},
    err::{
        BackendSnafu, Error, FlushInProgressSnafu, Interrupt, InvalidArgumentSnafu, Result,
        TransientSnafu,
    },
    flush::FlushContext,
    flusher::Flusher,
};

pub type BlockStoreRef = Arc<BlockStore>;

struct Slot {
    pin_count: usize,
    entry:     Arc<CacheEntry>,
}

pub struct BlockStore {
    config:            Config,
    backend:           BackendRef,
    entries:           Mutex<HashMap<CacheKey, Slot>>,
    // only one whole-cache flush at a time.
    flushing:          AtomicBool,
    flush_error_count: Arc<AtomicU64>,
    pub(crate) flusher: Mutex<Option<Flusher>>,
}

/// PinnedEntry keeps an entry in the store until it is dropped.
///
/// The entry lock guard returned by [PinnedEntry::lock] borrows the pin, so
/// the lock is always released before the pin. [BlockStore::with_entry] is
/// built on it; use the pair directly only where the work borrows data a
/// `with_entry` closure can't capture.
pub struct PinnedEntry<'s> {
    store: &'s BlockStore,
    entry: Arc<CacheEntry>,
}

impl PinnedEntry<'_> {
    pub fn key(&self) -> &CacheKey { self.entry.key() }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, EntryState> { self.entry.lock().await }
}

impl Drop for PinnedEntry<'_> {
    fn drop(&mut self) { self.store.unpin(&self.entry); }
}

impl BlockStore {
    pub fn new(config: Config, backend: BackendRef) -> Result<BlockStoreRef> {
        config.validate().map_err(|e| {
            InvalidArgumentSnafu {
                reason: e.to_string(),
            }
            .build()
        })?;
        Ok(Arc::new(Self {
            config,
            backend,
            entries: Mutex::new(HashMap::new()),
            flushing: AtomicBool::new(false),
            flush_error_count: Arc::new(AtomicU64::new(0)),
            flusher: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &Config { &self.config }

    pub fn backend(&self) -> &dyn Backend { self.backend.as_ref() }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot>> {
        // the map is consistent after every single operation on it, a
        // poisoned lock still guards valid data.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds or creates the entry and pins it. Never fails.
    pub fn pin(&self, block_id: &str, name: &str) -> PinnedEntry<'_> {
        let key = CacheKey::new(block_id, name);
        let mut entries = self.lock_entries();
        let slot = entries.entry(key).or_insert_with_key(|key| Slot {
            pin_count: 0,
            entry:     Arc::new(CacheEntry::new(key.clone(), self.config.partition_size)),
        });
        slot.pin_count += 1;
        PinnedEntry {
            store: self,
            entry: slot.entry.clone(),
        }
    }

    fn unpin(&self, entry: &Arc<CacheEntry>) {
        let mut entries = self.lock_entries();
        let Some(slot) = entries.get_mut(entry.key()) else {
            return;
        };
        debug_assert!(Arc::ptr_eq(&slot.entry, entry), "a pinned entry was replaced");
        slot.pin_count = slot.pin_count.saturating_sub(1);
        if slot.pin_count == 0 && !slot.entry.is_loaded() {
            entries.remove(entry.key());
        }
    }

    /// Runs `f` on the entry with the entry pinned and locked, the lock is
    /// released and the entry unpinned on every way out of `f`.
    pub async fn with_entry<T, F>(&self, block_id: &str, name: &str, f: F) -> Result<T>
    where
        F: for<'e> FnOnce(&'e mut EntryState) -> BoxFuture<'e, Result<T>>,
    {
        let pinned = self.pin(block_id, name);
        let mut entry = pinned.lock().await;
        let rtn = f(&mut *entry).await;
        drop(entry);
        rtn
    }

    pub fn is_cached(&self, block_id: &str, name: &str) -> bool {
        self.lock_entries()
            .contains_key(&CacheKey::new(block_id, name))
    }

    pub fn pin_count(&self, block_id: &str, name: &str) -> Option<usize> {
        self.lock_entries()
            .get(&CacheKey::new(block_id, name))
            .map(|slot| slot.pin_count)
    }

    /// The keys of all entries holding unflushed state.
    pub fn dirty_keys(&self) -> Vec<CacheKey> {
        let mut keys = self
            .lock_entries()
            .iter()
            .filter(|(_, slot)| slot.entry.is_loaded())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// The number of counted flush failures since the store was created.
    pub fn flush_error_count(&self) -> u64 { self.flush_error_count.load(Ordering::Relaxed) }

    fn flush_context(&self, cancel: CancellationToken) -> FlushContext {
        FlushContext {
            backend: self.backend.clone(),
            cancel,
            timeout: self.config.flush_timeout,
            max_failures: self.config.max_flush_failures,
            error_counter: self.flush_error_count.clone(),
        }
    }

    /// Creates an empty file in the backend. A circular file needs a
    /// positive `max_size`, which is rounded up to whole partitions.
    #[instrument(skip(self, meta))]
    pub async fn make_file(
        &self,
        block_id: &str,
        name: &str,
        meta: UserMeta,
        opts: FileOpts,
    ) -> Result<()> {
        ensure!(!block_id.is_empty() && !name.is_empty(), InvalidArgumentSnafu {
            reason: "block id and name must not be empty",
        });
        let opts = if opts.circular {
            ensure!(opts.max_size > 0, InvalidArgumentSnafu {
                reason: format!("circular file needs a positive max size, got {}", opts.max_size),
            });
            opts.aligned(self.config.partition_size)
        } else {
            opts
        };

        let backend = self.backend.clone();
        self.with_entry(block_id, name, move |entry| {
            Box::pin(async move { entry.create(backend.as_ref(), opts, meta).await })
        })
        .await
    }

    /// Deletes the file from the backend and drops whatever is cached. A
    /// missing file is not an error.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, block_id: &str, name: &str) -> Result<()> {
        let backend = self.backend.clone();
        self.with_entry(block_id, name, move |entry| {
            Box::pin(async move { entry.delete(backend.as_ref()).await })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_block(&self, block_id: &str) -> Result<()> {
        let mut names = self
            .backend
            .list_files(block_id)
            .await
            .context(BackendSnafu)?
            .into_iter()
            .map(|f| f.name)
            .collect::<BTreeSet<_>>();
        names.extend(
            self.dirty_keys()
                .into_iter()
                .filter(|key| key.block_id == block_id)
                .map(|key| key.name),
        );
        for name in names {
            self.delete_file(block_id, &name).await?;
        }
        Ok(())
    }

    /// The file's metadata, the cached copy if the entry is loaded.
    pub async fn stat(&self, block_id: &str, name: &str) -> Result<FileMeta> {
        let backend = self.backend.clone();
        self.with_entry(block_id, name, move |entry| {
            Box::pin(async move { entry.stat(backend.as_ref()).await })
        })
        .await
    }

    /// All files of a block, cached metadata wins over the backend's.
    pub async fn list_files(&self, block_id: &str) -> Result<Vec<FileMeta>> {
        let mut files = self
            .backend
            .list_files(block_id)
            .await
            .context(BackendSnafu)?;
        for file in files.iter_mut() {
            let key = file.key();
            let cached = self
                .with_entry(&key.block_id, &key.name, |entry| {
                    Box::pin(async move { Ok::<_, Error>(entry.meta().cloned()) })
                })
                .await?;
            if let Some(meta) = cached {
                *file = meta;
            }
        }
        Ok(files)
    }

    /// Replaces the user metadata, or with `merge` set merges into it where a
    /// `null` value removes the key.
    #[instrument(skip(self, meta))]
    pub async fn write_meta(
        &self,
        block_id: &str,
        name: &str,
        meta: UserMeta,
        merge: bool,
    ) -> Result<()> {
        let backend = self.backend.clone();
        self.with_entry(block_id, name, move |entry| {
            Box::pin(async move { entry.write_meta(backend.as_ref(), meta, merge).await })
        })
        .await
    }

    // The writes below borrow the caller's buffer, which a `with_entry`
    // closure can't hold, so they keep the pin and the entry lock themselves.

    /// Replaces the whole content of the file. The truncation is flushed
    /// right away.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write_file(&self, block_id: &str, name: &str, data: &[u8]) -> Result<()> {
        let ctx = self.flush_context(CancellationToken::new());
        let pinned = self.pin(block_id, name);
        let mut entry = pinned.lock().await;
        entry.load(self.backend.as_ref()).await?;
        entry.write_at(0, data, true)?;
        entry.flush(&ctx).await?;
        Ok(())
    }

    /// Writes `data` at `offset`, a write past the end leaves a zero-filled
    /// hole. The partitions only partly covered by the write are loaded
    /// first so their other bytes survive the next flush.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write_at(
        &self,
        block_id: &str,
        name: &str,
        offset: FileOffset,
        data: &[u8],
    ) -> Result<()> {
        ensure!(offset >= 0, InvalidArgumentSnafu {
            reason: format!("offset cannot be negative: {}", offset),
        });
        ensure!(
            offset.checked_add(data.len() as FileOffset).is_some(),
            InvalidArgumentSnafu {
                reason: format!("write of {} bytes at {} overflows", data.len(), offset),
            }
        );
        let pinned = self.pin(block_id, name);
        let mut entry = pinned.lock().await;
        let file = entry.load(self.backend.as_ref()).await?;
        let parts = file.incomplete_parts(offset, data.len(), self.config.partition_size);
        entry.load_parts(self.backend.as_ref(), &parts).await?;
        entry.write_at(offset, data, false)
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn append_data(&self, block_id: &str, name: &str, data: &[u8]) -> Result<()> {
        let pinned = self.pin(block_id, name);
        let mut entry = pinned.lock().await;
        let file = entry.load(self.backend.as_ref()).await?;
        let offset = file.size;
        let parts = file.incomplete_parts(offset, data.len(), self.config.partition_size);
        entry.load_parts(self.backend.as_ref(), &parts).await?;
        entry.write_at(offset, data, false)
    }

    /// Reads up to `size` bytes at `offset`, a `size` past the end is
    /// clamped to it. The returned offset is the one actually served, it
    /// differs from `offset` when a circular file has already overwritten the
    /// requested range.
    pub async fn read_at(
        &self,
        block_id: &str,
        name: &str,
        offset: FileOffset,
        size: FileOffset,
    ) -> Result<(FileOffset, Bytes)> {
        let backend = self.backend.clone();
        self.with_entry(block_id, name, move |entry| {
            Box::pin(async move { entry.read_at(backend.as_ref(), offset, size, false).await })
        })
        .await
    }

    /// Reads the whole retrievable content of the file.
    pub async fn read_file(&self, block_id: &str, name: &str) -> Result<(FileOffset, Bytes)> {
        let backend = self.backend.clone();
        self.with_entry(block_id, name, move |entry| {
            Box::pin(async move { entry.read_at(backend.as_ref(), 0, 0, true).await })
        })
        .await
    }

    /// Flushes one entry under its lock.
    #[instrument(skip(self, cancel))]
    pub async fn flush_entry(
        &self,
        block_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = self.flush_context(cancel.clone());
        self.with_entry(block_id, name, move |entry| {
            Box::pin(async move { entry.flush(&ctx).await })
        })
        .await
    }

    /// Flushes every dirty entry. A failing entry doesn't stop the others,
    /// the last error is returned. Cancellation stops right away.
    pub async fn flush_all(&self, cancel: &CancellationToken) -> Result<()> {
        ensure!(
            self.flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            FlushInProgressSnafu
        );
        let _flushing = scopeguard::guard(&self.flushing, |flushing| {
            flushing.store(false, Ordering::Release)
        });

        let mut last_err = None;
        for key in self.dirty_keys() {
            let r = self.flush_entry(&key.block_id, &key.name, cancel).await;
            if cancel.is_cancelled() {
                return TransientSnafu {
                    cause: Interrupt::Cancelled,
                }
                .fail();
            }
            if let Err(e) = r {
                error!("failed to flush {}: {}", key, e);
                last_err = Some(e);
            }
        }
        last_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blockcache_utils::logger::install_fmt_log;
    use serde_json::json;

    use super::*;
    use crate::{
        err::Error,
        test_util::{new_store, random_data, test_config, TEST_PART_SIZE},
    };

    const P: usize = TEST_PART_SIZE;

    async fn store_with_file(name: &str) -> (BlockStoreRef, std::sync::Arc<crate::test_util::FaultyBackend>) {
        let (store, backend) = new_store(test_config());
        store
            .make_file("b1", name, UserMeta::new(), FileOpts::default())
            .await
            .unwrap();
        (store, backend)
    }

    fn user_meta(v: serde_json::Value) -> UserMeta {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    async fn flush(store: &BlockStore, name: &str) {
        store
            .flush_entry("b1", name, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn write_then_read() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        let data = random_data(5 * P + 7);
        store.write_at("b1", "f", 5, &data).await.unwrap();

        let (offset, read) = store.read_at("b1", "f", 5, data.len() as i64).await.unwrap();
        assert_eq!(offset, 5);
        assert_eq!(&read[..], &data[..]);

        flush(&store, "f").await;
        assert!(!store.is_cached("b1", "f"));
        let (_, read) = store.read_at("b1", "f", 5, data.len() as i64).await.unwrap();
        assert_eq!(&read[..], &data[..]);
        // a read never leaves anything behind.
        assert!(!store.is_cached("b1", "f"));
    }

    #[tokio::test]
    async fn hole_reads_as_zeros() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        let at = 3 * P as i64 + 10;
        store.write_at("b1", "f", at, b"abc").await.unwrap();
        assert_eq!(store.stat("b1", "f").await.unwrap().size, at + 3);

        for _ in 0..2 {
            let (_, read) = store.read_file("b1", "f").await.unwrap();
            assert_eq!(read.len(), at as usize + 3);
            assert!(read[..at as usize].iter().all(|b| *b == 0));
            assert_eq!(&read[at as usize..], b"abc");
            // the second round reads from the backend.
            flush(&store, "f").await;
        }
    }

    #[tokio::test]
    async fn size_only_grows() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        store.append_data("b1", "f", &[1u8; 10]).await.unwrap();
        assert_eq!(store.stat("b1", "f").await.unwrap().size, 10);
        store.append_data("b1", "f", &[2u8; 5]).await.unwrap();
        assert_eq!(store.stat("b1", "f").await.unwrap().size, 15);
        store.write_at("b1", "f", 2, &[3u8; 3]).await.unwrap();
        assert_eq!(store.stat("b1", "f").await.unwrap().size, 15);

        let (_, read) = store.read_file("b1", "f").await.unwrap();
        let mut expected = vec![1u8; 10];
        expected[2..5].copy_from_slice(&[3u8; 3]);
        expected.extend_from_slice(&[2u8; 5]);
        assert_eq!(&read[..], &expected[..]);
    }

    #[tokio::test]
    async fn write_file_replaces() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, &random_data(4 * P)).await.unwrap();
        flush(&store, "f").await;

        store.write_file("b1", "f", b"xyz").await.unwrap();
        // flushed right away.
        assert!(!store.is_cached("b1", "f"));
        assert_eq!(store.stat("b1", "f").await.unwrap().size, 3);
        let (_, read) = store.read_file("b1", "f").await.unwrap();
        assert_eq!(&read[..], b"xyz");
        let (_, read) = store.read_at("b1", "f", 10, 5).await.unwrap();
        assert!(read.is_empty());

        let stale = backend.get_chunks("b1", "f", &[1, 2, 3]).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn circular_keeps_latest_bytes() {
        install_fmt_log();
        let (store, _) = new_store(test_config());
        store
            .make_file("b1", "log", UserMeta::new(), FileOpts::circular(2 * P as i64))
            .await
            .unwrap();
        let data = random_data(3 * P);
        for part in data.chunks(P) {
            store.append_data("b1", "log", part).await.unwrap();
        }

        let check = |offset: i64, read: Bytes| {
            assert_eq!(offset, P as i64);
            assert_eq!(&read[..], &data[P..]);
        };
        let (offset, read) = store.read_file("b1", "log").await.unwrap();
        check(offset, read);
        flush(&store, "log").await;
        let (offset, read) = store.read_file("b1", "log").await.unwrap();
        check(offset, read);

        // the oldest partition is gone, a read there starts at the floor.
        let (offset, read) = store.read_at("b1", "log", 0, 10).await.unwrap();
        assert_eq!(offset, P as i64);
        assert_eq!(&read[..], &data[P..P + 10]);
        let (offset, read) = store.read_at("b1", "log", 10, 3 * P as i64).await.unwrap();
        assert_eq!(offset, P as i64);
        assert_eq!(&read[..], &data[P..]);
    }

    #[tokio::test]
    async fn circular_size_is_aligned() {
        install_fmt_log();
        let (store, _) = new_store(test_config());
        store
            .make_file("b1", "log", UserMeta::new(), FileOpts::circular(P as i64 + 1))
            .await
            .unwrap();
        let file = store.stat("b1", "log").await.unwrap();
        assert!(file.opts.circular);
        assert_eq!(file.opts.max_size, 2 * P as i64);
    }

    #[tokio::test]
    async fn make_file_rejects() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        let err = store
            .make_file("b1", "f", UserMeta::new(), FileOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        let err = store
            .make_file("b1", "c", UserMeta::new(), FileOpts::circular(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));

        let err = store
            .make_file("b1", "", UserMeta::new(), FileOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(store.dirty_keys().is_empty());
    }

    #[tokio::test]
    async fn missing_file_and_bad_offsets() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        assert!(store.stat("b1", "nope").await.unwrap_err().is_not_found());
        assert!(store.read_file("b1", "nope").await.unwrap_err().is_not_found());
        assert!(store
            .write_at("b1", "nope", 0, b"x")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!store.is_cached("b1", "nope"));

        let err = store.write_at("b1", "f", -1, b"x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        let err = store.read_at("b1", "f", -1, 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        // past the end is simply empty.
        let (_, read) = store.read_at("b1", "f", 100, 10).await.unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn huge_sizes_are_clamped() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        store.write_at("b1", "f", 0, b"hello").await.unwrap();

        for _ in 0..2 {
            let (offset, read) = store.read_at("b1", "f", 1, i64::MAX).await.unwrap();
            assert_eq!(offset, 1);
            assert_eq!(&read[..], b"ello");
            let (_, read) = store.read_at("b1", "f", i64::MAX, i64::MAX).await.unwrap();
            assert!(read.is_empty());
            flush(&store, "f").await;
        }

        let err = store.read_at("b1", "f", 0, -1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        let err = store.write_at("b1", "f", i64::MAX, b"xy").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(store.stat("b1", "f").await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn huge_size_on_circular_file() {
        install_fmt_log();
        let (store, _) = new_store(test_config());
        store
            .make_file("b1", "log", UserMeta::new(), FileOpts::circular(P as i64))
            .await
            .unwrap();
        let data = random_data(2 * P);
        store.append_data("b1", "log", &data).await.unwrap();

        let (offset, read) = store.read_at("b1", "log", 0, i64::MAX).await.unwrap();
        assert_eq!(offset, P as i64);
        assert_eq!(&read[..], &data[P..]);
    }

    #[tokio::test]
    async fn failed_replace_never_exposes_old_content() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, &[7u8; 3 * P]).await.unwrap();
        flush(&store, "f").await;

        backend.fail_next_persists(1);
        assert!(store.write_file("b1", "f", b"xyz").await.is_err());
        // the backend still has the old partitions, none may come back.
        store.write_at("b1", "f", 2 * P as i64, b"e").await.unwrap();

        let mut expected = vec![0u8; 2 * P + 1];
        expected[..3].copy_from_slice(b"xyz");
        expected[2 * P] = b'e';

        let (_, read) = store.read_at("b1", "f", P as i64, 4).await.unwrap();
        assert_eq!(&read[..], &[0u8; 4]);
        let (_, read) = store.read_file("b1", "f").await.unwrap();
        assert_eq!(&read[..], &expected[..]);

        flush(&store, "f").await;
        assert!(backend.get_chunks("b1", "f", &[1]).await.unwrap().is_empty());
        let (_, read) = store.read_file("b1", "f").await.unwrap();
        assert_eq!(&read[..], &expected[..]);
    }

    #[tokio::test]
    async fn partial_write_after_flush_keeps_neighbours() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        let mut data = random_data(2 * P + 20);
        store.write_at("b1", "f", 0, &data).await.unwrap();
        flush(&store, "f").await;

        store.write_at("b1", "f", 10, b"XY").await.unwrap();
        store.write_at("b1", "f", P as i64 - 1, b"ZZ").await.unwrap();
        data[10..12].copy_from_slice(b"XY");
        data[P - 1..P + 1].copy_from_slice(b"ZZ");
        flush(&store, "f").await;

        let (_, read) = store.read_file("b1", "f").await.unwrap();
        assert_eq!(&read[..], &data[..]);
    }

    #[tokio::test]
    async fn read_fetches_in_one_batch() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, &random_data(4 * P)).await.unwrap();
        flush(&store, "f").await;
        backend.reset_calls();

        let (_, read) = store.read_at("b1", "f", 10, 3 * P as i64).await.unwrap();
        assert_eq!(read.len(), 3 * P);
        assert_eq!(backend.get_chunk_calls(), 1);
    }

    #[tokio::test]
    async fn pinned_entry_is_not_evicted() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;
        let pinned = store.pin("b1", "f");
        assert_eq!(store.pin_count("b1", "f"), Some(1));

        store.read_file("b1", "f").await.unwrap();
        assert_eq!(store.pin_count("b1", "f"), Some(1));
        assert!(store.is_cached("b1", "f"));

        drop(pinned);
        assert!(!store.is_cached("b1", "f"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_users_share_entry() {
        install_fmt_log();
        let (store, _) = store_with_file("f").await;

        let handles = (0..64u8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let observer = store.clone();
                    store
                        .with_entry("b1", "f", move |entry| {
                            Box::pin(async move {
                                assert!(observer.pin_count("b1", "f").unwrap_or(0) >= 1);
                                tokio::task::yield_now().await;
                                if i % 2 == 0 {
                                    entry.load(observer.backend()).await?;
                                    entry.write_at(i as i64, &[i], false)?;
                                }
                                Ok::<_, Error>(())
                            })
                        })
                        .await
                })
            })
            .collect::<Vec<_>>();
        for r in futures::future::join_all(handles).await {
            r.unwrap().unwrap();
        }

        assert_eq!(store.pin_count("b1", "f"), Some(0));
        assert_eq!(store.dirty_keys(), vec![CacheKey::new("b1", "f")]);
        flush(&store, "f").await;
        assert!(!store.is_cached("b1", "f"));

        let (_, read) = store.read_file("b1", "f").await.unwrap();
        assert_eq!(read.len(), 63);
        for (i, b) in read.iter().enumerate() {
            let expected = if i % 2 == 0 { i as u8 } else { 0 };
            assert_eq!(*b, expected);
        }
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, b"hello").await.unwrap();
        backend.reset_calls();

        flush(&store, "f").await;
        flush(&store, "f").await;
        store.flush_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(backend.persist_calls(), 1);
    }

    async fn flush_failures(store: &BlockStore) -> u32 {
        store
            .with_entry("b1", "f", |entry| {
                Box::pin(async move { Ok::<_, Error>(entry.flush_failures()) })
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn too_many_failures_drop_the_entry() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, b"lost").await.unwrap();
        backend.fail_next_persists(4);

        let cancel = CancellationToken::new();
        for i in 1..=3 {
            let err = store.flush_entry("b1", "f", &cancel).await.unwrap_err();
            assert!(matches!(err, Error::Backend { .. }), "{err}");
            assert!(store.is_cached("b1", "f"));
            assert_eq!(flush_failures(&store).await, i);
        }

        let err = store.flush_entry("b1", "f", &cancel).await.unwrap_err();
        match err {
            Error::FlushAbandoned { key, failures, .. } => {
                assert_eq!(key, CacheKey::new("b1", "f"));
                assert_eq!(failures, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.is_cached("b1", "f"));
        assert_eq!(store.flush_error_count(), 4);
        // the backend never got the data.
        assert_eq!(store.stat("b1", "f").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn success_resets_failures() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, b"a").await.unwrap();
        backend.fail_next_persists(2);
        let cancel = CancellationToken::new();
        assert!(store.flush_entry("b1", "f", &cancel).await.is_err());
        assert!(store.flush_entry("b1", "f", &cancel).await.is_err());
        store.flush_entry("b1", "f", &cancel).await.unwrap();

        store.write_at("b1", "f", 1, b"b").await.unwrap();
        assert_eq!(flush_failures(&store).await, 0);
        assert_eq!(store.flush_error_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_flush_is_not_counted() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, b"keep").await.unwrap();
        backend.set_hang(true);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = store.flush_entry("b1", "f", &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transient {
                cause: Interrupt::Cancelled,
                ..
            }
        ));
        assert_eq!(flush_failures(&store).await, 0);
        assert_eq!(store.flush_error_count(), 0);

        // three real failures still don't drop it.
        backend.set_hang(false);
        backend.fail_next_persists(3);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            assert!(store.flush_entry("b1", "f", &cancel).await.is_err());
        }
        assert!(store.is_cached("b1", "f"));
        store.flush_entry("b1", "f", &cancel).await.unwrap();
        let (_, read) = store.read_file("b1", "f").await.unwrap();
        assert_eq!(&read[..], b"keep");
    }

    #[tokio::test]
    async fn slow_persist_times_out() {
        install_fmt_log();
        let (store, backend) =
            new_store(test_config().with_flush_timeout(Duration::from_millis(100)));
        store
            .make_file("b1", "f", UserMeta::new(), FileOpts::default())
            .await
            .unwrap();
        store.write_at("b1", "f", 0, b"slow").await.unwrap();
        backend.set_hang(true);

        let err = store
            .flush_entry("b1", "f", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(
            err,
            Error::Transient {
                cause: Interrupt::TimedOut,
                ..
            }
        ));
        assert!(store.is_cached("b1", "f"));
        assert_eq!(flush_failures(&store).await, 0);
    }

    #[tokio::test]
    async fn one_flush_all_at_a_time() {
        install_fmt_log();
        let (store, backend) = store_with_file("f").await;
        store.write_at("b1", "f", 0, b"data").await.unwrap();
        backend.set_hang(true);

        let cancel = CancellationToken::new();
        let first = {
            let store = store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { store.flush_all(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = store
            .flush_all(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FlushInProgress { .. }));

        cancel.cancel();
        assert!(first.await.unwrap().unwrap_err().is_transient());

        backend.set_hang(false);
        store.flush_all(&CancellationToken::new()).await.unwrap();
        assert!(store.dirty_keys().is_empty());
    }

    #[tokio::test]
    async fn flush_all_continues_past_errors() {
        install_fmt_log();
        let (store, backend) = store_with_file("a").await;
        store
            .make_file("b1", "b", UserMeta::new(), FileOpts::default())
            .await
            .unwrap();
        store.write_at("b1", "a", 0, b"1").await.unwrap();
        store.write_at("b1", "b", 0, b"2").await.unwrap();
        // "a" is flushed first and fails.
        backend.fail_next_persists(1);

        let err = store
            .flush_all(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { .. }));
        assert_eq!(store.dirty_keys(), vec![CacheKey::new("b1", "a")]);
        assert_eq!(store.stat("b1", "b").await.unwrap().size, 1);
    }

    #[tokio::test]
    async fn meta_list_and_delete() {
        install_fmt_log();
        let (store, _) = store_with_file("x").await;
        store
            .make_file("b1", "y", UserMeta::new(), FileOpts::default())
            .await
            .unwrap();
        store
            .make_file("b2", "z", UserMeta::new(), FileOpts::default())
            .await
            .unwrap();
        store.write_at("b1", "x", 0, b"hello").await.unwrap();

        store
            .write_meta("b1", "y", user_meta(json!({"k": 1, "m": "v"})), false)
            .await
            .unwrap();
        store
            .write_meta("b1", "y", user_meta(json!({"k": null, "j": 2})), true)
            .await
            .unwrap();
        assert_eq!(
            store.stat("b1", "y").await.unwrap().meta,
            user_meta(json!({"m": "v", "j": 2}))
        );

        // unflushed sizes are visible.
        let files = store.list_files("b1").await.unwrap();
        let sizes = files
            .iter()
            .map(|f| (f.name.as_str(), f.size))
            .collect::<Vec<_>>();
        assert_eq!(sizes, vec![("x", 5), ("y", 0)]);

        store.delete_file("b1", "x").await.unwrap();
        assert!(store.stat("b1", "x").await.unwrap_err().is_not_found());
        assert!(!store.is_cached("b1", "x"));

        store.delete_block("b1").await.unwrap();
        assert!(store.list_files("b1").await.unwrap().is_empty());
        assert!(store.dirty_keys().is_empty());
        assert_eq!(store.list_files("b2").await.unwrap().len(), 1);
    }
}
