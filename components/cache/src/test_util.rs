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
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use blockcache_storage::{
    err::{Result, UnavailableSnafu},
    Backend, ObjectBackend,
};
use blockcache_types::{chunk::Chunk, file::FileMeta, PartIndex};
use blockcache_utils::object_storage::new_memory_object_store;
use rand::RngCore;

use crate::{BlockStore, BlockStoreRef, Config};

/// An in-memory backend whose persist can be made to fail or hang.
#[derive(Debug)]
pub(crate) struct FaultyBackend {
    inner:           ObjectBackend,
    fail_persist:    AtomicU32,
    hang_persist:    AtomicBool,
    persist_calls:   AtomicUsize,
    get_chunk_calls: AtomicUsize,
}

impl FaultyBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner:           ObjectBackend::new(new_memory_object_store()),
            fail_persist:    AtomicU32::new(0),
            hang_persist:    AtomicBool::new(false),
            persist_calls:   AtomicUsize::new(0),
            get_chunk_calls: AtomicUsize::new(0),
        })
    }

    /// The next `n` persists fail.
    pub(crate) fn fail_next_persists(&self, n: u32) { self.fail_persist.store(n, Ordering::SeqCst); }

    /// Persists started while set never finish.
    pub(crate) fn set_hang(&self, hang: bool) { self.hang_persist.store(hang, Ordering::SeqCst); }

    pub(crate) fn persist_calls(&self) -> usize { self.persist_calls.load(Ordering::SeqCst) }

    pub(crate) fn get_chunk_calls(&self) -> usize { self.get_chunk_calls.load(Ordering::SeqCst) }

    pub(crate) fn reset_calls(&self) {
        self.persist_calls.store(0, Ordering::SeqCst);
        self.get_chunk_calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for FaultyBackend {
    async fn get_file_meta(&self, block_id: &str, name: &str) -> Result<Option<FileMeta>> {
        self.inner.get_file_meta(block_id, name).await
    }

    async fn get_chunks(
        &self,
        block_id: &str,
        name: &str,
        parts: &[PartIndex],
    ) -> Result<HashMap<PartIndex, Chunk>> {
        self.get_chunk_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_chunks(block_id, name, parts).await
    }

    async fn persist_entry(
        &self,
        meta: &FileMeta,
        chunks: &BTreeMap<PartIndex, Chunk>,
        truncate: bool,
    ) -> Result<()> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_persist.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let fail = self
            .fail_persist
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return UnavailableSnafu {
                reason: "injected persist failure",
            }
            .fail();
        }
        self.inner.persist_entry(meta, chunks, truncate).await
    }

    async fn insert_file(&self, meta: &FileMeta) -> Result<()> { self.inner.insert_file(meta).await }

    async fn delete_file(&self, block_id: &str, name: &str) -> Result<()> {
        self.inner.delete_file(block_id, name).await
    }

    async fn list_files(&self, block_id: &str) -> Result<Vec<FileMeta>> {
        self.inner.list_files(block_id).await
    }
}

/// A small partition keeps multi partition cases cheap.
pub(crate) const TEST_PART_SIZE: usize = 64;

pub(crate) fn test_config() -> Config {
    Config::default()
        .with_partition_size(TEST_PART_SIZE)
        .with_flush_interval(Duration::from_millis(50))
        .with_flush_timeout(Duration::from_secs(5))
}

pub(crate) fn new_store(config: Config) -> (BlockStoreRef, Arc<FaultyBackend>) {
    let backend = FaultyBackend::new();
    let store = BlockStore::new(config, backend.clone()).unwrap();
    (store, backend)
}

pub(crate) fn random_data(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}
