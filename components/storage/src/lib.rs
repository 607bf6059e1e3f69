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

//! The durable side of the block cache.
//!
//! The cache only talks to a [Backend]: it fetches file metadata and
//! individual partitions from it, and persists a dirty entry (metadata plus
//! every resident partition) in one call. [ObjectBackend] is the provided
//! implementation on top of an object storage.

pub mod err;
mod object_backend;

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
};

use async_trait::async_trait;
use blockcache_common::PartIndex;
use blockcache_types::{chunk::Chunk, file::FileMeta};
pub use object_backend::ObjectBackend;

use crate::err::Result;

pub type BackendRef = Arc<dyn Backend>;

#[async_trait]
pub trait Backend: Send + Sync + Debug + 'static {
    /// Returns `None` if the file does not exist.
    async fn get_file_meta(&self, block_id: &str, name: &str) -> Result<Option<FileMeta>>;

    /// Fetches the requested partitions, partitions that were never stored
    /// are simply missing from the result.
    async fn get_chunks(
        &self,
        block_id: &str,
        name: &str,
        parts: &[PartIndex],
    ) -> Result<HashMap<PartIndex, Chunk>>;

    /// Persists the metadata together with the given partitions. With
    /// `truncate` set every previously stored partition is dropped first.
    async fn persist_entry(
        &self,
        meta: &FileMeta,
        chunks: &BTreeMap<PartIndex, Chunk>,
        truncate: bool,
    ) -> Result<()>;

    /// Stores the metadata of a new, empty file.
    async fn insert_file(&self, meta: &FileMeta) -> Result<()>;

    /// Removes the file and all its partitions, a missing file is not an
    /// error.
    async fn delete_file(&self, block_id: &str, name: &str) -> Result<()>;

    async fn list_files(&self, block_id: &str) -> Result<Vec<FileMeta>>;
}
