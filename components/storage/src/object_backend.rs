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
    fmt::{Debug, Formatter},
};

use async_trait::async_trait;
use blockcache_common::PartIndex;
use blockcache_types::{chunk::Chunk, file::FileMeta};
use blockcache_utils::object_storage::{is_not_found_error, ObjectStorage, ObjectStoragePath};
use bytes::Bytes;
use futures::{future::try_join_all, TryStreamExt};
use snafu::{ensure, ResultExt};
use tracing::debug;

use crate::{
    err::{CorruptionSnafu, ObjectStorageSnafu, Result, SerdeSnafu},
    Backend,
};

const ROOT: &str = "blocks";
const META_OBJECT: &str = "meta.json";
const PARTS_DIR: &str = "parts";
// crc32 trailer of every partition object.
const CHECKSUM_LEN: usize = 4;

/// ObjectBackend keeps block files in an object storage.
///
/// Layout of one file:
/// ```text
/// blocks/<block_id>/<name>/meta.json      the json encoded FileMeta
/// blocks/<block_id>/<name>/parts/<idx>    partition bytes + crc32 (le)
/// ```
/// Every path segment is escaped by the object storage path rules, so ids
/// and names may contain any character.
#[derive(Clone)]
pub struct ObjectBackend {
    storage: ObjectStorage,
}

impl Debug for ObjectBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectBackend {{ storage: {} }}", self.storage)
    }
}

impl ObjectBackend {
    pub fn new(storage: ObjectStorage) -> Self { Self { storage } }

    pub fn storage(&self) -> &ObjectStorage { &self.storage }

    async fn get_meta_at(&self, path: &ObjectStoragePath) -> Result<Option<FileMeta>> {
        let raw = match self.storage.get(path).await {
            Ok(r) => r.bytes().await.context(ObjectStorageSnafu)?,
            Err(e) if is_not_found_error(&e) => return Ok(None),
            Err(e) => return Err(e).context(ObjectStorageSnafu),
        };
        let meta = serde_json::from_slice(&raw).context(SerdeSnafu {
            key: path.to_string(),
        })?;
        Ok(Some(meta))
    }

    async fn put_meta(&self, meta: &FileMeta) -> Result<()> {
        let path = meta_path(&meta.block_id, &meta.name);
        let raw = serde_json::to_vec(meta).context(SerdeSnafu {
            key: path.to_string(),
        })?;
        self.storage
            .put(&path, Bytes::from(raw))
            .await
            .context(ObjectStorageSnafu)?;
        Ok(())
    }

    async fn get_part(&self, block_id: &str, name: &str, idx: PartIndex) -> Result<Option<Chunk>> {
        let path = part_path(block_id, name, idx);
        let raw = match self.storage.get(&path).await {
            Ok(r) => r.bytes().await.context(ObjectStorageSnafu)?,
            Err(e) if is_not_found_error(&e) => return Ok(None),
            Err(e) => return Err(e).context(ObjectStorageSnafu),
        };
        decode_part(&path, idx, raw).map(Some)
    }

    async fn delete_prefix(&self, prefix: &ObjectStoragePath) -> Result<usize> {
        let objects = self
            .storage
            .list(Some(prefix))
            .try_collect::<Vec<_>>()
            .await
            .context(ObjectStorageSnafu)?;
        let cnt = objects.len();
        for object in objects {
            match self.storage.delete(&object.location).await {
                Ok(()) => {}
                Err(e) if is_not_found_error(&e) => {}
                Err(e) => return Err(e).context(ObjectStorageSnafu),
            }
        }
        Ok(cnt)
    }
}

#[async_trait]
impl Backend for ObjectBackend {
    async fn get_file_meta(&self, block_id: &str, name: &str) -> Result<Option<FileMeta>> {
        self.get_meta_at(&meta_path(block_id, name)).await
    }

    async fn get_chunks(
        &self,
        block_id: &str,
        name: &str,
        parts: &[PartIndex],
    ) -> Result<HashMap<PartIndex, Chunk>> {
        let fetched =
            try_join_all(parts.iter().map(|&idx| self.get_part(block_id, name, idx))).await?;
        let chunks = fetched
            .into_iter()
            .flatten()
            .map(|c| (c.part_idx(), c))
            .collect::<HashMap<_, _>>();
        debug!(
            "fetched {}/{} partitions of {}/{}",
            chunks.len(),
            parts.len(),
            block_id,
            name
        );
        Ok(chunks)
    }

    async fn persist_entry(
        &self,
        meta: &FileMeta,
        chunks: &BTreeMap<PartIndex, Chunk>,
        truncate: bool,
    ) -> Result<()> {
        if truncate {
            let removed = self
                .delete_prefix(&parts_prefix(&meta.block_id, &meta.name))
                .await?;
            debug!("truncate {}: dropped {} partitions", meta.key(), removed);
        }
        try_join_all(chunks.values().map(|chunk| async move {
            self.storage
                .put(
                    &part_path(&meta.block_id, &meta.name, chunk.part_idx()),
                    encode_part(chunk.as_slice()),
                )
                .await
                .context(ObjectStorageSnafu)
        }))
        .await?;
        // the metadata goes last, so its size never covers partitions that
        // are not stored yet.
        self.put_meta(meta).await
    }

    async fn insert_file(&self, meta: &FileMeta) -> Result<()> { self.put_meta(meta).await }

    async fn delete_file(&self, block_id: &str, name: &str) -> Result<()> {
        let removed = self.delete_prefix(&file_prefix(block_id, name)).await?;
        debug!("delete {}/{}: dropped {} objects", block_id, name, removed);
        Ok(())
    }

    async fn list_files(&self, block_id: &str) -> Result<Vec<FileMeta>> {
        let prefix = ObjectStoragePath::from_iter([ROOT, block_id]);
        let listing = self
            .storage
            .list_with_delimiter(Some(&prefix))
            .await
            .context(ObjectStorageSnafu)?;
        let mut files = Vec::with_capacity(listing.common_prefixes.len());
        for dir in listing.common_prefixes {
            if let Some(meta) = self.get_meta_at(&dir.child(META_OBJECT)).await? {
                files.push(meta);
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}

fn file_prefix(block_id: &str, name: &str) -> ObjectStoragePath {
    ObjectStoragePath::from_iter([ROOT, block_id, name])
}

fn meta_path(block_id: &str, name: &str) -> ObjectStoragePath {
    file_prefix(block_id, name).child(META_OBJECT)
}

fn parts_prefix(block_id: &str, name: &str) -> ObjectStoragePath {
    file_prefix(block_id, name).child(PARTS_DIR)
}

fn part_path(block_id: &str, name: &str, idx: PartIndex) -> ObjectStoragePath {
    parts_prefix(block_id, name).child(idx.to_string())
}

fn encode_part(data: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(data.len() + CHECKSUM_LEN);
    buf.extend_from_slice(data);
    buf.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    Bytes::from(buf)
}

fn decode_part(path: &ObjectStoragePath, idx: PartIndex, raw: Bytes) -> Result<Chunk> {
    ensure!(raw.len() >= CHECKSUM_LEN, CorruptionSnafu {
        key:      path.to_string(),
        part_idx: idx,
        reason:   format!("object too short: {} bytes", raw.len()),
    });
    let (data, checksum) = raw.split_at(raw.len() - CHECKSUM_LEN);
    let mut expected = [0u8; CHECKSUM_LEN];
    expected.copy_from_slice(checksum);
    let expected = u32::from_le_bytes(expected);
    let actual = crc32fast::hash(data);
    ensure!(expected == actual, CorruptionSnafu {
        key:      path.to_string(),
        part_idx: idx,
        reason:   format!("checksum mismatch: expect {:#x}, got {:#x}", expected, actual),
    });
    Ok(Chunk::from_data(idx, data.to_vec()))
}
