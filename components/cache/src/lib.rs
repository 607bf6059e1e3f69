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

//! A partitioned write-back cache of block files.
//!
//! Files are addressed by (block id, name) and split into fixed size
//! partitions. Writes land in memory and reach the [Backend] on flush,
//! either explicitly or from the background flusher. Reads are served from
//! memory where possible and from the backend otherwise.
//!
//! [Backend]: blockcache_storage::Backend

pub mod config;
mod entry;
pub mod err;
mod flush;
mod flusher;
mod store;
#[cfg(test)]
mod test_util;

use once_cell::sync::OnceCell;

pub use config::Config;
pub use entry::EntryState;
pub use flush::{decide, FlushDecision, FlushFailure};
pub use store::{BlockStore, BlockStoreRef, PinnedEntry};

static GLOBAL_STORE: OnceCell<BlockStoreRef> = OnceCell::new();

/// Installs the process wide store. Returns false if one is installed
/// already, the given store is dropped then.
pub fn init_global(store: BlockStoreRef) -> bool { GLOBAL_STORE.set(store).is_ok() }

pub fn global() -> Option<BlockStoreRef> { GLOBAL_STORE.get().cloned() }
