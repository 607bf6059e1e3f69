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

use blockcache_common::PartIndex;
use snafu::{Location, Snafu};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("object storage failed: {}", source))]
    ObjectStorage {
        #[snafu(implicit)]
        location: Location,
        source:   blockcache_utils::object_storage::ObjectStorageError,
    },

    #[snafu(display("failed to encode or decode the metadata of {}", key))]
    Serde {
        key:      String,
        #[snafu(implicit)]
        location: Location,
        source:   serde_json::Error,
    },

    #[snafu(display("partition {} of {} is corrupted: {}", part_idx, key, reason))]
    Corruption {
        key:      String,
        part_idx: PartIndex,
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },

    /// The backend cannot serve requests right now, for backends which
    /// are not built on the object storage.
    #[snafu(display("backend unavailable: {}", reason))]
    Unavailable {
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
