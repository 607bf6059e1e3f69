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

use std::fmt::{Display, Formatter};

use blockcache_types::key::CacheKey;
use snafu::{Location, Snafu};

/// Why a backend call was given up before it finished. Neither counts as a
/// flush failure, the call is safe to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut,
}

impl Display for Interrupt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Interrupt::Cancelled => write!(f, "cancelled"),
            Interrupt::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument {
        reason:   String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("file {}/{} not found", block_id, name))]
    NotFound {
        block_id: String,
        name:     String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("file {}/{} already exists", block_id, name))]
    AlreadyExists {
        block_id: String,
        name:     String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("backend call {}", cause))]
    Transient {
        cause:    Interrupt,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("backend error: {}", source))]
    Backend {
        #[snafu(implicit)]
        location: Location,
        source:   blockcache_storage::err::Error,
    },

    #[snafu(display("too many flush errors ({}), entry {} cleared: {}", failures, key, source))]
    FlushAbandoned {
        key:      CacheKey,
        failures: u32,
        #[snafu(implicit)]
        location: Location,
        source:   blockcache_storage::err::Error,
    },

    #[snafu(display("flush already in progress"))]
    FlushInProgress {
        #[snafu(implicit)]
        location: Location,
    },

    JoinErr {
        #[snafu(implicit)]
        location: Location,
        source:   tokio::task::JoinError,
    },
}

impl Error {
    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound { .. }) }

    /// Transient errors leave the cache untouched and may be retried.
    pub fn is_transient(&self) -> bool { matches!(self, Error::Transient { .. }) }
}

pub type Result<T> = std::result::Result<T, Error>;
