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

use std::time::Duration;

use blockcache_common::{
    DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_TIMEOUT, DEFAULT_PARTITION_SIZE, MAX_FLUSH_FAILURES,
};
use blockcache_utils::env::{var_millis, var_parsed};
use serde::{Deserialize, Serialize};
use snafu::{ensure_whatever, Whatever};

pub const ENV_PARTITION_SIZE: &str = "BLOCKCACHE_PARTITION_SIZE";
pub const ENV_MAX_FLUSH_FAILURES: &str = "BLOCKCACHE_MAX_FLUSH_FAILURES";
pub const ENV_FLUSH_INTERVAL_MS: &str = "BLOCKCACHE_FLUSH_INTERVAL_MS";
pub const ENV_FLUSH_TIMEOUT_MS: &str = "BLOCKCACHE_FLUSH_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// The capacity of one partition, the unit of residency and of transfer
    /// to the backend. Circular files round their size up to it.
    pub partition_size:     usize,
    /// How many consecutive failed flushes an entry survives, the next one
    /// drops its dirty data.
    pub max_flush_failures: u32,
    /// How often the background flusher writes dirty entries back.
    pub flush_interval:     Duration,
    /// The upper bound of one persist call, a timeout is transient.
    pub flush_timeout:      Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            partition_size:     DEFAULT_PARTITION_SIZE, // 64KiB
            max_flush_failures: MAX_FLUSH_FAILURES,
            flush_interval:     DEFAULT_FLUSH_INTERVAL,
            flush_timeout:      DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

impl Config {
    /// The default config overridden by the `BLOCKCACHE_*` environment
    /// variables (a `.env` file is honored).
    pub fn from_env() -> Result<Self, Whatever> {
        let mut config = Self::default();
        if let Some(v) = var_parsed(ENV_PARTITION_SIZE)? {
            config.partition_size = v;
        }
        if let Some(v) = var_parsed(ENV_MAX_FLUSH_FAILURES)? {
            config.max_flush_failures = v;
        }
        if let Some(v) = var_millis(ENV_FLUSH_INTERVAL_MS)? {
            config.flush_interval = v;
        }
        if let Some(v) = var_millis(ENV_FLUSH_TIMEOUT_MS)? {
            config.flush_timeout = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Whatever> {
        ensure_whatever!(self.partition_size > 0, "partition size must be positive");
        ensure_whatever!(
            !self.flush_interval.is_zero(),
            "flush interval must be positive"
        );
        Ok(())
    }

    pub fn with_partition_size(mut self, partition_size: usize) -> Self {
        self.partition_size = partition_size;
        self
    }

    pub fn with_max_flush_failures(mut self, max_flush_failures: u32) -> Self {
        self.max_flush_failures = max_flush_failures;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }
}
