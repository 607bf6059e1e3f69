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

//! Writing a dirty entry back to the backend.
//!
//! One flush persists the metadata and every resident partition in a single
//! backend call. What happens to the entry afterwards is decided by
//! [decide]:
//! - success: the entry is cleared, the backend is now the only copy.
//! - cancelled or timed out: nothing changes and nothing is counted.
//! - any other failure: the failure is counted and the dirty state is kept
//!   for the next attempt, unless the count exceeds the limit, then the
//!   entry is cleared and its unflushed data is lost.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use blockcache_storage::BackendRef;
use snafu::IntoError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    entry::EntryState,
    err::{BackendSnafu, FlushAbandonedSnafu, Interrupt, Result, TransientSnafu},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushFailure {
    /// cancellation or timeout, never counted.
    Transient,
    /// a genuine backend failure, counted against the limit.
    Counted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// keep the dirty state, report the interruption.
    Retry,
    /// keep the dirty state, report the backend error.
    RetryWithError,
    /// drop the dirty state.
    Discard,
}

/// Decides the outcome of a failed flush, `failures` is the count of
/// consecutive counted failures including this one.
pub fn decide(failure: FlushFailure, failures: u32, max_failures: u32) -> FlushDecision {
    match failure {
        FlushFailure::Transient => FlushDecision::Retry,
        FlushFailure::Counted if failures > max_failures => FlushDecision::Discard,
        FlushFailure::Counted => FlushDecision::RetryWithError,
    }
}

/// Everything a flush needs besides the entry.
pub(crate) struct FlushContext {
    pub(crate) backend:       BackendRef,
    pub(crate) cancel:        CancellationToken,
    pub(crate) timeout:       Duration,
    pub(crate) max_failures:  u32,
    /// store wide count of counted failures.
    pub(crate) error_counter: Arc<AtomicU64>,
}

impl EntryState {
    /// Flushes the entry, see the module docs. A clean entry is a no-op.
    ///
    /// Must be called with the entry lock held.
    pub(crate) async fn flush(&mut self, ctx: &FlushContext) -> Result<()> {
        let Some(meta) = self.meta.as_ref() else {
            return Ok(());
        };

        let persist = ctx.backend.persist_entry(meta, &self.chunks, self.truncate);
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(Interrupt::Cancelled),
            r = tokio::time::timeout(ctx.timeout, persist) => r.map_err(|_| Interrupt::TimedOut),
        };
        // the persist may have finished just as we got cancelled, treat it
        // as interrupted, the data is simply written again next time.
        let outcome = match outcome {
            Ok(_) if ctx.cancel.is_cancelled() => Err(Interrupt::Cancelled),
            other => other,
        };

        let (failure, cause) = match outcome {
            Ok(Ok(())) => {
                debug!(
                    "{} flushed, {} partitions",
                    self.key(),
                    self.chunks.len()
                );
                self.clear();
                return Ok(());
            }
            Ok(Err(e)) => (FlushFailure::Counted, Ok(e)),
            Err(interrupt) => (FlushFailure::Transient, Err(interrupt)),
        };

        if failure == FlushFailure::Counted {
            self.flush_failures += 1;
            ctx.error_counter.fetch_add(1, Ordering::Relaxed);
        }
        let failures = self.flush_failures;
        match (decide(failure, failures, ctx.max_failures), cause) {
            (FlushDecision::Discard, Ok(e)) => {
                error!(
                    "{} dropped after {} failed flushes, unflushed data is lost: {}",
                    self.key(),
                    failures,
                    e
                );
                let key = self.key().clone();
                self.clear();
                Err(FlushAbandonedSnafu { key, failures }.into_error(e))
            }
            (_, Ok(e)) => {
                warn!(
                    "{} flush failed ({}/{}): {}",
                    self.key(),
                    failures,
                    ctx.max_failures,
                    e
                );
                Err(BackendSnafu.into_error(e))
            }
            (_, Err(cause)) => {
                debug!("{} flush {}", self.key(), cause);
                TransientSnafu { cause }.fail()
            }
        }
    }
}
