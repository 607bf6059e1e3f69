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

use std::sync::{Arc, PoisonError, Weak};

use snafu::ResultExt;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    err::{Error, JoinErrSnafu, Result},
    store::{BlockStore, BlockStoreRef},
};

/// The handle of the background flush task.
pub(crate) struct Flusher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BlockStore {
    /// Starts the periodic background flush. Returns false if it is
    /// already running.
    pub fn start_flusher(self: &Arc<Self>) -> bool {
        let mut flusher = self.flusher.lock().unwrap_or_else(PoisonError::into_inner);
        if flusher.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_flusher(Arc::downgrade(self), cancel.clone()));
        *flusher = Some(Flusher { cancel, handle });
        info!(
            "background flusher started, interval: {:?}",
            self.config().flush_interval
        );
        true
    }

    /// Stops the background flush and waits for it, then flushes once more
    /// whatever was written since its last run.
    pub async fn stop_flusher(&self) -> Result<()> {
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(flusher) = flusher else {
            return Ok(());
        };
        flusher.cancel.cancel();
        flusher.handle.await.context(JoinErrSnafu)?;
        info!("background flusher stopped");
        self.flush_all(&CancellationToken::new()).await
    }
}

async fn run_flusher(store: Weak<BlockStore>, cancel: CancellationToken) {
    let interval = match store.upgrade() {
        Some(store) => store.config().flush_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("background flusher cancelled");
                return;
            }
            _ = ticker.tick() => {
                let Some(store) = store.upgrade() else {
                    debug!("block store dropped, background flusher exits");
                    return;
                };
                flush_once(&store, &cancel).await;
            }
        }
    }
}

async fn flush_once(store: &BlockStoreRef, cancel: &CancellationToken) {
    match store.flush_all(cancel).await {
        Ok(()) => {}
        Err(e @ Error::FlushInProgress { .. }) => debug!("skip background flush: {}", e),
        Err(e) if e.is_transient() => debug!("background flush interrupted: {}", e),
        Err(e) => warn!("background flush failed: {}", e),
    }
}
