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

use std::sync::Once;

use snafu::{ResultExt, Whatever};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INSTALL_FMT_LOG: Once = Once::new();

/// Installs a pretty stdout logger, used by tests. Safe to call more than
/// once, only the first call has effect.
pub fn install_fmt_log() {
    INSTALL_FMT_LOG.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
            .with(fmt::layer().pretty().with_test_writer())
            .try_init();
    });
}

/// Initialize logging to stderr.
///
/// Logging is configured using either `default_log_level` or the `RUST_LOG`
/// environment variable.
pub fn init_logging(default_log_level: &str) -> Result<(), Whatever> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level));

    let fmt_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .whatever_context("failed to install the global tracing subscriber")?;
    tracing::info!("logging started");
    Ok(())
}
