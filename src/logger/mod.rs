// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Filter used unless `RUST_LOG` says otherwise.
fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "portal_broker=debug,info"
    } else {
        "info"
    }
}

pub fn init_logger(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let stderr = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);
    // The journal is optional, e.g. when running inside a container.
    let journald = tracing_journald::layer().ok();
    let journal_connected = journald.is_some();

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(journald)
        .try_init()
        .context("Failed to install the tracing subscriber")?;
    log_panics::init();

    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    debug!(journal_connected, "Logger initialized");
    Ok(())
}
