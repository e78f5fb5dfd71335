// SPDX-License-Identifier: GPL-3.0-only

use libsystemd::daemon::{booted, notify, NotifyState};
use tracing::{debug, error};

/// Tells systemd the broker owns its name and serves requests.
pub fn ready() {
    if !booted() {
        debug!("Not booted with systemd, skipping readiness notification");
        return;
    }
    if let Err(err) = notify(false, &[NotifyState::Ready]) {
        error!(?err, "Failed to notify systemd");
    }
}
