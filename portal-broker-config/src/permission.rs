// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};

/// Permission assumed when the permission store has no entry for an app.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultPermission {
    Yes,
    No,
    #[default]
    Ask,
}
