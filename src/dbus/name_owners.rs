// SPDX-License-Identifier: GPL-3.0-only

//! Tracking of bus names that leave the bus.
//!
//! Everything the broker keeps on behalf of a caller (identities, requests,
//! sessions, transient grants) is scoped to that caller's unique name. A
//! single `NameOwnerChanged` subscription feeds a fixed list of subscribers,
//! so cleanup is never scattered across the portals.

use std::sync::Arc;

use futures_executor::ThreadPool;
use futures_util::StreamExt;
use tracing::{debug, warn};
use zbus::{
    fdo,
    names::{BusName, UniqueName, WellKnownName},
};

/// Something holding per-caller state.
pub trait OwnerSubscriber: Send + Sync {
    fn owner_vanished(&self, owner: &UniqueName<'static>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A unique name left the bus.
    NameVanished(UniqueName<'static>),
    /// The broker lost its own well-known name.
    NameLost(WellKnownName<'static>),
}

/// Fixed set of subscribers, notified in registration order.
#[derive(Default)]
pub struct OwnerFanout {
    subscribers: Vec<Arc<dyn OwnerSubscriber>>,
}

impl OwnerFanout {
    pub fn new() -> OwnerFanout {
        OwnerFanout::default()
    }

    pub fn with(mut self, subscriber: Arc<dyn OwnerSubscriber>) -> OwnerFanout {
        self.subscribers.push(subscriber);
        self
    }

    pub fn dispatch(&self, owner: &UniqueName<'static>) {
        debug!(owner = %owner, "Bus name vanished");
        for subscriber in &self.subscribers {
            subscriber.owner_vanished(owner);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// Unique name whose owner went away, if `name`/`new_owner` describe that.
pub fn vanished_owner(name: &BusName<'_>, new_owner: Option<&UniqueName<'_>>) -> Option<UniqueName<'static>> {
    match (name, new_owner) {
        (BusName::Unique(name), None) => Some(name.to_owned()),
        _ => None,
    }
}

/// Forwards name changes relevant to the broker into `sender`.
///
/// The match rules are installed before this returns, so no disappearance
/// happening after start-up is missed.
pub async fn watch(
    dbus: &fdo::DBusProxy<'static>,
    executor: &ThreadPool,
    own_name: WellKnownName<'static>,
    sender: calloop::channel::Sender<BusEvent>,
) -> zbus::Result<()> {
    let mut owner_changes = dbus.receive_name_owner_changed().await?;
    let mut lost = dbus.receive_name_lost().await?;

    let vanished_sender = sender.clone();
    executor.spawn_ok(async move {
        while let Some(signal) = owner_changes.next().await {
            let args = match signal.args() {
                Ok(args) => args,
                Err(err) => {
                    warn!(?err, "Malformed NameOwnerChanged signal");
                    continue;
                }
            };
            if let Some(owner) = vanished_owner(&args.name, (*args.new_owner).as_ref()) {
                if vanished_sender.send(BusEvent::NameVanished(owner)).is_err() {
                    break;
                }
            }
        }
    });

    executor.spawn_ok(async move {
        while let Some(signal) = lost.next().await {
            let Ok(args) = signal.args() else {
                continue;
            };
            if args.name.as_str() == own_name.as_str() {
                if sender.send(BusEvent::NameLost(own_name.clone())).is_err() {
                    break;
                }
            }
        }
    });

    Ok(())
}
