// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, warn};
use zbus::{
    message::Header,
    names::BusName,
    object_server::SignalEmitter,
    zvariant::{OwnedValue, Value},
};

use super::{impl_proxy, DESKTOP_PATH};
use crate::{
    error::PortalError,
    options::{filter_options, OptionSpec, VarDict},
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Notification";

const PRIORITIES: &[&str] = &["low", "normal", "high", "urgent"];

fn validate_priority(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::Str(priority) if PRIORITIES.contains(&priority.as_str()) => Ok(()),
        _ => Err(PortalError::invalid(format!("Option {key} is not a known priority"))),
    }
}

const NOTIFICATION_KEYS: &[OptionSpec] = &[
    OptionSpec::new("title", "s"),
    OptionSpec::new("body", "s"),
    OptionSpec::new("markup-body", "s"),
    OptionSpec::new("icon", "v"),
    OptionSpec::new("sound", "v"),
    OptionSpec::validated("priority", "s", validate_priority),
    OptionSpec::new("default-action", "s"),
    OptionSpec::new("default-action-target", "v"),
    OptionSpec::new("buttons", "aa{sv}"),
    OptionSpec::new("category", "s"),
    OptionSpec::new("display-hint", "as"),
];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.Notification",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplNotification {
    fn add_notification(&self, app_id: &str, id: &str, notification: &VarDict) -> zbus::Result<()>;

    fn remove_notification(&self, app_id: &str, id: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn action_invoked(&self, app_id: &str, id: &str, action: &str, parameter: Vec<OwnedValue>) -> zbus::Result<()>;
}

pub struct Notification {
    broker: Arc<Broker>,
    backend: String,
}

impl Notification {
    pub fn new(broker: Arc<Broker>, backend: String) -> Notification {
        Notification { broker, backend }
    }

    async fn proxy(&self) -> Result<ImplNotificationProxy<'static>, PortalError> {
        Ok(impl_proxy(&self.broker.connection, &self.backend).await?)
    }
}

fn require_app_id(app_id: &str) -> Result<(), PortalError> {
    if app_id.is_empty() {
        return Err(PortalError::not_allowed("An application id is required"));
    }
    Ok(())
}

#[zbus::interface(name = "org.freedesktop.portal.Notification")]
impl Notification {
    async fn add_notification(
        &self,
        #[zbus(header)] header: Header<'_>,
        id: String,
        notification: VarDict,
    ) -> Result<(), PortalError> {
        let call = self.broker.authorize(&header).await?;
        require_app_id(call.app_info.id())?;
        let notification = filter_options(&notification, NOTIFICATION_KEYS)?;
        self.proxy()
            .await?
            .add_notification(call.app_info.id(), &id, &notification)
            .await?;
        Ok(())
    }

    async fn remove_notification(&self, #[zbus(header)] header: Header<'_>, id: String) -> Result<(), PortalError> {
        let call = self.broker.authorize(&header).await?;
        require_app_id(call.app_info.id())?;
        self.proxy()
            .await?
            .remove_notification(call.app_info.id(), &id)
            .await?;
        Ok(())
    }

    #[zbus(signal)]
    async fn action_invoked(
        emitter: &SignalEmitter<'_>,
        id: &str,
        action: &str,
        parameter: &[OwnedValue],
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> u32 {
        2
    }
}

/// Relays `ActionInvoked` to every connection of the application owning
/// the notification.
pub fn forward_actions(broker: Arc<Broker>, backend: String) {
    let executor = broker.executor.clone();
    executor.spawn_ok(async move {
        let forwarded = async {
            let proxy: ImplNotificationProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            let mut actions = proxy.receive_action_invoked().await?;
            while let Some(signal) = actions.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                for sender in broker.app_infos.senders_of(args.app_id) {
                    debug!(sender = %sender, id = args.id, action = args.action, "Notification action");
                    let emitter = SignalEmitter::new(&broker.connection, DESKTOP_PATH)?.set_destination(BusName::Unique(sender));
                    Notification::action_invoked(&emitter, args.id, args.action, &args.parameter).await?;
                }
            }
            Ok::<_, zbus::Error>(())
        }
        .await;
        if let Err(err) = forwarded {
            warn!(?err, "Stopped forwarding notification actions");
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::to_value;

    #[test]
    fn test_notification_filtering() {
        let notification = VarDict::from([
            ("title".to_string(), to_value("Done").unwrap()),
            ("priority".to_string(), to_value("high").unwrap()),
            ("x-unknown".to_string(), to_value(1u32).unwrap()),
        ]);
        let filtered = filter_options(&notification, NOTIFICATION_KEYS).unwrap();
        assert_eq!(filtered.len(), 2);

        let bad = VarDict::from([("priority".to_string(), to_value("loud").unwrap())]);
        assert!(filter_options(&bad, NOTIFICATION_KEYS).is_err());
    }

    #[test]
    fn test_app_id_required() {
        assert!(require_app_id("").is_err());
        assert!(require_app_id("org.example.App").is_ok());
    }
}
