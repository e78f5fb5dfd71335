// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use tracing::{debug, info, warn};
use zbus::message::Header;

use super::{
    access::{check_permission, PermissionKey, Prompt},
    begin_request, handle_token, RequestReply,
};
use crate::{
    app_info::AppInfo,
    error::PortalError,
    launcher::{self, LauncherError},
    options::{filter_options, get_bool, get_str, get_strv, to_value, validate_reason, OptionSpec, VarDict},
    permissions::Permission,
    request::Response,
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Background";

const TABLE: &str = "background";

const BACKGROUND_OPTIONS: &[OptionSpec] = &[
    OptionSpec::validated("reason", "s", validate_reason),
    OptionSpec::new("autostart", "b"),
    OptionSpec::new("commandline", "as"),
    OptionSpec::new("dbus-activatable", "b"),
];

fn prompt(app_id: &str, reason: Option<&str>) -> Prompt {
    let mut prompt = Prompt::new(
        format!("Allow {app_id} to run in the background?"),
        reason.unwrap_or("The application wants to keep running when its windows are closed."),
    )
    .grant("Allow")
    .deny("Don't allow");
    prompt.body = "This can be changed at any time from the privacy settings.".to_string();
    prompt
}

/// What to do with the autostart entry of an application.
#[derive(Debug, PartialEq, Eq)]
enum Autostart {
    Write(String),
    Remove,
}

fn plan_autostart(
    app_info: &AppInfo,
    allowed: bool,
    requested: bool,
    commandline: Option<&[String]>,
    dbus_activatable: bool,
) -> Result<Autostart, LauncherError> {
    if !allowed || !requested {
        return Ok(Autostart::Remove);
    }
    launcher::autostart_entry(app_info, commandline, dbus_activatable).map(Autostart::Write)
}

pub struct Background {
    broker: Arc<Broker>,
}

impl Background {
    /// The implementation only tracks running applications; the decision
    /// and the autostart entry are handled here.
    pub fn new(broker: Arc<Broker>, _backend: String) -> Background {
        Background { broker }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Background")]
impl Background {
    async fn request_background(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, BACKGROUND_OPTIONS)?;
        let broker = self.broker.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let app_info = request.app_info().clone();
            if app_info.id().is_empty() {
                // Nothing to key a permission or an autostart entry on.
                let results = VarDict::from([
                    ("background".to_string(), to_value(true)?),
                    ("autostart".to_string(), to_value(false)?),
                ]);
                return Ok(Response::success(results));
            }

            let key = PermissionKey::new(TABLE, TABLE);
            let prompt = prompt(app_info.id(), get_str(&options, "reason"));
            let allowed = check_permission(&broker, &request, &parent_window, &key, Permission::Ask, &prompt).await?;

            let requested = get_bool(&options, "autostart").unwrap_or(false);
            let commandline = get_strv(&options, "commandline");
            let dbus_activatable = get_bool(&options, "dbus-activatable").unwrap_or(false);
            let plan = plan_autostart(&app_info, allowed, requested, commandline.as_deref(), dbus_activatable);

            let dir = broker.dirs.autostart_dir();
            let app_id = app_info.id().to_string();
            let autostart = match plan {
                Ok(Autostart::Write(entry)) => {
                    let written = crate::utils::unblock(&broker.executor, move || {
                        launcher::write_autostart(&dir, &app_id, &entry)
                    })
                    .await?;
                    match written {
                        Ok(path) => {
                            info!(app_id = app_info.id(), path = %path.display(), "Enabled autostart");
                            true
                        }
                        Err(err) => {
                            warn!(app_id = app_info.id(), ?err, "Failed to write autostart entry");
                            false
                        }
                    }
                }
                Ok(Autostart::Remove) => {
                    let removed =
                        crate::utils::unblock(&broker.executor, move || launcher::remove_autostart(&dir, &app_id))
                            .await?;
                    if let Err(err) = removed {
                        warn!(app_id = app_info.id(), ?err, "Failed to remove autostart entry");
                    }
                    false
                }
                Err(err) => {
                    debug!(app_id = app_info.id(), %err, "Autostart not possible");
                    false
                }
            };

            let results = VarDict::from([
                ("background".to_string(), to_value(allowed)?),
                ("autostart".to_string(), to_value(autostart)?),
            ]);
            Ok(Response::success(results))
        })
        .await
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        2
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plan_autostart() {
        let app = AppInfo::sandboxed_for_test("org.example.App");
        assert_eq!(plan_autostart(&app, false, true, None, false).unwrap(), Autostart::Remove);
        assert_eq!(plan_autostart(&app, true, false, None, false).unwrap(), Autostart::Remove);
        let Autostart::Write(entry) = plan_autostart(&app, true, true, None, false).unwrap() else {
            panic!("expected an entry");
        };
        assert!(entry.contains("Exec=flatpak run org.example.App"));

        let host = AppInfo::host("org.example.Tool".into(), None, None);
        assert!(plan_autostart(&host, true, true, None, false).is_err());
    }

    #[test]
    fn test_reason_length() {
        let long = "x".repeat(300);
        let options = VarDict::from([("reason".to_string(), to_value(long.as_str()).unwrap())]);
        assert!(matches!(
            filter_options(&options, BACKGROUND_OPTIONS),
            Err(PortalError::InvalidArgument(_))
        ));
    }
}
