// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use tracing::debug;
use zbus::{message::Header, zvariant::ObjectPath};

use super::{
    access::{check_permission, PermissionKey, Prompt},
    begin_request, handle_token, impl_proxy, RequestReply,
};
use crate::{
    documents::{uri_to_path, Export},
    error::PortalError,
    handles::Handle,
    options::{filter_options, get_bool, get_str, to_value, OptionSpec, VarDict},
    permissions::Permission,
    request::Response,
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Screenshot";

const TABLE: &str = "screenshot";

const SCREENSHOT_OPTIONS: &[OptionSpec] = &[OptionSpec::new("modal", "b"), OptionSpec::new("interactive", "b")];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.Screenshot",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplScreenshot {
    fn screenshot(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn pick_color(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;
}

/// Interactive screenshots let the user pick, so only silent ones need a
/// permission.
pub fn needs_permission(options: &VarDict) -> bool {
    !get_bool(options, "interactive").unwrap_or(false)
}

fn prompt(app_name: &str) -> Prompt {
    let title = match app_name {
        "" => "Allow applications to take screenshots?".to_string(),
        name => format!("Allow {name} to take screenshots?"),
    };
    Prompt::new(title, "Screenshots show everything on the screen.")
        .grant("Allow")
        .deny("Deny")
        .icon("applets-screenshooter-symbolic")
}

pub struct Screenshot {
    broker: Arc<Broker>,
    backend: String,
}

impl Screenshot {
    pub fn new(broker: Arc<Broker>, backend: String) -> Screenshot {
        Screenshot { broker, backend }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Screenshot")]
impl Screenshot {
    async fn screenshot(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let mut options = filter_options(&options, SCREENSHOT_OPTIONS)?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let app_info = request.app_info();
            if needs_permission(&options) {
                let key = PermissionKey::new(TABLE, TABLE);
                let default = Permission::from(broker.config.screenshot_default);
                let allowed =
                    check_permission(&broker, &request, &parent_window, &key, default, &prompt(app_info.id())).await?;
                if !allowed {
                    debug!(app_id = app_info.id(), "Screenshot not allowed");
                    return Ok(Response::other());
                }
                options.insert("permission_store_checked".to_string(), to_value(true)?);
            }

            let proxy: ImplScreenshotProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .screenshot(request.path(), app_info.id(), &parent_window, &options)
                .await?;
            let mut response = Response::from(reply);
            if !response.is_success() {
                return Ok(response);
            }
            let Some(uri) = get_str(&response.results, "uri").map(str::to_string) else {
                return Ok(Response::other());
            };
            if !app_info.is_unconfined() {
                let path = uri_to_path(&uri).ok_or_else(|| PortalError::failed(format!("Screenshot is not a file: {uri}")))?;
                let export = Export {
                    writable: false,
                    directory: false,
                };
                let document = broker
                    .documents
                    .register(&path, app_info.id(), export)
                    .await
                    .map_err(|err| PortalError::failed(err.to_string()))?;
                response.results.insert("uri".to_string(), to_value(document.as_str())?);
            }
            Ok(response)
        })
        .await
    }

    async fn pick_color(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, &[])?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let proxy: ImplScreenshotProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .pick_color(request.path(), request.app_info().id(), &parent_window, &options)
                .await?;
            Ok(Response::from(reply))
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
    fn test_only_silent_screenshots_need_permission() {
        assert!(needs_permission(&VarDict::new()));
        let interactive = VarDict::from([("interactive".to_string(), to_value(true).unwrap())]);
        assert!(!needs_permission(&interactive));
        let silent = VarDict::from([("interactive".to_string(), to_value(false).unwrap())]);
        assert!(needs_permission(&silent));
    }

    #[test]
    fn test_prompt_names_app() {
        assert!(prompt("").title.starts_with("Allow applications"));
        assert!(prompt("org.example.App").title.contains("org.example.App"));
    }
}
