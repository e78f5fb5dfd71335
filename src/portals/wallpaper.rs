// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use zbus::{
    message::Header,
    zvariant::{ObjectPath, OwnedFd, Value},
};

use super::{
    access::{check_permission, PermissionKey, Prompt},
    begin_request, handle_token, impl_proxy, RequestReply,
};
use crate::{
    error::PortalError,
    fd::FileKind,
    handles::Handle,
    options::{filter_options, get_bool, OptionSpec, VarDict},
    permissions::{get_permission, Permission},
    request::Response,
    state::{Broker, Call},
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Wallpaper";

const TABLE: &str = "wallpaper";

const SET_ON: &[&str] = &["both", "background", "lockscreen"];

fn validate_set_on(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::Str(target) if SET_ON.contains(&target.as_str()) => Ok(()),
        _ => Err(PortalError::invalid(format!(
            "Option {key} must be one of {}",
            SET_ON.join(", ")
        ))),
    }
}

const WALLPAPER_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("show-preview", "b"),
    OptionSpec::validated("set-on", "s", validate_set_on),
];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.Wallpaper",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplWallpaper {
    #[zbus(name = "SetWallpaperURI")]
    fn set_wallpaper_uri(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        uri: &str,
        options: &VarDict,
    ) -> zbus::Result<u32>;
}

pub struct Wallpaper {
    broker: Arc<Broker>,
    backend: String,
}

impl Wallpaper {
    pub fn new(broker: Arc<Broker>, backend: String) -> Wallpaper {
        Wallpaper { broker, backend }
    }

    async fn set(
        &self,
        call: Call,
        parent_window: String,
        uri: String,
        options: VarDict,
        token: Option<String>,
    ) -> Result<RequestReply, PortalError> {
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let app_id = request.app_info().id();
            let key = PermissionKey::new(TABLE, TABLE);
            let allowed = if get_bool(&options, "show-preview").unwrap_or(false) {
                // The preview is the confirmation.
                get_permission(&*broker.permissions, TABLE, TABLE, app_id) != Permission::No
            } else {
                let prompt = Prompt::new("Allow changing the wallpaper?", "The application wants to set the desktop background.")
                    .grant("Allow")
                    .deny("Deny");
                check_permission(&broker, &request, &parent_window, &key, Permission::Ask, &prompt).await?
            };
            if !allowed {
                return Ok(Response::other());
            }

            let proxy: ImplWallpaperProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let code = proxy
                .set_wallpaper_uri(request.path(), app_id, &parent_window, &uri, &options)
                .await?;
            Ok(Response::new(code.into(), VarDict::new()))
        })
        .await
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Wallpaper")]
impl Wallpaper {
    #[zbus(name = "SetWallpaperURI")]
    async fn set_wallpaper_uri(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        uri: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, WALLPAPER_OPTIONS)?;
        url::Url::parse(&uri).map_err(|err| PortalError::invalid(format!("Invalid URI {uri:?}: {err}")))?;
        self.set(call, parent_window, uri, options, token).await
    }

    async fn set_wallpaper_file(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        fd: OwnedFd,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, WALLPAPER_OPTIONS)?;
        let verified = self.broker.verify_fd(&call, fd.into(), FileKind::Regular).await?;
        let uri = verified
            .uri()
            .ok_or_else(|| PortalError::invalid("File has no usable path"))?;
        self.set(call, parent_window, uri, options, token).await
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::to_value;

    #[test]
    fn test_set_on_validator() {
        for target in SET_ON {
            let options = VarDict::from([("set-on".to_string(), to_value(*target).unwrap())]);
            assert!(filter_options(&options, WALLPAPER_OPTIONS).is_ok());
        }
        let options = VarDict::from([("set-on".to_string(), to_value("ceiling").unwrap())]);
        assert!(matches!(
            filter_options(&options, WALLPAPER_OPTIONS),
            Err(PortalError::InvalidArgument(_))
        ));
    }
}
