// SPDX-License-Identifier: GPL-3.0-only

//! Device access decisions requested by host services (the media server
//! mostly) on behalf of a sandboxed process.

use std::sync::Arc;

use tracing::debug;
use zbus::message::Header;

use super::{
    access::{check_permission_for, PermissionKey, Prompt, Subject},
    begin_request, handle_token, RequestReply,
};
use crate::{
    app_info::{detect, open_pidfd, AppInfo},
    error::{CoreError, PortalError},
    options::VarDict,
    permissions::Permission,
    request::Response,
    state::Broker,
    utils::unblock,
};

const TABLE: &str = "devices";

const DEVICES: &[&str] = &["microphone", "speakers", "camera"];

fn requested_device(devices: &[String]) -> Result<&str, PortalError> {
    match devices {
        [device] if DEVICES.contains(&device.as_str()) => Ok(device),
        [device] => Err(PortalError::invalid(format!("Unknown device {device:?}"))),
        _ => Err(PortalError::invalid("Exactly one device must be requested")),
    }
}

fn prompt(app_id: &str, device: &str) -> Prompt {
    let (title, subtitle, icon) = match device {
        "camera" => (
            format!("Allow {app_id} to use the camera?"),
            "Access to the camera can be changed at any time from the privacy settings.",
            "camera-web-symbolic",
        ),
        "speakers" => (
            format!("Allow {app_id} to play sound?"),
            "Access to the speakers can be changed at any time from the privacy settings.",
            "audio-speakers-symbolic",
        ),
        _ => (
            format!("Allow {app_id} to use the microphone?"),
            "Access to the microphone can be changed at any time from the privacy settings.",
            "audio-input-microphone-symbolic",
        ),
    };
    Prompt::new(title, subtitle)
        .grant("Allow")
        .deny("Deny")
        .icon(icon)
}

pub struct Device {
    broker: Arc<Broker>,
}

impl Device {
    pub fn new(broker: Arc<Broker>) -> Device {
        Device { broker }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Device")]
impl Device {
    async fn access_device(
        &self,
        #[zbus(header)] header: Header<'_>,
        pid: u32,
        devices: Vec<String>,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        if !call.app_info.is_unconfined() {
            return Err(CoreError::WrongAppKind(call.app_info.kind()).into());
        }
        let device = requested_device(&devices)?.to_string();
        let token = handle_token(&options);
        let broker = self.broker.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let dirs = broker.dirs.clone();
            let target: AppInfo = unblock(&broker.executor, move || detect(pid, open_pidfd(pid)?, &dirs)).await??;
            if target.is_unconfined() {
                debug!(pid, device = %device, "Host process, device access allowed");
                return Ok(Response::success(VarDict::new()));
            }

            let subject = Subject {
                app_id: target.id(),
                sender: None,
            };
            let key = PermissionKey::new(TABLE, device.as_str());
            let prompt = prompt(target.id(), &device);
            let allowed = check_permission_for(&broker, &request, subject, "", &key, Permission::Ask, &prompt).await?;
            debug!(pid, app_id = target.id(), device = %device, allowed, "Device access decided");
            Ok(if allowed {
                Response::success(VarDict::new())
            } else {
                Response::other()
            })
        })
        .await
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_requested_device() {
        assert_eq!(requested_device(&["camera".to_string()]).unwrap(), "camera");
        assert!(requested_device(&[]).is_err());
        assert!(requested_device(&["camera".to_string(), "microphone".to_string()]).is_err());
        assert!(matches!(
            requested_device(&["printer".to_string()]),
            Err(PortalError::InvalidArgument(_))
        ));
    }
}
