// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;
use zbus::{
    fdo,
    message::Header,
    zvariant::{ObjectPath, OwnedFd, OwnedObjectPath, Value},
};

use super::{
    begin_request, create_session, handle_token, impl_proxy, publish_session,
    screen_cast::{restore_from_token, store_restore_data},
    RequestReply,
};
use crate::{
    error::PortalError,
    handles::Handle,
    options::{
        filter_options, get_bool, get_str, get_u32, to_value, validate_persist_mode, validate_token, OptionSpec, VarDict,
    },
    request::Response,
    restore::{RestoreState, PERSIST_MODE, RESTORE_TOKEN},
    session::{Session, SessionData},
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.RemoteDesktop";

const TABLE: &str = "remote-desktop";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceTypes: u32 {
        const KEYBOARD = 1;
        const POINTER = 2;
        const TOUCHSCREEN = 4;
    }
}

fn validate_device_types(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::U32(types) if DeviceTypes::from_bits(*types).is_some() => Ok(()),
        _ => Err(PortalError::invalid(format!("Option {key} has unknown device types"))),
    }
}

const CREATE_OPTIONS: &[OptionSpec] = &[OptionSpec::validated("session_handle_token", "s", validate_token)];

const SELECT_OPTIONS: &[OptionSpec] = &[
    OptionSpec::validated("types", "u", validate_device_types),
    OptionSpec::new(RESTORE_TOKEN, "s"),
    OptionSpec::validated(PERSIST_MODE, "u", validate_persist_mode),
];

const AXIS_OPTIONS: &[OptionSpec] = &[OptionSpec::new("finish", "b")];

/// State of a remote desktop session.
#[derive(Debug, Default)]
pub struct RemoteDesktopSession {
    pub requested: DeviceTypes,
    pub granted: DeviceTypes,
    pub streams: Vec<u32>,
    pub devices_selected: bool,
    pub sources_selected: bool,
    pub clipboard_requested: bool,
    pub clipboard_enabled: bool,
    pub uses_eis: bool,
    pub restore: RestoreState,
}

impl RemoteDesktopSession {
    /// Whether emulated input of `device` may be sent directly.
    fn check_input(&self, device: DeviceTypes) -> Result<(), PortalError> {
        if self.uses_eis {
            return Err(PortalError::not_allowed("Session uses an EIS connection"));
        }
        if !self.granted.contains(device) {
            return Err(PortalError::not_allowed(format!("Session has no access to {device:?}")));
        }
        Ok(())
    }

    fn check_stream(&self, stream: u32) -> Result<(), PortalError> {
        if self.streams.contains(&stream) {
            Ok(())
        } else {
            Err(PortalError::invalid(format!("Unknown stream {stream}")))
        }
    }

    /// Takes what the implementation granted, never more than was asked
    /// for.
    fn apply_start_results(&mut self, results: &VarDict) {
        let granted = get_u32(results, "devices").map_or(DeviceTypes::empty(), DeviceTypes::from_bits_truncate);
        self.granted = if self.devices_selected {
            granted & self.requested
        } else {
            DeviceTypes::empty()
        };
        self.clipboard_enabled = self.clipboard_requested && get_bool(results, "clipboard_enabled").unwrap_or(false);
        self.streams = results.get("streams").map(|value| stream_ids(value)).unwrap_or_default();
    }
}

/// Node ids of an `a(ua{sv})` stream list.
pub fn stream_ids(value: &Value<'_>) -> Vec<u32> {
    let Value::Array(streams) = value else {
        return Vec::new();
    };
    streams
        .iter()
        .filter_map(|stream| match stream {
            Value::Structure(fields) => match fields.fields().first() {
                Some(Value::U32(id)) => Some(*id),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.RemoteDesktop",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplRemoteDesktop {
    fn create_session(
        &self,
        handle: &ObjectPath<'_>,
        session_handle: &ObjectPath<'_>,
        app_id: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn select_devices(
        &self,
        handle: &ObjectPath<'_>,
        session_handle: &ObjectPath<'_>,
        app_id: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn start(
        &self,
        handle: &ObjectPath<'_>,
        session_handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn notify_pointer_motion(&self, session_handle: &ObjectPath<'_>, options: &VarDict, dx: f64, dy: f64)
        -> zbus::Result<()>;

    fn notify_pointer_motion_absolute(
        &self,
        session_handle: &ObjectPath<'_>,
        options: &VarDict,
        stream: u32,
        x: f64,
        y: f64,
    ) -> zbus::Result<()>;

    fn notify_pointer_button(&self, session_handle: &ObjectPath<'_>, options: &VarDict, button: i32, state: u32)
        -> zbus::Result<()>;

    fn notify_pointer_axis(&self, session_handle: &ObjectPath<'_>, options: &VarDict, dx: f64, dy: f64)
        -> zbus::Result<()>;

    fn notify_pointer_axis_discrete(
        &self,
        session_handle: &ObjectPath<'_>,
        options: &VarDict,
        axis: u32,
        steps: i32,
    ) -> zbus::Result<()>;

    fn notify_keyboard_keycode(
        &self,
        session_handle: &ObjectPath<'_>,
        options: &VarDict,
        keycode: i32,
        state: u32,
    ) -> zbus::Result<()>;

    fn notify_keyboard_keysym(&self, session_handle: &ObjectPath<'_>, options: &VarDict, keysym: i32, state: u32)
        -> zbus::Result<()>;

    fn notify_touch_down(
        &self,
        session_handle: &ObjectPath<'_>,
        options: &VarDict,
        stream: u32,
        slot: u32,
        x: f64,
        y: f64,
    ) -> zbus::Result<()>;

    fn notify_touch_motion(
        &self,
        session_handle: &ObjectPath<'_>,
        options: &VarDict,
        stream: u32,
        slot: u32,
        x: f64,
        y: f64,
    ) -> zbus::Result<()>;

    fn notify_touch_up(&self, session_handle: &ObjectPath<'_>, options: &VarDict, slot: u32) -> zbus::Result<()>;

    #[zbus(name = "ConnectToEIS")]
    fn connect_to_eis(&self, session_handle: &ObjectPath<'_>, app_id: &str, options: &VarDict) -> zbus::Result<OwnedFd>;

    #[zbus(property)]
    fn available_device_types(&self) -> zbus::Result<u32>;
}

pub struct RemoteDesktop {
    broker: Arc<Broker>,
    backend: String,
}

impl RemoteDesktop {
    pub fn new(broker: Arc<Broker>, backend: String) -> RemoteDesktop {
        RemoteDesktop { broker, backend }
    }

    async fn proxy(&self) -> Result<ImplRemoteDesktopProxy<'static>, PortalError> {
        Ok(impl_proxy(&self.broker.connection, &self.backend).await?)
    }

    /// Started session of the caller that may emulate `device`.
    async fn input_session(
        &self,
        header: &Header<'_>,
        session_handle: &ObjectPath<'_>,
        device: DeviceTypes,
    ) -> Result<Arc<Session>, PortalError> {
        let call = self.broker.authorize(header).await?;
        let session = self.broker.sessions.lookup(session_handle, &call.sender)?;
        session.ensure_started()?;
        session.with_data(|data| match data {
            SessionData::RemoteDesktop(remote_desktop) => remote_desktop.check_input(device),
            data => Err(PortalError::invalid(format!("Not a remote desktop session but {}", data.name()))),
        })?;
        Ok(session)
    }

    fn check_stream(session: &Session, stream: u32) -> Result<(), PortalError> {
        session.with_data(|data| match data {
            SessionData::RemoteDesktop(remote_desktop) => remote_desktop.check_stream(stream),
            _ => Err(PortalError::invalid("Not a remote desktop session")),
        })
    }
}

#[zbus::interface(name = "org.freedesktop.portal.RemoteDesktop")]
impl RemoteDesktop {
    async fn create_session(
        &self,
        #[zbus(header)] header: Header<'_>,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, CREATE_OPTIONS)?;
        let session = create_session(
            &self.broker,
            &call,
            get_str(&options, "session_handle_token"),
            Some(&self.backend),
            SessionData::RemoteDesktop(RemoteDesktopSession::default()),
        )?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let created = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let proxy: ImplRemoteDesktopProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .create_session(request.path(), created.path(), request.app_info().id(), &VarDict::new())
                .await?;
            let mut response = Response::from(reply);
            if response.is_success() {
                publish_session(&broker, &created, &mut response.results).await?;
            }
            Ok(response)
        })
        .await
    }

    async fn select_devices(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        let token = handle_token(&options);
        let options = filter_options(&options, SELECT_OPTIONS)?;
        let requested = get_u32(&options, "types").map_or(DeviceTypes::all(), DeviceTypes::from_bits_truncate);
        session.with_data(|data| match data {
            SessionData::RemoteDesktop(_) => Ok(()),
            data => Err(PortalError::invalid(format!("Cannot select devices in a {} session", data.name()))),
        })?;
        session.begin_configure()?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let configured = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let options = restore_from_token(&broker, &configured, TABLE, options).await?;
            let proxy: ImplRemoteDesktopProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .select_devices(request.path(), configured.path(), request.app_info().id(), &options)
                .await?;
            let response = Response::from(reply);
            if response.is_success() {
                configured.with_data(|data| {
                    if let SessionData::RemoteDesktop(remote_desktop) = data {
                        remote_desktop.requested = requested;
                        remote_desktop.devices_selected = true;
                    }
                });
            }
            Ok(response)
        })
        .await
    }

    async fn start(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        parent_window: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        let token = handle_token(&options);
        let ready = session.with_data(|data| match data {
            SessionData::RemoteDesktop(remote_desktop) => {
                Ok(remote_desktop.devices_selected || remote_desktop.sources_selected)
            }
            data => Err(PortalError::invalid(format!("Cannot start a {} session here", data.name()))),
        })?;
        if !ready {
            return Err(PortalError::failed("Neither devices nor sources selected"));
        }
        session.begin_start()?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let started = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let proxy: ImplRemoteDesktopProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .start(
                    request.path(),
                    started.path(),
                    request.app_info().id(),
                    &parent_window,
                    &VarDict::new(),
                )
                .await?;
            let response = Response::from(reply);
            if !response.is_success() {
                return Ok(response);
            }
            let mut results = store_restore_data(&broker, &started, TABLE, response.results).await?;
            let (granted, clipboard) = started.with_data(|data| match data {
                SessionData::RemoteDesktop(remote_desktop) => {
                    remote_desktop.apply_start_results(&results);
                    (remote_desktop.granted, remote_desktop.clipboard_enabled)
                }
                _ => (DeviceTypes::empty(), false),
            });
            results.insert("devices".to_string(), to_value(granted.bits())?);
            results.insert("clipboard_enabled".to_string(), to_value(clipboard)?);
            if !started.mark_started() {
                debug!(path = %started.path(), "Session closed while starting");
                return Ok(Response::other());
            }
            debug!(path = %started.path(), ?granted, clipboard, "Remote desktop started");
            Ok(Response::success(results))
        })
        .await
    }

    async fn notify_pointer_motion(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        dx: f64,
        dy: f64,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::POINTER).await?;
        self.proxy()
            .await?
            .notify_pointer_motion(session.path(), &VarDict::new(), dx, dy)
            .await?;
        Ok(())
    }

    async fn notify_pointer_motion_absolute(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        stream: u32,
        x: f64,
        y: f64,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::POINTER).await?;
        Self::check_stream(&session, stream)?;
        self.proxy()
            .await?
            .notify_pointer_motion_absolute(session.path(), &VarDict::new(), stream, x, y)
            .await?;
        Ok(())
    }

    async fn notify_pointer_button(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        button: i32,
        state: u32,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::POINTER).await?;
        self.proxy()
            .await?
            .notify_pointer_button(session.path(), &VarDict::new(), button, state)
            .await?;
        Ok(())
    }

    async fn notify_pointer_axis(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        options: VarDict,
        dx: f64,
        dy: f64,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::POINTER).await?;
        let options = filter_options(&options, AXIS_OPTIONS)?;
        self.proxy()
            .await?
            .notify_pointer_axis(session.path(), &options, dx, dy)
            .await?;
        Ok(())
    }

    async fn notify_pointer_axis_discrete(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        axis: u32,
        steps: i32,
    ) -> Result<(), PortalError> {
        if axis > 1 {
            return Err(PortalError::invalid(format!("Unknown axis {axis}")));
        }
        let session = self.input_session(&header, &session_handle, DeviceTypes::POINTER).await?;
        self.proxy()
            .await?
            .notify_pointer_axis_discrete(session.path(), &VarDict::new(), axis, steps)
            .await?;
        Ok(())
    }

    async fn notify_keyboard_keycode(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        keycode: i32,
        state: u32,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::KEYBOARD).await?;
        self.proxy()
            .await?
            .notify_keyboard_keycode(session.path(), &VarDict::new(), keycode, state)
            .await?;
        Ok(())
    }

    async fn notify_keyboard_keysym(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        keysym: i32,
        state: u32,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::KEYBOARD).await?;
        self.proxy()
            .await?
            .notify_keyboard_keysym(session.path(), &VarDict::new(), keysym, state)
            .await?;
        Ok(())
    }

    async fn notify_touch_down(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        stream: u32,
        slot: u32,
        x: f64,
        y: f64,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::TOUCHSCREEN).await?;
        Self::check_stream(&session, stream)?;
        self.proxy()
            .await?
            .notify_touch_down(session.path(), &VarDict::new(), stream, slot, x, y)
            .await?;
        Ok(())
    }

    async fn notify_touch_motion(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        stream: u32,
        slot: u32,
        x: f64,
        y: f64,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::TOUCHSCREEN).await?;
        Self::check_stream(&session, stream)?;
        self.proxy()
            .await?
            .notify_touch_motion(session.path(), &VarDict::new(), stream, slot, x, y)
            .await?;
        Ok(())
    }

    async fn notify_touch_up(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
        slot: u32,
    ) -> Result<(), PortalError> {
        let session = self.input_session(&header, &session_handle, DeviceTypes::TOUCHSCREEN).await?;
        self.proxy()
            .await?
            .notify_touch_up(session.path(), &VarDict::new(), slot)
            .await?;
        Ok(())
    }

    /// Once connected, input only flows through the returned socket.
    #[zbus(name = "ConnectToEIS")]
    async fn connect_to_eis(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
    ) -> Result<OwnedFd, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        session.ensure_started()?;
        session.with_data(|data| match data {
            SessionData::RemoteDesktop(remote_desktop) if remote_desktop.uses_eis => {
                Err(PortalError::failed("Session is already connected to EIS"))
            }
            SessionData::RemoteDesktop(remote_desktop) if remote_desktop.granted.is_empty() => {
                Err(PortalError::not_allowed("Session has no input devices"))
            }
            SessionData::RemoteDesktop(remote_desktop) => {
                remote_desktop.uses_eis = true;
                Ok(())
            }
            data => Err(PortalError::invalid(format!("Not a remote desktop session but {}", data.name()))),
        })?;
        let fd = self
            .proxy()
            .await?
            .connect_to_eis(session.path(), call.app_info.id(), &VarDict::new())
            .await?;
        debug!(path = %session.path(), "Connected to EIS");
        Ok(fd)
    }

    #[zbus(property)]
    async fn available_device_types(&self) -> fdo::Result<u32> {
        let proxy: ImplRemoteDesktopProxy<'static> = impl_proxy(&self.broker.connection, &self.backend).await?;
        Ok(proxy.available_device_types().await?)
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        2
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn started(requested: DeviceTypes, results: &VarDict) -> RemoteDesktopSession {
        let mut session = RemoteDesktopSession {
            requested,
            devices_selected: true,
            ..Default::default()
        };
        session.apply_start_results(results);
        session
    }

    #[test]
    fn test_granted_never_exceeds_requested() {
        let results = VarDict::from([("devices".to_string(), to_value(7u32).unwrap())]);
        let session = started(DeviceTypes::POINTER, &results);
        assert_eq!(session.granted, DeviceTypes::POINTER);
        assert!(session.check_input(DeviceTypes::POINTER).is_ok());
        assert!(matches!(
            session.check_input(DeviceTypes::KEYBOARD),
            Err(PortalError::NotAllowed(_))
        ));
    }

    #[test]
    fn test_eis_blocks_direct_input() {
        let results = VarDict::from([("devices".to_string(), to_value(3u32).unwrap())]);
        let mut session = started(DeviceTypes::all(), &results);
        assert!(session.check_input(DeviceTypes::KEYBOARD).is_ok());
        session.uses_eis = true;
        assert!(session.check_input(DeviceTypes::KEYBOARD).is_err());
    }

    #[test]
    fn test_clipboard_needs_request() {
        let results = VarDict::from([("clipboard_enabled".to_string(), to_value(true).unwrap())]);
        let session = started(DeviceTypes::all(), &results);
        assert!(!session.clipboard_enabled);

        let mut session = RemoteDesktopSession {
            clipboard_requested: true,
            ..Default::default()
        };
        session.apply_start_results(&results);
        assert!(session.clipboard_enabled);
        assert!(session.granted.is_empty());
    }

    #[test]
    fn test_stream_ids() {
        let streams = vec![
            (42u32, VarDict::new()),
            (43u32, VarDict::from([("position".to_string(), to_value((0i32, 0i32)).unwrap())])),
        ];
        let value = Value::from(streams);
        assert_eq!(stream_ids(&value), vec![42, 43]);
        assert!(stream_ids(&Value::U32(1)).is_empty());
    }

    #[test]
    fn test_select_options() {
        let bad = VarDict::from([("types".to_string(), to_value(8u32).unwrap())]);
        assert!(filter_options(&bad, SELECT_OPTIONS).is_err());
        let good = VarDict::from([("types".to_string(), to_value(3u32).unwrap())]);
        assert_eq!(filter_options(&good, SELECT_OPTIONS).unwrap().len(), 1);
    }
}
