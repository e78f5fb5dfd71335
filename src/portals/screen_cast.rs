// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use tracing::debug;
use zbus::{
    fdo,
    message::Header,
    zvariant::{ObjectPath, OwnedObjectPath, Value},
};

use super::{begin_request, create_session, handle_token, impl_proxy, publish_session, RequestReply};
use crate::{
    error::PortalError,
    handles::Handle,
    options::{filter_options, get_str, validate_persist_mode, validate_token, OptionSpec, VarDict},
    request::Response,
    restore::{RestoreOwner, RestoreState, PERSIST_MODE, RESTORE_TOKEN},
    session::{Session, SessionData},
    state::Broker,
    utils::unblock,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.ScreenCast";

const TABLE: &str = "screen-cast";

const SOURCE_TYPES: u32 = 1 | 2 | 4;
const CURSOR_MODES: &[u32] = &[1, 2, 4];

fn validate_types(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::U32(types) if *types & !SOURCE_TYPES == 0 => Ok(()),
        _ => Err(PortalError::invalid(format!("Option {key} has unknown source types"))),
    }
}

fn validate_cursor_mode(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::U32(mode) if CURSOR_MODES.contains(mode) => Ok(()),
        _ => Err(PortalError::invalid(format!("Option {key} is not a cursor mode"))),
    }
}

const CREATE_OPTIONS: &[OptionSpec] = &[OptionSpec::validated("session_handle_token", "s", validate_token)];

pub(super) const SELECT_OPTIONS: &[OptionSpec] = &[
    OptionSpec::validated("types", "u", validate_types),
    OptionSpec::new("multiple", "b"),
    OptionSpec::validated("cursor_mode", "u", validate_cursor_mode),
    OptionSpec::new(RESTORE_TOKEN, "s"),
    OptionSpec::validated(PERSIST_MODE, "u", validate_persist_mode),
];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.ScreenCast",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplScreenCast {
    fn create_session(
        &self,
        handle: &ObjectPath<'_>,
        session_handle: &ObjectPath<'_>,
        app_id: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn select_sources(
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

    #[zbus(property)]
    fn available_source_types(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn available_cursor_modes(&self) -> zbus::Result<u32>;
}

/// State of a screen cast session.
#[derive(Debug, Default)]
pub struct ScreenCastSession {
    pub restore: RestoreState,
    pub sources_selected: bool,
}

fn restore_state(data: &mut SessionData) -> Option<&mut RestoreState> {
    match data {
        SessionData::ScreenCast(screen_cast) => Some(&mut screen_cast.restore),
        SessionData::RemoteDesktop(remote_desktop) => Some(&mut remote_desktop.restore),
        _ => None,
    }
}

async fn with_restore<F>(broker: &Broker, session: &Session, work: F) -> Result<VarDict, PortalError>
where
    F: FnOnce(RestoreOwner<'_>, &mut RestoreState) -> VarDict + Send + 'static,
{
    let mut state = session
        .with_data(|data| restore_state(data).cloned())
        .ok_or_else(|| PortalError::invalid("Session cannot be restored"))?;
    let sender = session.sender().to_string();
    let app_id = session.app_info().id().to_string();
    let (state, dict) = unblock(&broker.executor, move || {
        let owner = RestoreOwner {
            sender: &sender,
            app_id: &app_id,
        };
        let dict = work(owner, &mut state);
        (state, dict)
    })
    .await?;
    session.with_data(|data| {
        if let Some(current) = restore_state(data) {
            *current = state;
        }
    });
    Ok(dict)
}

/// Turns a `restore_token` in `options` into the data it stands for.
pub(super) async fn restore_from_token(
    broker: &Broker,
    session: &Session,
    table: &'static str,
    mut options: VarDict,
) -> Result<VarDict, PortalError> {
    let tokens = broker.restore.clone();
    with_restore(broker, session, move |owner, state| {
        tokens.replace_token_with_data(owner, state, table, &mut options);
        options
    })
    .await
}

/// Keeps `restore_data` in `results` and hands out a token instead.
pub(super) async fn store_restore_data(
    broker: &Broker,
    session: &Session,
    table: &'static str,
    mut results: VarDict,
) -> Result<VarDict, PortalError> {
    let tokens = broker.restore.clone();
    with_restore(broker, session, move |owner, state| {
        tokens.replace_data_with_token(owner, state, table, &mut results);
        results
    })
    .await
}

pub struct ScreenCast {
    broker: Arc<Broker>,
    backend: String,
}

impl ScreenCast {
    pub fn new(broker: Arc<Broker>, backend: String) -> ScreenCast {
        ScreenCast { broker, backend }
    }

    async fn proxy(&self) -> fdo::Result<ImplScreenCastProxy<'static>> {
        Ok(impl_proxy(&self.broker.connection, &self.backend).await?)
    }
}

#[zbus::interface(name = "org.freedesktop.portal.ScreenCast")]
impl ScreenCast {
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
            SessionData::ScreenCast(ScreenCastSession::default()),
        )?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let created = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let proxy: ImplScreenCastProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
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

    /// Also accepts remote desktop sessions, which then share the screen
    /// as well.
    async fn select_sources(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        let token = handle_token(&options);
        let mut options = filter_options(&options, SELECT_OPTIONS)?;
        let remote_desktop = session.with_data(|data| match data {
            SessionData::ScreenCast(_) => Ok(false),
            SessionData::RemoteDesktop(_) => Ok(true),
            data => Err(PortalError::invalid(format!("Cannot share the screen in a {} session", data.name()))),
        })?;
        if remote_desktop {
            // Those persist through SelectDevices.
            options.remove(RESTORE_TOKEN);
            options.remove(PERSIST_MODE);
        }
        session.begin_configure()?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let configured = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let options = if remote_desktop {
                options
            } else {
                restore_from_token(&broker, &configured, TABLE, options).await?
            };
            let proxy: ImplScreenCastProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .select_sources(request.path(), configured.path(), request.app_info().id(), &options)
                .await?;
            let response = Response::from(reply);
            if response.is_success() {
                configured.with_data(|data| match data {
                    SessionData::ScreenCast(screen_cast) => screen_cast.sources_selected = true,
                    SessionData::RemoteDesktop(remote_desktop) => remote_desktop.sources_selected = true,
                    _ => {}
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
        let selected = session.with_data(|data| match data {
            SessionData::ScreenCast(screen_cast) => Ok(screen_cast.sources_selected),
            data => Err(PortalError::invalid(format!("Cannot start a {} session here", data.name()))),
        })?;
        if !selected {
            return Err(PortalError::failed("No sources selected"));
        }
        session.begin_start()?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let started = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let proxy: ImplScreenCastProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
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
            let results = store_restore_data(&broker, &started, TABLE, response.results).await?;
            if !started.mark_started() {
                debug!(path = %started.path(), "Session closed while starting");
                return Ok(Response::other());
            }
            Ok(Response::success(results))
        })
        .await
    }

    #[zbus(property)]
    async fn available_source_types(&self) -> fdo::Result<u32> {
        Ok(self.proxy().await?.available_source_types().await?)
    }

    #[zbus(property)]
    async fn available_cursor_modes(&self) -> fdo::Result<u32> {
        Ok(self.proxy().await?.available_cursor_modes().await?)
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        5
    }
}
