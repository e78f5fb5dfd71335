// SPDX-License-Identifier: GPL-3.0-only

//! Client facing portal interfaces.
//!
//! Every front-end authorizes the caller, filters its options, publishes a
//! request handle and runs the implementation call on the worker pool. The
//! request path is returned before the worker starts, so a `Response` can
//! never overtake the method reply.

use std::{future::Future, sync::Arc};

use tracing::{debug, info, warn};
use zbus::{
    object_server::{Interface, ResponseDispatchNotifier},
    proxy::{CacheProperties, Defaults},
    zvariant::OwnedObjectPath,
};

use crate::{
    error::PortalError,
    handles::{handle_path, Handle, REQUEST_PATH_PREFIX, SESSION_PATH_PREFIX},
    options::{get_str, to_value, VarDict},
    request::{Completion, Request, Response},
    session::{CloseReason, Session, SessionData},
    state::{Broker, Call},
};

pub mod access;
pub mod background;
pub mod clipboard;
pub mod device;
pub mod dynamic_launcher;
pub mod file_chooser;
pub mod global_shortcuts;
pub mod inhibit;
pub mod location;
pub mod notification;
pub mod open_uri;
pub mod print;
pub mod realtime;
pub mod registry;
pub mod remote_desktop;
pub mod screen_cast;
pub mod screenshot;
pub mod usb;
pub mod wallpaper;

pub const DESKTOP_PATH: &str = "/org/freedesktop/portal/desktop";

/// Reply of a method answering with a request handle. The worker waits
/// until it went out.
pub type RequestReply = ResponseDispatchNotifier<OwnedObjectPath>;

/// Implementation interfaces looked up at start-up.
pub const IMPL_INTERFACES: &[&str] = &[
    access::IMPL_INTERFACE,
    background::IMPL_INTERFACE,
    clipboard::IMPL_INTERFACE,
    dynamic_launcher::IMPL_INTERFACE,
    file_chooser::IMPL_INTERFACE,
    global_shortcuts::IMPL_INTERFACE,
    inhibit::IMPL_INTERFACE,
    notification::IMPL_INTERFACE,
    open_uri::IMPL_INTERFACE,
    print::IMPL_INTERFACE,
    remote_desktop::IMPL_INTERFACE,
    screen_cast::IMPL_INTERFACE,
    screenshot::IMPL_INTERFACE,
    wallpaper::IMPL_INTERFACE,
];

/// Proxy for the portal object of the implementation `backend`.
pub async fn impl_proxy<P>(connection: &zbus::Connection, backend: &str) -> zbus::Result<P>
where
    P: From<zbus::Proxy<'static>> + Defaults,
{
    zbus::proxy::Builder::<P>::new(connection)
        .destination(backend.to_string())?
        .cache_properties(CacheProperties::No)
        .build()
        .await
}

/// Client chosen token for the request path, if any.
pub fn handle_token(options: &VarDict) -> Option<String> {
    get_str(options, "handle_token").map(str::to_string)
}

/// Publishes a request for `call` and answers it with whatever `work`
/// returns.
///
/// Errors from `work` are logged and turned into `Response(2, {})`. If
/// `session` is given, it is closed unless a successful response reached
/// the caller.
pub async fn begin_request<W, Fut, R>(
    broker: &Arc<Broker>,
    call: &Call,
    handle_token: Option<&str>,
    session: Option<Arc<Session>>,
    work: W,
) -> Result<RequestReply, PortalError>
where
    W: FnOnce(Arc<Request>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, PortalError>> + Send + 'static,
    R: Into<Completion>,
{
    let published = async {
        let path = handle_path(REQUEST_PATH_PREFIX, call.sender.as_str(), handle_token)?;
        let request = Arc::new(Request::new(
            path.clone().into_inner(),
            call.sender.clone(),
            call.app_info.clone(),
            broker.connection.clone(),
        ));
        broker.requests.publish(&request).await?;
        Ok::<_, PortalError>((path, request))
    }
    .await;
    let (path, request) = match published {
        Ok(published) => published,
        Err(err) => {
            if let Some(session) = &session {
                broker.sessions.close(session, CloseReason::Failed);
            }
            return Err(err);
        }
    };

    let (reply, replied) = ResponseDispatchNotifier::new(path);
    let broker = broker.clone();
    let executor = broker.executor.clone();
    executor.spawn_ok(async move {
        replied.await;
        let completion = match work(request.clone()).await {
            Ok(completion) => completion.into(),
            Err(err) => {
                warn!(path = %request.path(), %err, "Request failed");
                Completion::Respond(Response::other())
            }
        };
        let succeeded = match &completion {
            Completion::Respond(response) => response.is_success(),
            Completion::KeepAlive => true,
        };
        let delivered = broker.requests.complete(&request, completion).await;
        if let Some(session) = session {
            if !(delivered && succeeded) {
                debug!(path = %session.path(), "Closing session of unsuccessful request");
                broker.sessions.close(&session, CloseReason::Failed);
            }
        }
    });
    Ok(reply)
}

/// Reserves a session for `call`. It only becomes visible on the bus once
/// [`publish_session`] is called.
pub fn create_session(
    broker: &Broker,
    call: &Call,
    session_token: Option<&str>,
    implementation: Option<&str>,
    data: SessionData,
) -> Result<Arc<Session>, PortalError> {
    let path = handle_path(SESSION_PATH_PREFIX, call.sender.as_str(), session_token)?;
    let token = path
        .as_str()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let session = Arc::new(Session::new(
        path.into_inner(),
        call.sender.clone(),
        call.app_info.clone(),
        token,
        broker.connection.clone(),
        implementation.map(str::to_string),
        data,
    ));
    broker.sessions.insert(&session)?;
    Ok(session)
}

/// Exports `session`, follows its implementation twin and adds its handle
/// to `results`.
pub async fn publish_session(broker: &Arc<Broker>, session: &Arc<Session>, results: &mut VarDict) -> Result<(), PortalError> {
    broker.sessions.publish(session).await?;
    let sessions = broker.sessions.clone();
    session.watch_implementation(&broker.executor, move |session| {
        debug!(path = %session.path(), "Implementation closed the session");
        sessions.close(&session, CloseReason::Implementation);
    });
    results.insert("session_handle".to_string(), to_value(session.path().as_str())?);
    Ok(())
}

/// Serves `object` on the portal path when `impl_interface` has an
/// implementation. Returns whether it was served.
async fn serve<I, F>(broker: &Arc<Broker>, impl_interface: &str, make: F) -> zbus::Result<bool>
where
    I: Interface,
    F: FnOnce(String) -> I,
{
    let Some(backend) = broker.backends.get(impl_interface) else {
        return Ok(false);
    };
    let object = make(backend.to_string());
    info!(interface = %I::name(), backend, "Serving portal");
    broker.connection.object_server().at(DESKTOP_PATH, object).await
}

/// Starts relaying the signals of the implementation of `impl_interface`.
fn forward(broker: &Arc<Broker>, impl_interface: &str, relay: fn(Arc<Broker>, String)) {
    if let Some(backend) = broker.backends.get(impl_interface) {
        relay(broker.clone(), backend.to_string());
    }
}

async fn serve_always<I: Interface>(broker: &Arc<Broker>, object: I) -> zbus::Result<bool> {
    info!(interface = %I::name(), "Serving portal");
    broker.connection.object_server().at(DESKTOP_PATH, object).await
}

/// Exports every portal that can be served.
pub async fn register(broker: &Arc<Broker>) -> zbus::Result<()> {
    serve_always(broker, registry::Registry::new(broker.clone())).await?;
    serve_always(broker, usb::Usb::new(broker.clone())).await?;
    if broker.system_bus.is_some() {
        serve_always(broker, realtime::Realtime::new(broker.clone())).await?;
    }

    serve(broker, file_chooser::IMPL_INTERFACE, |backend| {
        file_chooser::FileChooser::new(broker.clone(), backend)
    })
    .await?;
    serve(broker, open_uri::IMPL_INTERFACE, |backend| {
        open_uri::OpenUri::new(broker.clone(), backend)
    })
    .await?;
    serve(broker, screenshot::IMPL_INTERFACE, |backend| {
        screenshot::Screenshot::new(broker.clone(), backend)
    })
    .await?;
    serve(broker, wallpaper::IMPL_INTERFACE, |backend| {
        wallpaper::Wallpaper::new(broker.clone(), backend)
    })
    .await?;
    serve(broker, print::IMPL_INTERFACE, |backend| print::Print::new(broker.clone(), backend)).await?;
    if serve(broker, notification::IMPL_INTERFACE, |backend| {
        notification::Notification::new(broker.clone(), backend)
    })
    .await?
    {
        forward(broker, notification::IMPL_INTERFACE, notification::forward_actions);
    }
    serve(broker, background::IMPL_INTERFACE, |backend| {
        background::Background::new(broker.clone(), backend)
    })
    .await?;
    serve(broker, dynamic_launcher::IMPL_INTERFACE, |backend| {
        dynamic_launcher::DynamicLauncher::new(broker.clone(), backend)
    })
    .await?;
    if serve(broker, inhibit::IMPL_INTERFACE, |backend| inhibit::Inhibit::new(broker.clone(), backend)).await? {
        forward(broker, inhibit::IMPL_INTERFACE, inhibit::forward_state);
    }
    serve(broker, screen_cast::IMPL_INTERFACE, |backend| {
        screen_cast::ScreenCast::new(broker.clone(), backend)
    })
    .await?;
    serve(broker, remote_desktop::IMPL_INTERFACE, |backend| {
        remote_desktop::RemoteDesktop::new(broker.clone(), backend)
    })
    .await?;
    if serve(broker, clipboard::IMPL_INTERFACE, |backend| {
        clipboard::Clipboard::new(broker.clone(), backend)
    })
    .await?
    {
        forward(broker, clipboard::IMPL_INTERFACE, clipboard::forward_selection);
    }
    if serve(broker, global_shortcuts::IMPL_INTERFACE, |backend| {
        global_shortcuts::GlobalShortcuts::new(broker.clone(), backend)
    })
    .await?
    {
        forward(broker, global_shortcuts::IMPL_INTERFACE, global_shortcuts::forward_shortcuts);
    }

    // These only need the access dialog from an implementation.
    serve(broker, access::IMPL_INTERFACE, |_| device::Device::new(broker.clone())).await?;
    if broker.system_bus.is_some() {
        serve(broker, access::IMPL_INTERFACE, |_| location::Location::new(broker.clone())).await?;
    }
    Ok(())
}
