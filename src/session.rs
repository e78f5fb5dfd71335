// SPDX-License-Identifier: GPL-3.0-only

//! Session handles: long lived state shared by a caller, the broker and an
//! implementation.

use std::{future::Future, sync::Arc};

use futures_executor::ThreadPool;
use futures_util::{
    future::{abortable, AbortHandle},
    lock::Mutex as AsyncMutex,
    StreamExt,
};
use parking_lot::Mutex;
use tracing::{debug, warn};
use zbus::{
    message::Header,
    names::{BusName, UniqueName},
    object_server::SignalEmitter,
    zvariant::ObjectPath,
};

use crate::{
    app_info::AppInfo,
    dbus::name_owners::OwnerSubscriber,
    error::PortalError,
    handles::{Handle, HandleTable},
    options::VarDict,
    portals::{
        location::LocationSession, remote_desktop::RemoteDesktopSession, screen_cast::ScreenCastSession,
        DESKTOP_PATH,
    },
    request::check_owner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Configuring,
    Started,
    Closed,
}

/// Who ended a session, which decides who still has to be told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `Close()` from the owner.
    Client,
    /// The implementation session emitted `Closed`.
    Implementation,
    /// The owner left the bus.
    OwnerGone,
    /// The request creating or configuring the session did not succeed.
    Failed,
    /// The broker gave up on the session itself.
    Broker,
}

impl CloseReason {
    fn notifies_client(self) -> bool {
        matches!(self, CloseReason::Implementation | CloseReason::Broker)
    }

    fn closes_implementation(self) -> bool {
        self != CloseReason::Implementation
    }
}

/// Portal specific state.
pub enum SessionData {
    ScreenCast(ScreenCastSession),
    RemoteDesktop(RemoteDesktopSession),
    Location(LocationSession),
    InhibitMonitor,
    GlobalShortcuts,
}

impl SessionData {
    pub fn name(&self) -> &'static str {
        match self {
            SessionData::ScreenCast(_) => "screen cast",
            SessionData::RemoteDesktop(_) => "remote desktop",
            SessionData::Location(_) => "location",
            SessionData::InhibitMonitor => "inhibit monitor",
            SessionData::GlobalShortcuts => "global shortcuts",
        }
    }
}

#[zbus::proxy(interface = "org.freedesktop.impl.portal.Session")]
pub trait ImplSession {
    fn close(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn closed(&self) -> zbus::Result<()>;
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    start_requested: bool,
    exported: bool,
    impl_watch: Option<AbortHandle>,
}

#[derive(Debug)]
struct Teardown {
    reason: CloseReason,
    was_started: bool,
    exported: bool,
}

impl SessionState {
    fn new() -> SessionState {
        SessionState {
            phase: SessionPhase::Init,
            start_requested: false,
            exported: false,
            impl_watch: None,
        }
    }

    fn ensure_open(&self) -> Result<(), PortalError> {
        match self.phase {
            SessionPhase::Closed => Err(PortalError::failed("Session is closed")),
            _ => Ok(()),
        }
    }

    fn begin_configure(&mut self) -> Result<(), PortalError> {
        self.ensure_open()?;
        if self.start_requested {
            return Err(PortalError::failed("Session already started"));
        }
        self.phase = SessionPhase::Configuring;
        Ok(())
    }

    fn begin_start(&mut self) -> Result<(), PortalError> {
        self.ensure_open()?;
        if self.start_requested {
            return Err(PortalError::failed("Session already started"));
        }
        self.start_requested = true;
        Ok(())
    }

    fn mark_started(&mut self) -> bool {
        if self.phase == SessionPhase::Closed {
            return false;
        }
        self.start_requested = true;
        self.phase = SessionPhase::Started;
        true
    }

    fn ensure_started(&self) -> Result<(), PortalError> {
        self.ensure_open()?;
        if self.phase != SessionPhase::Started {
            return Err(PortalError::failed("Session not started"));
        }
        Ok(())
    }

    fn begin_close(&mut self, reason: CloseReason) -> Option<Teardown> {
        if self.phase == SessionPhase::Closed {
            return None;
        }
        let was_started = self.phase == SessionPhase::Started;
        self.phase = SessionPhase::Closed;
        if let Some(watch) = self.impl_watch.take() {
            watch.abort();
        }
        Some(Teardown {
            reason,
            was_started,
            exported: std::mem::take(&mut self.exported),
        })
    }
}

pub struct Session {
    path: ObjectPath<'static>,
    sender: UniqueName<'static>,
    app_info: Arc<AppInfo>,
    token: String,
    connection: zbus::Connection,
    /// Bus name of the implementation owning the twin session, if any.
    implementation: Option<String>,
    state: Mutex<SessionState>,
    data: Mutex<SessionData>,
    /// Held while emitting anything toward the owner.
    signals: AsyncMutex<()>,
}

impl Handle for Session {
    fn path(&self) -> &ObjectPath<'static> {
        &self.path
    }

    fn owner(&self) -> &str {
        self.sender.as_str()
    }
}

impl Session {
    pub fn new(
        path: ObjectPath<'static>,
        sender: UniqueName<'static>,
        app_info: Arc<AppInfo>,
        token: String,
        connection: zbus::Connection,
        implementation: Option<String>,
        data: SessionData,
    ) -> Session {
        Session {
            path,
            sender,
            app_info,
            token,
            connection,
            implementation,
            state: Mutex::new(SessionState::new()),
            data: Mutex::new(data),
            signals: AsyncMutex::new(()),
        }
    }

    pub fn sender(&self) -> &UniqueName<'static> {
        &self.sender
    }

    pub fn app_info(&self) -> &Arc<AppInfo> {
        &self.app_info
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn implementation(&self) -> Option<&str> {
        self.implementation.as_deref()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn ensure_open(&self) -> Result<(), PortalError> {
        self.state.lock().ensure_open()
    }

    pub fn begin_configure(&self) -> Result<(), PortalError> {
        self.state.lock().begin_configure()
    }

    /// Fails if `Start` was already asked for once. A repeated `Start` is
    /// a `Failed` error on the method call, no Request is created for it.
    pub fn begin_start(&self) -> Result<(), PortalError> {
        self.state.lock().begin_start()
    }

    pub fn mark_started(&self) -> bool {
        self.state.lock().mark_started()
    }

    pub fn ensure_started(&self) -> Result<(), PortalError> {
        self.state.lock().ensure_started()
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&mut SessionData) -> R) -> R {
        f(&mut self.data.lock())
    }

    async fn export(self: &Arc<Self>, sessions: &Arc<Sessions>) -> zbus::Result<()> {
        let object = SessionObject {
            session: self.clone(),
            sessions: sessions.clone(),
        };
        self.connection
            .object_server()
            .at(self.path.clone(), object)
            .await?;
        let closed = {
            let mut state = self.state.lock();
            state.exported = state.phase != SessionPhase::Closed;
            !state.exported
        };
        if closed {
            self.unexport().await;
        }
        Ok(())
    }

    async fn unexport(&self) {
        if let Err(err) = self
            .connection
            .object_server()
            .remove::<SessionObject, _>(&self.path)
            .await
        {
            debug!(path = %self.path, ?err, "Session already gone");
        }
    }

    /// Emits a signal toward the owner unless the session is closed.
    ///
    /// Forwarded signals go out on the portal object and carry the session
    /// handle in their arguments.
    pub async fn forward<F, Fut>(&self, emit: F)
    where
        F: FnOnce(SignalEmitter<'static>) -> Fut,
        Fut: Future<Output = zbus::Result<()>>,
    {
        let _guard = self.signals.lock().await;
        if self.phase() == SessionPhase::Closed {
            debug!(path = %self.path, "Dropping signal for closed session");
            return;
        }
        let emitter = match SignalEmitter::new(&self.connection, DESKTOP_PATH) {
            Ok(emitter) => emitter.set_destination(BusName::Unique(self.sender.clone())),
            Err(err) => {
                warn!(?err, "Invalid portal object path");
                return;
            }
        };
        if let Err(err) = emit(emitter).await {
            warn!(path = %self.path, ?err, "Failed to forward session signal");
        }
    }

    /// Watches the implementation session for `Closed`.
    pub fn watch_implementation<F>(self: &Arc<Self>, executor: &ThreadPool, on_closed: F)
    where
        F: FnOnce(Arc<Session>) + Send + 'static,
    {
        let Some(implementation) = self.implementation.clone() else {
            return;
        };
        let session = self.clone();
        let (watch, handle) = abortable(async move {
            let closed = async {
                let proxy = ImplSessionProxy::builder(&session.connection)
                    .destination(implementation)?
                    .path(session.path.clone())?
                    .build()
                    .await?;
                let mut closed = proxy.receive_closed().await?;
                Ok::<_, zbus::Error>(closed.next().await.is_some())
            }
            .await;
            match closed {
                Ok(true) => on_closed(session),
                Ok(false) => {}
                Err(err) => warn!(path = %session.path, ?err, "Cannot watch implementation session"),
            }
        });
        {
            let mut state = self.state.lock();
            if state.phase == SessionPhase::Closed {
                return;
            }
            state.impl_watch = Some(handle);
        }
        executor.spawn_ok(async move {
            let _ = watch.await;
        });
    }

    async fn finish_close(&self, teardown: Teardown) {
        let location = self.with_data(|data| match data {
            SessionData::Location(location) => location.take_client(),
            _ => None,
        });
        if let Some(client) = location {
            client.stop().await;
        }

        if teardown.reason.notifies_client() && teardown.was_started && teardown.exported {
            // Waits for forwards that saw the session still open.
            let _guard = self.signals.lock().await;
            let emitted = async {
                let emitter = SignalEmitter::new(&self.connection, self.path.clone())?
                    .set_destination(BusName::Unique(self.sender.clone()));
                SessionObject::closed(&emitter, &VarDict::new()).await
            }
            .await;
            if let Err(err) = emitted {
                warn!(path = %self.path, ?err, "Failed to emit Closed");
            }
        }

        if teardown.exported {
            self.unexport().await;
        }

        if teardown.reason.closes_implementation() {
            if let Some(implementation) = &self.implementation {
                let closed = async {
                    ImplSessionProxy::builder(&self.connection)
                        .destination(implementation.as_str())?
                        .path(self.path.clone())?
                        .build()
                        .await?
                        .close()
                        .await
                }
                .await;
                if let Err(err) = closed {
                    debug!(path = %self.path, ?err, "Implementation session not closed");
                }
            }
        }
        debug!(path = %self.path, reason = ?teardown.reason, "Session closed");
    }
}

/// All live sessions of the broker.
pub struct Sessions {
    table: HandleTable<Session>,
    executor: ThreadPool,
}

impl Sessions {
    pub fn new(executor: ThreadPool) -> Sessions {
        Sessions {
            table: HandleTable::default(),
            executor,
        }
    }

    /// Reserves the session path. A sender reusing a live token is refused.
    pub fn insert(&self, session: &Arc<Session>) -> Result<(), PortalError> {
        Ok(self.table.insert(session.clone())?)
    }

    pub async fn publish(self: &Arc<Self>, session: &Arc<Session>) -> zbus::Result<()> {
        session.export(self).await
    }

    /// The session at `path`, if it belongs to the caller.
    pub fn lookup(&self, path: &ObjectPath<'_>, sender: &UniqueName<'_>) -> Result<Arc<Session>, PortalError> {
        match self.table.get(path) {
            Some(session) if session.sender.as_str() == sender.as_str() => Ok(session),
            _ => Err(zbus::fdo::Error::AccessDenied("Invalid session".to_string()).into()),
        }
    }

    /// Any session at `path`, regardless of owner.
    pub fn get(&self, path: &ObjectPath<'_>) -> Option<Arc<Session>> {
        self.table.get(path)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn close(&self, session: &Arc<Session>, reason: CloseReason) {
        self.table.remove(session.path());
        self.spawn_teardown(session.clone(), reason);
    }

    fn spawn_teardown(&self, session: Arc<Session>, reason: CloseReason) {
        let Some(teardown) = session.state.lock().begin_close(reason) else {
            return;
        };
        self.executor
            .spawn_ok(async move { session.finish_close(teardown).await });
    }
}

impl OwnerSubscriber for Sessions {
    fn owner_vanished(&self, owner: &UniqueName<'static>) {
        for session in self.table.take_owner(owner.as_str()) {
            debug!(path = %session.path(), "Closing session of vanished caller");
            self.spawn_teardown(session, CloseReason::OwnerGone);
        }
    }
}

/// Client side `org.freedesktop.portal.Session` object.
pub struct SessionObject {
    session: Arc<Session>,
    sessions: Arc<Sessions>,
}

#[zbus::interface(name = "org.freedesktop.portal.Session")]
impl SessionObject {
    async fn close(&self, #[zbus(header)] header: Header<'_>) -> Result<(), PortalError> {
        check_owner(&header, self.session.sender())?;
        self.sessions.close(&self.session, CloseReason::Client);
        Ok(())
    }

    #[zbus(signal)]
    async fn closed(emitter: &SignalEmitter<'_>, details: &VarDict) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_start_at_most_once() {
        let mut state = SessionState::new();
        state.begin_configure().unwrap();
        assert_eq!(state.phase, SessionPhase::Configuring);
        state.begin_start().unwrap();
        assert!(state.begin_start().is_err());
        // No more configuration once starting.
        assert!(state.begin_configure().is_err());
        assert!(state.ensure_started().is_err());
        assert!(state.mark_started());
        state.ensure_started().unwrap();
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut state = SessionState::new();
        state.exported = true;
        let teardown = state.begin_close(CloseReason::Client).unwrap();
        assert!(teardown.exported);
        assert!(!teardown.was_started);

        assert!(state.begin_close(CloseReason::Implementation).is_none());
        assert!(state.ensure_open().is_err());
        assert!(state.begin_configure().is_err());
        assert!(state.begin_start().is_err());
        assert!(!state.mark_started());
        assert_eq!(state.phase, SessionPhase::Closed);
    }

    #[test]
    fn test_close_reasons() {
        // Only an implementation side or broker side end is news to the client.
        assert!(!CloseReason::Client.notifies_client());
        assert!(!CloseReason::OwnerGone.notifies_client());
        assert!(!CloseReason::Failed.notifies_client());
        assert!(CloseReason::Implementation.notifies_client());
        assert!(CloseReason::Broker.notifies_client());

        assert!(CloseReason::OwnerGone.closes_implementation());
        assert!(CloseReason::Client.closes_implementation());
        assert!(!CloseReason::Implementation.closes_implementation());
    }

    #[test]
    fn test_started_close_remembers_start() {
        let mut state = SessionState::new();
        state.begin_start().unwrap();
        state.mark_started();
        state.exported = true;
        let teardown = state.begin_close(CloseReason::Implementation).unwrap();
        assert!(teardown.was_started);
        assert!(teardown.exported);
        assert_eq!(teardown.reason, CloseReason::Implementation);
    }

    fn session(connection: zbus::Connection) -> Session {
        Session::new(
            ObjectPath::try_from("/org/freedesktop/portal/desktop/session/1_7/s1").unwrap(),
            UniqueName::try_from(":1.7").unwrap(),
            Arc::new(AppInfo::test("org.example.App".into())),
            "s1".into(),
            connection,
            None,
            SessionData::GlobalShortcuts,
        )
    }

    #[test]
    fn test_forward_dropped_after_close() {
        let (connection, _peer) = crate::utils::peer_connections();
        let session = session(connection);
        let counter = std::sync::atomic::AtomicUsize::new(0);
        let emitted = &counter;
        let emit = move |_emitter: SignalEmitter<'static>| async move {
            emitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, zbus::Error>(())
        };

        futures_executor::block_on(session.forward(emit));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);

        assert!(session.state.lock().begin_close(CloseReason::Client).is_some());
        futures_executor::block_on(session.forward(emit));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
