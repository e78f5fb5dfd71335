// SPDX-License-Identifier: GPL-3.0-only

//! Request handles: one per portal call that answers asynchronously.
//!
//! A request is exported before the call returns, answers with exactly one
//! `Response` signal at most, and disappears after that, after a `Close()`
//! from its owner or once its owner leaves the bus.

use std::sync::Arc;

use futures_executor::ThreadPool;
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
};

/// Codes of the `Response` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success = 0,
    Cancelled = 1,
    Other = 2,
}

impl From<u32> for ResponseCode {
    fn from(code: u32) -> Self {
        match code {
            0 => ResponseCode::Success,
            1 => ResponseCode::Cancelled,
            _ => ResponseCode::Other,
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub code: ResponseCode,
    pub results: VarDict,
}

impl Response {
    pub fn new(code: ResponseCode, results: VarDict) -> Response {
        Response { code, results }
    }

    pub fn success(results: VarDict) -> Response {
        Response::new(ResponseCode::Success, results)
    }

    pub fn cancelled() -> Response {
        Response::new(ResponseCode::Cancelled, VarDict::new())
    }

    pub fn other() -> Response {
        Response::new(ResponseCode::Other, VarDict::new())
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }
}

/// `(response, results)` as returned by implementations.
impl From<(u32, VarDict)> for Response {
    fn from((code, results): (u32, VarDict)) -> Self {
        Response::new(code.into(), results)
    }
}

/// How a request ends once its worker is done.
#[derive(Debug)]
pub enum Completion {
    Respond(Response),
    /// The handle stays exported until closed, as for inhibitors.
    KeepAlive,
}

impl From<Response> for Completion {
    fn from(response: Response) -> Self {
        Completion::Respond(response)
    }
}

#[zbus::proxy(interface = "org.freedesktop.impl.portal.Request")]
pub trait ImplRequest {
    fn close(&self) -> zbus::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Exported,
    Done,
}

#[derive(Debug)]
struct RequestState {
    phase: Phase,
    /// Bus name of the implementation currently serving this handle.
    implementation: Option<String>,
}

impl RequestState {
    fn new() -> RequestState {
        RequestState {
            phase: Phase::Created,
            implementation: None,
        }
    }

    fn mark_exported(&mut self) -> bool {
        if self.phase != Phase::Created {
            return false;
        }
        self.phase = Phase::Exported;
        true
    }

    /// Claims the right to send `Response`. Only the first of this and
    /// [`RequestState::begin_close`] wins.
    fn begin_response(&mut self) -> bool {
        if self.phase != Phase::Exported {
            return false;
        }
        self.phase = Phase::Done;
        true
    }

    fn begin_close(&mut self) -> Option<Teardown> {
        let exported = match self.phase {
            Phase::Done => return None,
            Phase::Created => false,
            Phase::Exported => true,
        };
        self.phase = Phase::Done;
        Some(Teardown {
            exported,
            implementation: self.implementation.take(),
        })
    }
}

/// What remains to do once a request stopped being live.
#[derive(Debug)]
pub struct Teardown {
    exported: bool,
    implementation: Option<String>,
}

pub struct Request {
    path: ObjectPath<'static>,
    sender: UniqueName<'static>,
    app_info: Arc<AppInfo>,
    connection: zbus::Connection,
    state: Mutex<RequestState>,
}

impl Handle for Request {
    fn path(&self) -> &ObjectPath<'static> {
        &self.path
    }

    fn owner(&self) -> &str {
        self.sender.as_str()
    }
}

impl Request {
    pub fn new(
        path: ObjectPath<'static>,
        sender: UniqueName<'static>,
        app_info: Arc<AppInfo>,
        connection: zbus::Connection,
    ) -> Request {
        Request {
            path,
            sender,
            app_info,
            connection,
            state: Mutex::new(RequestState::new()),
        }
    }

    pub fn sender(&self) -> &UniqueName<'static> {
        &self.sender
    }

    pub fn app_info(&self) -> &Arc<AppInfo> {
        &self.app_info
    }

    pub fn connection(&self) -> &zbus::Connection {
        &self.connection
    }

    /// Records which implementation a `Close()` has to be forwarded to.
    pub fn set_implementation(&self, bus_name: &str) {
        self.state.lock().implementation = Some(bus_name.to_string());
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().phase == Phase::Exported
    }

    fn mark_exported(&self) -> bool {
        self.state.lock().mark_exported()
    }

    fn begin_response(&self) -> bool {
        self.state.lock().begin_response()
    }

    fn begin_close(&self) -> Option<Teardown> {
        self.state.lock().begin_close()
    }

    async fn export(self: &Arc<Self>, requests: &Arc<Requests>) -> zbus::Result<()> {
        let object = RequestObject {
            request: self.clone(),
            requests: requests.clone(),
        };
        self.connection
            .object_server()
            .at(self.path.clone(), object)
            .await?;
        if !self.mark_exported() {
            // Cancelled while exporting.
            self.unexport().await;
        }
        Ok(())
    }

    async fn unexport(&self) {
        if let Err(err) = self
            .connection
            .object_server()
            .remove::<RequestObject, _>(&self.path)
            .await
        {
            debug!(path = %self.path, ?err, "Request already gone");
        }
    }

    /// Sends `response` and unexports. Returns `false` if the request was
    /// no longer live and nothing was sent.
    pub async fn respond(&self, response: Response) -> bool {
        if !self.begin_response() {
            debug!(path = %self.path, "Dropping response of a closed request");
            return false;
        }
        let emitted = async {
            let emitter = SignalEmitter::new(&self.connection, self.path.clone())?
                .set_destination(BusName::Unique(self.sender.clone()));
            RequestObject::response(&emitter, response.code as u32, &response.results).await
        }
        .await;
        if let Err(err) = emitted {
            warn!(path = %self.path, ?err, "Failed to emit Response");
        }
        self.unexport().await;
        true
    }

    async fn finish_close(&self, teardown: Teardown) {
        if let Some(implementation) = teardown.implementation {
            let closed = async {
                ImplRequestProxy::builder(&self.connection)
                    .destination(implementation)?
                    .path(self.path.clone())?
                    .build()
                    .await?
                    .close()
                    .await
            }
            .await;
            if let Err(err) = closed {
                debug!(path = %self.path, ?err, "Implementation request not closed");
            }
        }
        if teardown.exported {
            self.unexport().await;
        }
    }
}

/// All live requests of the broker.
pub struct Requests {
    table: HandleTable<Request>,
    executor: ThreadPool,
}

impl Requests {
    pub fn new(executor: ThreadPool) -> Requests {
        Requests {
            table: HandleTable::default(),
            executor,
        }
    }

    /// Adds and exports `request`.
    pub async fn publish(self: &Arc<Self>, request: &Arc<Request>) -> Result<(), PortalError> {
        self.table.insert(request.clone()).map_err(PortalError::from)?;
        if let Err(err) = request.export(self).await {
            self.table.remove(request.path());
            request.begin_close();
            return Err(err.into());
        }
        Ok(())
    }

    pub fn get(&self, path: &ObjectPath<'_>) -> Option<Arc<Request>> {
        self.table.get(path)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Ends a request the way its worker decided. Returns whether a
    /// `Response` actually reached the bus.
    pub async fn complete(&self, request: &Arc<Request>, completion: Completion) -> bool {
        match completion {
            Completion::Respond(response) => {
                let sent = request.respond(response).await;
                self.table.remove(request.path());
                sent
            }
            Completion::KeepAlive => request.is_live(),
        }
    }

    /// Cancels `request`. No `Response` is sent afterwards.
    pub fn close(&self, request: &Arc<Request>) {
        self.table.remove(request.path());
        self.spawn_teardown(request.clone());
    }

    fn spawn_teardown(&self, request: Arc<Request>) {
        if let Some(teardown) = request.begin_close() {
            self.executor
                .spawn_ok(async move { request.finish_close(teardown).await });
        }
    }
}

impl OwnerSubscriber for Requests {
    fn owner_vanished(&self, owner: &UniqueName<'static>) {
        for request in self.table.take_owner(owner.as_str()) {
            debug!(path = %request.path(), "Closing request of vanished caller");
            self.spawn_teardown(request);
        }
    }
}

/// Only the creator of a handle may act on it.
pub fn check_owner(header: &Header<'_>, owner: &UniqueName<'_>) -> Result<(), PortalError> {
    match header.sender() {
        Some(sender) if sender.as_str() == owner.as_str() => Ok(()),
        _ => Err(zbus::fdo::Error::AccessDenied("Not the owner of this handle".to_string()).into()),
    }
}

/// Client side `org.freedesktop.portal.Request` object.
pub struct RequestObject {
    request: Arc<Request>,
    requests: Arc<Requests>,
}

#[zbus::interface(name = "org.freedesktop.portal.Request")]
impl RequestObject {
    async fn close(&self, #[zbus(header)] header: Header<'_>) -> Result<(), PortalError> {
        check_owner(&header, self.request.sender())?;
        debug!(path = %self.request.path(), "Request closed by caller");
        self.requests.close(&self.request);
        Ok(())
    }

    #[zbus(signal)]
    async fn response(emitter: &SignalEmitter<'_>, response: u32, results: &VarDict) -> zbus::Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_response_codes() {
        assert_eq!(ResponseCode::from(0), ResponseCode::Success);
        assert_eq!(ResponseCode::from(1), ResponseCode::Cancelled);
        assert_eq!(ResponseCode::from(2), ResponseCode::Other);
        assert_eq!(ResponseCode::from(77), ResponseCode::Other);

        let response = Response::from((0, VarDict::new()));
        assert!(response.is_success());
        assert!(!Response::cancelled().is_success());
        assert!(matches!(Completion::from(Response::other()), Completion::Respond(_)));
    }

    #[test]
    fn test_response_wins_over_close() {
        let mut state = RequestState::new();
        assert!(!state.begin_response());
        assert!(state.mark_exported());
        assert!(!state.mark_exported());
        state.implementation = Some("org.example.Impl".into());

        assert!(state.begin_response());
        assert!(!state.begin_response());
        assert!(state.begin_close().is_none());
    }

    #[test]
    fn test_close_suppresses_response() {
        let mut state = RequestState::new();
        assert!(state.mark_exported());
        state.implementation = Some("org.example.Impl".into());

        let teardown = state.begin_close().unwrap();
        assert!(teardown.exported);
        assert_eq!(teardown.implementation.as_deref(), Some("org.example.Impl"));
        assert!(!state.begin_response());
        assert!(state.begin_close().is_none());
    }

    #[test]
    fn test_close_before_export() {
        let mut state = RequestState::new();
        let teardown = state.begin_close().unwrap();
        assert!(!teardown.exported);
        assert!(teardown.implementation.is_none());
        // A late export must notice and back out.
        assert!(!state.mark_exported());
    }

    fn close_call(sender: &str) -> zbus::Message {
        zbus::Message::method_call("/org/freedesktop/portal/desktop/request/1_5/t1", "Close")
            .unwrap()
            .sender(sender)
            .unwrap()
            .build(&())
            .unwrap()
    }

    #[test]
    fn test_close_requires_owner() {
        let owner = UniqueName::try_from(":1.5").unwrap();
        assert!(check_owner(&close_call(":1.5").header(), &owner).is_ok());

        let err = check_owner(&close_call(":1.6").header(), &owner).unwrap_err();
        assert!(matches!(
            err,
            PortalError::ZBus(zbus::Error::FDO(ref fdo)) if matches!(**fdo, zbus::fdo::Error::AccessDenied(_))
        ));
    }
}
