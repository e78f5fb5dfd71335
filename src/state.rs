// SPDX-License-Identifier: GPL-3.0-only

use std::{os::fd::OwnedFd, sync::Arc};

use anyhow::Context;
use calloop::LoopSignal;
use futures_executor::ThreadPool;
use portal_broker_config::BrokerConfig;
use tracing::{debug, info, warn};
use zbus::{fdo, message::Header, names::UniqueName};

use crate::{
    app_info::{AppInfo, AppInfoResolver},
    dbus::{
        name_owners::{BusEvent, OwnerFanout},
        Backends,
    },
    documents::Documents,
    error::PortalError,
    fd::{verify_fd, FileKind, SafeFd},
    permissions::{BusPermissionStore, MemoryPermissionStore, PermissionStore, TransientPermissions},
    portals,
    request::Requests,
    restore::RestoreTokens,
    session::Sessions,
    utils::{dirs::HostDirs, unblock},
};

/// Everything portal front-ends share.
pub struct Broker {
    pub connection: zbus::Connection,
    /// Needed by the portals fronting system services.
    pub system_bus: Option<zbus::Connection>,
    pub dbus: fdo::DBusProxy<'static>,
    pub executor: ThreadPool,
    pub config: BrokerConfig,
    pub dirs: HostDirs,
    pub app_infos: Arc<AppInfoResolver>,
    pub requests: Arc<Requests>,
    pub sessions: Arc<Sessions>,
    pub permissions: Arc<dyn PermissionStore>,
    pub transient: Arc<TransientPermissions>,
    pub restore: Arc<RestoreTokens>,
    pub documents: Documents,
    pub backends: Backends,
}

/// An authorized incoming method call.
#[derive(Debug, Clone)]
pub struct Call {
    pub sender: UniqueName<'static>,
    pub app_info: Arc<AppInfo>,
}

async fn open_permission_store(connection: &zbus::Connection) -> Arc<dyn PermissionStore> {
    if BusPermissionStore::available(connection).await {
        match BusPermissionStore::connect(connection).await {
            Ok(store) => return Arc::new(store),
            Err(err) => warn!(?err, "Failed to connect to the permission store"),
        }
    }
    warn!("Permission store not reachable, permissions only last for this session");
    Arc::new(MemoryPermissionStore::default())
}

impl Broker {
    pub async fn new(
        connection: zbus::Connection,
        executor: ThreadPool,
        config: BrokerConfig,
        dirs: HostDirs,
    ) -> anyhow::Result<Arc<Broker>> {
        let dbus = fdo::DBusProxy::new(&connection)
            .await
            .context("Failed to create bus daemon proxy")?;
        let permissions = open_permission_store(&connection).await;
        let backends = Backends::resolve(&dbus, &config, portals::IMPL_INTERFACES).await;
        let documents = Documents::connect(&connection, &dirs.runtime_dir).await;
        let system_bus = zbus::Connection::system()
            .await
            .inspect_err(|err| warn!(?err, "System bus unavailable"))
            .ok();
        let app_infos = Arc::new(AppInfoResolver::new(dirs.clone(), config.test_app_id.clone()));

        Ok(Arc::new(Broker {
            requests: Arc::new(Requests::new(executor.clone())),
            sessions: Arc::new(Sessions::new(executor.clone())),
            transient: Arc::new(TransientPermissions::default()),
            restore: Arc::new(RestoreTokens::new(permissions.clone())),
            connection,
            system_bus,
            dbus,
            executor,
            config,
            dirs,
            app_infos,
            permissions,
            documents,
            backends,
        }))
    }

    /// Resolves who is calling. Fails with `NotAllowed` if the caller
    /// cannot be identified.
    pub async fn authorize(&self, header: &Header<'_>) -> Result<Call, PortalError> {
        let sender = header
            .sender()
            .ok_or_else(|| PortalError::not_allowed("Message without sender"))?
            .to_owned();
        let app_info = self
            .app_infos
            .resolve(&self.dbus, &self.executor, &sender)
            .await
            .inspect_err(|err| warn!(sender = %sender, %err, "Refusing unidentified caller"))?;
        Ok(Call { sender, app_info })
    }

    /// Checks a descriptor passed by `call` on the worker pool.
    pub async fn verify_fd(&self, call: &Call, fd: OwnedFd, kind: FileKind) -> Result<SafeFd, PortalError> {
        let app_info = call.app_info.clone();
        let mount = self.documents.mount().to_path_buf();
        let verified = unblock(&self.executor, move || verify_fd(&app_info, fd, kind, &mount)).await?;
        Ok(verified.inspect_err(|err| debug!(sender = %call.sender, %err, "Rejected file descriptor"))?)
    }

    /// Subscribers dropping everything a vanished caller left behind.
    pub fn owner_fanout(&self) -> OwnerFanout {
        OwnerFanout::new()
            .with(self.requests.clone())
            .with(self.sessions.clone())
            .with(self.app_infos.clone())
            .with(self.transient.clone())
            .with(self.restore.clone())
    }
}

/// State of the main loop.
pub struct State {
    pub broker: Arc<Broker>,
    pub fanout: OwnerFanout,
    pub loop_signal: LoopSignal,
}

impl State {
    pub fn new(broker: Arc<Broker>, loop_signal: LoopSignal) -> State {
        State {
            fanout: broker.owner_fanout(),
            broker,
            loop_signal,
        }
    }

    pub fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::NameVanished(owner) => self.fanout.dispatch(&owner),
            BusEvent::NameLost(name) => {
                info!(name = %name, "Lost bus name, exiting");
                self.stop();
            }
        }
    }

    pub fn stop(&mut self) {
        debug!(
            requests = self.broker.requests.len(),
            sessions = self.broker.sessions.len(),
            "Stopping"
        );
        self.loop_signal.stop();
    }
}
