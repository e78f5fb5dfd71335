// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use crate::{
    app_info::{AppKind, IdentityError},
    fd::FdError,
    permissions::StoreError,
};

/// Errors returned to portal clients, in the `org.freedesktop.portal.Error` namespace.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.freedesktop.portal.Error")]
pub enum PortalError {
    #[zbus(error)]
    ZBus(zbus::Error),
    Failed(String),
    InvalidArgument(String),
    NotAllowed(String),
    Cancelled(String),
    WindowDestroyed(String),
    NotFound(String),
    Exists(String),
}

impl PortalError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::NotAllowed(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<zbus::fdo::Error> for PortalError {
    fn from(err: zbus::fdo::Error) -> Self {
        Self::ZBus(zbus::Error::FDO(Box::new(err)))
    }
}

impl From<zbus::zvariant::Error> for PortalError {
    fn from(err: zbus::zvariant::Error) -> Self {
        Self::ZBus(zbus::Error::Variant(err))
    }
}

impl From<futures_util::task::SpawnError> for PortalError {
    fn from(err: futures_util::task::SpawnError) -> Self {
        Self::Failed(format!("Worker pool unavailable: {err}"))
    }
}

impl From<StoreError> for PortalError {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Internal failure kinds that are translated to [`PortalError`] at the bus boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Caller identity unavailable: {0}")]
    IdentityUnavailable(#[from] IdentityError),
    #[error("Operation not available to {0} applications")]
    WrongAppKind(AppKind),
    #[error("Rejected file descriptor: {0}")]
    FdRejected(FdError),
    #[error("Path {} does not match the passed file descriptor", .0.display())]
    PathMismatch(PathBuf),
    #[error("Token {0} is already in use")]
    TokenReuse(String),
}

impl From<FdError> for CoreError {
    fn from(err: FdError) -> Self {
        match err {
            FdError::PathMismatch(path) => CoreError::PathMismatch(path),
            err => CoreError::FdRejected(err),
        }
    }
}

impl From<CoreError> for PortalError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::IdentityUnavailable(_) | CoreError::WrongAppKind(_) => {
                PortalError::NotAllowed(message)
            }
            CoreError::FdRejected(FdError::PermissionDenied) => PortalError::NotAllowed(message),
            CoreError::FdRejected(FdError::Io(_)) => PortalError::Failed(message),
            CoreError::FdRejected(_) | CoreError::PathMismatch(_) => {
                PortalError::InvalidArgument(message)
            }
            CoreError::TokenReuse(_) => PortalError::Exists(message),
        }
    }
}

impl From<FdError> for PortalError {
    fn from(err: FdError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<IdentityError> for PortalError {
    fn from(err: IdentityError) -> Self {
        CoreError::from(err).into()
    }
}
