// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, sync::Arc};

use tracing::debug;
use zbus::{
    message::Header,
    zvariant::{ObjectPath, OwnedFd},
};

use super::{begin_request, handle_token, impl_proxy, RequestReply};
use crate::{
    documents::Export,
    error::PortalError,
    fd::FileKind,
    handles::Handle,
    options::{filter_options, get_bool, to_value, OptionSpec, VarDict},
    request::Response,
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.OpenURI";

const OPEN_URI_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("writable", "b"),
    OptionSpec::new("ask", "b"),
    OptionSpec::new("activation_token", "s"),
];

const OPEN_DIRECTORY_OPTIONS: &[OptionSpec] = &[OptionSpec::new("activation_token", "s")];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.OpenURI",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplOpenUri {
    #[zbus(name = "OpenURI")]
    fn open_uri(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        uri: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;
}

/// Checks a URI passed to `OpenURI`. Local files have to go through
/// `OpenFile` so they can be verified.
pub fn check_uri(uri: &str) -> Result<url::Url, PortalError> {
    let parsed = url::Url::parse(uri).map_err(|err| PortalError::invalid(format!("Invalid URI {uri:?}: {err}")))?;
    if parsed.scheme() == "file" {
        return Err(PortalError::not_allowed("Use OpenFile to open local files"));
    }
    Ok(parsed)
}

/// What gets opened.
#[derive(Debug)]
enum Target {
    Uri(String),
    /// A verified host file, exported for confined callers.
    File { path: PathBuf, export: Export },
}

pub struct OpenUri {
    broker: Arc<Broker>,
    backend: String,
}

impl OpenUri {
    pub fn new(broker: Arc<Broker>, backend: String) -> OpenUri {
        OpenUri { broker, backend }
    }

    async fn open(
        &self,
        header: Header<'_>,
        parent_window: String,
        target: Option<(OwnedFd, bool)>,
        uri: Option<String>,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let directory = matches!(target, Some((_, true)));
        let specs = if directory {
            OPEN_DIRECTORY_OPTIONS
        } else {
            OPEN_URI_OPTIONS
        };
        let options = filter_options(&options, specs)?;

        let target = match (target, uri) {
            (Some((fd, directory)), _) => {
                let verified = self.broker.verify_fd(&call, fd.into(), FileKind::Any).await?;
                let writable = !directory && verified.writable() && get_bool(&options, "writable").unwrap_or(false);
                let path = match (directory, verified.is_directory()) {
                    (true, false) => verified
                        .path()
                        .parent()
                        .map(PathBuf::from)
                        .ok_or_else(|| PortalError::invalid("File has no parent directory"))?,
                    _ => verified.path().to_path_buf(),
                };
                if !directory && verified.is_directory() {
                    return Err(PortalError::invalid("Use OpenDirectory to open directories"));
                }
                Target::File {
                    path,
                    export: Export { writable, directory },
                }
            }
            (None, Some(uri)) => {
                check_uri(&uri)?;
                Target::Uri(uri)
            }
            (None, None) => return Err(PortalError::invalid("Nothing to open")),
        };

        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let app_info = request.app_info();
            let uri = match target {
                Target::Uri(uri) => uri,
                Target::File { path, .. } if app_info.is_unconfined() => url::Url::from_file_path(&path)
                    .map(String::from)
                    .map_err(|_| PortalError::invalid(format!("Not an absolute path: {}", path.display())))?,
                Target::File { path, export } => broker
                    .documents
                    .register(&path, app_info.id(), export)
                    .await
                    .map_err(|err| PortalError::failed(err.to_string()))?,
            };
            debug!(uri, app_id = app_info.id(), "Opening");

            let proxy: ImplOpenUriProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .open_uri(request.path(), app_info.id(), &parent_window, &uri, &options)
                .await?;
            let mut response = Response::from(reply);
            if response.is_success() {
                response.results.insert("uris".to_string(), to_value(vec![uri])?);
            }
            Ok(response)
        })
        .await
    }
}

#[zbus::interface(name = "org.freedesktop.portal.OpenURI")]
impl OpenUri {
    #[zbus(name = "OpenURI")]
    async fn open_uri(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        uri: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        self.open(header, parent_window, None, Some(uri), options).await
    }

    async fn open_file(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        fd: OwnedFd,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        self.open(header, parent_window, Some((fd, false)), None, options).await
    }

    async fn open_directory(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        fd: OwnedFd,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        self.open(header, parent_window, Some((fd, true)), None, options).await
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        5
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_uri() {
        assert!(check_uri("https://example.org/page").is_ok());
        assert!(check_uri("mailto:someone@example.org").is_ok());
        assert!(matches!(
            check_uri("file:///etc/hostname"),
            Err(PortalError::NotAllowed(_))
        ));
        assert!(matches!(check_uri("no scheme"), Err(PortalError::InvalidArgument(_))));
    }
}
