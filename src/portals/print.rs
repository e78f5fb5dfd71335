// SPDX-License-Identifier: GPL-3.0-only

use std::{os::fd::AsFd, sync::Arc};

use zbus::{
    message::Header,
    zvariant::{Fd, ObjectPath, OwnedFd},
};

use super::{begin_request, handle_token, impl_proxy, RequestReply};
use crate::{
    error::PortalError,
    handles::Handle,
    options::{filter_options, OptionSpec, VarDict},
    request::Response,
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Print";

const PREPARE_OPTIONS: &[OptionSpec] = &[OptionSpec::new("modal", "b"), OptionSpec::new("accept_label", "s")];

const PRINT_OPTIONS: &[OptionSpec] = &[OptionSpec::new("modal", "b"), OptionSpec::new("token", "u")];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.Print",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplPrint {
    #[allow(clippy::too_many_arguments)]
    fn prepare_print(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        title: &str,
        settings: &VarDict,
        page_setup: &VarDict,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn print(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        title: &str,
        fd: Fd<'_>,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;
}

pub struct Print {
    broker: Arc<Broker>,
    backend: String,
}

impl Print {
    pub fn new(broker: Arc<Broker>, backend: String) -> Print {
        Print { broker, backend }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Print")]
impl Print {
    async fn prepare_print(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        title: String,
        settings: VarDict,
        page_setup: VarDict,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, PREPARE_OPTIONS)?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let proxy: ImplPrintProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .prepare_print(
                    request.path(),
                    request.app_info().id(),
                    &parent_window,
                    &title,
                    &settings,
                    &page_setup,
                    &options,
                )
                .await?;
            Ok(Response::from(reply))
        })
        .await
    }

    /// The document is handed to the implementation as is; it is only
    /// read, never resolved to a path.
    async fn print(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        title: String,
        fd: OwnedFd,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, PRINT_OPTIONS)?;
        let fd = std::os::fd::OwnedFd::from(fd);
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let proxy: ImplPrintProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .print(
                    request.path(),
                    request.app_info().id(),
                    &parent_window,
                    &title,
                    Fd::from(fd.as_fd()),
                    &options,
                )
                .await?;
            Ok(Response::from(reply))
        })
        .await
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        3
    }
}
