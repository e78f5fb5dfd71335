// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use zbus::{message::Header, zvariant::ObjectPath};

use super::{begin_request, handle_token, impl_proxy, RequestReply};
use crate::{
    app_info::AppInfo,
    documents::Export,
    error::PortalError,
    handles::Handle,
    options::{filter_options, get_bool, get_strv, to_value, OptionSpec, VarDict},
    request::Response,
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.FileChooser";

const FILTERS: &str = "a(sa(us))";
const FILTER: &str = "(sa(us))";
const CHOICES: &str = "a(ssa(ss)s)";

const OPEN_FILE_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("accept_label", "s"),
    OptionSpec::new("modal", "b"),
    OptionSpec::new("multiple", "b"),
    OptionSpec::new("directory", "b"),
    OptionSpec::new("filters", FILTERS),
    OptionSpec::new("current_filter", FILTER),
    OptionSpec::new("choices", CHOICES),
    OptionSpec::new("current_folder", "ay"),
];

const SAVE_FILE_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("accept_label", "s"),
    OptionSpec::new("modal", "b"),
    OptionSpec::new("filters", FILTERS),
    OptionSpec::new("current_filter", FILTER),
    OptionSpec::new("choices", CHOICES),
    OptionSpec::new("current_name", "s"),
    OptionSpec::new("current_folder", "ay"),
    OptionSpec::new("current_file", "ay"),
];

const SAVE_FILES_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("accept_label", "s"),
    OptionSpec::new("modal", "b"),
    OptionSpec::new("choices", CHOICES),
    OptionSpec::new("current_folder", "ay"),
    OptionSpec::new("files", "aay"),
];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.FileChooser",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplFileChooser {
    fn open_file(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        title: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn save_file(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        title: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn save_files(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        title: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialog {
    Open,
    Save,
    SaveMany,
}

impl Dialog {
    fn options(self) -> &'static [OptionSpec] {
        match self {
            Dialog::Open => OPEN_FILE_OPTIONS,
            Dialog::Save => SAVE_FILE_OPTIONS,
            Dialog::SaveMany => SAVE_FILES_OPTIONS,
        }
    }

    /// How picked files are handed to a confined caller.
    fn export(self, options: &VarDict, results: &VarDict) -> Export {
        match self {
            Dialog::Open => Export {
                writable: get_bool(results, "writable").unwrap_or(false),
                directory: get_bool(options, "directory").unwrap_or(false),
            },
            Dialog::Save | Dialog::SaveMany => Export {
                writable: true,
                directory: false,
            },
        }
    }
}

/// Replaces the picked `uris` by ones the caller can open.
pub async fn export_picked(broker: &Broker, app_info: &AppInfo, results: &mut VarDict, export: Export) -> Result<(), PortalError> {
    let Some(uris) = get_strv(results, "uris") else {
        return Ok(());
    };
    let uris = broker.documents.export_uris(app_info, uris, export).await;
    results.insert("uris".to_string(), to_value(uris)?);
    Ok(())
}

pub struct FileChooser {
    broker: Arc<Broker>,
    backend: String,
}

impl FileChooser {
    pub fn new(broker: Arc<Broker>, backend: String) -> FileChooser {
        FileChooser { broker, backend }
    }

    async fn show(
        &self,
        dialog: Dialog,
        header: Header<'_>,
        parent_window: String,
        title: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, dialog.options())?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let proxy: ImplFileChooserProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let app_id = request.app_info().id();
            let reply = match dialog {
                Dialog::Open => {
                    proxy
                        .open_file(request.path(), app_id, &parent_window, &title, &options)
                        .await?
                }
                Dialog::Save => {
                    proxy
                        .save_file(request.path(), app_id, &parent_window, &title, &options)
                        .await?
                }
                Dialog::SaveMany => {
                    proxy
                        .save_files(request.path(), app_id, &parent_window, &title, &options)
                        .await?
                }
            };
            let mut response = Response::from(reply);
            if response.is_success() {
                let export = dialog.export(&options, &response.results);
                export_picked(&broker, request.app_info(), &mut response.results, export).await?;
            }
            Ok(response)
        })
        .await
    }
}

#[zbus::interface(name = "org.freedesktop.portal.FileChooser")]
impl FileChooser {
    async fn open_file(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        title: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        self.show(Dialog::Open, header, parent_window, title, options).await
    }

    async fn save_file(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        title: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        self.show(Dialog::Save, header, parent_window, title, options).await
    }

    async fn save_files(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        title: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        self.show(Dialog::SaveMany, header, parent_window, title, options).await
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        4
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_export_mode() {
        let directory = VarDict::from([("directory".to_string(), to_value(true).unwrap())]);
        let writable = VarDict::from([("writable".to_string(), to_value(true).unwrap())]);

        assert_eq!(
            Dialog::Open.export(&directory, &VarDict::new()),
            Export {
                writable: false,
                directory: true
            }
        );
        assert!(Dialog::Open.export(&VarDict::new(), &writable).writable);
        assert!(Dialog::Save.export(&VarDict::new(), &VarDict::new()).writable);
    }

    #[test]
    fn test_unknown_options_dropped() {
        let options = VarDict::from([
            ("multiple".to_string(), to_value(true).unwrap()),
            ("current_name".to_string(), to_value("x.txt").unwrap()),
        ]);
        let filtered = filter_options(&options, Dialog::Open.options()).unwrap();
        assert!(filtered.contains_key("multiple"));
        assert!(!filtered.contains_key("current_name"));
        assert!(filter_options(&options, Dialog::Save.options())
            .unwrap()
            .contains_key("current_name"));
    }
}
