// SPDX-License-Identifier: GPL-3.0-only

//! Desktop launchers installed by applications for things they open, such
//! as web applications or games found by a launcher.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info};
use zbus::{
    message::Header,
    zvariant::{ObjectPath, OwnedValue, Value},
};

use super::{begin_request, handle_token, impl_proxy, RequestReply};
use crate::{
    app_info::{keyfile::KeyFile, AppInfo},
    error::PortalError,
    handles::Handle,
    launcher::{self, DESKTOP_GROUP},
    options::{filter_options, get_str, to_value, OptionSpec, VarDict},
    request::Response,
    state::{Broker, Call},
    utils::{dirs::HostDirs, unblock},
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.DynamicLauncher";

const TOKEN_LIFETIME: Duration = Duration::from_secs(5 * 60);

const MAX_ICON_SIZE: usize = 1024 * 1024;

const LAUNCHER_APPLICATION: u32 = 1;
const LAUNCHER_WEBAPP: u32 = 2;

fn validate_launcher_type(key: &str, value: &Value<'_>, options: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::U32(LAUNCHER_APPLICATION) => Ok(()),
        Value::U32(LAUNCHER_WEBAPP) if get_str(options, "target").is_some() => Ok(()),
        Value::U32(LAUNCHER_WEBAPP) => Err(PortalError::invalid("Web applications need a target")),
        _ => Err(PortalError::invalid(format!("Option {key} is not a known launcher type"))),
    }
}

const PREPARE_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("modal", "b"),
    OptionSpec::validated("launcher_type", "u", validate_launcher_type),
    OptionSpec::new("target", "s"),
    OptionSpec::new("editable_name", "b"),
    OptionSpec::new("editable_icon", "b"),
];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.DynamicLauncher",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplDynamicLauncher {
    #[allow(clippy::too_many_arguments)]
    fn prepare_install(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        name: &str,
        icon: &Value<'_>,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn request_install_token(&self, app_id: &str, options: &VarDict) -> zbus::Result<u32>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IconFormat {
    Png,
    Jpeg,
    Svg,
}

impl IconFormat {
    fn sniff(data: &[u8]) -> Option<IconFormat> {
        if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            return Some(IconFormat::Png);
        }
        if data.starts_with(&[0xff, 0xd8, 0xff]) {
            return Some(IconFormat::Jpeg);
        }
        let head = String::from_utf8_lossy(&data[..data.len().min(256)]);
        let head = head.trim_start();
        (head.starts_with("<svg") || head.starts_with("<?xml")).then_some(IconFormat::Svg)
    }

    fn extension(self) -> &'static str {
        match self {
            IconFormat::Png => "png",
            IconFormat::Jpeg => "jpg",
            IconFormat::Svg => "svg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Icon {
    format: IconFormat,
    data: Vec<u8>,
}

fn unwrap_variant<'a>(value: &'a Value<'a>) -> &'a Value<'a> {
    match value {
        Value::Value(inner) => unwrap_variant(inner),
        value => value,
    }
}

/// Reads a serialized `("bytes", <ay>)` icon.
fn parse_icon(value: &Value<'_>) -> Result<Icon, PortalError> {
    let invalid = || PortalError::invalid("Icon must be serialized image bytes");
    let Value::Structure(icon) = unwrap_variant(value) else {
        return Err(invalid());
    };
    let data = match icon.fields() {
        [Value::Str(kind), data] if kind.as_str() == "bytes" => match unwrap_variant(data) {
            Value::Array(bytes) => bytes
                .iter()
                .map(|byte| match byte {
                    Value::U8(byte) => Some(*byte),
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(invalid)?,
            _ => return Err(invalid()),
        },
        _ => return Err(invalid()),
    };
    if data.len() > MAX_ICON_SIZE {
        return Err(PortalError::invalid("Icon is too large"));
    }
    let format = IconFormat::sniff(&data).ok_or_else(|| PortalError::invalid("Icon is not a PNG, JPEG or SVG image"))?;
    Ok(Icon { format, data })
}

fn validate_name(name: &str) -> Result<(), PortalError> {
    if name.trim().is_empty() || name.contains('\n') {
        return Err(PortalError::invalid("Launcher name must be a non-empty single line"));
    }
    Ok(())
}

/// Checks that `desktop_file_id` names a launcher the caller may own and
/// returns it without its `.desktop` suffix.
fn launcher_stem<'a>(app_info: &AppInfo, desktop_file_id: &'a str) -> Result<&'a str, PortalError> {
    let stem = desktop_file_id
        .strip_suffix(".desktop")
        .ok_or_else(|| PortalError::invalid(format!("{desktop_file_id:?} does not end in .desktop")))?;
    if !app_info.is_valid_sub_app_id(stem) {
        return Err(PortalError::invalid(format!(
            "{desktop_file_id:?} is not prefixed with the application id {:?}",
            app_info.id()
        )));
    }
    Ok(stem)
}

/// Launcher details approved by the user, waiting for `Install`.
#[derive(Debug, Clone)]
struct PendingInstall {
    app_id: String,
    name: String,
    icon: Icon,
    created: Instant,
}

/// One-shot install tokens, each bound to the application it was issued to.
#[derive(Debug, Default)]
struct InstallTokens {
    pending: Mutex<HashMap<String, PendingInstall>>,
}

impl InstallTokens {
    fn issue(&self, app_id: &str, name: String, icon: Icon, now: Instant) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut pending = self.pending.lock();
        pending.retain(|_, install| now.duration_since(install.created) < TOKEN_LIFETIME);
        pending.insert(
            token.clone(),
            PendingInstall {
                app_id: app_id.to_string(),
                name,
                icon,
                created: now,
            },
        );
        token
    }

    /// Consumes `token`. A token issued to another application is left in
    /// place.
    fn redeem(&self, token: &str, app_id: &str, now: Instant) -> Result<PendingInstall, PortalError> {
        let mut pending = self.pending.lock();
        match pending.get(token) {
            Some(install) if install.app_id != app_id => {
                return Err(PortalError::not_allowed("Token was issued to another application"))
            }
            Some(_) => {}
            None => return Err(PortalError::not_allowed("Unknown or already used token")),
        }
        let install = pending
            .remove(token)
            .ok_or_else(|| PortalError::not_allowed("Unknown or already used token"))?;
        if now.duration_since(install.created) >= TOKEN_LIFETIME {
            return Err(PortalError::not_allowed("Token expired"));
        }
        Ok(install)
    }
}

/// Files written for one launcher.
struct Installation {
    entry_path: PathBuf,
    entry: String,
    icon_path: PathBuf,
    icon: Vec<u8>,
}

fn prepare_installation(
    dirs: &HostDirs,
    app_info: &AppInfo,
    desktop_file_id: &str,
    stem: &str,
    desktop_entry: &str,
    install: PendingInstall,
) -> Result<Installation, PortalError> {
    let mut entry =
        KeyFile::parse(desktop_entry).map_err(|err| PortalError::invalid(format!("Invalid desktop entry: {err}")))?;
    if entry.start_group() != Some(DESKTOP_GROUP) {
        return Err(PortalError::invalid("Desktop entry must start with [Desktop Entry]"));
    }
    let icon_path = dirs
        .icons_dir()
        .join(format!("{stem}.{}", install.icon.format.extension()));
    entry.set_string(DESKTOP_GROUP, "Name", &install.name);
    launcher::rewrite_desktop_entry(&mut entry, app_info, Some(&icon_path))
        .map_err(|err| PortalError::invalid(err.to_string()))?;
    Ok(Installation {
        entry_path: dirs.applications_dir().join(desktop_file_id),
        entry: entry.to_string(),
        icon_path,
        icon: install.icon.data,
    })
}

fn write_installation(installation: &Installation) -> io::Result<()> {
    launcher::write_entry(&installation.icon_path, &installation.icon)?;
    launcher::write_entry(&installation.entry_path, &installation.entry)
}

/// Removes the entry and the icon it points at, if that icon is ours.
fn remove_installation(icons_dir: &Path, entry_path: &Path) -> io::Result<()> {
    let icon = fs::read_to_string(entry_path)
        .ok()
        .and_then(|text| KeyFile::parse(&text).ok())
        .and_then(|entry| entry.string(DESKTOP_GROUP, "Icon"))
        .map(PathBuf::from)
        .filter(|icon| icon.starts_with(icons_dir));
    if let Some(icon) = icon {
        if let Err(err) = fs::remove_file(&icon) {
            debug!(path = %icon.display(), ?err, "Launcher icon not removed");
        }
    }
    match fs::remove_file(entry_path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

fn io_error(err: io::Error) -> PortalError {
    match err.kind() {
        io::ErrorKind::NotFound => PortalError::NotFound(err.to_string()),
        _ => PortalError::failed(err.to_string()),
    }
}

pub struct DynamicLauncher {
    broker: Arc<Broker>,
    backend: String,
    tokens: Arc<InstallTokens>,
}

impl DynamicLauncher {
    pub fn new(broker: Arc<Broker>, backend: String) -> DynamicLauncher {
        DynamicLauncher {
            broker,
            backend,
            tokens: Arc::default(),
        }
    }

    async fn authorize(&self, header: &Header<'_>) -> Result<Call, PortalError> {
        let call = self.broker.authorize(header).await?;
        if call.app_info.id().is_empty() {
            return Err(PortalError::not_allowed("Launchers need an application id"));
        }
        Ok(call)
    }
}

#[zbus::interface(name = "org.freedesktop.portal.DynamicLauncher")]
impl DynamicLauncher {
    async fn prepare_install(
        &self,
        #[zbus(header)] header: Header<'_>,
        parent_window: String,
        name: String,
        icon: OwnedValue,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, PREPARE_OPTIONS)?;
        validate_name(&name)?;
        parse_icon(&icon)?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let tokens = self.tokens.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let proxy: ImplDynamicLauncherProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let app_id = request.app_info().id();
            let reply = proxy
                .prepare_install(request.path(), app_id, &parent_window, &name, &icon, &options)
                .await?;
            let response = Response::from(reply);
            if !response.is_success() {
                return Ok(response);
            }
            let name = get_str(&response.results, "name").map_or(name.clone(), str::to_string);
            validate_name(&name)?;
            let icon = match response.results.get("icon") {
                Some(edited) => parse_icon(edited)?,
                None => parse_icon(&icon)?,
            };
            let install_token = tokens.issue(app_id, name.clone(), icon, Instant::now());
            let results = VarDict::from([
                ("name".to_string(), to_value(name.as_str())?),
                ("token".to_string(), to_value(install_token.as_str())?),
            ]);
            Ok(Response::success(results))
        })
        .await
    }

    /// Token for installing without a dialog, if the implementation allows
    /// that for the caller.
    async fn request_install_token(
        &self,
        #[zbus(header)] header: Header<'_>,
        name: String,
        icon: OwnedValue,
        options: VarDict,
    ) -> Result<String, PortalError> {
        let call = self.authorize(&header).await?;
        validate_name(&name)?;
        let icon = parse_icon(&icon)?;
        let proxy: ImplDynamicLauncherProxy<'static> = impl_proxy(&self.broker.connection, &self.backend).await?;
        let options = filter_options(&options, &[])?;
        let code = proxy.request_install_token(call.app_info.id(), &options).await?;
        if code != 0 {
            return Err(PortalError::not_allowed("Installing launchers without a dialog is not allowed"));
        }
        Ok(self.tokens.issue(call.app_info.id(), name, icon, Instant::now()))
    }

    async fn install(
        &self,
        #[zbus(header)] header: Header<'_>,
        token: String,
        desktop_file_id: String,
        desktop_entry: String,
        _options: VarDict,
    ) -> Result<(), PortalError> {
        let call = self.authorize(&header).await?;
        let stem = launcher_stem(&call.app_info, &desktop_file_id)?;
        let install = self.tokens.redeem(&token, call.app_info.id(), Instant::now())?;
        let installation = prepare_installation(
            &self.broker.dirs,
            &call.app_info,
            &desktop_file_id,
            stem,
            &desktop_entry,
            install,
        )?;
        let path = installation.entry_path.clone();
        unblock(&self.broker.executor, move || write_installation(&installation))
            .await?
            .map_err(io_error)?;
        info!(app_id = call.app_info.id(), path = %path.display(), "Installed launcher");
        Ok(())
    }

    async fn uninstall(
        &self,
        #[zbus(header)] header: Header<'_>,
        desktop_file_id: String,
        _options: VarDict,
    ) -> Result<(), PortalError> {
        let call = self.authorize(&header).await?;
        launcher_stem(&call.app_info, &desktop_file_id)?;
        let entry_path = self.broker.dirs.applications_dir().join(&desktop_file_id);
        let icons_dir = self.broker.dirs.icons_dir();
        unblock(&self.broker.executor, move || remove_installation(&icons_dir, &entry_path))
            .await?
            .map_err(io_error)?;
        info!(app_id = call.app_info.id(), desktop_file_id, "Uninstalled launcher");
        Ok(())
    }

    async fn get_desktop_entry(
        &self,
        #[zbus(header)] header: Header<'_>,
        desktop_file_id: String,
    ) -> Result<String, PortalError> {
        let call = self.authorize(&header).await?;
        launcher_stem(&call.app_info, &desktop_file_id)?;
        let path = self.broker.dirs.applications_dir().join(&desktop_file_id);
        unblock(&self.broker.executor, move || fs::read_to_string(path))
            .await?
            .map_err(io_error)
    }

    #[zbus(property)]
    fn supported_launcher_types(&self) -> u32 {
        LAUNCHER_APPLICATION | LAUNCHER_WEBAPP
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zbus::zvariant::Structure;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nrest";

    fn icon_value(data: &[u8]) -> Value<'static> {
        Value::from(Structure::from(("bytes", Value::from(data.to_vec()))))
    }

    fn icon() -> Icon {
        Icon {
            format: IconFormat::Png,
            data: PNG.to_vec(),
        }
    }

    #[test]
    fn test_parse_icon() {
        assert_eq!(parse_icon(&icon_value(PNG)).unwrap(), icon());
        let svg = parse_icon(&icon_value(b"  <svg xmlns=\"http://www.w3.org/2000/svg\"/>")).unwrap();
        assert_eq!(svg.format, IconFormat::Svg);
        assert!(parse_icon(&icon_value(b"GIF89a")).is_err());
        assert!(parse_icon(&Value::from("themed-icon")).is_err());
    }

    #[test]
    fn test_launcher_stem() {
        let app = AppInfo::sandboxed_for_test("org.example.App");
        assert_eq!(launcher_stem(&app, "org.example.App.Site.desktop").unwrap(), "org.example.App.Site");
        assert!(launcher_stem(&app, "org.example.App.Site").is_err());
        assert!(launcher_stem(&app, "org.other.App.Site.desktop").is_err());
        assert!(launcher_stem(&app, "org.example.App.desktop").is_err());
    }

    #[test]
    fn test_tokens_are_one_shot() {
        let tokens = InstallTokens::default();
        let now = Instant::now();
        let token = tokens.issue("org.example.App", "Site".into(), icon(), now);
        assert!(matches!(
            tokens.redeem(&token, "org.other.App", now),
            Err(PortalError::NotAllowed(_))
        ));
        let install = tokens.redeem(&token, "org.example.App", now).unwrap();
        assert_eq!(install.name, "Site");
        assert!(tokens.redeem(&token, "org.example.App", now).is_err());
    }

    #[test]
    fn test_tokens_expire() {
        let tokens = InstallTokens::default();
        let now = Instant::now();
        let token = tokens.issue("org.example.App", "Site".into(), icon(), now);
        assert!(tokens.redeem(&token, "org.example.App", now + TOKEN_LIFETIME).is_err());
    }

    #[test]
    fn test_launcher_type_validator() {
        let specs = PREPARE_OPTIONS;
        let webapp = VarDict::from([("launcher_type".to_string(), to_value(LAUNCHER_WEBAPP).unwrap())]);
        assert!(filter_options(&webapp, specs).is_err());
        let mut with_target = webapp;
        with_target.insert("target".to_string(), to_value("https://example.org").unwrap());
        assert!(filter_options(&with_target, specs).is_ok());
        let unknown = VarDict::from([("launcher_type".to_string(), to_value(7u32).unwrap())]);
        assert!(filter_options(&unknown, specs).is_err());
    }

    #[test]
    fn test_install_and_uninstall() {
        let root = tempfile::tempdir().unwrap();
        let dirs = HostDirs::rooted(root.path());
        let app = AppInfo::sandboxed_for_test("org.example.App");
        let install = PendingInstall {
            app_id: "org.example.App".into(),
            name: "Example Site".into(),
            icon: icon(),
            created: Instant::now(),
        };
        let entry = "[Desktop Entry]\nType=Application\nName=Ignored\nExec=browser --site %u\n";
        let installation = prepare_installation(
            &dirs,
            &app,
            "org.example.App.Site.desktop",
            "org.example.App.Site",
            entry,
            install,
        )
        .unwrap();
        write_installation(&installation).unwrap();

        let written = KeyFile::parse(&fs::read_to_string(&installation.entry_path).unwrap()).unwrap();
        assert_eq!(written.string(DESKTOP_GROUP, "Name").as_deref(), Some("Example Site"));
        let icon_path = PathBuf::from(written.string(DESKTOP_GROUP, "Icon").unwrap());
        assert_eq!(fs::read(&icon_path).unwrap(), PNG);

        remove_installation(&dirs.icons_dir(), &installation.entry_path).unwrap();
        assert!(!installation.entry_path.exists());
        assert!(!icon_path.exists());
    }

    #[test]
    fn test_entry_must_be_desktop_entry() {
        let dirs = HostDirs::rooted(Path::new("/r"));
        let app = AppInfo::sandboxed_for_test("org.example.App");
        let install = PendingInstall {
            app_id: "org.example.App".into(),
            name: "Site".into(),
            icon: icon(),
            created: Instant::now(),
        };
        assert!(matches!(
            prepare_installation(&dirs, &app, "org.example.App.X.desktop", "org.example.App.X", "[Other]\nA=b\n", install),
            Err(PortalError::InvalidArgument(_))
        ));
    }
}
