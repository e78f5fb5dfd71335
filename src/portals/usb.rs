// SPDX-License-Identifier: GPL-3.0-only

//! Enumeration of USB devices, limited to what the caller's sandbox
//! declares.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::debug;
use zbus::message::Header;

use crate::{
    app_info::{usb::UsbIds, AppInfo},
    error::PortalError,
    options::{to_value, VarDict},
    state::Broker,
    utils::unblock,
};

pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// One device as found in sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    pub id: String,
    pub parent: Option<String>,
    pub ids: UsbIds,
    pub device_file: Option<PathBuf>,
    pub vendor_name: Option<String>,
    pub product_name: Option<String>,
}

fn attribute(dir: &Path, name: &str) -> Option<String> {
    fs::read_to_string(dir.join(name))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn hex_attribute<T>(dir: &Path, name: &str, parse: fn(&str, u32) -> Result<T, std::num::ParseIntError>) -> Option<T> {
    parse(&attribute(dir, name)?, 16).ok()
}

fn read_device(dir: &Path, id: &str) -> Option<UsbDevice> {
    let ids = UsbIds {
        vendor: hex_attribute(dir, "idVendor", u16::from_str_radix)?,
        product: hex_attribute(dir, "idProduct", u16::from_str_radix)?,
        class: hex_attribute(dir, "bDeviceClass", u8::from_str_radix).unwrap_or(0),
        subclass: hex_attribute(dir, "bDeviceSubClass", u8::from_str_radix).unwrap_or(0),
    };
    let device_file = match (attribute(dir, "busnum"), attribute(dir, "devnum")) {
        (Some(bus), Some(dev)) => match (bus.parse::<u32>(), dev.parse::<u32>()) {
            (Ok(bus), Ok(dev)) => Some(PathBuf::from(format!("/dev/bus/usb/{bus:03}/{dev:03}"))),
            _ => None,
        },
        _ => None,
    };
    // Ports are named after their hub, e.g. `1-2.3` sits on `1-2`.
    let parent = id
        .rsplit_once('.')
        .map(|(hub, _)| hub.to_string())
        .or_else(|| id.split_once('-').map(|(bus, _)| format!("usb{bus}")));
    Some(UsbDevice {
        id: id.to_string(),
        parent,
        ids,
        device_file,
        vendor_name: attribute(dir, "manufacturer"),
        product_name: attribute(dir, "product"),
    })
}

/// Devices below `root`. Interfaces (`1-2:1.0`) are skipped.
pub fn enumerate(root: &Path) -> Vec<UsbDevice> {
    let Ok(entries) = fs::read_dir(root) else {
        debug!(root = %root.display(), "No USB devices directory");
        return Vec::new();
    };
    let mut devices = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if name.contains(':') {
                return None;
            }
            read_device(&entry.path(), &name)
        })
        .collect::<Vec<_>>();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    devices
}

/// Devices `app_info` may see.
pub fn visible_to<'a>(app_info: &AppInfo, devices: &'a [UsbDevice]) -> Vec<&'a UsbDevice> {
    if app_info.is_unconfined() {
        return devices.iter().collect();
    }
    let Some(queries) = app_info.usb_queries() else {
        return Vec::new();
    };
    devices.iter().filter(|device| queries.allows(&device.ids)).collect()
}

fn describe(device: &UsbDevice) -> Result<VarDict, PortalError> {
    let mut properties = VarDict::from([
        (
            "ID_VENDOR_ID".to_string(),
            to_value(format!("{:04x}", device.ids.vendor))?,
        ),
        (
            "ID_MODEL_ID".to_string(),
            to_value(format!("{:04x}", device.ids.product))?,
        ),
    ]);
    if let Some(vendor) = &device.vendor_name {
        properties.insert("ID_VENDOR_FROM_DATABASE".to_string(), to_value(vendor.as_str())?);
    }
    if let Some(product) = &device.product_name {
        properties.insert("ID_MODEL_FROM_DATABASE".to_string(), to_value(product.as_str())?);
    }

    let mut description = VarDict::from([("properties".to_string(), to_value(properties)?)]);
    if let Some(parent) = &device.parent {
        description.insert("parent".to_string(), to_value(parent.as_str())?);
    }
    if let Some(device_file) = &device.device_file {
        let path = device_file.to_string_lossy();
        let readable = rustix::fs::access(device_file, rustix::fs::Access::READ_OK).is_ok();
        let writable = rustix::fs::access(device_file, rustix::fs::Access::WRITE_OK).is_ok();
        description.insert("device-file".to_string(), to_value(path.as_ref())?);
        description.insert("readable".to_string(), to_value(readable)?);
        description.insert("writable".to_string(), to_value(writable)?);
    }
    Ok(description)
}

pub struct Usb {
    broker: Arc<Broker>,
}

impl Usb {
    pub fn new(broker: Arc<Broker>) -> Usb {
        Usb { broker }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Usb")]
impl Usb {
    async fn enumerate_devices(
        &self,
        #[zbus(header)] header: Header<'_>,
        _options: VarDict,
    ) -> Result<Vec<(String, VarDict)>, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let devices = unblock(&self.broker.executor, || enumerate(Path::new(SYSFS_USB_DEVICES))).await?;
        let visible = visible_to(&call.app_info, &devices);
        debug!(
            app_id = call.app_info.id(),
            total = devices.len(),
            visible = visible.len(),
            "Enumerated USB devices"
        );
        visible
            .into_iter()
            .map(|device| Ok((device.id.clone(), describe(device)?)))
            .collect()
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fake_device(root: &Path, name: &str, attributes: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (key, value) in attributes {
            fs::write(dir.join(key), format!("{value}\n")).unwrap();
        }
    }

    #[test]
    fn test_enumerate_sysfs() {
        let root = tempfile::tempdir().unwrap();
        fake_device(
            root.path(),
            "1-2",
            &[
                ("idVendor", "046d"),
                ("idProduct", "c31c"),
                ("bDeviceClass", "00"),
                ("busnum", "1"),
                ("devnum", "4"),
                ("product", "USB Keyboard"),
            ],
        );
        fake_device(root.path(), "1-2:1.0", &[("bInterfaceClass", "03")]);
        fake_device(root.path(), "1-3.1", &[("idVendor", "0fd9"), ("idProduct", "0063")]);

        let devices = enumerate(root.path());
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "1-2");
        assert_eq!(devices[0].ids.vendor, 0x046d);
        assert_eq!(devices[0].parent.as_deref(), Some("usb1"));
        assert_eq!(devices[0].device_file, Some(PathBuf::from("/dev/bus/usb/001/004")));
        assert_eq!(devices[0].product_name.as_deref(), Some("USB Keyboard"));
        assert_eq!(devices[1].parent.as_deref(), Some("1-3"));
        assert_eq!(devices[1].device_file, None);
    }

    #[test]
    fn test_visibility() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "1-2", &[("idVendor", "046d"), ("idProduct", "c31c")]);
        let devices = enumerate(root.path());

        let host = AppInfo::host("org.example.Tool".into(), None, None);
        assert_eq!(visible_to(&host, &devices).len(), 1);
        // No USB declaration in the sandbox metadata.
        let sandboxed = AppInfo::sandboxed_for_test("org.example.App");
        assert!(visible_to(&sandboxed, &devices).is_empty());
    }

    #[test]
    fn test_missing_root() {
        assert!(enumerate(Path::new("/nonexistent/usb")).is_empty());
    }
}
