//! `known_devices.json`: devices seen by earlier discoveries.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const KNOWN_DEVICES_FILE: &str = "known_devices.json";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub serial: String,
    pub label: String,
    pub last_seen: String,
}

#[derive(Debug)]
pub struct DeviceStore {
    path: PathBuf,
    devices: Vec<KnownDevice>,
}

impl DeviceStore {
    /// Load `known_devices.json` from `config_dir`.
    ///
    /// A missing or broken file gives an empty store.
    pub fn load(config_dir: impl AsRef<Path>) -> Self {
        let path = config_dir.as_ref().join(KNOWN_DEVICES_FILE);
        let devices = if path.exists() {
            match read_devices(&path) {
                Ok(devices) => devices,
                Err(err) => {
                    warn!("ignoring {path:?}: {err:#}");
                    vec![]
                }
            }
        } else {
            vec![]
        };
        Self { path, devices }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn devices(&self) -> &[KnownDevice] {
        &self.devices
    }

    pub fn get(&self, serial: &str) -> Option<&KnownDevice> {
        self.devices.iter().find(|d| d.serial == serial)
    }

    /// Insert or refresh a device, stamping it with the current time
    pub fn touch(&mut self, serial: impl AsRef<str>, label: impl AsRef<str>) {
        let serial = serial.as_ref();
        let device = KnownDevice {
            serial: serial.to_string(),
            label: label.as_ref().to_string(),
            last_seen: Local::now().format(TIME_FORMAT).to_string(),
        };
        match self.devices.iter_mut().find(|d| d.serial == serial) {
            Some(known) => *known = device,
            None => self.devices.push(device),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {parent:?}"))?;
        }
        let content = serde_json::to_string_pretty(&self.devices)?;
        fs::write(&self.path, content)
            .with_context(|| format!("failed to write {:?}", self.path))?;
        Ok(())
    }
}

fn read_devices(path: &Path) -> anyhow::Result<Vec<KnownDevice>> {
    let content = fs::read_to_string(path)?;
    let devices = serde_json::from_str(&content)?;
    Ok(devices)
}

#[cfg(test)]
mod test {
    use chrono::NaiveDateTime;

    use super::*;

    #[test]
    fn test_touch_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");

        let mut store = DeviceStore::load(&config_dir);
        assert!(store.devices().is_empty());
        store.touch("127.0.0.1:7555", "MuMu");
        store.touch("emulator-5554", "Pixel");
        store.touch("127.0.0.1:7555", "MuMu 12");
        store.save().unwrap();

        let store = DeviceStore::load(&config_dir);
        assert_eq!(store.devices().len(), 2);
        let device = store.get("127.0.0.1:7555").unwrap();
        assert_eq!(device.label, "MuMu 12");
        assert!(NaiveDateTime::parse_from_str(&device.last_seen, TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_broken_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KNOWN_DEVICES_FILE), "{ not json").unwrap();
        let store = DeviceStore::load(dir.path());
        assert!(store.devices().is_empty());
    }
}
