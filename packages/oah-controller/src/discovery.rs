//! Finding emulator instances that adb can talk to

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    process::Command,
    thread::sleep,
    time::Duration,
};

use log::{info, warn};
use serde_json::Value;

use crate::{
    adb::{Adb, AdbError},
    android::EmulatorKind,
};

/// Ports emulators usually expose adb on
pub const COMMON_PORTS: [u16; 10] = [
    5555, 5556, 5557, 5558, 7555, 62001, 62025, 62026, 16384, 16416,
];

/// MuMu's adb port
pub const DEFAULT_PORT: u16 = 7555;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// `kill-server` + `start-server` before looking
    pub restart_server: bool,
    /// Ports tried with `adb connect 127.0.0.1:<port>`
    pub ports: Vec<u16>,
    /// Path to `MuMuManager`, asked for its running instances if set
    pub mumu_manager: Option<PathBuf>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            restart_server: true,
            ports: COMMON_PORTS.to_vec(),
            mumu_manager: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub serial: String,
    /// `"{brand} {model}"`
    pub label: String,
    pub kind: EmulatorKind,
}

/// Collect every usable device: already attached ones, the ones MuMuManager
/// reports and the ones answering on the common ports.
///
/// Devices failing [`crate::Device::verify`] are skipped.
pub fn discover(adb: &Adb, options: &DiscoveryOptions) -> Result<Vec<DiscoveredDevice>, AdbError> {
    if options.restart_server {
        adb.restart_server()?;
    }

    let mut candidates = BTreeSet::new();

    if let Some(manager) = &options.mumu_manager {
        match mumu_instances(manager) {
            Ok(addrs) => {
                info!("MuMuManager reported {} running instance(s)", addrs.len());
                for addr in addrs {
                    match adb.connect(&addr) {
                        Ok(()) => {
                            candidates.insert(addr);
                        }
                        Err(err) => warn!("{err}"),
                    }
                }
            }
            Err(err) => warn!("failed to query MuMuManager: {err}"),
        }
    }

    for port in &options.ports {
        let addr = format!("127.0.0.1:{port}");
        if adb.connect(&addr).is_ok() {
            candidates.insert(addr);
        }
    }
    sleep(Duration::from_millis(500));

    for device in adb.devices()? {
        candidates.insert(device.serial);
    }

    let mut res = vec![];
    for serial in candidates {
        let device = adb.device(&serial);
        if !device.verify() {
            warn!("device {serial} failed to verify, skipped");
            continue;
        }
        let props = match device.props() {
            Ok(props) => props,
            Err(err) => {
                warn!("failed to read props of {serial}: {err}");
                continue;
            }
        };
        info!("found {serial}: {}", props.describe());
        res.push(DiscoveredDevice {
            label: props.label(),
            kind: EmulatorKind::identify(&props),
            serial,
        });
    }
    Ok(res)
}

fn mumu_instances(manager: &Path) -> Result<Vec<String>, AdbError> {
    let output = Command::new(manager)
        .args(["info", "-v", "all"])
        .output()
        .map_err(|source| AdbError::Spawn {
            path: manager.to_path_buf(),
            source,
        })?;
    parse_mumu_info(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the json printed by `MuMuManager info -v all` into adb addresses of
/// the started instances.
///
/// With several instances the output is an object keyed by instance index,
/// with a single one it is the instance object itself.
pub fn parse_mumu_info(json: &str) -> Result<Vec<String>, AdbError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|err| AdbError::Parse(format!("MuMuManager output: {err}")))?;
    let Some(map) = value.as_object() else {
        return Err(AdbError::Parse("MuMuManager output: not an object".to_string()));
    };

    let addrs = if map.contains_key("is_process_started") {
        mumu_addr(&value).into_iter().collect()
    } else {
        map.values().filter_map(mumu_addr).collect()
    };
    Ok(addrs)
}

fn mumu_addr(instance: &Value) -> Option<String> {
    let started = instance.get("is_process_started")?.as_bool()?;
    if !started {
        return None;
    }
    let ip = instance.get("adb_host_ip")?.as_str()?;
    let port = match instance.get("adb_port")? {
        Value::Number(n) => n.as_u64()?.to_string(),
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => return None,
    };
    if ip.is_empty() {
        return None;
    }
    Some(format!("{ip}:{port}"))
}
