use std::{
    collections::BTreeMap,
    io::Cursor,
    path::{Path, PathBuf},
    process::Command,
    thread::sleep,
    time::Duration,
};

use image::{codecs::png::PngDecoder, DynamicImage};
use log::{info, trace};
use thiserror::Error;

use crate::android::DeviceProps;

#[derive(Error, Debug)]
pub enum AdbError {
    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("adb command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to connect to {addr}: {output}")]
    ConnectFailed { addr: String, output: String },
    #[error("failed to decode screencap: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("failed to parse {0}")]
    Parse(String),
}

/// One line of `adb devices -l`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub info: BTreeMap<String, String>,
}

impl TryFrom<&str> for DeviceInfo {
    type Error = AdbError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // Turn "serial\tdevice key1:value1 key2:value2 ..." into a `DeviceInfo`.
        let mut pairs = value.split_whitespace();
        let serial = pairs.next();
        let state = pairs.next();
        if let (Some(serial), Some("device")) = (serial, state) {
            let info: BTreeMap<String, String> = pairs
                .filter_map(|pair| {
                    let mut kv = pair.split(':');
                    if let (Some(k), Some(v), None) = (kv.next(), kv.next(), kv.next()) {
                        Some((k.to_owned(), v.to_owned()))
                    } else {
                        None
                    }
                })
                .collect();

            Ok(DeviceInfo {
                serial: serial.to_owned(),
                info,
            })
        } else {
            Err(AdbError::Parse(format!("device info from {value:?}")))
        }
    }
}

/// Parse the output of `adb devices [-l]`, keeping only devices in `device` state
pub fn parse_devices(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .filter_map(|line| DeviceInfo::try_from(line).ok())
        .collect()
}

/// Whether the output of `adb connect` reports success
pub fn is_connected_output(output: &str) -> bool {
    output.contains("connected to")
}

/// The adb executable, usually `platform-tools/adb`
#[derive(Debug, Clone)]
pub struct Adb {
    path: PathBuf,
}

impl Default for Adb {
    fn default() -> Self {
        Self::new("adb")
    }
}

impl Adb {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `adb <args>` and return its stdout
    pub fn execute(&self, args: &[&str]) -> Result<Vec<u8>, AdbError> {
        trace!("executing {:?} {}", self.path, args.join(" "));
        let output = Command::new(&self.path)
            .args(args)
            .output()
            .map_err(|source| AdbError::Spawn {
                path: self.path.clone(),
                source,
            })?;

        if !output.status.success() {
            let mut reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if reason.is_empty() {
                reason = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(AdbError::CommandFailed {
                command: args.join(" "),
                output: reason,
            });
        }
        Ok(output.stdout)
    }

    pub fn execute_to_string(&self, args: &[&str]) -> Result<String, AdbError> {
        let bytes = self.execute(args)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub fn devices(&self) -> Result<Vec<DeviceInfo>, AdbError> {
        let output = self.execute_to_string(&["devices", "-l"])?;
        Ok(parse_devices(&output))
    }

    /// `adb connect <addr>`, `addr` is something like `127.0.0.1:7555`
    pub fn connect(&self, addr: &str) -> Result<(), AdbError> {
        let output = self.execute_to_string(&["connect", addr])?;
        if is_connected_output(&output) {
            info!("connected to {addr}");
            Ok(())
        } else {
            Err(AdbError::ConnectFailed {
                addr: addr.to_string(),
                output: output.trim().to_string(),
            })
        }
    }

    pub fn disconnect_all(&self) -> Result<(), AdbError> {
        self.execute(&["disconnect"])?;
        Ok(())
    }

    pub fn restart_server(&self) -> Result<(), AdbError> {
        info!("restarting adb server...");
        self.execute(&["kill-server"])?;
        sleep(Duration::from_secs(1));
        self.execute(&["start-server"])?;
        sleep(Duration::from_secs(2));
        Ok(())
    }

    pub fn device(&self, serial: impl AsRef<str>) -> Device {
        Device::new(self.clone(), serial.as_ref().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    adb: Adb,

    /// Adb device serial number
    serial: String,
}

impl Device {
    pub fn new(adb: Adb, serial: String) -> Self {
        Self { adb, serial }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn execute_command_by_process(&self, command: &str) -> Result<Vec<u8>, AdbError> {
        let mut args = vec!["-s", self.serial.as_str()];
        args.extend(command.split_whitespace());
        self.adb.execute(&args)
    }

    /// `adb -s <serial> shell <command>`, output trimmed.
    ///
    /// Output mentioning `error` or `failed` is treated as a failure.
    pub fn shell(&self, command: &str) -> Result<String, AdbError> {
        let output = self.execute_command_by_process(&format!("shell {command}"))?;
        let output = String::from_utf8_lossy(&output).trim().to_string();
        let lower = output.to_lowercase();
        if lower.contains("error") || lower.contains("failed") {
            return Err(AdbError::CommandFailed {
                command: command.to_string(),
                output,
            });
        }
        Ok(output)
    }

    pub fn getprop(&self, key: &str) -> Result<String, AdbError> {
        self.shell(&format!("getprop {key}"))
    }

    pub fn props(&self) -> Result<DeviceProps, AdbError> {
        DeviceProps::read(self)
    }

    /// Online and able to execute a trivial shell command
    pub fn verify(&self) -> bool {
        let model = self.getprop("ro.product.model").unwrap_or_default();
        if model.is_empty() {
            return false;
        }
        matches!(self.shell("echo test").as_deref(), Ok("test"))
    }

    pub fn tap(&self, x: u32, y: u32) -> Result<(), AdbError> {
        self.shell(&format!("input tap {x} {y}"))?;
        Ok(())
    }

    pub fn screencap(&self) -> Result<DynamicImage, AdbError> {
        let bytes = self.execute_command_by_process("exec-out screencap -p")?;
        if bytes.is_empty() {
            return Err(AdbError::CommandFailed {
                command: "exec-out screencap -p".to_string(),
                output: "empty output".to_string(),
            });
        }

        let decoder = PngDecoder::new(Cursor::new(bytes))?;
        let image = DynamicImage::from_decoder(decoder)?;
        Ok(image)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let output = "List of devices attached\n\
            127.0.0.1:7555\tdevice product:cancro model:MuMu device:x86_64 transport_id:1\n\
            emulator-5554\toffline\n\
            R58M123\tunauthorized usb:1-1 transport_id:3\n\
            127.0.0.1:16384\tdevice\n\n";
        let devices = parse_devices(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "127.0.0.1:7555");
        assert_eq!(devices[0].info.get("model").map(String::as_str), Some("MuMu"));
        assert_eq!(devices[0].info.get("transport_id").map(String::as_str), Some("1"));
        assert_eq!(devices[1].serial, "127.0.0.1:16384");
        assert!(devices[1].info.is_empty());
    }

    #[test]
    fn test_connected_output() {
        assert!(is_connected_output("connected to 127.0.0.1:7555\n"));
        assert!(is_connected_output("already connected to 127.0.0.1:7555\n"));
        assert!(!is_connected_output(
            "failed to connect to '127.0.0.1:5556': Connection refused\n"
        ));
        assert!(!is_connected_output("cannot connect to 127.0.0.1:5557: No route to host"));
    }

    #[test]
    fn test_missing_adb_binary() {
        let dir = tempfile::tempdir().unwrap();
        let adb = Adb::new(dir.path().join("no-such-adb"));
        let err = adb.devices().unwrap_err();
        assert!(matches!(err, AdbError::Spawn { .. }), "{err:?}");
    }
}
