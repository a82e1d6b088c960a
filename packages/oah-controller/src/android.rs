//! Android device properties and emulator identification

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::adb::{AdbError, Device};

/// The `ro.*` properties used to describe a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProps {
    pub model: String,
    pub brand: String,
    pub manufacturer: String,
    pub name: String,
    pub device: String,
    pub android_version: String,
}

impl DeviceProps {
    pub fn read(device: &Device) -> Result<Self, AdbError> {
        Ok(Self {
            model: device.getprop("ro.product.model")?,
            brand: device.getprop("ro.product.brand")?,
            manufacturer: device.getprop("ro.product.manufacturer")?,
            name: device.getprop("ro.product.name")?,
            device: device.getprop("ro.product.device")?,
            android_version: device.getprop("ro.build.version.release")?,
        })
    }

    /// Something like `Xiaomi 12s`
    pub fn label(&self) -> String {
        format!("{} {}", self.brand, self.model).trim().to_string()
    }

    /// Something like `Xiaomi 12s (mayfly) - Android 12`
    pub fn describe(&self) -> String {
        format!(
            "{} {} ({}) - Android {}",
            self.brand, self.model, self.name, self.android_version
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmulatorKind {
    MuMu12,
    MuMu,
    LDPlayer,
    Huawei,
    Samsung,
    Xiaomi,
    Unknown,
}

impl EmulatorKind {
    pub fn identify(props: &DeviceProps) -> Self {
        let in_model_or_brand = |s: &str| props.model.contains(s) || props.brand.contains(s);
        let anywhere = |s: &str| in_model_or_brand(s) || props.manufacturer.contains(s);

        if anywhere("MuMu") {
            if in_model_or_brand("MuMu12") {
                Self::MuMu12
            } else {
                Self::MuMu
            }
        } else if anywhere("LDPlayer") {
            Self::LDPlayer
        } else if in_model_or_brand("HUAWEI") {
            Self::Huawei
        } else if in_model_or_brand("Samsung") {
            Self::Samsung
        } else if in_model_or_brand("Xiaomi") {
            Self::Xiaomi
        } else {
            Self::Unknown
        }
    }
}

impl Display for EmulatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MuMu12 => "MuMu12",
            Self::MuMu => "MuMu",
            Self::LDPlayer => "LDPlayer",
            Self::Huawei => "HUAWEI",
            Self::Samsung => "Samsung",
            Self::Xiaomi => "Xiaomi",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}
