use color_print::cprintln;
use log::warn;

use crate::{
    adb::{Adb, AdbError, Device},
    Controller, DEFAULT_HEIGHT, DEFAULT_WIDTH,
};

/// An implementation of [`crate::Controller`]
///
/// Taps through `adb shell input tap`, captures through `adb exec-out screencap`.
pub struct AdbController {
    pub inner: Device,
    width: u32,
    height: u32,
}

impl AdbController {
    /// `serial` can be a network address (`127.0.0.1:7555`), which is
    /// `adb connect`ed first, or any serial listed by `adb devices`.
    pub fn connect(adb: &Adb, serial: impl AsRef<str>) -> Result<Self, AdbError> {
        let serial = serial.as_ref();

        cprintln!("<blue>[AdbController]</blue>: connecting to {serial}...");
        if serial.contains(':') {
            adb.connect(serial)?;
        }
        if !adb.devices()?.iter().any(|d| d.serial == serial) {
            return Err(AdbError::DeviceNotFound(serial.to_string()));
        }
        let device = adb.device(serial);
        cprintln!("<blue>[AdbController]</blue>: connected");

        let screen = device.screencap()?;
        let (width, height) = (screen.width(), screen.height());
        cprintln!("<blue>[AdbController]</blue>: device screen: {width}x{height}");
        if (width, height) != (DEFAULT_WIDTH, DEFAULT_HEIGHT) {
            warn!(
                "{serial} runs at {width}x{height}, templates are made for {DEFAULT_WIDTH}x{DEFAULT_HEIGHT}, matching may be less reliable"
            );
        }

        Ok(Self {
            inner: device,
            width,
            height,
        })
    }

    pub fn serial(&self) -> &str {
        self.inner.serial()
    }
}

impl Controller for AdbController {
    fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn click(&self, x: u32, y: u32) -> anyhow::Result<()> {
        if x >= self.width || y >= self.height {
            anyhow::bail!("coord ({x}, {y}) out of screen");
        }
        log::debug!("[{}] tap ({x}, {y})", self.inner.serial());
        self.inner.tap(x, y)?;
        Ok(())
    }

    fn screencap(&self) -> anyhow::Result<image::DynamicImage> {
        Ok(self.inner.screencap()?)
    }
}
