//! oah-controller contains the basic device manuplating functions like
//! adb connecting, device discovery, tapping and screen capturing.

use std::ops::RangeInclusive;

use image::DynamicImage;
use rand::Rng;

pub mod adb;
pub mod adb_controller;
pub mod android;
pub mod discovery;

pub use adb::{Adb, AdbError, Device, DeviceInfo};
pub use adb_controller::AdbController;
pub use android::{DeviceProps, EmulatorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// The resolution the templates are authored at
pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 720;

/// [`Controller`] 承担着设备操作相关的事情，如触控、截图
/// 所有 [`Controller`]：
/// - [`AdbController`] 基于 adb 命令进行触控与截图
pub trait Controller {
    fn screen_size(&self) -> (u32, u32);

    /// A scale factor from 1280x720 to the device's resolution
    /// $1280x720 * scale_factor = device_res$
    fn scale_factor(&self) -> f32 {
        self.screen_size().1 as f32 / DEFAULT_HEIGHT as f32
    }

    fn click(&self, x: u32, y: u32) -> anyhow::Result<()>;

    fn click_in_rect(&self, rect: Rect) -> anyhow::Result<(u32, u32)> {
        let x = rand::random::<u32>() % rect.width.max(1) + rect.x;
        let y = rand::random::<u32>() % rect.height.max(1) + rect.y;
        self.click(x, y)?;
        Ok((x, y))
    }

    /// A scaled version of [`Controller::click`].
    ///
    /// Coord is in 1280x720 space.
    fn click_scaled(&self, x_scaled: u32, y_scaled: u32) -> anyhow::Result<()> {
        let scale_factor = self.scale_factor();
        let (x, y) = (
            (x_scaled as f32 * scale_factor) as u32,
            (y_scaled as f32 * scale_factor) as u32,
        );
        self.click(x, y)
    }

    /// Click at a random point whose distance to `center` lies in `radius`.
    ///
    /// The point is clamped into the screen. Returns the actual clicked coord.
    fn click_around(
        &self,
        center: (u32, u32),
        radius: RangeInclusive<u32>,
    ) -> anyhow::Result<(u32, u32)> {
        let (dx, dy) = random_offset(radius, &mut rand::rng());
        let (width, height) = self.screen_size();
        let x = (center.0 as i64 + dx as i64).clamp(0, width.saturating_sub(1) as i64) as u32;
        let y = (center.1 as i64 + dy as i64).clamp(0, height.saturating_sub(1) as i64) as u32;
        self.click(x, y)?;
        Ok((x, y))
    }

    /// A scaled version of [`Controller::click_around`].
    ///
    /// `center_scaled` and `radius_scaled` are in 1280x720 space, the returned
    /// coord is in device space.
    fn click_around_scaled(
        &self,
        center_scaled: (u32, u32),
        radius_scaled: RangeInclusive<u32>,
    ) -> anyhow::Result<(u32, u32)> {
        let scale_factor = self.scale_factor();
        let scale = |v: u32| (v as f32 * scale_factor) as u32;
        let center = (scale(center_scaled.0), scale(center_scaled.1));
        let radius = scale(*radius_scaled.start())..=scale(*radius_scaled.end());
        self.click_around(center, radius)
    }

    /// Get the decoded screencap image
    fn screencap(&self) -> anyhow::Result<DynamicImage>;

    /// A scaled version of [`Controller::screencap`].
    ///
    /// This scales the screenshot image to [`DEFAULT_HEIGHT`]
    fn screencap_scaled(&self) -> anyhow::Result<DynamicImage> {
        let screen = self.screencap()?;
        let screen = if screen.height() != DEFAULT_HEIGHT && screen.height() > 0 {
            let scale_factor = DEFAULT_HEIGHT as f32 / screen.height() as f32;

            let new_width = (screen.width() as f32 * scale_factor) as u32;
            let new_height = (screen.height() as f32 * scale_factor) as u32;

            DynamicImage::from(image::imageops::resize(
                &screen,
                new_width,
                new_height,
                image::imageops::FilterType::Triangle,
            ))
        } else {
            screen
        };
        Ok(screen)
    }
}

/// A random polar offset: distance in `radius`, uniform angle.
pub fn random_offset(radius: RangeInclusive<u32>, rng: &mut impl Rng) -> (i32, i32) {
    let (lo, hi) = (
        *radius.start().min(radius.end()),
        *radius.start().max(radius.end()),
    );
    let distance = rng.random_range(lo..=hi) as f32;
    let angle = rng.random_range(0.0..std::f32::consts::TAU);
    (
        (distance * angle.cos()) as i32,
        (distance * angle.sin()) as i32,
    )
}
