//! Matching the templates of the library against a captured screen.
//!
//! Everything here works in the 1280x720 space the templates are authored in,
//! see [`oah_controller::Controller::screencap_scaled`].

use std::time::Instant;

use image::{imageops::crop_imm, DynamicImage, ImageBuffer, Luma};
use oah_controller::Rect;
use oah_cv::{find_extremes, find_matches, match_template, MatchTemplateMethod};
use tracing::trace;

use crate::resource::Template;

pub mod utils;

pub use utils::annotate;

/// Used when [`MatchOptions::threshold`] is not set
pub const THRESHOLD: f32 = 0.8;

/// The generic options for matching
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOptions {
    /// The matching method
    pub(crate) method: Option<MatchTemplateMethod>,
    /// The matching threshold
    pub(crate) threshold: Option<f32>,
    /// Region of interest represented by top-left and bottom-right pos in [0.0, 1.0]
    pub(crate) roi: [(f32, f32); 2],
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            method: None,
            threshold: None,
            roi: [(0.0, 0.0), (1.0, 1.0)],
        }
    }
}

impl MatchOptions {
    pub fn with_method(mut self, method: MatchTemplateMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_roi(mut self, tl: (f32, f32), br: (f32, f32)) -> Self {
        self.roi = [tl, br];
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold.unwrap_or(THRESHOLD)
    }

    /// The roi in pixels of a `width x height` image
    pub fn calc_roi(&self, width: u32, height: u32) -> [(u32, u32); 2] {
        let px = |(x, y): (f32, f32)| {
            (
                ((x.clamp(0.0, 1.0) * width as f32) as u32).min(width),
                ((y.clamp(0.0, 1.0) * height as f32) as u32).min(height),
            )
        };
        let (tl, br) = (px(self.roi[0]), px(self.roi[1]));
        [tl, (br.0.max(tl.0), br.1.max(tl.1))]
    }
}

/// A template found on the screen
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub name: String,
    pub rect: Rect,
    pub center: (u32, u32),
    pub score: f32,
}

impl Match {
    fn new(name: &str, (x, y): (u32, u32), (width, height): (u32, u32), score: f32) -> Self {
        let rect = Rect {
            x,
            y,
            width,
            height,
        };
        Self {
            name: name.to_string(),
            center: rect.center(),
            rect,
            score,
        }
    }
}

/// A captured screen, scaled to 720p, with its grayscale version cached
pub struct Screen {
    pub image: DynamicImage,
    pub luma: ImageBuffer<Luma<f32>, Vec<f32>>,
}

impl Screen {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            luma: image.to_luma32f(),
            image,
        }
    }

    fn region(&self, options: &MatchOptions) -> ((u32, u32), ImageBuffer<Luma<f32>, Vec<f32>>) {
        let [tl, br] = options.calc_roi(self.luma.width(), self.luma.height());
        let region = crop_imm(&self.luma, tl.0, tl.1, br.0 - tl.0, br.1 - tl.1).to_image();
        (tl, region)
    }
}

impl From<DynamicImage> for Screen {
    fn from(image: DynamicImage) -> Self {
        Self::new(image)
    }
}

/// The best location of `template`, if it scores at least its threshold
pub fn find_template(screen: &Screen, template: &Template) -> anyhow::Result<Option<Match>> {
    let options = &template.options;
    let (offset, region) = screen.region(options);
    if region.width() < template.width() || region.height() < template.height() {
        return Ok(None);
    }

    let start = Instant::now();
    let method = options.method.unwrap_or_default();
    let res = match_template(&region, &template.luma, method)?;
    let extremes = find_extremes(&res);
    trace!(
        "{}: {:?} max {} at {:?}, cost {}ms",
        template.name,
        method,
        extremes.max_value,
        extremes.max_value_location,
        start.elapsed().as_millis()
    );

    if extremes.max_value < options.threshold() {
        return Ok(None);
    }
    let (x, y) = extremes.max_value_location;
    Ok(Some(Match::new(
        &template.name,
        (x + offset.0, y + offset.1),
        (template.width(), template.height()),
        extremes.max_value,
    )))
}

/// Every non-overlapping location of `template` scoring at least its threshold
pub fn find_all(screen: &Screen, template: &Template) -> anyhow::Result<Vec<Match>> {
    let options = &template.options;
    let (offset, region) = screen.region(options);
    if region.width() < template.width() || region.height() < template.height() {
        return Ok(vec![]);
    }

    let res = match_template(&region, &template.luma, options.method.unwrap_or_default())?;
    let matches = find_matches(&res, template.width(), template.height(), options.threshold())
        .into_iter()
        .map(|m| {
            Match::new(
                &template.name,
                (m.location.0 + offset.0, m.location.1 + offset.1),
                (template.width(), template.height()),
                m.value,
            )
        })
        .collect();
    Ok(matches)
}

/// The matched ones among `templates`, in the given order
pub fn detect_all(screen: &Screen, templates: &[Template]) -> anyhow::Result<Vec<Match>> {
    let mut res = vec![];
    for template in templates {
        if let Some(m) = find_template(screen, template)? {
            res.push(m);
        }
    }
    Ok(res)
}
