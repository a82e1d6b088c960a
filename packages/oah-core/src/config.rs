//! `oah.toml`, every field has a default so an empty file is a valid config.

use std::{
    collections::BTreeMap,
    fmt::Display,
    fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context};
use oah_cv::MatchTemplateMethod;
use serde::{Deserialize, Deserializer, Serialize};
use serde_with::skip_serializing_none;
use tracing::info;

/// Indicator templates, matched but never tapped
pub const LOSE: &str = "lose";
pub const NOTUPO: &str = "notupo";

/// Which routine a device runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    /// 御魂
    #[default]
    Yuhun,
    /// 百鬼夜行
    Baigui,
}

impl Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Module::Yuhun => write!(f, "yuhun"),
            Module::Baigui => write!(f, "baigui"),
        }
    }
}

impl FromStr for Module {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yuhun" => Ok(Module::Yuhun),
            "baigui" => Ok(Module::Baigui),
            _ => bail!("unknown module {s:?}, expected `yuhun` or `baigui`"),
        }
    }
}

/// What a device does after `lose` or `notupo` shows up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// The device loop ends
    #[default]
    Stop,
    /// The device pauses until resumed from the panel
    Pause,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    #[default]
    Normal,
    /// Moving or animated elements, matched with a lower threshold
    Special,
}

/// Per template overrides, keyed by file stem in [`Settings::templates`]
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub threshold: Option<f64>,
    pub kind: Option<TemplateKind>,
    /// Lower goes first, ties are broken by name
    pub priority: Option<i32>,
    /// Tap distance from the match centre, in pixels
    pub click_radius: Option<[u32; 2]>,
    /// Seconds to wait after tapping
    pub delay_after: Option<[f64; 2]>,
    /// Seconds to wait before tapping
    pub wait_before: Option<[f64; 2]>,
    /// Region of interest represented by top-left and bottom-right pos in [0.0, 1.0]
    pub roi: Option<[(f64, f64); 2]>,
    /// Only tap this after `requires` was the last tapped template
    pub requires: Option<String>,
}

impl TemplateConfig {
    pub fn special() -> Self {
        Self {
            kind: Some(TemplateKind::Special),
            ..Default::default()
        }
    }

    /// Fields set in `other` win over the ones in `self`
    pub fn merge(self, other: TemplateConfig) -> Self {
        Self {
            threshold: other.threshold.or(self.threshold),
            kind: other.kind.or(self.kind),
            priority: other.priority.or(self.priority),
            click_radius: other.click_radius.or(self.click_radius),
            delay_after: other.delay_after.or(self.delay_after),
            wait_before: other.wait_before.or(self.wait_before),
            roi: other.roi.or(self.roi),
            requires: other.requires.or(self.requires),
        }
    }
}

/// Entries every settings file starts from, a `[templates.X]` table only
/// overrides the fields it sets
pub fn default_templates() -> BTreeMap<String, TemplateConfig> {
    let mut templates = BTreeMap::new();
    templates.insert(
        "button5".to_string(),
        TemplateConfig {
            requires: Some("button4".to_string()),
            ..Default::default()
        },
    );
    templates.insert("button6".to_string(), TemplateConfig::special());
    templates.insert(
        "button7".to_string(),
        TemplateConfig {
            wait_before: Some([8.0, 10.0]),
            ..TemplateConfig::special()
        },
    );
    templates.insert(
        NOTUPO.to_string(),
        TemplateConfig {
            threshold: Some(0.5),
            ..Default::default()
        },
    );
    templates
}

fn merge_templates<'de, D>(deserializer: D) -> Result<BTreeMap<String, TemplateConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let user = BTreeMap::<String, TemplateConfig>::deserialize(deserializer)?;
    let mut templates = default_templates();
    for (name, config) in user {
        let merged = match templates.remove(&name) {
            Some(default) => default.merge(config),
            None => config,
        };
        templates.insert(name, merged);
    }
    Ok(templates)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    pub threshold: f64,
    /// Used by [`TemplateKind::Special`] templates
    pub moving_threshold: f64,
    pub method: MatchTemplateMethod,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            moving_threshold: 0.5,
            method: MatchTemplateMethod::CorrelationCoefficientNormed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickSettings {
    pub radius: [u32; 2],
    pub delay_after: [f64; 2],
}

impl Default for ClickSettings {
    fn default() -> Self {
        Self {
            radius: [10, 40],
            delay_after: [1.0, 3.0],
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub restart_server: bool,
    pub common_ports: Vec<u16>,
    /// `MuMuManager` executable, queried for running instances when set
    pub mumu_manager: Option<PathBuf>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            restart_server: true,
            common_ports: oah_controller::discovery::COMMON_PORTS.to_vec(),
            mumu_manager: None,
        }
    }
}

/// Scheduled breaks while running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestSettings {
    pub enabled: bool,
    /// Minutes of running between two breaks
    pub interval_min: [u64; 2],
    /// Minutes a break lasts
    pub duration_min: [u64; 2],
}

impl Default for RestSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_min: [120, 180],
            duration_min: [10, 30],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub adb_path: PathBuf,
    pub templates_dir: PathBuf,
    /// Where `known_devices.json` lives
    pub config_dir: PathBuf,
    pub run_duration_min: u64,
    /// Upper bound of one routine call
    pub max_slice_secs: f64,
    /// A slice running longer than this is warned about
    pub slow_slice_warn_secs: f64,
    pub module: Module,
    pub on_stop_condition: StopPolicy,

    pub matching: MatchingSettings,
    pub click: ClickSettings,
    pub discovery: DiscoverySettings,
    pub rest: RestSettings,
    #[serde(deserialize_with = "merge_templates")]
    pub templates: BTreeMap<String, TemplateConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            templates_dir: PathBuf::from("templates"),
            config_dir: PathBuf::from("config"),
            run_duration_min: 10,
            max_slice_secs: 5.0,
            slow_slice_warn_secs: 30.0,
            module: Module::default(),
            on_stop_condition: StopPolicy::default(),
            matching: MatchingSettings::default(),
            click: ClickSettings::default(),
            discovery: DiscoverySettings::default(),
            rest: RestSettings::default(),
            templates: default_templates(),
        }
    }
}

impl Settings {
    /// Load from `path`, a missing file gives the defaults
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("{path:?} not found, using default settings");
            return Ok(Self::default());
        }

        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))?;
        let settings: Settings =
            toml::from_str(&content).with_context(|| format!("failed to parse {path:?}"))?;
        settings
            .validate()
            .with_context(|| format!("invalid settings in {path:?}"))?;
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("failed to serialize settings")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content).with_context(|| format!("failed to write {path:?}"))?;
        Ok(())
    }

    /// Write the default settings, refusing to overwrite unless `force`
    pub fn write_default(path: impl AsRef<Path>, force: bool) -> anyhow::Result<()> {
        let path = path.as_ref();
        if path.exists() && !force {
            bail!("{path:?} already exists");
        }
        Self::default().save(path)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_slice_secs <= 0.0 {
            bail!("max_slice_secs must be positive");
        }
        check_unit("matching.threshold", self.matching.threshold)?;
        check_unit("matching.moving_threshold", self.matching.moving_threshold)?;
        check_range("click.radius", self.click.radius)?;
        check_range("click.delay_after", self.click.delay_after)?;
        if self.rest.enabled {
            check_range("rest.interval_min", self.rest.interval_min)?;
            check_range("rest.duration_min", self.rest.duration_min)?;
        }
        for (name, config) in &self.templates {
            if let Some(threshold) = config.threshold {
                check_unit(&format!("templates.{name}.threshold"), threshold)?;
            }
            if let Some(radius) = config.click_radius {
                check_range(&format!("templates.{name}.click_radius"), radius)?;
            }
            if let Some(delay) = config.delay_after {
                check_range(&format!("templates.{name}.delay_after"), delay)?;
            }
            if let Some(wait) = config.wait_before {
                check_range(&format!("templates.{name}.wait_before"), wait)?;
            }
            if let Some([tl, br]) = config.roi {
                let inside = |v: f64| (0.0..=1.0).contains(&v);
                if ![tl.0, tl.1, br.0, br.1].into_iter().all(inside) || tl.0 >= br.0 || tl.1 >= br.1
                {
                    bail!("templates.{name}.roi must be [tl, br] inside [0, 1]");
                }
            }
        }
        Ok(())
    }

    pub fn template(&self, name: &str) -> TemplateConfig {
        self.templates.get(name).cloned().unwrap_or_default()
    }

    pub fn threshold_for(&self, name: &str) -> f32 {
        let config = self.template(name);
        let threshold = config.threshold.unwrap_or(match config.kind.unwrap_or_default() {
            TemplateKind::Normal => self.matching.threshold,
            TemplateKind::Special => self.matching.moving_threshold,
        });
        threshold as f32
    }

    pub fn click_radius_for(&self, name: &str) -> RangeInclusive<u32> {
        let [lo, hi] = self.template(name).click_radius.unwrap_or(self.click.radius);
        lo..=hi
    }

    pub fn delay_after_for(&self, name: &str) -> [f64; 2] {
        self.template(name)
            .delay_after
            .unwrap_or(self.click.delay_after)
    }
}

fn check_unit(key: &str, v: f64) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&v) {
        bail!("{key} must be in [0, 1], got {v}");
    }
    Ok(())
}

fn check_range<T: PartialOrd + std::fmt::Debug>(key: &str, [lo, hi]: [T; 2]) -> anyhow::Result<()> {
    if lo > hi {
        bail!("{key} must be [min, max], got [{lo:?}, {hi:?}]");
    }
    Ok(())
}
