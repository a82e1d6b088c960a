//! The template library, loaded once from the templates directory and shared
//! read-only by every device.

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use image::{DynamicImage, ImageBuffer, Luma};
use oah_controller::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use tracing::{info, warn};

use crate::{
    config::{default_templates, Settings, TemplateConfig, TemplateKind, LOSE, NOTUPO},
    vision::MatchOptions,
};

/// A loaded template with its settings resolved against the global defaults
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub image: DynamicImage,
    pub luma: ImageBuffer<Luma<f32>, Vec<f32>>,
    pub kind: TemplateKind,
    pub priority: i32,
    pub options: MatchOptions,
    pub click_radius: RangeInclusive<u32>,
    pub delay_after: [f64; 2],
    pub wait_before: Option<[f64; 2]>,
    pub requires: Option<String>,
}

impl Template {
    pub fn new(name: impl AsRef<str>, image: DynamicImage, settings: &Settings) -> Self {
        let name = name.as_ref().to_string();
        let config = settings.template(&name);

        let mut options = MatchOptions::default()
            .with_method(settings.matching.method)
            .with_threshold(settings.threshold_for(&name));
        if let Some([tl, br]) = config.roi {
            options = options.with_roi((tl.0 as f32, tl.1 as f32), (br.0 as f32, br.1 as f32));
        }

        Self {
            luma: image.to_luma32f(),
            image,
            kind: config.kind.unwrap_or_default(),
            priority: config.priority.unwrap_or(0),
            options,
            click_radius: settings.click_radius_for(&name),
            delay_after: settings.delay_after_for(&name),
            wait_before: config.wait_before,
            requires: config.requires,
            name,
        }
    }

    pub fn load(path: impl AsRef<Path>, settings: &Settings) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("bad template file name {path:?}"))?;
        let image = image::open(path).with_context(|| format!("failed to open {path:?}"))?;
        let template = Self::new(name, image, settings);
        template.check_fits()?;
        Ok(template)
    }

    pub fn width(&self) -> u32 {
        self.luma.width()
    }

    pub fn height(&self) -> u32 {
        self.luma.height()
    }

    /// The template and its roi have to fit in a 1280x720 screen
    fn check_fits(&self) -> anyhow::Result<()> {
        let [tl, br] = self.options.calc_roi(DEFAULT_WIDTH, DEFAULT_HEIGHT);
        let (w, h) = (br.0 - tl.0, br.1 - tl.1);
        if self.width() > w || self.height() > h {
            bail!(
                "template {} ({}x{}) does not fit in its {}x{} search area",
                self.name,
                self.width(),
                self.height(),
                w,
                h
            );
        }
        Ok(())
    }
}

/// Whether `path` looks like `button*.png`
fn is_button_file(path: &Path) -> bool {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or_default();
    stem.starts_with("button") && ext.eq_ignore_ascii_case("png")
}

fn button_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = vec![];
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {dir:?}"))? {
        let path = entry?.path();
        if path.is_file() && is_button_file(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

#[derive(Debug)]
pub struct TemplateLibrary {
    pub root: PathBuf,
    /// Ordered by `(priority, name)`
    buttons: Vec<Template>,
    indicators: HashMap<String, Template>,
}

impl TemplateLibrary {
    /// Load every `button*.png` plus the optional `lose.png` and `notupo.png`
    pub fn load(root: impl AsRef<Path>, settings: &Settings) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            bail!("templates directory not exists: {root:?}");
        }

        let buttons = button_files(&root)?
            .into_iter()
            .map(|path| Template::load(path, settings))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if buttons.is_empty() {
            bail!("no button*.png in {root:?}");
        }

        let mut indicators = HashMap::new();
        for name in [LOSE, NOTUPO] {
            let path = root.join(format!("{name}.png"));
            if path.exists() {
                indicators.insert(name.to_string(), Template::load(path, settings)?);
            } else {
                warn!("{name}.png not found in {root:?}, this stop condition is disabled");
            }
        }

        let library = Self::from_templates(root, buttons, indicators.into_values().collect());
        info!(
            "loaded {} button templates: {:?}",
            library.buttons.len(),
            library.button_names()
        );
        Ok(library)
    }

    /// Build from already loaded templates, `lose` and `notupo` are treated
    /// as indicators and everything else as buttons
    pub fn from_templates(
        root: impl AsRef<Path>,
        mut buttons: Vec<Template>,
        others: Vec<Template>,
    ) -> Self {
        let mut indicators = HashMap::new();
        for template in others {
            if template.name == LOSE || template.name == NOTUPO {
                indicators.insert(template.name.clone(), template);
            } else {
                buttons.push(template);
            }
        }
        // plain string order, so `button10` comes before `button2`
        buttons.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
        Self {
            root: root.as_ref().to_path_buf(),
            buttons,
            indicators,
        }
    }

    pub fn buttons(&self) -> &[Template] {
        &self.buttons
    }

    pub fn button_names(&self) -> Vec<&str> {
        self.buttons.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn indicator(&self, name: &str) -> Option<&Template> {
        self.indicators.get(name)
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.buttons
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.indicator(name))
    }
}

/// Differences between the templates directory and `[templates]` in the settings
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconcile {
    /// `button*.png` without a settings entry
    pub added: Vec<String>,
    /// Settings entries without a png, built-in entries are never listed
    pub removed: Vec<String>,
}

impl Reconcile {
    pub fn scan(root: impl AsRef<Path>, settings: &Settings) -> anyhow::Result<Self> {
        let root = root.as_ref();
        let on_disk: BTreeSet<String> = button_files(root)?
            .iter()
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();

        let added = on_disk
            .iter()
            .filter(|name| !settings.templates.contains_key(*name))
            .cloned()
            .collect();
        let builtin = default_templates();
        let removed = settings
            .templates
            .keys()
            .filter(|name| {
                !builtin.contains_key(*name)
                    && !on_disk.contains(*name)
                    && !root.join(format!("{name}.png")).exists()
            })
            .cloned()
            .collect();
        Ok(Self { added, removed })
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Add default entries for new templates and drop entries of missing ones
    pub fn apply(&self, settings: &mut Settings) {
        for name in &self.added {
            settings.templates.insert(
                name.clone(),
                TemplateConfig {
                    kind: Some(TemplateKind::Normal),
                    ..Default::default()
                },
            );
        }
        for name in &self.removed {
            settings.templates.remove(name);
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use image::{GrayImage, Luma};

    use super::*;

    pub fn solid(width: u32, height: u32, v: u8) -> DynamicImage {
        GrayImage::from_pixel(width, height, Luma([v])).into()
    }

    fn write_png(dir: &Path, name: &str) {
        solid(20, 10, 128).save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_load_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["button1.png", "button2.png", "button10.png", "lose.png", "other.png"] {
            write_png(dir.path(), name);
        }
        let mut settings = Settings::default();
        settings.templates.insert(
            "button2".to_string(),
            TemplateConfig {
                priority: Some(-1),
                ..Default::default()
            },
        );

        let library = TemplateLibrary::load(dir.path(), &settings).unwrap();
        assert_eq!(library.button_names(), vec!["button2", "button1", "button10"]);
        assert!(library.indicator(LOSE).is_some());
        assert!(library.indicator(NOTUPO).is_none());
        assert!(library.get("other").is_none());
        assert_eq!(library.get("lose").unwrap().options.threshold, Some(0.8));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        assert!(TemplateLibrary::load(dir.path().join("missing"), &settings).is_err());

        write_png(dir.path(), "lose.png");
        assert!(TemplateLibrary::load(dir.path(), &settings).is_err());
    }

    #[test]
    fn test_resolved_template() {
        let settings = Settings::default();
        let template = Template::new("button7", solid(4, 4, 0), &settings);
        assert_eq!(template.kind, TemplateKind::Special);
        assert_eq!(template.options.threshold, Some(0.5));
        assert_eq!(template.wait_before, Some([8.0, 10.0]));
        assert_eq!(template.click_radius, 10..=40);

        let template = Template::new("button5", solid(4, 4, 0), &settings);
        assert_eq!(template.requires.as_deref(), Some("button4"));
        assert_eq!(template.delay_after, [1.0, 3.0]);
    }

    #[test]
    fn test_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["button1.png", "button7.png", "notupo.png"] {
            write_png(dir.path(), name);
        }
        let mut settings = Settings::default();
        settings
            .templates
            .insert("button9".to_string(), TemplateConfig::default());
        let reconcile = Reconcile::scan(dir.path(), &settings).unwrap();
        assert_eq!(reconcile.added, vec!["button1"]);
        assert_eq!(reconcile.removed, vec!["button9"]);

        reconcile.apply(&mut settings);
        assert!(settings.templates.contains_key("button1"));
        assert!(!settings.templates.contains_key("button9"));
        assert!(settings.templates.contains_key("button5"));
        assert!(Reconcile::scan(dir.path(), &settings).unwrap().is_empty());
    }
}
