//! 此模块包含每个设备上运行的例程
//!
//! A routine is called repeatedly by the [`crate::worker::Worker`], each call
//! is a *slice* bounded by `max_slice_secs` so the worker gets to check its
//! deadline and flags regularly. [`RoutineSet`] dispatches to the actual
//! routines: [`yuhun::Yuhun`] (御魂) and [`baigui::Baigui`] (百鬼夜行).

use std::{
    fmt::Display,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, Local};
use oah_controller::Controller;
use rand::Rng;
use tracing::info;

use crate::{
    config::{Module, Settings},
    resource::{Template, TemplateLibrary},
    vision::{find_template, Match, Screen},
    worker::{RunReport, WorkerStatus},
};

pub mod baigui;
pub mod yuhun;

pub use baigui::Baigui;
pub use yuhun::Yuhun;

/// A shared boolean, used for the global stop and the per-device pause
#[derive(Debug, Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the new value
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    Lose,
    Notupo,
}

impl Display for StopCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopCondition::Lose => write!(f, "lose"),
            StopCondition::Notupo => write!(f, "notupo"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    Continue,
    StopCondition(StopCondition),
}

/// Events sent from the device threads
#[derive(Debug, Clone)]
pub enum DeviceEvt {
    Started {
        serial: String,
        deadline: DateTime<Local>,
    },
    Tapped {
        serial: String,
        name: String,
        pos: (u32, u32),
    },
    StopCondition {
        serial: String,
        condition: StopCondition,
    },
    Paused {
        serial: String,
    },
    Resumed {
        serial: String,
    },
    Resting {
        serial: String,
        until: DateTime<Local>,
    },
    Error {
        serial: String,
        message: String,
    },
    Finished(RunReport),
}

/// The fixed sleeps of the routines
#[derive(Debug, Clone)]
pub struct Pacing {
    /// Nothing was tapped
    pub idle: Duration,
    /// After an error
    pub error_backoff: Duration,
    /// While paused
    pub pause_poll: Duration,
    /// How long `notupo` is watched for after `button10`
    pub notupo_window: Duration,
    pub notupo_poll: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(200),
            error_backoff: Duration::from_secs(1),
            pause_poll: Duration::from_secs(1),
            notupo_window: Duration::from_secs(1),
            notupo_poll: Duration::from_millis(100),
        }
    }
}

/// The time budget of one routine call
pub struct Slice {
    started: Instant,
    budget: Duration,
}

impl Slice {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_over(&self) -> bool {
        self.elapsed() >= self.budget
    }
}

/// Everything a routine needs to act on one device
pub struct Runner<C: Controller> {
    pub serial: String,
    pub controller: C,
    pub library: Arc<TemplateLibrary>,
    pub settings: Arc<Settings>,
    /// Shared by every device
    pub stop: Flag,
    pub pause: Flag,
    pub pacing: Pacing,
    status: Arc<Mutex<WorkerStatus>>,
    evt_tx: Option<async_channel::Sender<DeviceEvt>>,
}

impl<C: Controller> Runner<C> {
    pub fn new(
        serial: impl AsRef<str>,
        controller: C,
        library: Arc<TemplateLibrary>,
        settings: Arc<Settings>,
        stop: Flag,
    ) -> Self {
        let serial = serial.as_ref().to_string();
        let status = WorkerStatus {
            serial: serial.clone(),
            ..Default::default()
        };
        Self {
            serial,
            controller,
            library,
            settings,
            stop,
            pause: Flag::new(),
            pacing: Pacing::default(),
            status: Arc::new(Mutex::new(status)),
            evt_tx: None,
        }
    }

    pub fn with_pause(mut self, pause: Flag) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_status(mut self, status: Arc<Mutex<WorkerStatus>>) -> Self {
        self.status = status;
        self
    }

    pub fn with_events(mut self, evt_tx: async_channel::Sender<DeviceEvt>) -> Self {
        self.evt_tx = Some(evt_tx);
        self
    }

    pub fn status(&self) -> MutexGuard<'_, WorkerStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status_handle(&self) -> Arc<Mutex<WorkerStatus>> {
        self.status.clone()
    }

    pub fn emit(&self, evt: DeviceEvt) {
        if let Some(tx) = &self.evt_tx {
            // nobody listening is fine
            let _ = tx.send_blocking(evt);
        }
    }

    pub fn max_slice(&self) -> Duration {
        Duration::from_secs_f64(self.settings.max_slice_secs)
    }

    /// Sleep in small steps so a stop is noticed quickly.
    ///
    /// Returns `false` if interrupted.
    pub fn sleep(&self, duration: Duration) -> bool {
        const STEP: Duration = Duration::from_millis(100);
        let until = Instant::now() + duration;
        loop {
            if self.stop.is_set() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            sleep((until - now).min(STEP));
        }
    }

    /// A random duration in `[lo, hi]` seconds
    pub fn random_duration(&self, [lo, hi]: [f64; 2]) -> Duration {
        let secs = if hi > lo {
            rand::rng().random_range(lo..=hi)
        } else {
            lo
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn capture(&self) -> anyhow::Result<Screen> {
        let screen = self
            .controller
            .screencap_scaled()
            .context("failed to capture screen")?;
        Ok(Screen::new(screen))
    }

    /// Look for a single template, a template missing from the library is never found
    pub fn find(&self, name: &str, screen: &Screen) -> anyhow::Result<Option<Match>> {
        match self.library.get(name) {
            Some(template) => find_template(screen, template),
            None => Ok(None),
        }
    }

    /// The first button template found, walking the library in order
    pub fn first_button(&self, screen: &Screen) -> anyhow::Result<Option<(&Template, Match)>> {
        for template in self.library.buttons() {
            if self.stop.is_set() {
                break;
            }
            if let Some(m) = find_template(screen, template)? {
                return Ok(Some((template, m)));
            }
        }
        Ok(None)
    }

    fn click_radius(&self, name: &str) -> RangeInclusive<u32> {
        self.library
            .get(name)
            .map(|t| t.click_radius.clone())
            .unwrap_or_else(|| self.settings.click_radius_for(name))
    }

    /// Tap around the centre of `m`
    pub fn tap(&self, m: &Match) -> anyhow::Result<(u32, u32)> {
        let pos = self
            .controller
            .click_around_scaled(m.center, self.click_radius(&m.name))
            .with_context(|| format!("failed to tap {}", m.name))?;
        info!("tap {} ({:.2}) at {:?}", m.name, m.score, pos);
        self.record_tap(&m.name, pos);
        Ok(pos)
    }

    /// Tap exactly at a point in 1280x720 space
    pub fn tap_point(&self, label: &str, (x, y): (u32, u32)) -> anyhow::Result<()> {
        self.controller
            .click_scaled(x, y)
            .with_context(|| format!("failed to tap {label}"))?;
        info!("tap {label} at {:?}", (x, y));
        self.record_tap(label, (x, y));
        Ok(())
    }

    fn record_tap(&self, name: &str, pos: (u32, u32)) {
        {
            let mut status = self.status();
            status.clicks += 1;
            status.last_tapped = Some(name.to_string());
        }
        self.emit(DeviceEvt::Tapped {
            serial: self.serial.clone(),
            name: name.to_string(),
            pos,
        });
    }

    pub fn record_battle(&self) {
        self.status().battles += 1;
    }

    /// The random post-tap delay of `name`
    pub fn delay_after(&self, name: &str) -> Duration {
        let range = self
            .library
            .get(name)
            .map(|t| t.delay_after)
            .unwrap_or_else(|| self.settings.delay_after_for(name));
        self.random_duration(range)
    }
}

pub trait Routine<T> {
    fn run_slice(&mut self, runner: &T) -> anyhow::Result<SliceOutcome>;
}

#[derive(Debug)]
pub enum RoutineSet {
    Yuhun(Yuhun),
    Baigui(Baigui),
}

impl RoutineSet {
    pub fn name(&self) -> &'static str {
        match self {
            RoutineSet::Yuhun(_) => "yuhun",
            RoutineSet::Baigui(_) => "baigui",
        }
    }
}

impl From<Module> for RoutineSet {
    fn from(module: Module) -> Self {
        match module {
            Module::Yuhun => RoutineSet::Yuhun(Yuhun::default()),
            Module::Baigui => RoutineSet::Baigui(Baigui::default()),
        }
    }
}

impl<C: Controller> Routine<Runner<C>> for RoutineSet {
    fn run_slice(&mut self, runner: &Runner<C>) -> anyhow::Result<SliceOutcome> {
        match self {
            RoutineSet::Yuhun(routine) => routine.run_slice(runner),
            RoutineSet::Baigui(routine) => routine.run_slice(runner),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::VecDeque;

    use image::{DynamicImage, GrayImage};

    use super::*;
    use crate::{
        config::TemplateConfig,
        vision::test::{pattern, screen_with},
    };

    /// Serves queued screens (the last one repeats) and records taps
    pub struct FakeController {
        screens: Mutex<VecDeque<anyhow::Result<DynamicImage>>>,
        last: Mutex<Option<DynamicImage>>,
        pub clicks: Mutex<Vec<(u32, u32)>>,
        pub captures: Mutex<usize>,
    }

    impl FakeController {
        pub fn new(screens: Vec<anyhow::Result<DynamicImage>>) -> Self {
            Self {
                screens: Mutex::new(screens.into()),
                last: Mutex::new(None),
                clicks: Mutex::new(vec![]),
                captures: Mutex::new(0),
            }
        }

        pub fn clicks(&self) -> Vec<(u32, u32)> {
            self.clicks.lock().unwrap().clone()
        }
    }

    impl Controller for FakeController {
        fn screen_size(&self) -> (u32, u32) {
            (1280, 720)
        }

        fn click(&self, x: u32, y: u32) -> anyhow::Result<()> {
            self.clicks.lock().unwrap().push((x, y));
            Ok(())
        }

        fn screencap(&self) -> anyhow::Result<DynamicImage> {
            *self.captures.lock().unwrap() += 1;
            let next = self.screens.lock().unwrap().pop_front();
            match next {
                Some(Ok(screen)) => {
                    *self.last.lock().unwrap() = Some(screen.clone());
                    Ok(screen)
                }
                Some(Err(err)) => Err(err),
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("no screen")),
            }
        }
    }

    /// Where each named pattern sits on the test screens.
    ///
    /// Every template only searches a 160x120 cell around its spot, which
    /// keeps the fft small.
    pub const SPOTS: [(&str, u32, u32); 9] = [
        ("button1", 0, 0),
        ("button2", 160, 0),
        ("button3", 320, 0),
        ("button4", 480, 0),
        ("button5", 640, 0),
        ("button7", 800, 0),
        ("button10", 960, 0),
        ("lose", 0, 120),
        ("notupo", 160, 120),
    ];

    fn spot(name: &str) -> (u32, u32) {
        SPOTS
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, x, y)| (*x, *y))
            .unwrap()
    }

    pub fn patch_of(name: &str) -> GrayImage {
        let seed = SPOTS.iter().position(|(n, _, _)| *n == name).unwrap() as u32 + 100;
        pattern(32, 24, seed)
    }

    /// A 1280x720 screen showing the named templates at their spots
    pub fn screen_showing(names: &[&str]) -> DynamicImage {
        let patches: Vec<_> = names.iter().map(|name| (patch_of(name), spot(name))).collect();
        let patches: Vec<_> = patches
            .iter()
            .map(|(patch, (x, y))| (patch, x + 40, y + 40))
            .collect();
        screen_with(1280, 720, &patches)
    }

    /// Settings with no delays and a roi cell for every spot
    pub fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.click.delay_after = [0.0, 0.0];
        settings.click.radius = [0, 0];
        settings.max_slice_secs = 0.5;
        for (name, x, y) in SPOTS {
            let config = settings.templates.entry(name.to_string()).or_default();
            config.roi = Some([
                (x as f64 / 1280.0, y as f64 / 720.0),
                ((x + 160) as f64 / 1280.0, (y + 120) as f64 / 720.0),
            ]);
        }
        let button7 = TemplateConfig {
            wait_before: Some([0.3, 0.3]),
            ..settings.template("button7")
        };
        settings.templates.insert("button7".to_string(), button7);
        settings
    }

    pub fn test_library(settings: &Settings, names: &[&str]) -> TemplateLibrary {
        let templates = names
            .iter()
            .map(|name| Template::new(name, patch_of(name).into(), settings))
            .collect();
        TemplateLibrary::from_templates("templates", vec![], templates)
    }

    pub fn test_pacing() -> Pacing {
        Pacing {
            idle: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            pause_poll: Duration::from_millis(10),
            notupo_window: Duration::from_millis(300),
            notupo_poll: Duration::from_millis(10),
        }
    }

    pub fn test_runner(
        screens: Vec<anyhow::Result<DynamicImage>>,
        names: &[&str],
    ) -> Runner<FakeController> {
        runner_with(test_settings(), screens, names)
    }

    pub fn runner_with(
        settings: Settings,
        screens: Vec<anyhow::Result<DynamicImage>>,
        names: &[&str],
    ) -> Runner<FakeController> {
        let library = test_library(&settings, names);
        Runner::new(
            "fake",
            FakeController::new(screens),
            Arc::new(library),
            Arc::new(settings),
            Flag::new(),
        )
        .with_pacing(test_pacing())
    }

    /// The tap position of a template at its spot, radius is 0 in tests
    pub fn center_of(name: &str) -> (u32, u32) {
        let (x, y) = spot(name);
        (x + 40 + 16, y + 40 + 12)
    }

    #[test]
    fn test_flag() {
        let flag = Flag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        assert!(other.is_set());
        assert!(!other.toggle());
        assert!(!flag.is_set());
        assert!(flag.toggle());
        flag.clear();
        assert!(!other.is_set());
    }

    #[test]
    fn test_sleep_interrupted_by_stop() {
        let runner = test_runner(vec![], &["button1"]);
        runner.stop.set();
        let start = Instant::now();
        assert!(!runner.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_first_button_and_tap() {
        let runner = test_runner(
            vec![Ok(screen_showing(&["button3", "button10"]))],
            &["button1", "button3", "button10", "lose"],
        );
        let screen = runner.capture().unwrap();
        let (template, m) = runner.first_button(&screen).unwrap().unwrap();
        // `button10` sorts before `button3`
        assert_eq!(template.name, "button10");
        assert_eq!(m.center, center_of("button10"));

        runner.tap(&m).unwrap();
        assert_eq!(runner.controller.clicks(), vec![center_of("button10")]);
        assert_eq!(runner.status().clicks, 1);
        assert!(runner.find("lose", &screen).unwrap().is_none());
        assert!(runner.find("not-in-library", &screen).unwrap().is_none());
    }
}
