//! 百鬼夜行
//!
//! `button1` enters, `button2` starts and is followed by `button3` to
//! settle. Every call is a single step.

use oah_controller::{Controller, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use rand::Rng;
use tracing::{error, info, warn};

use super::{Routine, Runner, Slice, SliceOutcome};

const ENTER: &str = "button1";
const START: &str = "button2";
const SETTLE: &str = "button3";

/// Consecutive capture failures tolerated before pausing
const MAX_CAPTURE_FAILURES: u32 = 5;
/// Half size of the area random taps land in, around the screen centre
const RANDOM_TAP_SPREAD: u32 = 100;

#[derive(Debug)]
pub struct Baigui {
    capture_failures: u32,
    /// Chance of a random tap when nothing matched
    pub random_tap_chance: f64,
}

impl Default for Baigui {
    fn default() -> Self {
        Self {
            capture_failures: 0,
            random_tap_chance: 0.2,
        }
    }
}

impl<C: Controller> Routine<Runner<C>> for Baigui {
    fn run_slice(&mut self, runner: &Runner<C>) -> anyhow::Result<SliceOutcome> {
        if runner.pause.is_set() {
            runner.sleep(runner.pacing.pause_poll);
            return Ok(SliceOutcome::Continue);
        }

        let slice = Slice::new(runner.max_slice());
        if let Err(err) = self.step(runner, &slice) {
            error!("{err:#}");
            runner.sleep(runner.pacing.error_backoff.min(slice.remaining()));
        }
        Ok(SliceOutcome::Continue)
    }
}

impl Baigui {
    fn step<C: Controller>(&mut self, runner: &Runner<C>, slice: &Slice) -> anyhow::Result<()> {
        let screen = match runner.capture() {
            Ok(screen) => {
                self.capture_failures = 0;
                screen
            }
            Err(err) => {
                self.capture_failures += 1;
                warn!(
                    "capture failed ({} in a row): {err:#}",
                    self.capture_failures
                );
                if self.capture_failures > MAX_CAPTURE_FAILURES {
                    error!("too many capture failures, pausing");
                    self.capture_failures = 0;
                    runner.pause.set();
                } else {
                    runner.sleep(runner.pacing.error_backoff.min(slice.remaining()));
                }
                return Ok(());
            }
        };

        let Some((_, m)) = runner.first_button(&screen)? else {
            if rand::rng().random_bool(self.random_tap_chance.clamp(0.0, 1.0)) {
                let pos = random_center_point();
                info!("nothing matched, random tap");
                runner.tap_point("random", pos)?;
            }
            runner.sleep(runner.pacing.idle.min(slice.remaining()));
            return Ok(());
        };

        if m.name == ENTER {
            info!("entering");
        }
        runner.tap(&m)?;
        if m.name == START {
            if !runner.sleep(runner.random_duration([1.0, 2.0]).min(slice.remaining())) {
                return Ok(());
            }
            let screen = runner.capture()?;
            if let Some(settle) = runner.find(SETTLE, &screen)? {
                runner.tap(&settle)?;
            }
        }
        runner.sleep(runner.delay_after(&m.name).min(slice.remaining()));
        Ok(())
    }
}

/// A point around the centre of the 1280x720 screen
fn random_center_point() -> (u32, u32) {
    let mut rng = rand::rng();
    let (cx, cy) = (DEFAULT_WIDTH / 2, DEFAULT_HEIGHT / 2);
    (
        rng.random_range(cx - RANDOM_TAP_SPREAD..=cx + RANDOM_TAP_SPREAD),
        rng.random_range(cy - RANDOM_TAP_SPREAD..=cy + RANDOM_TAP_SPREAD),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::test::{center_of, screen_showing, test_runner};

    const NAMES: [&str; 3] = ["button1", "button2", "button3"];

    #[test]
    fn test_start_then_settle() {
        let runner = test_runner(
            vec![
                Ok(screen_showing(&["button2"])),
                Ok(screen_showing(&["button3"])),
            ],
            &NAMES,
        );
        let mut baigui = Baigui::default();
        baigui.run_slice(&runner).unwrap();
        assert_eq!(
            runner.controller.clicks(),
            vec![center_of("button2"), center_of("button3")]
        );
    }

    #[test]
    fn test_single_step_per_call() {
        let runner = test_runner(vec![Ok(screen_showing(&["button1"]))], &NAMES);
        let mut baigui = Baigui::default();
        baigui.run_slice(&runner).unwrap();
        assert_eq!(runner.controller.clicks(), vec![center_of("button1")]);
        assert_eq!(*runner.controller.captures.lock().unwrap(), 1);
    }

    #[test]
    fn test_random_tap_when_nothing_matched() {
        let runner = test_runner(vec![Ok(screen_showing(&[]))], &NAMES);
        let mut baigui = Baigui {
            random_tap_chance: 1.0,
            ..Default::default()
        };
        baigui.run_slice(&runner).unwrap();
        let clicks = runner.controller.clicks();
        assert_eq!(clicks.len(), 1);
        let (x, y) = clicks[0];
        assert!((540..=740).contains(&x) && (260..=460).contains(&y));

        let mut baigui = Baigui {
            random_tap_chance: 0.0,
            ..Default::default()
        };
        baigui.run_slice(&runner).unwrap();
        assert_eq!(runner.controller.clicks().len(), 1);
    }

    #[test]
    fn test_pauses_after_repeated_capture_failures() {
        let screens = (0..=MAX_CAPTURE_FAILURES)
            .map(|i| Err(anyhow::anyhow!("capture failure {i}")))
            .collect();
        let runner = test_runner(screens, &NAMES);
        let mut baigui = Baigui::default();
        for _ in 0..MAX_CAPTURE_FAILURES {
            baigui.run_slice(&runner).unwrap();
            assert!(!runner.pause.is_set());
        }
        baigui.run_slice(&runner).unwrap();
        assert!(runner.pause.is_set());
    }
}
