//! 御魂: tap whatever button shows up, stop on `lose` or `notupo`.

use std::time::Instant;

use oah_controller::Controller;
use tracing::{debug, error, info};

use super::{Routine, Runner, Slice, SliceOutcome, StopCondition};
use crate::{
    config::{LOSE, NOTUPO},
    resource::Template,
    vision::{Match, Screen},
};

/// Tapping this ends a battle, `notupo` may follow shortly after
const BATTLE_END: &str = "button10";

#[derive(Debug, Default)]
pub struct Yuhun {
    last_tapped: Option<String>,
    /// `notupo` is only looked for until then
    notupo_until: Option<Instant>,
    /// A button waiting for its `wait_before`, with the time it is due
    pending: Option<(String, Instant)>,
}

impl<C: Controller> Routine<Runner<C>> for Yuhun {
    fn run_slice(&mut self, runner: &Runner<C>) -> anyhow::Result<SliceOutcome> {
        if runner.pause.is_set() {
            runner.sleep(runner.pacing.pause_poll);
            return Ok(SliceOutcome::Continue);
        }

        let slice = Slice::new(runner.max_slice());
        while !runner.stop.is_set() && !runner.pause.is_set() && !slice.is_over() {
            match self.step(runner, &slice) {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => {}
                Err(err) => {
                    error!("{err:#}");
                    runner.sleep(runner.pacing.error_backoff.min(slice.remaining()));
                }
            }
        }
        Ok(SliceOutcome::Continue)
    }
}

impl Yuhun {
    pub fn last_tapped(&self) -> Option<&str> {
        self.last_tapped.as_deref()
    }

    /// One capture and at most one tap, `None` keeps the slice going
    fn step<C: Controller>(
        &mut self,
        runner: &Runner<C>,
        slice: &Slice,
    ) -> anyhow::Result<Option<SliceOutcome>> {
        let screen = runner.capture()?;

        if let Some(m) = runner.find(LOSE, &screen)? {
            info!("lose detected ({:.2})", m.score);
            return Ok(Some(SliceOutcome::StopCondition(StopCondition::Lose)));
        }

        if let Some(until) = self.notupo_until {
            if let Some(m) = runner.find(NOTUPO, &screen)? {
                info!("notupo detected ({:.2})", m.score);
                self.notupo_until = None;
                return Ok(Some(SliceOutcome::StopCondition(StopCondition::Notupo)));
            }
            if Instant::now() < until {
                runner.sleep(runner.pacing.notupo_poll);
                return Ok(None);
            }
            self.notupo_until = None;
        }

        let Some((template, m)) = runner.first_button(&screen)? else {
            self.pending = None;
            runner.sleep(runner.pacing.idle.min(slice.remaining()));
            return Ok(None);
        };
        if self
            .pending
            .as_ref()
            .is_some_and(|(name, _)| *name != template.name)
        {
            self.pending = None;
        }

        if let Some(required) = self.redirect(runner, template, &screen)? {
            self.tap(runner, &required, slice)?;
            return Ok(Some(SliceOutcome::Continue));
        }

        if let Some(range) = template.wait_before {
            let due = match &self.pending {
                Some((_, due)) => *due,
                None => {
                    let due = Instant::now() + runner.random_duration(range);
                    debug!(
                        "{} found, tapping it in {:.1}s",
                        template.name,
                        (due - Instant::now()).as_secs_f64()
                    );
                    self.pending = Some((template.name.clone(), due));
                    due
                }
            };
            let wait = due.saturating_duration_since(Instant::now());
            if wait > slice.remaining() {
                // still waiting, look again next slice
                runner.sleep(slice.remaining());
                return Ok(Some(SliceOutcome::Continue));
            }
            if !runner.sleep(wait) {
                return Ok(Some(SliceOutcome::Continue));
            }
            self.pending = None;
        }

        self.tap(runner, &m, slice)?;
        Ok(Some(SliceOutcome::Continue))
    }

    /// When `template` requires another button which is on the screen but
    /// was not tapped last, that one is tapped instead
    fn redirect<C: Controller>(
        &self,
        runner: &Runner<C>,
        template: &Template,
        screen: &Screen,
    ) -> anyhow::Result<Option<Match>> {
        let Some(required) = template.requires.as_deref() else {
            return Ok(None);
        };
        if self.last_tapped.as_deref() == Some(required) {
            return Ok(None);
        }
        let found = runner.find(required, screen)?;
        if found.is_some() {
            info!(
                "{} found but {required} was not tapped before it, tapping {required} first",
                template.name
            );
        }
        Ok(found)
    }

    fn tap<C: Controller>(
        &mut self,
        runner: &Runner<C>,
        m: &Match,
        slice: &Slice,
    ) -> anyhow::Result<()> {
        runner.tap(m)?;
        self.last_tapped = Some(m.name.clone());

        if m.name == BATTLE_END {
            runner.record_battle();
            self.notupo_until = Some(Instant::now() + runner.pacing.notupo_window);
            return Ok(());
        }

        let delay = runner.delay_after(&m.name).min(slice.remaining());
        runner.sleep(delay);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::TemplateConfig,
        task::test::{center_of, runner_with, screen_showing, test_runner, test_settings},
    };

    const ALL: [&str; 9] = [
        "button1", "button2", "button3", "button4", "button5", "button7", "button10", "lose",
        "notupo",
    ];

    #[test]
    fn test_lose_stops() {
        let runner = test_runner(vec![Ok(screen_showing(&["button1", "lose"]))], &ALL);
        let mut yuhun = Yuhun::default();
        let outcome = yuhun.run_slice(&runner).unwrap();
        assert_eq!(outcome, SliceOutcome::StopCondition(StopCondition::Lose));
        assert!(runner.controller.clicks().is_empty());
    }

    #[test]
    fn test_taps_first_visible_button() {
        let runner = test_runner(vec![Ok(screen_showing(&["button3", "button2"]))], &ALL);
        let mut yuhun = Yuhun::default();
        assert_eq!(yuhun.run_slice(&runner).unwrap(), SliceOutcome::Continue);
        assert_eq!(runner.controller.clicks(), vec![center_of("button2")]);
        assert_eq!(yuhun.last_tapped(), Some("button2"));
        assert_eq!(runner.status().last_tapped.as_deref(), Some("button2"));
    }

    #[test]
    fn test_nothing_visible() {
        let runner = test_runner(vec![Ok(screen_showing(&[]))], &ALL);
        let mut yuhun = Yuhun::default();
        assert_eq!(yuhun.run_slice(&runner).unwrap(), SliceOutcome::Continue);
        assert!(runner.controller.clicks().is_empty());
        assert!(*runner.controller.captures.lock().unwrap() > 1);
    }

    #[test]
    fn test_requires_redirects_to_required_button() {
        let mut settings = test_settings();
        let button5 = TemplateConfig {
            priority: Some(-1),
            ..settings.template("button5")
        };
        settings.templates.insert("button5".to_string(), button5);

        let runner = runner_with(
            settings,
            vec![
                Ok(screen_showing(&["button4", "button5"])),
                Ok(screen_showing(&["button5"])),
            ],
            &ALL,
        );
        let mut yuhun = Yuhun::default();
        yuhun.run_slice(&runner).unwrap();
        assert_eq!(runner.controller.clicks(), vec![center_of("button4")]);

        yuhun.run_slice(&runner).unwrap();
        assert_eq!(
            runner.controller.clicks(),
            vec![center_of("button4"), center_of("button5")]
        );
    }

    #[test]
    fn test_required_button_missing_taps_anyway() {
        let runner = test_runner(vec![Ok(screen_showing(&["button5"]))], &ALL);
        let mut yuhun = Yuhun::default();
        yuhun.run_slice(&runner).unwrap();
        assert_eq!(runner.controller.clicks(), vec![center_of("button5")]);
    }

    #[test]
    fn test_notupo_after_battle_end() {
        let runner = test_runner(
            vec![
                Ok(screen_showing(&["button10"])),
                Ok(screen_showing(&["notupo"])),
            ],
            &ALL,
        );
        let mut yuhun = Yuhun::default();
        assert_eq!(yuhun.run_slice(&runner).unwrap(), SliceOutcome::Continue);
        assert_eq!(runner.status().battles, 1);
        assert_eq!(
            yuhun.run_slice(&runner).unwrap(),
            SliceOutcome::StopCondition(StopCondition::Notupo)
        );
    }

    #[test]
    fn test_taps_again_once_notupo_window_passes() {
        let runner = test_runner(
            vec![
                Ok(screen_showing(&["button10"])),
                Ok(screen_showing(&["button1"])),
            ],
            &ALL,
        );
        let mut yuhun = Yuhun::default();
        yuhun.run_slice(&runner).unwrap();
        let battle_end = Instant::now();
        assert_eq!(runner.controller.clicks(), vec![center_of("button10")]);

        assert_eq!(yuhun.run_slice(&runner).unwrap(), SliceOutcome::Continue);
        assert!(battle_end.elapsed() >= runner.pacing.notupo_window);
        assert_eq!(
            runner.controller.clicks(),
            vec![center_of("button10"), center_of("button1")]
        );
        assert!(yuhun.notupo_until.is_none());
    }

    #[test]
    fn test_notupo_ignored_without_battle_end() {
        let runner = test_runner(vec![Ok(screen_showing(&["notupo"]))], &ALL);
        let mut yuhun = Yuhun::default();
        assert_eq!(yuhun.run_slice(&runner).unwrap(), SliceOutcome::Continue);
        assert!(runner.controller.clicks().is_empty());
    }

    #[test]
    fn test_wait_before_spans_slices() {
        let mut settings = test_settings();
        settings.max_slice_secs = 0.1;
        let runner = runner_with(settings, vec![Ok(screen_showing(&["button7"]))], &ALL);
        let mut yuhun = Yuhun::default();

        let start = Instant::now();
        let mut slices = 0;
        while runner.controller.clicks().is_empty() {
            yuhun.run_slice(&runner).unwrap();
            slices += 1;
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        assert!(slices >= 2);
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(runner.controller.clicks(), vec![center_of("button7")]);
    }

    #[test]
    fn test_wait_before_dropped_when_another_button_shows() {
        let mut settings = test_settings();
        settings.max_slice_secs = 0.1;
        let runner = runner_with(
            settings,
            vec![
                Ok(screen_showing(&["button7"])),
                Ok(screen_showing(&["button1"])),
            ],
            &ALL,
        );
        let mut yuhun = Yuhun::default();

        yuhun.run_slice(&runner).unwrap();
        assert!(runner.controller.clicks().is_empty());
        assert_eq!(yuhun.pending.as_ref().map(|(name, _)| name.as_str()), Some("button7"));

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(400) {
            yuhun.run_slice(&runner).unwrap();
            assert!(yuhun.pending.is_none());
        }
        let clicks = runner.controller.clicks();
        assert!(!clicks.is_empty());
        assert!(clicks.iter().all(|pos| *pos == center_of("button1")));
    }

    #[test]
    fn test_capture_error_is_retried() {
        let runner = test_runner(
            vec![
                Err(anyhow::anyhow!("device offline")),
                Ok(screen_showing(&["button1"])),
            ],
            &ALL,
        );
        let mut yuhun = Yuhun::default();
        assert_eq!(yuhun.run_slice(&runner).unwrap(), SliceOutcome::Continue);
        assert_eq!(runner.controller.clicks(), vec![center_of("button1")]);
    }

    #[test]
    fn test_paused_does_nothing() {
        let runner = test_runner(vec![Ok(screen_showing(&["button1"]))], &ALL);
        runner.pause.set();
        let mut yuhun = Yuhun::default();
        assert_eq!(yuhun.run_slice(&runner).unwrap(), SliceOutcome::Continue);
        assert_eq!(*runner.controller.captures.lock().unwrap(), 0);
    }
}
