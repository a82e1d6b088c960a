//! The loop running on each device thread: call the routine slice by slice
//! until the deadline, a stop, or a stop condition.

use std::{
    fmt::Display,
    time::{Duration, Instant},
};

use chrono::{DateTime, Local};
use oah_controller::Controller;
use rand::Rng;
use tracing::{error, info, warn};

use crate::{
    config::{RestSettings, StopPolicy},
    task::{DeviceEvt, Routine, RoutineSet, Runner, SliceOutcome, StopCondition},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    Paused,
    Resting,
    Finished,
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Resting => "resting",
            WorkerState::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// A snapshot of one device, read by the panel
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub serial: String,
    pub label: String,
    pub state: WorkerState,
    pub started_at: Option<DateTime<Local>>,
    pub deadline: Option<DateTime<Local>>,
    pub clicks: u64,
    pub battles: u64,
    pub last_tapped: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Deadline,
    Stopped,
    StopCondition(StopCondition),
}

impl Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Deadline => write!(f, "run duration reached"),
            EndReason::Stopped => write!(f, "stopped"),
            EndReason::StopCondition(condition) => write!(f, "{condition} detected"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub serial: String,
    pub label: String,
    pub started_at: DateTime<Local>,
    pub ran_for: Duration,
    pub clicks: u64,
    pub battles: u64,
    pub ended_by: EndReason,
}

impl Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): ran {:.1} minutes from {}, {} taps, {} battles, {}",
            self.serial,
            self.label,
            self.ran_for.as_secs_f64() / 60.0,
            self.started_at.format("%H:%M:%S"),
            self.clicks,
            self.battles,
            self.ended_by
        )
    }
}

/// Remaining time is logged at every multiple of this
const REPORT_EVERY: Duration = Duration::from_secs(600);

pub struct Worker<C: Controller> {
    runner: Runner<C>,
    routine: RoutineSet,
    duration: Duration,
}

impl<C: Controller> Worker<C> {
    pub fn new(runner: Runner<C>, routine: RoutineSet, duration: Duration) -> Self {
        Self {
            runner,
            routine,
            duration,
        }
    }

    pub fn runner(&self) -> &Runner<C> {
        &self.runner
    }

    fn set_state(&self, state: WorkerState) {
        self.runner.status().state = state;
    }

    pub fn run(mut self) -> RunReport {
        let started_at = Local::now();
        let started = Instant::now();
        let deadline = started + self.duration;
        let deadline_at = started_at
            + chrono::Duration::from_std(self.duration).unwrap_or(chrono::Duration::zero());
        let policy = self.runner.settings.on_stop_condition;
        let slow_slice = Duration::from_secs_f64(self.runner.settings.slow_slice_warn_secs);
        let rest = self.runner.settings.rest.clone();

        {
            let mut status = self.runner.status();
            status.state = WorkerState::Running;
            status.started_at = Some(started_at);
            status.deadline = Some(deadline_at);
        }
        info!(
            "running {} for {:.1} minutes, until {}",
            self.routine.name(),
            self.duration.as_secs_f64() / 60.0,
            deadline_at.format("%H:%M:%S")
        );
        self.runner.emit(DeviceEvt::Started {
            serial: self.runner.serial.clone(),
            deadline: deadline_at,
        });

        let mut reported = 0;
        let mut paused = false;
        let mut next_rest = next_rest_at(&rest, started);
        let ended_by = loop {
            if self.runner.stop.is_set() {
                break EndReason::Stopped;
            }
            let now = Instant::now();
            if now >= deadline {
                info!("run duration reached, stopping all devices");
                self.runner.stop.set();
                break EndReason::Deadline;
            }

            let elapsed = now - started;
            let mark = elapsed.as_secs() / REPORT_EVERY.as_secs();
            if mark > reported {
                reported = mark;
                info!(
                    "{:.1} minutes remaining",
                    (deadline - now).as_secs_f64() / 60.0
                );
            }

            if self.runner.pause.is_set() != paused {
                paused = !paused;
                self.on_pause_changed(paused);
            }

            if let Some(at) = next_rest {
                if !paused && now >= at {
                    self.rest(&rest, deadline);
                    next_rest = next_rest_at(&rest, Instant::now());
                    continue;
                }
            }

            let slice_started = Instant::now();
            match self.routine.run_slice(&self.runner) {
                Ok(SliceOutcome::Continue) => {}
                Ok(SliceOutcome::StopCondition(condition)) => {
                    self.runner.emit(DeviceEvt::StopCondition {
                        serial: self.runner.serial.clone(),
                        condition,
                    });
                    match policy {
                        StopPolicy::Stop => {
                            info!("{condition} detected, stopping");
                            break EndReason::StopCondition(condition);
                        }
                        StopPolicy::Pause => {
                            warn!("{condition} detected, pausing");
                            self.runner.pause.set();
                        }
                    }
                }
                Err(err) => {
                    error!("{err:#}");
                    self.runner.emit(DeviceEvt::Error {
                        serial: self.runner.serial.clone(),
                        message: format!("{err:#}"),
                    });
                    self.runner.sleep(self.runner.pacing.error_backoff);
                }
            }
            let took = slice_started.elapsed();
            if took > slow_slice {
                warn!("a slice took {:.1}s", took.as_secs_f64());
            }
        };

        let ran_for = started.elapsed();
        info!(
            "finished after {:.2} hours: {ended_by}",
            ran_for.as_secs_f64() / 3600.0
        );
        let report = {
            let mut status = self.runner.status();
            status.state = WorkerState::Finished;
            RunReport {
                serial: status.serial.clone(),
                label: status.label.clone(),
                started_at,
                ran_for,
                clicks: status.clicks,
                battles: status.battles,
                ended_by,
            }
        };
        self.runner.emit(DeviceEvt::Finished(report.clone()));
        report
    }

    fn on_pause_changed(&self, paused: bool) {
        let serial = self.runner.serial.clone();
        if paused {
            info!("paused");
            self.set_state(WorkerState::Paused);
            self.runner.emit(DeviceEvt::Paused { serial });
        } else {
            info!("resumed");
            self.set_state(WorkerState::Running);
            self.runner.emit(DeviceEvt::Resumed { serial });
        }
    }

    /// A break, never running past the deadline
    fn rest(&self, rest: &RestSettings, deadline: Instant) {
        let [lo, hi] = rest.duration_min;
        let minutes = rand::rng().random_range(lo..=hi.max(lo));
        let duration = Duration::from_secs(minutes * 60)
            .min(deadline.saturating_duration_since(Instant::now()));
        let until = Local::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero());

        info!("resting for {minutes} minutes, until {}", until.format("%H:%M:%S"));
        self.set_state(WorkerState::Resting);
        self.runner.emit(DeviceEvt::Resting {
            serial: self.runner.serial.clone(),
            until,
        });
        if self.runner.sleep(duration) {
            info!("rest is over");
        }
        self.set_state(if self.runner.pause.is_set() {
            WorkerState::Paused
        } else {
            WorkerState::Running
        });
    }
}

fn next_rest_at(rest: &RestSettings, from: Instant) -> Option<Instant> {
    if !rest.enabled {
        return None;
    }
    let [lo, hi] = rest.interval_min;
    let minutes = rand::rng().random_range(lo..=hi.max(lo));
    Some(from + Duration::from_secs(minutes * 60))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task::{
        test::{runner_with, screen_showing, test_runner, test_settings},
        Flag, Yuhun,
    };

    const NAMES: [&str; 4] = ["button1", "button10", "lose", "notupo"];

    #[test]
    fn test_deadline_sets_global_stop() {
        let runner = test_runner(vec![Ok(screen_showing(&["button1"]))], &NAMES);
        let stop = runner.stop.clone();
        let worker = Worker::new(
            runner,
            RoutineSet::Yuhun(Yuhun::default()),
            Duration::from_millis(300),
        );
        let report = worker.run();
        assert_eq!(report.ended_by, EndReason::Deadline);
        assert!(report.clicks >= 1);
        assert!(stop.is_set());
    }

    #[test]
    fn test_stop_condition_ends_the_device() {
        let runner = test_runner(vec![Ok(screen_showing(&["lose"]))], &NAMES);
        let (tx, rx) = async_channel::unbounded();
        let runner = runner.with_events(tx);
        let status = runner.status_handle();
        let stop = runner.stop.clone();
        let report = Worker::new(
            runner,
            RoutineSet::Yuhun(Yuhun::default()),
            Duration::from_secs(10),
        )
        .run();

        assert_eq!(
            report.ended_by,
            EndReason::StopCondition(StopCondition::Lose)
        );
        // only this device ends
        assert!(!stop.is_set());
        assert_eq!(status.lock().unwrap().state, WorkerState::Finished);

        let evts: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(evts.first(), Some(DeviceEvt::Started { .. })));
        assert!(evts.iter().any(|evt| matches!(
            evt,
            DeviceEvt::StopCondition {
                condition: StopCondition::Lose,
                ..
            }
        )));
        assert!(matches!(evts.last(), Some(DeviceEvt::Finished(_))));
    }

    #[test]
    fn test_stop_condition_pauses_with_pause_policy() {
        let mut settings = test_settings();
        settings.on_stop_condition = StopPolicy::Pause;
        let runner = runner_with(settings, vec![Ok(screen_showing(&["lose"]))], &NAMES);
        let pause = runner.pause.clone();
        let report = Worker::new(
            runner,
            RoutineSet::Yuhun(Yuhun::default()),
            Duration::from_millis(500),
        )
        .run();
        assert_eq!(report.ended_by, EndReason::Deadline);
        assert!(pause.is_set());
    }

    #[test]
    fn test_external_stop() {
        let stop = Flag::new();
        stop.set();
        let mut runner = test_runner(vec![Ok(screen_showing(&["button1"]))], &NAMES);
        runner.stop = stop;
        let report = Worker::new(
            runner,
            RoutineSet::Yuhun(Yuhun::default()),
            Duration::from_secs(10),
        )
        .run();
        assert_eq!(report.ended_by, EndReason::Stopped);
        assert_eq!(report.clicks, 0);
    }

    #[test]
    fn test_next_rest_at() {
        let now = Instant::now();
        assert!(next_rest_at(&RestSettings::default(), now).is_none());

        let rest = RestSettings {
            enabled: true,
            interval_min: [2, 3],
            duration_min: [1, 1],
        };
        let at = next_rest_at(&rest, now).unwrap();
        assert!(at >= now + Duration::from_secs(120));
        assert!(at <= now + Duration::from_secs(180));
    }
}
