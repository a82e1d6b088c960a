//! Runs a [`Worker`] per device on its own thread.
//!
//! The only thing the devices share is the stop flag (and the read-only
//! library and settings). Each one has its own pause flag, toggled through
//! [`Command`]s.

use std::{
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Local};
use oah_controller::Controller;
use tracing::{info, info_span};

use crate::{
    config::{Module, Settings},
    resource::TemplateLibrary,
    task::{DeviceEvt, Flag, Pacing, RoutineSet, Runner},
    worker::{RunReport, Worker, WorkerStatus},
};

/// A device selected to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSlot {
    pub serial: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Resume all if every device is paused, pause all otherwise
    TogglePauseAll,
    /// Toggle the `i`th device, counting from 0
    TogglePause(usize),
    Stop,
    /// Nothing to do in the engine, the panel redraws
    Refresh,
}

struct DeviceHandle {
    slot: DeviceSlot,
    pause: Flag,
    status: Arc<Mutex<WorkerStatus>>,
    thread: JoinHandle<RunReport>,
}

pub struct Engine {
    stop: Flag,
    devices: Vec<DeviceHandle>,
    evt_rx: async_channel::Receiver<DeviceEvt>,
    deadline: DateTime<Local>,
}

pub struct EngineOptions {
    pub module: Module,
    pub duration: Duration,
    pub pacing: Pacing,
}

impl EngineOptions {
    pub fn new(module: Module, duration: Duration) -> Self {
        Self {
            module,
            duration,
            pacing: Pacing::default(),
        }
    }
}

impl Engine {
    pub fn start<C>(
        devices: Vec<(DeviceSlot, C)>,
        library: Arc<TemplateLibrary>,
        settings: Arc<Settings>,
        options: EngineOptions,
    ) -> anyhow::Result<Self>
    where
        C: Controller + Send + 'static,
    {
        if devices.is_empty() {
            anyhow::bail!("no device to run on");
        }

        let stop = Flag::new();
        let (evt_tx, evt_rx) = async_channel::unbounded();
        let deadline = Local::now()
            + chrono::Duration::from_std(options.duration).unwrap_or(chrono::Duration::zero());
        info!(
            "starting {} on {} device(s), expected to end at {}",
            options.module,
            devices.len(),
            deadline.format("%H:%M:%S")
        );

        let mut handles = Vec::with_capacity(devices.len());
        for (slot, controller) in devices {
            let runner = Runner::new(
                &slot.serial,
                controller,
                library.clone(),
                settings.clone(),
                stop.clone(),
            )
            .with_pacing(options.pacing.clone())
            .with_events(evt_tx.clone());
            runner.status().label = slot.label.clone();
            let pause = runner.pause.clone();
            let status = runner.status_handle();

            let worker = Worker::new(runner, RoutineSet::from(options.module), options.duration);
            let serial = slot.serial.clone();
            let thread = thread::Builder::new()
                .name(format!("Device-{}", slot.serial))
                .spawn(move || {
                    let span = info_span!("device", serial = %serial);
                    let _enter = span.enter();
                    worker.run()
                })
                .with_context(|| format!("failed to spawn thread for {}", slot.serial))?;

            handles.push(DeviceHandle {
                slot,
                pause,
                status,
                thread,
            });
        }

        Ok(Self {
            stop,
            devices: handles,
            evt_rx,
            deadline,
        })
    }

    pub fn deadline(&self) -> DateTime<Local> {
        self.deadline
    }

    pub fn slots(&self) -> Vec<&DeviceSlot> {
        self.devices.iter().map(|d| &d.slot).collect()
    }

    pub fn events(&self) -> async_channel::Receiver<DeviceEvt> {
        self.evt_rx.clone()
    }

    pub fn stop_flag(&self) -> Flag {
        self.stop.clone()
    }

    pub fn command(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::TogglePauseAll => {
                let all_paused = self.devices.iter().all(|d| d.pause.is_set());
                for device in &self.devices {
                    if all_paused {
                        device.pause.clear();
                    } else {
                        device.pause.set();
                    }
                }
                info!(
                    "{} all devices",
                    if all_paused { "resuming" } else { "pausing" }
                );
            }
            Command::TogglePause(i) => {
                let device = self
                    .devices
                    .get(i)
                    .with_context(|| format!("no device #{}", i + 1))?;
                let paused = device.pause.toggle();
                info!(
                    "{} {}",
                    if paused { "pausing" } else { "resuming" },
                    device.slot.serial
                );
            }
            Command::Stop => {
                info!("stopping all devices");
                self.stop.set();
            }
            Command::Refresh => {}
        }
        Ok(())
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.devices
            .iter()
            .map(|d| {
                d.status
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone()
            })
            .collect()
    }

    pub fn is_paused(&self, i: usize) -> bool {
        self.devices.get(i).is_some_and(|d| d.pause.is_set())
    }

    pub fn is_finished(&self) -> bool {
        self.devices.iter().all(|d| d.thread.is_finished())
    }

    /// Wait for every device thread
    pub fn join(self) -> anyhow::Result<Vec<RunReport>> {
        let mut reports = Vec::with_capacity(self.devices.len());
        for device in self.devices {
            let report = device
                .thread
                .join()
                .map_err(|_| anyhow!("device thread {} panicked", device.slot.serial))?;
            reports.push(report);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;

    use super::*;
    use crate::{
        task::test::{screen_showing, test_library, test_pacing, test_settings, FakeController},
        worker::{EndReason, WorkerState},
    };

    fn start(screens: &[&[&str]], duration: Duration) -> Engine {
        let settings = test_settings();
        let library = test_library(&settings, &["button1", "lose"]);
        let devices = screens
            .iter()
            .enumerate()
            .map(|(i, names)| {
                (
                    DeviceSlot {
                        serial: format!("fake-{i}"),
                        label: "Fake".to_string(),
                    },
                    FakeController::new(vec![Ok(screen_showing(names))]),
                )
            })
            .collect();
        Engine::start(
            devices,
            Arc::new(library),
            Arc::new(settings),
            EngineOptions {
                module: Module::Yuhun,
                duration,
                pacing: test_pacing(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_toggle_pause_all() {
        let engine = start(&[&["button1"], &["button1"]], Duration::from_secs(10));

        engine.command(Command::TogglePause(0)).unwrap();
        assert!(engine.is_paused(0) && !engine.is_paused(1));

        // not every device is paused, so all get paused
        engine.command(Command::TogglePauseAll).unwrap();
        assert!(engine.is_paused(0) && engine.is_paused(1));

        engine.command(Command::TogglePauseAll).unwrap();
        assert!(!engine.is_paused(0) && !engine.is_paused(1));

        assert!(engine.command(Command::TogglePause(5)).is_err());

        engine.command(Command::Stop).unwrap();
        let reports = engine.join().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.ended_by == EndReason::Stopped));
    }

    #[test]
    fn test_devices_end_independently() {
        let engine = start(&[&["lose"], &["button1"]], Duration::from_millis(800));
        let evt_rx = engine.events();

        let start = Instant::now();
        while !engine.is_finished() {
            assert!(start.elapsed() < Duration::from_secs(10));
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(engine
            .status()
            .iter()
            .all(|s| s.state == WorkerState::Finished));

        let reports = engine.join().unwrap();
        assert_eq!(reports[0].serial, "fake-0");
        assert_eq!(reports[0].label, "Fake");
        assert!(matches!(reports[0].ended_by, EndReason::StopCondition(_)));
        assert_eq!(reports[1].ended_by, EndReason::Deadline);
        assert!(reports[1].clicks >= 1);

        let finished = std::iter::from_fn(|| evt_rx.try_recv().ok())
            .filter(|evt| matches!(evt, DeviceEvt::Finished(_)))
            .count();
        assert_eq!(finished, 2);
    }
}
