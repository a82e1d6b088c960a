//! The keyboard control panel shown while devices are running.
//!
//! `q` pause/resume all, `s` stop all, `r` refresh, `1`-`9` pause/resume one device.

use std::{
    io::{self, Write},
    time::{Duration, Instant},
};

use color_print::cformat;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
};
use oah_core::{Command, DeviceEvt, Engine, WorkerState};

const STATUS_EVERY: Duration = Duration::from_secs(60);

/// Raw mode for as long as this lives
struct RawMode;

impl RawMode {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Lines are ended with `\r\n` since the terminal is in raw mode
fn line(s: impl AsRef<str>) {
    let mut stdout = io::stdout();
    let _ = write!(stdout, "{}\r\n", s.as_ref());
    let _ = stdout.flush();
}

pub fn key_command(key: KeyEvent) -> Option<Command> {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Some(Command::Stop);
    }
    match key.code {
        KeyCode::Char('q') => Some(Command::TogglePauseAll),
        KeyCode::Char('s') => Some(Command::Stop),
        KeyCode::Char('r') => Some(Command::Refresh),
        KeyCode::Char(c @ '1'..='9') => Some(Command::TogglePause(c as usize - '1' as usize)),
        _ => None,
    }
}

pub fn print_help() {
    line(cformat!(
        "<bold>[Panel]</bold>: <cyan>q</cyan> pause/resume all, <cyan>s</cyan> stop all, <cyan>r</cyan> refresh, <cyan>1-9</cyan> pause/resume one device"
    ));
}

pub fn print_status(engine: &Engine) {
    line(cformat!(
        "<bold>[Panel]</bold>: {} device(s), ending at {}",
        engine.slots().len(),
        engine.deadline().format("%H:%M:%S")
    ));
    for (i, status) in engine.status().iter().enumerate() {
        let state = match status.state {
            WorkerState::Running => cformat!("<green>{}</green>", status.state),
            WorkerState::Paused | WorkerState::Resting => {
                cformat!("<yellow>{}</yellow>", status.state)
            }
            WorkerState::Finished => cformat!("<dim>{}</dim>", status.state),
            WorkerState::Idle => status.state.to_string(),
        };
        line(format!(
            "  [{}] {} {:<20} {:<10} taps: {:<5} battles: {:<4} last: {}",
            i + 1,
            status.serial,
            status.label,
            state,
            status.clicks,
            status.battles,
            status.last_tapped.as_deref().unwrap_or("-")
        ));
    }
}

fn on_evt(evt: DeviceEvt) {
    match evt {
        DeviceEvt::StopCondition { serial, condition } => {
            line(cformat!("<red>[{serial}]</red>: {condition} detected"));
        }
        DeviceEvt::Paused { serial } => line(cformat!("<yellow>[{serial}]</yellow>: paused")),
        DeviceEvt::Resumed { serial } => line(cformat!("<green>[{serial}]</green>: resumed")),
        DeviceEvt::Resting { serial, until } => line(cformat!(
            "<yellow>[{serial}]</yellow>: resting until {}",
            until.format("%H:%M:%S")
        )),
        DeviceEvt::Finished(report) => line(cformat!("<blue>[Finished]</blue>: {report}")),
        DeviceEvt::Started { .. } | DeviceEvt::Tapped { .. } | DeviceEvt::Error { .. } => {}
    }
}

/// Handle keys and events until every device has finished
pub fn run(engine: &Engine) -> anyhow::Result<()> {
    let evt_rx = engine.events();
    let _raw_mode = RawMode::enable()?;
    print_help();
    print_status(engine);

    let mut last_status = Instant::now();
    loop {
        while let Ok(evt) = evt_rx.try_recv() {
            on_evt(evt);
        }
        if engine.is_finished() {
            break;
        }

        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                if let Some(command) = key_command(key) {
                    if let Err(err) = engine.command(command) {
                        line(cformat!("<red>[Panel]</red>: {err}"));
                    }
                    if command != Command::Stop {
                        print_status(engine);
                    }
                }
            }
        }

        if last_status.elapsed() >= STATUS_EVERY {
            print_status(engine);
            last_status = Instant::now();
        }
    }
    Ok(())
}

/// Without a terminal: just forward the events until every device has finished
pub fn wait(engine: &Engine) {
    let evt_rx = engine.events();
    loop {
        while let Ok(evt) = evt_rx.try_recv() {
            on_evt(evt);
        }
        if engine.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    while let Ok(evt) = evt_rx.try_recv() {
        on_evt(evt);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn test_key_command() {
        assert_eq!(key_command(key(KeyCode::Char('q'))), Some(Command::TogglePauseAll));
        assert_eq!(key_command(key(KeyCode::Char('s'))), Some(Command::Stop));
        assert_eq!(key_command(key(KeyCode::Char('r'))), Some(Command::Refresh));
        assert_eq!(key_command(key(KeyCode::Char('1'))), Some(Command::TogglePause(0)));
        assert_eq!(key_command(key(KeyCode::Char('9'))), Some(Command::TogglePause(8)));
        assert_eq!(key_command(key(KeyCode::Char('0'))), None);
        assert_eq!(key_command(key(KeyCode::Enter)), None);
        assert_eq!(
            key_command(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Command::Stop)
        );
    }
}
