mod panel;
mod utils;

use std::{
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use color_print::cprintln;
use oah_controller::{
    discovery::{discover, DiscoveredDevice, DiscoveryOptions},
    Adb, AdbController, Controller,
};
use oah_core::{
    config::{LOSE, NOTUPO},
    resource::Reconcile,
    store::DeviceStore,
    vision::{annotate, detect_all, find_template, Screen},
    DeviceSlot, Engine, EngineOptions, Module, Settings, TemplateLibrary,
};
use tracing::{error, info, warn};

use utils::{init_logger, parse_selection};

#[derive(Parser)]
#[command(name = "oah")]
#[command(about = "Onmyoji auto helper: taps through soul battles on adb devices")]
#[command(version)]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = "oah.toml")]
    config: PathBuf,

    /// adb executable, overrides `adb_path`
    #[arg(long, global = true)]
    adb: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the routine on one or more devices
    Run {
        /// Minutes to run, overrides `run_duration_min`
        #[arg(short, long)]
        duration: Option<u64>,

        /// Serial of a device to run on, can be repeated
        #[arg(short = 'D', long = "device")]
        devices: Vec<String>,

        /// Run on every discovered device without asking
        #[arg(long)]
        all: bool,

        /// `yuhun` or `baigui`, overrides `module`
        #[arg(short, long)]
        module: Option<Module>,

        /// Do not show the keyboard panel
        #[arg(long)]
        no_panel: bool,
    },

    /// Discover devices and list them
    Devices {
        /// Skip restarting the adb server
        #[arg(long)]
        no_restart: bool,
    },

    /// Check the templates directory against the settings
    Templates {
        /// Write the reconciled `[templates]` table back to the settings file
        #[arg(long)]
        save: bool,
    },

    /// Write the default settings file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Save a screenshot of a device
    Screenshot {
        /// Serial of the device, the first attached one if not set
        #[arg(short = 'D', long)]
        device: Option<String>,

        #[arg(short, long, default_value = "screenshot.png")]
        output: PathBuf,

        /// Draw the matched templates on it
        #[arg(long)]
        annotate: bool,
    },
}

fn discovery_options(settings: &Settings) -> DiscoveryOptions {
    DiscoveryOptions {
        restart_server: settings.discovery.restart_server,
        ports: settings.discovery.common_ports.clone(),
        mumu_manager: settings.discovery.mumu_manager.clone(),
    }
}

fn print_devices(devices: &[DiscoveredDevice]) {
    for (i, device) in devices.iter().enumerate() {
        cprintln!(
            "  <cyan>[{}]</cyan> {:<22} {} <dim>({})</dim>",
            i + 1,
            device.serial,
            device.label,
            device.kind
        );
    }
}

/// Discover devices and remember them in `known_devices.json`
fn discover_devices(
    adb: &Adb,
    settings: &Settings,
    restart: bool,
) -> anyhow::Result<Vec<DiscoveredDevice>> {
    let mut options = discovery_options(settings);
    options.restart_server &= restart;
    let devices = discover(adb, &options).context("device discovery failed")?;

    let mut store = DeviceStore::load(&settings.config_dir);
    for device in &devices {
        store.touch(&device.serial, &device.label);
    }
    if let Err(err) = store.save() {
        warn!("failed to save {:?}: {err:#}", store.path());
    }
    Ok(devices)
}

fn ask_selection(devices: &[DiscoveredDevice]) -> anyhow::Result<Vec<usize>> {
    cprintln!("<bold>found {} devices:</bold>", devices.len());
    print_devices(devices);
    loop {
        print!("select devices (e.g. `1,3`, empty for all): ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        match parse_selection(&input, devices.len()) {
            Ok(selection) if !selection.is_empty() => return Ok(selection),
            Ok(_) => cprintln!("<red>nothing selected</red>"),
            Err(err) => cprintln!("<red>{err}</red>"),
        }
    }
}

fn select_devices(
    adb: &Adb,
    settings: &Settings,
    serials: Vec<String>,
    all: bool,
) -> anyhow::Result<Vec<DeviceSlot>> {
    if !serials.is_empty() {
        let store = DeviceStore::load(&settings.config_dir);
        return Ok(serials
            .into_iter()
            .map(|serial| DeviceSlot {
                label: store
                    .get(&serial)
                    .map(|d| d.label.clone())
                    .unwrap_or_default(),
                serial,
            })
            .collect());
    }

    let devices = discover_devices(adb, settings, true)?;
    if devices.is_empty() {
        bail!("no device found, check that the emulator is running and adb debugging is enabled");
    }
    let selection = if all || devices.len() == 1 || !io::stdin().is_terminal() {
        (0..devices.len()).collect()
    } else {
        ask_selection(&devices)?
    };
    Ok(selection
        .into_iter()
        .map(|i| DeviceSlot {
            serial: devices[i].serial.clone(),
            label: devices[i].label.clone(),
        })
        .collect())
}

fn load_library(settings: &Settings) -> anyhow::Result<TemplateLibrary> {
    let reconcile = Reconcile::scan(&settings.templates_dir, settings)?;
    if !reconcile.added.is_empty() {
        info!("templates without settings, using defaults: {:?}", reconcile.added);
    }
    if !reconcile.removed.is_empty() {
        warn!("configured templates without a png: {:?}", reconcile.removed);
    }
    TemplateLibrary::load(&settings.templates_dir, settings)
}

fn run(
    adb: &Adb,
    settings: Settings,
    duration: Option<u64>,
    serials: Vec<String>,
    all: bool,
    module: Option<Module>,
    no_panel: bool,
) -> anyhow::Result<()> {
    let library = Arc::new(load_library(&settings)?);
    let slots = select_devices(adb, &settings, serials, all)?;

    let mut devices = vec![];
    for slot in slots {
        match AdbController::connect(adb, &slot.serial) {
            Ok(controller) => devices.push((slot, controller)),
            Err(err) => error!("skipping {}: {err}", slot.serial),
        }
    }
    if devices.is_empty() {
        bail!("failed to connect to any device");
    }

    let module = module.unwrap_or(settings.module);
    let minutes = duration.unwrap_or(settings.run_duration_min);
    let engine = Engine::start(
        devices,
        library,
        Arc::new(settings),
        EngineOptions::new(module, Duration::from_secs(minutes * 60)),
    )?;

    if !no_panel && io::stdin().is_terminal() {
        panel::run(&engine)?;
    } else {
        panel::wait(&engine);
    }

    let reports = engine.join()?;
    cprintln!("<bold>finished:</bold>");
    for report in &reports {
        cprintln!("  {}", report);
    }
    Ok(())
}

fn devices(adb: &Adb, settings: &Settings, restart: bool) -> anyhow::Result<()> {
    let devices = discover_devices(adb, settings, restart)?;
    if devices.is_empty() {
        cprintln!("<yellow>no device found</yellow>");
    } else {
        cprintln!("<bold>found {} devices:</bold>", devices.len());
        print_devices(&devices);
    }

    let store = DeviceStore::load(&settings.config_dir);
    let offline: Vec<_> = store
        .devices()
        .iter()
        .filter(|known| !devices.iter().any(|d| d.serial == known.serial))
        .collect();
    if !offline.is_empty() {
        cprintln!("<bold>known but not found:</bold>");
        for known in offline {
            cprintln!(
                "  <dim>{:<22} {} (last seen {})</dim>",
                known.serial,
                known.label,
                known.last_seen
            );
        }
    }
    Ok(())
}

fn templates(config: &Path, mut settings: Settings, save: bool) -> anyhow::Result<()> {
    let reconcile = Reconcile::scan(&settings.templates_dir, &settings)?;
    for name in &reconcile.added {
        cprintln!("  <green>+</green> {name}");
    }
    for name in &reconcile.removed {
        cprintln!("  <red>-</red> {name}");
    }
    if reconcile.is_empty() {
        cprintln!("settings and {:?} agree", settings.templates_dir);
    } else if save {
        reconcile.apply(&mut settings);
        settings.save(config)?;
        cprintln!("saved to {config:?}");
    }

    let library = TemplateLibrary::load(&settings.templates_dir, &settings)?;
    for template in library.buttons() {
        cprintln!(
            "  <cyan>{:<10}</cyan> {}x{} priority {} threshold {:.2}",
            template.name,
            template.width(),
            template.height(),
            template.priority,
            template.options.threshold()
        );
    }
    Ok(())
}

fn screenshot(
    adb: &Adb,
    settings: &Settings,
    device: Option<String>,
    output: PathBuf,
    annotated: bool,
) -> anyhow::Result<()> {
    let serial = match device {
        Some(serial) => serial,
        None => adb
            .devices()?
            .into_iter()
            .next()
            .map(|d| d.serial)
            .context("no device attached")?,
    };
    let controller = AdbController::connect(adb, &serial)?;
    let screen = controller.screencap_scaled()?;

    let image = if annotated {
        let library = load_library(settings)?;
        let screen = Screen::new(screen);
        let mut matches = detect_all(&screen, library.buttons())?;
        for name in [LOSE, NOTUPO] {
            if let Some(template) = library.indicator(name) {
                matches.extend(find_template(&screen, template)?);
            }
        }
        for m in &matches {
            cprintln!("  <cyan>{:<10}</cyan> {:.3} at {:?}", m.name, m.score, m.center);
        }
        annotate(&screen.image, &matches)
    } else {
        screen
    };
    image
        .save(&output)
        .with_context(|| format!("failed to save {output:?}"))?;
    cprintln!("saved to {output:?}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger();

    if let Commands::InitConfig { force } = cli.command {
        Settings::write_default(&cli.config, force)?;
        cprintln!("default settings written to {:?}", cli.config);
        return Ok(());
    }

    let mut settings = Settings::load(&cli.config)?;
    if let Some(adb) = cli.adb {
        settings.adb_path = adb;
    }
    let adb = Adb::new(&settings.adb_path);

    match cli.command {
        Commands::Run {
            duration,
            devices,
            all,
            module,
            no_panel,
        } => run(&adb, settings, duration, devices, all, module, no_panel),
        Commands::Devices { no_restart } => devices(&adb, &settings, !no_restart),
        Commands::Templates { save } => templates(&cli.config, settings, save),
        Commands::Screenshot {
            device,
            output,
            annotate,
        } => screenshot(&adb, &settings, device, output, annotate),
        Commands::InitConfig { .. } => Ok(()),
    }
}
