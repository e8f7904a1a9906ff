//! Capture GW - interactive console
//!
//! Drives a camera and a microphone manager against simulated hardware so the
//! device lifecycle (enable/disable, switching, filters, hot-plug) can be
//! exercised from a terminal.

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use capture_gw::config::{AppConfig, ConfigWatcher};
use capture_gw::sim::{self, SimulatedCall, SimulatedDevices};
use capture_gw::{
    CallSession, CameraManager, DeviceInfo, DeviceList, DeviceManager, DeviceStatus, DisableOptions,
    FilterHandle, TrackKind,
};
use crate::cli::{Command, Target};

/// Capture GW - camera and microphone lifecycle console
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Print the simulated devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting Capture GW...");

    let (config_watcher, config) = if Path::new(&args.config).exists() {
        let (watcher, config) = ConfigWatcher::new(args.config.clone()).await?;
        info!("Configuration loaded from {} with hot-reload enabled", args.config);
        (Some(watcher), (*config).clone())
    } else {
        warn!("⚠️  {} not found, using built-in defaults", args.config);
        (None, AppConfig::default())
    };

    let mut app = App::new(&config);

    if args.list_devices {
        print_devices(&app.sim.devices());
        return Ok(());
    }

    if config.camera.start_enabled {
        app.camera.enable().await.context("Failed to enable camera on startup")?;
    }
    if config.microphone.start_enabled {
        app.microphone.enable().await.context("Failed to enable microphone on startup")?;
    }

    println!("{}", "Type 'help' for commands".dimmed());
    let (tx, rx) = mpsc::channel(32);
    let repl = cli::spawn_repl(tx);

    run_app(&mut app, rx, config_watcher).await?;

    info!("Shutting down...");
    app.shutdown().await;
    info!("Capture GW shutdown complete");

    // A blocking readline cannot be interrupted; don't let it hold the runtime open
    if !repl.is_finished() {
        std::process::exit(0);
    }
    Ok(())
}

async fn run_app(
    app: &mut App,
    mut commands: mpsc::Receiver<Command>,
    mut config_watcher: Option<ConfigWatcher>,
) -> Result<()> {
    let mut camera_status = app.camera.subscribe_status();
    let mut microphone_status = app.microphone.subscribe_status();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if command == Command::Quit {
                    break;
                }
                if let Err(e) = app.handle(command).await {
                    println!("{} {:#}", "✗".red().bold(), e);
                }
            }

            Ok(()) = camera_status.changed() => {
                let status = *camera_status.borrow_and_update();
                println!("📷 camera {}", paint(status));
            }

            Ok(()) = microphone_status.changed() => {
                let status = *microphone_status.borrow_and_update();
                println!("🎙️ microphone {}", paint(status));
            }

            Some(new_config) = next_config(&mut config_watcher) => {
                info!("📝 Configuration file changed, applying default constraints");
                app.camera.set_default_constraints(new_config.camera.default_constraints);
                app.microphone.set_default_constraints(new_config.microphone.default_constraints);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    Ok(())
}

/// Pending forever when running without a config file
async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

struct App {
    sim: Arc<SimulatedDevices>,
    call: Arc<SimulatedCall>,
    camera: CameraManager,
    microphone: DeviceManager,
    filters: HashMap<(Target, String), FilterHandle>,
    replugs: usize,
}

impl App {
    fn new(config: &AppConfig) -> Self {
        let sim = SimulatedDevices::new(config.simulation.devices.clone());
        sim.set_acquire_delay(Duration::from_millis(config.simulation.acquire_delay_ms));
        let call = SimulatedCall::new(config.simulation.joined);
        let devices = DeviceList::new(sim.clone());

        let camera = CameraManager::new(
            sim.clone(),
            call.clone(),
            devices.clone(),
            config.camera.to_settings(),
        );
        let microphone = DeviceManager::new(
            TrackKind::Audio,
            sim.clone(),
            call.clone(),
            devices,
            config.microphone.to_settings(),
        );

        Self {
            sim,
            call,
            camera,
            microphone,
            filters: HashMap::new(),
            replugs: 0,
        }
    }

    fn manager(&self, target: Target) -> &DeviceManager {
        match target {
            Target::Camera => self.camera.manager(),
            Target::Microphone => &self.microphone,
        }
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Enable(target) => self.manager(target).enable().await?,
            Command::Disable { target, force } => {
                let options = if force {
                    DisableOptions::force_stop()
                } else {
                    DisableOptions::default()
                };
                self.manager(target).disable(options).await?
            }
            Command::Toggle(target) => self.manager(target).toggle().await?,
            Command::Resume(target) => self.manager(target).resume().await?,
            Command::Select { target, device_id } => self.manager(target).select(device_id).await?,
            Command::Flip => self.camera.flip().await?,
            Command::Resolution { width, height } => {
                self.camera.select_target_resolution(width, height).await?
            }
            Command::AddFilter { target, name } => {
                let key = (target, name);
                if self.filters.contains_key(&key) {
                    bail!("Filter '{}' is already registered", key.1);
                }
                let filter = sim::mirror_filter(&key.1, Arc::new(AtomicUsize::new(0)));
                let registration = self.manager(target).register_filter(filter);
                self.filters.insert(key, registration.handle);
                registration.registered.await?
            }
            Command::RemoveFilter { target, name } => {
                let Some(handle) = self.filters.remove(&(target, name.clone())) else {
                    bail!("No filter named '{}'", name);
                };
                handle.unregister().await?
            }
            Command::Unplug(device_id) => {
                if !self.sim.unplug(&device_id) {
                    bail!("Unknown device '{}'", device_id);
                }
            }
            Command::Replug(device_id) => {
                self.replugs += 1;
                let group_id = format!("replug-{}", self.replugs);
                if !self.sim.replug(&device_id, &group_id) {
                    bail!("Unknown device '{}'", device_id);
                }
            }
            Command::EndTrack(device_id) => self.sim.end_tracks(&device_id),
            Command::Status => self.print_status(),
            Command::Devices => print_devices(&self.sim.devices()),
            Command::Help => println!("{}", cli::HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    fn print_status(&self) {
        for (label, manager) in [("camera", self.camera.manager()), ("microphone", &self.microphone)] {
            let state = manager.state();
            let device = state.selected_device().unwrap_or_else(|| "-".to_string());
            let tracks = state.media_stream().map(|s| s.tracks().len()).unwrap_or(0);
            println!(
                "  {:<11} {:<9} device={} tracks={}",
                label.bold(),
                paint(state.status()),
                device.cyan(),
                tracks
            );
        }
        if let Some(direction) = self.camera.direction() {
            println!("  camera direction: {:?}", direction);
        }
        let resolution = self.camera.target_resolution();
        println!("  camera target: {}x{}", resolution.width, resolution.height);
        println!(
            "  call: joined={} published={}",
            self.call.is_joined(),
            self.call.publishes()
        );
    }

    async fn shutdown(&self) {
        for manager in [self.camera.manager(), &self.microphone] {
            if let Err(e) = manager.disable(DisableOptions::force_stop()).await {
                warn!("Failed to release {} device: {}", manager.kind(), e);
            }
            manager.dispose();
        }
    }
}

fn paint(status: DeviceStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        DeviceStatus::Enabled => text.green().bold(),
        DeviceStatus::Disabled => text.red(),
        DeviceStatus::Unset => text.dimmed(),
    }
}

fn print_devices(devices: &[DeviceInfo]) {
    println!("\n{}", "=== Devices ===".bold().cyan());
    for device in devices {
        println!(
            "  {:<12} {:<16} group={} {}",
            device.kind.to_string().yellow(),
            device.device_id.green(),
            device.group_id,
            device.label.dimmed()
        );
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}
