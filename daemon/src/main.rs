use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};
use tokio::sync::mpsc;
use tokio::{join, signal};
use ups_hid_usb::device::libusb::{LibUsbDriver, LibUsbHost};
use ups_hid_usb::device::notification_channel;
use ups_hid_usb::rusb;
use ups_hid_usb::session::SessionMonitor;

use crate::cli::{Cli, LevelFilter};
use crate::events::{handle_events, EventOutput};
use crate::host_pump::spawn_host_pump;
use crate::primary_worker::run_client_worker;
use crate::settings::Settings;
use crate::shutdown::Shutdown;

mod cli;
mod events;
mod host_pump;
mod primary_worker;
mod settings;
mod shutdown;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// Attach / Detach only, this never needs to be deep
const NOTIFICATION_QUEUE: usize = 8;
const EVENT_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        match args.log_level {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        },
        Config::default(),
        // With --json, stdout belongs to the events
        if args.json {
            TerminalMode::Stderr
        } else {
            TerminalMode::Mixed
        },
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;

    info!("Starting UPS HID Daemon v{}", VERSION);
    let settings = Settings::load(&args.config)?;

    let mut shutdown = Shutdown::new();

    let context = rusb::Context::new().context("Unable to initialise libusb")?;

    // Host side, the pump thread delivers attach / detach into this channel..
    let (notification_tx, notification_rx) = notification_channel(NOTIFICATION_QUEUE);
    let host = LibUsbHost::new(context.clone(), settings.device_filter(), notification_tx)
        .context("Unable to watch for USB devices")?;
    let pump_handle =
        spawn_host_pump(host, shutdown.clone()).context("Unable to start the USB host thread")?;

    // ..and the client worker takes them from there.
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let monitor = SessionMonitor::new(LibUsbDriver::new(context), settings.monitor_settings());
    let worker_handle = tokio::spawn(run_client_worker(
        monitor,
        notification_rx,
        event_tx,
        settings.poll_interval(),
        shutdown.clone(),
    ));

    let output = if args.json {
        EventOutput::Json
    } else {
        EventOutput::Log
    };
    let event_handle = tokio::spawn(handle_events(event_rx, output));

    tokio::spawn(await_ctrl_c(shutdown.clone()));

    shutdown.recv().await;
    info!("Shutting down daemon");

    let pump_join = tokio::task::spawn_blocking(move || pump_handle.join());
    let (worker, events, pump) = join!(worker_handle, event_handle, pump_join);
    if worker.is_err() || events.is_err() {
        warn!("A daemon task ended abnormally during shutdown");
    }
    if !matches!(pump, Ok(Ok(()))) {
        warn!("The USB host thread ended abnormally");
    }

    Ok(())
}

async fn await_ctrl_c(shutdown: Shutdown) {
    if signal::ctrl_c().await.is_ok() {
        shutdown.trigger();
    }
}
