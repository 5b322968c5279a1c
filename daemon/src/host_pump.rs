use crate::shutdown::Shutdown;
use log::{debug, warn};
use std::io;
use std::thread::{self, sleep, JoinHandle};
use std::time::Duration;
use ups_hid_usb::device::HostLibrary;

const PUMP_SLICE: Duration = Duration::from_secs(1);

// Backoff after a failed pump, so a broken host controller doesn't spin the thread
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Starts the host controller's library pump on its own thread. Attach and detach callbacks
/// are dispatched from here, it stops at the end of the slice in which shutdown is triggered.
pub fn spawn_host_pump<L: HostLibrary + 'static>(
    library: L,
    shutdown: Shutdown,
) -> io::Result<JoinHandle<()>> {
    spawn_with_slice(library, shutdown, PUMP_SLICE)
}

fn spawn_with_slice<L: HostLibrary + 'static>(
    mut library: L,
    shutdown: Shutdown,
    slice: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("usb-host".to_string())
        .spawn(move || {
            debug!("USB host pump started");
            while !shutdown.is_triggered() {
                if let Err(e) = library.pump_library_events(slice) {
                    warn!("Error pumping USB host events: {}", e);
                    sleep(ERROR_BACKOFF);
                }
            }
            debug!("USB host pump stopped");
        })
}
