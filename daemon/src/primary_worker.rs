use crate::shutdown::Shutdown;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::block_in_place;
use tokio::time::{sleep, Instant};
use ups_hid_types::DeviceEvent;
use ups_hid_usb::device::{DeviceNotification, HostDriver};
use ups_hid_usb::session::SessionMonitor;

/// The client worker. Owns the session monitor, and is the only thing which ever touches it.
///
/// USB work is synchronous and bounded by the configured timeouts, so it runs in place on this
/// worker thread rather than stalling the rest of the runtime.
pub async fn run_client_worker<D: HostDriver>(
    mut monitor: SessionMonitor<D>,
    mut notifications: Receiver<DeviceNotification>,
    event_tx: Sender<DeviceEvent>,
    poll_interval: Duration,
    mut shutdown: Shutdown,
) {
    let poll_sleep = sleep(poll_interval);
    tokio::pin!(poll_sleep);

    let mut notifications_open = true;

    loop {
        let events = tokio::select! {
            () = shutdown.recv() => {
                info!("Shutting down client worker");
                let events = block_in_place(|| monitor.close());
                send_events(&event_tx, events).await;
                return;
            },
            notification = notifications.recv(), if notifications_open => {
                match notification {
                    Some(notification) => {
                        debug!("Handling {:?}", notification);
                        let events = block_in_place(|| monitor.handle_notification(notification));

                        // A fresh session gets a full interval before its first poll
                        poll_sleep.as_mut().reset(Instant::now() + poll_interval);
                        events
                    }
                    None => {
                        warn!("Device notifications have stopped, no further attach or detach will be seen");
                        notifications_open = false;
                        vec![]
                    }
                }
            },
            () = &mut poll_sleep => {
                let events = block_in_place(|| monitor.poll());
                poll_sleep.as_mut().reset(Instant::now() + poll_interval);
                events
            }
        };

        send_events(&event_tx, events).await;
    }
}

async fn send_events(event_tx: &Sender<DeviceEvent>, events: Vec<DeviceEvent>) {
    for event in events {
        if event_tx.send(event).await.is_err() {
            debug!("Event consumer has gone away, dropping events");
            return;
        }
    }
}
