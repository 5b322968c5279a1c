use crate::descriptor::{CLASS_HID, HID_PROTOCOL_KEYBOARD, HID_PROTOCOL_MOUSE, HID_SUBCLASS_BOOT};
use crate::device::base::{DeviceNotification, HostLibrary, NotificationSender};
use crate::error::DriverError;
use log::{debug, info, warn};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::sleep;
use std::time::Duration;
use ups_hid_types::UsbAddress;

/// Which devices we're interested in. With no IDs set, anything with a non-boot HID interface
/// in its active configuration will do.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn has_ids(&self) -> bool {
        self.vendor_id.is_some() || self.product_id.is_some()
    }

    pub fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.map_or(true, |vid| vid == vendor_id)
            && self.product_id.map_or(true, |pid| pid == product_id)
    }

    pub fn matches<T: UsbContext>(&self, device: &Device<T>) -> bool {
        if self.has_ids() {
            return match device.device_descriptor() {
                Ok(descriptor) => {
                    self.matches_ids(descriptor.vendor_id(), descriptor.product_id())
                }
                Err(_) => false,
            };
        }
        has_candidate_interface(device)
    }
}

/// Whether an interface could belong to a UPS. Keyboards and mice show up as boot interfaces,
/// claiming one would take it away from the kernel's HID driver.
pub fn is_candidate_interface(class: u8, sub_class: u8, protocol: u8) -> bool {
    class == CLASS_HID
        && sub_class != HID_SUBCLASS_BOOT
        && protocol != HID_PROTOCOL_KEYBOARD
        && protocol != HID_PROTOCOL_MOUSE
}

// Reads libusb's cached copy of the active configuration, no bus traffic involved.
fn has_candidate_interface<T: UsbContext>(device: &Device<T>) -> bool {
    let Ok(config) = device.active_config_descriptor() else {
        return false;
    };
    config.interfaces().any(|interface| {
        interface.descriptors().any(|descriptor| {
            is_candidate_interface(
                descriptor.class_code(),
                descriptor.sub_class_code(),
                descriptor.protocol_code(),
            )
        })
    })
}

/// Follows the one device we've announced, so that only its departure produces a detach.
///
/// Notifications the client worker has no room for are held here, in order, and go out on the
/// next [`AttachTracker::flush`].
pub struct AttachTracker {
    sender: NotificationSender,
    current: Option<UsbAddress>,
    pending: VecDeque<DeviceNotification>,
}

impl AttachTracker {
    pub fn new(sender: NotificationSender) -> Self {
        Self {
            sender,
            current: None,
            pending: VecDeque::new(),
        }
    }

    pub fn current(&self) -> Option<UsbAddress> {
        self.current
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn arrived(&mut self, address: UsbAddress) {
        if let Some(current) = self.current {
            debug!(
                "Ignoring device at {}, already following {}",
                address, current
            );
            return;
        }

        info!("Matching device arrived at {}", address);
        self.current = Some(address);
        self.queue(DeviceNotification::Attached(address));
    }

    pub fn left(&mut self, address: UsbAddress) {
        if self.current != Some(address) {
            return;
        }

        info!("Device at {} left", address);
        self.current = None;

        // The worker never saw this arrival, so it has nothing to tear down
        if self.pending.back() == Some(&DeviceNotification::Attached(address)) {
            self.pending.pop_back();
            return;
        }
        self.queue(DeviceNotification::Detached);
    }

    /// Sends whatever is being held, oldest first, stopping if the queue fills again.
    pub fn flush(&mut self) {
        while let Some(notification) = self.pending.front().copied() {
            match self.sender.notify(notification) {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(DriverError::QueueFull) => return,
                Err(e) => {
                    warn!("Unable to deliver {:?}: {}", notification, e);
                    self.pending.clear();
                    return;
                }
            }
        }
    }

    fn queue(&mut self, notification: DeviceNotification) {
        self.pending.push_back(notification);
        self.flush();
        if !self.pending.is_empty() {
            warn!(
                "Notification queue full, holding {} until the worker catches up",
                self.pending.len()
            );
        }
    }
}

fn address_of<T: UsbContext>(device: &Device<T>) -> UsbAddress {
    UsbAddress::new(device.bus_number(), device.address())
}

fn lock(tracker: &Mutex<AttachTracker>) -> MutexGuard<'_, AttachTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HotplugHandler {
    filter: DeviceFilter,
    tracker: Arc<Mutex<AttachTracker>>,
}

// Runs inside libusb's event handling, so this only looks at cached descriptors and queues
// a notification.
impl Hotplug<Context> for HotplugHandler {
    fn device_arrived(&mut self, device: Device<Context>) {
        if self.filter.matches(&device) {
            lock(&self.tracker).arrived(address_of(&device));
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        lock(&self.tracker).left(address_of(&device));
    }
}

/// The library half of the libusb backend, pumped from the host thread. Attach and detach
/// come from hotplug callbacks where libusb supports them, otherwise from re-enumerating the
/// bus each time it's pumped.
pub struct LibUsbHost {
    context: Context,
    filter: DeviceFilter,
    tracker: Arc<Mutex<AttachTracker>>,

    // Keeps the hotplug callback registered, None when enumerating instead
    registration: Option<Registration<Context>>,
}

impl LibUsbHost {
    pub fn new(
        context: Context,
        filter: DeviceFilter,
        sender: NotificationSender,
    ) -> Result<Self, DriverError> {
        let tracker = Arc::new(Mutex::new(AttachTracker::new(sender)));

        let registration = if rusb::has_hotplug() {
            let mut builder = HotplugBuilder::new();
            builder.enumerate(true);
            if let Some(vendor_id) = filter.vendor_id {
                builder.vendor_id(vendor_id);
            }
            if let Some(product_id) = filter.product_id {
                builder.product_id(product_id);
            }

            let handler: Box<dyn Hotplug<Context>> = Box::new(HotplugHandler {
                filter,
                tracker: tracker.clone(),
            });
            let registration = builder.register(context.clone(), handler)?;
            debug!("Registered libusb hotplug callback");
            Some(registration)
        } else {
            info!("libusb hotplug not supported here, enumerating the bus instead");
            None
        };

        Ok(Self {
            context,
            filter,
            tracker,
            registration,
        })
    }

    fn enumerate(&self) -> Result<(), DriverError> {
        let devices = self.context.devices()?;
        let present: Vec<UsbAddress> = devices
            .iter()
            .filter(|device| self.filter.matches(device))
            .map(|device| address_of(&device))
            .collect();

        let mut tracker = lock(&self.tracker);
        if let Some(current) = tracker.current() {
            if !present.contains(&current) {
                tracker.left(current);
            }
        }
        if tracker.current().is_none() {
            if let Some(address) = present.first() {
                tracker.arrived(*address);
            }
        }
        Ok(())
    }
}

impl HostLibrary for LibUsbHost {
    fn pump_library_events(&mut self, timeout: Duration) -> Result<(), DriverError> {
        lock(&self.tracker).flush();

        match &self.registration {
            Some(_) => {
                self.context.handle_events(Some(timeout))?;
            }
            None => {
                self.enumerate()?;
                sleep(timeout);
            }
        }
        Ok(())
    }
}
