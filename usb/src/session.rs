use crate::changes::ChangeDetector;
use crate::control::ControlEngine;
use crate::descriptor::DescriptorReader;
use crate::device::{DeviceNotification, HandleId, HostDriver};
use crate::error::ProbeError;
use crate::poller::{ReportPoller, DEFAULT_REPORT_IDS, DEFAULT_REPORT_LENGTH};
use crate::report_descriptor::{declared_report_ids, hex_lines, hex_string};
use log::{debug, info, trace, warn};
use std::time::Duration;
use strum::Display;
use ups_hid_types::{
    DeviceEvent, HidInterfaceInfo, ReportChange, ReportEvent, ReportType, UsbAddress,
};

pub const DEFAULT_REPORT_DESCRIPTOR_LENGTH: u16 = 512;

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Probing,
    Ready,

    /// Attached and open, but the probe failed. Stays here until the device is detached.
    Unresolved,
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub report_ids: Vec<u8>,
    pub report_type: ReportType,
    pub derive_report_ids: bool,
    pub fetch_report_descriptor: bool,
    pub report_descriptor_length: u16,
    pub report_length: u16,
    pub descriptor_timeout: Duration,
    pub report_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            report_ids: DEFAULT_REPORT_IDS.to_vec(),
            report_type: ReportType::Input,
            derive_report_ids: false,
            fetch_report_descriptor: true,
            report_descriptor_length: DEFAULT_REPORT_DESCRIPTOR_LENGTH,
            report_length: DEFAULT_REPORT_LENGTH,
            descriptor_timeout: Duration::from_millis(2000),
            report_timeout: Duration::from_millis(300),
        }
    }
}

// Everything tied to one attach, dropped as a whole on detach.
struct DeviceSession {
    address: UsbAddress,
    handle: HandleId,
    interface: Option<HidInterfaceInfo>,
    poller: Option<ReportPoller>,
    polling_suspended: bool,
}

/// Owns the device session, and drives the probe and polling for it. This lives entirely on the
/// client worker, notifications reach it as messages and nothing else touches its state.
pub struct SessionMonitor<D: HostDriver> {
    engine: ControlEngine<D>,
    settings: MonitorSettings,

    state: SessionState,
    session: Option<DeviceSession>,
    changes: ChangeDetector,
}

impl<D: HostDriver> SessionMonitor<D> {
    pub fn new(driver: D, settings: MonitorSettings) -> Self {
        Self {
            engine: ControlEngine::new(driver),
            settings,
            state: SessionState::Idle,
            session: None,
            changes: ChangeDetector::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> Option<UsbAddress> {
        self.session.as_ref().map(|session| session.address)
    }

    pub fn interface(&self) -> Option<HidInterfaceInfo> {
        self.session.as_ref().and_then(|session| session.interface)
    }

    /// The report IDs being polled this session, if polling is set up.
    pub fn report_ids(&self) -> Option<&[u8]> {
        self.session
            .as_ref()
            .and_then(|session| session.poller.as_ref())
            .map(|poller| poller.report_ids())
    }

    pub fn has_baseline(&self, report_id: u8) -> bool {
        self.changes.has_baseline(report_id)
    }

    pub fn is_polling(&self) -> bool {
        self.state == SessionState::Ready
            && self
                .session
                .as_ref()
                .is_some_and(|session| !session.polling_suspended)
    }

    pub fn driver(&self) -> &D {
        self.engine.driver()
    }

    pub fn handle_notification(&mut self, notification: DeviceNotification) -> Vec<DeviceEvent> {
        match notification {
            DeviceNotification::Attached(address) => self.attach(address),
            DeviceNotification::Detached => self.detach(),
        }
    }

    pub fn attach(&mut self, address: UsbAddress) -> Vec<DeviceEvent> {
        let mut events = Vec::new();

        if let Some(previous) = self.address() {
            warn!(
                "Device {} attached while {} is still open, closing the old session",
                address, previous
            );
            events.extend(self.detach());
        }

        info!("Device attached at {}, opening..", address);
        self.state = SessionState::Opening;
        let handle = match self.engine.driver_mut().open_device(address) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Unable to open device {}: {}", address, e);
                self.state = SessionState::Idle;
                return events;
            }
        };

        self.state = SessionState::Probing;
        self.session = Some(DeviceSession {
            address,
            handle,
            interface: None,
            poller: None,
            polling_suspended: false,
        });

        let reader = DescriptorReader::new(self.settings.descriptor_timeout);
        let interface = match reader.probe(&mut self.engine, handle) {
            Ok(interface) => interface,
            Err(e) => {
                log_probe_failure(address, &e);
                self.state = SessionState::Unresolved;
                return events;
            }
        };

        info!("HID device ready on {}: {}", address, interface);
        if interface.report_descriptor_length > 0 {
            debug!(
                "Report descriptor length: {} bytes",
                interface.report_descriptor_length
            );
        }

        if let Err(e) = self
            .engine
            .driver_mut()
            .claim_interface(handle, interface.interface_number)
        {
            warn!(
                "Unable to claim interface {}, continuing anyway: {}",
                interface.interface_number, e
            );
        }

        events.push(DeviceEvent::Attached { address, interface });

        let mut poller = ReportPoller::new(
            self.settings.report_ids.clone(),
            self.settings.report_type,
            self.settings.report_length,
            self.settings.report_timeout,
        );

        if self.settings.fetch_report_descriptor {
            if let Ok(descriptor) = reader.fetch_report_descriptor(
                &mut self.engine,
                handle,
                interface.interface_number,
                interface.report_descriptor_length,
                self.settings.report_descriptor_length,
            ) {
                let declared = declared_report_ids(&descriptor, self.settings.report_type);
                info!(
                    "Report descriptor ({} bytes), declared {} report IDs: {:02X?}",
                    descriptor.len(),
                    self.settings.report_type,
                    declared
                );
                for line in hex_lines(&descriptor) {
                    debug!("  {}", line);
                }

                if self.settings.derive_report_ids {
                    if declared.is_empty() {
                        warn!("Report descriptor declares no report IDs, keeping the configured set");
                    } else {
                        poller.set_report_ids(declared.clone());
                    }
                }

                events.push(DeviceEvent::ReportDescriptor {
                    interface_number: interface.interface_number,
                    descriptor,
                    declared_report_ids: declared,
                });
            }
        }

        info!(
            "Polling {} reports {:02X?}",
            poller.report_type(),
            poller.report_ids()
        );
        if let Some(session) = self.session.as_mut() {
            session.interface = Some(interface);
            session.poller = Some(poller);
        }
        self.state = SessionState::Ready;
        events
    }

    pub fn detach(&mut self) -> Vec<DeviceEvent> {
        let previous = self.state;
        self.state = SessionState::Idle;
        self.changes.clear();

        let Some(session) = self.session.take() else {
            debug!("Detach received with no open device");
            return vec![];
        };

        info!("Device {} detached (was {})", session.address, previous);
        self.engine.driver_mut().close_device(session.handle);
        vec![DeviceEvent::Detached {
            address: session.address,
        }]
    }

    /// Runs one polling cycle, if there's a ready session to poll.
    pub fn poll(&mut self) -> Vec<DeviceEvent> {
        if self.state != SessionState::Ready {
            return vec![];
        }
        let Some(session) = self.session.as_mut() else {
            return vec![];
        };
        if session.polling_suspended {
            return vec![];
        }
        let (Some(poller), Some(interface)) = (&session.poller, &session.interface) else {
            return vec![];
        };

        let cycle = poller.poll(&mut self.engine, session.handle, interface.interface_number);
        if cycle.device_gone {
            session.polling_suspended = true;
        }

        let mut events = Vec::with_capacity(cycle.reports.len());
        for (report_id, payload) in cycle.reports {
            let change = self.changes.observe(report_id, &payload);
            log_change(report_id, &payload, change.as_ref());

            events.push(DeviceEvent::Report(ReportEvent {
                report_id,
                length: payload.len(),
                payload,
                change,
            }));
        }
        events
    }

    /// Closes any open session, used on shutdown.
    pub fn close(&mut self) -> Vec<DeviceEvent> {
        if self.session.is_some() {
            debug!("Closing open session");
        }
        self.detach()
    }
}

fn log_probe_failure(address: UsbAddress, error: &ProbeError) {
    match error {
        ProbeError::Transfer { stage, source } => {
            warn!("Probe of {} failed reading the {}: {}", address, stage, source)
        }
        ProbeError::InterfaceNotFound | ProbeError::EndpointNotFound(_) => {
            warn!("Device {} is not usable: {}", address, error)
        }
        _ => warn!("Device {} returned a bad descriptor: {}", address, error),
    }
    warn!("Device {} will not be polled until it is re-attached", address);
}

fn log_change(report_id: u8, payload: &[u8], change: Option<&ReportChange>) {
    match change {
        None => trace!("Report 0x{:02X} unchanged", report_id),
        Some(ReportChange::Baseline) => info!(
            "Report 0x{:02X} ({} bytes): {}",
            report_id,
            payload.len(),
            hex_string(payload)
        ),
        Some(ReportChange::Changed { bytes, length }) => {
            info!("Report 0x{:02X} changed: {}", report_id, hex_string(payload));
            for byte in bytes {
                info!(
                    "  [{}] 0x{:02X} -> 0x{:02X}",
                    byte.offset, byte.old, byte.new
                );
            }
            if let Some(length) = length {
                info!("  length {} -> {}", length.previous, length.current);
            }
        }
    }
}
