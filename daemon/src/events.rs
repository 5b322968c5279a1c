// Consumes the device events produced by the client worker. This is where a field decoder or
// sensor layer would sit, for now events are either summarised in the log, or written out as
// JSON lines for something else to pick up.

use log::{debug, info, warn};
use std::io::Write;
use tokio::sync::mpsc::Receiver;
use ups_hid_types::{DeviceEvent, ReportChange};
use ups_hid_usb::report_descriptor::hex_string;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventOutput {
    Log,
    Json,
}

/// Runs until the worker drops its sender, so events produced while shutting down still land.
pub async fn handle_events(mut rx: Receiver<DeviceEvent>, output: EventOutput) {
    debug!("Starting Event Loop..");
    while let Some(event) = rx.recv().await {
        match output {
            EventOutput::Log => log_event(&event),
            EventOutput::Json => write_json(&event),
        }
    }
    debug!("Event Loop finished");
}

fn log_event(event: &DeviceEvent) {
    match event {
        DeviceEvent::Attached { .. } | DeviceEvent::Detached { .. } => {
            info!("{}", describe(event))
        }
        _ => debug!("{}", describe(event)),
    }
}

fn write_json(event: &DeviceEvent) {
    match serde_json::to_string(event) {
        Ok(line) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{line}").and_then(|_| stdout.flush()) {
                warn!("Unable to write event: {}", e);
            }
        }
        Err(e) => warn!("Unable to serialise event: {}", e),
    }
}

/// A one line summary of an event.
pub fn describe(event: &DeviceEvent) -> String {
    match event {
        DeviceEvent::Attached { address, interface } => {
            format!("[{}] Attached, {}", address, interface)
        }
        DeviceEvent::ReportDescriptor {
            interface_number,
            descriptor,
            declared_report_ids,
        } => format!(
            "IF={} Report Descriptor, {} bytes, IDs {:02X?}",
            interface_number,
            descriptor.len(),
            declared_report_ids
        ),
        DeviceEvent::Report(report) => {
            let change = match &report.change {
                None => "unchanged".to_string(),
                Some(ReportChange::Baseline) => "baseline".to_string(),
                Some(ReportChange::Changed { bytes, length }) => match length {
                    Some(length) => format!(
                        "{} bytes changed, length {} -> {}",
                        bytes.len(),
                        length.previous,
                        length.current
                    ),
                    None => format!("{} bytes changed", bytes.len()),
                },
            };
            format!(
                "Report 0x{:02X} ({} bytes, {}): {}",
                report.report_id,
                report.length,
                change,
                hex_string(&report.payload)
            )
        }
        DeviceEvent::Detached { address } => format!("[{}] Detached", address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ups_hid_types::{ByteChange, HidInterfaceInfo, LengthChange, ReportEvent, UsbAddress};

    #[test]
    fn describes_attach_and_detach() {
        let address = UsbAddress::new(1, 12);
        let interface = HidInterfaceInfo {
            interface_number: 0,
            endpoint_address: 0x81,
            max_packet_size: 8,
            poll_interval_hint: 10,
            report_descriptor_length: 0x1C,
        };

        assert_eq!(
            describe(&DeviceEvent::Attached { address, interface }),
            "[001:012] Attached, IF=0 EP=0x81 MPS=8 interval=10ms"
        );
        assert_eq!(
            describe(&DeviceEvent::Detached { address }),
            "[001:012] Detached"
        );
    }

    #[test]
    fn describes_reports() {
        let mut report = ReportEvent {
            report_id: 0x64,
            length: 3,
            payload: vec![0x64, 0x0A, 0xFF],
            change: Some(ReportChange::Baseline),
        };
        assert_eq!(
            describe(&DeviceEvent::Report(report.clone())),
            "Report 0x64 (3 bytes, baseline): 64 0A FF"
        );

        report.change = Some(ReportChange::Changed {
            bytes: vec![ByteChange {
                offset: 2,
                old: 0xFE,
                new: 0xFF,
            }],
            length: Some(LengthChange {
                previous: 4,
                current: 3,
            }),
        });
        assert_eq!(
            describe(&DeviceEvent::Report(report.clone())),
            "Report 0x64 (3 bytes, 1 bytes changed, length 4 -> 3): 64 0A FF"
        );

        report.change = None;
        assert_eq!(
            describe(&DeviceEvent::Report(report)),
            "Report 0x64 (3 bytes, unchanged): 64 0A FF"
        );
    }

    #[test]
    fn events_serialise_as_json() {
        let event = DeviceEvent::Detached {
            address: UsbAddress::new(2, 3),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["Detached"]["address"]["bus_number"], 2);
        assert_eq!(json["Detached"]["address"]["address"], 3);
    }
}
