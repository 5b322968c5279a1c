use crate::control::{
    ControlEngine, ControlRequest, RECIPIENT_INTERFACE, REQUEST_DIRECTION_IN, REQUEST_TYPE_CLASS,
};
use crate::device::{HandleId, HostDriver};
use crate::error::TransferError;
use crate::report_descriptor::hex_string;
use log::{debug, info, trace, warn};
use std::time::Duration;
use ups_hid_types::ReportType;

// HID class requests
pub const HID_REQUEST_GET_REPORT: u8 = 0x01;

pub const DEFAULT_REPORT_IDS: [u8; 3] = [0x01, 0x64, 0x66];
pub const DEFAULT_REPORT_LENGTH: u16 = 64;

/// Builds a HID GET_REPORT request for a report on an interface.
pub fn get_report_request(
    report_type: ReportType,
    report_id: u8,
    interface_number: u8,
    length: u16,
) -> ControlRequest {
    ControlRequest {
        request_type: REQUEST_DIRECTION_IN | REQUEST_TYPE_CLASS | RECIPIENT_INTERFACE,
        request: HID_REQUEST_GET_REPORT,
        value: ((report_type.id() as u16) << 8) | report_id as u16,
        index: interface_number as u16,
        length,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollCycle {
    /// Successful reads, in the order they were requested.
    pub reports: Vec<(u8, Vec<u8>)>,

    /// Set when the device vanished part way through, nothing more should be requested.
    pub device_gone: bool,
}

/// Requests each configured report in turn, once per cycle.
#[derive(Clone, Debug)]
pub struct ReportPoller {
    report_ids: Vec<u8>,
    report_type: ReportType,
    report_length: u16,
    timeout: Duration,
}

impl ReportPoller {
    pub fn new(
        report_ids: Vec<u8>,
        report_type: ReportType,
        report_length: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            report_ids,
            report_type,
            report_length,
            timeout,
        }
    }

    pub fn report_ids(&self) -> &[u8] {
        &self.report_ids
    }

    pub fn report_type(&self) -> ReportType {
        self.report_type
    }

    pub fn set_report_ids(&mut self, report_ids: Vec<u8>) {
        self.report_ids = report_ids;
    }

    /// Runs one polling cycle. Individual failures are logged and skipped, only a device which
    /// has gone away stops the cycle early.
    pub fn poll<D: HostDriver>(
        &self,
        engine: &mut ControlEngine<D>,
        handle: HandleId,
        interface_number: u8,
    ) -> PollCycle {
        let mut cycle = PollCycle::default();

        for &report_id in &self.report_ids {
            let request = get_report_request(
                self.report_type,
                report_id,
                interface_number,
                self.report_length,
            );

            match engine.submit(handle, &request, self.timeout) {
                Ok(response) => {
                    if response.payload.is_empty() {
                        debug!("GET_REPORT id=0x{:02X} returned no data", report_id);
                        continue;
                    }
                    trace!(
                        "GET_REPORT id=0x{:02X} len={} data={}",
                        report_id,
                        response.payload.len(),
                        hex_string(&response.payload)
                    );
                    cycle.reports.push((report_id, response.payload));
                }
                Err(TransferError::DeviceGone) => {
                    info!(
                        "Device gone while reading report 0x{:02X}, polling stopped",
                        report_id
                    );
                    cycle.device_gone = true;
                    break;
                }
                Err(TransferError::TimedOut) => {
                    debug!("GET_REPORT id=0x{:02X} timed out", report_id);
                }
                Err(TransferError::Stalled) => {
                    warn!(
                        "GET_REPORT id=0x{:02X} stalled, the device doesn't support this report",
                        report_id
                    );
                }
                Err(e) => {
                    warn!("GET_REPORT id=0x{:02X} failed: {}", report_id, e);
                }
            }
        }

        cycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedDevice, ScriptedDriver};
    use ups_hid_types::UsbAddress;

    const ADDRESS: UsbAddress = UsbAddress {
        bus_number: 1,
        address: 7,
    };

    fn engine_with(device: ScriptedDevice) -> (ControlEngine<ScriptedDriver>, HandleId) {
        let driver = ScriptedDriver::new();
        driver.script().insert_device(ADDRESS, device);
        let mut engine = ControlEngine::new(driver);
        let handle = engine.driver_mut().open_device(ADDRESS).unwrap();
        (engine, handle)
    }

    fn poller() -> ReportPoller {
        ReportPoller::new(
            DEFAULT_REPORT_IDS.to_vec(),
            ReportType::Input,
            DEFAULT_REPORT_LENGTH,
            Duration::from_millis(30),
        )
    }

    #[test]
    fn get_report_encoding() {
        let request = get_report_request(ReportType::Input, 0x64, 2, 64);
        assert_eq!(request.request_type, 0xA1);
        assert_eq!(request.request, 0x01);
        assert_eq!(request.value, 0x0164);
        assert_eq!(request.index, 2);
        assert_eq!(request.length, 64);

        let feature = get_report_request(ReportType::Feature, 0x01, 0, 8);
        assert_eq!(feature.value, 0x0301);
    }

    #[test]
    fn polls_every_id_in_order() {
        let device = ScriptedDevice::new(vec![])
            .with_report(0x01, vec![0x01, 0x50])
            .with_report(0x64, vec![0x64, 0x01])
            .with_report(0x66, vec![0x66, 0x00, 0x10]);
        let (mut engine, handle) = engine_with(device);

        let cycle = poller().poll(&mut engine, handle, 0);
        assert!(!cycle.device_gone);
        assert_eq!(
            cycle.reports,
            vec![
                (0x01, vec![0x01, 0x50]),
                (0x64, vec![0x64, 0x01]),
                (0x66, vec![0x66, 0x00, 0x10]),
            ]
        );

        let ids: Vec<u16> = engine
            .driver()
            .script()
            .requests()
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(ids, vec![0x0101, 0x0164, 0x0166]);
    }

    #[test]
    fn a_stalled_id_does_not_stop_the_cycle() {
        let device = ScriptedDevice::new(vec![])
            .with_report(0x01, vec![0x01])
            .with_report(0x66, vec![0x66]);
        let (mut engine, handle) = engine_with(device);

        let cycle = poller().poll(&mut engine, handle, 0);
        assert_eq!(cycle.reports, vec![(0x01, vec![0x01]), (0x66, vec![0x66])]);
        assert_eq!(engine.driver().script().submissions(), 3);
    }

    #[test]
    fn device_gone_stops_the_cycle() {
        let device = ScriptedDevice::new(vec![]).with_report(0x01, vec![0x01]);
        let (mut engine, handle) = engine_with(device);
        engine.driver().script().remove_device(ADDRESS);

        let cycle = poller().poll(&mut engine, handle, 0);
        assert!(cycle.device_gone);
        assert!(cycle.reports.is_empty());
        assert_eq!(engine.driver().script().submissions(), 1);
    }

    #[test]
    fn timeouts_are_skipped() {
        let device = ScriptedDevice::new(vec![])
            .with_report(0x01, vec![0x01])
            .unresponsive();
        let (mut engine, handle) = engine_with(device);

        let cycle = poller().poll(&mut engine, handle, 0);
        assert!(!cycle.device_gone);
        assert!(cycle.reports.is_empty());
        assert_eq!(engine.driver().script().submissions(), 3);
        assert_eq!(engine.driver().script().live_transfers(), 0);
    }
}
