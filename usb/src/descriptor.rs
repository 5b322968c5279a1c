use crate::control::{ControlEngine, ControlRequest, RECIPIENT_DEVICE, RECIPIENT_INTERFACE};
use crate::device::{HandleId, HostDriver};
use crate::error::ProbeError;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::time::Duration;
use ups_hid_types::HidInterfaceInfo;

// Descriptor Types
pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_ENDPOINT: u8 = 0x05;
pub const DESCRIPTOR_HID: u8 = 0x21;
pub const DESCRIPTOR_HID_REPORT: u8 = 0x22;

pub const CLASS_HID: u8 = 0x03;
pub const HID_SUBCLASS_BOOT: u8 = 0x01;
pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

const CONFIG_HEADER_LENGTH: usize = 9;
const INTERFACE_LENGTH: usize = 9;
const ENDPOINT_LENGTH: usize = 7;
const HID_LENGTH: usize = 6;

const ENDPOINT_DIRECTION_IN: u8 = 0x80;
const TRANSFER_TYPE_MASK: u8 = 0x03;
const TRANSFER_TYPE_INTERRUPT: u8 = 0x03;

/// Largest report descriptor we'll ever ask for.
pub const MAX_REPORT_DESCRIPTOR_LENGTH: u16 = 1024;

/// One length-prefixed record from a descriptor stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorRecord<'a> {
    pub descriptor_type: u8,
    pub bytes: &'a [u8],
}

impl DescriptorRecord<'_> {
    pub fn length(&self) -> usize {
        self.bytes.len()
    }
}

/// Walks a buffer of concatenated descriptors.
///
/// Every record is bounds checked before it's handed out, the walk simply ends at the first
/// record that is shorter than 2 bytes or would run past the end of the buffer. Trailing garbage
/// is not an error.
pub struct DescriptorRecords<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> DescriptorRecords<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }
}

impl<'a> Iterator for DescriptorRecords<'a> {
    type Item = DescriptorRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = &self.buffer[self.position.min(self.buffer.len())..];
        if remaining.len() < 2 {
            return None;
        }

        let length = remaining[0] as usize;
        if length < 2 || length > remaining.len() {
            if length > remaining.len() {
                debug!(
                    "Descriptor at offset {} overruns the buffer ({} > {}), stopping",
                    self.position,
                    length,
                    remaining.len()
                );
            }
            // Park at the end so we don't keep re-reading a bad record.
            self.position = self.buffer.len();
            return None;
        }

        self.position += length;
        Some(DescriptorRecord {
            descriptor_type: remaining[1],
            bytes: &remaining[..length],
        })
    }
}

/// Finds the first HID interface in a configuration descriptor, and its interrupt IN endpoint.
pub fn resolve_hid_interface(config: &[u8]) -> Result<HidInterfaceInfo, ProbeError> {
    let mut info = HidInterfaceInfo::default();
    let mut hid_interface: Option<u8> = None;
    let mut current_interface: Option<u8> = None;
    let mut endpoint_found = false;

    for record in DescriptorRecords::new(config) {
        let bytes = record.bytes;
        match record.descriptor_type {
            DESCRIPTOR_INTERFACE if record.length() >= INTERFACE_LENGTH => {
                let number = bytes[2];
                current_interface = Some(number);

                let (class, subclass, protocol) = (bytes[5], bytes[6], bytes[7]);
                if class == CLASS_HID && hid_interface.is_none() {
                    info!(
                        "HID interface {} found, subclass: 0x{:02X}, protocol: 0x{:02X}",
                        number, subclass, protocol
                    );
                    hid_interface = Some(number);
                    info.interface_number = number;
                }
            }
            DESCRIPTOR_HID if record.length() >= HID_LENGTH => {
                if hid_interface.is_none() || current_interface != hid_interface {
                    continue;
                }
                if let Some(length) = report_descriptor_length(bytes) {
                    info.report_descriptor_length = length;
                }
            }
            DESCRIPTOR_ENDPOINT if record.length() >= ENDPOINT_LENGTH => {
                if endpoint_found || hid_interface.is_none() || current_interface != hid_interface
                {
                    continue;
                }

                let address = bytes[2];
                let attributes = bytes[3];
                let is_in = address & ENDPOINT_DIRECTION_IN != 0;
                let is_interrupt = attributes & TRANSFER_TYPE_MASK == TRANSFER_TYPE_INTERRUPT;
                if is_in && is_interrupt {
                    info.endpoint_address = address;
                    info.max_packet_size = LittleEndian::read_u16(&bytes[4..6]);
                    info.poll_interval_hint = bytes[6];
                    endpoint_found = true;
                }
            }
            _ => {}
        }
    }

    match hid_interface {
        None => Err(ProbeError::InterfaceNotFound),
        Some(interface) if !endpoint_found => Err(ProbeError::EndpointNotFound(interface)),
        Some(_) => Ok(info),
    }
}

// The HID class descriptor lists (type, length) pairs after bNumDescriptors, pick out the
// report descriptor's entry if there's one in bounds.
fn report_descriptor_length(hid: &[u8]) -> Option<u16> {
    let count = hid[5] as usize;
    hid[6..]
        .chunks_exact(3)
        .take(count)
        .find(|entry| entry[0] == DESCRIPTOR_HID_REPORT)
        .map(|entry| LittleEndian::read_u16(&entry[1..3]))
}

/// Reads descriptors from an open device, through the control engine.
#[derive(Copy, Clone, Debug)]
pub struct DescriptorReader {
    pub timeout: Duration,
}

impl DescriptorReader {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Reads the 9 byte configuration header, and returns wTotalLength from it.
    pub fn read_config_total_length<D: HostDriver>(
        &self,
        engine: &mut ControlEngine<D>,
        handle: HandleId,
    ) -> Result<u16, ProbeError> {
        let request = ControlRequest::get_descriptor(
            RECIPIENT_DEVICE,
            DESCRIPTOR_CONFIGURATION,
            0,
            0,
            CONFIG_HEADER_LENGTH as u16,
        );
        let response = engine
            .submit(handle, &request, self.timeout)
            .map_err(ProbeError::transfer("configuration header"))?;

        let header = response.payload;
        if header.len() < CONFIG_HEADER_LENGTH {
            return Err(ProbeError::ShortConfigHeader(header.len()));
        }
        if header[1] != DESCRIPTOR_CONFIGURATION || (header[0] as usize) < CONFIG_HEADER_LENGTH {
            return Err(ProbeError::MalformedConfigHeader {
                length: header[0],
                descriptor_type: header[1],
            });
        }

        let total_length = LittleEndian::read_u16(&header[2..4]);
        if (total_length as usize) < CONFIG_HEADER_LENGTH {
            return Err(ProbeError::InvalidTotalLength(total_length));
        }
        Ok(total_length)
    }

    /// Reads the full configuration descriptor, interfaces, endpoints and class descriptors.
    pub fn read_configuration<D: HostDriver>(
        &self,
        engine: &mut ControlEngine<D>,
        handle: HandleId,
    ) -> Result<Vec<u8>, ProbeError> {
        let total_length = self.read_config_total_length(engine, handle)?;
        let request = ControlRequest::get_descriptor(
            RECIPIENT_DEVICE,
            DESCRIPTOR_CONFIGURATION,
            0,
            0,
            total_length,
        );
        let response = engine
            .submit(handle, &request, self.timeout)
            .map_err(ProbeError::transfer("configuration descriptor"))?;

        if response.payload.len() < total_length as usize {
            debug!(
                "Configuration descriptor short read, Expected: {}, Received: {}",
                total_length,
                response.payload.len()
            );
        }
        Ok(response.payload)
    }

    /// Fetches and walks the configuration descriptor of a freshly opened device.
    pub fn probe<D: HostDriver>(
        &self,
        engine: &mut ControlEngine<D>,
        handle: HandleId,
    ) -> Result<HidInterfaceInfo, ProbeError> {
        let config = self.read_configuration(engine, handle)?;
        resolve_hid_interface(&config)
    }

    /// Reads the HID report descriptor for an interface. `hint_length` comes from the HID class
    /// descriptor, when that's zero `default_length` is used instead.
    pub fn fetch_report_descriptor<D: HostDriver>(
        &self,
        engine: &mut ControlEngine<D>,
        handle: HandleId,
        interface_number: u8,
        hint_length: u16,
        default_length: u16,
    ) -> Result<Vec<u8>, ProbeError> {
        let length = match hint_length {
            0 => default_length,
            hint => hint,
        }
        .min(MAX_REPORT_DESCRIPTOR_LENGTH);

        let request = ControlRequest::get_descriptor(
            RECIPIENT_INTERFACE,
            DESCRIPTOR_HID_REPORT,
            0,
            interface_number as u16,
            length,
        );
        match engine.submit(handle, &request, self.timeout) {
            Ok(response) => Ok(response.payload),
            Err(e) => {
                warn!(
                    "Unable to read report descriptor for interface {}: {}",
                    interface_number, e
                );
                Err(ProbeError::Transfer {
                    stage: "report descriptor",
                    source: e,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use crate::testing::descriptors::{
        configuration, endpoint, hid, interface, ups_configuration,
    };
    use crate::testing::{with_total_length, ScriptedDevice, ScriptedDriver};
    use ups_hid_types::UsbAddress;

    #[test]
    fn resolves_interface_and_interrupt_endpoint() {
        let config = configuration(&[
            interface(2, 0x03, 0x00, 0x00),
            endpoint(0x81, 0x03, 8, 10),
        ]);

        let info = resolve_hid_interface(&config).unwrap();
        assert_eq!(info.interface_number, 2);
        assert_eq!(info.endpoint_address, 0x81);
        assert_eq!(info.max_packet_size, 8);
        assert_eq!(info.poll_interval_hint, 10);
        assert_eq!(info.report_descriptor_length, 0);
    }

    #[test]
    fn reads_report_descriptor_length_from_hid_descriptor() {
        let info = resolve_hid_interface(&ups_configuration()).unwrap();
        assert_eq!(info.report_descriptor_length, 0x1C);
    }

    #[test]
    fn no_hid_interface_is_not_found() {
        let config = configuration(&[
            interface(0, 0x08, 0x06, 0x50),
            endpoint(0x81, 0x02, 512, 0),
            endpoint(0x02, 0x02, 512, 0),
        ]);

        assert_eq!(
            resolve_hid_interface(&config),
            Err(ProbeError::InterfaceNotFound)
        );
    }

    #[test]
    fn skips_out_and_bulk_endpoints() {
        let config = configuration(&[
            interface(1, 0x03, 0x00, 0x00),
            endpoint(0x02, 0x03, 64, 1),
            endpoint(0x83, 0x02, 64, 0),
            endpoint(0x84, 0x03, 16, 20),
        ]);

        let info = resolve_hid_interface(&config).unwrap();
        assert_eq!(info.endpoint_address, 0x84);
        assert_eq!(info.max_packet_size, 16);
        assert_eq!(info.poll_interval_hint, 20);
    }

    #[test]
    fn endpoints_of_other_interfaces_are_ignored() {
        let config = configuration(&[
            interface(0, 0x03, 0x00, 0x00),
            interface(1, 0xFF, 0x00, 0x00),
            endpoint(0x81, 0x03, 8, 10),
        ]);

        assert_eq!(
            resolve_hid_interface(&config),
            Err(ProbeError::EndpointNotFound(0))
        );
    }

    #[test]
    fn only_the_first_hid_interface_is_used() {
        let config = configuration(&[
            interface(0, 0x03, 0x00, 0x00),
            endpoint(0x81, 0x03, 8, 10),
            interface(1, 0x03, 0x00, 0x00),
            endpoint(0x82, 0x03, 64, 1),
        ]);

        let info = resolve_hid_interface(&config).unwrap();
        assert_eq!(info.interface_number, 0);
        assert_eq!(info.endpoint_address, 0x81);
    }

    #[test]
    fn truncated_record_stops_the_walk() {
        let mut config = configuration(&[interface(0, 0x03, 0x00, 0x00)]);
        // An endpoint claiming 7 bytes with only 4 present.
        config.extend([7, 0x05, 0x81, 0x03]);

        let records: Vec<_> = DescriptorRecords::new(&config).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(
            resolve_hid_interface(&config),
            Err(ProbeError::EndpointNotFound(0))
        );
    }

    #[test]
    fn truncation_after_a_match_keeps_the_result() {
        let mut config = ups_configuration();
        config.extend([9, 0x04, 0x01]);

        let info = resolve_hid_interface(&config).unwrap();
        assert_eq!(info.endpoint_address, 0x81);
    }

    #[test]
    fn zero_length_record_terminates() {
        let mut config = configuration(&[interface(0, 0x03, 0x00, 0x00)]);
        config.extend([0, 0x05, 0xFF, 0xFF]);
        config.extend(endpoint(0x81, 0x03, 8, 10));

        assert_eq!(DescriptorRecords::new(&config).count(), 2);
        assert!(resolve_hid_interface(&config).is_err());
    }

    #[test]
    fn short_records_are_skipped_not_read() {
        // An 'interface' record only 4 bytes long, too short to hold a class.
        let config = configuration(&[vec![4, 0x04, 0x00, 0x00], endpoint(0x81, 0x03, 8, 10)]);
        assert_eq!(
            resolve_hid_interface(&config),
            Err(ProbeError::InterfaceNotFound)
        );
    }

    #[test]
    fn report_entry_need_not_come_first() {
        // A physical descriptor entry (0x23) ahead of the report descriptor entry.
        let hid = vec![
            12, 0x21, 0x11, 0x01, 0x00, 2, // bNumDescriptors: 2
            0x23, 0x10, 0x00, // physical, 16 bytes
            0x22, 0x40, 0x01, // report, 320 bytes
        ];
        assert_eq!(report_descriptor_length(&hid), Some(0x0140));

        let config = configuration(&[
            interface(0, 0x03, 0x00, 0x00),
            hid,
            endpoint(0x81, 0x03, 8, 10),
        ]);
        let info = resolve_hid_interface(&config).unwrap();
        assert_eq!(info.report_descriptor_length, 0x0140);
    }

    #[test]
    fn descriptor_count_beyond_the_record_is_bounded() {
        // Claims three entries, only holds one which isn't the report descriptor.
        let physical_only = vec![9, 0x21, 0x11, 0x01, 0x00, 3, 0x23, 0x10, 0x00];
        assert_eq!(report_descriptor_length(&physical_only), None);

        // Claims three entries, the one present is the report descriptor.
        let report_only = vec![9, 0x21, 0x11, 0x01, 0x00, 3, 0x22, 0x30, 0x00];
        assert_eq!(report_descriptor_length(&report_only), Some(0x30));

        let config = configuration(&[
            interface(0, 0x03, 0x00, 0x00),
            physical_only,
            endpoint(0x81, 0x03, 8, 10),
        ]);
        let info = resolve_hid_interface(&config).unwrap();
        assert_eq!(info.report_descriptor_length, 0);
    }

    #[test]
    fn walker_handles_tiny_buffers() {
        assert_eq!(DescriptorRecords::new(&[]).count(), 0);
        assert_eq!(DescriptorRecords::new(&[9]).count(), 0);
        assert_eq!(DescriptorRecords::new(&[2, 0x10]).count(), 1);
    }

    fn engine_with(config: Vec<u8>) -> (ControlEngine<ScriptedDriver>, HandleId) {
        let address = UsbAddress::new(1, 2);
        let driver = ScriptedDriver::new();
        driver.script().insert_device(
            address,
            ScriptedDevice::new(config).with_report_descriptor(vec![0x05, 0x84, 0x09, 0x04]),
        );
        let mut engine = ControlEngine::new(driver);
        let handle = engine.driver_mut().open_device(address).unwrap();
        (engine, handle)
    }

    #[test]
    fn probe_reads_header_then_full_configuration() {
        let (mut engine, handle) = engine_with(ups_configuration());
        let reader = DescriptorReader::new(Duration::from_millis(100));

        let info = reader.probe(&mut engine, handle).unwrap();
        assert_eq!(info.interface_number, 0);
        assert_eq!(info.endpoint_address, 0x81);

        let requests = engine.driver().script().requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].length, 9);
        assert_eq!(requests[0].value, 0x0200);
        assert_eq!(requests[1].length as usize, ups_configuration().len());
    }

    #[test]
    fn probe_rejects_a_bad_header() {
        let mut config = ups_configuration();
        config[1] = 0x01;
        let (mut engine, handle) = engine_with(config);
        let reader = DescriptorReader::new(Duration::from_millis(100));

        assert_eq!(
            reader.probe(&mut engine, handle),
            Err(ProbeError::MalformedConfigHeader {
                length: 9,
                descriptor_type: 0x01
            })
        );
    }

    #[test]
    fn probe_rejects_an_impossible_total_length() {
        let config = with_total_length(ups_configuration(), 4);
        let (mut engine, handle) = engine_with(config);
        let reader = DescriptorReader::new(Duration::from_millis(100));

        assert_eq!(
            reader.probe(&mut engine, handle),
            Err(ProbeError::InvalidTotalLength(4))
        );
    }

    #[test]
    fn probe_tolerates_a_short_full_read() {
        // The device claims more than it actually returns.
        let config = with_total_length(ups_configuration(), 200);
        let (mut engine, handle) = engine_with(config);
        let reader = DescriptorReader::new(Duration::from_millis(100));

        let info = reader.probe(&mut engine, handle).unwrap();
        assert_eq!(info.endpoint_address, 0x81);
    }

    #[test]
    fn probe_reports_the_failing_stage() {
        let (mut engine, handle) = engine_with(ups_configuration());
        engine
            .driver()
            .script()
            .remove_device(UsbAddress::new(1, 2));
        let reader = DescriptorReader::new(Duration::from_millis(100));

        assert_eq!(
            reader.probe(&mut engine, handle),
            Err(ProbeError::Transfer {
                stage: "configuration header",
                source: TransferError::DeviceGone
            })
        );
    }

    #[test]
    fn report_descriptor_uses_hint_or_default() {
        let (mut engine, handle) = engine_with(ups_configuration());
        let reader = DescriptorReader::new(Duration::from_millis(100));

        let descriptor = reader
            .fetch_report_descriptor(&mut engine, handle, 0, 0, 512)
            .unwrap();
        assert_eq!(descriptor, vec![0x05, 0x84, 0x09, 0x04]);

        reader
            .fetch_report_descriptor(&mut engine, handle, 3, 0x1C, 512)
            .unwrap();
        reader
            .fetch_report_descriptor(&mut engine, handle, 0, 0, 4096)
            .unwrap();

        let requests = engine.driver().script().requests();
        assert_eq!(requests[0].request_type, 0x81);
        assert_eq!(requests[0].value, 0x2200);
        assert_eq!(requests[0].length, 512);
        assert_eq!(requests[1].index, 3);
        assert_eq!(requests[1].length, 0x1C);
        assert_eq!(requests[2].length, MAX_REPORT_DESCRIPTOR_LENGTH);
    }
}
