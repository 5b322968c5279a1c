use crate::device::{HandleId, HostDriver, TransferCompletion, TransferId, TransferStatus};
use crate::error::TransferError;
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, warn};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

pub const SETUP_PACKET_SIZE: usize = 8;

// bmRequestType bits
pub const REQUEST_DIRECTION_IN: u8 = 0x80;
pub const REQUEST_TYPE_STANDARD: u8 = 0x00;
pub const REQUEST_TYPE_CLASS: u8 = 0x20;
pub const RECIPIENT_DEVICE: u8 = 0x00;
pub const RECIPIENT_INTERFACE: u8 = 0x01;

// Standard Requests
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A single USB control request. These are cheap, build one per call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    pub fn direction(&self) -> Direction {
        if self.request_type & REQUEST_DIRECTION_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Standard GET_DESCRIPTOR, `recipient` is either the device or an interface.
    pub fn get_descriptor(
        recipient: u8,
        descriptor_type: u8,
        descriptor_index: u8,
        index: u16,
        length: u16,
    ) -> Self {
        Self {
            request_type: REQUEST_DIRECTION_IN | REQUEST_TYPE_STANDARD | recipient,
            request: REQUEST_GET_DESCRIPTOR,
            value: ((descriptor_type as u16) << 8) | descriptor_index as u16,
            index,
            length,
        }
    }

    /// Encodes the 8 byte setup packet for this request.
    pub fn setup_packet(&self) -> [u8; SETUP_PACKET_SIZE] {
        let mut packet = [0; SETUP_PACKET_SIZE];
        packet[0] = self.request_type;
        packet[1] = self.request;
        LittleEndian::write_u16(&mut packet[2..4], self.value);
        LittleEndian::write_u16(&mut packet[4..6], self.index);
        LittleEndian::write_u16(&mut packet[6..8], self.length);
        packet
    }

    /// Decodes a setup packet, used by drivers which need the individual fields back.
    pub fn from_setup_packet(packet: &[u8]) -> Option<Self> {
        if packet.len() < SETUP_PACKET_SIZE {
            return None;
        }
        Some(Self {
            request_type: packet[0],
            request: packet[1],
            value: LittleEndian::read_u16(&packet[2..4]),
            index: LittleEndian::read_u16(&packet[4..6]),
            length: LittleEndian::read_u16(&packet[6..8]),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlResponse {
    pub payload: Vec<u8>,
    pub actual_length: usize,
}

pub type ControlResult = Result<ControlResponse, TransferError>;

// Frees the transfer whenever it goes out of scope, regardless of how we got there.
struct TransferGuard<'a, D: HostDriver> {
    driver: &'a mut D,
    transfer: TransferId,
}

impl<D: HostDriver> Drop for TransferGuard<'_, D> {
    fn drop(&mut self) {
        self.driver.free_transfer(self.transfer);
    }
}

/// Performs control transfers against a device through a [`HostDriver`], never waiting longer
/// than the timeout given for each one.
pub struct ControlEngine<D: HostDriver> {
    driver: D,
}

impl<D: HostDriver> ControlEngine<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn submit(
        &mut self,
        handle: HandleId,
        request: &ControlRequest,
        timeout: Duration,
    ) -> ControlResult {
        let requested = request.length as usize;

        let transfer = match self.driver.allocate_transfer(SETUP_PACKET_SIZE + requested) {
            Ok(transfer) => transfer,
            Err(e) => {
                error!("Unable to allocate transfer for {:?}: {}", request, e);
                return Err(TransferError::OutOfResources);
            }
        };
        let guard = TransferGuard {
            driver: &mut self.driver,
            transfer,
        };

        match guard.driver.transfer_buffer(transfer) {
            Some(buffer) if buffer.len() >= SETUP_PACKET_SIZE => {
                buffer[..SETUP_PACKET_SIZE].copy_from_slice(&request.setup_packet());
            }
            _ => {
                error!("Transfer buffer missing or undersized for {:?}", request);
                return Err(TransferError::OutOfResources);
            }
        }

        let (sender, mut receiver) = oneshot::channel();
        if let Err(e) = guard
            .driver
            .submit_control(handle, transfer, timeout, sender)
        {
            debug!("Control submission rejected: {}", e);
            return Err(TransferError::TransportError);
        }

        let completion = Self::await_completion(&mut *guard.driver, &mut receiver, timeout);
        let completion = match completion {
            Some(completion) => completion,
            None => {
                debug!("Control request {:?} timed out after {:?}", request, timeout);
                return Err(TransferError::TimedOut);
            }
        };

        if let Some(error) = completion.status.as_error() {
            return Err(error);
        }

        let buffer = match guard.driver.transfer_buffer(transfer) {
            Some(buffer) => buffer,
            None => {
                warn!("Transfer buffer vanished before it could be read");
                return Err(TransferError::TransportError);
            }
        };

        let actual_length = completion.actual_length;
        let available = buffer.len().saturating_sub(SETUP_PACKET_SIZE);
        let copied = requested.min(actual_length).min(available);
        let payload = buffer[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + copied].to_vec();

        Ok(ControlResponse {
            payload,
            actual_length,
        })
    }

    // Keeps the driver's client events moving until our completion arrives, or the deadline
    // passes. A closed channel means the driver dropped the transfer without completing it.
    fn await_completion(
        driver: &mut D,
        receiver: &mut oneshot::Receiver<TransferCompletion>,
        timeout: Duration,
    ) -> Option<TransferCompletion> {
        let deadline = Instant::now() + timeout;
        loop {
            match receiver.try_recv() {
                Ok(completion) => return Some(completion),
                Err(TryRecvError::Closed) => {
                    return Some(TransferCompletion::failed(TransferStatus::Canceled))
                }
                Err(TryRecvError::Empty) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            driver.pump_client_events(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedDevice, ScriptedDriver};
    use ups_hid_types::UsbAddress;

    fn address() -> UsbAddress {
        UsbAddress::new(1, 4)
    }

    fn open_engine(device: ScriptedDevice) -> (ControlEngine<ScriptedDriver>, HandleId) {
        let driver = ScriptedDriver::new();
        driver.script().insert_device(address(), device);

        let mut engine = ControlEngine::new(driver);
        let handle = engine.driver_mut().open_device(address()).unwrap();
        (engine, handle)
    }

    #[test]
    fn setup_packet_is_little_endian() {
        let request = ControlRequest {
            request_type: 0xA1,
            request: 0x01,
            value: 0x0164,
            index: 0x0002,
            length: 64,
        };

        assert_eq!(
            request.setup_packet(),
            [0xA1, 0x01, 0x64, 0x01, 0x02, 0x00, 0x40, 0x00]
        );
        assert_eq!(request.direction(), Direction::In);
        assert_eq!(
            ControlRequest::from_setup_packet(&request.setup_packet()),
            Some(request)
        );
    }

    #[test]
    fn get_descriptor_encodes_type_and_index() {
        let request = ControlRequest::get_descriptor(RECIPIENT_DEVICE, 0x02, 0, 0, 9);
        assert_eq!(
            request.setup_packet(),
            [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x00]
        );
    }

    #[test]
    fn completed_transfer_copies_the_data_stage() {
        let device = ScriptedDevice::new(vec![]).with_report(0x01, vec![0xAA, 0xBB, 0xCC]);
        let (mut engine, handle) = open_engine(device);

        let request = ControlRequest {
            request_type: 0xA1,
            request: 0x01,
            value: 0x0101,
            index: 0,
            length: 64,
        };
        let response = engine
            .submit(handle, &request, Duration::from_millis(100))
            .unwrap();

        assert_eq!(response.actual_length, 3);
        assert_eq!(response.payload, vec![0xAA, 0xBB, 0xCC]);
        assert_eq!(engine.driver().script().live_transfers(), 0);
    }

    #[test]
    fn payload_is_clamped_to_the_requested_length() {
        let device = ScriptedDevice::new(vec![]).with_report(0x01, vec![1, 2, 3, 4, 5, 6]);
        let (mut engine, handle) = open_engine(device);

        let request = ControlRequest {
            request_type: 0xA1,
            request: 0x01,
            value: 0x0101,
            index: 0,
            length: 2,
        };
        let response = engine
            .submit(handle, &request, Duration::from_millis(100))
            .unwrap();
        assert_eq!(response.payload, vec![1, 2]);
    }

    #[test]
    fn stall_is_reported_not_retried() {
        let (mut engine, handle) = open_engine(ScriptedDevice::new(vec![]));

        let request = ControlRequest {
            request_type: 0xA1,
            request: 0x01,
            value: 0x0177,
            index: 0,
            length: 64,
        };
        let result = engine.submit(handle, &request, Duration::from_millis(100));

        assert_eq!(result, Err(TransferError::Stalled));
        assert_eq!(engine.driver().script().submissions(), 1);
        assert_eq!(engine.driver().script().live_transfers(), 0);
    }

    #[test]
    fn unresponsive_transfers_time_out_without_leaking() {
        let device = ScriptedDevice::new(vec![])
            .with_report(0x01, vec![0x01])
            .unresponsive();
        let (mut engine, handle) = open_engine(device);

        let request = ControlRequest {
            request_type: 0xA1,
            request: 0x01,
            value: 0x0101,
            index: 0,
            length: 64,
        };

        for _ in 0..5 {
            let started = Instant::now();
            let result = engine.submit(handle, &request, Duration::from_millis(20));
            assert_eq!(result, Err(TransferError::TimedOut));
            assert!(started.elapsed() >= Duration::from_millis(20));
            assert_eq!(engine.driver().script().live_transfers(), 0);
        }
        assert_eq!(engine.driver().script().peak_transfers(), 1);
    }

    #[test]
    fn removed_device_fails_as_gone() {
        let device = ScriptedDevice::new(vec![]).with_report(0x01, vec![0x01]);
        let (mut engine, handle) = open_engine(device);
        engine.driver().script().remove_device(address());

        let request = ControlRequest {
            request_type: 0xA1,
            request: 0x01,
            value: 0x0101,
            index: 0,
            length: 64,
        };
        let result = engine.submit(handle, &request, Duration::from_millis(100));
        assert_eq!(result, Err(TransferError::DeviceGone));
    }

    #[test]
    fn allocation_failure_degrades_to_an_error() {
        let (mut engine, handle) = open_engine(ScriptedDevice::new(vec![]));
        engine.driver().script().fail_allocations(true);

        let request = ControlRequest::get_descriptor(RECIPIENT_DEVICE, 0x02, 0, 0, 9);
        let result = engine.submit(handle, &request, Duration::from_millis(100));

        assert_eq!(result, Err(TransferError::OutOfResources));
        assert_eq!(engine.driver().script().live_transfers(), 0);
    }
}
