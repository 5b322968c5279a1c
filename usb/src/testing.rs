//! An in-memory host driver which plays the part of a single-port host controller with scripted
//! devices attached, used to exercise the engine without hardware.

use crate::control::{ControlRequest, SETUP_PACKET_SIZE};
use crate::device::{
    CompletionSender, HandleId, HostDriver, TransferCompletion, TransferId, TransferStatus,
};
use crate::error::DriverError;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::Duration;
use ups_hid_types::{ReportType, UsbAddress};

#[derive(Clone, Debug, Default)]
pub struct ScriptedDevice {
    config_descriptor: Vec<u8>,
    report_descriptor: Option<Vec<u8>>,
    reports: HashMap<(u8, u8), Vec<u8>>,
    unresponsive: bool,
}

impl ScriptedDevice {
    pub fn new(config_descriptor: Vec<u8>) -> Self {
        Self {
            config_descriptor,
            ..Default::default()
        }
    }

    pub fn with_report(self, report_id: u8, payload: Vec<u8>) -> Self {
        self.with_typed_report(ReportType::Input, report_id, payload)
    }

    pub fn with_typed_report(
        mut self,
        report_type: ReportType,
        report_id: u8,
        payload: Vec<u8>,
    ) -> Self {
        self.reports.insert((report_type.id(), report_id), payload);
        self
    }

    pub fn with_report_descriptor(mut self, descriptor: Vec<u8>) -> Self {
        self.report_descriptor = Some(descriptor);
        self
    }

    /// Transfers to this device never reach a terminal state.
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    fn respond(&self, request: &ControlRequest) -> Result<Vec<u8>, TransferStatus> {
        let descriptor_type = (request.value >> 8) as u8;
        match (request.request_type, request.request) {
            (0x80, 0x06) if descriptor_type == 0x02 => Ok(self.config_descriptor.clone()),
            (0x81, 0x06) if descriptor_type == 0x22 => {
                self.report_descriptor.clone().ok_or(TransferStatus::Stall)
            }
            (0xA1, 0x01) => self
                .reports
                .get(&(descriptor_type, request.value as u8))
                .cloned()
                .ok_or(TransferStatus::Stall),
            _ => Err(TransferStatus::Stall),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    devices: HashMap<UsbAddress, ScriptedDevice>,
    handles: HashMap<HandleId, UsbAddress>,
    next_handle: u32,

    requests: Vec<ControlRequest>,
    claimed: Vec<(HandleId, u8)>,
    closed: Vec<HandleId>,

    live_transfers: usize,
    peak_transfers: usize,
    fail_allocations: bool,
}

/// Test-side control over a [`ScriptedDriver`], usable while the driver itself is owned by
/// an engine or monitor.
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptHandle {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // A panicking test thread can poison this, the state is still fine to read.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_device(&self, address: UsbAddress, device: ScriptedDevice) {
        self.lock().devices.insert(address, device);
    }

    pub fn remove_device(&self, address: UsbAddress) {
        self.lock().devices.remove(&address);
    }

    pub fn set_report(&self, address: UsbAddress, report_id: u8, payload: Vec<u8>) {
        if let Some(device) = self.lock().devices.get_mut(&address) {
            device
                .reports
                .insert((ReportType::Input.id(), report_id), payload);
        }
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.lock().fail_allocations = fail;
    }

    pub fn live_transfers(&self) -> usize {
        self.lock().live_transfers
    }

    pub fn peak_transfers(&self) -> usize {
        self.lock().peak_transfers
    }

    pub fn submissions(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<ControlRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    pub fn open_handles(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn closed_handles(&self) -> Vec<HandleId> {
        self.lock().closed.clone()
    }

    pub fn claimed_interfaces(&self) -> Vec<(HandleId, u8)> {
        self.lock().claimed.clone()
    }
}

struct PendingTransfer {
    handle: HandleId,
    transfer: TransferId,
    completion: CompletionSender,
}

pub struct ScriptedDriver {
    script: ScriptHandle,

    transfers: HashMap<TransferId, Vec<u8>>,
    next_transfer: u32,
    pending: Vec<PendingTransfer>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            script: ScriptHandle {
                state: Arc::new(Mutex::new(ScriptState::default())),
            },
            transfers: HashMap::new(),
            next_transfer: 0,
            pending: Vec::new(),
        }
    }

    pub fn script(&self) -> ScriptHandle {
        self.script.clone()
    }

    // Attempts to complete a pending transfer, handing it back if the device isn't answering.
    fn complete(&mut self, pending: PendingTransfer) -> Option<PendingTransfer> {
        let outcome = {
            let state = self.script.lock();
            let device = state
                .handles
                .get(&pending.handle)
                .and_then(|address| state.devices.get(address));

            match device {
                None => Err(TransferStatus::NoDevice),
                Some(device) if device.unresponsive => return Some(pending),
                Some(device) => {
                    let buffer = self.transfers.get(&pending.transfer);
                    match buffer.and_then(|b| ControlRequest::from_setup_packet(b)) {
                        Some(request) => device.respond(&request).map(|data| (request, data)),
                        None => Err(TransferStatus::Error),
                    }
                }
            }
        };

        let completion = match outcome {
            Ok((request, data)) => match self.transfers.get_mut(&pending.transfer) {
                Some(buffer) => {
                    let room = buffer.len() - SETUP_PACKET_SIZE;
                    let length = data.len().min(request.length as usize).min(room);
                    buffer[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + length]
                        .copy_from_slice(&data[..length]);
                    TransferCompletion::completed(length)
                }
                None => TransferCompletion::failed(TransferStatus::Error),
            },
            Err(status) => TransferCompletion::failed(status),
        };

        let _ = pending.completion.send(completion);
        None
    }
}

impl HostDriver for ScriptedDriver {
    fn open_device(&mut self, address: UsbAddress) -> Result<HandleId, DriverError> {
        let mut state = self.script.lock();
        if !state.devices.contains_key(&address) {
            return Err(DriverError::DeviceNotFound);
        }

        state.next_handle += 1;
        let handle = HandleId(state.next_handle);
        state.handles.insert(handle, address);
        Ok(handle)
    }

    fn close_device(&mut self, handle: HandleId) {
        let mut state = self.script.lock();
        state.handles.remove(&handle);
        state.closed.push(handle);
    }

    fn claim_interface(&mut self, handle: HandleId, interface: u8) -> Result<(), DriverError> {
        let mut state = self.script.lock();
        if !state.handles.contains_key(&handle) {
            return Err(DriverError::UnknownHandle(handle.0));
        }
        state.claimed.push((handle, interface));
        Ok(())
    }

    fn allocate_transfer(&mut self, size: usize) -> Result<TransferId, DriverError> {
        let mut state = self.script.lock();
        if state.fail_allocations {
            return Err(DriverError::AllocationFailed(size));
        }

        self.next_transfer += 1;
        let transfer = TransferId(self.next_transfer);
        self.transfers.insert(transfer, vec![0; size]);

        state.live_transfers += 1;
        state.peak_transfers = state.peak_transfers.max(state.live_transfers);
        Ok(transfer)
    }

    fn transfer_buffer(&mut self, transfer: TransferId) -> Option<&mut [u8]> {
        self.transfers.get_mut(&transfer).map(|b| b.as_mut_slice())
    }

    fn free_transfer(&mut self, transfer: TransferId) {
        self.pending.retain(|p| p.transfer != transfer);
        if self.transfers.remove(&transfer).is_some() {
            self.script.lock().live_transfers -= 1;
        }
    }

    fn submit_control(
        &mut self,
        handle: HandleId,
        transfer: TransferId,
        _timeout: Duration,
        completion: CompletionSender,
    ) -> Result<(), DriverError> {
        let buffer = self
            .transfers
            .get(&transfer)
            .ok_or(DriverError::UnknownTransfer(transfer.0))?;

        let mut state = self.script.lock();
        if !state.handles.contains_key(&handle) {
            return Err(DriverError::UnknownHandle(handle.0));
        }
        if let Some(request) = ControlRequest::from_setup_packet(buffer) {
            state.requests.push(request);
        }
        drop(state);

        self.pending.push(PendingTransfer {
            handle,
            transfer,
            completion,
        });
        Ok(())
    }

    fn pump_client_events(&mut self, max_wait: Duration) {
        let mut dispatched = false;
        let pending: Vec<PendingTransfer> = self.pending.drain(..).collect();
        for transfer in pending {
            match self.complete(transfer) {
                Some(still_pending) => self.pending.push(still_pending),
                None => dispatched = true,
            }
        }

        // Nothing happened, so behave like a real driver waiting on an empty queue.
        if !dispatched {
            sleep(max_wait);
        }
    }
}

/// Builders for the descriptors scripted devices hand back.
pub mod descriptors {
    use byteorder::{ByteOrder, LittleEndian};

    pub fn interface(number: u8, class: u8, subclass: u8, protocol: u8) -> Vec<u8> {
        vec![9, 0x04, number, 0, 1, class, subclass, protocol, 0]
    }

    pub fn hid(report_descriptor_length: u16) -> Vec<u8> {
        let mut hid = vec![9, 0x21, 0x11, 0x01, 0x00, 1, 0x22, 0, 0];
        LittleEndian::write_u16(&mut hid[7..9], report_descriptor_length);
        hid
    }

    pub fn endpoint(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Vec<u8> {
        let mut endpoint = vec![7, 0x05, address, attributes, 0, 0, interval];
        LittleEndian::write_u16(&mut endpoint[4..6], max_packet_size);
        endpoint
    }

    /// Prepends a configuration header whose wTotalLength covers all the records given.
    pub fn configuration(records: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = records.iter().flatten().copied().collect();
        let mut config = vec![9, 0x02, 0, 0, 1, 1, 0, 0x80, 50];
        LittleEndian::write_u16(&mut config[2..4], (body.len() + 9) as u16);
        config.extend(body);
        config
    }

    /// A typical single-interface HID UPS.
    pub fn ups_configuration() -> Vec<u8> {
        configuration(&[
            interface(0, 0x03, 0x00, 0x00),
            hid(0x1C),
            endpoint(0x81, 0x03, 8, 10),
        ])
    }
}

// Used by descriptor tests to fake a truncated read.
pub fn with_total_length(mut config: Vec<u8>, total: u16) -> Vec<u8> {
    LittleEndian::write_u16(&mut config[2..4], total);
    config
}
