use crate::control::{ControlRequest, Direction, SETUP_PACKET_SIZE};
use crate::device::base::{
    CompletionSender, HandleId, HostDriver, TransferCompletion, TransferId, TransferStatus,
};
use crate::error::DriverError;
use log::{debug, info, warn};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::time::Duration;
use ups_hid_types::UsbAddress;

struct OpenDevice {
    handle: DeviceHandle<Context>,
    address: UsbAddress,
    claimed: Option<u8>,
}

/// A [`HostDriver`] over libusb. libusb's control calls are synchronous, so a transfer has
/// already completed by the time `submit_control` returns, and there's nothing left to pump.
pub struct LibUsbDriver {
    context: Context,
    devices: HashMap<HandleId, OpenDevice>,
    transfers: HashMap<TransferId, Vec<u8>>,

    next_handle: u32,
    next_transfer: u32,
}

impl LibUsbDriver {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            devices: HashMap::new(),
            transfers: HashMap::new(),
            next_handle: 0,
            next_transfer: 0,
        }
    }
}

impl HostDriver for LibUsbDriver {
    fn open_device(&mut self, address: UsbAddress) -> Result<HandleId, DriverError> {
        let device = self
            .context
            .devices()?
            .iter()
            .find(|device| {
                device.bus_number() == address.bus_number && device.address() == address.address
            })
            .ok_or(DriverError::DeviceNotFound)?;

        let handle = device.open()?;
        if let Ok(descriptor) = device.device_descriptor() {
            debug!(
                "Opened {:04x}:{:04x} at {}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                address
            );
        }

        self.next_handle += 1;
        let id = HandleId(self.next_handle);
        self.devices.insert(
            id,
            OpenDevice {
                handle,
                address,
                claimed: None,
            },
        );
        Ok(id)
    }

    fn close_device(&mut self, handle: HandleId) {
        if let Some(mut device) = self.devices.remove(&handle) {
            if let Some(interface) = device.claimed.take() {
                // Fails if the device is already gone, which is fine.
                let _ = device.handle.release_interface(interface);
            }
            debug!("Closed device at {}", device.address);
        }
    }

    fn claim_interface(&mut self, handle: HandleId, interface: u8) -> Result<(), DriverError> {
        let device = self
            .devices
            .get_mut(&handle)
            .ok_or(DriverError::UnknownHandle(handle.0))?;

        // Not supported off Linux, where there's no kernel driver to detach anyway.
        if let Err(e) = device.handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }
        device.handle.claim_interface(interface)?;
        device.claimed = Some(interface);

        info!("Claimed interface {} on {}", interface, device.address);
        Ok(())
    }

    fn allocate_transfer(&mut self, size: usize) -> Result<TransferId, DriverError> {
        self.next_transfer = self.next_transfer.wrapping_add(1);
        let transfer = TransferId(self.next_transfer);
        self.transfers.insert(transfer, vec![0; size]);
        Ok(transfer)
    }

    fn transfer_buffer(&mut self, transfer: TransferId) -> Option<&mut [u8]> {
        self.transfers.get_mut(&transfer).map(|b| b.as_mut_slice())
    }

    fn free_transfer(&mut self, transfer: TransferId) {
        self.transfers.remove(&transfer);
    }

    fn submit_control(
        &mut self,
        handle: HandleId,
        transfer: TransferId,
        timeout: Duration,
        completion: CompletionSender,
    ) -> Result<(), DriverError> {
        let device = self
            .devices
            .get(&handle)
            .ok_or(DriverError::UnknownHandle(handle.0))?;
        let buffer = self
            .transfers
            .get_mut(&transfer)
            .ok_or(DriverError::UnknownTransfer(transfer.0))?;

        let Some(request) = ControlRequest::from_setup_packet(buffer) else {
            return Err(DriverError::UnknownTransfer(transfer.0));
        };

        let (_, data) = buffer.split_at_mut(SETUP_PACKET_SIZE);
        let length = data.len().min(request.length as usize);
        let data = &mut data[..length];
        let timeout = libusb_timeout(timeout);

        let result = match request.direction() {
            Direction::In => device.handle.read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                data,
                timeout,
            ),
            Direction::Out => device.handle.write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                data,
                timeout,
            ),
        };

        let _ = completion.send(completion_for(result));
        Ok(())
    }

    fn pump_client_events(&mut self, _max_wait: Duration) {}
}

// libusb reads a zero timeout as 'wait forever', the shortest real wait it has is 1ms.
fn libusb_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

/// Maps a libusb transfer result onto a completion.
pub(crate) fn completion_for(result: Result<usize, rusb::Error>) -> TransferCompletion {
    match result {
        Ok(length) => TransferCompletion::completed(length),
        Err(error) => {
            let status = match error {
                rusb::Error::Pipe => TransferStatus::Stall,
                rusb::Error::NoDevice => TransferStatus::NoDevice,
                rusb::Error::Timeout => TransferStatus::TimedOut,
                rusb::Error::Interrupted => TransferStatus::Canceled,
                other => {
                    warn!("Control transfer failed: {}", other);
                    TransferStatus::Error
                }
            };
            TransferCompletion::failed(status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_never_reaches_libusb() {
        assert_eq!(libusb_timeout(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(
            libusb_timeout(Duration::from_millis(300)),
            Duration::from_millis(300)
        );
    }

    #[test]
    fn libusb_errors_map_to_statuses() {
        assert_eq!(completion_for(Ok(12)), TransferCompletion::completed(12));
        assert_eq!(
            completion_for(Err(rusb::Error::Pipe)).status,
            TransferStatus::Stall
        );
        assert_eq!(
            completion_for(Err(rusb::Error::NoDevice)).status,
            TransferStatus::NoDevice
        );
        assert_eq!(
            completion_for(Err(rusb::Error::Timeout)).status,
            TransferStatus::TimedOut
        );
        assert_eq!(
            completion_for(Err(rusb::Error::Interrupted)).status,
            TransferStatus::Canceled
        );
        assert_eq!(
            completion_for(Err(rusb::Error::Io)).status,
            TransferStatus::Error
        );
    }
}
