use crate::error::{DriverError, TransferError};
use std::fmt::Formatter;
use std::time::Duration;
use strum::Display;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use ups_hid_types::UsbAddress;

/// Opaque identifier for a device opened through a [`HostDriver`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u32);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for a transfer buffer owned by a [`HostDriver`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransferId(pub u32);

/// Terminal states a transfer can reach.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    Stall,
    NoDevice,
    Canceled,
    TimedOut,
}

impl TransferStatus {
    pub fn as_error(&self) -> Option<TransferError> {
        match self {
            TransferStatus::Completed => None,
            TransferStatus::Error => Some(TransferError::TransportError),
            TransferStatus::Stall => Some(TransferError::Stalled),
            TransferStatus::NoDevice => Some(TransferError::DeviceGone),
            TransferStatus::Canceled => Some(TransferError::Canceled),
            TransferStatus::TimedOut => Some(TransferError::TimedOut),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferCompletion {
    pub status: TransferStatus,

    // Bytes moved in the data stage, the setup packet isn't counted
    pub actual_length: usize,
}

impl TransferCompletion {
    pub fn completed(actual_length: usize) -> Self {
        Self {
            status: TransferStatus::Completed,
            actual_length,
        }
    }

    pub fn failed(status: TransferStatus) -> Self {
        Self {
            status,
            actual_length: 0,
        }
    }
}

/// Handed to the driver with every submission. The driver's completion path posts exactly one
/// message through it, from whatever context the completion is observed in.
pub type CompletionSender = oneshot::Sender<TransferCompletion>;

/// The client side of a USB host controller driver.
///
/// Transfers are owned by the driver between `allocate_transfer` and `free_transfer`. A transfer
/// must be freeable at any time, including while it is still in flight, in which case the driver
/// is expected to cancel it.
pub trait HostDriver: Send {
    fn open_device(&mut self, address: UsbAddress) -> Result<HandleId, DriverError>;
    fn close_device(&mut self, handle: HandleId);

    /// Claims the interface for this client. Drivers which don't need it can leave this be.
    fn claim_interface(&mut self, _handle: HandleId, _interface: u8) -> Result<(), DriverError> {
        Ok(())
    }

    fn allocate_transfer(&mut self, size: usize) -> Result<TransferId, DriverError>;
    fn transfer_buffer(&mut self, transfer: TransferId) -> Option<&mut [u8]>;
    fn free_transfer(&mut self, transfer: TransferId);

    /// Submits a control transfer on endpoint 0, the buffer must already hold the setup packet.
    fn submit_control(
        &mut self,
        handle: HandleId,
        transfer: TransferId,
        timeout: Duration,
        completion: CompletionSender,
    ) -> Result<(), DriverError>;

    /// Dispatches pending client events, returning as soon as at least one has been handled or
    /// `max_wait` has passed.
    fn pump_client_events(&mut self, max_wait: Duration);
}

/// The library side of a host controller driver, this is what produces attach / detach
/// notifications, and needs to be pumped from its own thread.
pub trait HostLibrary: Send {
    fn pump_library_events(&mut self, timeout: Duration) -> Result<(), DriverError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceNotification {
    Attached(UsbAddress),
    Detached,
}

/// The write end of the notification channel, held by the host driver's dispatch path.
///
/// Sending never blocks and never allocates. If the client worker has fallen far enough behind
/// that the channel is full, the notification is handed back as [`DriverError::QueueFull`] for
/// the caller to hold on to.
#[derive(Clone, Debug)]
pub struct NotificationSender {
    sender: mpsc::Sender<DeviceNotification>,
}

impl NotificationSender {
    pub fn new(sender: mpsc::Sender<DeviceNotification>) -> Self {
        Self { sender }
    }

    pub fn notify(&self, notification: DeviceNotification) -> Result<(), DriverError> {
        match self.sender.try_send(notification) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DriverError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DriverError::ChannelClosed),
        }
    }
}

pub fn notification_channel(
    capacity: usize,
) -> (NotificationSender, mpsc::Receiver<DeviceNotification>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (NotificationSender::new(sender), receiver)
}
