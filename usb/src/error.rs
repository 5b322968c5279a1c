/// Why a control transfer didn't complete.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Request Stalled by the Device")]
    Stalled,

    #[error("Transport Error")]
    TransportError,

    #[error("Device is Gone")]
    DeviceGone,

    #[error("Transfer was Canceled")]
    Canceled,

    #[error("Transfer Timed Out")]
    TimedOut,

    #[error("Unable to allocate a transfer")]
    OutOfResources,
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("No matching USB device was found")]
    DeviceNotFound,

    #[error("Device handle {0} is not open")]
    UnknownHandle(u32),

    #[error("Transfer {0} has not been allocated")]
    UnknownTransfer(u32),

    #[error("Unable to allocate a {0} byte transfer")]
    AllocationFailed(usize),

    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),

    #[error("Notification channel closed")]
    ChannelClosed,

    #[error("Notification queue is full")]
    QueueFull,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Unable to read the {stage}: {source}")]
    Transfer {
        stage: &'static str,
        source: TransferError,
    },

    #[error("Malformed configuration header (bLength: {length}, bDescriptorType: {descriptor_type})")]
    MalformedConfigHeader { length: u8, descriptor_type: u8 },

    #[error("Configuration header too short, Expected: 9, Received: {0}")]
    ShortConfigHeader(usize),

    #[error("Invalid configuration wTotalLength: {0}")]
    InvalidTotalLength(u16),

    #[error("No HID interface found")]
    InterfaceNotFound,

    #[error("No HID interrupt IN endpoint found on interface {0}")]
    EndpointNotFound(u8),
}

impl ProbeError {
    pub(crate) fn transfer(stage: &'static str) -> impl FnOnce(TransferError) -> ProbeError {
        move |source| ProbeError::Transfer { stage, source }
    }
}
