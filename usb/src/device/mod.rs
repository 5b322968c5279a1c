pub mod base;
pub mod libusb;

pub use base::{
    notification_channel, CompletionSender, DeviceNotification, HandleId, HostDriver,
    HostLibrary, NotificationSender, TransferCompletion, TransferId, TransferStatus,
};
