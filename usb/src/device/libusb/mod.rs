pub mod device;
pub mod hotplug;

pub use device::LibUsbDriver;
pub use hotplug::{AttachTracker, DeviceFilter, LibUsbHost};
