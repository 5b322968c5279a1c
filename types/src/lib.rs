#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::Formatter;
use strum::{Display, EnumIter};

/// Location of a device on the host, as reported by the host controller when it attaches.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UsbAddress {
    pub bus_number: u8,
    pub address: u8,
}

impl UsbAddress {
    pub fn new(bus_number: u8, address: u8) -> Self {
        Self {
            bus_number,
            address,
        }
    }
}

impl std::fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}:{:03}", self.bus_number, self.address)
    }
}

/// The HID interface geometry discovered in a device's configuration descriptor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HidInterfaceInfo {
    pub interface_number: u8,

    // Direction bit (0x80) and endpoint number
    pub endpoint_address: u8,
    pub max_packet_size: u16,
    pub poll_interval_hint: u8,

    // Zero when the HID class descriptor didn't declare one
    pub report_descriptor_length: u16,
}

impl std::fmt::Display for HidInterfaceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "IF={} EP=0x{:02X} MPS={} interval={}ms",
            self.interface_number,
            self.endpoint_address,
            self.max_packet_size,
            self.poll_interval_hint
        )
    }
}

/// HID report types, as carried in the high byte of a GET_REPORT wValue.
#[derive(Copy, Clone, Debug, Default, Display, EnumIter, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReportType {
    #[default]
    Input,
    Output,
    Feature,
}

impl ReportType {
    pub fn id(&self) -> u8 {
        match self {
            ReportType::Input => 0x01,
            ReportType::Output => 0x02,
            ReportType::Feature => 0x03,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ByteChange {
    pub offset: usize,
    pub old: u8,
    pub new: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LengthChange {
    pub previous: usize,
    pub current: usize,
}

/// What changed in a report since it was last read.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReportChange {
    /// First time this report has been seen during the session, the payload is the baseline.
    Baseline,

    /// Byte differences over the common prefix, plus a note if the length changed.
    Changed {
        bytes: Vec<ByteChange>,
        length: Option<LengthChange>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReportEvent {
    pub report_id: u8,
    pub length: usize,
    pub payload: Vec<u8>,

    // None when the payload is identical to the previous read
    pub change: Option<ReportChange>,
}

/// Events surfaced to whatever sits on top of the engine (a field decoder, sensors, a log..)
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceEvent {
    Attached {
        address: UsbAddress,
        interface: HidInterfaceInfo,
    },
    ReportDescriptor {
        interface_number: u8,
        descriptor: Vec<u8>,
        declared_report_ids: Vec<u8>,
    },
    Report(ReportEvent),
    Detached {
        address: UsbAddress,
    },
}
