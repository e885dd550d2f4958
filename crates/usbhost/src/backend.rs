//! Native library seam
//!
//! The object model in this crate (sessions, devices, transfers) talks to the
//! USB stack only through [`Backend`]. [`Libusb`](crate::Libusb) drives the
//! real library; [`MockBackend`](crate::MockBackend) is an in-memory stand-in.
//!
//! Every status coming back from the native side is a [`rusb::Error`].

use std::time::Duration;

/// Setup packet length that precedes the data stage in control buffers
pub const SETUP_PACKET_SIZE: usize = 8;

/// Session-unique id of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

/// Fields of a control transfer's SETUP packet
///
/// `wLength` is not stored here: it is the length of the transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    #[doc(alias = "bmRequestType")]
    pub request_type: u8,
    #[doc(alias = "bRequest")]
    pub request: u8,
    #[doc(alias = "wValue")]
    pub value: u16,
    #[doc(alias = "wIndex")]
    pub index: u16,
}

impl ControlSetup {
    /// Device-to-host requests have bit 7 of `bmRequestType` set
    pub fn is_in(&self) -> bool {
        self.request_type & rusb::constants::LIBUSB_ENDPOINT_IN != 0
    }

    /// Serialize the SETUP packet for a data stage of `length` bytes
    pub fn packet(&self, length: u16) -> [u8; SETUP_PACKET_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// Transfer variants supported by the wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Control transfer on the default endpoint
    Control(ControlSetup),
    /// Bulk transfer on the given endpoint address
    Bulk { endpoint: u8 },
}

impl TransferKind {
    pub fn endpoint(&self) -> u8 {
        match self {
            TransferKind::Control(_) => 0,
            TransferKind::Bulk { endpoint } => *endpoint,
        }
    }

    /// Whether data flows device-to-host
    pub fn is_in(&self) -> bool {
        match self {
            TransferKind::Control(setup) => setup.is_in(),
            TransferKind::Bulk { endpoint } => endpoint & rusb::constants::LIBUSB_ENDPOINT_IN != 0,
        }
    }
}

/// Terminal status of a submission, as reported by the library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    Error,
    NoDevice,
    Overflow,
    Stalled,
    TimedOut,
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }
}

/// Everything a backend needs to start one transfer
///
/// The buffer is handed over for the duration of the transfer and comes back
/// in the matching [`RawCompletion`] or [`Rejected`].
#[derive(Debug)]
pub struct TransferRequest {
    pub id: TransferId,
    pub kind: TransferKind,
    pub timeout: Duration,
    pub buffer: Vec<u8>,
}

/// A submission the library refused, with its buffer returned
#[derive(Debug)]
pub struct Rejected {
    pub error: rusb::Error,
    pub buffer: Vec<u8>,
}

/// One finished transfer drained from the library
#[derive(Debug)]
pub struct RawCompletion {
    pub id: TransferId,
    pub status: TransferStatus,
    pub actual_length: usize,
    pub buffer: Vec<u8>,
}

/// Plain descriptor summary read at enumeration time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub bus_number: u8,
    pub address: u8,
    pub port_number: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub speed: rusb::Speed,
    pub num_configurations: u8,
}

/// Native USB stack operations used by the object model
///
/// Calls are single-threaded and non-reentrant: `handle_events` is the only
/// place completions are produced.
pub trait Backend {
    /// Opaque identifier of an enumerated device
    type Device;
    /// Open device handle
    type Handle;

    /// List every device currently visible
    fn devices(&self) -> rusb::Result<Vec<Self::Device>>;

    fn device_info(&self, device: &Self::Device) -> rusb::Result<DeviceInfo>;

    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle>;

    /// Give up a handle. In-flight transfers keep the native handle alive
    /// until they finish.
    fn close(&self, handle: Self::Handle);

    fn claim_interface(&self, handle: &Self::Handle, interface: u8) -> rusb::Result<()>;

    fn release_interface(&self, handle: &Self::Handle, interface: u8) -> rusb::Result<()>;

    fn submit(&self, handle: &Self::Handle, request: TransferRequest) -> Result<(), Rejected>;

    /// Ask the library to cancel. The outcome arrives through `handle_events`.
    fn cancel(&self, id: TransferId) -> rusb::Result<()>;

    /// Let the library run completions, waiting at most `timeout`
    /// (None = until something happens).
    fn handle_events(&self, timeout: Option<Duration>) -> rusb::Result<Vec<RawCompletion>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_packet_layout() {
        let setup = ControlSetup {
            request_type: 0x80,
            request: 0x06,
            value: 0x0100,
            index: 0x0409,
        };
        assert_eq!(
            setup.packet(18),
            [0x80, 0x06, 0x00, 0x01, 0x09, 0x04, 0x12, 0x00]
        );
    }

    #[test]
    fn test_control_direction() {
        let mut setup = ControlSetup {
            request_type: 0x80,
            request: 0,
            value: 0,
            index: 0,
        };
        assert!(setup.is_in());
        assert!(TransferKind::Control(setup).is_in());

        setup.request_type = 0x00;
        assert!(!setup.is_in());
        assert_eq!(TransferKind::Control(setup).endpoint(), 0);
    }

    #[test]
    fn test_endpoint_direction() {
        assert!(TransferKind::Bulk { endpoint: 0x81 }.is_in());
        assert!(!TransferKind::Bulk { endpoint: 0x01 }.is_in());
        assert_eq!(TransferKind::Bulk { endpoint: 0x02 }.endpoint(), 0x02);
    }

    #[test]
    fn test_only_completed_is_success() {
        assert!(TransferStatus::Completed.is_success());
        for status in [
            TransferStatus::Cancelled,
            TransferStatus::Error,
            TransferStatus::NoDevice,
            TransferStatus::Overflow,
            TransferStatus::Stalled,
            TransferStatus::TimedOut,
        ] {
            assert!(!status.is_success());
        }
    }
}
