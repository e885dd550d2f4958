//! Object model over the native USB host library
//!
//! - [`Session`]: library context, device enumeration and event processing
//! - [`Device`]: open handle and claimed interfaces of one enumerated device
//! - [`Transfer`]: asynchronous control and bulk transfers with completion
//!   dispatch through [`TransferHandler`]
//!
//! Everything is single-threaded: completions are delivered only when the
//! caller runs [`Session::process_events`].
//!
//! ```no_run
//! use usbhost::{ControlSetup, Session, SessionSettings, Transfer};
//!
//! # fn main() -> usbhost::Result<()> {
//! let session = Session::new(&SessionSettings::default())?;
//! let device = session.enumerate_devices()?.remove(0);
//! device.open()?;
//!
//! // GET_DESCRIPTOR(DEVICE)
//! let setup = ControlSetup { request_type: 0x80, request: 0x06, value: 0x0100, index: 0 };
//! let transfer = Transfer::control(&device, setup, 18);
//! transfer.submit()?;
//! while !transfer.is_complete() {
//!     session.process_events()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod device;
pub mod error;
pub mod libusb;
pub mod mock;
pub mod session;
pub mod transfer;

pub use backend::{
    Backend, ControlSetup, DeviceInfo, RawCompletion, Rejected, TransferId, TransferKind,
    TransferRequest, TransferStatus,
};
pub use common::{DebugLevel, DeviceFilter, SessionSettings};
pub use device::Device;
pub use error::{Error, InterfaceState, Result, SubmitError};
pub use libusb::{Libusb, LibusbHandle};
pub use mock::MockBackend;
pub use session::Session;
pub use transfer::{LogHandler, Transfer, TransferEvent, TransferHandler, TransferState};
