//! Error types for sessions, devices and transfers
//!
//! Library failures keep the underlying [`rusb::Error`] so callers can inspect
//! the native status through [`Error::status`]. Transfer outcomes are not
//! errors; they arrive as [`TransferStatus`](crate::TransferStatus) values.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to initialize USB session: {0}")]
    Initialization(#[source] rusb::Error),

    #[error("failed to open device: {0}")]
    DeviceOpen(#[source] rusb::Error),

    #[error("device is not open")]
    NotOpen,

    #[error("interface {interface} is {state}")]
    InterfaceState {
        interface: u8,
        state: InterfaceState,
    },

    #[error("interface {interface}: {source}")]
    Interface {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("transfer submission failed: {0}")]
    Submission(#[source] SubmitError),

    #[error("failed to cancel transfer: {0}")]
    Cancel(#[source] rusb::Error),

    #[error("failed to handle USB events: {0}")]
    Events(#[source] rusb::Error),
}

impl Error {
    /// Native library status behind this error, if any
    pub fn status(&self) -> Option<rusb::Error> {
        match self {
            Error::Initialization(e)
            | Error::DeviceOpen(e)
            | Error::Interface { source: e, .. }
            | Error::Cancel(e)
            | Error::Events(e) => Some(*e),
            Error::Submission(SubmitError::Rejected(e)) => Some(*e),
            Error::NotOpen | Error::InterfaceState { .. } | Error::Submission(_) => None,
        }
    }
}

/// Why an interface operation was refused before reaching the library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    AlreadyClaimed,
    NotClaimed,
}

impl fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceState::AlreadyClaimed => f.write_str("already claimed"),
            InterfaceState::NotClaimed => f.write_str("not claimed"),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("device handle is not open")]
    DeviceNotOpen,

    #[error("transfer is already in flight")]
    InFlight,

    #[error("rejected by the USB library: {0}")]
    Rejected(rusb::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_carried() {
        assert_eq!(
            Error::DeviceOpen(rusb::Error::Access).status(),
            Some(rusb::Error::Access)
        );
        assert_eq!(
            Error::Submission(SubmitError::Rejected(rusb::Error::NoMem)).status(),
            Some(rusb::Error::NoMem)
        );
        assert_eq!(Error::Submission(SubmitError::DeviceNotOpen).status(), None);
        assert_eq!(Error::NotOpen.status(), None);
    }

    #[test]
    fn test_interface_state_message() {
        let err = Error::InterfaceState {
            interface: 2,
            state: InterfaceState::AlreadyClaimed,
        };
        assert_eq!(err.to_string(), "interface 2 is already claimed");

        let err = Error::InterfaceState {
            interface: 0,
            state: InterfaceState::NotClaimed,
        };
        assert_eq!(err.to_string(), "interface 0 is not claimed");
    }
}
