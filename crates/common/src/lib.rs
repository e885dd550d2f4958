//! Common utilities for usbhost
//!
//! Shared functionality for the USB host crates: the configuration file,
//! VID:PID device filters, error handling and logging setup.

pub mod config;
pub mod error;
pub mod filter;
pub mod logging;

pub use config::{DebugLevel, DeviceSettings, LoggingSettings, SessionSettings, UsbConfig};
pub use error::{Error, Result};
pub use filter::DeviceFilter;
pub use logging::setup_logging;
