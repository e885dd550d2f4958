//! Logging setup tests
//!
//! Kept in their own test binary: the global subscriber can only be
//! installed once per process.

use common::logging::{VALID_LEVELS, setup_from_config};
use common::{Error, UsbConfig, setup_logging};

#[test]
fn test_setup_logging_once_per_process() {
    let mut config = UsbConfig::default();
    config.logging.level = "debug".to_string();
    assert!(VALID_LEVELS.contains(&config.logging.level.as_str()));

    setup_from_config(&config).unwrap();
    tracing::debug!("logging initialized");

    let err = setup_logging("info").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
