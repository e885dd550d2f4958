//! VID:PID device filters
//!
//! Filters are written as `VID:PID`, each half either a `0x`-prefixed hex id
//! of 1-4 digits or `*`. Examples: `0x1234:0x5678`, `0x04f9:*`, `*:*`.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A parsed `VID:PID` filter. `None` on either side matches any id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Filter that accepts every device
    pub const ANY: DeviceFilter = DeviceFilter {
        vendor_id: None,
        product_id: None,
    };

    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Check whether a VID/PID pair passes this filter
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// Check a VID/PID pair against a list of filters
    ///
    /// An empty list accepts every device.
    pub fn any_matches(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }
}

impl FromStr for DeviceFilter {
    type Err = Error;

    fn from_str(filter: &str) -> Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(Error::Filter {
                filter: filter.to_string(),
                reason: "expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')".to_string(),
            });
        }

        Ok(Self {
            vendor_id: parse_id(filter, parts[0], "VID")?,
            product_id: parse_id(filter, parts[1], "PID")?,
        })
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(vid) => write!(f, "{:#06x}", vid)?,
            None => write!(f, "*")?,
        }
        match self.product_id {
            Some(pid) => write!(f, ":{:#06x}", pid),
            None => write!(f, ":*"),
        }
    }
}

fn parse_id(filter: &str, id: &str, name: &str) -> Result<Option<u16>> {
    if id == "*" {
        return Ok(None);
    }

    let invalid = |reason: String| Error::Filter {
        filter: filter.to_string(),
        reason,
    };

    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| invalid(format!("{} '{}' must start with '0x'", name, id)))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(invalid(format!(
            "{} '{}' hex part must be 1-4 digits",
            name, id
        )));
    }

    // from_str_radix alone would also take a leading sign
    if !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid(format!(
            "{} '{}' is not a valid hex number",
            name, id
        )));
    }

    u16::from_str_radix(hex_part, 16)
        .map(Some)
        .map_err(|_| invalid(format!("{} '{}' is not a valid hex number", name, id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        assert_eq!(
            "0x1234:0x5678".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::new(Some(0x1234), Some(0x5678))
        );
        assert_eq!(
            "0xABCD:*".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::new(Some(0xabcd), None)
        );
        assert_eq!(
            "*:0X01".parse::<DeviceFilter>().unwrap(),
            DeviceFilter::new(None, Some(0x0001))
        );
        assert_eq!("*:*".parse::<DeviceFilter>().unwrap(), DeviceFilter::ANY);
    }

    #[test]
    fn test_parse_invalid() {
        assert!("1234:5678".parse::<DeviceFilter>().is_err());
        assert!("0x1234".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678:0x9abc".parse::<DeviceFilter>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x:*".parse::<DeviceFilter>().is_err());
    }

    #[test]
    fn test_parse_rejects_signs() {
        assert!("0x+1:*".parse::<DeviceFilter>().is_err());
        assert!("*:0x+fff".parse::<DeviceFilter>().is_err());
        assert!("0x-1:*".parse::<DeviceFilter>().is_err());
        assert!(matches!(
            "0x+1:*".parse::<DeviceFilter>(),
            Err(Error::Filter { .. })
        ));
    }

    #[test]
    fn test_filter_logic() {
        let filters = vec![
            DeviceFilter::new(Some(0x1234), Some(0x5678)),
            DeviceFilter::new(Some(0xabcd), None),
        ];

        assert!(DeviceFilter::any_matches(&filters, 0x1234, 0x5678));
        assert!(DeviceFilter::any_matches(&filters, 0xabcd, 0x1111));
        assert!(DeviceFilter::any_matches(&filters, 0xabcd, 0x9999));

        assert!(!DeviceFilter::any_matches(&filters, 0x1234, 0x9999));
        assert!(!DeviceFilter::any_matches(&filters, 0x9999, 0x5678));

        assert!(DeviceFilter::any_matches(&[], 0x1234, 0x5678));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let filter = DeviceFilter::new(Some(0x04f9), None);
        assert_eq!(filter.to_string(), "0x04f9:*");
        assert_eq!(filter.to_string().parse::<DeviceFilter>().unwrap(), filter);
    }
}
