//! Port pool configuration
//!
//! Defines the range shared by public listeners and private tunnels.

use crate::helper::{DEFAULT_PORT_RANGE_END, DEFAULT_PORT_RANGE_START};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Default first port
fn default_start() -> u16 {
    DEFAULT_PORT_RANGE_START
}

/// Default last port
fn default_end() -> u16 {
    DEFAULT_PORT_RANGE_END
}

/// Port range configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PortRangeConfig {
    /// First allocatable port (inclusive)
    #[serde(default = "default_start")]
    pub start: u16,

    /// Last allocatable port (inclusive)
    #[serde(default = "default_end")]
    pub end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        PortRangeConfig {
            start: default_start(),
            end: default_end(),
        }
    }
}

impl PortRangeConfig {
    /// The configured range
    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    /// Whether the range holds no port at all
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate the port range
    pub fn validate(&self) -> Result<(), String> {
        if self.start == 0 {
            return Err("port range cannot start at 0".to_string());
        }
        if self.start > self.end {
            return Err(format!(
                "port range start {} is greater than end {}",
                self.start, self.end
            ));
        }
        Ok(())
    }
}
