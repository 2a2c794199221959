//! Device identity and `adb devices -l` parsing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device serial as reported by the bridge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(serial: &str) -> Self {
        Self::new(serial)
    }
}

/// Device state value of an attached, authorized device
pub const STATE_READY: &str = "device";

/// One line of the device list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// `device`, `offline`, `unauthorized`, `recovery`, ...
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
}

impl DeviceInfo {
    /// Attached and authorized
    pub fn is_ready(&self) -> bool {
        self.state == STATE_READY
    }

    /// Model name when known, serial otherwise
    pub fn display_name(&self) -> &str {
        self.model.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Parse `adb devices -l` output
///
/// Skips the `List of devices attached` header and daemon start-up chatter
/// (`* daemon started successfully`). Every device is returned regardless of
/// its state.
///
/// ```rust
/// use adbcopy_core::channel::parse_device_list;
///
/// let out = "List of devices attached\n\
///            emulator-5554          device product:sdk_gphone64 model:Pixel_7 device:emu64a\n\
///            R58M12345AB            unauthorized usb:1-1\n";
/// let devices = parse_device_list(out);
/// assert_eq!(devices.len(), 2);
/// assert_eq!(devices[0].model.as_deref(), Some("Pixel_7"));
/// assert!(!devices[1].is_ready());
/// ```
pub fn parse_device_list(stdout: &str) -> Vec<DeviceInfo> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with("List of devices") && !line.starts_with('*')
        })
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;

            let mut model = None;
            let mut product = None;
            for attribute in parts {
                if let Some(value) = attribute.strip_prefix("model:") {
                    model = Some(value.to_string());
                } else if let Some(value) = attribute.strip_prefix("product:") {
                    product = Some(value.to_string());
                }
            }

            Some(DeviceInfo {
                id: DeviceId::new(serial),
                state: state.to_string(),
                model,
                product,
            })
        })
        .collect()
}
