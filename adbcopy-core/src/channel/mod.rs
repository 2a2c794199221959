//! Device Command Channel
//!
//! Everything the engine needs from a device goes through the
//! [`CommandChannel`] trait: remote command execution, device discovery and
//! single-file streaming in both directions. The bridge itself is opaque;
//! only [`AdbChannel`] knows that commands end up as `adb` invocations.

mod r#trait;
pub mod adb;
pub mod device;

pub use adb::AdbChannel;
pub use device::{parse_device_list, DeviceId, DeviceInfo};
pub use r#trait::{CommandChannel, DEFAULT_COMMAND_TIMEOUT};
