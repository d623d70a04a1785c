//! Device connection seam.

use std::sync::Arc;

use crate::facade::DeviceFacade;
use crate::setup::DeviceSetup;

/// Starts connections to devices.
///
/// `start` returns at once; the outcome is reported to `facade` through
/// `on_device_connected` or `on_device_failed`.
pub trait DeviceConnector: Send + Sync {
    fn start(&self, setup: &DeviceSetup, facade: Arc<dyn DeviceFacade>) -> Box<dyn DeviceConnection>;
}

/// A started (possibly still connecting) device connection.
pub trait DeviceConnection: Send + Sync {
    /// Tear the connection down without further facade callbacks.
    fn stop(&self);
}
