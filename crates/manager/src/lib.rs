//! Asynchronous USB device manager
//!
//! Enumerates devices, opens them by handle and runs control, interrupt,
//! bulk and streaming bulk transfers on a dedicated worker thread. Results
//! come back as callbacks, invoked on whichever thread calls
//! [`DeviceManager::update`].
//!
//! ```no_run
//! use manager::{DeviceManager, ManagerConfig};
//!
//! # fn main() -> common::Result<()> {
//! let config = ManagerConfig::load_or_default();
//! let mut manager = DeviceManager::new(config.usb);
//! manager.startup()?;
//!
//! for device in manager.enumerate() {
//!     println!("{} {}", device.filter, device.path);
//! }
//!
//! manager.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use config::{CONFIG_VERSION, ManagerConfig, UsbSettings};
pub use usb::{AnyUsbApi, DeviceManager, UsbApi, UsbDeviceEnumerator};
