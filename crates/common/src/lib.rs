//! Common utilities for the USB device manager
//!
//! This crate provides error handling, logging setup, and the bounded channel
//! bridge connecting caller threads to the USB worker thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{
    CompletedTransfer, DEFAULT_QUEUE_CAPACITY, OpenDeviceInfo, TransferStats, UsbBridge,
    UsbCommand, UsbWorker, create_usb_bridge,
};
pub use error::{Error, Result};
pub use logging::{setup_logging, setup_test_logging};
