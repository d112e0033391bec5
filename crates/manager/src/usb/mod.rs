//! USB subsystem
//!
//! Handles device enumeration, device lifecycle and transfer execution.
//!
//! The subsystem is split into:
//! - A backend capability ([`UsbApi`]) with null and libusb transports
//! - A dedicated worker thread that owns the backend, the handle table and
//!   all transfer bookkeeping
//! - The [`DeviceManager`] facade callers use from any thread
//!
//! The worker runs outside any async runtime; callers talk to it only
//! through the bounded queues in `common::channel`.

pub mod any;
pub mod api;
pub mod bundle;
pub mod device;
pub mod enumerator;
pub mod libusb;
pub mod manager;
pub mod null;
pub mod transfers;
pub mod worker;

// Re-export public types
pub use any::AnyUsbApi;
pub use api::{BulkTransferBundle, TransferCompletion, TransferId, UsbApi};
pub use enumerator::UsbDeviceEnumerator;
pub use libusb::LibUsbApi;
pub use manager::DeviceManager;
pub use null::NullUsbApi;
pub use worker::{MAX_CLEANUP_POLL_ATTEMPTS, SpawnError, UsbWorkerThread, spawn_usb_worker};
