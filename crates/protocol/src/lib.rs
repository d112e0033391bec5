//! Shared types for the USB async device manager
//!
//! This crate defines the data exchanged between callers, the device manager
//! worker thread and the transport backends: device handles and identities,
//! transfer requests and results, and the result-code taxonomy.
//!
//! # Example
//!
//! ```
//! use protocol::{DeviceHandle, TransferRequest, UsbResultCode};
//!
//! let request = TransferRequest::CancelBulkBundle { handle: DeviceHandle(1) };
//! let result = request.failure(UsbResultCode::TransferNotActive);
//!
//! assert_eq!(result.handle(), DeviceHandle(1));
//! assert_eq!(result.result_code().error_string(), "Transfer Not Active");
//! ```

pub mod transfer;
pub mod types;

pub use transfer::{
    BulkBundleSpec, BundleDataCallback, ControlTransfer, DEFAULT_TIMEOUT_MS, DIRECTION_IN,
    EndpointTransfer, TransferCallback, TransferRequest, TransferResult, TransferResultKind,
};
pub use types::{DeviceHandle, EnumeratedDevice, UsbApiType, UsbDeviceFilter, UsbResultCode};
