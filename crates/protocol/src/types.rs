//! USB device and result type definitions
//!
//! This module defines the identifiers, device identities and result codes
//! shared by the device manager, its backends and its callers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device handle (open-session specific)
///
/// Returned when a device is successfully opened. Handles are allocated from a
/// monotonic counter and are never reused within a process, so a stale handle
/// can never alias a newer open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub u32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Vendor/product identity of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsbDeviceFilter {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
}

impl UsbDeviceFilter {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl fmt::Display for UsbDeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Transport backend identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsbApiType {
    /// No-op transport, hardware access disabled
    NullUsb,
    /// libusb transport
    LibUsb,
    /// WinUSB transport
    WinUsb,
}

impl UsbApiType {
    /// Every backend identifier, in config-name order
    pub const ALL: [UsbApiType; 3] = [UsbApiType::NullUsb, UsbApiType::LibUsb, UsbApiType::WinUsb];

    /// Name used for this backend in configuration files
    pub fn config_name(self) -> &'static str {
        match self {
            UsbApiType::NullUsb => "nullusb_api",
            UsbApiType::LibUsb => "libusb_api",
            UsbApiType::WinUsb => "winusb_api",
        }
    }

    /// Look up a backend by its configuration name
    pub fn from_config_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|api| api.config_name() == name)
    }
}

impl fmt::Display for UsbApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_name())
    }
}

/// Identity of a connected, unopened device
///
/// Produced by backend enumeration. Carries enough location information for
/// the backend that produced it to find the device again when opening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumeratedDevice {
    /// Backend that enumerated this device
    pub api_type: UsbApiType,
    /// Vendor/product identity
    pub filter: UsbDeviceFilter,
    /// Full system path of the device
    pub path: String,
    /// Bus and hub port chain, e.g. `1-4.2`
    pub port_path: String,
    /// Identifier stable across re-enumeration while the device stays plugged in
    pub unique_identifier: String,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub address: u8,
}

/// Outcome of a transfer request or device operation
///
/// Backend failures are always reported as one of these codes through the
/// completion callback, never as a Rust error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsbResultCode {
    Started,
    Canceled,
    Completed,
    GeneralError,
    BadHandle,
    NoMemory,
    SubmitFailed,
    DeviceNotOpen,
    TransferNotActive,
    TransferAlreadyStarted,
    Overflow,
    Pipe,
    TimedOut,
}

impl UsbResultCode {
    /// Fixed diagnostic string for this code
    pub fn error_string(self) -> &'static str {
        match self {
            UsbResultCode::Started => "Transfer Started",
            UsbResultCode::Canceled => "Transfer Cancelled",
            UsbResultCode::Completed => "Transfer Completed",
            UsbResultCode::GeneralError => "General USB Error",
            UsbResultCode::BadHandle => "Bad USB handle",
            UsbResultCode::NoMemory => "Out of Memory",
            UsbResultCode::SubmitFailed => "Transfer Submit Failed",
            UsbResultCode::DeviceNotOpen => "USB Device Not Open",
            UsbResultCode::TransferNotActive => "Transfer Not Active",
            UsbResultCode::TransferAlreadyStarted => "Transfer Already Active",
            UsbResultCode::Overflow => "Overflow Error",
            UsbResultCode::Pipe => "Pipe Error",
            UsbResultCode::TimedOut => "Transfer Timed Out",
        }
    }

    /// True for `Started`, `Completed` and `Canceled`
    pub fn is_success(self) -> bool {
        matches!(
            self,
            UsbResultCode::Started | UsbResultCode::Completed | UsbResultCode::Canceled
        )
    }

    pub fn is_error(self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for UsbResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.error_string())
    }
}
