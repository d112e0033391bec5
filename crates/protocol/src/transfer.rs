//! Transfer requests and results
//!
//! A request is immutable once submitted and is paired with exactly one
//! [`TransferCallback`]. Every accepted request produces exactly one
//! [`TransferResult`], delivered to that callback.

use crate::types::{DeviceHandle, UsbResultCode};
use std::fmt;
use std::sync::Arc;

/// Bit 7 of `bmRequestType` / the endpoint address selects device-to-host
pub const DIRECTION_IN: u8 = 0x80;

/// Default timeout for single-shot transfers
pub const DEFAULT_TIMEOUT_MS: u32 = 5000;

/// Completion unit of work for one request; runs on the thread calling `update()`
pub type TransferCallback = Box<dyn FnOnce(TransferResult) + Send + 'static>;

/// Receives each chunk of data read by a bulk transfer bundle
pub type BundleDataCallback = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Control transfer on endpoint 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTransfer {
    pub handle: DeviceHandle,
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength, the number of bytes to read for IN transfers
    pub length: u16,
    /// Payload for OUT transfers
    pub data: Vec<u8>,
    pub timeout_ms: u32,
}

impl ControlTransfer {
    pub fn is_in(&self) -> bool {
        self.request_type & DIRECTION_IN != 0
    }
}

/// Single-shot interrupt or bulk transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTransfer {
    pub handle: DeviceHandle,
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    /// Number of bytes to read for IN endpoints
    pub length: usize,
    /// Payload for OUT endpoints
    pub data: Vec<u8>,
    pub timeout_ms: u32,
}

impl EndpointTransfer {
    pub fn is_in(&self) -> bool {
        self.endpoint & DIRECTION_IN != 0
    }
}

/// Parameters of a streaming bulk transfer bundle
#[derive(Clone)]
pub struct BulkBundleSpec {
    pub handle: DeviceHandle,
    /// IN endpoint to stream from
    pub endpoint: u8,
    /// Size of each transfer buffer
    pub transfer_size: usize,
    /// Number of transfers kept outstanding at once
    pub in_flight_transfers: usize,
    pub on_data: BundleDataCallback,
}

impl fmt::Debug for BulkBundleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkBundleSpec")
            .field("handle", &self.handle)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("transfer_size", &self.transfer_size)
            .field("in_flight_transfers", &self.in_flight_transfers)
            .finish_non_exhaustive()
    }
}

/// Request submitted to the device manager
#[derive(Debug, Clone)]
pub enum TransferRequest {
    Control(ControlTransfer),
    Interrupt(EndpointTransfer),
    Bulk(EndpointTransfer),
    StartBulkBundle(BulkBundleSpec),
    CancelBulkBundle { handle: DeviceHandle },
}

impl TransferRequest {
    /// Device the request targets
    pub fn handle(&self) -> DeviceHandle {
        match self {
            TransferRequest::Control(t) => t.handle,
            TransferRequest::Interrupt(t) | TransferRequest::Bulk(t) => t.handle,
            TransferRequest::StartBulkBundle(spec) => spec.handle,
            TransferRequest::CancelBulkBundle { handle } => *handle,
        }
    }

    /// Kind of result this request produces
    pub fn result_kind(&self) -> TransferResultKind {
        match self {
            TransferRequest::Control(_) => TransferResultKind::Control,
            TransferRequest::Interrupt(_) => TransferResultKind::Interrupt,
            TransferRequest::Bulk(_) => TransferResultKind::Bulk,
            TransferRequest::StartBulkBundle(_) | TransferRequest::CancelBulkBundle { .. } => {
                TransferResultKind::BulkBundle
            }
        }
    }

    /// Result reporting that this request failed with `result_code`
    pub fn failure(&self, result_code: UsbResultCode) -> TransferResult {
        TransferResult::empty(self.result_kind(), self.handle(), result_code)
    }
}

/// Discriminant of [`TransferResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferResultKind {
    Control,
    Interrupt,
    Bulk,
    BulkBundle,
}

/// Result delivered to a request's callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    Control {
        handle: DeviceHandle,
        result_code: UsbResultCode,
        /// Bytes read for IN transfers
        data: Vec<u8>,
    },
    Interrupt {
        handle: DeviceHandle,
        result_code: UsbResultCode,
        data: Vec<u8>,
    },
    Bulk {
        handle: DeviceHandle,
        result_code: UsbResultCode,
        data: Vec<u8>,
    },
    /// Outcome of starting or canceling a bulk transfer bundle
    BulkBundle {
        handle: DeviceHandle,
        result_code: UsbResultCode,
    },
}

impl TransferResult {
    /// Result of the given kind with no payload
    pub fn empty(kind: TransferResultKind, handle: DeviceHandle, result_code: UsbResultCode) -> Self {
        Self::with_data(kind, handle, result_code, Vec::new())
    }

    pub fn with_data(
        kind: TransferResultKind,
        handle: DeviceHandle,
        result_code: UsbResultCode,
        data: Vec<u8>,
    ) -> Self {
        match kind {
            TransferResultKind::Control => TransferResult::Control {
                handle,
                result_code,
                data,
            },
            TransferResultKind::Interrupt => TransferResult::Interrupt {
                handle,
                result_code,
                data,
            },
            TransferResultKind::Bulk => TransferResult::Bulk {
                handle,
                result_code,
                data,
            },
            TransferResultKind::BulkBundle => TransferResult::BulkBundle {
                handle,
                result_code,
            },
        }
    }

    pub fn kind(&self) -> TransferResultKind {
        match self {
            TransferResult::Control { .. } => TransferResultKind::Control,
            TransferResult::Interrupt { .. } => TransferResultKind::Interrupt,
            TransferResult::Bulk { .. } => TransferResultKind::Bulk,
            TransferResult::BulkBundle { .. } => TransferResultKind::BulkBundle,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        match self {
            TransferResult::Control { handle, .. }
            | TransferResult::Interrupt { handle, .. }
            | TransferResult::Bulk { handle, .. }
            | TransferResult::BulkBundle { handle, .. } => *handle,
        }
    }

    pub fn result_code(&self) -> UsbResultCode {
        match self {
            TransferResult::Control { result_code, .. }
            | TransferResult::Interrupt { result_code, .. }
            | TransferResult::Bulk { result_code, .. }
            | TransferResult::BulkBundle { result_code, .. } => *result_code,
        }
    }

    /// Payload read by the transfer; empty for bundle results and OUT transfers
    pub fn data(&self) -> &[u8] {
        match self {
            TransferResult::Control { data, .. }
            | TransferResult::Interrupt { data, .. }
            | TransferResult::Bulk { data, .. } => data,
            TransferResult::BulkBundle { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_mirrors_request_kind() {
        let request = TransferRequest::CancelBulkBundle {
            handle: DeviceHandle(3),
        };
        let result = request.failure(UsbResultCode::SubmitFailed);
        assert_eq!(result.kind(), TransferResultKind::BulkBundle);
        assert_eq!(result.handle(), DeviceHandle(3));
        assert_eq!(result.result_code(), UsbResultCode::SubmitFailed);
        assert!(result.data().is_empty());
    }

    #[test]
    fn test_direction_bits() {
        let transfer = EndpointTransfer {
            handle: DeviceHandle(1),
            endpoint: 0x81,
            length: 64,
            data: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        };
        assert!(transfer.is_in());

        let out = EndpointTransfer {
            endpoint: 0x02,
            ..transfer
        };
        assert!(!out.is_in());
    }

    #[test]
    fn test_bundle_spec_debug_hides_callback() {
        let spec = BulkBundleSpec {
            handle: DeviceHandle(1),
            endpoint: 0x81,
            transfer_size: 512,
            in_flight_transfers: 4,
            on_data: Arc::new(|_| {}),
        };
        let text = format!("{:?}", spec);
        assert!(text.contains("0x81"));
        assert!(text.contains("in_flight_transfers: 4"));
    }
}
