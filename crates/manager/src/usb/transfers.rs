//! USB transfer execution
//!
//! Runs single-shot control, interrupt and bulk transfers through rusb's
//! synchronous API and maps rusb errors to result codes.

use protocol::{ControlTransfer, EndpointTransfer, UsbResultCode};
use rusb::{Context, DeviceHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Which endpoint-transfer flavour to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Interrupt,
    Bulk,
}

fn timeout(timeout_ms: u32) -> Duration {
    Duration::from_millis(u64::from(timeout_ms))
}

/// Execute a control transfer
///
/// IN transfers read up to `length` bytes; OUT transfers send `data` and
/// return no payload.
pub fn execute_control_transfer(
    handle: &DeviceHandle<Context>,
    transfer: &ControlTransfer,
) -> Result<Vec<u8>, UsbResultCode> {
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, length={}",
        transfer.request_type, transfer.request, transfer.value, transfer.index, transfer.length
    );

    let result = if transfer.is_in() {
        let mut buffer = vec![0u8; usize::from(transfer.length)];
        handle
            .read_control(
                transfer.request_type,
                transfer.request,
                transfer.value,
                transfer.index,
                &mut buffer,
                timeout(transfer.timeout_ms),
            )
            .map(|len| {
                buffer.truncate(len);
                buffer
            })
    } else {
        handle
            .write_control(
                transfer.request_type,
                transfer.request,
                transfer.value,
                transfer.index,
                &transfer.data,
                timeout(transfer.timeout_ms),
            )
            .map(|_| Vec::new())
    };

    result.map_err(|e| {
        warn!("Control transfer failed: {}", e);
        map_rusb_error(e)
    })
}

/// Execute an interrupt or bulk transfer
pub fn execute_endpoint_transfer(
    handle: &DeviceHandle<Context>,
    kind: EndpointKind,
    transfer: &EndpointTransfer,
) -> Result<Vec<u8>, UsbResultCode> {
    debug!(
        "{:?} transfer: endpoint={:#x}, length={}, out_len={}, timeout={}ms",
        kind,
        transfer.endpoint,
        transfer.length,
        transfer.data.len(),
        transfer.timeout_ms
    );

    let timeout = timeout(transfer.timeout_ms);
    let result = if transfer.is_in() {
        let mut buffer = vec![0u8; transfer.length];
        let read = match kind {
            EndpointKind::Interrupt => handle.read_interrupt(transfer.endpoint, &mut buffer, timeout),
            EndpointKind::Bulk => handle.read_bulk(transfer.endpoint, &mut buffer, timeout),
        };
        read.map(|len| {
            buffer.truncate(len);
            buffer
        })
    } else {
        let written = match kind {
            EndpointKind::Interrupt => handle.write_interrupt(transfer.endpoint, &transfer.data, timeout),
            EndpointKind::Bulk => handle.write_bulk(transfer.endpoint, &transfer.data, timeout),
        };
        written.map(|_| Vec::new())
    };

    result.map_err(|e| {
        warn!("{:?} transfer on endpoint {:#x} failed: {}", kind, transfer.endpoint, e);
        map_rusb_error(e)
    })
}

/// Map rusb::Error to a result code
pub fn map_rusb_error(err: rusb::Error) -> UsbResultCode {
    match err {
        rusb::Error::Timeout => UsbResultCode::TimedOut,
        rusb::Error::Pipe => UsbResultCode::Pipe,
        rusb::Error::Overflow => UsbResultCode::Overflow,
        rusb::Error::NoDevice => UsbResultCode::DeviceNotOpen,
        rusb::Error::NoMem => UsbResultCode::NoMemory,
        rusb::Error::InvalidParam | rusb::Error::NotSupported | rusb::Error::Busy => {
            UsbResultCode::SubmitFailed
        }
        _ => UsbResultCode::GeneralError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), UsbResultCode::TimedOut);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), UsbResultCode::Pipe);
        assert_eq!(map_rusb_error(rusb::Error::Overflow), UsbResultCode::Overflow);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), UsbResultCode::DeviceNotOpen);
        assert_eq!(map_rusb_error(rusb::Error::Busy), UsbResultCode::SubmitFailed);
        assert_eq!(map_rusb_error(rusb::Error::Io), UsbResultCode::GeneralError);
    }

    #[test]
    fn test_timeout_conversion() {
        assert_eq!(timeout(250), Duration::from_millis(250));
    }
}
