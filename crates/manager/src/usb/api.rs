//! Transport backend capability
//!
//! A backend turns manager requests into real USB traffic. It owns the
//! per-device state it hands out from `open_device`; the worker only stores
//! that state in its handle table and passes it back on later calls.

use protocol::{
    BulkBundleSpec, ControlTransfer, DeviceHandle, EndpointTransfer, EnumeratedDevice,
    TransferResult, UsbApiType, UsbDeviceFilter, UsbResultCode,
};
use std::fmt;

/// Worker-assigned identifier of one submitted single-shot transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Final outcome of a transfer the backend accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub id: TransferId,
    pub result: TransferResult,
}

/// Set of concurrently outstanding bulk reads bound to one open device
///
/// Dropping a bundle destroys it and must not block, even while transfers
/// are still active.
pub trait BulkTransferBundle: Send {
    /// Device the bundle streams from
    fn handle(&self) -> DeviceHandle;

    /// Allocate transfer resources; `false` means nothing could be allocated
    fn initialize(&mut self) -> bool;

    /// Submit every transfer; `false` if any submission failed
    fn start_transfers(&mut self) -> bool;

    /// Request cancellation of every active transfer without waiting
    fn cancel_transfers(&mut self);

    /// Transfers still owned by the transport
    fn active_transfer_count(&self) -> usize;
}

/// Capability interface every transport backend implements
///
/// Submissions return the *submission* outcome. `Started` and `Completed`
/// oblige the backend to return exactly one [`TransferCompletion`] for that
/// id from a later [`UsbApi::poll`]; any other code means the backend has
/// forgotten the id.
pub trait UsbApi: Send + 'static {
    type DeviceState: Send;
    type Bundle: BulkTransferBundle;

    fn api_type(&self) -> UsbApiType;

    /// Acquire the transport's global context
    fn startup(&mut self) -> common::Result<()>;

    /// Release the global context; safe to call repeatedly
    fn shutdown(&mut self);

    /// Snapshot the connected devices without opening them
    fn enumerate_devices(&mut self) -> Vec<EnumeratedDevice>;

    /// Check whether a device could be opened, with a reason when it cannot
    fn can_open_device(&mut self, device: &EnumeratedDevice) -> Result<(), String>;

    fn open_device(
        &mut self,
        device: &EnumeratedDevice,
        interface: u8,
        configuration: u8,
        reset: bool,
    ) -> Result<Self::DeviceState, UsbResultCode>;

    /// Release device resources; outstanding transfers must already be canceled
    fn close_device(&mut self, state: Self::DeviceState);

    fn device_filter(&self, state: &Self::DeviceState) -> UsbDeviceFilter;

    fn device_path(&self, state: &Self::DeviceState) -> String;

    fn device_port_path(&self, state: &Self::DeviceState) -> String;

    fn submit_control_transfer(
        &mut self,
        state: &mut Self::DeviceState,
        id: TransferId,
        transfer: ControlTransfer,
    ) -> UsbResultCode;

    fn submit_interrupt_transfer(
        &mut self,
        state: &mut Self::DeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode;

    fn submit_bulk_transfer(
        &mut self,
        state: &mut Self::DeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode;

    fn allocate_bulk_transfer_bundle(
        &mut self,
        state: &mut Self::DeviceState,
        spec: BulkBundleSpec,
    ) -> Self::Bundle;

    /// Drive transport event processing, appending finished transfers
    ///
    /// Non-blocking per call, but may spend backend-bounded time waiting.
    fn poll(&mut self, completions: &mut Vec<TransferCompletion>);
}
