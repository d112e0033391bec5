//! No-op transport
//!
//! Used to disable hardware access entirely. Nothing enumerates, nothing
//! opens, and every submission fails gracefully.

use crate::usb::api::{BulkTransferBundle, TransferCompletion, TransferId, UsbApi};
use protocol::{
    BulkBundleSpec, ControlTransfer, DeviceHandle, EndpointTransfer, EnumeratedDevice,
    UsbApiType, UsbDeviceFilter, UsbResultCode,
};
use tracing::debug;

#[derive(Debug, Default)]
pub struct NullUsbApi;

/// Placeholder device state; `NullUsbApi` never hands one out
#[derive(Debug)]
pub struct NullDeviceState;

#[derive(Debug)]
pub struct NullBulkBundle {
    handle: DeviceHandle,
}

impl BulkTransferBundle for NullBulkBundle {
    fn handle(&self) -> DeviceHandle {
        self.handle
    }

    fn initialize(&mut self) -> bool {
        false
    }

    fn start_transfers(&mut self) -> bool {
        false
    }

    fn cancel_transfers(&mut self) {}

    fn active_transfer_count(&self) -> usize {
        0
    }
}

impl UsbApi for NullUsbApi {
    type DeviceState = NullDeviceState;
    type Bundle = NullBulkBundle;

    fn api_type(&self) -> UsbApiType {
        UsbApiType::NullUsb
    }

    fn startup(&mut self) -> common::Result<()> {
        debug!("Null USB API started, hardware access disabled");
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn enumerate_devices(&mut self) -> Vec<EnumeratedDevice> {
        Vec::new()
    }

    fn can_open_device(&mut self, _device: &EnumeratedDevice) -> Result<(), String> {
        Err("USB access is disabled (nullusb_api)".to_string())
    }

    fn open_device(
        &mut self,
        _device: &EnumeratedDevice,
        _interface: u8,
        _configuration: u8,
        _reset: bool,
    ) -> Result<NullDeviceState, UsbResultCode> {
        Err(UsbResultCode::DeviceNotOpen)
    }

    fn close_device(&mut self, _state: NullDeviceState) {}

    fn device_filter(&self, _state: &NullDeviceState) -> UsbDeviceFilter {
        UsbDeviceFilter::default()
    }

    fn device_path(&self, _state: &NullDeviceState) -> String {
        String::new()
    }

    fn device_port_path(&self, _state: &NullDeviceState) -> String {
        String::new()
    }

    fn submit_control_transfer(
        &mut self,
        _state: &mut NullDeviceState,
        _id: TransferId,
        _transfer: ControlTransfer,
    ) -> UsbResultCode {
        UsbResultCode::SubmitFailed
    }

    fn submit_interrupt_transfer(
        &mut self,
        _state: &mut NullDeviceState,
        _id: TransferId,
        _transfer: EndpointTransfer,
    ) -> UsbResultCode {
        UsbResultCode::SubmitFailed
    }

    fn submit_bulk_transfer(
        &mut self,
        _state: &mut NullDeviceState,
        _id: TransferId,
        _transfer: EndpointTransfer,
    ) -> UsbResultCode {
        UsbResultCode::SubmitFailed
    }

    fn allocate_bulk_transfer_bundle(
        &mut self,
        _state: &mut NullDeviceState,
        spec: BulkBundleSpec,
    ) -> NullBulkBundle {
        NullBulkBundle {
            handle: spec.handle,
        }
    }

    fn poll(&mut self, _completions: &mut Vec<TransferCompletion>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_null_api_refuses_everything() {
        let mut api = NullUsbApi;
        api.startup().unwrap();
        assert!(api.enumerate_devices().is_empty());

        let mut state = NullDeviceState;
        let code = api.submit_bulk_transfer(
            &mut state,
            TransferId(1),
            EndpointTransfer {
                handle: DeviceHandle(1),
                endpoint: 0x81,
                length: 8,
                data: Vec::new(),
                timeout_ms: 10,
            },
        );
        assert_eq!(code, UsbResultCode::SubmitFailed);

        let mut bundle = api.allocate_bulk_transfer_bundle(
            &mut state,
            BulkBundleSpec {
                handle: DeviceHandle(1),
                endpoint: 0x81,
                transfer_size: 64,
                in_flight_transfers: 1,
                on_data: Arc::new(|_| {}),
            },
        );
        assert!(!bundle.initialize());
        assert_eq!(bundle.active_transfer_count(), 0);
    }
}
