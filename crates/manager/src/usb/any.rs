//! Backend selection
//!
//! `AnyUsbApi` is the closed set of shipped transports, resolved once from
//! configuration. It implements [`UsbApi`] by dispatching to the selected
//! variant, so the worker loop is written once against the trait.

use crate::usb::api::{BulkTransferBundle, TransferCompletion, TransferId, UsbApi};
use crate::usb::bundle::LibUsbBulkBundle;
use crate::usb::device::LibUsbDeviceState;
use crate::usb::libusb::LibUsbApi;
use crate::usb::null::{NullBulkBundle, NullDeviceState, NullUsbApi};
use protocol::{
    BulkBundleSpec, ControlTransfer, DeviceHandle, EndpointTransfer, EnumeratedDevice,
    UsbApiType, UsbDeviceFilter, UsbResultCode,
};
use tracing::info;

pub enum AnyUsbApi {
    Null(NullUsbApi),
    LibUsb(LibUsbApi),
}

pub enum AnyDeviceState {
    Null(NullDeviceState),
    LibUsb(LibUsbDeviceState),
}

pub enum AnyBulkBundle {
    Null(NullBulkBundle),
    LibUsb(LibUsbBulkBundle),
}

impl AnyUsbApi {
    /// Construct the backend for `api_type`
    ///
    /// WinUSB devices are driven through libusb, which uses WinUSB on Windows.
    pub fn from_type(api_type: UsbApiType) -> Self {
        match api_type {
            UsbApiType::NullUsb => {
                info!("Creating NullUSBApi");
                AnyUsbApi::Null(NullUsbApi)
            }
            UsbApiType::LibUsb => {
                info!("Creating LibUSBApi");
                AnyUsbApi::LibUsb(LibUsbApi::new())
            }
            UsbApiType::WinUsb => {
                info!("Creating LibUSBApi (WinUSB devices are served through libusb)");
                AnyUsbApi::LibUsb(LibUsbApi::new())
            }
        }
    }
}

macro_rules! state_mismatch {
    () => {
        unreachable!("device state does not belong to the active USB backend")
    };
}

impl BulkTransferBundle for AnyBulkBundle {
    fn handle(&self) -> DeviceHandle {
        match self {
            AnyBulkBundle::Null(b) => b.handle(),
            AnyBulkBundle::LibUsb(b) => b.handle(),
        }
    }

    fn initialize(&mut self) -> bool {
        match self {
            AnyBulkBundle::Null(b) => b.initialize(),
            AnyBulkBundle::LibUsb(b) => b.initialize(),
        }
    }

    fn start_transfers(&mut self) -> bool {
        match self {
            AnyBulkBundle::Null(b) => b.start_transfers(),
            AnyBulkBundle::LibUsb(b) => b.start_transfers(),
        }
    }

    fn cancel_transfers(&mut self) {
        match self {
            AnyBulkBundle::Null(b) => b.cancel_transfers(),
            AnyBulkBundle::LibUsb(b) => b.cancel_transfers(),
        }
    }

    fn active_transfer_count(&self) -> usize {
        match self {
            AnyBulkBundle::Null(b) => b.active_transfer_count(),
            AnyBulkBundle::LibUsb(b) => b.active_transfer_count(),
        }
    }
}

impl UsbApi for AnyUsbApi {
    type DeviceState = AnyDeviceState;
    type Bundle = AnyBulkBundle;

    fn api_type(&self) -> UsbApiType {
        match self {
            AnyUsbApi::Null(api) => api.api_type(),
            AnyUsbApi::LibUsb(api) => api.api_type(),
        }
    }

    fn startup(&mut self) -> common::Result<()> {
        match self {
            AnyUsbApi::Null(api) => api.startup(),
            AnyUsbApi::LibUsb(api) => api.startup(),
        }
    }

    fn shutdown(&mut self) {
        match self {
            AnyUsbApi::Null(api) => api.shutdown(),
            AnyUsbApi::LibUsb(api) => api.shutdown(),
        }
    }

    fn enumerate_devices(&mut self) -> Vec<EnumeratedDevice> {
        match self {
            AnyUsbApi::Null(api) => api.enumerate_devices(),
            AnyUsbApi::LibUsb(api) => api.enumerate_devices(),
        }
    }

    fn can_open_device(&mut self, device: &EnumeratedDevice) -> Result<(), String> {
        match self {
            AnyUsbApi::Null(api) => api.can_open_device(device),
            AnyUsbApi::LibUsb(api) => api.can_open_device(device),
        }
    }

    fn open_device(
        &mut self,
        device: &EnumeratedDevice,
        interface: u8,
        configuration: u8,
        reset: bool,
    ) -> Result<AnyDeviceState, UsbResultCode> {
        match self {
            AnyUsbApi::Null(api) => api
                .open_device(device, interface, configuration, reset)
                .map(AnyDeviceState::Null),
            AnyUsbApi::LibUsb(api) => api
                .open_device(device, interface, configuration, reset)
                .map(AnyDeviceState::LibUsb),
        }
    }

    fn close_device(&mut self, state: AnyDeviceState) {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => api.close_device(s),
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => api.close_device(s),
            _ => state_mismatch!(),
        }
    }

    fn device_filter(&self, state: &AnyDeviceState) -> UsbDeviceFilter {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => api.device_filter(s),
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => api.device_filter(s),
            _ => state_mismatch!(),
        }
    }

    fn device_path(&self, state: &AnyDeviceState) -> String {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => api.device_path(s),
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => api.device_path(s),
            _ => state_mismatch!(),
        }
    }

    fn device_port_path(&self, state: &AnyDeviceState) -> String {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => api.device_port_path(s),
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => api.device_port_path(s),
            _ => state_mismatch!(),
        }
    }

    fn submit_control_transfer(
        &mut self,
        state: &mut AnyDeviceState,
        id: TransferId,
        transfer: ControlTransfer,
    ) -> UsbResultCode {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => {
                api.submit_control_transfer(s, id, transfer)
            }
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => {
                api.submit_control_transfer(s, id, transfer)
            }
            _ => state_mismatch!(),
        }
    }

    fn submit_interrupt_transfer(
        &mut self,
        state: &mut AnyDeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => {
                api.submit_interrupt_transfer(s, id, transfer)
            }
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => {
                api.submit_interrupt_transfer(s, id, transfer)
            }
            _ => state_mismatch!(),
        }
    }

    fn submit_bulk_transfer(
        &mut self,
        state: &mut AnyDeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => {
                api.submit_bulk_transfer(s, id, transfer)
            }
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => {
                api.submit_bulk_transfer(s, id, transfer)
            }
            _ => state_mismatch!(),
        }
    }

    fn allocate_bulk_transfer_bundle(
        &mut self,
        state: &mut AnyDeviceState,
        spec: BulkBundleSpec,
    ) -> AnyBulkBundle {
        match (self, state) {
            (AnyUsbApi::Null(api), AnyDeviceState::Null(s)) => {
                AnyBulkBundle::Null(api.allocate_bulk_transfer_bundle(s, spec))
            }
            (AnyUsbApi::LibUsb(api), AnyDeviceState::LibUsb(s)) => {
                AnyBulkBundle::LibUsb(api.allocate_bulk_transfer_bundle(s, spec))
            }
            _ => state_mismatch!(),
        }
    }

    fn poll(&mut self, completions: &mut Vec<TransferCompletion>) {
        match self {
            AnyUsbApi::Null(api) => api.poll(completions),
            AnyUsbApi::LibUsb(api) => api.poll(completions),
        }
    }
}
