//! libusb transport backend (rusb)

use crate::usb::api::{TransferCompletion, TransferId, UsbApi};
use crate::usb::bundle::LibUsbBulkBundle;
use crate::usb::device::{LibUsbDeviceState, describe_device, format_port_path};
use crate::usb::transfers::{EndpointKind, execute_control_transfer, execute_endpoint_transfer};
use protocol::{
    BulkBundleSpec, ControlTransfer, EndpointTransfer, EnumeratedDevice, TransferResult,
    TransferResultKind, UsbApiType, UsbDeviceFilter, UsbResultCode,
};
use rusb::{Context, Device, UsbContext};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest a single `poll` waits in libusb event handling
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Backend over a libusb context
///
/// Single-shot transfers run synchronously inside `submit_*`; their results
/// are queued and handed back by the next `poll`.
#[derive(Default)]
pub struct LibUsbApi {
    context: Option<Context>,
    completions: Vec<TransferCompletion>,
}

impl LibUsbApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locate the live device matching an enumeration entry
    fn find_device(&self, identity: &EnumeratedDevice) -> Option<Device<Context>> {
        let context = self.context.as_ref()?;
        let devices = match context.devices() {
            Ok(list) => list,
            Err(e) => {
                warn!("Failed to list USB devices: {}", e);
                return None;
            }
        };

        devices.iter().find(|device| {
            is_same_device(
                identity,
                device.bus_number(),
                device.address(),
                &device.port_numbers().unwrap_or_default(),
            )
        })
    }

    fn complete(
        &mut self,
        id: TransferId,
        kind: TransferResultKind,
        handle: protocol::DeviceHandle,
        outcome: Result<Vec<u8>, UsbResultCode>,
    ) -> UsbResultCode {
        match outcome {
            Ok(data) => {
                self.completions.push(TransferCompletion {
                    id,
                    result: TransferResult::with_data(kind, handle, UsbResultCode::Completed, data),
                });
                UsbResultCode::Completed
            }
            Err(code) => code,
        }
    }

    fn submit_endpoint_transfer(
        &mut self,
        state: &mut LibUsbDeviceState,
        id: TransferId,
        kind: EndpointKind,
        transfer: EndpointTransfer,
    ) -> UsbResultCode {
        let outcome = execute_endpoint_transfer(state.handle(), kind, &transfer);
        let result_kind = match kind {
            EndpointKind::Interrupt => TransferResultKind::Interrupt,
            EndpointKind::Bulk => TransferResultKind::Bulk,
        };
        self.complete(id, result_kind, transfer.handle, outcome)
    }
}

impl UsbApi for LibUsbApi {
    type DeviceState = LibUsbDeviceState;
    type Bundle = LibUsbBulkBundle;

    fn api_type(&self) -> UsbApiType {
        UsbApiType::LibUsb
    }

    fn startup(&mut self) -> common::Result<()> {
        if self.context.is_none() {
            let context = Context::new()
                .map_err(|e| common::Error::Usb(format!("Failed to create libusb context: {}", e)))?;
            self.context = Some(context);
            info!("libusb context initialized");
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.context.take().is_some() {
            self.completions.clear();
            info!("libusb context released");
        }
    }

    fn enumerate_devices(&mut self) -> Vec<EnumeratedDevice> {
        let Some(context) = self.context.as_ref() else {
            return Vec::new();
        };

        match context.devices() {
            Ok(list) => {
                let devices: Vec<_> = list.iter().filter_map(|d| describe_device(&d)).collect();
                debug!("Enumerated {} devices", devices.len());
                devices
            }
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                Vec::new()
            }
        }
    }

    fn can_open_device(&mut self, device: &EnumeratedDevice) -> Result<(), String> {
        let live = self
            .find_device(device)
            .ok_or_else(|| format!("device {} is no longer connected", device.path))?;

        live.open()
            .map(|_handle| ())
            .map_err(|e| format!("cannot open {}: {}", device.path, e))
    }

    fn open_device(
        &mut self,
        device: &EnumeratedDevice,
        interface: u8,
        configuration: u8,
        reset: bool,
    ) -> Result<LibUsbDeviceState, UsbResultCode> {
        if self.context.is_none() {
            return Err(UsbResultCode::GeneralError);
        }

        let live = self.find_device(device).ok_or_else(|| {
            warn!("Device {} not found when opening", device.path);
            UsbResultCode::DeviceNotOpen
        })?;

        LibUsbDeviceState::open(&live, device, interface, configuration, reset)
    }

    fn close_device(&mut self, state: LibUsbDeviceState) {
        state.close();
    }

    fn device_filter(&self, state: &LibUsbDeviceState) -> UsbDeviceFilter {
        state.filter()
    }

    fn device_path(&self, state: &LibUsbDeviceState) -> String {
        state.path().to_string()
    }

    fn device_port_path(&self, state: &LibUsbDeviceState) -> String {
        state.port_path().to_string()
    }

    fn submit_control_transfer(
        &mut self,
        state: &mut LibUsbDeviceState,
        id: TransferId,
        transfer: ControlTransfer,
    ) -> UsbResultCode {
        let outcome = execute_control_transfer(state.handle(), &transfer);
        self.complete(id, TransferResultKind::Control, transfer.handle, outcome)
    }

    fn submit_interrupt_transfer(
        &mut self,
        state: &mut LibUsbDeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode {
        self.submit_endpoint_transfer(state, id, EndpointKind::Interrupt, transfer)
    }

    fn submit_bulk_transfer(
        &mut self,
        state: &mut LibUsbDeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode {
        self.submit_endpoint_transfer(state, id, EndpointKind::Bulk, transfer)
    }

    fn allocate_bulk_transfer_bundle(
        &mut self,
        state: &mut LibUsbDeviceState,
        spec: BulkBundleSpec,
    ) -> LibUsbBulkBundle {
        LibUsbBulkBundle::new(state.shared_handle(), spec)
    }

    fn poll(&mut self, completions: &mut Vec<TransferCompletion>) {
        if !self.completions.is_empty() {
            completions.append(&mut self.completions);
            return;
        }

        if let Some(context) = self.context.as_ref() {
            match context.handle_events(Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                }
            }
        }
    }
}

/// Bus, address and port chain must all agree
fn is_same_device(identity: &EnumeratedDevice, bus_number: u8, address: u8, ports: &[u8]) -> bool {
    bus_number == identity.bus_number
        && address == identity.address
        && format_port_path(bus_number, ports) == identity.port_path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> EnumeratedDevice {
        EnumeratedDevice {
            api_type: UsbApiType::LibUsb,
            filter: UsbDeviceFilter::new(0x054c, 0x09af),
            path: "usb\\vid_054c&pid_09af\\1-4.2".to_string(),
            port_path: "1-4.2".to_string(),
            unique_identifier: "054c_09af_1-4.2".to_string(),
            bus_number: 1,
            address: 7,
        }
    }

    #[test]
    fn test_same_device_requires_address_and_port() {
        let id = identity();
        assert!(is_same_device(&id, 1, 7, &[4, 2]));

        // Replugged on the same port
        assert!(!is_same_device(&id, 1, 9, &[4, 2]));
        // Another device that reused the address
        assert!(!is_same_device(&id, 1, 7, &[3]));
        assert!(!is_same_device(&id, 2, 7, &[4, 2]));
    }

    #[test]
    fn test_open_requires_startup() {
        let mut api = LibUsbApi::new();
        assert!(matches!(
            api.open_device(&identity(), 0, 1, false),
            Err(UsbResultCode::GeneralError)
        ));
        assert!(api.enumerate_devices().is_empty());
    }
}
