//! libusb device state
//!
//! Identity extraction for enumeration, and the open/close sequence that
//! claims one interface of a device for the manager.

use protocol::{EnumeratedDevice, UsbApiType, UsbDeviceFilter, UsbResultCode};
use rusb::{Context, Device, DeviceHandle};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::usb::transfers::map_rusb_error;

/// Open libusb device bound to one manager handle
pub struct LibUsbDeviceState {
    handle: Arc<DeviceHandle<Context>>,
    filter: UsbDeviceFilter,
    path: String,
    port_path: String,
    interface: u8,
    kernel_driver_detached: bool,
}

impl LibUsbDeviceState {
    /// Open the device, optionally reset it, select the configuration and
    /// claim `interface`
    ///
    /// A `configuration` of 0 keeps whatever configuration is active.
    pub fn open(
        device: &Device<Context>,
        identity: &EnumeratedDevice,
        interface: u8,
        configuration: u8,
        reset: bool,
    ) -> Result<Self, UsbResultCode> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", identity.path, e);
            match e {
                rusb::Error::Access | rusb::Error::NotFound | rusb::Error::NoDevice => {
                    UsbResultCode::DeviceNotOpen
                }
                other => map_rusb_error(other),
            }
        })?;

        debug!("Opened device {}", identity.path);

        if reset {
            handle.reset().map_err(|e| {
                warn!("Failed to reset device {}: {}", identity.path, e);
                map_rusb_error(e)
            })?;
            debug!("Reset device {}", identity.path);
        }

        if configuration != 0 {
            let active = handle.active_configuration().unwrap_or(0);
            if active != configuration {
                handle.set_active_configuration(configuration).map_err(|e| {
                    warn!(
                        "Failed to select configuration {} on {}: {}",
                        configuration, identity.path, e
                    );
                    map_rusb_error(e)
                })?;
                debug!("Selected configuration {} on {}", configuration, identity.path);
            }
        }

        let kernel_driver_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface, identity.path
                );
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => true,
                    Err(e) => {
                        // Claiming below will report the real failure.
                        warn!("Failed to detach kernel driver from interface {}: {}", interface, e);
                        false
                    }
                }
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {} on {}: {}", interface, identity.path, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(UsbResultCode::DeviceNotOpen);
        }
        debug!("Claimed interface {} on {}", interface, identity.path);

        Ok(Self {
            handle: Arc::new(handle),
            filter: identity.filter,
            path: identity.path.clone(),
            port_path: identity.port_path.clone(),
            interface,
            kernel_driver_detached,
        })
    }

    /// Release the interface and give it back to the kernel driver
    ///
    /// Bundle reader threads may still hold the libusb handle; the release
    /// goes through the shared handle and their reads fail from here on.
    pub fn close(self) {
        let handle = &self.handle;
        if Arc::strong_count(handle) > 1 {
            debug!("Bulk readers still hold {}, releasing anyway", self.path);
        }

        if let Err(e) = handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }

        if self.kernel_driver_detached {
            if let Err(e) = handle.attach_kernel_driver(self.interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {}", self.interface);
            }
        }

        debug!("Closed device {}", self.path);
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    /// Shared libusb handle for bundle reader threads
    pub fn shared_handle(&self) -> Arc<DeviceHandle<Context>> {
        Arc::clone(&self.handle)
    }

    pub fn filter(&self) -> UsbDeviceFilter {
        self.filter
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn port_path(&self) -> &str {
        &self.port_path
    }
}

/// Read a device's identity from its descriptor, without opening it
pub fn describe_device(device: &Device<Context>) -> Option<EnumeratedDevice> {
    let descriptor = match device.device_descriptor() {
        Ok(d) => d,
        Err(e) => {
            debug!(
                "Skipping device bus={} addr={}: no descriptor ({})",
                device.bus_number(),
                device.address(),
                e
            );
            return None;
        }
    };

    let filter = UsbDeviceFilter::new(descriptor.vendor_id(), descriptor.product_id());
    let port_path = format_port_path(device.bus_number(), &device.port_numbers().unwrap_or_default());

    Some(EnumeratedDevice {
        api_type: UsbApiType::LibUsb,
        filter,
        path: format_device_path(filter, &port_path),
        unique_identifier: format!(
            "{:04x}_{:04x}_{}",
            filter.vendor_id, filter.product_id, port_path
        ),
        port_path,
        bus_number: device.bus_number(),
        address: device.address(),
    })
}

/// Bus number followed by the hub port chain, e.g. `1-4.2`
pub fn format_port_path(bus_number: u8, ports: &[u8]) -> String {
    if ports.is_empty() {
        return format!("{}-0", bus_number);
    }

    let chain = ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(".");
    format!("{}-{}", bus_number, chain)
}

pub fn format_device_path(filter: UsbDeviceFilter, port_path: &str) -> String {
    format!(
        "usb\\vid_{:04x}&pid_{:04x}\\{}",
        filter.vendor_id, filter.product_id, port_path
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_path_formatting() {
        assert_eq!(format_port_path(1, &[4, 2]), "1-4.2");
        assert_eq!(format_port_path(3, &[1]), "3-1");
        assert_eq!(format_port_path(2, &[]), "2-0");
    }

    #[test]
    fn test_device_path_formatting() {
        let path = format_device_path(UsbDeviceFilter::new(0x054c, 0x09af), "1-4.2");
        assert_eq!(path, "usb\\vid_054c&pid_09af\\1-4.2");
    }
}
