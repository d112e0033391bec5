//! libusb bulk transfer bundle
//!
//! Streams an IN endpoint with one reader thread per in-flight transfer
//! slot. Each reader loops on a short-timeout bulk read and checks the shared
//! cancel flag between reads, so cancellation completes within one read
//! timeout. The active transfer count is the number of live readers.

use crate::usb::api::BulkTransferBundle;
use protocol::{BulkBundleSpec, DeviceHandle};
use rusb::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on how long a reader goes without checking for cancellation
const READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct LibUsbBulkBundle {
    device: Arc<rusb::DeviceHandle<Context>>,
    spec: BulkBundleSpec,
    initialized: bool,
    cancel: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl LibUsbBulkBundle {
    pub fn new(device: Arc<rusb::DeviceHandle<Context>>, spec: BulkBundleSpec) -> Self {
        Self {
            device,
            spec,
            initialized: false,
            cancel: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Decrements the active count when a reader exits, panics included
struct ActiveReader(Arc<AtomicUsize>);

impl Drop for ActiveReader {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run_reader(
    device: Arc<rusb::DeviceHandle<Context>>,
    spec: BulkBundleSpec,
    cancel: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
) {
    let _reader = ActiveReader(active);
    let mut buffer = vec![0u8; spec.transfer_size];

    while !cancel.load(Ordering::SeqCst) {
        match device.read_bulk(spec.endpoint, &mut buffer, READ_TIMEOUT) {
            Ok(0) => {}
            Ok(len) => (spec.on_data)(&buffer[..len]),
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => {}
            Err(rusb::Error::Overflow) => {
                debug!("Bulk read overflow on endpoint {:#x}", spec.endpoint);
            }
            Err(e) => {
                warn!(
                    "Bulk stream on {} endpoint {:#x} stopped: {}",
                    spec.handle, spec.endpoint, e
                );
                break;
            }
        }
    }
}

impl BulkTransferBundle for LibUsbBulkBundle {
    fn handle(&self) -> DeviceHandle {
        self.spec.handle
    }

    fn initialize(&mut self) -> bool {
        if self.spec.endpoint & protocol::DIRECTION_IN == 0 {
            warn!("Bulk bundle endpoint {:#x} is not an IN endpoint", self.spec.endpoint);
            return false;
        }
        if self.spec.transfer_size == 0 || self.spec.in_flight_transfers == 0 {
            warn!("Bulk bundle needs a non-zero transfer size and transfer count");
            return false;
        }

        self.initialized = true;
        true
    }

    fn start_transfers(&mut self) -> bool {
        if !self.initialized {
            return false;
        }

        for slot in 0..self.spec.in_flight_transfers {
            let device = Arc::clone(&self.device);
            let spec = self.spec.clone();
            let cancel = Arc::clone(&self.cancel);
            let active = Arc::clone(&self.active);

            self.active.fetch_add(1, Ordering::SeqCst);
            let spawned = std::thread::Builder::new()
                .name(format!("usb-bulk-{}-{}", self.spec.handle.0, slot))
                .spawn(move || run_reader(device, spec, cancel, active));

            if let Err(e) = spawned {
                self.active.fetch_sub(1, Ordering::SeqCst);
                warn!("Failed to start bulk reader {} for {}: {}", slot, self.spec.handle, e);
                return false;
            }
        }

        debug!(
            "Started {} bulk readers on {} endpoint {:#x}",
            self.spec.in_flight_transfers, self.spec.handle, self.spec.endpoint
        );
        true
    }

    fn cancel_transfers(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn active_transfer_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for LibUsbBulkBundle {
    fn drop(&mut self) {
        // Readers still running notice within READ_TIMEOUT and exit on their own.
        self.cancel.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_reader_guard_decrements() {
        let active = Arc::new(AtomicUsize::new(2));
        {
            let _reader = ActiveReader(Arc::clone(&active));
        }
        assert_eq!(active.load(Ordering::SeqCst), 1);
    }
}
