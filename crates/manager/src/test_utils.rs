//! Test utilities for the device manager
//!
//! Provides a scriptable mock backend and helpers for building enumerated
//! devices, so the worker and facade can be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use manager::test_utils::{MockUsbApi, mock_device};
//!
//! let api = MockUsbApi::new(vec![mock_device(1, 0x054c, 0x09af)]);
//! let control = api.controller();
//! assert_eq!(control.stats().opens, 0);
//! ```

use crate::usb::api::{BulkTransferBundle, TransferCompletion, TransferId, UsbApi};
use protocol::{
    BulkBundleSpec, ControlTransfer, DeviceHandle, EndpointTransfer, EnumeratedDevice,
    TransferResult, TransferResultKind, UsbApiType, UsbDeviceFilter, UsbResultCode,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte the mock fills IN transfer payloads with
pub const MOCK_FILL_BYTE: u8 = 0xAB;

/// How the mock resolves single-shot transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTransferMode {
    /// Return `Started`; the result arrives from the next poll
    CompleteOnPoll,
    /// Return `Completed`; the result is queued for the next poll
    CompleteOnSubmit,
    /// Reject the submission with the given code
    FailSubmit(UsbResultCode),
    /// Return `Started` and never complete
    Hold,
}

/// How mock bulk bundles behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBundleMode {
    /// Start every transfer; after cancel, one transfer drains per poll
    Drains,
    /// Start every transfer; canceled transfers never drain
    NeverDrains,
    /// `initialize` fails
    FailInitialize,
    /// Only half the transfers start
    PartialStart,
    /// No transfer starts
    FailStart,
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub fail_startup: bool,
    pub fail_open: Option<UsbResultCode>,
    pub transfer_mode: MockTransferMode,
    pub bundle_mode: MockBundleMode,
    /// Canceled bundle transfers stay in flight until this is cleared
    pub hold_bundle_drain: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            fail_startup: false,
            fail_open: None,
            transfer_mode: MockTransferMode::CompleteOnPoll,
            bundle_mode: MockBundleMode::Drains,
            hold_bundle_drain: false,
        }
    }
}

/// Snapshot of the mock's call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub startups: usize,
    pub shutdowns: usize,
    pub opens: usize,
    pub closes: usize,
    pub submissions: usize,
    pub polls: usize,
    pub bundles_created: usize,
    pub bundles_destroyed: usize,
    pub bundle_cancels: usize,
}

#[derive(Default)]
struct Counters {
    startups: AtomicUsize,
    shutdowns: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    submissions: AtomicUsize,
    polls: AtomicUsize,
    bundles_created: AtomicUsize,
    bundles_destroyed: AtomicUsize,
    bundle_cancels: AtomicUsize,
}

#[derive(Default)]
struct Shared {
    behavior: Mutex<MockBehavior>,
    counters: Counters,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Test-side view of a mock backend that has been moved into a manager
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

impl MockController {
    /// Change the mock's behaviour for subsequent calls
    pub fn configure(&self, update: impl FnOnce(&mut MockBehavior)) {
        update(&mut self.shared.behavior.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn stats(&self) -> MockStats {
        let c = &self.shared.counters;
        MockStats {
            startups: c.startups.load(Ordering::SeqCst),
            shutdowns: c.shutdowns.load(Ordering::SeqCst),
            opens: c.opens.load(Ordering::SeqCst),
            closes: c.closes.load(Ordering::SeqCst),
            submissions: c.submissions.load(Ordering::SeqCst),
            polls: c.polls.load(Ordering::SeqCst),
            bundles_created: c.bundles_created.load(Ordering::SeqCst),
            bundles_destroyed: c.bundles_destroyed.load(Ordering::SeqCst),
            bundle_cancels: c.bundle_cancels.load(Ordering::SeqCst),
        }
    }
}

/// Scriptable in-memory backend
pub struct MockUsbApi {
    devices: Vec<EnumeratedDevice>,
    shared: Arc<Shared>,
    started: bool,
    queued: Vec<TransferCompletion>,
    held: Vec<TransferId>,
    bundles: Vec<Arc<BundleShared>>,
}

pub struct MockDeviceState {
    device: EnumeratedDevice,
    interface: u8,
}

impl MockDeviceState {
    pub fn interface(&self) -> u8 {
        self.interface
    }
}

impl MockUsbApi {
    pub fn new(devices: Vec<EnumeratedDevice>) -> Self {
        Self {
            devices,
            shared: Arc::new(Shared::default()),
            started: false,
            queued: Vec::new(),
            held: Vec::new(),
            bundles: Vec::new(),
        }
    }

    pub fn with_behavior(devices: Vec<EnumeratedDevice>, behavior: MockBehavior) -> Self {
        let api = Self::new(devices);
        api.controller().configure(|b| *b = behavior);
        api
    }

    pub fn controller(&self) -> MockController {
        MockController {
            shared: Arc::clone(&self.shared),
        }
    }

    fn behavior(&self) -> MockBehavior {
        self.shared
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn submit(
        &mut self,
        id: TransferId,
        kind: TransferResultKind,
        handle: DeviceHandle,
        data: Vec<u8>,
    ) -> UsbResultCode {
        bump(&self.shared.counters.submissions);

        let completion = TransferCompletion {
            id,
            result: TransferResult::with_data(kind, handle, UsbResultCode::Completed, data),
        };

        match self.behavior().transfer_mode {
            MockTransferMode::CompleteOnPoll => {
                self.queued.push(completion);
                UsbResultCode::Started
            }
            MockTransferMode::CompleteOnSubmit => {
                self.queued.push(completion);
                UsbResultCode::Completed
            }
            MockTransferMode::FailSubmit(code) => code,
            MockTransferMode::Hold => {
                self.held.push(id);
                UsbResultCode::Started
            }
        }
    }

    fn endpoint_payload(transfer: &EndpointTransfer) -> Vec<u8> {
        if transfer.is_in() {
            vec![MOCK_FILL_BYTE; transfer.length]
        } else {
            Vec::new()
        }
    }
}

impl UsbApi for MockUsbApi {
    type DeviceState = MockDeviceState;
    type Bundle = MockBundle;

    fn api_type(&self) -> UsbApiType {
        UsbApiType::LibUsb
    }

    fn startup(&mut self) -> common::Result<()> {
        if self.behavior().fail_startup {
            return Err(common::Error::Usb("mock startup failure".into()));
        }
        bump(&self.shared.counters.startups);
        self.started = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.started {
            bump(&self.shared.counters.shutdowns);
            self.started = false;
            self.queued.clear();
            self.held.clear();
        }
    }

    fn enumerate_devices(&mut self) -> Vec<EnumeratedDevice> {
        self.devices.clone()
    }

    fn can_open_device(&mut self, device: &EnumeratedDevice) -> Result<(), String> {
        if !self.devices.contains(device) {
            return Err(format!("{} is not connected", device.path));
        }
        match self.behavior().fail_open {
            Some(code) => Err(format!("{} cannot be opened: {}", device.path, code)),
            None => Ok(()),
        }
    }

    fn open_device(
        &mut self,
        device: &EnumeratedDevice,
        interface: u8,
        _configuration: u8,
        _reset: bool,
    ) -> Result<MockDeviceState, UsbResultCode> {
        if let Some(code) = self.behavior().fail_open {
            return Err(code);
        }
        if !self.devices.contains(device) {
            return Err(UsbResultCode::DeviceNotOpen);
        }

        bump(&self.shared.counters.opens);
        Ok(MockDeviceState {
            device: device.clone(),
            interface,
        })
    }

    fn close_device(&mut self, _state: MockDeviceState) {
        bump(&self.shared.counters.closes);
    }

    fn device_filter(&self, state: &MockDeviceState) -> UsbDeviceFilter {
        state.device.filter
    }

    fn device_path(&self, state: &MockDeviceState) -> String {
        state.device.path.clone()
    }

    fn device_port_path(&self, state: &MockDeviceState) -> String {
        state.device.port_path.clone()
    }

    fn submit_control_transfer(
        &mut self,
        _state: &mut MockDeviceState,
        id: TransferId,
        transfer: ControlTransfer,
    ) -> UsbResultCode {
        let data = if transfer.is_in() {
            vec![MOCK_FILL_BYTE; usize::from(transfer.length)]
        } else {
            Vec::new()
        };
        self.submit(id, TransferResultKind::Control, transfer.handle, data)
    }

    fn submit_interrupt_transfer(
        &mut self,
        _state: &mut MockDeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode {
        let data = Self::endpoint_payload(&transfer);
        self.submit(id, TransferResultKind::Interrupt, transfer.handle, data)
    }

    fn submit_bulk_transfer(
        &mut self,
        _state: &mut MockDeviceState,
        id: TransferId,
        transfer: EndpointTransfer,
    ) -> UsbResultCode {
        let data = Self::endpoint_payload(&transfer);
        self.submit(id, TransferResultKind::Bulk, transfer.handle, data)
    }

    fn allocate_bulk_transfer_bundle(
        &mut self,
        _state: &mut MockDeviceState,
        spec: BulkBundleSpec,
    ) -> MockBundle {
        bump(&self.shared.counters.bundles_created);

        let bundle_shared = Arc::new(BundleShared {
            active: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
        });
        self.bundles.push(Arc::clone(&bundle_shared));

        MockBundle {
            spec,
            mode: self.behavior().bundle_mode,
            state: bundle_shared,
            shared: Arc::clone(&self.shared),
        }
    }

    fn poll(&mut self, completions: &mut Vec<TransferCompletion>) {
        bump(&self.shared.counters.polls);

        self.bundles.retain(|b| Arc::strong_count(b) > 1);
        if !self.behavior().hold_bundle_drain {
            for bundle in &self.bundles {
                if bundle.canceled.load(Ordering::SeqCst) {
                    let _ = bundle
                        .active
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                }
            }
        }

        if self.queued.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        } else {
            completions.append(&mut self.queued);
        }
    }
}

struct BundleShared {
    active: AtomicUsize,
    canceled: AtomicBool,
}

pub struct MockBundle {
    spec: BulkBundleSpec,
    mode: MockBundleMode,
    state: Arc<BundleShared>,
    shared: Arc<Shared>,
}

impl BulkTransferBundle for MockBundle {
    fn handle(&self) -> DeviceHandle {
        self.spec.handle
    }

    fn initialize(&mut self) -> bool {
        self.mode != MockBundleMode::FailInitialize
    }

    fn start_transfers(&mut self) -> bool {
        let requested = self.spec.in_flight_transfers;
        let started = match self.mode {
            MockBundleMode::Drains | MockBundleMode::NeverDrains => requested,
            MockBundleMode::PartialStart => requested / 2,
            MockBundleMode::FailStart | MockBundleMode::FailInitialize => 0,
        };

        self.state.active.store(started, Ordering::SeqCst);
        if started > 0 {
            (self.spec.on_data)(&[MOCK_FILL_BYTE]);
        }
        started == requested
    }

    fn cancel_transfers(&mut self) {
        bump(&self.shared.counters.bundle_cancels);
        if self.mode != MockBundleMode::NeverDrains {
            self.state.canceled.store(true, Ordering::SeqCst);
        }
    }

    fn active_transfer_count(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }
}

impl Drop for MockBundle {
    fn drop(&mut self) {
        bump(&self.shared.counters.bundles_destroyed);
    }
}

/// Create a mock EnumeratedDevice on bus 1
pub fn mock_device(port: u8, vendor_id: u16, product_id: u16) -> EnumeratedDevice {
    let port_path = format!("1-{}", port);
    EnumeratedDevice {
        api_type: UsbApiType::LibUsb,
        filter: UsbDeviceFilter::new(vendor_id, product_id),
        path: format!("usb\\vid_{:04x}&pid_{:04x}\\{}", vendor_id, product_id, port_path),
        unique_identifier: format!("{:04x}_{:04x}_{}", vendor_id, product_id, port_path),
        port_path,
        bus_number: 1,
        address: port,
    }
}

/// Poll `condition`, calling `tick` between checks, until it holds or the timeout passes
pub fn wait_until(timeout: Duration, mut tick: impl FnMut(), mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tick();
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
