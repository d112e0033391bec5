//! USB worker thread
//!
//! Dedicated thread that owns the backend, the device handle table, the bulk
//! bundle arena and the active-transfer counters. Callers reach it only
//! through the request queue; it answers through the result queue, so every
//! piece of bookkeeping here has a single writer and needs no locks.
//!
//! Each loop iteration:
//! 1. Drains every queued command, dispatching transfer requests by kind
//! 2. Polls the backend while anything is outstanding, looping until all
//!    single-shot transfers have resolved (bundle streams are not waited on)
//! 3. Retires canceling bundles whose transfers have drained

use crate::usb::api::{BulkTransferBundle, TransferCompletion, TransferId, UsbApi};
use common::{CompletedTransfer, OpenDeviceInfo, TransferStats, UsbCommand, UsbWorker};
use protocol::{
    BulkBundleSpec, DeviceHandle, EnumeratedDevice, TransferCallback, TransferRequest,
    TransferResult, TransferResultKind, UsbResultCode,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Poll attempts shutdown spends waiting for canceled bundles to drain
pub const MAX_CLEANUP_POLL_ATTEMPTS: usize = 100;

/// Name of the worker thread
pub const WORKER_THREAD_NAME: &str = "usb-async-worker";

/// Single-shot transfer classes tracked by the active counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Interrupt,
    Bulk,
}

impl TransferKind {
    pub fn result_kind(self) -> TransferResultKind {
        match self {
            TransferKind::Control => TransferResultKind::Control,
            TransferKind::Interrupt => TransferResultKind::Interrupt,
            TransferKind::Bulk => TransferResultKind::Bulk,
        }
    }
}

/// Transfers submitted to the backend but not yet resolved
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTransferCounters {
    control: usize,
    interrupt: usize,
    bulk: usize,
}

impl ActiveTransferCounters {
    fn slot(&mut self, kind: TransferKind) -> &mut usize {
        match kind {
            TransferKind::Control => &mut self.control,
            TransferKind::Interrupt => &mut self.interrupt,
            TransferKind::Bulk => &mut self.bulk,
        }
    }

    pub fn get(&self, kind: TransferKind) -> usize {
        match kind {
            TransferKind::Control => self.control,
            TransferKind::Interrupt => self.interrupt,
            TransferKind::Bulk => self.bulk,
        }
    }

    pub fn begin(&mut self, kind: TransferKind) {
        *self.slot(kind) += 1;
    }

    /// Record one resolved transfer
    ///
    /// # Panics
    /// If no transfer of `kind` is outstanding; the bookkeeping is corrupt.
    pub fn finish(&mut self, kind: TransferKind) {
        let count = self.slot(kind);
        assert!(*count > 0, "{:?} transfer counter would go negative", kind);
        *count -= 1;
    }

    pub fn any(&self) -> bool {
        self.control > 0 || self.interrupt > 0 || self.bulk > 0
    }
}

/// Lifecycle of a bundle in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// Transfers submitted and streaming
    Active,
    /// Cancellation requested, transfers draining
    Canceling,
    /// Drained; removed at the end of the sweep
    Retired,
}

struct BundleSlot<T> {
    state: BundleState,
    bundle: T,
}

struct PendingTransfer {
    kind: TransferKind,
    handle: DeviceHandle,
    callback: TransferCallback,
}

/// State owned by the USB worker thread
pub struct UsbWorkerThread<B: UsbApi> {
    api: B,
    worker: UsbWorker,
    devices: BTreeMap<DeviceHandle, B::DeviceState>,
    next_handle: u32,
    bundles: BTreeMap<DeviceHandle, BundleSlot<B::Bundle>>,
    counters: ActiveTransferCounters,
    pending: HashMap<TransferId, PendingTransfer>,
    next_transfer_id: u64,
    completions: Vec<TransferCompletion>,
}

impl<B: UsbApi> UsbWorkerThread<B> {
    /// Wrap a started backend; handles are allocated from `next_handle` on
    pub fn new(api: B, worker: UsbWorker, next_handle: u32) -> Self {
        Self {
            api,
            worker,
            devices: BTreeMap::new(),
            next_handle,
            bundles: BTreeMap::new(),
            counters: ActiveTransferCounters::default(),
            pending: HashMap::new(),
            next_transfer_id: 1,
            completions: Vec::new(),
        }
    }

    /// Run the worker loop until the exit signal is observed
    ///
    /// Returns the worker so the caller can release its devices and backend.
    pub fn run(mut self) -> Self {
        info!("USB worker thread started");

        while !self.worker.exit_signaled() {
            self.worker.flush_backlog();

            if !self.has_outstanding_work() {
                if self.worker.backlog_len() > 0 {
                    // Waiting for a caller to make room in the result queue.
                    std::thread::sleep(Duration::from_millis(1));
                } else {
                    match self.worker.recv_command() {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("Request queue closed");
                            break;
                        }
                    }
                }
            }

            while let Some(cmd) = self.worker.try_recv_command() {
                self.handle_command(cmd);
            }

            self.process_transfers();
        }

        self.teardown();

        // The caller drains results while it waits for this thread to finish.
        while self.worker.backlog_len() > 0 {
            self.worker.flush_backlog();
            if self.worker.backlog_len() > 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        info!("USB worker thread stopped");
        self
    }

    /// Execute one command against the worker state
    pub fn handle_command(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::EnumerateDevices { response } => {
                let _ = response.send(self.api.enumerate_devices());
            }

            UsbCommand::CanOpenDevice { device, response } => {
                let _ = response.send(self.api.can_open_device(&device));
            }

            UsbCommand::OpenDevice {
                device,
                interface,
                configuration,
                reset,
                response,
            } => {
                let result = self.open_device(&device, interface, configuration, reset);
                let _ = response.send(result);
            }

            UsbCommand::CloseDevice { handle, response } => {
                self.close_device(handle);
                let _ = response.send(());
            }

            UsbCommand::DescribeDevice { handle, response } => {
                let _ = response.send(self.describe_device(handle));
            }

            UsbCommand::GetTransferStats { response } => {
                let _ = response.send(self.stats());
            }

            UsbCommand::SubmitTransfer { request, callback } => {
                self.handle_transfer_request(request, callback);
            }

            UsbCommand::Shutdown => {
                debug!("Shutdown requested");
            }
        }
    }

    fn open_device(
        &mut self,
        device: &EnumeratedDevice,
        interface: u8,
        configuration: u8,
        reset: bool,
    ) -> Result<DeviceHandle, UsbResultCode> {
        match self.api.open_device(device, interface, configuration, reset) {
            Ok(state) => {
                let handle = DeviceHandle(self.next_handle);
                self.next_handle += 1;
                self.devices.insert(handle, state);
                info!("Opened {} ({}) as handle {}", device.path, device.filter, handle);
                Ok(handle)
            }
            Err(code) => {
                warn!("Failed to open {}: {}", device.path, code);
                Err(code)
            }
        }
    }

    fn close_device(&mut self, handle: DeviceHandle) {
        let Some(state) = self.devices.remove(&handle) else {
            debug!("Close of unknown handle {} ignored", handle);
            return;
        };

        if self.bundles.contains_key(&handle) {
            warn!("Closing handle {} while its bulk transfer bundle is still registered", handle);
        }

        self.api.close_device(state);
        info!("Closed handle {}", handle);
    }

    fn describe_device(&self, handle: DeviceHandle) -> Option<OpenDeviceInfo> {
        let state = self.devices.get(&handle)?;
        Some(OpenDeviceInfo {
            filter: self.api.device_filter(state),
            full_path: self.api.device_path(state),
            port_path: self.api.device_port_path(state),
        })
    }

    pub fn stats(&self) -> TransferStats {
        let canceling = self
            .bundles
            .values()
            .filter(|slot| slot.state == BundleState::Canceling)
            .count();

        TransferStats {
            active_control_transfers: self.counters.get(TransferKind::Control),
            active_interrupt_transfers: self.counters.get(TransferKind::Interrupt),
            active_bulk_transfers: self.counters.get(TransferKind::Bulk),
            active_bundles: self.bundles.len() - canceling,
            canceling_bundles: canceling,
            open_devices: self.devices.len(),
        }
    }

    fn has_outstanding_work(&self) -> bool {
        self.counters.any() || !self.bundles.is_empty()
    }

    fn post(&mut self, result: TransferResult, callback: TransferCallback) {
        self.worker.post_result(CompletedTransfer::new(result, callback));
    }

    fn handle_transfer_request(&mut self, request: TransferRequest, callback: TransferCallback) {
        debug!("Transfer request {:?}", request);

        match request {
            TransferRequest::Control(transfer) => {
                let handle = transfer.handle;
                self.submit_single(TransferKind::Control, handle, callback, move |api, state, id| {
                    api.submit_control_transfer(state, id, transfer)
                });
            }
            TransferRequest::Interrupt(transfer) => {
                let handle = transfer.handle;
                self.submit_single(TransferKind::Interrupt, handle, callback, move |api, state, id| {
                    api.submit_interrupt_transfer(state, id, transfer)
                });
            }
            TransferRequest::Bulk(transfer) => {
                let handle = transfer.handle;
                self.submit_single(TransferKind::Bulk, handle, callback, move |api, state, id| {
                    api.submit_bulk_transfer(state, id, transfer)
                });
            }
            TransferRequest::StartBulkBundle(spec) => self.start_bulk_bundle(spec, callback),
            TransferRequest::CancelBulkBundle { handle } => self.cancel_bulk_bundle(handle, callback),
        }
    }

    /// Submit a control, interrupt or bulk transfer
    ///
    /// The counter is raised before the backend call so a synchronously
    /// completing submission is already accounted for.
    fn submit_single(
        &mut self,
        kind: TransferKind,
        handle: DeviceHandle,
        callback: TransferCallback,
        submit: impl FnOnce(&mut B, &mut B::DeviceState, TransferId) -> UsbResultCode,
    ) {
        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;

        let Some(state) = self.devices.get_mut(&handle) else {
            debug!("{:?} transfer for unknown handle {}", kind, handle);
            self.post(
                TransferResult::empty(kind.result_kind(), handle, UsbResultCode::BadHandle),
                callback,
            );
            return;
        };

        self.counters.begin(kind);
        self.pending.insert(
            id,
            PendingTransfer {
                kind,
                handle,
                callback,
            },
        );

        let code = submit(&mut self.api, state, id);
        match code {
            UsbResultCode::Started | UsbResultCode::Completed => {
                debug!("{:?} {} on handle {} accepted: {}", kind, id, handle, code);
            }
            failure => {
                debug!("{:?} {} on handle {} failed to submit: {}", kind, id, handle, failure);
                if let Some(pending) = self.pending.remove(&id) {
                    self.counters.finish(kind);
                    self.post(
                        TransferResult::empty(kind.result_kind(), handle, failure),
                        pending.callback,
                    );
                }
            }
        }
    }

    fn start_bulk_bundle(&mut self, spec: BulkBundleSpec, callback: TransferCallback) {
        let handle = spec.handle;

        let result_code = if self.bundles.contains_key(&handle) {
            UsbResultCode::TransferAlreadyStarted
        } else if let Some(state) = self.devices.get_mut(&handle) {
            let mut bundle = self.api.allocate_bulk_transfer_bundle(state, spec);

            if !bundle.initialize() {
                UsbResultCode::NoMemory
            } else if bundle.start_transfers() {
                self.bundles.insert(
                    handle,
                    BundleSlot {
                        state: BundleState::Active,
                        bundle,
                    },
                );
                UsbResultCode::Started
            } else if bundle.active_transfer_count() > 0 {
                // Some transfers are in flight; they must drain before the bundle can go.
                bundle.cancel_transfers();
                self.bundles.insert(
                    handle,
                    BundleSlot {
                        state: BundleState::Canceling,
                        bundle,
                    },
                );
                UsbResultCode::SubmitFailed
            } else {
                UsbResultCode::SubmitFailed
            }
        } else {
            UsbResultCode::BadHandle
        };

        debug!("Start bulk bundle on handle {}: {}", handle, result_code);
        self.post(
            TransferResult::empty(TransferResultKind::BulkBundle, handle, result_code),
            callback,
        );
    }

    /// Request cancellation; `Canceled` acknowledges acceptance, not completion
    fn cancel_bulk_bundle(&mut self, handle: DeviceHandle, callback: TransferCallback) {
        let result_code = match self.bundles.get_mut(&handle) {
            Some(slot) if slot.state == BundleState::Active => {
                slot.bundle.cancel_transfers();
                slot.state = BundleState::Canceling;
                UsbResultCode::Canceled
            }
            _ if !self.devices.contains_key(&handle) => UsbResultCode::BadHandle,
            _ => UsbResultCode::TransferNotActive,
        };

        debug!("Cancel bulk bundle on handle {}: {}", handle, result_code);
        self.post(
            TransferResult::empty(TransferResultKind::BulkBundle, handle, result_code),
            callback,
        );
    }

    /// Poll while anything is outstanding, then sweep drained bundles
    fn process_transfers(&mut self) {
        if !self.has_outstanding_work() {
            return;
        }

        loop {
            self.poll_backend();
            if !self.counters.any() || self.worker.exit_signaled() {
                break;
            }
        }

        self.sweep_canceled_bundles(false);
    }

    fn poll_backend(&mut self) {
        let mut completions = std::mem::take(&mut self.completions);
        self.api.poll(&mut completions);

        for completion in completions.drain(..) {
            self.complete_transfer(completion);
        }
        self.completions = completions;
    }

    fn complete_transfer(&mut self, completion: TransferCompletion) {
        let Some(pending) = self.pending.remove(&completion.id) else {
            error!("Backend completed unknown {}", completion.id);
            return;
        };

        debug_assert_eq!(completion.result.kind(), pending.kind.result_kind());
        debug_assert_eq!(completion.result.handle(), pending.handle);

        self.counters.finish(pending.kind);
        self.post(completion.result, pending.callback);
    }

    /// Destroy canceling bundles with no active transfers, or all of them when forced
    fn sweep_canceled_bundles(&mut self, force: bool) {
        for (handle, slot) in self.bundles.iter_mut() {
            if slot.state == BundleState::Canceling
                && (force || slot.bundle.active_transfer_count() == 0)
            {
                debug!("Retiring bulk bundle on handle {}", handle);
                slot.state = BundleState::Retired;
            }
        }

        self.bundles.retain(|_, slot| slot.state != BundleState::Retired);
    }

    /// Cancel and drain everything still in flight, within a fixed poll budget
    pub fn teardown(&mut self) {
        while let Some(cmd) = self.worker.try_recv_command() {
            match cmd {
                UsbCommand::SubmitTransfer { request, callback } => {
                    self.post(request.failure(UsbResultCode::Canceled), callback);
                }
                other => debug!("Dropping {:?} queued during shutdown", other),
            }
        }

        for (handle, slot) in self.bundles.iter_mut() {
            if slot.state == BundleState::Active {
                debug!("Canceling bulk bundle on handle {}", handle);
                slot.bundle.cancel_transfers();
                slot.state = BundleState::Canceling;
            }
        }

        let mut attempts = 0;
        while (!self.bundles.is_empty() || self.counters.any()) && attempts < MAX_CLEANUP_POLL_ATTEMPTS {
            self.poll_backend();
            self.sweep_canceled_bundles(false);
            attempts += 1;
        }

        if !self.bundles.is_empty() {
            warn!(
                "Forcing cleanup of {} bulk transfer bundles still active after {} polls",
                self.bundles.len(),
                attempts
            );
            self.sweep_canceled_bundles(true);
        }

        if !self.pending.is_empty() {
            warn!(
                "Canceling {} transfers that did not complete before shutdown",
                self.pending.len()
            );
            let mut leftovers: Vec<_> = self.pending.drain().collect();
            leftovers.sort_by_key(|(id, _)| *id);

            for (_, pending) in leftovers {
                self.counters.finish(pending.kind);
                self.post(
                    TransferResult::empty(
                        pending.kind.result_kind(),
                        pending.handle,
                        UsbResultCode::Canceled,
                    ),
                    pending.callback,
                );
            }
        }
    }

    /// Close every open device and shut the backend down
    ///
    /// Returns the backend and the next unused handle id for a later restart.
    pub fn release(mut self) -> (B, u32) {
        for (handle, state) in std::mem::take(&mut self.devices) {
            debug!("Closing handle {} on release", handle);
            self.api.close_device(state);
        }

        self.api.shutdown();
        (self.api, self.next_handle)
    }
}

/// A worker thread that could not be started, with the worker handed back
pub struct SpawnError<B: UsbApi> {
    pub error: common::Error,
    pub worker: UsbWorkerThread<B>,
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker<B: UsbApi>(
    worker: UsbWorkerThread<B>,
) -> Result<JoinHandle<UsbWorkerThread<B>>, SpawnError<B>> {
    spawn_with(
        std::thread::Builder::new().name(WORKER_THREAD_NAME.to_string()),
        worker,
    )
}

fn spawn_with<B: UsbApi>(
    builder: std::thread::Builder,
    worker: UsbWorkerThread<B>,
) -> Result<JoinHandle<UsbWorkerThread<B>>, SpawnError<B>> {
    // The closure is dropped unrun if the spawn fails, leaving the worker here.
    let slot = Arc::new(Mutex::new(Some(worker)));
    let thread_slot = Arc::clone(&slot);

    let spawned = builder.spawn(move || {
        let taken = thread_slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = taken else {
            unreachable!("USB worker taken before its thread started");
        };
        worker.run()
    });

    match spawned {
        Ok(thread) => Ok(thread),
        Err(e) => {
            let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(worker) = taken else {
                unreachable!("USB worker consumed by a thread that failed to spawn");
            };
            Err(SpawnError {
                error: common::Error::Thread(format!("Failed to spawn USB worker thread: {}", e)),
                worker,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockController, MockUsbApi, mock_device};

    #[test]
    fn test_counters_round_trip() {
        let mut counters = ActiveTransferCounters::default();
        counters.begin(TransferKind::Control);
        counters.begin(TransferKind::Bulk);
        assert!(counters.any());

        counters.finish(TransferKind::Control);
        counters.finish(TransferKind::Bulk);
        assert!(!counters.any());
        assert_eq!(counters.get(TransferKind::Interrupt), 0);
    }

    #[test]
    #[should_panic(expected = "would go negative")]
    fn test_counter_underflow_is_fatal() {
        let mut counters = ActiveTransferCounters::default();
        counters.finish(TransferKind::Interrupt);
    }

    fn started_mock(next_handle: u32) -> (UsbWorkerThread<MockUsbApi>, common::UsbBridge, MockController) {
        let mut api = MockUsbApi::new(vec![mock_device(1, 0x054c, 0x09af)]);
        let control = api.controller();
        api.startup().unwrap();
        let (bridge, worker) = common::create_usb_bridge(4);
        (UsbWorkerThread::new(api, worker, next_handle), bridge, control)
    }

    #[test]
    fn test_spawn_failure_hands_worker_back() {
        let (worker, _bridge, control) = started_mock(7);

        // No address space fits this stack.
        let builder = std::thread::Builder::new().stack_size(usize::MAX / 4);
        let SpawnError { error, worker } = match spawn_with(builder, worker) {
            Ok(_) => panic!("spawn with an impossible stack size succeeded"),
            Err(e) => e,
        };
        assert!(matches!(error, common::Error::Thread(_)));

        let (_api, next_handle) = worker.release();
        assert_eq!(next_handle, 7);
        assert_eq!(control.stats().shutdowns, 1);
    }

    #[test]
    fn test_spawned_worker_returns_on_shutdown() {
        let (worker, bridge, _control) = started_mock(1);
        let thread = match spawn_usb_worker(worker) {
            Ok(thread) => thread,
            Err(e) => panic!("{}", e.error),
        };
        assert_eq!(thread.thread().name(), Some(WORKER_THREAD_NAME));

        bridge.signal_exit();
        assert!(bridge.try_send_command(UsbCommand::Shutdown).is_ok());
        let worker = thread.join().unwrap();
        assert_eq!(worker.stats().open_devices, 0);
    }

    #[test]
    fn test_kind_maps_to_result_kind() {
        assert_eq!(TransferKind::Control.result_kind(), TransferResultKind::Control);
        assert_eq!(TransferKind::Interrupt.result_kind(), TransferResultKind::Interrupt);
        assert_eq!(TransferKind::Bulk.result_kind(), TransferResultKind::Bulk);
    }
}
