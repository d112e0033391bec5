//! USB device manager
//!
//! Thread-safe facade over the USB worker thread. Device-table operations are
//! synchronous round trips through the request queue; transfer requests are
//! queued without blocking and their callbacks run on whichever thread calls
//! [`DeviceManager::update`].
//!
//! With transfers disabled in the configuration no worker thread is started:
//! device-table operations run inline under a lock and every transfer request
//! fails immediately with `SubmitFailed`.

use crate::config::UsbSettings;
use crate::usb::any::AnyUsbApi;
use crate::usb::api::UsbApi;
use crate::usb::enumerator::UsbDeviceEnumerator;
use crate::usb::worker::{SpawnError, UsbWorkerThread, spawn_usb_worker};
use async_channel::TrySendError;
use common::{OpenDeviceInfo, TransferStats, UsbBridge, UsbCommand, create_usb_bridge};
use protocol::{
    DeviceHandle, EnumeratedDevice, TransferRequest, TransferResult, UsbApiType,
    UsbDeviceFilter, UsbResultCode,
};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Sleep between result checks while a caller waits on the worker
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(1);

enum Runtime<B: UsbApi> {
    Stopped,
    Threaded {
        bridge: UsbBridge,
        thread: JoinHandle<UsbWorkerThread<B>>,
    },
    Inline {
        worker: Mutex<UsbWorkerThread<B>>,
    },
}

/// USB device manager
pub struct DeviceManager<B: UsbApi = AnyUsbApi> {
    settings: UsbSettings,
    api_type: UsbApiType,
    /// Backend while stopped; the worker owns it while running
    api: Mutex<Option<B>>,
    /// Next device handle id, carried across restarts
    next_handle: u32,
    runtime: Runtime<B>,
}

impl DeviceManager<AnyUsbApi> {
    /// Create a manager for the backend named in `settings`
    pub fn new(settings: UsbSettings) -> Self {
        let api = AnyUsbApi::from_type(settings.api_type());
        Self::with_backend(settings, api)
    }
}

impl<B: UsbApi> DeviceManager<B> {
    /// Create a manager over an explicit backend
    pub fn with_backend(settings: UsbSettings, api: B) -> Self {
        Self {
            api_type: api.api_type(),
            settings,
            api: Mutex::new(Some(api)),
            next_handle: 1,
            runtime: Runtime::Stopped,
        }
    }

    pub fn api_type(&self) -> UsbApiType {
        self.api_type
    }

    pub fn settings(&self) -> &UsbSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.runtime, Runtime::Stopped)
    }

    /// Start the backend and, if transfers are enabled, the worker thread
    pub fn startup(&mut self) -> common::Result<()> {
        if self.is_running() {
            warn!("USB device manager already started");
            return Ok(());
        }

        let slot = self.api.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut api = slot
            .take()
            .ok_or_else(|| common::Error::Usb("USB backend was lost by a previous run".into()))?;

        if let Err(e) = api.startup() {
            error!("Failed to initialize USB API {}: {}", self.api_type, e);
            *slot = Some(api);
            return Err(e);
        }
        info!("Initialized USB API {}", self.api_type);

        let (bridge, worker) = create_usb_bridge(self.settings.queue_capacity);
        let worker = UsbWorkerThread::new(api, worker, self.next_handle);

        self.runtime = if self.settings.enable_usb_transfers {
            let thread = match spawn_usb_worker(worker) {
                Ok(thread) => thread,
                Err(SpawnError { error, worker }) => {
                    error!("{}", error);
                    self.release(worker);
                    return Err(error);
                }
            };
            info!("USB worker thread spawned");
            Runtime::Threaded { bridge, thread }
        } else {
            info!("USB transfers disabled, running without a worker thread");
            Runtime::Inline {
                worker: Mutex::new(worker),
            }
        };

        Ok(())
    }

    /// Stop the worker, cancel outstanding work and release every device
    ///
    /// Callbacks for results produced while draining run on this thread.
    pub fn shutdown(&mut self) {
        match std::mem::replace(&mut self.runtime, Runtime::Stopped) {
            Runtime::Stopped => {}

            Runtime::Threaded { bridge, thread } => {
                info!("Stopping USB worker thread");
                bridge.signal_exit();

                let mut wake = UsbCommand::Shutdown;
                loop {
                    match bridge.try_send_command(wake) {
                        Ok(()) | Err(TrySendError::Closed(_)) => break,
                        Err(TrySendError::Full(cmd)) => {
                            wake = cmd;
                            drain_results(&bridge);
                            std::thread::sleep(BLOCKING_POLL_INTERVAL);
                        }
                    }
                }

                while !thread.is_finished() {
                    drain_results(&bridge);
                    std::thread::sleep(BLOCKING_POLL_INTERVAL);
                }

                match thread.join() {
                    Ok(worker) => {
                        drain_results(&bridge);
                        self.release(worker);
                    }
                    Err(panic) => {
                        error!("USB worker thread panicked");
                        std::panic::resume_unwind(panic);
                    }
                }
            }

            Runtime::Inline { worker } => {
                let mut worker = worker.into_inner().unwrap_or_else(PoisonError::into_inner);
                worker.teardown();
                self.release(worker);
            }
        }
    }

    fn release(&mut self, worker: UsbWorkerThread<B>) {
        let (api, next_handle) = worker.release();
        self.next_handle = next_handle;
        *self.api.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(api);
        info!("USB device manager stopped");
    }

    /// Deliver completed transfers to their callbacks on the calling thread
    pub fn update(&self) {
        if let Runtime::Threaded { bridge, .. } = &self.runtime {
            drain_results(bridge);
        }
    }

    /// Round trip a command to the worker; `None` if it cannot answer
    fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> UsbCommand) -> Option<T> {
        match &self.runtime {
            Runtime::Stopped => {
                debug!("USB device manager not running");
                None
            }
            Runtime::Threaded { bridge, .. } => match bridge.request(build) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("USB worker request failed: {}", e);
                    None
                }
            },
            Runtime::Inline { worker } => {
                let (tx, mut rx) = oneshot::channel();
                worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handle_command(build(tx));
                rx.try_recv().ok()
            }
        }
    }

    /// Snapshot the connected devices
    pub fn enumerate(&self) -> UsbDeviceEnumerator {
        let devices = self
            .request(|response| UsbCommand::EnumerateDevices { response })
            .unwrap_or_default();
        UsbDeviceEnumerator::new(devices)
    }

    /// Check whether `device` could be opened, with a reason if not
    pub fn can_open_device(&self, device: &EnumeratedDevice) -> Result<(), String> {
        self.request(|response| UsbCommand::CanOpenDevice {
            device: device.clone(),
            response,
        })
        .unwrap_or_else(|| Err("USB device manager is not running".to_string()))
    }

    /// Open `device`, returning a handle that is never reused
    pub fn open_device(
        &self,
        device: &EnumeratedDevice,
        interface: u8,
        configuration: u8,
        reset: bool,
    ) -> Result<DeviceHandle, UsbResultCode> {
        self.request(|response| UsbCommand::OpenDevice {
            device: device.clone(),
            interface,
            configuration,
            reset,
            response,
        })
        .unwrap_or(Err(UsbResultCode::GeneralError))
    }

    /// Close a handle; unknown handles are ignored
    pub fn close_device(&self, handle: DeviceHandle) {
        let _ = self.request(|response| UsbCommand::CloseDevice { handle, response });
    }

    /// Filter, full path and port path of an open handle
    pub fn describe_device(&self, handle: DeviceHandle) -> Option<OpenDeviceInfo> {
        self.request(|response| UsbCommand::DescribeDevice { handle, response })
            .flatten()
    }

    pub fn is_device_open(&self, handle: DeviceHandle) -> bool {
        self.describe_device(handle).is_some()
    }

    pub fn device_filter(&self, handle: DeviceHandle) -> Option<UsbDeviceFilter> {
        self.describe_device(handle).map(|info| info.filter)
    }

    pub fn device_full_path(&self, handle: DeviceHandle) -> Option<String> {
        self.describe_device(handle).map(|info| info.full_path)
    }

    pub fn device_port_path(&self, handle: DeviceHandle) -> Option<String> {
        self.describe_device(handle).map(|info| info.port_path)
    }

    /// Outstanding transfer and bundle counts
    pub fn transfer_stats(&self) -> TransferStats {
        self.request(|response| UsbCommand::GetTransferStats { response })
            .unwrap_or_default()
    }

    /// Queue a transfer request without blocking
    ///
    /// Returns false if the request was rejected (manager stopped or queue
    /// full); the callback is then never invoked. Otherwise the callback runs
    /// exactly once, from a later [`update`](Self::update), or before this
    /// call returns when transfers are disabled.
    pub fn submit_transfer_request_async(
        &self,
        request: TransferRequest,
        callback: impl FnOnce(TransferResult) + Send + 'static,
    ) -> bool {
        if !self.settings.enable_usb_transfers {
            debug!("USB transfers disabled, failing {:?}", request.result_kind());
            callback(request.failure(UsbResultCode::SubmitFailed));
            return true;
        }

        let Runtime::Threaded { bridge, .. } = &self.runtime else {
            warn!("Transfer request rejected: USB device manager not running");
            return false;
        };

        let cmd = UsbCommand::SubmitTransfer {
            request,
            callback: Box::new(callback),
        };
        match bridge.try_send_command(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Transfer request rejected: request queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Transfer request rejected: USB worker thread stopped");
                false
            }
        }
    }

    /// Submit a transfer request and wait for its result
    ///
    /// Drives [`update`](Self::update) while waiting, so other callbacks
    /// queued for this thread run too.
    pub fn submit_transfer_request_blocking(&self, request: TransferRequest) -> TransferResult {
        let kind = request.result_kind();
        let handle = request.handle();
        let (tx, mut rx) = oneshot::channel();

        let accepted = self.submit_transfer_request_async(request, move |result| {
            let _ = tx.send(result);
        });
        if !accepted {
            return TransferResult::empty(kind, handle, UsbResultCode::SubmitFailed);
        }

        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(oneshot::error::TryRecvError::Empty) => {
                    std::thread::sleep(BLOCKING_POLL_INTERVAL);
                    self.update();
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    error!("USB worker dropped a blocking transfer request");
                    return TransferResult::empty(kind, handle, UsbResultCode::GeneralError);
                }
            }
        }
    }
}

fn drain_results(bridge: &UsbBridge) {
    while let Some(completed) = bridge.try_recv_result() {
        completed.invoke();
    }
}

impl<B: UsbApi> Drop for DeviceManager<B> {
    fn drop(&mut self) {
        if self.is_running() {
            error!("USB device manager dropped while running, shutting down");
            self.shutdown();
        }
    }
}
