//! Bounded channel bridge between caller threads and the USB worker thread
//!
//! Requests flow caller -> worker through one bounded queue, completed
//! transfers flow worker -> caller through another. Device-table operations
//! that need an answer carry a oneshot reply sender.

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use protocol::{
    DeviceHandle, EnumeratedDevice, TransferCallback, TransferRequest, TransferResult,
    UsbDeviceFilter, UsbResultCode,
};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Default capacity of both queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Identity of an open device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDeviceInfo {
    pub filter: UsbDeviceFilter,
    pub full_path: String,
    pub port_path: String,
}

/// Snapshot of the worker's in-flight bookkeeping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub active_control_transfers: usize,
    pub active_interrupt_transfers: usize,
    pub active_bulk_transfers: usize,
    pub active_bundles: usize,
    pub canceling_bundles: usize,
    pub open_devices: usize,
}

impl TransferStats {
    /// True when nothing is outstanding on the worker
    pub fn is_idle(&self) -> bool {
        self.active_control_transfers == 0
            && self.active_interrupt_transfers == 0
            && self.active_bulk_transfers == 0
            && self.active_bundles == 0
            && self.canceling_bundles == 0
    }
}

/// Commands from caller threads to the USB worker thread
pub enum UsbCommand {
    /// Snapshot the connected devices
    EnumerateDevices {
        response: oneshot::Sender<Vec<EnumeratedDevice>>,
    },

    /// Check whether a device could be opened
    CanOpenDevice {
        device: EnumeratedDevice,
        response: oneshot::Sender<Result<(), String>>,
    },

    /// Open a device and allocate a handle for it
    OpenDevice {
        device: EnumeratedDevice,
        interface: u8,
        configuration: u8,
        reset: bool,
        response: oneshot::Sender<Result<DeviceHandle, UsbResultCode>>,
    },

    /// Close a device; unknown handles are ignored
    CloseDevice {
        handle: DeviceHandle,
        response: oneshot::Sender<()>,
    },

    /// Look up an open device's identity
    DescribeDevice {
        handle: DeviceHandle,
        response: oneshot::Sender<Option<OpenDeviceInfo>>,
    },

    /// Read the worker's in-flight counters
    GetTransferStats {
        response: oneshot::Sender<TransferStats>,
    },

    /// Submit a transfer request; the callback fires once with its result
    SubmitTransfer {
        request: TransferRequest,
        callback: TransferCallback,
    },

    /// Wake the worker so it observes the exit signal
    Shutdown,
}

impl fmt::Debug for UsbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbCommand::EnumerateDevices { .. } => f.write_str("EnumerateDevices"),
            UsbCommand::CanOpenDevice { device, .. } => {
                f.debug_struct("CanOpenDevice").field("device", &device.path).finish()
            }
            UsbCommand::OpenDevice {
                device,
                interface,
                configuration,
                reset,
                ..
            } => f
                .debug_struct("OpenDevice")
                .field("device", &device.path)
                .field("interface", interface)
                .field("configuration", configuration)
                .field("reset", reset)
                .finish(),
            UsbCommand::CloseDevice { handle, .. } => {
                f.debug_struct("CloseDevice").field("handle", handle).finish()
            }
            UsbCommand::DescribeDevice { handle, .. } => {
                f.debug_struct("DescribeDevice").field("handle", handle).finish()
            }
            UsbCommand::GetTransferStats { .. } => f.write_str("GetTransferStats"),
            UsbCommand::SubmitTransfer { request, .. } => f
                .debug_struct("SubmitTransfer")
                .field("request", request)
                .finish_non_exhaustive(),
            UsbCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// A finished request paired with the callback that receives it
pub struct CompletedTransfer {
    pub result: TransferResult,
    pub callback: TransferCallback,
}

impl CompletedTransfer {
    pub fn new(result: TransferResult, callback: TransferCallback) -> Self {
        Self { result, callback }
    }

    /// Consume the pair, running the callback exactly once
    pub fn invoke(self) {
        (self.callback)(self.result);
    }
}

impl fmt::Debug for CompletedTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedTransfer")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

/// Caller-side end of the bridge
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    result_rx: Receiver<CompletedTransfer>,
    exit_signaled: Arc<AtomicBool>,
}

impl UsbBridge {
    /// Queue a command without blocking
    pub fn try_send_command(&self, cmd: UsbCommand) -> Result<(), TrySendError<UsbCommand>> {
        self.cmd_tx.try_send(cmd)
    }

    /// Queue a command, waiting for space if the queue is full
    pub fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Send a command built around a reply channel and wait for the reply
    pub fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> UsbCommand,
    ) -> crate::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.blocking_recv()
            .map_err(|e| crate::Error::Channel(format!("worker dropped reply: {}", e)))
    }

    /// Take the next completed transfer, if any
    pub fn try_recv_result(&self) -> Option<CompletedTransfer> {
        match self.result_rx.try_recv() {
            Ok(completed) => Some(completed),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Ask the worker loop to exit at its next opportunity
    pub fn signal_exit(&self) {
        self.exit_signaled.store(true, Ordering::SeqCst);
    }

    pub fn exit_signaled(&self) -> bool {
        self.exit_signaled.load(Ordering::SeqCst)
    }

    /// Number of commands waiting for the worker
    pub fn pending_commands(&self) -> usize {
        self.cmd_tx.len()
    }
}

/// Worker-side end of the bridge
///
/// Results that do not fit in the bounded result queue are held in a local
/// backlog so the worker never blocks on a caller that is slow to `update()`.
pub struct UsbWorker {
    cmd_rx: Receiver<UsbCommand>,
    result_tx: Sender<CompletedTransfer>,
    exit_signaled: Arc<AtomicBool>,
    backlog: VecDeque<CompletedTransfer>,
}

impl UsbWorker {
    /// Wait for the next command; `None` once every caller handle is gone
    pub fn recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.recv_blocking().ok()
    }

    /// Take the next command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    pub fn exit_signaled(&self) -> bool {
        self.exit_signaled.load(Ordering::SeqCst)
    }

    /// Publish a completed transfer to the callers
    pub fn post_result(&mut self, completed: CompletedTransfer) {
        self.flush_backlog();

        if !self.backlog.is_empty() {
            self.backlog.push_back(completed);
            return;
        }

        match self.result_tx.try_send(completed) {
            Ok(()) => {}
            Err(TrySendError::Full(completed)) => {
                trace!("Result queue full, holding result in backlog");
                self.backlog.push_back(completed);
            }
            Err(TrySendError::Closed(completed)) => {
                debug!("Result queue closed, dropping {:?}", completed.result);
            }
        }
    }

    /// Move backlogged results into the result queue while it has room
    pub fn flush_backlog(&mut self) {
        while let Some(completed) = self.backlog.pop_front() {
            match self.result_tx.try_send(completed) {
                Ok(()) => {}
                Err(TrySendError::Full(completed)) => {
                    self.backlog.push_front(completed);
                    break;
                }
                Err(TrySendError::Closed(completed)) => {
                    debug!("Result queue closed, dropping {:?}", completed.result);
                }
            }
        }
    }

    /// Results waiting for room in the result queue
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Create the channel bridge between callers and the USB worker thread
///
/// Returns (UsbBridge for callers, UsbWorker for the worker thread)
pub fn create_usb_bridge(capacity: usize) -> (UsbBridge, UsbWorker) {
    let capacity = capacity.max(1);
    let (cmd_tx, cmd_rx) = bounded(capacity);
    let (result_tx, result_rx) = bounded(capacity);
    let exit_signaled = Arc::new(AtomicBool::new(false));

    (
        UsbBridge {
            cmd_tx,
            result_rx,
            exit_signaled: exit_signaled.clone(),
        },
        UsbWorker {
            cmd_rx,
            result_tx,
            exit_signaled,
            backlog: VecDeque::new(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::TransferResultKind;

    fn bundle_result(handle: u32) -> TransferResult {
        TransferResult::empty(
            TransferResultKind::BulkBundle,
            DeviceHandle(handle),
            UsbResultCode::Started,
        )
    }

    #[test]
    fn test_request_reply_round_trip() {
        let (bridge, worker) = create_usb_bridge(4);

        let handle = std::thread::spawn(move || {
            if let Some(UsbCommand::GetTransferStats { response }) = worker.recv_command() {
                let _ = response.send(TransferStats {
                    open_devices: 2,
                    ..Default::default()
                });
            }
        });

        let stats = bridge
            .request(|response| UsbCommand::GetTransferStats { response })
            .unwrap();
        assert_eq!(stats.open_devices, 2);
        handle.join().unwrap();
    }

    #[test]
    fn test_backlog_preserves_order() {
        let (bridge, mut worker) = create_usb_bridge(1);

        for handle in 0..3 {
            worker.post_result(CompletedTransfer::new(bundle_result(handle), Box::new(|_| {})));
        }
        assert_eq!(worker.backlog_len(), 2);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let completed = bridge.try_recv_result().unwrap();
            seen.push(completed.result.handle().0);
            worker.flush_backlog();
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(worker.backlog_len(), 0);
    }

    #[test]
    fn test_exit_signal_is_shared() {
        let (bridge, worker) = create_usb_bridge(1);
        assert!(!worker.exit_signaled());
        bridge.signal_exit();
        assert!(worker.exit_signaled());
    }
}
