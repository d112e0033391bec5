//! USB Bridge Integration Tests
//!
//! Tests for the channel bridge between caller threads and the USB worker
//! thread.
//!
//! # Test Scenarios
//! - Request / reply round trips with a worker thread
//! - Transfer submission and callback delivery
//! - Queue capacity and backpressure
//! - Worker exit signalling and closed channels
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use async_channel::TrySendError;
use common::{CompletedTransfer, TransferStats, UsbCommand, create_usb_bridge};
use protocol::{DeviceHandle, TransferRequest, TransferResult, UsbResultCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

fn cancel_request(handle: u32) -> TransferRequest {
    TransferRequest::CancelBulkBundle {
        handle: DeviceHandle(handle),
    }
}

// ============================================================================
// Request / Reply
// ============================================================================

#[test]
fn test_worker_answers_requests_until_shutdown() {
    let (bridge, worker) = create_usb_bridge(8);

    let worker_thread = thread::spawn(move || {
        let mut answered = 0;
        while let Some(cmd) = worker.recv_command() {
            match cmd {
                UsbCommand::EnumerateDevices { response } => {
                    let _ = response.send(Vec::new());
                    answered += 1;
                }
                UsbCommand::DescribeDevice { response, .. } => {
                    let _ = response.send(None);
                    answered += 1;
                }
                UsbCommand::Shutdown => break,
                other => panic!("unexpected command {:?}", other),
            }
        }
        answered
    });

    assert!(bridge.request(|response| UsbCommand::EnumerateDevices { response }).unwrap().is_empty());
    assert!(
        bridge
            .request(|response| UsbCommand::DescribeDevice {
                handle: DeviceHandle(7),
                response,
            })
            .unwrap()
            .is_none()
    );

    bridge.send_command(UsbCommand::Shutdown).unwrap();
    assert_eq!(worker_thread.join().unwrap(), 2);
}

#[test]
fn test_request_fails_when_worker_is_gone() {
    let (bridge, worker) = create_usb_bridge(2);
    drop(worker);

    let result = bridge.request(|response| UsbCommand::GetTransferStats { response });
    assert!(matches!(result, Err(common::Error::Channel(_))));
}

#[test]
fn test_dropped_reply_is_an_error() {
    let (bridge, worker) = create_usb_bridge(2);

    let worker_thread = thread::spawn(move || {
        // Take the command and drop its reply sender unanswered.
        drop(worker.recv_command());
    });

    let result: common::Result<TransferStats> =
        bridge.request(|response| UsbCommand::GetTransferStats { response });
    assert!(result.is_err());
    worker_thread.join().unwrap();
}

// ============================================================================
// Transfer Results
// ============================================================================

#[test]
fn test_callbacks_run_on_receiving_thread() {
    let (bridge, mut worker) = create_usb_bridge(16);
    let completed = Arc::new(AtomicU32::new(0));

    for handle in 0..5 {
        let completed = Arc::clone(&completed);
        let callback = Box::new(move |result: TransferResult| {
            assert_eq!(result.result_code(), UsbResultCode::TransferNotActive);
            completed.fetch_add(1, Ordering::SeqCst);
        });
        bridge
            .try_send_command(UsbCommand::SubmitTransfer {
                request: cancel_request(handle),
                callback,
            })
            .unwrap();
    }

    let worker_thread = thread::spawn(move || {
        while let Some(UsbCommand::SubmitTransfer { request, callback }) = worker.try_recv_command() {
            worker.post_result(CompletedTransfer::new(
                request.failure(UsbResultCode::TransferNotActive),
                callback,
            ));
        }
        worker
    });
    let _worker = worker_thread.join().unwrap();

    // Nothing runs until the caller drains the result queue.
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    while let Some(result) = bridge.try_recv_result() {
        result.invoke();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 5);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_full_request_queue_returns_command() {
    let (bridge, _worker) = create_usb_bridge(2);

    bridge.try_send_command(UsbCommand::Shutdown).unwrap();
    bridge.try_send_command(UsbCommand::Shutdown).unwrap();
    assert_eq!(bridge.pending_commands(), 2);

    match bridge.try_send_command(UsbCommand::Shutdown) {
        Err(TrySendError::Full(UsbCommand::Shutdown)) => {}
        other => panic!("expected a full queue, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_results_after_caller_drop_are_discarded() {
    let (bridge, mut worker) = create_usb_bridge(1);
    drop(bridge);

    worker.post_result(CompletedTransfer::new(
        cancel_request(1).failure(UsbResultCode::Canceled),
        Box::new(|_| panic!("callback must not run")),
    ));
    assert_eq!(worker.backlog_len(), 0);
    assert!(worker.recv_command().is_none());
}

// ============================================================================
// Exit Signal
// ============================================================================

#[test]
fn test_exit_signal_visible_across_clones() {
    let (bridge, worker) = create_usb_bridge(1);
    let other = bridge.clone();

    assert!(!bridge.exit_signaled());
    other.signal_exit();
    assert!(bridge.exit_signaled());
    assert!(worker.exit_signaled());
}
