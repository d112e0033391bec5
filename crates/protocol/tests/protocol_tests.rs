//! Integration tests for the shared protocol types
//!
//! Covers the stable diagnostic strings, request/result pairing and the
//! serialized form of device identities used by the CLI.

use protocol::{
    BulkBundleSpec, ControlTransfer, DEFAULT_TIMEOUT_MS, DeviceHandle, EndpointTransfer,
    EnumeratedDevice, TransferRequest, TransferResult, TransferResultKind, UsbApiType,
    UsbDeviceFilter, UsbResultCode,
};
use std::sync::Arc;

fn control_request(handle: u32) -> TransferRequest {
    TransferRequest::Control(ControlTransfer {
        handle: DeviceHandle(handle),
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 18,
        data: Vec::new(),
        timeout_ms: DEFAULT_TIMEOUT_MS,
    })
}

mod error_strings {
    use super::*;

    #[test]
    fn test_every_code_has_a_distinct_string() {
        let codes = [
            UsbResultCode::Started,
            UsbResultCode::Canceled,
            UsbResultCode::Completed,
            UsbResultCode::GeneralError,
            UsbResultCode::BadHandle,
            UsbResultCode::NoMemory,
            UsbResultCode::SubmitFailed,
            UsbResultCode::DeviceNotOpen,
            UsbResultCode::TransferNotActive,
            UsbResultCode::TransferAlreadyStarted,
            UsbResultCode::Overflow,
            UsbResultCode::Pipe,
            UsbResultCode::TimedOut,
        ];

        let mut strings: Vec<&str> = codes.iter().map(|c| c.error_string()).collect();
        assert!(strings.iter().all(|s| !s.is_empty()));
        strings.sort_unstable();
        strings.dedup();
        assert_eq!(strings.len(), codes.len());
    }

    #[test]
    fn test_known_strings() {
        assert_eq!(UsbResultCode::BadHandle.error_string(), "Bad USB handle");
        assert_eq!(
            UsbResultCode::TransferAlreadyStarted.error_string(),
            "Transfer Already Active"
        );
        assert_eq!(UsbResultCode::Canceled.to_string(), "Transfer Cancelled");
    }
}

mod request_result_pairing {
    use super::*;

    #[test]
    fn test_control_failure() {
        let result = control_request(42).failure(UsbResultCode::BadHandle);
        assert_eq!(
            result,
            TransferResult::Control {
                handle: DeviceHandle(42),
                result_code: UsbResultCode::BadHandle,
                data: Vec::new(),
            }
        );
    }

    #[test]
    fn test_bundle_requests_share_result_kind() {
        let start = TransferRequest::StartBulkBundle(BulkBundleSpec {
            handle: DeviceHandle(2),
            endpoint: 0x81,
            transfer_size: 1024,
            in_flight_transfers: 2,
            on_data: Arc::new(|_| {}),
        });
        let cancel = TransferRequest::CancelBulkBundle {
            handle: DeviceHandle(2),
        };

        assert_eq!(start.result_kind(), TransferResultKind::BulkBundle);
        assert_eq!(cancel.result_kind(), TransferResultKind::BulkBundle);
        assert_eq!(start.handle(), cancel.handle());
    }

    #[test]
    fn test_endpoint_transfer_kinds() {
        let transfer = EndpointTransfer {
            handle: DeviceHandle(5),
            endpoint: 0x02,
            length: 0,
            data: vec![1, 2, 3],
            timeout_ms: 100,
        };
        let interrupt = TransferRequest::Interrupt(transfer.clone());
        let bulk = TransferRequest::Bulk(transfer);

        assert_eq!(interrupt.result_kind(), TransferResultKind::Interrupt);
        assert_eq!(bulk.result_kind(), TransferResultKind::Bulk);
    }

    #[test]
    fn test_result_with_data() {
        let result = TransferResult::with_data(
            TransferResultKind::Bulk,
            DeviceHandle(9),
            UsbResultCode::Completed,
            vec![0xde, 0xad],
        );
        assert_eq!(result.data(), &[0xde, 0xad]);
        assert_eq!(result.result_code(), UsbResultCode::Completed);
    }
}

mod serialization {
    use super::*;

    #[test]
    fn test_enumerated_device_json() {
        let device = EnumeratedDevice {
            api_type: UsbApiType::LibUsb,
            filter: UsbDeviceFilter::new(0x05a9, 0x058a),
            path: "usb\\vid_05a9&pid_058a\\1-4".to_string(),
            port_path: "1-4".to_string(),
            unique_identifier: "05a9_058a_1-4".to_string(),
            bus_number: 1,
            address: 7,
        };

        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"port_path\":\"1-4\""));

        let decoded: EnumeratedDevice = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, device);
    }
}
