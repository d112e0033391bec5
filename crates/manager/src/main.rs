//! usb-devmgr
//!
//! Command-line front end for the USB device manager: lists devices, probes
//! a device descriptor and streams from a bulk IN endpoint.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use manager::config::expand_path;
use manager::{DeviceManager, ManagerConfig, UsbApi};
use protocol::{
    BulkBundleSpec, ControlTransfer, DEFAULT_TIMEOUT_MS, DeviceHandle, EnumeratedDevice,
    TransferRequest, UsbDeviceFilter, UsbResultCode,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const GET_DESCRIPTOR: u8 = 0x06;
const DEVICE_DESCRIPTOR: u16 = 0x0100;
const DEVICE_DESCRIPTOR_LEN: u16 = 18;

/// Longest `stream` waits for canceled bulk reads before closing the device
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "usb-devmgr")]
#[command(author, version, about = "Asynchronous USB device manager")]
#[command(long_about = "
Enumerate USB devices and run transfers through the asynchronous device manager.

EXAMPLES:
    # List connected devices
    usb-devmgr list

    # Read the device descriptor of a PSVR
    usb-devmgr probe --vid 0x054c --pid 0x09af

    # Stream bulk endpoint 0x81 for five seconds
    usb-devmgr stream --vid 0x054c --pid 0x09af --endpoint 0x81 --seconds 5

CONFIGURATION:
    Settings are read from --config, or ~/.config/psvr-usb/usb_manager.toml,
    falling back to built-in defaults.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected USB devices
    List {
        /// Print the device list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the effective configuration to the config path
    SaveConfig,

    /// Open a device and read its device descriptor
    Probe {
        #[arg(long, value_parser = parse_hex_u16)]
        vid: u16,
        #[arg(long, value_parser = parse_hex_u16)]
        pid: u16,
        #[arg(long, default_value_t = 0)]
        interface: u8,
    },

    /// Stream from a bulk IN endpoint and report throughput
    Stream {
        #[arg(long, value_parser = parse_hex_u16)]
        vid: u16,
        #[arg(long, value_parser = parse_hex_u16)]
        pid: u16,
        #[arg(long, value_parser = parse_hex_u8)]
        endpoint: u8,
        #[arg(long, default_value_t = 0)]
        interface: u8,
        #[arg(long, default_value_t = 16384)]
        transfer_size: usize,
        #[arg(long, default_value_t = 4)]
        transfers: usize,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path: Option<PathBuf> = args.config.as_deref().map(expand_path);

    if let Command::SaveConfig = args.command {
        let path = config_path.unwrap_or_else(ManagerConfig::default_path);
        ManagerConfig::load_or_create(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match config_path {
        Some(path) => ManagerConfig::load(Some(path)).context("Failed to load configuration")?,
        None => ManagerConfig::load_or_default(),
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-devmgr v{}", env!("CARGO_PKG_VERSION"));

    let mut manager = DeviceManager::new(config.usb.clone());
    manager.startup().context("Failed to start USB device manager")?;

    let result = match args.command {
        Command::List { json } => list_devices(&manager, json),
        Command::Probe { vid, pid, interface } => {
            probe_device(&manager, UsbDeviceFilter::new(vid, pid), interface)
        }
        Command::Stream {
            vid,
            pid,
            endpoint,
            interface,
            transfer_size,
            transfers,
            seconds,
        } => stream_device(
            &manager,
            UsbDeviceFilter::new(vid, pid),
            interface,
            BulkBundleSpec {
                handle: DeviceHandle(0),
                endpoint,
                transfer_size,
                in_flight_transfers: transfers,
                on_data: Arc::new(|_| {}),
            },
            Duration::from_secs(seconds),
        ),
        Command::SaveConfig => Ok(()),
    };

    info!("Shutting down USB device manager...");
    manager.shutdown();
    result
}

fn list_devices(manager: &DeviceManager, json: bool) -> Result<()> {
    let devices: Vec<EnumeratedDevice> = manager.enumerate().collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).context("Failed to serialize device list")?
        );
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!("  {} [{}] {}", device.filter, device.api_type, device.path);
        println!(
            "      Bus {:03} Device {:03} Port {}",
            device.bus_number, device.address, device.port_path
        );
        if let Err(reason) = manager.can_open_device(&device) {
            println!("      Not openable: {}", reason);
        }
        println!();
    }

    Ok(())
}

fn open_first(
    manager: &DeviceManager,
    filter: UsbDeviceFilter,
    interface: u8,
) -> Result<DeviceHandle> {
    let enumerator = manager.enumerate();
    let device = enumerator
        .find(filter)
        .ok_or_else(|| anyhow!("No device matching {} found", filter))?;

    manager
        .open_device(device, interface, 1, false)
        .map_err(|code| anyhow!("Failed to open {}: {}", device.path, code))
}

fn probe_device(manager: &DeviceManager, filter: UsbDeviceFilter, interface: u8) -> Result<()> {
    let handle = open_first(manager, filter, interface)?;

    let result = manager.submit_transfer_request_blocking(TransferRequest::Control(ControlTransfer {
        handle,
        request_type: protocol::DIRECTION_IN,
        request: GET_DESCRIPTOR,
        value: DEVICE_DESCRIPTOR,
        index: 0,
        length: DEVICE_DESCRIPTOR_LEN,
        data: Vec::new(),
        timeout_ms: DEFAULT_TIMEOUT_MS,
    }));

    if let Some(info) = manager.describe_device(handle) {
        println!("{} at {} (port {})", info.filter, info.full_path, info.port_path);
    }
    manager.close_device(handle);

    if result.result_code() != UsbResultCode::Completed {
        bail!("Descriptor read failed: {}", result.result_code());
    }

    let data = result.data();
    println!("Device descriptor ({} bytes): {:02x?}", data.len(), data);
    if data.len() >= 12 {
        println!(
            "  bcdUSB {:x}.{:02x}  idVendor {:04x}  idProduct {:04x}",
            data[3],
            data[2],
            u16::from_le_bytes([data[8], data[9]]),
            u16::from_le_bytes([data[10], data[11]])
        );
    }

    Ok(())
}

fn stream_device(
    manager: &DeviceManager,
    filter: UsbDeviceFilter,
    interface: u8,
    mut spec: BulkBundleSpec,
    duration: Duration,
) -> Result<()> {
    let handle = open_first(manager, filter, interface)?;

    let bytes = Arc::new(AtomicU64::new(0));
    let packets = Arc::new(AtomicU64::new(0));
    spec.handle = handle;
    spec.on_data = {
        let bytes = Arc::clone(&bytes);
        let packets = Arc::clone(&packets);
        Arc::new(move |data: &[u8]| {
            bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
            packets.fetch_add(1, Ordering::Relaxed);
        })
    };

    let started = manager.submit_transfer_request_blocking(TransferRequest::StartBulkBundle(spec));
    if started.result_code() != UsbResultCode::Started {
        manager.close_device(handle);
        bail!("Failed to start bulk stream: {}", started.result_code());
    }

    println!("Streaming from {} for {:?}...", handle, duration);
    let begin = Instant::now();
    while begin.elapsed() < duration {
        manager.update();
        std::thread::sleep(Duration::from_millis(10));
    }

    let canceled = manager
        .submit_transfer_request_blocking(TransferRequest::CancelBulkBundle { handle });
    if canceled.result_code() != UsbResultCode::Canceled {
        warn!("Cancel of bulk stream returned {}", canceled.result_code());
    }
    if !wait_for_bundle_drain(manager, CANCEL_DRAIN_TIMEOUT) {
        warn!("Bulk stream on {} still draining after {:?}", handle, CANCEL_DRAIN_TIMEOUT);
    }

    let elapsed = begin.elapsed().as_secs_f64();
    let total = bytes.load(Ordering::Relaxed);
    println!(
        "Received {} bytes in {} packets ({:.1} KiB/s)",
        total,
        packets.load(Ordering::Relaxed),
        total as f64 / 1024.0 / elapsed.max(f64::EPSILON)
    );

    manager.close_device(handle);
    Ok(())
}

/// Deliver results until no bulk bundle is left canceling
fn wait_for_bundle_drain<B: UsbApi>(manager: &DeviceManager<B>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        manager.update();
        if manager.transfer_stats().canceling_bundles == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manager::UsbSettings;
    use manager::test_utils::{DEFAULT_TEST_TIMEOUT, MockBehavior, MockUsbApi, mock_device};
    use protocol::UsbApiType;

    #[test]
    fn test_stream_waits_for_canceled_reads() {
        let device = mock_device(1, 0x054c, 0x09af);
        let api = MockUsbApi::with_behavior(
            vec![device.clone()],
            MockBehavior {
                hold_bundle_drain: true,
                ..MockBehavior::default()
            },
        );
        let control = api.controller();
        let mut manager = DeviceManager::with_backend(UsbSettings::with_api(UsbApiType::LibUsb), api);
        manager.startup().unwrap();

        let handle = manager.open_device(&device, 0, 1, false).unwrap();
        let started = manager.submit_transfer_request_blocking(TransferRequest::StartBulkBundle(
            BulkBundleSpec {
                handle,
                endpoint: 0x81,
                transfer_size: 64,
                in_flight_transfers: 2,
                on_data: Arc::new(|_| {}),
            },
        ));
        assert_eq!(started.result_code(), UsbResultCode::Started);
        let canceled = manager
            .submit_transfer_request_blocking(TransferRequest::CancelBulkBundle { handle });
        assert_eq!(canceled.result_code(), UsbResultCode::Canceled);

        assert!(!wait_for_bundle_drain(&manager, Duration::from_millis(50)));

        control.configure(|b| b.hold_bundle_drain = false);
        assert!(wait_for_bundle_drain(&manager, DEFAULT_TEST_TIMEOUT));
        assert_eq!(manager.transfer_stats().active_bundles, 0);

        manager.close_device(handle);
        manager.shutdown();
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u16("0x054c"), Ok(0x054c));
        assert_eq!(parse_hex_u16("09AF"), Ok(0x09af));
        assert!(parse_hex_u16("zz").is_err());
        assert_eq!(parse_hex_u8("0x81"), Ok(0x81));
        assert!(parse_hex_u8("0x181").is_err());
    }

    #[test]
    fn test_cli_parses_stream() {
        let args = Args::parse_from([
            "usb-devmgr", "stream", "--vid", "054c", "--pid", "0x09af", "--endpoint", "0x81",
        ]);
        match args.command {
            Command::Stream { vid, endpoint, transfers, .. } => {
                assert_eq!(vid, 0x054c);
                assert_eq!(endpoint, 0x81);
                assert_eq!(transfers, 4);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
