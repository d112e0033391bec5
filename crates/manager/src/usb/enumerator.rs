//! Device enumeration cursor

use protocol::{EnumeratedDevice, UsbApiType, UsbDeviceFilter};

/// Restartable cursor over a snapshot of connected devices
///
/// The snapshot is taken once, when the manager hands the enumerator out;
/// devices attached afterwards need a fresh enumeration.
#[derive(Debug, Clone, Default)]
pub struct UsbDeviceEnumerator {
    devices: Vec<EnumeratedDevice>,
    cursor: usize,
}

impl UsbDeviceEnumerator {
    pub fn new(devices: Vec<EnumeratedDevice>) -> Self {
        Self { devices, cursor: 0 }
    }

    /// True while the cursor points at a device
    pub fn is_valid(&self) -> bool {
        self.cursor < self.devices.len()
    }

    pub fn advance(&mut self) {
        if self.is_valid() {
            self.cursor += 1;
        }
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    pub fn current(&self) -> Option<&EnumeratedDevice> {
        self.devices.get(self.cursor)
    }

    pub fn device_filter(&self) -> Option<UsbDeviceFilter> {
        self.current().map(|d| d.filter)
    }

    pub fn path(&self) -> Option<&str> {
        self.current().map(|d| d.path.as_str())
    }

    pub fn unique_identifier(&self) -> Option<&str> {
        self.current().map(|d| d.unique_identifier.as_str())
    }

    pub fn api_type(&self) -> Option<UsbApiType> {
        self.current().map(|d| d.api_type)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// First device matching `filter`, from the start of the snapshot
    pub fn find(&self, filter: UsbDeviceFilter) -> Option<&EnumeratedDevice> {
        self.devices.iter().find(|d| d.filter == filter)
    }

    pub fn devices(&self) -> &[EnumeratedDevice] {
        &self.devices
    }
}

impl Iterator for UsbDeviceEnumerator {
    type Item = EnumeratedDevice;

    fn next(&mut self) -> Option<Self::Item> {
        let device = self.current().cloned();
        self.advance();
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vid: u16, pid: u16, port: &str) -> EnumeratedDevice {
        EnumeratedDevice {
            api_type: UsbApiType::LibUsb,
            filter: UsbDeviceFilter::new(vid, pid),
            path: format!("usb\\vid_{:04x}&pid_{:04x}\\{}", vid, pid, port),
            port_path: port.to_string(),
            unique_identifier: format!("{:04x}_{:04x}_{}", vid, pid, port),
            bus_number: 1,
            address: 2,
        }
    }

    #[test]
    fn test_cursor_walk_and_restart() {
        let mut e = UsbDeviceEnumerator::new(vec![device(0x054c, 0x09af, "1-1"), device(0x1234, 0x5678, "1-2")]);

        assert!(e.is_valid());
        assert_eq!(e.device_filter(), Some(UsbDeviceFilter::new(0x054c, 0x09af)));
        e.advance();
        assert_eq!(e.unique_identifier(), Some("1234_5678_1-2"));
        e.advance();
        assert!(!e.is_valid());
        assert!(e.path().is_none());

        e.advance();
        assert!(!e.is_valid());

        e.restart();
        assert_eq!(e.api_type(), Some(UsbApiType::LibUsb));
        assert_eq!(e.count(), 2);
    }

    #[test]
    fn test_empty_enumerator() {
        let mut e = UsbDeviceEnumerator::default();
        assert!(!e.is_valid());
        assert!(e.is_empty());
        assert!(e.next().is_none());
    }

    #[test]
    fn test_find_by_filter() {
        let e = UsbDeviceEnumerator::new(vec![device(0x054c, 0x09af, "1-1")]);
        assert!(e.find(UsbDeviceFilter::new(0x054c, 0x09af)).is_some());
        assert!(e.find(UsbDeviceFilter::new(0, 0)).is_none());
    }
}
