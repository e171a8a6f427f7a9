//! Subcommand implementations

use anyhow::{Context, Result, anyhow, bail};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};
use transport::{BulkUsb, DeviceEvent, DeviceInfo};

/// Render the device table for humans, or as JSON
pub fn render_devices(devices: &[DeviceInfo], json: bool) -> Result<String> {
    if json {
        return serde_json::to_string_pretty(devices).context("Failed to encode device list");
    }

    if devices.is_empty() {
        return Ok("No allowed bulk USB devices found.\n".to_string());
    }

    let mut out = format!("Found {} device(s):\n\n", devices.len());
    for device in devices {
        let identity = &device.identity;
        let _ = writeln!(
            out,
            "  [{}] {:04x}:{:04x} - {} {}{}",
            device.index,
            identity.vendor_id,
            identity.product_id,
            identity
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            identity.product.as_deref().unwrap_or("Unknown Product"),
            match (device.is_open, device.stale) {
                (true, true) => " (open, unplugged)",
                (true, false) => " (open)",
                _ => "",
            }
        );
        let _ = writeln!(
            out,
            "      Location {} Interface {} IN {:#04x} OUT {:#04x} ({} bytes)",
            device.location,
            device.endpoints.interface_number,
            device.endpoints.input.address,
            device.endpoints.output.address,
            device.endpoints.input.max_packet_size
        );
        if let Some(serial) = &identity.serial_number {
            let _ = writeln!(out, "      Serial: {}", serial);
        }
        out.push('\n');
    }

    Ok(out)
}

/// Scan and print the allowed devices
pub fn list(usb: &BulkUsb, json: bool) -> Result<()> {
    let (count, mask) = usb.available_device_count()?;
    debug!("{} devices, slot mask {:#010x}", count, mask);

    print!("{}", render_devices(&usb.devices(), json)?);
    Ok(())
}

/// Read up to `len` bytes from device `index`
pub fn read(
    usb: &BulkUsb,
    index: usize,
    len: usize,
    timeout: Duration,
    short: bool,
) -> Result<Vec<u8>> {
    usb.rescan()?;
    let handle = usb
        .open(index)
        .with_context(|| format!("Failed to open device {}", index))?;
    usb.set_mode(handle, short, false)?;

    let mut buf = vec![0u8; len];
    let result = usb.read_timed(handle, &mut buf, timeout);
    usb.close(handle);

    let n = result.with_context(|| format!("Read from device {} failed", index))?;
    buf.truncate(n);
    info!("Read {} of {} bytes from device {}", n, len, index);
    Ok(buf)
}

/// Write `data` to device `index`, returning the number of bytes accepted
pub fn write(usb: &BulkUsb, index: usize, data: &[u8], timeout: Duration) -> Result<usize> {
    usb.rescan()?;
    let handle = usb
        .open(index)
        .with_context(|| format!("Failed to open device {}", index))?;

    let result = usb.write_timed(handle, data, timeout);
    usb.close(handle);

    let n = result.with_context(|| format!("Write to device {} failed", index))?;
    info!("Wrote {} of {} bytes to device {}", n, data.len(), index);
    Ok(n)
}

/// Print device arrivals and removals until Ctrl-C
pub async fn monitor(usb: Arc<BulkUsb>) -> Result<()> {
    let (_subscription, events) = usb.event_channel();
    usb.start_monitor()?;

    usb.rescan()?;
    print!("{}", render_devices(&usb.devices(), false)?);
    println!("Watching for device changes, press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else {
                    break;
                };
                match event {
                    DeviceEvent::Added(index) => match usb.device_info(index) {
                        Ok(info) => println!(
                            "+ [{}] {:04x}:{:04x} at {}",
                            index, info.identity.vendor_id, info.identity.product_id, info.location
                        ),
                        Err(_) => println!("+ [{}]", index),
                    },
                    DeviceEvent::Removed(index) => println!("- [{}]", index),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping monitor");
                break;
            }
        }
    }

    usb.stop_monitor();
    Ok(())
}

/// Parse a hex string such as `"de ad be ef"` or `"0xdeadbeef"`
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        bail!("Invalid hex digit '{}'", bad);
    }
    if digits.len() % 2 != 0 {
        bail!("Hex data must have an even number of digits");
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair)?;
            u8::from_str_radix(pair, 16).map_err(|_| anyhow!("Invalid hex byte '{}'", pair))
        })
        .collect()
}

/// Format bytes as a classic hex dump, 16 per line
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", line * 16);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::test_utils::{MockBackend, MockDevice};
    use transport::{LocationKey, UsbSettings};

    fn usb_with_device() -> (MockDevice, BulkUsb) {
        let device = MockDevice::bulk(0x8765, 0x1234, LocationKey(0x0305)).with_strings(
            Some("Acme"),
            Some("Widget"),
            Some("SN42"),
        );
        let backend = Arc::new(MockBackend::with_devices(vec![device.clone()]));
        let settings = UsbSettings {
            allowed_devices: vec!["0x8765:0x1234".to_string()],
            ..Default::default()
        };
        (device, BulkUsb::init(backend, &settings).unwrap())
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("deadBEEF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex("0x01 02:03").unwrap(), vec![1, 2, 3]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("").unwrap().is_empty());
        assert!(parse_hex("a\u{e9}b").is_err());
        assert!(parse_hex("\u{e9}\u{e9}").is_err());
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(&(0u8..18).collect::<Vec<_>>());
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  00 01"));
        assert_eq!(lines[1], "00000010  10 11");
    }

    #[test]
    fn test_render_devices() {
        let (_device, usb) = usb_with_device();
        usb.rescan().unwrap();
        let devices = usb.devices();

        let text = render_devices(&devices, false).unwrap();
        assert!(text.contains("[0] 8765:1234 - Acme Widget"));
        assert!(text.contains("Location 003:005"));
        assert!(text.contains("Serial: SN42"));

        let json: serde_json::Value =
            serde_json::from_str(&render_devices(&devices, true).unwrap()).unwrap();
        assert_eq!(json[0]["vendor_id"], 0x8765);
        assert_eq!(json[0]["serial_number"], "SN42");
        assert_eq!(json[0]["is_open"], false);

        assert!(render_devices(&[], false).unwrap().starts_with("No allowed"));
    }

    #[test]
    fn test_write_then_read() {
        let (device, usb) = usb_with_device();

        let n = write(&usb, 0, b"hello", Duration::from_millis(100)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(device.io().written(), b"hello");
        assert_eq!(device.io().open_handles(), 0);

        device.io().push_inbound(b"world".to_vec());
        let data = read(&usb, 0, 64, Duration::from_millis(100), true).unwrap();
        assert_eq!(data, b"world");
    }

    #[test]
    fn test_read_missing_device() {
        let (_device, usb) = usb_with_device();
        assert!(read(&usb, 3, 8, Duration::from_millis(10), false).is_err());
    }
}
