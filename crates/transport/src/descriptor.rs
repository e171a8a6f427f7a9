//! Configuration descriptor parsing
//!
//! Walks a raw configuration descriptor set and extracts the bulk IN/OUT
//! endpoint pair of a vendor-specific interface. Pure code with no platform
//! dependency.

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use thiserror::Error;

/// bDescriptorType of a configuration descriptor
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
/// bDescriptorType of an interface descriptor
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
/// bDescriptorType of an endpoint descriptor
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

/// bInterfaceClass of a vendor-specific interface
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xff;

/// Transfer type bits of bmAttributes for bulk endpoints
const TRANSFER_TYPE_BULK: u8 = 0x02;

const CONFIG_HEADER_LEN: usize = 9;
const INTERFACE_LEN: usize = 9;
const ENDPOINT_LEN: usize = 7;

/// Direction bit of bEndpointAddress
const ENDPOINT_DIR_IN: u8 = 0x80;

/// Descriptor parsing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("malformed descriptor at offset {offset}")]
    MalformedDescriptor { offset: usize },

    #[error("interface {interface} has class {class:#04x}, not vendor-specific")]
    InterfaceNotBulk { interface: u8, class: u8 },

    #[error("interface {interface} lacks a bulk {direction} endpoint")]
    EndpointNotFound {
        interface: u8,
        direction: Direction,
    },

    #[error("configuration has no interface at index {index}")]
    NoSuchInterface { index: u8 },
}

/// Endpoint direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

/// A single bulk endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// bEndpointAddress including the direction bit
    pub address: u8,
    /// wMaxPacketSize (packet size bits only)
    pub max_packet_size: u16,
}

impl Endpoint {
    pub fn direction(&self) -> Direction {
        if self.address & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// The bulk endpoint pair of one interface
///
/// Both directions are always present; a half-populated pair is never built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkEndpoints {
    /// bInterfaceNumber to claim
    pub interface_number: u8,
    pub input: Endpoint,
    pub output: Endpoint,
}

/// Iterator over the variable-length records of a descriptor set
///
/// Yields `(offset, record)`; a record that runs past the buffer or
/// declares a length below 2 yields an error and ends iteration.
struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Records<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(usize, &'a [u8]), DescriptorError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let offset = self.offset;
        let remaining = &self.buf[offset..];
        let length = remaining[0] as usize;
        if remaining.len() < 2 || length < 2 || length > remaining.len() {
            self.failed = true;
            return Some(Err(DescriptorError::MalformedDescriptor { offset }));
        }

        self.offset += length;
        Some(Ok((offset, &remaining[..length])))
    }
}

/// Parse the bulk endpoint pair of the interface at `target` (zero based)
///
/// Interface indices count interface descriptors with alternate setting 0.
pub fn parse_bulk_endpoints(buf: &[u8], target: u8) -> Result<BulkEndpoints, DescriptorError> {
    let buf = &buf[..validate_header(buf)?];

    let mut seen_interfaces: u16 = 0;
    let mut collecting: Option<u8> = None;
    let mut input: Option<Endpoint> = None;
    let mut output: Option<Endpoint> = None;

    for record in Records::new(buf).skip(1) {
        let (offset, record) = record?;

        match record[1] {
            DESCRIPTOR_TYPE_INTERFACE => {
                if record.len() < INTERFACE_LEN {
                    return Err(DescriptorError::MalformedDescriptor { offset });
                }

                // Next interface (or alternate setting) ends the target's records
                if let Some(interface) = collecting {
                    return Err(missing_endpoint(interface, input));
                }

                let (number, alternate, class) = (record[2], record[3], record[5]);
                if alternate != 0 {
                    continue;
                }

                if seen_interfaces == target as u16 {
                    if class != CLASS_VENDOR_SPECIFIC {
                        return Err(DescriptorError::InterfaceNotBulk {
                            interface: number,
                            class,
                        });
                    }
                    collecting = Some(number);
                }
                seen_interfaces += 1;
            }
            DESCRIPTOR_TYPE_ENDPOINT if collecting.is_some() => {
                if record.len() < ENDPOINT_LEN {
                    return Err(DescriptorError::MalformedDescriptor { offset });
                }

                let attributes = record[3];
                if attributes & 0x03 != TRANSFER_TYPE_BULK {
                    continue;
                }

                let endpoint = Endpoint {
                    address: record[2],
                    max_packet_size: LittleEndian::read_u16(&record[4..6]) & 0x07ff,
                };
                match endpoint.direction() {
                    Direction::In if input.is_none() => input = Some(endpoint),
                    Direction::Out if output.is_none() => output = Some(endpoint),
                    _ => {}
                }

                if let (Some(input), Some(output), Some(interface_number)) =
                    (input, output, collecting)
                {
                    return Ok(BulkEndpoints {
                        interface_number,
                        input,
                        output,
                    });
                }
            }
            _ => {}
        }
    }

    match collecting {
        Some(interface) => Err(missing_endpoint(interface, input)),
        None => Err(DescriptorError::NoSuchInterface { index: target }),
    }
}

/// Check the configuration header and that `wTotalLength` fits the buffer
///
/// Returns `wTotalLength`; bytes past it are ignored.
fn validate_header(buf: &[u8]) -> Result<usize, DescriptorError> {
    let malformed = |offset| DescriptorError::MalformedDescriptor { offset };

    if buf.len() < CONFIG_HEADER_LEN
        || (buf[0] as usize) < CONFIG_HEADER_LEN
        || buf[1] != DESCRIPTOR_TYPE_CONFIGURATION
    {
        return Err(malformed(0));
    }

    let total_length = LittleEndian::read_u16(&buf[2..4]) as usize;
    if total_length < CONFIG_HEADER_LEN {
        return Err(malformed(0));
    }
    if total_length > buf.len() {
        return Err(malformed(buf.len()));
    }

    // Every record up to wTotalLength must be whole
    for record in Records::new(&buf[..total_length]) {
        record?;
    }
    Ok(total_length)
}

fn missing_endpoint(interface: u8, input: Option<Endpoint>) -> DescriptorError {
    DescriptorError::EndpointNotFound {
        interface,
        direction: if input.is_none() {
            Direction::In
        } else {
            Direction::Out
        },
    }
}
