//! nusb-based USB CCID transport.
//!
//! APDUs travel inside CCID bulk messages:
//!
//! ```text
//! Offset  Size  Description
//! 0       1     Message type (0x6F = XfrBlock, 0x80 = DataBlock)
//! 1       4     Data length (little-endian)
//! 5       1     Slot number
//! 6       1     Sequence number
//! 7       3     Type-specific parameters (status/error on replies)
//! 10      N     Data
//! ```

use byteorder::{ByteOrder, LittleEndian};
use nusb::transfer::{Bulk, In, Out};
use nusb::{DeviceInfo, Interface, MaybeFuture, list_devices};
use std::io::{Read, Write};
use tracing::{debug, info, instrument, trace, warn};

use super::traits::{
    ConnectionDescription, KeyTransport, TransportConnector, TransportError, TransportKind,
};

pub const YUBICO_VENDOR_ID: u16 = 0x1050;

/// USB interface class for smart card readers.
const CCID_CLASS: u8 = 0x0B;
const CCID_HEADER_SIZE: usize = 10;
const MAX_MESSAGE_SIZE: usize = 65_536 + CCID_HEADER_SIZE + 2;

mod message_type {
    pub const PC_TO_RDR_ICC_POWER_ON: u8 = 0x62;
    pub const PC_TO_RDR_ICC_POWER_OFF: u8 = 0x63;
    pub const PC_TO_RDR_XFR_BLOCK: u8 = 0x6F;
    pub const RDR_TO_PC_DATA_BLOCK: u8 = 0x80;
    pub const RDR_TO_PC_SLOT_STATUS: u8 = 0x81;
}

/// bmCommandStatus in bits 6..7 of bStatus.
mod command_status {
    pub const MASK: u8 = 0xC0;
    pub const FAILED: u8 = 0x40;
    /// Card asked for more time (e.g. waiting for touch).
    pub const TIME_EXTENSION: u8 = 0x80;
}

/// A CCID-capable key found on the bus.
#[derive(Debug, Clone)]
pub struct CcidDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub version: u16,
}

/// List attached Yubico keys exposing a CCID interface.
pub fn list_keys() -> Result<Vec<CcidDevice>, TransportError> {
    let devices = list_devices()
        .wait()
        .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
    Ok(devices
        .filter(|d| d.vendor_id() == YUBICO_VENDOR_ID && ccid_interface(d).is_some())
        .map(|d| CcidDevice {
            vendor_id: d.vendor_id(),
            product_id: d.product_id(),
            product: d.product_string().map(str::to_string),
            serial: d.serial_number().map(str::to_string),
            version: d.device_version(),
        })
        .collect())
}

fn ccid_interface(info: &DeviceInfo) -> Option<u8> {
    info.interfaces()
        .find(|i| i.class() == CCID_CLASS)
        .map(|i| i.interface_number())
}

/// Header plus payload; slot 0, no type-specific parameters.
fn build_message(msg_type: u8, seq: u8, data: &[u8]) -> Vec<u8> {
    let mut msg = vec![0u8; CCID_HEADER_SIZE + data.len()];
    msg[0] = msg_type;
    LittleEndian::write_u32(&mut msg[1..5], data.len() as u32);
    msg[6] = seq;
    msg[CCID_HEADER_SIZE..].copy_from_slice(data);
    msg
}

/// bcdDevice 0x0543 reads as "5.4.3".
fn format_version(bcd: u16) -> String {
    format!("{}.{}.{}", (bcd >> 8) & 0xFF, (bcd >> 4) & 0x0F, bcd & 0x0F)
}

/// USB CCID transport to one key.
pub struct CcidTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    sequence: u8,
    info: CcidDevice,
}

impl CcidTransport {
    /// Open the first attached Yubico key, optionally matching a serial.
    #[instrument(level = "info")]
    pub fn open_first(serial: Option<&str>) -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() != YUBICO_VENDOR_ID {
                continue;
            }
            if serial.is_some_and(|s| device_info.serial_number() != Some(s)) {
                continue;
            }
            if let Some(interface) = ccid_interface(&device_info) {
                return Self::open_device_info(device_info, interface);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: YUBICO_VENDOR_ID,
        })
    }

    fn open_device_info(device_info: DeviceInfo, interface_number: u8) -> Result<Self, TransportError> {
        let info = CcidDevice {
            vendor_id: device_info.vendor_id(),
            product_id: device_info.product_id(),
            product: device_info.product_string().map(str::to_string),
            serial: device_info.serial_number().map(str::to_string),
            version: device_info.device_version(),
        };

        info!(
            vendor_id = %format!("{:04X}", info.vendor_id),
            product_id = %format!("{:04X}", info.product_id),
            interface = interface_number,
            "Found CCID key"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface = device
            .claim_interface(interface_number)
            .wait()
            .map_err(|e| TransportError::ClaimInterfaceFailed {
                interface: interface_number,
                message: e.to_string(),
            })?;

        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != interface_number {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        debug!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "CCID endpoints resolved"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            sequence: 0,
            info,
        })
    }

    pub fn device(&self) -> &CcidDevice {
        &self.info
    }

    fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    fn write_message(&mut self, msg_type: u8, data: &[u8]) -> Result<u8, TransportError> {
        let seq = self.next_sequence();
        let msg = build_message(msg_type, seq, data);
        trace!(msg = ?msg, "CCID TX");

        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        let mut writer = ep.writer(4096);
        writer
            .write_all(&msg)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        Ok(seq)
    }

    /// Read one reply, skipping time extension requests.
    fn read_message(&mut self, seq: u8) -> Result<(u8, Vec<u8>), TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let mut reader = ep.reader(4096);

        loop {
            let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
            let mut filled = 0;
            let mut expected = CCID_HEADER_SIZE;
            while filled < expected {
                let n = reader
                    .read(&mut buf[filled..])
                    .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
                if n == 0 {
                    return Err(TransportError::Disconnected);
                }
                filled += n;
                if filled >= CCID_HEADER_SIZE {
                    expected = CCID_HEADER_SIZE + LittleEndian::read_u32(&buf[1..5]) as usize;
                    if expected > MAX_MESSAGE_SIZE {
                        return Err(TransportError::Protocol(format!(
                            "CCID message too large: {expected} bytes"
                        )));
                    }
                }
            }
            buf.truncate(expected);
            trace!(len = expected, "CCID RX");

            let msg_type = buf[0];
            let status = buf[7];
            let error = buf[8];
            if buf[6] != seq {
                return Err(TransportError::Protocol(format!(
                    "CCID sequence mismatch: sent {seq}, got {}",
                    buf[6]
                )));
            }

            match status & command_status::MASK {
                command_status::TIME_EXTENSION => {
                    debug!("CCID time extension requested");
                    continue;
                }
                command_status::FAILED => {
                    return Err(TransportError::Protocol(format!(
                        "CCID error: status=0x{status:02X} error=0x{error:02X}"
                    )));
                }
                _ => {}
            }

            return Ok((msg_type, buf.split_off(CCID_HEADER_SIZE)));
        }
    }
}

impl KeyTransport for CcidTransport {
    #[instrument(skip(self))]
    fn open(&mut self) -> Result<ConnectionDescription, TransportError> {
        let seq = self.write_message(message_type::PC_TO_RDR_ICC_POWER_ON, &[])?;
        let (msg_type, atr) = self.read_message(seq)?;
        if msg_type != message_type::RDR_TO_PC_DATA_BLOCK {
            return Err(TransportError::Protocol(format!(
                "Unexpected power-on reply: 0x{msg_type:02X}"
            )));
        }
        debug!(atr_len = atr.len(), "ICC powered on");

        let mut description = ConnectionDescription::new(
            TransportKind::Usb,
            self.info.product.clone().unwrap_or_else(|| "YubiKey".into()),
        );
        description.serial = self.info.serial.as_deref().and_then(|s| s.parse().ok());
        description.firmware_version = Some(format_version(self.info.version));
        description.extended_apdu = true;
        Ok(description)
    }

    #[instrument(skip(self, frame), fields(len = frame.len()))]
    fn send(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let seq = self.write_message(message_type::PC_TO_RDR_XFR_BLOCK, frame)?;
        let (msg_type, data) = self.read_message(seq)?;
        if msg_type != message_type::RDR_TO_PC_DATA_BLOCK {
            return Err(TransportError::Protocol(format!(
                "Unexpected CCID reply: 0x{msg_type:02X}"
            )));
        }
        debug!(bytes_read = data.len(), "Exchange complete");
        Ok(data)
    }

    fn close(&mut self) {
        let powered_off = self
            .write_message(message_type::PC_TO_RDR_ICC_POWER_OFF, &[])
            .and_then(|seq| self.read_message(seq));
        match powered_off {
            Ok((message_type::RDR_TO_PC_SLOT_STATUS, _)) => debug!("ICC powered off"),
            Ok((other, _)) => warn!(msg_type = other, "Unexpected power-off reply"),
            Err(e) => warn!(error = %e, "ICC power-off failed"),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }
}

/// Opens a [`CcidTransport`] to the first (or a given) key each time a connection starts.
#[derive(Debug, Clone, Default)]
pub struct CcidConnector {
    serial: Option<String>,
}

impl CcidConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
        }
    }
}

impl TransportConnector for CcidConnector {
    fn connect(&self) -> Result<Box<dyn KeyTransport>, TransportError> {
        Ok(Box::new(CcidTransport::open_first(self.serial.as_deref())?))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(format_version(0x0543), "5.4.3");
        assert_eq!(format_version(0x0512), "5.1.2");
    }

    #[test]
    fn test_build_xfr_block() {
        let msg = build_message(message_type::PC_TO_RDR_XFR_BLOCK, 7, &[0x00, 0xA4, 0x04, 0x00]);
        assert_eq!(
            msg,
            vec![0x6F, 0x04, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0xA4, 0x04, 0x00]
        );
    }

    #[test]
    fn test_build_power_on() {
        let msg = build_message(message_type::PC_TO_RDR_ICC_POWER_ON, 0, &[]);
        assert_eq!(msg.len(), CCID_HEADER_SIZE);
        assert_eq!(msg[0], 0x62);
    }
}
