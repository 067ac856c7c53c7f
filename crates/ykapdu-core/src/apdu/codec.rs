//! APDU codec: command framing and response decoding.
//!
//! Short form is used whenever the command fits; extended form only when the
//! payload (or the expected length) exceeds the short limits and the key
//! reports extended APDU support.
//!
//! ```text
//! short:    CLA INS P1 P2 [Lc data] [Le]
//! extended: CLA INS P1 P2 00 [Lc_hi Lc_lo data] [Le_hi Le_lo]
//! ```

use byteorder::{BigEndian, ByteOrder};

use super::command::Command;
use super::constants::*;
use super::response::Response;
use crate::error::ApduError;

/// Stateless encoder/decoder bound to one key's extended-APDU capability.
#[derive(Debug, Clone, Copy)]
pub struct ApduCodec {
    extended: bool,
}

impl ApduCodec {
    pub fn new(extended: bool) -> Self {
        Self { extended }
    }

    pub fn supports_extended(&self) -> bool {
        self.extended
    }

    /// Frame a command for the wire.
    pub fn encode(&self, cmd: &Command) -> Result<Vec<u8>, ApduError> {
        let len = cmd.data().len();
        if len > EXTENDED_MAX_DATA || (len > SHORT_MAX_DATA && !self.extended) {
            return Err(ApduError::UnsupportedPayloadSize { len });
        }

        let wants_extended = len > SHORT_MAX_DATA || cmd.le().is_some_and(|le| le > SHORT_MAX_LE);
        let extended = wants_extended && self.extended;

        let mut buf = Vec::with_capacity(HEADER_SIZE + 3 + len + 2);
        buf.extend_from_slice(&[cmd.class(), cmd.instruction(), cmd.p1(), cmd.p2()]);

        if extended {
            buf.push(0x00);
            if len > 0 {
                push_u16(&mut buf, len as u16);
                buf.extend_from_slice(cmd.data());
            }
            if let Some(le) = cmd.le() {
                // 65536 wraps to 00 00
                push_u16(&mut buf, (le % EXTENDED_MAX_LE) as u16);
            }
        } else {
            if len > 0 {
                buf.push(len as u8);
                buf.extend_from_slice(cmd.data());
            }
            if let Some(le) = cmd.le() {
                // 256 wraps to 00
                buf.push((le.min(SHORT_MAX_LE) % SHORT_MAX_LE) as u8);
            }
        }

        Ok(buf)
    }

    /// Split a wire response into payload and status word.
    pub fn decode(&self, data: &[u8]) -> Result<Response, ApduError> {
        Response::from_bytes(data)
    }
}

impl Default for ApduCodec {
    fn default() -> Self {
        Self::new(true)
    }
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    buf.extend_from_slice(&b);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_short_case1() {
        let codec = ApduCodec::new(true);
        let bytes = codec.encode(&Command::new(0x00, 0xA4, 0x04, 0x00)).unwrap();
        assert_eq!(bytes, vec![0x00, 0xA4, 0x04, 0x00]);
    }

    #[test]
    fn test_short_with_data_and_le() {
        let codec = ApduCodec::new(true);
        let cmd = Command::new(0x00, 0x87, 0x07, 0x9A)
            .with_data([0x7C, 0x00])
            .with_le(256);
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(bytes, vec![0x00, 0x87, 0x07, 0x9A, 0x02, 0x7C, 0x00, 0x00]);
    }

    #[test]
    fn test_255_bytes_stays_short() {
        let codec = ApduCodec::new(true);
        let cmd = Command::new(0x00, 0xDB, 0x3F, 0xFF).with_data(payload(255));
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(bytes.len(), 4 + 1 + 255);
        assert_eq!(bytes[4], 0xFF);
    }

    #[test]
    fn test_256_bytes_goes_extended() {
        let codec = ApduCodec::new(true);
        let cmd = Command::new(0x00, 0xDB, 0x3F, 0xFF).with_data(payload(256));
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(&bytes[4..7], &[0x00, 0x01, 0x00]);
        assert_eq!(bytes.len(), 4 + 3 + 256);
    }

    #[test]
    fn test_extended_le_only() {
        let codec = ApduCodec::new(true);
        let cmd = Command::new(0x00, 0xCB, 0x3F, 0xFF).with_le(1024);
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(bytes, vec![0x00, 0xCB, 0x3F, 0xFF, 0x00, 0x04, 0x00]);
    }

    #[test]
    fn test_unsupported_extended_rejects_large_payload() {
        let codec = ApduCodec::new(false);
        let cmd = Command::new(0x00, 0xDB, 0x3F, 0xFF).with_data(payload(256));
        assert!(matches!(
            codec.encode(&cmd),
            Err(ApduError::UnsupportedPayloadSize { len: 256 })
        ));
    }

    #[test]
    fn test_unsupported_extended_clamps_le() {
        let codec = ApduCodec::new(false);
        let cmd = Command::new(0x00, 0xCB, 0x3F, 0xFF).with_le(4096);
        let bytes = codec.encode(&cmd).unwrap();
        assert_eq!(bytes, vec![0x00, 0xCB, 0x3F, 0xFF, 0x00]);
    }

    #[test]
    fn test_oversized_payload_always_rejected() {
        let codec = ApduCodec::new(true);
        let cmd = Command::new(0x00, 0xDB, 0x3F, 0xFF).with_data(payload(65_536));
        assert!(codec.encode(&cmd).is_err());
    }

    #[test]
    fn test_encode_parse_boundaries() {
        let codec = ApduCodec::new(true);
        for size in [0usize, 1, 255, 256, 1000] {
            let cmd = Command::new(0x80, 0x01, 0x02, 0x03).with_data(payload(size));
            let bytes = codec.encode(&cmd).unwrap();
            let parsed = Command::from_bytes(&bytes).unwrap();
            assert_eq!(parsed, cmd, "size {size}");
        }
    }
}
