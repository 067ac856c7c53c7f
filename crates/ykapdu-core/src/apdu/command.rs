//! Command APDU.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

use super::constants::*;
use crate::error::ApduError;

/// A single logical request to the card.
///
/// Immutable once built; the dispatcher only ever reads it.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: Option<usize>,
}

impl Command {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Attach a command payload.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Expected response length hint, clamped to `1..=65536`.
    pub fn with_le(mut self, le: usize) -> Self {
        self.le = Some(le.clamp(1, EXTENDED_MAX_LE));
        self
    }

    /// `SELECT` by application identifier.
    pub fn select(aid: &[u8]) -> Self {
        Self::new(CLA_ISO, INS_SELECT, P1_SELECT_BY_AID, P2_SELECT_FIRST).with_data(aid)
    }

    /// `GET RESPONSE` for a `0x61XX` continuation.
    pub fn get_response(remaining: usize) -> Self {
        Self::new(CLA_ISO, INS_GET_RESPONSE, 0x00, 0x00).with_le(remaining.min(SHORT_MAX_LE))
    }

    pub fn class(&self) -> u8 {
        self.cla
    }

    pub fn instruction(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn le(&self) -> Option<usize> {
        self.le
    }

    /// Parse wire bytes back into a command (ISO 7816-4 cases 1 to 4, short and extended).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ApduError> {
        let malformed = || ApduError::MalformedCommand { len: bytes.len() };
        if bytes.len() < HEADER_SIZE {
            return Err(malformed());
        }
        let mut cmd = Self::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[HEADER_SIZE..];

        match body.len() {
            0 => return Ok(cmd),
            1 => {
                cmd.le = Some(short_le(body[0]));
                return Ok(cmd);
            }
            _ => {}
        }

        if body[0] != 0 {
            // Short form
            let lc = body[0] as usize;
            let rest = &body[1..];
            if rest.len() == lc {
                cmd.data = rest.to_vec();
            } else if rest.len() == lc + 1 {
                cmd.data = rest[..lc].to_vec();
                cmd.le = Some(short_le(rest[lc]));
            } else {
                return Err(malformed());
            }
            return Ok(cmd);
        }

        // Extended form
        if body.len() < 3 {
            return Err(malformed());
        }
        let first = BigEndian::read_u16(&body[1..3]) as usize;
        let rest = &body[3..];
        if rest.is_empty() {
            cmd.le = Some(extended_le(first));
            return Ok(cmd);
        }
        let lc = first;
        if lc == 0 {
            return Err(malformed());
        }
        if rest.len() == lc {
            cmd.data = rest.to_vec();
        } else if rest.len() == lc + 2 {
            cmd.data = rest[..lc].to_vec();
            cmd.le = Some(extended_le(BigEndian::read_u16(&rest[lc..]) as usize));
        } else {
            return Err(malformed());
        }
        Ok(cmd)
    }
}

fn short_le(b: u8) -> usize {
    if b == 0 { SHORT_MAX_LE } else { b as usize }
}

fn extended_le(v: usize) -> usize {
    if v == 0 { EXTENDED_MAX_LE } else { v }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command({:02X} {:02X} {:02X} {:02X}, data={}B, le={:?})",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len(),
            self.le
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_builds_iso_header() {
        let cmd = Command::select(&[0xA0, 0x00, 0x00, 0x03, 0x08]);
        assert_eq!(cmd.class(), 0x00);
        assert_eq!(cmd.instruction(), 0xA4);
        assert_eq!(cmd.p1(), 0x04);
        assert_eq!(cmd.p2(), 0x00);
        assert_eq!(cmd.data(), &[0xA0, 0x00, 0x00, 0x03, 0x08]);
        assert_eq!(cmd.le(), None);
    }

    #[test]
    fn test_get_response_le() {
        assert_eq!(Command::get_response(0x20).le(), Some(0x20));
        assert_eq!(Command::get_response(256).le(), Some(256));
    }

    #[test]
    fn test_le_is_clamped() {
        assert_eq!(Command::new(0, 0, 0, 0).with_le(0).le(), Some(1));
        assert_eq!(Command::new(0, 0, 0, 0).with_le(1 << 20).le(), Some(65_536));
    }

    #[test]
    fn test_parse_short_cases() {
        let c1 = Command::from_bytes(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert!(c1.data().is_empty());
        assert_eq!(c1.le(), None);

        let c2 = Command::from_bytes(&[0x00, 0xC0, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(c2.le(), Some(256));

        let c3 = Command::from_bytes(&[0x00, 0xDA, 0x01, 0x02, 0x02, 0xAA, 0xBB]).unwrap();
        assert_eq!(c3.data(), &[0xAA, 0xBB]);
        assert_eq!(c3.le(), None);

        let c4 = Command::from_bytes(&[0x00, 0xDA, 0x01, 0x02, 0x01, 0xAA, 0x10]).unwrap();
        assert_eq!(c4.data(), &[0xAA]);
        assert_eq!(c4.le(), Some(0x10));
    }

    #[test]
    fn test_parse_extended_le_only() {
        let cmd = Command::from_bytes(&[0x00, 0xCB, 0x3F, 0xFF, 0x00, 0x00, 0x00]).unwrap();
        assert!(cmd.data().is_empty());
        assert_eq!(cmd.le(), Some(65_536));
    }

    #[test]
    fn test_parse_rejects_inconsistent_lengths() {
        assert!(Command::from_bytes(&[0x00, 0xA4]).is_err());
        assert!(Command::from_bytes(&[0x00, 0xA4, 0x04, 0x00, 0x05, 0x01]).is_err());
        assert!(Command::from_bytes(&[0x00, 0xA4, 0x04, 0x00, 0x00, 0x01]).is_err());
    }
}
