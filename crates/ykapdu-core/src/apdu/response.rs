//! Response APDU and status word handling.

use std::fmt;

use super::constants::{STATUS_WORD_SIZE, SW_SUCCESS, SW1_MORE_DATA};
use crate::error::ApduError;

/// Two-byte status word terminating every response.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(SW_SUCCESS);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self(((sw1 as u16) << 8) | sw2 as u16)
    }

    pub const fn from_u16(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u16 {
        self.0
    }

    pub const fn sw1(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn sw2(&self) -> u8 {
        self.0 as u8
    }

    /// `0x9000`.
    pub fn is_success(&self) -> bool {
        self.0 == SW_SUCCESS
    }

    /// `0x61XX`: more data waiting behind a GET RESPONSE.
    pub fn is_more_data(&self) -> bool {
        self.sw1() == SW1_MORE_DATA
    }

    /// Byte count announced by a `0x61XX` status.
    ///
    /// `XX = 0x00` means "unknown", which is requested as 256 bytes.
    pub fn remaining(&self) -> Option<usize> {
        if !self.is_more_data() {
            return None;
        }
        match self.sw2() {
            0 => Some(256),
            n => Some(n as usize),
        }
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl From<u16> for StatusWord {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Debug for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusWord({:04X})", self.0)
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// Decoded response: payload plus terminal status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusWord,
    payload: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusWord, payload: Vec<u8>) -> Self {
        Self { status, payload }
    }

    pub fn success(payload: Vec<u8>) -> Self {
        Self::new(StatusWord::SUCCESS, payload)
    }

    /// Split wire bytes into payload and trailing status word.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ApduError> {
        if data.len() < STATUS_WORD_SIZE {
            return Err(ApduError::MalformedResponse { len: data.len() });
        }
        let split = data.len() - STATUS_WORD_SIZE;
        Ok(Self {
            status: StatusWord::new(data[split], data[split + 1]),
            payload: data[..split].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + STATUS_WORD_SIZE);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.status.to_bytes());
        out
    }

    pub fn status(&self) -> StatusWord {
        self.status
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Turn a non-success status word into [`ApduError::Status`].
    pub fn into_result(self) -> Result<Self, ApduError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApduError::Status(self.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_splits_status_word() {
        let resp = Response::from_bytes(&[0x01, 0x02, 0x90, 0x00]).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.payload(), &[0x01, 0x02]);
    }

    #[test]
    fn test_decode_status_only() {
        let resp = Response::from_bytes(&[0x6A, 0x82]).unwrap();
        assert!(resp.payload().is_empty());
        assert_eq!(resp.status().value(), 0x6A82);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            Response::from_bytes(&[0x90]),
            Err(ApduError::MalformedResponse { len: 1 })
        ));
        assert!(matches!(
            Response::from_bytes(&[]),
            Err(ApduError::MalformedResponse { len: 0 })
        ));
    }

    #[test]
    fn test_more_data_remaining() {
        assert_eq!(StatusWord::from_u16(0x6110).remaining(), Some(0x10));
        assert_eq!(StatusWord::from_u16(0x6100).remaining(), Some(256));
        assert_eq!(StatusWord::SUCCESS.remaining(), None);
    }

    #[test]
    fn test_into_result_passes_status_through() {
        let resp = Response::new(StatusWord::from_u16(0x6982), vec![]);
        match resp.into_result() {
            Err(ApduError::Status(sw)) => assert_eq!(sw.value(), 0x6982),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
