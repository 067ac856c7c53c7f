//! Well-known YubiKey applications and PIV touch policy.

use std::fmt;
use std::str::FromStr;

/// PIV application identifier (NIST SP 800-73).
pub const AID_PIV: &[u8] = &[0xA0, 0x00, 0x00, 0x03, 0x08];
pub const AID_OATH: &[u8] = &[0xA0, 0x00, 0x00, 0x05, 0x27, 0x21, 0x01];
pub const AID_FIDO: &[u8] = &[0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01];
pub const AID_MANAGEMENT: &[u8] = &[0xA0, 0x00, 0x00, 0x05, 0x27, 0x47, 0x11, 0x17];

/// Tag carrying the touch policy inside PIV key generation/import payloads.
pub const TAG_TOUCH_POLICY: u8 = 0xAB;

/// Applications selectable on a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Application {
    Piv,
    Oath,
    /// FIDO U2F / CTAP over APDU.
    Fido,
    Management,
    /// Any other AID.
    Custom(Vec<u8>),
}

impl Application {
    pub fn aid(&self) -> &[u8] {
        match self {
            Application::Piv => AID_PIV,
            Application::Oath => AID_OATH,
            Application::Fido => AID_FIDO,
            Application::Management => AID_MANAGEMENT,
            Application::Custom(aid) => aid,
        }
    }

    /// Map a raw AID back to a known application.
    pub fn from_aid(aid: &[u8]) -> Self {
        [
            Application::Piv,
            Application::Oath,
            Application::Fido,
            Application::Management,
        ]
        .into_iter()
        .find(|app| app.aid() == aid)
        .unwrap_or_else(|| Application::Custom(aid.to_vec()))
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Application::Piv => write!(f, "PIV"),
            Application::Oath => write!(f, "OATH"),
            Application::Fido => write!(f, "FIDO"),
            Application::Management => write!(f, "Management"),
            Application::Custom(aid) => write!(f, "AID {}", hex::encode_upper(aid)),
        }
    }
}

/// Error parsing an [`Application`] name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown application '{0}' (expected piv, oath, fido, mgmt or a hex AID)")]
pub struct ParseApplicationError(String);

impl FromStr for Application {
    type Err = ParseApplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "piv" => Ok(Application::Piv),
            "oath" => Ok(Application::Oath),
            "fido" | "u2f" => Ok(Application::Fido),
            "mgmt" | "management" => Ok(Application::Management),
            other => {
                let bytes = hex::decode(other).map_err(|_| ParseApplicationError(s.to_string()))?;
                // ISO 7816-5: 5..=16 bytes
                if !(5..=16).contains(&bytes.len()) {
                    return Err(ParseApplicationError(s.to_string()));
                }
                Ok(Application::from_aid(&bytes))
            }
        }
    }
}

/// When a key operation requires a physical touch.
///
/// Opaque to the session layer; it only travels inside command payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TouchPolicy {
    #[default]
    Default = 0x00,
    Never = 0x01,
    Always = 0x02,
    Cached = 0x03,
}

impl TouchPolicy {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(TouchPolicy::Default),
            0x01 => Some(TouchPolicy::Never),
            0x02 => Some(TouchPolicy::Always),
            0x03 => Some(TouchPolicy::Cached),
            _ => None,
        }
    }

    /// `AB 01 <policy>`
    pub fn to_tlv(self) -> [u8; 3] {
        [TAG_TOUCH_POLICY, 0x01, self.value()]
    }
}
