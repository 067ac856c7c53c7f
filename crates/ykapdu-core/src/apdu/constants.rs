//! ISO/IEC 7816-4 constants used by the session engine.

// Instruction class
pub const CLA_ISO: u8 = 0x00;

// Instructions
pub const INS_SELECT: u8 = 0xA4;
pub const INS_GET_RESPONSE: u8 = 0xC0;

// SELECT parameters
pub const P1_SELECT_BY_AID: u8 = 0x04;
pub const P2_SELECT_FIRST: u8 = 0x00;

// Status words
pub const SW_SUCCESS: u16 = 0x9000;
pub const SW1_MORE_DATA: u8 = 0x61;
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
pub const SW_CLA_NOT_SUPPORTED: u16 = 0x6E00;
pub const SW_WRONG_LENGTH: u16 = 0x6700;
pub const SW_SECURITY_STATUS_NOT_SATISFIED: u16 = 0x6982;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;

// Length limits
pub const SHORT_MAX_DATA: usize = 255;
pub const SHORT_MAX_LE: usize = 256;
pub const EXTENDED_MAX_DATA: usize = 65_535;
pub const EXTENDED_MAX_LE: usize = 65_536;

/// Size of CLA INS P1 P2.
pub const HEADER_SIZE: usize = 4;

/// Size of the trailing SW1 SW2.
pub const STATUS_WORD_SIZE: usize = 2;

/// Upper bound on GET RESPONSE rounds for a single command.
///
/// 256 rounds of 256 bytes covers the largest extended response.
pub const DEFAULT_MAX_GET_RESPONSE_ROUNDS: usize = 256;
