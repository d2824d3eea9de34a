//! Status frame parsing and classification.
//!
//! Device replies look like `/` + address + status code + data + ETX/CR/LF.
//! The status code is a single character whose case encodes busy (upper) vs
//! idle (lower) and whose letter encodes the fault class. Codes missing from
//! the table classify as unrecognized and unhealthy.

use crate::error::{PumpError, PumpResult};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Idle and error free.
pub const STATUS_IDLE_ERROR_FREE: char = '`';
/// Busy and error free.
pub const STATUS_BUSY_ERROR_FREE: char = '@';

/// Byte searched for by the idle synchronizer.
pub const IDLE_MARKER: u8 = STATUS_IDLE_ERROR_FREE as u8;

/// End-of-text byte the device appends after the data field.
const ETX: char = '\x03';

/// Motion state encoded in the case of the status letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Lower case, ready for a command
    Idle,
    /// Upper case, a command is executing
    Busy,
}

/// Fault classes documented for the C-Series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// No fault
    ErrorFree,
    /// Initialization did not complete
    InitFailure,
    /// Opcode not understood
    InvalidCommand,
    /// Operand out of range for the opcode
    InvalidOperand,
    /// EEPROM read or write failed
    EepromFailure,
    /// Motion refused before an init command
    NotInitialized,
    /// Plunger drive overloaded
    PlungerOverload,
    /// Valve drive overloaded
    ValveOverload,
    /// Plunger did not move
    PlungerStuck,
}

/// One row of the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    /// Raw status character
    pub code: char,
    /// Fault class
    pub kind: StatusKind,
    /// Human readable text
    pub message: &'static str,
    /// Busy or idle
    pub activity: Activity,
    /// Whether the pump is fit to accept the next command.
    pub healthy: bool,
}

const fn entry(
    code: char,
    kind: StatusKind,
    message: &'static str,
    activity: Activity,
    healthy: bool,
) -> StatusEntry {
    StatusEntry {
        code,
        kind,
        message,
        activity,
        healthy,
    }
}

static STATUS_TABLE: [StatusEntry; 18] = [
    entry('`', StatusKind::ErrorFree, "Error Free", Activity::Idle, true),
    entry('@', StatusKind::ErrorFree, "Error Free", Activity::Busy, true),
    entry('a', StatusKind::InitFailure, "Init Failure", Activity::Idle, false),
    entry('A', StatusKind::InitFailure, "Init Failure", Activity::Busy, false),
    entry('b', StatusKind::InvalidCommand, "Invalid Command", Activity::Idle, false),
    entry('B', StatusKind::InvalidCommand, "Invalid Command", Activity::Busy, false),
    entry('c', StatusKind::InvalidOperand, "Invalid Operand", Activity::Idle, false),
    entry('C', StatusKind::InvalidOperand, "Invalid Operand", Activity::Busy, false),
    entry('f', StatusKind::EepromFailure, "EEPROM Failure", Activity::Idle, false),
    entry('F', StatusKind::EepromFailure, "EEPROM Failure", Activity::Busy, false),
    entry('g', StatusKind::NotInitialized, "Pump Not Initialized", Activity::Idle, false),
    entry('G', StatusKind::NotInitialized, "Pump Not Initialized", Activity::Busy, false),
    entry('i', StatusKind::PlungerOverload, "Plunger Overload", Activity::Idle, false),
    entry('I', StatusKind::PlungerOverload, "Plunger Overload", Activity::Busy, false),
    entry('j', StatusKind::ValveOverload, "Valve Overload", Activity::Idle, false),
    entry('J', StatusKind::ValveOverload, "Valve Overload", Activity::Busy, false),
    entry('k', StatusKind::PlungerStuck, "Plunger Stuck", Activity::Idle, false),
    entry('K', StatusKind::PlungerStuck, "Plunger Stuck", Activity::Busy, false),
];

static STATUS_LOOKUP: Lazy<HashMap<char, &'static StatusEntry>> =
    Lazy::new(|| STATUS_TABLE.iter().map(|e| (e.code, e)).collect());

/// Look up a raw status code in the table.
pub fn lookup(code: char) -> Option<&'static StatusEntry> {
    STATUS_LOOKUP.get(&code).copied()
}

/// Result of classifying a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Row of the status table
    Known(&'static StatusEntry),
    /// Code the table does not list
    Unrecognized(char),
}

impl Classification {
    /// Table text, or a fixed string for unknown codes.
    pub fn message(&self) -> &'static str {
        match self {
            Classification::Known(entry) => entry.message,
            Classification::Unrecognized(_) => "Unrecognized Status Code",
        }
    }

    /// `None` when the code is not in the table.
    pub fn activity(&self) -> Option<Activity> {
        match self {
            Classification::Known(entry) => Some(entry.activity),
            Classification::Unrecognized(_) => None,
        }
    }

    /// Known and error free.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Classification::Known(entry) if entry.healthy)
    }
}

/// A decoded device reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    /// Address the reply came from, `0` for the host
    pub address: char,
    /// Status character
    pub code: char,
    /// Whatever follows the status code, markers stripped
    pub data: String,
}

impl StatusResponse {
    /// Decode raw reply bytes.
    ///
    /// Fails with `DecodeFailure` when the bytes are not UTF-8 and with
    /// `TruncatedReply` when no status code follows the address.
    pub fn parse(raw: &[u8]) -> PumpResult<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| PumpError::DecodeFailure {
            raw: raw.to_vec(),
        })?;

        let info = text
            .trim_end_matches(|c: char| c.is_whitespace() || c == ETX)
            .trim_start_matches('/');

        let mut chars = info.chars();
        match (chars.next(), chars.next()) {
            (Some(address), Some(code)) => Ok(Self {
                address,
                code,
                data: chars.as_str().to_string(),
            }),
            _ => Err(PumpError::TruncatedReply {
                reply: text.to_string(),
            }),
        }
    }

    /// Look the status code up in the table.
    pub fn classify(&self) -> Classification {
        match lookup(self.code) {
            Some(entry) => Classification::Known(entry),
            None => Classification::Unrecognized(self.code),
        }
    }

    /// Table text for the status code.
    pub fn message(&self) -> &'static str {
        self.classify().message()
    }

    /// Busy flag; unrecognized codes report `None`.
    pub fn is_busy(&self) -> Option<bool> {
        self.classify().activity().map(|a| a == Activity::Busy)
    }

    /// See [`Classification::is_healthy`].
    pub fn is_healthy(&self) -> bool {
        self.classify().is_healthy()
    }

    /// Turn an unhealthy or unrecognized status into the matching error.
    ///
    /// `opcode` names the command that produced this reply.
    pub fn check(self, opcode: char) -> PumpResult<Self> {
        match self.classify() {
            Classification::Known(entry) if entry.healthy => Ok(self),
            Classification::Known(entry) => Err(PumpError::DeviceFault {
                opcode,
                message: entry.message,
                status: self,
            }),
            Classification::Unrecognized(_) => {
                Err(PumpError::UnrecognizedStatus { opcode, status: self })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_idle_error_free() {
        let status = StatusResponse::parse(b"/0\x60\r").unwrap();
        assert_eq!(status.address, '0');
        assert_eq!(status.code, '`');
        assert_eq!(status.data, "");
        assert_eq!(status.is_busy(), Some(false));
        assert!(status.is_healthy());
        assert_eq!(status.message(), "Error Free");
    }

    #[test]
    fn test_parse_strips_etx_and_line_ending() {
        let status = StatusResponse::parse(b"/0@1200\x03\r\n").unwrap();
        assert_eq!(status.code, '@');
        assert_eq!(status.data, "1200");
        assert_eq!(status.is_busy(), Some(true));
    }

    #[test]
    fn test_unrecognized_code_is_unhealthy() {
        let status = StatusResponse::parse(b"/0x\r").unwrap();
        assert!(!status.is_healthy());
        assert_eq!(status.is_busy(), None);
        assert_eq!(status.classify(), Classification::Unrecognized('x'));
        assert!(matches!(
            status.check('A'),
            Err(PumpError::UnrecognizedStatus { opcode: 'A', .. })
        ));
    }

    #[test]
    fn test_fault_codes_map_to_device_fault() {
        let status = StatusResponse::parse(b"/0i\x03\r\n").unwrap();
        match status.check('A') {
            Err(PumpError::DeviceFault {
                opcode, message, ..
            }) => {
                assert_eq!(opcode, 'A');
                assert_eq!(message, "Plunger Overload");
            }
            other => panic!("expected device fault, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_utf8_is_decode_failure() {
        let err = StatusResponse::parse(&[b'/', b'0', 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, PumpError::DecodeFailure { .. }));
    }

    #[test]
    fn test_empty_reply_is_truncated() {
        assert!(matches!(
            StatusResponse::parse(b""),
            Err(PumpError::TruncatedReply { .. })
        ));
        assert!(matches!(
            StatusResponse::parse(b"/0\r\n"),
            Err(PumpError::TruncatedReply { .. })
        ));
    }

    #[test]
    fn test_table_pairs_idle_and_busy() {
        for entry in STATUS_TABLE.iter() {
            let twin = if entry.code == '`' {
                '@'
            } else if entry.code == '@' {
                '`'
            } else if entry.code.is_ascii_lowercase() {
                entry.code.to_ascii_uppercase()
            } else {
                entry.code.to_ascii_lowercase()
            };
            let other = lookup(twin).unwrap();
            assert_eq!(other.kind, entry.kind);
            assert_ne!(other.activity, entry.activity);
            assert_eq!(entry.healthy, entry.kind == StatusKind::ErrorFree);
        }
    }
}
