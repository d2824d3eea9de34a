//! Error types for the pump driver.
//!
//! `PumpError` is the single error type surfaced by every layer of the crate, from
//! configuration loading down to status decoding. Variants carry enough context
//! (opcode attempted, last status seen, dispense step reached) for the caller to
//! decide between aborting and retrying.
//!
//! ## Error Hierarchy
//!
//! - **Configuration**: `ConfigLoad` wraps `figment` extraction failures, `ConfigInvalid`
//!   covers values that parse but are semantically wrong (for example an unknown
//!   increment mode / stroke class combination), `PumpNotFound` is a registry miss.
//! - **Wire**: `Transport` wraps I/O errors from the byte stream, `DecodeFailure` and
//!   `TruncatedReply` reject replies that cannot be split into address and status.
//! - **Device**: `UnrecognizedStatus` and `DeviceFault` come from the status table,
//!   `UnexpectedReply` from payloads that do not decode.
//! - **Motion**: `OutOfRange`, `InvalidVolume`, `TimedOut`, `Cancelled` and the
//!   `Dispense` wrapper that records how far a dispense sequence got.

use crate::protocol::status::StatusResponse;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type PumpResult<T> = std::result::Result<T, PumpError>;

/// Every failure the driver reports.
#[derive(Error, Debug)]
pub enum PumpError {
    /// Figment could not read or extract the configuration
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// A setting parsed but is out of range
    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    /// No pump of that name in the registry
    #[error("Pump '{0}' not found in configuration")]
    PumpNotFound(String),

    /// I/O failure on the byte stream
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The session was never opened or is already closed
    #[error("Transport session is closed")]
    SessionClosed,

    /// Reply bytes are not ASCII
    #[error("Reply is not valid text: {raw:?}")]
    DecodeFailure {
        /// Bytes as received
        raw: Vec<u8>,
    },

    /// Reply without room for an address and status byte
    #[error("Reply too short to carry address and status: {reply:?}")]
    TruncatedReply {
        /// Reply with markers stripped
        reply: String,
    },

    /// Status code missing from the status table
    #[error("Unrecognized status code '{}' from pump '{}' after '{opcode}'", .status.code, .status.address)]
    UnrecognizedStatus {
        /// Command the status answered
        opcode: char,
        /// Status as decoded
        status: StatusResponse,
    },

    /// The pump reported an error status
    #[error("Device fault after '{opcode}': {message} (status '{}')", .status.code)]
    DeviceFault {
        /// Command the status answered
        opcode: char,
        /// Status table text
        message: &'static str,
        /// Status as decoded
        status: StatusResponse,
    },

    /// Hand-typed command with no opcode
    #[error("Invalid command string: {0:?}")]
    InvalidCommand(String),

    /// Healthy reply whose data could not be interpreted
    #[error("Unexpected reply to '{opcode}': {data:?}")]
    UnexpectedReply {
        /// Command the reply answered
        opcode: char,
        /// Data field as received
        data: String,
    },

    /// Volume maps to a plunger position the syringe cannot reach
    #[error("Requested {volume_ml} mL maps to {steps} steps, outside 0..={max_steps}")]
    OutOfRange {
        /// Requested absolute volume
        volume_ml: f64,
        /// Rounded step count before the range check
        steps: f64,
        /// Top of the plunger range
        max_steps: u32,
    },

    /// Dispense request that is not positive and finite
    #[error("Dispense volume must be a positive finite number, got {0}")]
    InvalidVolume(f64),

    /// Idle wait bounds exhausted
    #[error("Pump '{address}' not idle after {attempts} polls ({elapsed:?})")]
    TimedOut {
        /// Pump address that was polled
        address: char,
        /// Polls sent
        attempts: u32,
        /// Time spent waiting
        elapsed: Duration,
        /// Last status that decoded, if any
        last_status: Option<StatusResponse>,
    },

    /// A [`CancelToken`](crate::idle::CancelToken) fired
    #[error("Operation cancelled")]
    Cancelled,

    /// A dispense sequence stopped part way
    #[error("Dispense failed at {step} after {strokes_completed} full strokes: {source}")]
    Dispense {
        /// Where the sequence stopped
        step: DispenseStep,
        /// Full strokes delivered before the failure
        strokes_completed: u32,
        /// Underlying failure
        #[source]
        source: Box<PumpError>,
    },
}

impl PumpError {
    /// Whether retrying the same exchange could reasonably succeed.
    ///
    /// Undecodable replies and idle-wait timeouts are transient on a noisy line;
    /// faults reported by the status table and configuration errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PumpError::DecodeFailure { .. }
            | PumpError::TruncatedReply { .. }
            | PumpError::TimedOut { .. } => true,
            PumpError::Dispense { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// One step of the dispense sequence, used to report where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispenseStep {
    /// Initial reset of the plunger to the empty position.
    Prime(StrokePhase),
    /// Full stroke number `index` (zero based).
    FullStroke {
        /// Stroke number
        index: u32,
        /// Phase within the stroke
        phase: StrokePhase,
    },
    /// The trailing partial stroke.
    PartialStroke(StrokePhase),
}

/// Phase within a stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrokePhase {
    /// Valve to inlet
    SelectInlet,
    /// Plunger draws in the fill volume
    Aspirate,
    /// Valve to outlet
    SelectOutlet,
    /// Plunger back to zero
    Dispense,
}

impl fmt::Display for StrokePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrokePhase::SelectInlet => "select inlet",
            StrokePhase::Aspirate => "aspirate",
            StrokePhase::SelectOutlet => "select outlet",
            StrokePhase::Dispense => "dispense",
        };
        f.write_str(name)
    }
}

impl fmt::Display for DispenseStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispenseStep::Prime(phase) => write!(f, "prime ({})", phase),
            DispenseStep::FullStroke { index, phase } => {
                write!(f, "full stroke {} ({})", index + 1, phase)
            }
            DispenseStep::PartialStroke(phase) => write!(f, "partial stroke ({})", phase),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PumpError::ConfigInvalid("increment mode 7".to_string());
        assert_eq!(err.to_string(), "Configuration invalid: increment mode 7");
    }

    #[test]
    fn test_dispense_error_reports_step() {
        let err = PumpError::Dispense {
            step: DispenseStep::FullStroke {
                index: 1,
                phase: StrokePhase::Aspirate,
            },
            strokes_completed: 1,
            source: Box::new(PumpError::Cancelled),
        };
        let text = err.to_string();
        assert!(text.contains("full stroke 2 (aspirate)"));
        assert!(text.contains("after 1 full strokes"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(PumpError::DecodeFailure { raw: vec![0xff] }.is_retryable());
        assert!(!PumpError::Cancelled.is_retryable());
        let wrapped = PumpError::Dispense {
            step: DispenseStep::Prime(StrokePhase::Dispense),
            strokes_completed: 0,
            source: Box::new(PumpError::TruncatedReply {
                reply: String::new(),
            }),
        };
        assert!(wrapped.is_retryable());
    }
}
