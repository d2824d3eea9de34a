//! Driver library for Tricontinent C-Series syringe pumps.
//!
//! The pump speaks the ASCII "Data Terminal" protocol over a serial link. This
//! crate turns volumetric requests (dispense N mL, switch valve) into framed
//! commands, waits for the device to report idle between steps and decodes
//! its single-character status replies.
//!
//! Layering, bottom up:
//!
//! - [`protocol`]: command frame codec and status frame parser
//! - [`adapters`]: the [`adapters::Transport`] trait, the serial port
//!   implementation and in-memory doubles
//! - [`session`]: exclusive, open-once/close-once ownership of a transport
//! - [`idle`]: bounded, cancellable idle polling
//! - [`pump`]: motion primitives and dispense sequencing
//! - [`config`]: TOML/env configuration and the pump registry

pub mod adapters;
pub mod config;
pub mod error;
pub mod idle;
pub mod protocol;
pub mod pump;
pub mod session;

pub use config::{PumpConfig, PumpRegistry};
pub use error::{PumpError, PumpResult};
pub use idle::{CancelToken, IdleWait};
pub use pump::{DispensePlan, DispenseReport, InitKind, PumpController, ValvePosition, ValveSwitch};
