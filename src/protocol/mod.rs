//! Data Terminal protocol: command frames out, status frames in.

pub mod command;
pub mod status;

pub use command::{encode, encode_multi, Command, Opcode};
pub use status::{Activity, Classification, StatusKind, StatusResponse};
