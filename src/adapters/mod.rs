//! Byte-stream transports.
//!
//! The pump controller never touches a serial port directly; it talks to a
//! [`Transport`], which the hardware adapter and the in-memory test doubles
//! both implement.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock::{MockTransport, SimulatedPump};
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::{discover_ports, SerialTransport};

use std::io;

/// A half-duplex, line-oriented byte stream to one pump.
pub trait Transport: Send {
    /// Short human-readable identity used in log lines (e.g. the port name).
    fn name(&self) -> &str;

    /// Acquire the underlying device.
    fn open(&mut self) -> io::Result<()>;

    /// Release the underlying device.
    fn close(&mut self) -> io::Result<()>;

    /// Write one complete frame.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read one reply line.
    ///
    /// Returns whatever arrived before the line ending or the read timeout,
    /// possibly nothing.
    fn read_line(&mut self) -> io::Result<Vec<u8>>;

    /// Discard any bytes received but not yet read.
    fn flush_input(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self) -> io::Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        (**self).read_line()
    }

    fn flush_input(&mut self) -> io::Result<()> {
        (**self).flush_input()
    }
}
