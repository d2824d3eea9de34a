//! Serial transport for RS-232 / USB-serial connected pumps.

use super::Transport;
use crate::config::PumpConfig;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

/// USB vendor ID of the pump's USB-serial bridge (Silicon Labs CP210x).
pub const PUMP_USB_VID: u16 = 0x10c4;
/// USB product ID of the pump's USB-serial bridge.
pub const PUMP_USB_PID: u16 = 0xea60;

/// Port-level read timeout; the overall line deadline is `timeout`.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Serial transport wrapping the `serialport` crate.
///
/// The port is opened lazily in [`Transport::open`] and dropped on close.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (9600 for C-Series factory settings)
    baud_rate: u32,

    /// Deadline for a complete reply line
    timeout: Duration,

    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Create a closed transport.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed
    /// * `timeout` - Deadline for reading one reply line
    pub fn new(port_name: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout,
            port: None,
        }
    }

    /// Transport for the port, baud rate and timeout named in `config`.
    pub fn from_config(config: &PumpConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate, config.timeout)
    }

    fn port_mut(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn open(&mut self) -> io::Result<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(POLL_READ_TIMEOUT)
            .open()
            .map_err(io::Error::from)?;
        self.port = Some(port);
        debug!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("Serial port '{}' closed", self.port_name);
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port_mut()?;
        port.write_all(bytes)?;
        port.flush()
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let timeout = self.timeout;
        let port = self.port_mut()?;

        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        let start = Instant::now();

        while start.elapsed() < timeout {
            match port.read(&mut byte) {
                Ok(1) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port returned EOF",
                    ))
                }
                // Port timeout is shorter than the line deadline
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(line)
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.port_mut()?
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// List serial ports whose USB VID/PID match the pump's USB-serial bridge.
///
/// Ports are only enumerated, never opened.
pub fn discover_ports() -> io::Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    let found: Vec<String> = ports
        .into_iter()
        .filter(|p| match &p.port_type {
            SerialPortType::UsbPort(usb) => usb.vid == PUMP_USB_VID && usb.pid == PUMP_USB_PID,
            _ => false,
        })
        .map(|p| p.port_name)
        .collect();
    debug!("Discovered {} C-Series port(s)", found.len());
    Ok(found)
}
