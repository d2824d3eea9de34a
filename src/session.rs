//! Transport session: exclusive ownership of one pump's byte stream.
//!
//! The session is opened once, reused for every exchange and closed exactly
//! once, either explicitly or when dropped.

use crate::adapters::Transport;
use crate::error::{PumpError, PumpResult};
use crate::protocol::command::Command;
use crate::protocol::status::StatusResponse;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Open,
    Closed,
}

/// A [`Transport`] with an open/closed lifecycle and frame logging.
pub struct TransportSession {
    transport: Box<dyn Transport>,
    state: SessionState,
}

impl TransportSession {
    /// Wrap `transport`; nothing is opened yet.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            state: SessionState::New,
        }
    }

    /// Transport name, for log lines.
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Open and not yet closed.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Open the underlying transport. Opening an open session is a no-op;
    /// a closed session cannot be reopened.
    pub fn open(&mut self) -> PumpResult<()> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Closed => Err(PumpError::SessionClosed),
            SessionState::New => {
                self.transport.open()?;
                self.state = SessionState::Open;
                info!("Opened connection on {}", self.transport.name());
                Ok(())
            }
        }
    }

    /// Close the underlying transport. Only the first call reaches it.
    pub fn close(&mut self) -> PumpResult<()> {
        let was_open = self.state == SessionState::Open;
        self.state = SessionState::Closed;
        if was_open {
            self.transport.close()?;
            info!("Closed connection on {}", self.transport.name());
        }
        Ok(())
    }

    fn ensure_open(&self) -> PumpResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PumpError::SessionClosed)
        }
    }

    /// Write one frame.
    ///
    /// # Errors
    /// `SessionClosed` unless the session is open
    pub fn write(&mut self, frame: &[u8]) -> PumpResult<()> {
        self.ensure_open()?;
        debug!(
            "[{}] -> {}",
            self.transport.name(),
            String::from_utf8_lossy(frame).escape_debug()
        );
        self.transport.write(frame)?;
        Ok(())
    }

    /// Read one reply line, possibly empty.
    pub fn read_line(&mut self) -> PumpResult<Vec<u8>> {
        self.ensure_open()?;
        let line = self.transport.read_line()?;
        debug!(
            "[{}] <- {}",
            self.transport.name(),
            String::from_utf8_lossy(&line).escape_debug()
        );
        Ok(line)
    }

    /// Drop unread input.
    pub fn flush_input(&mut self) -> PumpResult<()> {
        self.ensure_open()?;
        self.transport.flush_input()?;
        Ok(())
    }

    /// Write one frame and read one reply line.
    pub fn exchange(&mut self, frame: &[u8]) -> PumpResult<Vec<u8>> {
        self.write(frame)?;
        self.read_line()
    }

    /// Send `command` to `address` and decode the reply.
    pub fn request(&mut self, address: char, command: &Command) -> PumpResult<StatusResponse> {
        let reply = self.exchange(&command.encode(address))?;
        StatusResponse::parse(&reply)
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!("Failed to close {} on drop: {}", self.transport.name(), e);
            }
        }
    }
}
