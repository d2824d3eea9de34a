//! In-memory transports for testing without hardware.
//!
//! - [`MockTransport`] replays scripted replies and records every write.
//! - [`SimulatedPump`] interprets command frames and answers like a C-Series
//!   pump, tracking plunger position and valve state.
//!
//! Both are cheap handles over shared state: keep a clone to inspect the call
//! log after handing the transport to a controller.

use super::Transport;
use crate::protocol::command::{self, DecodedFrame};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn guard<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct MockState {
    open: bool,
    opens: u32,
    closes: u32,
    flushes: u32,
    writes: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    fallback: Option<Vec<u8>>,
    fail_next_write: bool,
}

/// Scripted transport.
///
/// `read_line` pops the next scripted reply, then falls back to the fallback
/// reply, then to an empty line.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Empty script, no fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply returned once the script is exhausted.
    pub fn with_fallback_reply(self, reply: &[u8]) -> Self {
        guard(&self.state).fallback = Some(reply.to_vec());
        self
    }

    /// Queue a reply.
    pub fn push_reply(&self, reply: &[u8]) {
        guard(&self.state).replies.push_back(reply.to_vec());
    }

    /// Make the next write fail with a broken-pipe error.
    pub fn inject_write_failure(&self) {
        guard(&self.state).fail_next_write = true;
    }

    /// Every frame written, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        guard(&self.state).writes.clone()
    }

    /// Writes rendered as text for readable assertions.
    pub fn written_frames(&self) -> Vec<String> {
        guard(&self.state)
            .writes
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Number of frames written.
    pub fn write_count(&self) -> usize {
        guard(&self.state).writes.len()
    }

    /// Calls to `open`.
    pub fn open_count(&self) -> u32 {
        guard(&self.state).opens
    }

    /// Calls to `close`.
    pub fn close_count(&self) -> u32 {
        guard(&self.state).closes
    }

    /// Calls to `flush_input`.
    pub fn flush_count(&self) -> u32 {
        guard(&self.state).flushes
    }

    /// Opened and not closed since.
    pub fn is_open(&self) -> bool {
        guard(&self.state).open
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    fn open(&mut self) -> io::Result<()> {
        let mut state = guard(&self.state);
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = guard(&self.state);
        state.open = false;
        state.closes += 1;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = guard(&self.state);
        if std::mem::take(&mut state.fail_next_write) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected failure"));
        }
        state.writes.push(bytes.to_vec());
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut state = guard(&self.state);
        let reply = match state.replies.pop_front() {
            Some(reply) => reply,
            None => state.fallback.clone().unwrap_or_default(),
        };
        Ok(reply)
    }

    fn flush_input(&mut self) -> io::Result<()> {
        guard(&self.state).flushes += 1;
        Ok(())
    }
}

/// Address the pump uses when replying to the host.
const HOST_ADDRESS: char = '0';

struct PumpState {
    address: char,
    max_steps: u32,
    plunger: u32,
    valve: char,
    initialized: bool,
    /// Status polls answered busy after each motion command
    busy_polls: u32,
    pending_busy: u32,
    /// Remaining motion commands before `fault` latches
    fault_after: Option<(u32, char)>,
    fault: Option<char>,
    frames: Vec<String>,
    stale: VecDeque<Vec<u8>>,
    in_flight: Option<Vec<u8>>,
    opens: u32,
    closes: u32,
}

/// Behavioural model of a C-Series pump on the other end of the wire.
///
/// A reply to the most recent write is still "in flight" and survives
/// `flush_input`; replies left over from earlier writes are discarded by it.
#[derive(Clone)]
pub struct SimulatedPump {
    state: Arc<Mutex<PumpState>>,
}

impl SimulatedPump {
    /// Initialized pump at `address`, plunger at 0, valve at inlet.
    pub fn new(address: char, max_steps: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(PumpState {
                address,
                max_steps,
                plunger: 0,
                valve: 'I',
                initialized: true,
                busy_polls: 1,
                pending_busy: 0,
                fault_after: None,
                fault: None,
                frames: Vec::new(),
                stale: VecDeque::new(),
                in_flight: None,
                opens: 0,
                closes: 0,
            })),
        }
    }

    /// Number of status polls answered busy after each motion.
    pub fn with_busy_polls(self, polls: u32) -> Self {
        guard(&self.state).busy_polls = polls;
        self
    }

    /// Start with the valve at `valve` (`I`, `O`, `B` or `E`).
    pub fn with_valve(self, valve: char) -> Self {
        guard(&self.state).valve = valve;
        self
    }

    /// Power-on state: every motion is rejected until an init command.
    pub fn uninitialized(self) -> Self {
        guard(&self.state).initialized = false;
        self
    }

    /// Latch status `code` on the motion command (valve or plunger) that
    /// follows `moves` successful ones.
    pub fn fault_after_moves(self, moves: u32, code: char) -> Self {
        guard(&self.state).fault_after = Some((moves, code));
        self
    }

    /// Frame bodies received, in order (address and markers stripped).
    pub fn frames(&self) -> Vec<String> {
        guard(&self.state).frames.clone()
    }

    /// Received frames other than status polls.
    pub fn commands(&self) -> Vec<String> {
        self.frames().into_iter().filter(|f| f != "Q").collect()
    }

    /// Plunger position in steps.
    pub fn plunger(&self) -> u32 {
        guard(&self.state).plunger
    }

    /// Valve position letter.
    pub fn valve(&self) -> char {
        guard(&self.state).valve
    }

    /// Calls to `open`.
    pub fn open_count(&self) -> u32 {
        guard(&self.state).opens
    }

    /// Calls to `close`.
    pub fn close_count(&self) -> u32 {
        guard(&self.state).closes
    }
}

impl PumpState {
    fn respond(&mut self, frame: Option<DecodedFrame>) -> Vec<u8> {
        let frame = match frame {
            Some(frame) if frame.address == self.address => frame,
            _ => return reply('b', ""),
        };
        self.frames.push(frame.body.clone());

        let mut data = String::new();
        for (opcode, operand) in frame.commands() {
            let value: Option<u32> = operand.parse().ok();
            match opcode {
                'Q' => {
                    if let Some(code) = self.fault {
                        return reply(code.to_ascii_lowercase(), "");
                    }
                    if self.pending_busy > 0 {
                        self.pending_busy -= 1;
                        return reply('@', "");
                    }
                    return reply('`', "");
                }
                '?' => match operand.as_str() {
                    "" => data = self.plunger.to_string(),
                    "6" => data = self.valve.to_ascii_lowercase().to_string(),
                    _ => data = "0".to_string(),
                },
                'Z' | 'Y' | 'W' | 'w' => {
                    self.initialized = true;
                    self.plunger = 0;
                    self.pending_busy = self.busy_polls;
                }
                'I' | 'O' | 'B' | 'E' | 'A' | 'P' | 'D' => {
                    if !self.initialized {
                        return reply('g', "");
                    }
                    if let Some(code) = self.fault {
                        return reply(code, "");
                    }
                    if let Some((remaining, code)) = self.fault_after {
                        if remaining == 0 {
                            self.fault = Some(code);
                            return reply(code, "");
                        }
                        self.fault_after = Some((remaining - 1, code));
                    }
                    let target = match opcode {
                        'A' => value,
                        'P' => value.map(|v| self.plunger.saturating_add(v)),
                        'D' => value.and_then(|v| self.plunger.checked_sub(v)),
                        _ => {
                            self.valve = opcode;
                            Some(self.plunger)
                        }
                    };
                    match target {
                        Some(steps) if steps <= self.max_steps => self.plunger = steps,
                        _ => return reply('c', ""),
                    }
                    self.pending_busy = self.busy_polls;
                }
                'N' | 'L' | 'v' | 'V' | 'c' | 'C' | 'T' | 'g' | 'G' | 'U' | 'u' => {}
                _ => return reply('b', ""),
            }
        }
        let code = if self.pending_busy > 0 { '@' } else { '`' };
        reply(code, &data)
    }
}

fn reply(code: char, data: &str) -> Vec<u8> {
    format!("/{}{}{}\x03\r\n", HOST_ADDRESS, code, data).into_bytes()
}

impl Transport for SimulatedPump {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self) -> io::Result<()> {
        guard(&self.state).opens += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        guard(&self.state).closes += 1;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = guard(&self.state);
        let response = state.respond(command::decode(bytes));
        if let Some(previous) = state.in_flight.replace(response) {
            state.stale.push_back(previous);
        }
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        let mut state = guard(&self.state);
        let line = match state.stale.pop_front() {
            Some(line) => line,
            None => state.in_flight.take().unwrap_or_default(),
        };
        Ok(line)
    }

    fn flush_input(&mut self) -> io::Result<()> {
        guard(&self.state).stale.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status::StatusResponse;

    fn exchange(pump: &mut SimulatedPump, frame: &[u8]) -> StatusResponse {
        pump.write(frame).unwrap();
        StatusResponse::parse(&pump.read_line().unwrap()).unwrap()
    }

    #[test]
    fn test_mock_replays_script_then_fallback() {
        let mut mock = MockTransport::new().with_fallback_reply(b"/0@\x03\r\n");
        mock.push_reply(b"/0`\x03\r\n");
        assert_eq!(mock.read_line().unwrap(), b"/0`\x03\r\n".to_vec());
        assert_eq!(mock.read_line().unwrap(), b"/0@\x03\r\n".to_vec());
        assert_eq!(mock.read_line().unwrap(), b"/0@\x03\r\n".to_vec());
    }

    #[test]
    fn test_mock_call_log() {
        let mock = MockTransport::new();
        let mut handle = mock.clone();
        handle.open().unwrap();
        handle.write(b"/1ZR\r").unwrap();
        handle.flush_input().unwrap();
        handle.close().unwrap();
        assert_eq!(mock.written_frames(), vec!["/1ZR\r".to_string()]);
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.close_count(), 1);
        assert_eq!(mock.flush_count(), 1);
        assert!(!mock.is_open());
    }

    #[test]
    fn test_mock_injected_write_failure() {
        let mut mock = MockTransport::new();
        mock.inject_write_failure();
        assert!(mock.write(b"/1ZR\r").is_err());
        assert!(mock.write(b"/1ZR\r").is_ok());
        assert_eq!(mock.write_count(), 1);
    }

    #[test]
    fn test_simulated_move_then_busy_then_idle() {
        let mut pump = SimulatedPump::new('1', 3000).with_busy_polls(2);
        let status = exchange(&mut pump, b"/1A1200R\r");
        assert_eq!(status.code, '@');
        assert_eq!(pump.plunger(), 1200);
        assert_eq!(exchange(&mut pump, b"/1QR\r").code, '@');
        assert_eq!(exchange(&mut pump, b"/1QR\r").code, '@');
        assert_eq!(exchange(&mut pump, b"/1QR\r").code, '`');
    }

    #[test]
    fn test_simulated_valve_report_and_switch() {
        let mut pump = SimulatedPump::new('1', 3000).with_busy_polls(0);
        assert_eq!(exchange(&mut pump, b"/1?6R\r").data, "i");
        exchange(&mut pump, b"/1OR\r");
        assert_eq!(pump.valve(), 'O');
        assert_eq!(exchange(&mut pump, b"/1?6R\r").data, "o");
    }

    #[test]
    fn test_simulated_rejects_out_of_range_and_uninitialized() {
        let mut pump = SimulatedPump::new('1', 3000);
        assert_eq!(exchange(&mut pump, b"/1A3001R\r").code, 'c');

        let mut cold = SimulatedPump::new('1', 3000).uninitialized();
        assert_eq!(exchange(&mut cold, b"/1A10R\r").code, 'g');
        exchange(&mut cold, b"/1ZR\r");
        assert_eq!(exchange(&mut cold, b"/1A10R\r").code, '@');
    }

    #[test]
    fn test_simulated_flush_keeps_in_flight_reply() {
        let mut pump = SimulatedPump::new('1', 3000).with_busy_polls(0);
        pump.write(b"/1A10R\r").unwrap();
        pump.write(b"/1QR\r").unwrap();
        pump.flush_input().unwrap();
        let status = StatusResponse::parse(&pump.read_line().unwrap()).unwrap();
        assert_eq!(status.code, '`');
        assert!(pump.read_line().unwrap().is_empty());
    }
}
