//! Idle synchronization: poll the status query until the pump reports idle.
//!
//! Every motion command is followed by [`wait_for_idle`] before the next one
//! is issued. The loop keeps a 50 ms cadence by default and is bounded by an
//! attempt count and/or an overall timeout, and can be cancelled between polls.

use crate::error::{PumpError, PumpResult};
use crate::protocol::command::Command;
use crate::protocol::status::{Classification, StatusResponse, IDLE_MARKER};
use crate::session::TransportSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll cadence and bounds for [`wait_for_idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleWait {
    /// Sleep before each poll
    pub poll_interval: Duration,
    /// Give up once this much time has elapsed
    pub timeout: Option<Duration>,
    /// Give up after this many polls
    pub max_attempts: Option<u32>,
}

impl Default for IdleWait {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            timeout: Some(Duration::from_secs(120)),
            max_attempts: None,
        }
    }
}

impl IdleWait {
    /// Poll forever. Only sensible together with a [`CancelToken`].
    pub fn unbounded() -> Self {
        Self {
            timeout: None,
            ..Self::default()
        }
    }

    /// Set the poll cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound the wait by elapsed time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bound the wait by poll count.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.timeout.is_some_and(|limit| elapsed >= limit)
    }
}

/// Shared cancellation flag, checked before every idle poll and every
/// dispense phase.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Every clone observes it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> PumpResult<()> {
        if self.is_cancelled() {
            Err(PumpError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Block until the pump at `address` reports idle and error free.
///
/// Each poll sleeps `poll_interval`, writes the status query, flushes stale
/// input and reads one line; the pump is idle when that line contains the
/// idle-error-free status byte. Undecodable or unrecognized replies are
/// skipped. A known fault status ends the wait with `DeviceFault`, since
/// such a pump never reports idle-error-free on its own.
///
/// # Errors
///
/// - `TimedOut` when the bounds in `wait` are exhausted, carrying the last
///   decoded status
/// - `Cancelled` when `cancel` fires
/// - `DeviceFault` on a fault status
/// - `Transport` on I/O failure
pub fn wait_for_idle(
    session: &mut TransportSession,
    address: char,
    wait: &IdleWait,
    cancel: Option<&CancelToken>,
) -> PumpResult<()> {
    let query = Command::status_query().encode(address);
    let start = Instant::now();
    let mut attempts: u32 = 0;
    let mut last_status: Option<StatusResponse> = None;

    loop {
        if let Some(token) = cancel {
            token.check()?;
        }

        thread::sleep(wait.poll_interval);
        attempts += 1;

        session.write(&query)?;
        session.flush_input()?;
        let reply = session.read_line()?;

        if reply.contains(&IDLE_MARKER) {
            debug!("Pump '{}' idle after {} poll(s)", address, attempts);
            return Ok(());
        }

        match StatusResponse::parse(&reply) {
            Ok(status) => {
                if let Classification::Known(entry) = status.classify() {
                    if !entry.healthy {
                        return Err(PumpError::DeviceFault {
                            opcode: 'Q',
                            message: entry.message,
                            status,
                        });
                    }
                }
                last_status = Some(status);
            }
            Err(e) => warn!("Ignoring poll reply from pump '{}': {}", address, e),
        }

        let elapsed = start.elapsed();
        if wait.exhausted(attempts, elapsed) {
            return Err(PumpError::TimedOut {
                address,
                attempts,
                elapsed,
                last_status,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockTransport, SimulatedPump};

    fn fast() -> IdleWait {
        IdleWait::default().with_poll_interval(Duration::from_millis(1))
    }

    fn open_session(mock: &MockTransport) -> TransportSession {
        let mut session = TransportSession::new(Box::new(mock.clone()));
        session.open().unwrap();
        session
    }

    #[test]
    fn test_returns_on_idle_marker() {
        let mock = MockTransport::new().with_fallback_reply(b"/0`\x03\r\n");
        mock.push_reply(b"/0@\x03\r\n");
        mock.push_reply(b"/0@\x03\r\n");
        let mut session = open_session(&mock);

        wait_for_idle(&mut session, '1', &fast(), None).unwrap();
        assert_eq!(mock.write_count(), 3);
        assert_eq!(mock.flush_count(), 3);
        assert!(mock.written_frames().iter().all(|f| f == "/1QR\r"));
    }

    #[test]
    fn test_busy_forever_times_out() {
        let mock = MockTransport::new().with_fallback_reply(b"/0@\x03\r\n");
        let mut session = open_session(&mock);
        let wait = fast().with_timeout(Duration::from_millis(30));

        match wait_for_idle(&mut session, '1', &wait, None) {
            Err(PumpError::TimedOut {
                address,
                attempts,
                last_status,
                ..
            }) => {
                assert_eq!(address, '1');
                assert!(attempts >= 1);
                assert_eq!(last_status.map(|s| s.code), Some('@'));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_attempt_bound() {
        let mock = MockTransport::new().with_fallback_reply(b"/0@\x03\r\n");
        let mut session = open_session(&mock);
        let wait = IdleWait::unbounded()
            .with_poll_interval(Duration::from_millis(1))
            .with_max_attempts(4);

        let err = wait_for_idle(&mut session, '1', &wait, None).unwrap_err();
        assert!(matches!(err, PumpError::TimedOut { attempts: 4, .. }));
        assert_eq!(mock.write_count(), 4);
    }

    #[test]
    fn test_silent_line_times_out_without_status() {
        let mock = MockTransport::new();
        let mut session = open_session(&mock);
        let wait = fast().with_max_attempts(3);

        let err = wait_for_idle(&mut session, '1', &wait, None).unwrap_err();
        assert!(matches!(
            err,
            PumpError::TimedOut {
                last_status: None,
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_then_idle() {
        let mock = MockTransport::new().with_fallback_reply(b"/0`\x03\r\n");
        mock.push_reply(&[0xff, 0x00, 0xfe]);
        mock.push_reply(b"/0x\x03\r\n");
        let mut session = open_session(&mock);

        wait_for_idle(&mut session, '1', &fast(), None).unwrap();
        assert_eq!(mock.write_count(), 3);
    }

    #[test]
    fn test_fault_status_ends_wait() {
        let mock = MockTransport::new().with_fallback_reply(b"/0i\x03\r\n");
        let mut session = open_session(&mock);

        let err = wait_for_idle(&mut session, '1', &fast(), None).unwrap_err();
        assert!(matches!(
            err,
            PumpError::DeviceFault {
                message: "Plunger Overload",
                ..
            }
        ));
    }

    #[test]
    fn test_cancelled_before_poll() {
        let mock = MockTransport::new().with_fallback_reply(b"/0@\x03\r\n");
        let mut session = open_session(&mock);
        let token = CancelToken::new();
        token.cancel();

        let err = wait_for_idle(&mut session, '1', &IdleWait::unbounded(), Some(&token)).unwrap_err();
        assert!(matches!(err, PumpError::Cancelled));
        assert_eq!(mock.write_count(), 0);
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let mock = MockTransport::new().with_fallback_reply(b"/0@\x03\r\n");
        let mut session = open_session(&mock);
        let token = CancelToken::new();
        let remote = token.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let wait = IdleWait::unbounded().with_poll_interval(Duration::from_millis(1));
        let err = wait_for_idle(&mut session, '1', &wait, Some(&token)).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, PumpError::Cancelled));
    }

    #[test]
    fn test_simulated_pump_settles() {
        let pump = SimulatedPump::new('1', 3000).with_busy_polls(3);
        let mut session = TransportSession::new(Box::new(pump.clone()));
        session.open().unwrap();
        session.request('1', &Command::move_to(1500)).unwrap();

        wait_for_idle(&mut session, '1', &fast(), None).unwrap();
        assert_eq!(pump.frames().iter().filter(|f| *f == "Q").count(), 4);
    }
}
