//! Command/response framing over the DUT's text console.
//!
//! The board-test firmware exposes a line-oriented console: the host writes
//! an ASCII command terminated by a carriage return, and the firmware
//! answers with free-form text followed by the fixed prompt `[cmd]>`.
//! [`Console`] turns that unreliable byte stream into discrete
//! request/response transactions with timeout and resynchronization
//! semantics.
//!
//! A [`Console`] holds no internal lock and assumes exactly one in-flight
//! command at a time; callers issuing commands from more than one thread
//! must serialize access themselves.

use crate::transport::Transport;
use std::thread;
use std::time::{Duration, Instant};

/// Sentinel emitted by the firmware to mark end of output and readiness
/// for the next command.
pub const PROMPT: &str = "[cmd]>";

/// Sentinel returned by [`Console::send`] for both an explicit `FAIL`
/// report from the DUT and a timeout/empty response. The two are
/// indistinguishable at this layer; callers that need to tell them apart
/// must not rely on the console alone.
pub const FAIL: &str = "FAIL";

/// Pause between read attempts while waiting for the prompt.
const ACCUMULATE_SLEEP: Duration = Duration::from_millis(50);

/// Three-valued result of a `PASS`/`FAIL` style test command.
///
/// `Indeterminate` covers timeouts, malformed responses, and any
/// second-to-last line other than exactly `PASS` or `FAIL`. It is not
/// collapsible to `Fail`: a test that never ran is not a test that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassFailOutcome {
    Pass,
    Fail,
    Indeterminate,
}

impl PassFailOutcome {
    /// True only for an explicit `PASS`.
    pub fn passed(self) -> bool {
        self == Self::Pass
    }
}

/// One logical command console over a [`Transport`].
pub struct Console<T: Transport> {
    transport: T,
    prompt: String,
}

impl<T: Transport> Console<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            prompt: PROMPT.to_string(),
        }
    }

    /// Issue one command and return its unframed response.
    ///
    /// The transaction runs in four phases: drain stale input, transmit
    /// `cmd` + CR, accumulate until the prompt appears or `timeout` elapses,
    /// then strip the echoed command and prompt. Returns the [`FAIL`]
    /// sentinel on timeout or when nothing but framing remained.
    ///
    /// Transport noise during flush or transmit is tolerated, not surfaced:
    /// the DUT console itself is resilient to a dirty line, and the worst
    /// outcome is a `FAIL` the caller already has to handle.
    pub fn send(&mut self, cmd: &str, timeout: Duration) -> String {
        self.flush_input();

        if let Err(e) = self.transport.write_all(format!("{cmd}\r").as_bytes()) {
            log::warn!("Write of '{cmd}' failed: {e}");
        }

        let deadline = Instant::now() + timeout;
        let mut accum = String::new();
        let mut buf = [0u8; 256];

        loop {
            if Instant::now() > deadline {
                log::warn!("Timed out waiting for response to {cmd}");
                return FAIL.to_string();
            }
            match self.transport.read_chunk(&mut buf) {
                Ok(n) if n > 0 => {
                    accum.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if accum.contains(&self.prompt) {
                        break;
                    }
                }
                _ => thread::sleep(ACCUMULATE_SLEEP),
            }
        }

        let result = unframe(&accum, cmd, &self.prompt);
        if result.is_empty() {
            log::warn!("No response returned for {cmd}");
            return FAIL.to_string();
        }
        result
    }

    /// Issue a command whose only interesting answer is `OK`.
    pub fn send_expect_ok(&mut self, cmd: &str, timeout: Duration) -> bool {
        let resp = self.send(cmd, timeout);
        resp.len() >= 2 && resp.ends_with("OK")
    }

    /// Issue a test command that reports `PASS` or `FAIL` above its `OK`.
    pub fn send_expect_pass_fail(&mut self, cmd: &str, timeout: Duration) -> PassFailOutcome {
        let resp = self.send(cmd, timeout);
        if resp == FAIL {
            return PassFailOutcome::Indeterminate;
        }
        let lines: Vec<&str> = resp.split("\r\n").collect();
        match lines[..] {
            [.., verdict, "OK"] => match verdict.trim() {
                "PASS" => PassFailOutcome::Pass,
                "FAIL" => PassFailOutcome::Fail,
                _ => PassFailOutcome::Indeterminate,
            },
            _ => PassFailOutcome::Indeterminate,
        }
    }

    /// Direct access to the underlying transport, for control-line work
    /// (DUT reset) between transactions.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Drain and discard whatever is pending on the line, so a prior
    /// unterminated exchange cannot leak into this one. Read errors here
    /// mean "nothing pending", not failure.
    fn flush_input(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.transport.read_chunk(&mut buf) {
                Ok(n) if n > 0 => {}
                _ => break,
            }
        }
    }
}

/// Strip the echoed command and trailing prompt from an accumulated
/// response.
///
/// Exactly one rule applies to a well-formed exchange; which one depends on
/// whether the firmware echoes the command, so all three stay. A buffer
/// matching none of them is left intact apart from the trailing trim.
fn unframe(raw: &str, cmd: &str, prompt: &str) -> String {
    let stripped = if let Some(head) = raw.strip_suffix(prompt) {
        head
    } else if let Some(tail) = raw.strip_prefix(&format!("{prompt}{cmd}\r\n")) {
        tail
    } else if let Some(head) = raw.strip_suffix(&format!("{prompt}{cmd}")) {
        head
    } else {
        raw
    };
    stripped.trim_end().to_string()
}
