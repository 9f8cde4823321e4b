// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use crate::error::{Error, Result};
use crate::protocol::SessionConfig;
use crate::serial::SerialPort;

/// Statement used to find the prompt again. The echo contains `'..'`, so
/// only a real evaluation can print the joined marker.
const SYNC_STATEMENT: &str = "print('@@'..'sync')";
const SYNC_MARKER: &str = "@@sync";

/// Outside a long string no Lua chunk can continue with `]]`, so a
/// half-entered statement fails and the interpreter drops back to its
/// ready prompt. Statements built here never open a long string.
const RESET_LINE: &str = "]]";

// ============================================================================
// Responses
// ============================================================================

/// Outcome of one statement round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The prompt came back with nothing printed.
    EchoOnly,
    /// Text printed before the prompt, lines joined with `\n`.
    Value(String),
    /// The statement raised a runtime error; the device's message.
    Error(String),
    /// Neither prompt nor error arrived before the line went idle.
    Timeout,
}

impl Response {
    /// Success without output, or the matching error.
    pub fn into_echo_only(self, timeout: Duration) -> Result<()> {
        match self {
            Response::EchoOnly => Ok(()),
            Response::Value(text) => Err(Error::protocol(format!("unexpected output: {:?}", text))),
            other => Err(other.into_error(timeout)),
        }
    }

    /// Printed output (empty when nothing was printed), or the matching error.
    pub fn into_text(self, timeout: Duration) -> Result<String> {
        match self {
            Response::EchoOnly => Ok(String::new()),
            Response::Value(text) => Ok(text),
            other => Err(other.into_error(timeout)),
        }
    }

    pub fn into_error(self, timeout: Duration) -> Error {
        match self {
            Response::Error(msg) => Error::Device(msg),
            Response::Timeout => Error::Timeout(timeout),
            Response::EchoOnly => Error::protocol("expected output, device printed nothing"),
            Response::Value(text) => Error::protocol(format!("unexpected output: {:?}", text)),
        }
    }
}

/// Whether the device is known to be sitting at its ready prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Unknown,
}

// ============================================================================
// Scanner
// ============================================================================

/// Terminal token found by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Prompt(Response),
    Continuation,
}

/// Incremental lexer over the bytes that follow a statement. Bytes can be
/// fed in any split; `poll` reports a terminal token once one is complete.
/// Each feed only looks at the new bytes, so a long response costs linear
/// time.
pub struct ResponseScanner<'a> {
    config: &'a SessionConfig,
    echo: Vec<u8>,
    buf: Vec<u8>,
    body_start: Option<usize>,
    // Where the next search for the echo resumes
    searched: usize,
    // Start of the line still being received
    line_start: usize,
}

impl<'a> ResponseScanner<'a> {
    pub fn new(config: &'a SessionConfig, statement: &str) -> Self {
        ResponseScanner {
            config,
            echo: statement.as_bytes().to_vec(),
            buf: Vec::new(),
            body_start: if config.echo { None } else { Some(0) },
            searched: 0,
            line_start: 0,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let offset = self.buf.len();
        self.buf.extend_from_slice(bytes);
        if let Some(pos) = bytes.iter().rposition(|&b| b == b'\n') {
            self.line_start = offset + pos + 1;
        }
    }

    /// Bytes received so far, echo included.
    pub fn received(&self) -> usize {
        self.buf.len()
    }

    pub fn poll(&mut self) -> Option<Terminal> {
        let start = self.body_start()?;
        let config = self.config;

        let tail = &self.buf[start.max(self.line_start)..];
        if tail == config.continuation.as_bytes() {
            return Some(Terminal::Continuation);
        }
        if tail != config.prompt.as_bytes() {
            return None;
        }

        let text = String::from_utf8_lossy(&self.buf[start..]);
        let lines = split_lines(&text[..text.len() - config.prompt.len()]);
        let response = match self.error_at(&lines) {
            Some(i) => Response::Error(lines[i..].join("\n").trim().to_string()),
            None if lines.iter().all(|l| l.trim().is_empty()) => Response::EchoOnly,
            None => Response::Value(lines.join("\n")),
        };
        Some(Terminal::Prompt(response))
    }

    /// Classify what arrived once the line has gone idle without a prompt.
    pub fn on_idle(&mut self) -> Response {
        let Some(start) = self.body_start() else {
            return Response::Timeout;
        };
        let text = String::from_utf8_lossy(&self.buf[start..]);
        let lines = split_lines(&text);
        match self.error_at(&lines) {
            Some(i) => Response::Error(lines[i..].join("\n").trim().to_string()),
            None => Response::Timeout,
        }
    }

    /// Offset of the first byte after the echoed statement and its
    /// terminator, or `None` while the echo has not fully arrived.
    fn body_start(&mut self) -> Option<usize> {
        if self.body_start.is_none() {
            let from = self.searched;
            let Some(pos) = find(&self.buf[from..], &self.echo) else {
                self.searched = self.buf.len().saturating_sub(self.echo.len()).max(from);
                return None;
            };
            let after = from + pos + self.echo.len();
            let rest = &self.buf[after..];
            let terminator = self.config.line_terminator.as_bytes();
            let skip = if rest.starts_with(terminator) {
                terminator.len()
            } else if rest.starts_with(b"\n") {
                1
            } else if terminator.starts_with(rest) {
                // Terminator still in flight
                self.searched = from + pos;
                return None;
            } else {
                0
            };
            self.body_start = Some(after + skip);
        }
        self.body_start
    }

    /// First line holding an interpreter error: a marker prefix and a Lua
    /// source position such as `stdin:1:`. Script output that merely
    /// starts with a marker is not an error.
    fn error_at(&self, lines: &[&str]) -> Option<usize> {
        lines.iter().position(|line| {
            self.config.error_markers.iter().any(|m| line.starts_with(m.as_str())) && has_position(line)
        })
    }
}

fn has_position(line: &str) -> bool {
    line.match_indices(':').any(|(i, _)| {
        let rest = &line[i + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        digits > 0 && rest[digits..].starts_with(':')
    })
}

fn split_lines(text: &str) -> Vec<&str> {
    let text = text.strip_suffix('\n').unwrap_or(text);
    if text.is_empty() {
        return Vec::new();
    }
    text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ============================================================================
// Session
// ============================================================================

/// One serial connection to the interpreter. Strictly one statement in
/// flight at a time; `&mut self` on every operation enforces that.
pub struct Session {
    serial: Box<dyn SerialPort>,
    config: SessionConfig,
    state: SessionState,
}

impl Session {
    /// Wrap an open port. The prompt position is unknown until `sync` runs.
    pub fn new(serial: Box<dyn SerialPort>, config: SessionConfig) -> Self {
        Session { serial, config, state: SessionState::Unknown }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn execute(&mut self, statement: &str) -> Result<Response> {
        let timeout = self.config.timeout;
        self.execute_with_timeout(statement, timeout)
    }

    /// Send one statement and classify what comes back. `timeout` bounds
    /// each silent gap; `max_response_length` bounds the whole response.
    pub fn execute_with_timeout(&mut self, statement: &str, timeout: Duration) -> Result<Response> {
        if self.state != SessionState::Ready {
            return Err(Error::NotReady);
        }
        if statement.contains(['\r', '\n']) {
            return Err(Error::protocol("statement must fit on a single line"));
        }
        if statement.len() > self.config.max_line_length {
            return Err(Error::LineTooLong {
                len: statement.len(),
                max: self.config.max_line_length,
            });
        }

        debug!(statement, "send");
        let mut line = statement.as_bytes().to_vec();
        line.extend_from_slice(self.config.line_terminator.as_bytes());
        self.write(&line)?;

        let config = self.config.clone();
        let mut scanner = ResponseScanner::new(&config, statement);
        let mut buf = [0u8; 256];
        let response = loop {
            let n = self.read(&mut buf, timeout)?;
            if n == 0 {
                break scanner.on_idle();
            }
            trace!(bytes = ?String::from_utf8_lossy(&buf[..n]), "recv");
            scanner.feed(&buf[..n]);
            if scanner.received() > config.max_response_length {
                self.mark_unknown("response never reached the prompt");
                return Err(Error::protocol(format!(
                    "no prompt within {} bytes of output",
                    config.max_response_length
                )));
            }
            match scanner.poll() {
                Some(Terminal::Prompt(response)) => {
                    debug!(?response, "prompt");
                    return Ok(response);
                }
                Some(Terminal::Continuation) => {
                    self.mark_unknown("interpreter is waiting for a continuation line");
                    return Err(Error::protocol(format!("incomplete statement: {}", statement)));
                }
                None => {}
            }
        };

        self.mark_unknown("no prompt before the line went idle");
        Ok(response)
    }

    /// Discard stale input and confirm the interpreter answers at its
    /// prompt. Required after `new` and after any `Timeout`.
    pub fn sync(&mut self) -> Result<()> {
        let mut line = RESET_LINE.as_bytes().to_vec();
        line.extend_from_slice(self.config.line_terminator.as_bytes());
        self.write(&line)?;
        self.drain()?;
        self.state = SessionState::Ready;
        let timeout = self.config.timeout;
        match self.execute(SYNC_STATEMENT)? {
            Response::Value(text) if text.trim() == SYNC_MARKER => {
                debug!("session in sync");
                Ok(())
            }
            other => {
                self.mark_unknown("sync marker not echoed back");
                Err(match other {
                    Response::Error(msg) => Error::Device(msg),
                    Response::Timeout => Error::Timeout(timeout),
                    other => Error::protocol(format!("unexpected sync reply: {:?}", other)),
                })
            }
        }
    }

    /// Send a statement that reboots the device, then wait for the boot
    /// banner followed by a fresh prompt.
    pub fn restart(&mut self, statement: &str) -> Result<()> {
        if self.state != SessionState::Ready {
            return Err(Error::NotReady);
        }
        debug!(statement, "send");
        let mut line = statement.as_bytes().to_vec();
        line.extend_from_slice(self.config.line_terminator.as_bytes());
        self.write(&line)?;
        self.state = SessionState::Unknown;

        let limit = self.config.restart_timeout;
        let deadline = Instant::now() + limit;
        let banner = self.config.banner.as_bytes().to_vec();
        let prompt = self.config.prompt.clone();
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];

        // The ROM bootloader talks at another baud rate, so expect garbage
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            let n = self.read(&mut buf, remaining.min(self.config.timeout))?;
            if n == 0 {
                continue;
            }
            seen.extend_from_slice(&buf[..n]);
            if let Some(pos) = find(&seen, &banner) {
                let after = String::from_utf8_lossy(&seen[pos..]);
                let tail_start = after.rfind('\n').map_or(0, |p| p + 1);
                if tail_start > 0 && after[tail_start..] == *prompt {
                    debug!("device restarted");
                    self.state = SessionState::Ready;
                    return Ok(());
                }
            }
        }

        warn!(?limit, "device did not return after restart");
        Err(Error::NotResponding(limit))
    }

    /// Read until the line is quiet, bounded by the restart timeout.
    fn drain(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.restart_timeout;
        let quiet = self.config.timeout.min(Duration::from_millis(100));
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            let n = self.read(&mut buf, quiet)?;
            if n == 0 {
                return Ok(());
            }
            trace!(bytes = ?String::from_utf8_lossy(&buf[..n]), "discard");
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.serial.write_all(bytes).map_err(|e| {
            self.state = SessionState::Unknown;
            Error::Transport(e)
        })
    }

    /// One read; silence is `Ok(0)`.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.serial.read_timeout(buf, timeout) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => {
                self.state = SessionState::Unknown;
                Err(Error::Transport(e))
            }
        }
    }

    fn mark_unknown(&mut self, reason: &str) {
        warn!(reason, "session out of sync");
        self.state = SessionState::Unknown;
    }
}

// ============================================================================
// Tests
// ============================================================================
