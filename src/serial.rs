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

use std::time::Duration;
use serialport::{SerialPort as SerialPortTrait, SerialPortType};

// ============================================================================
// SerialPort Trait
// ============================================================================

/// Byte-level transport the REPL session runs over
pub trait SerialPort: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Read whatever arrives within `timeout`. Nothing arriving is reported
    /// either as `Ok(0)` or as an error of kind `TimedOut`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Real serial port implementation that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl SerialPort for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(std::io::Error::other)?;
        self.port.read(buf)
    }
}

/// Pick a port when none was given, preferring USB serial adapters.
pub fn default_port() -> Option<String> {
    let ports = serialport::available_ports().ok()?;
    let mut names: Vec<(bool, String)> = ports
        .into_iter()
        .map(|p| {
            let usb = matches!(p.port_type, SerialPortType::UsbPort(_)) || p.port_name.contains("ttyUSB");
            (!usb, p.port_name)
        })
        .collect();
    names.sort();
    names.into_iter().next().map(|(_, name)| name)
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Bytes that must have been written before each read entry is released
    release_after: Vec<usize>,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        let release_after = vec![0; responses.len()];
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            release_after,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    /// Queue `reply` to be released once everything expected so far has
    /// been written.
    fn answer(&mut self, statement: &str, reply: &[u8]) {
        self.expected_writes.extend_from_slice(statement.as_bytes());
        self.expected_writes.extend_from_slice(b"\r\n");
        let gate = self.expected_writes.len();
        self.read_buffer.extend(reply.iter().map(|&b| Some(b)));
        self.release_after.resize(self.read_buffer.len(), gate);
    }

    /// Script a conversation as (statement, device reply) pairs. A reply
    /// stays unread until its statement has been written.
    pub fn conversation(exchanges: &[(&str, &[u8])]) -> Self {
        let mut mock = MockSerialPort::new(Vec::new(), Vec::new());
        for (statement, reply) in exchanges {
            mock.answer(statement, reply);
        }
        mock
    }

    /// Script a REPL that starts out idle and echoes each statement back
    /// before its output. It opens with the reset line a session `sync`
    /// sends first.
    pub fn repl(exchanges: &[(&str, &[u8])]) -> Self {
        let mut mock = MockSerialPort::new(vec![None], Vec::new());
        mock.answer("]]", b"");
        for (statement, output) in exchanges {
            let mut reply = statement.as_bytes().to_vec();
            reply.extend_from_slice(b"\r\n");
            reply.extend_from_slice(output);
            mock.answer(statement, &reply);
        }
        mock
    }

    /// Queue a timeout after everything scripted so far.
    pub fn then_silence(mut self) -> Self {
        self.read_buffer.push(None);
        self.release_after.push(self.expected_writes.len());
        self
    }

    fn released(&self) -> bool {
        self.release_after[self.read_pos] <= self.write_log.len()
    }
}

#[cfg(test)]
impl SerialPort for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        // Out of responses, or the next one waits on a write = timeout
        if self.read_pos >= self.read_buffer.len() || !self.released() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Mock timeout"
            ));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() && self.released() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            String::from_utf8_lossy(&self.write_log),
            String::from_utf8_lossy(&self.expected_writes),
            "MockSerialPort write log mismatch!"
        );
    }
}

// ============================================================================
// Simulated NodeMCU for Testing
// ============================================================================

/// In-memory stand-in for a NodeMCU board. It echoes input, runs the
/// statement shapes this crate emits against an in-memory flash, and
/// answers with printed lines, `stdin:1:` errors and `> ` prompts.
#[cfg(test)]
pub struct SimulatedDevice {
    flash: std::sync::Arc<std::sync::Mutex<Vec<(String, Vec<u8>)>>>,
    open: Option<(String, bool, usize)>,
    line: Vec<u8>,
    output: std::collections::VecDeque<u8>,
    max_line_length: usize,
}

#[cfg(test)]
pub type SimulatedFlash = std::sync::Arc<std::sync::Mutex<Vec<(String, Vec<u8>)>>>;

#[cfg(test)]
impl SimulatedDevice {
    pub fn new() -> Self {
        SimulatedDevice {
            flash: Default::default(),
            open: None,
            line: Vec::new(),
            output: Default::default(),
            max_line_length: crate::protocol::MAX_LINE_LENGTH,
        }
    }

    /// Shared view of the simulated flash, for inspection after the device
    /// has been moved into a session.
    pub fn flash(&self) -> SimulatedFlash {
        self.flash.clone()
    }

    fn print(&mut self, text: &str) {
        self.output.extend(text.as_bytes());
        self.output.extend(b"\r\n");
    }

    fn run(&mut self, statement: &str) {
        assert!(
            statement.len() <= self.max_line_length,
            "device line buffer overflow: {} bytes",
            statement.len()
        );

        if let Err(msg) = self.eval(statement) {
            self.print(&format!("stdin:1: {}", msg));
        }
        self.output.extend(b"> ");
    }

    fn eval(&mut self, s: &str) -> Result<(), String> {
        let mut flash = self.flash.lock().unwrap();
        let exists = |flash: &[(String, Vec<u8>)], name: &str| flash.iter().any(|(n, _)| n == name);

        if s == "]]" {
            return Err("unexpected symbol near ']'".into());
        } else if s == "print('@@'..'sync')" {
            drop(flash);
            self.print("@@sync");
        } else if s == "=node.info()" {
            drop(flash);
            self.print("1\t4\t0\t1234\t4321\t4096\t2\t40000000");
        } else if s == "file.close()" {
            self.open = None;
        } else if s == "file.format()" {
            flash.clear();
            self.open = None;
        } else if let Some(rest) = s.strip_prefix("assert(file.open(") {
            let (name, rest) = take_literal(rest);
            if rest == ",'w'),'cannot open for writing')" {
                match flash.iter_mut().find(|(n, _)| *n == name) {
                    Some((_, data)) => data.clear(),
                    None => flash.push((name.clone(), Vec::new())),
                }
                self.open = Some((name, true, 0));
            } else if rest == ",'r'),'no such file')" {
                if !exists(flash.as_slice(), &name) {
                    return Err("no such file".into());
                }
                self.open = Some((name, false, 0));
            } else {
                panic!("unexpected open: {}", s);
            }
        } else if let Some(rest) = s.strip_prefix("assert(file.write(") {
            let (chunk, rest) = take_literal_bytes(rest);
            assert_eq!(rest, "),'write failed')");
            let Some((name, true, _)) = &self.open else {
                return Err("write failed".into());
            };
            let entry = flash.iter_mut().find(|(n, _)| n == name).unwrap();
            entry.1.extend_from_slice(&chunk);
        } else if let Some(rest) = s.strip_prefix("print(\"'\"..(file.read(") {
            let block: usize = rest.split(')').next().unwrap().parse().unwrap();
            let Some((name, false, pos)) = self.open.clone() else {
                return Err("attempt to read a closed file".into());
            };
            let data = &flash.iter().find(|(n, _)| *n == name).unwrap().1;
            let end = (pos + block).min(data.len());
            let chunk = data[pos..end].to_vec();
            self.open = Some((name, false, end));
            drop(flash);
            self.print(&device_escape(&chunk));
        } else if s.starts_with("for n,s in pairs(file.list()) do print(") {
            let lines: Vec<String> = flash
                .iter()
                .map(|(n, d)| format!("{}\t{}", device_escape(n.as_bytes()), d.len()))
                .collect();
            drop(flash);
            for line in lines {
                self.print(&line);
            }
        } else if let Some(rest) = s.strip_prefix("assert(file.list()[") {
            let (name, rest) = take_literal(rest);
            if !exists(flash.as_slice(), &name) {
                return Err("no such file".into());
            }
            let rest = rest.strip_prefix("],'no such file') ").unwrap();
            if rest.starts_with("file.remove(") {
                flash.retain(|(n, _)| *n != name);
            } else if rest.starts_with("local ok,e=pcall(dofile,") {
                drop(flash);
                self.print("hello from the script");
            } else {
                panic!("unexpected statement: {}", s);
            }
        } else if let Some(rest) = s.strip_prefix("local l=file.list() assert(l[") {
            let (src, rest) = take_literal(rest);
            let rest = rest.strip_prefix("],'no such file') assert(not l[").unwrap();
            let (dst, _) = take_literal(rest);
            if !exists(flash.as_slice(), &src) {
                return Err("no such file".into());
            }
            if exists(flash.as_slice(), &dst) {
                return Err("destination exists".into());
            }
            flash.iter_mut().find(|(n, _)| *n == src).unwrap().0 = dst;
        } else {
            panic!("unexpected statement: {}", s);
        }
        Ok(())
    }
}

/// What the device-side escape expression prints for `bytes`.
#[cfg(test)]
fn device_escape(bytes: &[u8]) -> String {
    let mut out = String::from("'");
    for &b in bytes {
        if b.is_ascii_alphanumeric() || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{:03}", b));
        }
    }
    out.push('\'');
    out
}

/// Split a leading single-quoted literal off `s`, returning its decoded
/// bytes and the remaining text.
#[cfg(test)]
fn take_literal_bytes(s: &str) -> (Vec<u8>, &str) {
    let bytes = s.as_bytes();
    assert_eq!(bytes[0], b'\'');
    let mut i = 1;
    while bytes[i] != b'\'' {
        i += if bytes[i] == b'\\' { 2 } else { 1 };
    }
    let literal = &s[..=i];
    (crate::codec::decode(literal).unwrap(), &s[i + 1..])
}

#[cfg(test)]
fn take_literal(s: &str) -> (String, &str) {
    let (bytes, rest) = take_literal_bytes(s);
    (String::from_utf8(bytes).unwrap(), rest)
}

#[cfg(test)]
impl SerialPort for SimulatedDevice {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &b in buf {
            self.output.push_back(b);
            self.line.push(b);
            if self.line.ends_with(b"\r\n") {
                self.line.truncate(self.line.len() - 2);
                let statement = String::from_utf8(std::mem::take(&mut self.line)).unwrap();
                self.run(&statement);
            }
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        if self.output.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle"));
        }
        let n = buf.len().min(self.output.len());
        for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
