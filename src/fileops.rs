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

use std::fmt;
use tracing::debug;
use crate::codec;
use crate::error::{Error, Result};
use crate::protocol::SessionConfig;
use crate::session::Session;
use crate::transfer;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

/// Directory listing in the order the device reported it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub entries: Vec<FileEntry>,
}

impl Listing {
    pub fn total_files(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const MIN_SUPPORTED: Version = Version { major: 1, minor: 4 };
    pub const FIRST_UNSUPPORTED: Version = Version { major: 2, minor: 0 };

    pub fn is_supported(&self) -> bool {
        (Self::MIN_SUPPORTED..Self::FIRST_UNSUPPORTED).contains(self)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ============================================================================
// Statements
// ============================================================================

fn lit(name: &str) -> String {
    codec::encode(name.as_bytes())
}

fn list_statement() -> String {
    format!(
        r#"for n,s in pairs(file.list()) do print({}.."\t"..s) end"#,
        codec::device_literal_expr("n")
    )
}

fn remove_statement(name: &str) -> String {
    let name = lit(name);
    format!("assert(file.list()[{name}],'no such file') file.remove({name})")
}

fn rename_statement(src: &str, dst: &str) -> String {
    let (src, dst) = (lit(src), lit(dst));
    format!(
        "local l=file.list() assert(l[{src}],'no such file') \
         assert(not l[{dst}],'destination exists') \
         assert(file.rename({src},{dst}),'rename failed')"
    )
}

fn dofile_statement(name: &str) -> String {
    let name = lit(name);
    // error() at the prompt prefixes "stdin:1:", so script errors hit the marker
    format!("assert(file.list()[{name}],'no such file') local ok,e=pcall(dofile,{name}) if not ok then error(e) end")
}

const VERSION_STATEMENT: &str = "=node.info()";
const FORMAT_STATEMENT: &str = "file.format()";
const RESTART_STATEMENT: &str = "node.restart()";

/// Fail before connecting when a statement every session may need cannot
/// fit on one device line. Name-bearing statements are checked per call.
pub fn check_line_limit(config: &SessionConfig) -> Result<()> {
    transfer::chunk_capacity(config.max_line_length)?;
    let fixed = [
        list_statement(),
        transfer::read_block_statement(config.read_block),
        VERSION_STATEMENT.to_string(),
        FORMAT_STATEMENT.to_string(),
    ];
    match fixed.iter().map(String::len).max() {
        Some(len) if len > config.max_line_length => {
            Err(Error::LineTooLong { len, max: config.max_line_length })
        }
        _ => Ok(()),
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Accepts either a dotted `major.minor` anywhere in the text
/// (`NodeMCU 1.4`) or `node.info()` output, whose first two fields are the
/// major and minor numbers.
pub fn parse_version(text: &str) -> Result<Version> {
    let dotted = text.split_whitespace().find_map(|token| {
        let token = token.trim_start_matches(|c: char| !c.is_ascii_digit());
        let (major, rest) = token.split_once('.')?;
        let minor: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        Some(Version { major: major.parse().ok()?, minor: minor.parse().ok()? })
    });
    if let Some(version) = dotted {
        return Ok(version);
    }

    let mut numbers = text.split_whitespace().map(str::parse::<u32>);
    match (numbers.next(), numbers.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => Ok(Version { major, minor }),
        _ => Err(Error::protocol(format!("malformed version string: {:?}", text))),
    }
}

/// One listing line: the escaped name literal, a tab, the size in bytes.
pub fn parse_listing_line(line: &str) -> Result<FileEntry> {
    let malformed = || Error::protocol(format!("malformed listing line: {:?}", line));
    let (name, size) = line.rsplit_once('\t').ok_or_else(malformed)?;
    let name = codec::decode(name).map_err(|_| malformed())?;
    let size = size.trim().parse().map_err(|_| malformed())?;
    Ok(FileEntry {
        name: String::from_utf8_lossy(&name).into_owned(),
        size,
    })
}

// ============================================================================
// NodeMcu
// ============================================================================

/// File system operations on a NodeMCU board reached through its REPL.
pub struct NodeMcu {
    session: Session,
}

impl NodeMcu {
    pub fn new(session: Session) -> Self {
        NodeMcu { session }
    }

    /// Bring the session to a known prompt.
    pub fn sync(&mut self) -> Result<()> {
        self.session.sync()
    }

    pub fn get_version(&mut self) -> Result<Version> {
        let timeout = self.session.config().timeout;
        let text = self.session.execute(VERSION_STATEMENT)?.into_text(timeout)?;
        let version = parse_version(&text)?;
        debug!(%version, "firmware version");
        Ok(version)
    }

    pub fn list(&mut self) -> Result<Listing> {
        let timeout = self.session.config().timeout;
        let text = self.session.execute(&list_statement())?.into_text(timeout)?;
        let entries = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_listing_line)
            .collect::<Result<Vec<_>>>()?;
        Ok(Listing { entries })
    }

    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        transfer::download(&mut self.session, name)
    }

    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        transfer::upload(&mut self.session, name, data)
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        let timeout = self.session.config().timeout;
        self.session.execute(&remove_statement(name))?.into_echo_only(timeout)
    }

    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let timeout = self.session.config().timeout;
        self.session.execute(&rename_statement(src, dst))?.into_echo_only(timeout)
    }

    /// Erase the whole file system. Runs under the longer format timeout.
    pub fn format(&mut self) -> Result<()> {
        let timeout = self.session.config().format_timeout;
        self.session
            .execute_with_timeout(FORMAT_STATEMENT, timeout)?
            .into_echo_only(timeout)
    }

    /// Run a script stored on the device, returning what it printed.
    pub fn dofile(&mut self, name: &str) -> Result<String> {
        let timeout = self.session.config().timeout;
        self.session.execute(&dofile_statement(name))?.into_text(timeout)
    }

    pub fn restart(&mut self) -> Result<()> {
        self.session.restart(RESTART_STATEMENT)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use crate::serial::{MockSerialPort, SerialPort, SimulatedDevice, SimulatedFlash};

    const SYNC: (&str, &[u8]) = ("print('@@'..'sync')", b"@@sync\r\n> ");

    fn simulated() -> (NodeMcu, SimulatedFlash) {
        let device = SimulatedDevice::new();
        let flash = device.flash();
        let mut node = NodeMcu::new(Session::new(Box::new(device), SessionConfig::default()));
        node.sync().unwrap();
        (node, flash)
    }

    fn scripted(exchanges: &[(&str, &[u8])]) -> NodeMcu {
        let session = Session::new(Box::new(MockSerialPort::repl(exchanges)), SessionConfig::default());
        let mut node = NodeMcu::new(session);
        node.sync().unwrap();
        node
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("NodeMCU 1.4").unwrap(), Version { major: 1, minor: 4 });
        assert_eq!(parse_version("1\t4\t1234\t4321").unwrap(), Version { major: 1, minor: 4 });
        assert_eq!(
            parse_version("NodeMCU 3.0.0.0 built with Lua 5.1.4").unwrap(),
            Version { major: 3, minor: 0 }
        );
        assert_eq!(parse_version("ESP8266 NodeMCU v1.5").unwrap(), Version { major: 1, minor: 5 });
        for bad in ["", "NodeMCU", "NodeMCU x.y", "1", "a\tb"] {
            assert!(matches!(parse_version(bad), Err(Error::Protocol(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_version_support_window() {
        for (major, minor, ok) in [(0, 0, false), (1, 3, false), (1, 4, true), (1, 9, true), (2, 0, false), (2, 5, false)] {
            assert_eq!(Version { major, minor }.is_supported(), ok, "{}.{}", major, minor);
        }
    }

    #[test]
    fn test_parse_listing_line() {
        assert_eq!(
            parse_listing_line("'foo\\046txt'\t123").unwrap(),
            FileEntry { name: "foo.txt".into(), size: 123 }
        );
        assert_eq!(
            parse_listing_line("'\\009\\046tab'\t0").unwrap(),
            FileEntry { name: "\t.tab".into(), size: 0 }
        );
        for bad in ["foo.txt 123", "'foo'\tabc", "foo\t1", "'foo'"] {
            assert!(matches!(parse_listing_line(bad), Err(Error::Protocol(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_get_version_over_the_wire() {
        let mut node = scripted(&[SYNC, ("=node.info()", b"1\t4\t1234\t4321\r\n> ")]);
        assert_eq!(node.get_version().unwrap(), Version { major: 1, minor: 4 });
    }

    #[test]
    fn test_get_version_malformed_is_protocol_error() {
        let mut node = scripted(&[SYNC, ("=node.info()", b"garbage\r\n> ")]);
        assert!(matches!(node.get_version(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_list_empty() {
        let (mut node, _flash) = simulated();
        let listing = node.list().unwrap();
        assert_eq!(listing.total_files(), 0);
        assert_eq!(listing.total_bytes(), 0);
    }

    #[test]
    fn test_list_after_single_write() {
        let (mut node, _flash) = simulated();
        let data = b"print('hello')\n".to_vec();
        node.write("main.lua", &data).unwrap();
        assert_eq!(
            node.list().unwrap().entries,
            vec![FileEntry { name: "main.lua".into(), size: data.len() as u64 }]
        );
    }

    #[test]
    fn test_list_totals_and_odd_names() {
        let (mut node, _flash) = simulated();
        node.write("a.txt", &[1; 123]).unwrap();
        node.write("\t.tab", &[]).unwrap();
        node.write("b c'd", &[2; 321]).unwrap();
        let listing = node.list().unwrap();
        assert_eq!(listing.total_files(), 3);
        assert_eq!(listing.total_bytes(), 444);
        assert!(listing.contains("\t.tab"));
        assert!(listing.contains("b c'd"));
    }

    #[test]
    fn test_delete() {
        let (mut node, flash) = simulated();
        node.write("x.lua", b"x").unwrap();
        node.delete("x.lua").unwrap();
        assert!(!node.list().unwrap().contains("x.lua"));
        assert!(flash.lock().unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_is_device_error() {
        let (mut node, _flash) = simulated();
        match node.delete("ghost.lua") {
            Err(Error::Device(msg)) => assert_eq!(msg, "stdin:1: no such file"),
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[test]
    fn test_rename() {
        let (mut node, _flash) = simulated();
        node.write("old.txt", b"contents").unwrap();
        node.rename("old.txt", "new.txt").unwrap();
        assert_eq!(node.read("new.txt").unwrap(), b"contents");
        assert!(matches!(node.read("old.txt"), Err(Error::Device(_))));
    }

    #[test]
    fn test_rename_onto_existing_fails() {
        let (mut node, _flash) = simulated();
        node.write("a", b"1").unwrap();
        node.write("b", b"2").unwrap();
        match node.rename("a", "b") {
            Err(Error::Device(msg)) => assert_eq!(msg, "stdin:1: destination exists"),
            other => panic!("expected device error, got {:?}", other),
        }
        assert_eq!(node.read("a").unwrap(), b"1");
    }

    #[test]
    fn test_format() {
        let (mut node, _flash) = simulated();
        node.write("a", b"1").unwrap();
        node.format().unwrap();
        assert_eq!(node.list().unwrap(), Listing::default());
    }

    /// Simulated device that records the timeout of every read.
    struct TimedDevice {
        device: SimulatedDevice,
        timeouts: Arc<Mutex<Vec<Duration>>>,
    }

    impl SerialPort for TimedDevice {
        fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
            self.device.write_all(buf)
        }

        fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
            self.timeouts.lock().unwrap().push(timeout);
            self.device.read_timeout(buf, timeout)
        }
    }

    #[test]
    fn test_format_waits_with_format_timeout() {
        let timeouts = Arc::new(Mutex::new(Vec::new()));
        let port = TimedDevice { device: SimulatedDevice::new(), timeouts: timeouts.clone() };
        let config = SessionConfig {
            timeout: Duration::from_millis(700),
            format_timeout: Duration::from_secs(45),
            ..SessionConfig::default()
        };
        let mut node = NodeMcu::new(Session::new(Box::new(port), config));
        node.sync().unwrap();

        timeouts.lock().unwrap().clear();
        node.format().unwrap();
        let seen = timeouts.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&t| t == Duration::from_secs(45)), "{:?}", seen);

        timeouts.lock().unwrap().clear();
        node.list().unwrap();
        assert!(timeouts.lock().unwrap().iter().all(|&t| t == Duration::from_millis(700)));
    }

    #[test]
    fn test_check_line_limit() {
        check_line_limit(&SessionConfig::default()).unwrap();
        let short = SessionConfig { max_line_length: 90, ..SessionConfig::default() };
        assert!(transfer::chunk_capacity(90).is_ok());
        match check_line_limit(&short) {
            Err(Error::LineTooLong { len, max: 90 }) => assert!(len > 90),
            other => panic!("expected line too long, got {:?}", other),
        }
        let tiny = SessionConfig { max_line_length: 30, ..SessionConfig::default() };
        assert!(matches!(check_line_limit(&tiny), Err(Error::LineTooLong { max: 30, .. })));
    }

    #[test]
    fn test_dofile_returns_output() {
        let mut node = scripted(&[
            SYNC,
            (
                "assert(file.list()['test.lua'],'no such file') local ok,e=pcall(dofile,'test.lua') if not ok then error(e) end",
                b"hello!\r\nsecond line\r\n> ",
            ),
        ]);
        assert_eq!(node.dofile("test.lua").unwrap(), "hello!\nsecond line");
    }

    #[test]
    fn test_dofile_script_error() {
        let mut node = scripted(&[
            SYNC,
            (
                "assert(file.list()['bad.lua'],'no such file') local ok,e=pcall(dofile,'bad.lua') if not ok then error(e) end",
                b"stdin:1: bad.lua:1: '=' expected near 'x'\r\n> ",
            ),
        ]);
        match node.dofile("bad.lua") {
            Err(Error::Device(msg)) => assert_eq!(msg, "stdin:1: bad.lua:1: '=' expected near 'x'"),
            other => panic!("expected device error, got {:?}", other),
        }
    }

    #[test]
    fn test_dofile_on_simulated_device() {
        let (mut node, _flash) = simulated();
        node.write("init.lua", b"print('hello from the script')").unwrap();
        assert_eq!(node.dofile("init.lua").unwrap(), "hello from the script");
    }

    #[test]
    fn test_dofile_missing() {
        let (mut node, _flash) = simulated();
        assert!(matches!(node.dofile("test.lua"), Err(Error::Device(_))));
    }

    #[test]
    fn test_restart() {
        let mut node = scripted(&[
            SYNC,
            ("node.restart()", b"> \xDE\xAD\r\n\r\nNodeMCU 1.5.4 build\r\n> "),
        ]);
        node.restart().unwrap();
        assert_eq!(node.session.state(), crate::session::SessionState::Ready);
    }
}
