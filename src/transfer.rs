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

//! Moving file content through the device's one-line input buffer.
//!
//! Uploads are split so that even a chunk made entirely of bytes that need
//! the longest escape still fits on one line. Downloads pull fixed-size
//! blocks until the device hands back a short one.

use tracing::{debug, info, warn};
use crate::codec;
use crate::error::{Error, Result};
use crate::session::{Response, Session, SessionState};

const CLOSE: &str = "file.close()";

fn open_write_statement(name: &str) -> String {
    format!("assert(file.open({},'w'),'cannot open for writing')", codec::encode(name.as_bytes()))
}

fn open_read_statement(name: &str) -> String {
    format!("assert(file.open({},'r'),'no such file')", codec::encode(name.as_bytes()))
}

fn write_chunk_statement(literal: &str) -> String {
    format!("assert(file.write({}),'write failed')", literal)
}

pub(crate) fn read_block_statement(block: usize) -> String {
    format!("print({})", codec::device_literal_expr(&format!("file.read({}) or \"\"", block)))
}

/// Largest upload chunk whose write statement fits in `max_line_length`
/// whatever the chunk contains.
pub fn chunk_capacity(max_line_length: usize) -> Result<usize> {
    let overhead = write_chunk_statement("").len();
    let capacity = max_line_length.saturating_sub(overhead + codec::worst_case_len(0)) / codec::MAX_ESCAPE_LEN;
    if capacity == 0 {
        return Err(Error::LineTooLong { len: overhead + codec::worst_case_len(1), max: max_line_length });
    }
    Ok(capacity)
}

/// Write `data` to `name`, replacing any existing file.
pub fn upload(session: &mut Session, name: &str, data: &[u8]) -> Result<()> {
    let capacity = chunk_capacity(session.config().max_line_length)?;
    let timeout = session.config().timeout;

    // A handle left open by an earlier aborted transfer would swallow the open
    session.execute(CLOSE)?.into_echo_only(timeout)?;
    session.execute(&open_write_statement(name))?.into_echo_only(timeout)?;

    let mut chunks = 0;
    for chunk in data.chunks(capacity) {
        let statement = write_chunk_statement(&codec::encode(chunk));
        debug_assert!(statement.len() <= session.config().max_line_length);
        match session.execute(&statement) {
            Ok(Response::EchoOnly) => chunks += 1,
            Ok(other) => {
                abort(session);
                return other.into_echo_only(timeout);
            }
            Err(e) => {
                abort(session);
                return Err(e);
            }
        }
    }

    session.execute(CLOSE)?.into_echo_only(timeout)?;
    info!(name, bytes = data.len(), chunks, "uploaded");
    Ok(())
}

/// Read the whole of `name`.
pub fn download(session: &mut Session, name: &str) -> Result<Vec<u8>> {
    let block = session.config().read_block.max(1);
    let timeout = session.config().timeout;

    session.execute(CLOSE)?.into_echo_only(timeout)?;
    session.execute(&open_read_statement(name))?.into_echo_only(timeout)?;

    let statement = read_block_statement(block);
    let mut data = Vec::new();
    loop {
        let piece = match session.execute(&statement).and_then(|r| read_piece(r, block, timeout)) {
            Ok(piece) => piece,
            Err(e) => {
                abort(session);
                return Err(e);
            }
        };
        debug!(len = piece.len(), "block");
        let last = piece.len() < block;
        data.extend_from_slice(&piece);
        if last {
            break;
        }
    }

    session.execute(CLOSE)?.into_echo_only(timeout)?;
    info!(name, bytes = data.len(), "downloaded");
    Ok(data)
}

fn read_piece(response: Response, block: usize, timeout: std::time::Duration) -> Result<Vec<u8>> {
    let text = match response {
        Response::Value(text) => text,
        other => return Err(other.into_error(timeout)),
    };
    let piece = codec::decode(text.trim_end())?;
    if piece.len() > block {
        return Err(Error::protocol(format!("asked for {} bytes, got {}", block, piece.len())));
    }
    Ok(piece)
}

/// Best effort: release the remote handle if the prompt is still ours.
fn abort(session: &mut Session) {
    if session.state() != SessionState::Ready {
        warn!("transfer aborted with the session out of sync, remote handle left open");
        return;
    }
    if let Err(e) = session.execute(CLOSE) {
        warn!(error = %e, "failed to close remote file after aborted transfer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionConfig;
    use crate::serial::{MockSerialPort, SimulatedDevice, SimulatedFlash};

    const SYNC: (&str, &[u8]) = ("print('@@'..'sync')", b"@@sync\r\n> ");
    const CLOSE_OK: (&str, &[u8]) = ("file.close()", b"> ");

    fn simulated() -> (Session, SimulatedFlash) {
        let device = SimulatedDevice::new();
        let flash = device.flash();
        let mut session = Session::new(Box::new(device), SessionConfig::default());
        session.sync().unwrap();
        (session, flash)
    }

    fn scripted(config: SessionConfig, exchanges: &[(&str, &[u8])]) -> Session {
        let mut session = Session::new(Box::new(MockSerialPort::repl(exchanges)), config);
        session.sync().unwrap();
        session
    }

    #[test]
    fn test_chunk_capacity_is_worst_case() {
        let capacity = chunk_capacity(250).unwrap();
        let worst = vec![0u8; capacity];
        assert!(write_chunk_statement(&codec::encode(&worst)).len() <= 250);
        let over = vec![0u8; capacity + 1];
        assert!(write_chunk_statement(&codec::encode(&over)).len() > 250);
    }

    #[test]
    fn test_chunk_capacity_too_small_line() {
        assert!(matches!(chunk_capacity(30), Err(Error::LineTooLong { max: 30, .. })));
    }

    #[test]
    fn test_read_block_statement() {
        assert_eq!(
            read_block_statement(64),
            r#"print("'"..(file.read(64) or ""):gsub("[^%w ]",function(c) return ("\\%03d"):format(c:byte()) end).."'")"#
        );
    }

    #[test]
    fn test_round_trip_around_chunk_boundaries() {
        let capacity = chunk_capacity(SessionConfig::default().max_line_length).unwrap();
        let block = SessionConfig::default().read_block;
        let (mut session, _flash) = simulated();

        let sizes = [
            0, 1, capacity - 1, capacity, capacity + 1, 3 * capacity,
            block - 1, block, block + 1, 2 * block, 1000,
        ];
        for (i, &size) in sizes.iter().enumerate() {
            let data: Vec<u8> = (0..size).map(|j| ((j * 7 + i) % 256) as u8).collect();
            upload(&mut session, "main.lua", &data).unwrap();
            assert_eq!(download(&mut session, "main.lua").unwrap(), data, "size {}", size);
        }
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_trailing_zero_bytes_survive() {
        let (mut session, flash) = simulated();
        let data = b"abc\0\0\0".to_vec();
        upload(&mut session, "z.bin", &data).unwrap();
        assert_eq!(flash.lock().unwrap()[0].1, data);
        assert_eq!(download(&mut session, "z.bin").unwrap(), data);
    }

    #[test]
    fn test_download_missing_file_is_device_error() {
        let (mut session, _flash) = simulated();
        match download(&mut session, "nope.txt") {
            Err(Error::Device(msg)) => assert_eq!(msg, "stdin:1: no such file"),
            other => panic!("expected device error, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_upload_splits_into_chunks() {
        let config = SessionConfig { max_line_length: 60, ..SessionConfig::default() };
        assert_eq!(chunk_capacity(config.max_line_length).unwrap(), 5);
        let mut session = scripted(config, &[
            SYNC,
            CLOSE_OK,
            ("assert(file.open('t','w'),'cannot open for writing')", b"> "),
            ("assert(file.write('12345'),'write failed')", b"> "),
            ("assert(file.write('6\\0107'),'write failed')", b"> "),
            CLOSE_OK,
        ]);
        upload(&mut session, "t", b"123456\n7").unwrap();
    }

    #[test]
    fn test_upload_aborts_and_closes_on_write_failure() {
        let config = SessionConfig { max_line_length: 60, ..SessionConfig::default() };
        let capacity = chunk_capacity(60).unwrap();
        let data = vec![b'a'; capacity + 1];
        let first = write_chunk_statement(&codec::encode(&data[..capacity]));

        let mut session = scripted(config, &[
            SYNC,
            CLOSE_OK,
            ("assert(file.open('t','w'),'cannot open for writing')", b"> "),
            (&first, b"stdin:1: write failed\r\n> "),
            CLOSE_OK,
        ]);
        match upload(&mut session, "t", &data) {
            Err(Error::Device(msg)) => assert_eq!(msg, "stdin:1: write failed"),
            other => panic!("expected device error, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_upload_timeout_skips_close() {
        let config = SessionConfig { max_line_length: 60, ..SessionConfig::default() };
        let mock = MockSerialPort::repl(&[
            SYNC,
            CLOSE_OK,
            ("assert(file.open('t','w'),'cannot open for writing')", b"> "),
            ("assert(file.write('a'),'write failed')", b""),
        ])
        .then_silence();
        let mut session = Session::new(Box::new(mock), config);
        session.sync().unwrap();
        assert!(matches!(upload(&mut session, "t", b"a"), Err(Error::Timeout(_))));
        assert_eq!(session.state(), SessionState::Unknown);
    }

    #[test]
    fn test_download_reassembles_blocks() {
        let config = SessionConfig { read_block: 2, ..SessionConfig::default() };
        let read = read_block_statement(2);
        let mut session = scripted(config, &[
            SYNC,
            CLOSE_OK,
            ("assert(file.open('t','r'),'no such file')", b"> "),
            (&read, b"'\\001\\002'\r\n> "),
            (&read, b"'\\003'\r\n> "),
            CLOSE_OK,
        ]);
        assert_eq!(download(&mut session, "t").unwrap(), b"\x01\x02\x03");
    }

    #[test]
    fn test_download_rejects_oversized_block() {
        let config = SessionConfig { read_block: 1, ..SessionConfig::default() };
        let read = read_block_statement(1);
        let mut session = scripted(config, &[
            SYNC,
            CLOSE_OK,
            ("assert(file.open('t','r'),'no such file')", b"> "),
            (&read, b"'ab'\r\n> "),
            CLOSE_OK,
        ]);
        assert!(matches!(download(&mut session, "t"), Err(Error::Protocol(_))));
    }
}
