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
use crate::fileops::Version;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serial I/O error: {0}")]
    Transport(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open serial port: {0}")]
    Open(#[from] serialport::Error),

    #[error("no response from device within {0:?}")]
    Timeout(Duration),

    #[error("device error: {0}")]
    Device(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("statement is {len} bytes, device accepts at most {max}")]
    LineTooLong { len: usize, max: usize },

    #[error("session is out of sync with the device prompt")]
    NotReady,

    #[error("device did not come back within {0:?} of restarting")]
    NotResponding(Duration),

    #[error("incompatible firmware version {0} (need >= 1.4 and < 2.0)")]
    IncompatibleVersion(Version),

    #[error("{0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Process exit status for this failure kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Transport(_) | Error::Open(_) => 2,
            Error::Timeout(_) | Error::NotReady => 3,
            Error::Device(_) => 4,
            Error::Protocol(_) | Error::LineTooLong { .. } => 5,
            Error::Usage(_) => 6,
            Error::Io(_) => 1,
            Error::NotResponding(_) => 7,
            Error::IncompatibleVersion(_) => 8,
        }
    }
}
