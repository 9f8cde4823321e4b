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

//! NodeMCU REPL constants and per-session settings

use std::time::Duration;

/// Ready prompt printed by the interpreter when it waits for a statement
pub const PROMPT: &str = "> ";

/// Prompt printed when the interpreter expects the rest of an incomplete statement
pub const CONTINUATION_PROMPT: &str = ">> ";

/// Prefix of a runtime error raised by a statement typed at the prompt
pub const STDIN_ERROR: &str = "stdin:";

/// Prefix newer firmware puts in front of uncaught errors
pub const LUA_ERROR: &str = "Lua error:";

/// Line terminator the interpreter executes a statement on
pub const LINE_TERMINATOR: &str = "\r\n";

/// Text that appears in the boot banner after a restart
pub const BANNER: &str = "NodeMCU";

/// Longest statement the stock firmware line buffer accepts, terminator excluded
pub const MAX_LINE_LENGTH: usize = 250;

/// Most bytes accepted after a statement before giving up on its prompt
pub const MAX_RESPONSE_LENGTH: usize = 64 * 1024;

/// Bytes requested per `file.read` when downloading
pub const READ_BLOCK: usize = 64;

/// Idle timeout for an ordinary statement
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Idle timeout for `file.format()`, which erases the whole flash
pub const FORMAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on the wait for the banner and prompt after `node.restart()`
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(10);

/// Firmware builds differ in prompt text, buffer size and speed, so every
/// device-specific constant is carried here rather than hard-coded.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub prompt: String,
    pub continuation: String,
    pub error_markers: Vec<String>,
    pub line_terminator: String,
    pub max_line_length: usize,
    pub max_response_length: usize,
    pub read_block: usize,
    pub timeout: Duration,
    pub format_timeout: Duration,
    pub restart_timeout: Duration,
    pub banner: String,
    pub echo: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            prompt: PROMPT.to_string(),
            continuation: CONTINUATION_PROMPT.to_string(),
            error_markers: vec![STDIN_ERROR.to_string(), LUA_ERROR.to_string()],
            line_terminator: LINE_TERMINATOR.to_string(),
            max_line_length: MAX_LINE_LENGTH,
            max_response_length: MAX_RESPONSE_LENGTH,
            read_block: READ_BLOCK,
            timeout: TIMEOUT,
            format_timeout: FORMAT_TIMEOUT,
            restart_timeout: RESTART_TIMEOUT,
            banner: BANNER.to_string(),
            echo: true,
        }
    }
}
