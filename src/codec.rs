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

//! Lua string literals for carrying arbitrary bytes over the REPL.
//!
//! Outgoing bytes become a single-quoted literal where printable ASCII is
//! kept as-is and everything else is a three digit decimal escape (`\ddd`).
//! Decimal escapes are understood by both the Lua 5.1 and 5.3 firmware
//! builds. The decoder accepts any literal the interpreter itself would.

use crate::error::{Error, Result};

/// Longest encoding of a single byte (`\255`)
pub const MAX_ESCAPE_LEN: usize = 4;

/// The two quote characters around every literal
pub const QUOTE_OVERHEAD: usize = 2;

/// Upper bound on `encode(bytes).len()` for any payload of `len` bytes.
pub fn worst_case_len(len: usize) -> usize {
    len * MAX_ESCAPE_LEN + QUOTE_OVERHEAD
}

pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + QUOTE_OVERHEAD);
    out.push('\'');
    for &b in bytes {
        match b {
            b'\'' => out.push_str("\\'"),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\{:03}", b)),
        }
    }
    out.push('\'');
    out
}

pub fn decode(literal: &str) -> Result<Vec<u8>> {
    let raw = literal.as_bytes();
    let quote = match raw.first() {
        Some(&q @ (b'\'' | b'"')) => q,
        _ => return Err(Error::protocol(format!("not a string literal: {:?}", literal))),
    };
    if raw.len() < 2 || raw[raw.len() - 1] != quote {
        return Err(Error::protocol(format!("unterminated string literal: {:?}", literal)));
    }

    let body = &raw[1..raw.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        i += 1;
        if b == quote || b == b'\n' {
            return Err(Error::protocol(format!("unescaped {:?} inside literal", b as char)));
        }
        if b != b'\\' {
            out.push(b);
            continue;
        }

        let Some(&esc) = body.get(i) else {
            return Err(Error::protocol("literal ends in a lone backslash"));
        };
        i += 1;
        let value = match esc {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0C,
            b'n' | b'\n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0B,
            b'\\' | b'"' | b'\'' => esc,
            b'x' => {
                let hex = body
                    .get(i..i + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| Error::protocol("bad \\x escape in literal"))?;
                i += 2;
                hex
            }
            b'0'..=b'9' => {
                let mut value = u32::from(esc - b'0');
                let mut digits = 1;
                while digits < 3 {
                    match body.get(i) {
                        Some(d) if d.is_ascii_digit() => {
                            value = value * 10 + u32::from(d - b'0');
                            digits += 1;
                            i += 1;
                        }
                        _ => break,
                    }
                }
                u8::try_from(value)
                    .map_err(|_| Error::protocol(format!("decimal escape \\{} out of range", value)))?
            }
            other => {
                return Err(Error::protocol(format!("unknown escape \\{}", other as char)));
            }
        };
        out.push(value);
    }

    Ok(out)
}

/// Lua expression that evaluates, on the device, to the literal text of
/// the string `expr`. Only alphanumerics and spaces survive unescaped, so
/// the printed result is plain ASCII on one line and goes through `decode`.
pub fn device_literal_expr(expr: &str) -> String {
    format!(
        r#""'"..({}):gsub("[^%w ]",function(c) return ("\\%03d"):format(c:byte()) end).."'""#,
        expr
    )
}
