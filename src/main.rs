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

// File access for NodeMCU boards over the Lua REPL
mod codec;
mod error;
mod fileops;
mod protocol;
mod serial;
mod session;
mod transfer;

use std::io::{Read, Write};
use std::time::Duration;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use error::{Error, Result};
use fileops::{Listing, NodeMcu};
use protocol::SessionConfig;
use serial::RealSerialPort;
use session::Session;

#[derive(Parser)]
#[command(name = "nodemcu-fs")]
#[command(about = "Access files on an ESP8266 running NodeMCU", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (default: first detected, USB adapters first)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Idle timeout for ordinary statements
    #[arg(long, default_value = "2000", value_name = "MS")]
    timeout: u64,

    /// Idle timeout while the flash is being formatted
    #[arg(long, default_value = "60000", value_name = "MS")]
    format_timeout: u64,

    /// How long to wait for the device to come back after a restart
    #[arg(long, default_value = "10000", value_name = "MS")]
    restart_timeout: u64,

    /// Longest statement the device accepts on one line
    #[arg(long, default_value_t = protocol::MAX_LINE_LENGTH, value_name = "BYTES")]
    max_line: usize,

    /// Most output accepted from one statement before giving up on it
    #[arg(long, default_value_t = protocol::MAX_RESPONSE_LENGTH, value_name = "BYTES")]
    max_response: usize,

    /// Bytes fetched per read statement when downloading
    #[arg(long, default_value_t = protocol::READ_BLOCK, value_name = "BYTES")]
    block_size: usize,

    /// Ready prompt printed by the interpreter
    #[arg(long, default_value = protocol::PROMPT)]
    prompt: String,

    /// Line prefix marking an error trace (repeatable; replaces the defaults)
    #[arg(long = "error-marker", value_name = "TEXT")]
    error_markers: Vec<String>,

    /// Text expected in the boot banner after a restart
    #[arg(long, default_value = protocol::BANNER)]
    banner: String,

    /// The firmware does not echo input back
    #[arg(long)]
    no_echo: bool,

    /// Skip the firmware version compatibility check
    #[arg(long)]
    force: bool,

    /// Enable debug output (twice for every byte on the wire)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a file from flash to stdout
    Read {
        /// File on the device
        name: String,
    },
    /// Write stdin to a file in flash, replacing it
    Write {
        /// File on the device
        name: String,
    },
    /// List all files and their sizes in bytes
    #[command(alias = "ls")]
    List,
    /// Delete a file
    #[command(alias = "rm")]
    Delete {
        name: String,
    },
    /// Rename a file
    #[command(alias = "rename")]
    Move {
        old: String,
        new: String,
    },
    /// Format the flash
    Format,
    /// Run a file with dofile() and print its output
    Dofile {
        name: String,
    },
    /// Restart the device and wait for its prompt
    #[command(alias = "reset")]
    Restart,
    /// Print the firmware version
    Version,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            prompt: self.prompt.clone(),
            error_markers: if self.error_markers.is_empty() {
                defaults.error_markers.clone()
            } else {
                self.error_markers.clone()
            },
            max_line_length: self.max_line,
            max_response_length: self.max_response,
            read_block: self.block_size,
            timeout: Duration::from_millis(self.timeout),
            format_timeout: Duration::from_millis(self.format_timeout),
            restart_timeout: Duration::from_millis(self.restart_timeout),
            banner: self.banner.clone(),
            echo: !self.no_echo,
            ..defaults
        }
    }
}

fn init_logging(debug: u8) {
    let level = match debug {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let port = match cli.port.clone().or_else(serial::default_port) {
        Some(port) => port,
        None => return Err(Error::Usage("no serial port found; pass --port".into())),
    };
    if cli.block_size == 0 {
        return Err(Error::Usage("--block-size must be at least 1".into()));
    }
    let config = cli.session_config();
    fileops::check_line_limit(&config)?;

    tracing::info!(%port, baud = cli.baud, "opening serial port");
    let serial_port = RealSerialPort::open(&port, cli.baud)?;
    let mut node = NodeMcu::new(Session::new(Box::new(serial_port), config));

    node.sync()?;
    let version = node.get_version()?;
    if !cli.force && !version.is_supported() {
        return Err(Error::IncompatibleVersion(version));
    }

    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Commands::Read { name } => {
            let data = node.read(&name)?;
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        Commands::Write { name } => {
            let mut data = Vec::new();
            std::io::stdin().lock().read_to_end(&mut data)?;
            node.write(&name, &data)?;
        }
        Commands::List => {
            let listing = node.list()?;
            stdout.write_all(format_listing(&listing).as_bytes())?;
        }
        Commands::Delete { name } => node.delete(&name)?,
        Commands::Move { old, new } => node.rename(&old, &new)?,
        Commands::Format => node.format()?,
        Commands::Dofile { name } => {
            let output = node.dofile(&name)?;
            if !output.is_empty() {
                writeln!(stdout, "{}", output)?;
            }
        }
        Commands::Restart => node.restart()?,
        Commands::Version => writeln!(stdout, "{}", version)?,
    }
    Ok(())
}

fn plural(n: u64, word: &str) -> String {
    format!("{} {}{}", n, word, if n == 1 { "" } else { "s" })
}

/// Summary line, then names padded to a common column.
fn format_listing(listing: &Listing) -> String {
    let mut out = format!(
        "Total: {}, {}.\n",
        plural(listing.total_files() as u64, "file"),
        plural(listing.total_bytes(), "byte")
    );
    let width = listing.entries.iter().map(|e| e.name.chars().count()).max().unwrap_or(0) + 1;
    for entry in &listing.entries {
        out.push_str(&format!("{:<width$} {}\n", entry.name, entry.size, width = width));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileops::FileEntry;

    fn listing(files: &[(&str, u64)]) -> Listing {
        Listing {
            entries: files
                .iter()
                .map(|&(name, size)| FileEntry { name: name.into(), size })
                .collect(),
        }
    }

    #[test]
    fn test_format_listing() {
        assert_eq!(
            format_listing(&listing(&[("a.txt", 123), ("bb.txt", 321)])),
            "Total: 2 files, 444 bytes.\na.txt   123\nbb.txt  321\n"
        );
    }

    #[test]
    fn test_format_listing_singular() {
        assert_eq!(format_listing(&listing(&[("a.txt", 1)])), "Total: 1 file, 1 byte.\na.txt  1\n");
    }

    #[test]
    fn test_format_listing_empty() {
        assert_eq!(format_listing(&Listing::default()), "Total: 0 files, 0 bytes.\n");
    }

    #[test]
    fn test_cli_requires_exactly_one_command() {
        assert!(Cli::try_parse_from(["nodemcu-fs"]).is_err());
        assert!(Cli::try_parse_from(["nodemcu-fs", "format", "restart"]).is_err());
        assert!(Cli::try_parse_from(["nodemcu-fs", "read"]).is_err());
        assert!(Cli::try_parse_from(["nodemcu-fs", "move", "old.txt"]).is_err());
        assert!(Cli::try_parse_from(["nodemcu-fs", "list", "foo"]).is_err());
        assert!(Cli::try_parse_from(["nodemcu-fs", "--baud", "abc", "list"]).is_err());
    }

    #[test]
    fn test_cli_aliases_and_config() {
        let cli = Cli::try_parse_from([
            "nodemcu-fs", "-p", "/dev/null", "-b", "115200", "--timeout", "500",
            "--error-marker", "ERR:", "rename", "a", "b",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Move { ref old, ref new } if old == "a" && new == "b"));
        let config = cli.session_config();
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.error_markers, vec!["ERR:".to_string()]);
        assert_eq!(config.max_line_length, protocol::MAX_LINE_LENGTH);
        assert_eq!(config.max_response_length, protocol::MAX_RESPONSE_LENGTH);
        assert!(config.echo);

        let cli = Cli::try_parse_from(["nodemcu-fs", "ls"]).unwrap();
        assert!(matches!(cli.command, Commands::List));
        assert_eq!(cli.session_config().error_markers.len(), 2);
    }

    #[test]
    fn test_small_max_line_is_rejected_up_front() {
        let cli = Cli::try_parse_from(["nodemcu-fs", "--max-line", "100", "list"]).unwrap();
        let err = fileops::check_line_limit(&cli.session_config()).unwrap_err();
        assert!(matches!(err, Error::LineTooLong { max: 100, .. }));
        assert_eq!(err.exit_code(), 5);
    }
}
