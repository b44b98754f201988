//! # Command-Line Interface Module
//!
//! Argument parsing for the `driftlink` binary, built on `clap`'s derive API.
//! Three subcommands cover the external interface in `spec.md` §6: `serve`
//! (run the SOCKS4/4a and SOCKS5 back-ends over a chosen transport binding),
//! `socks` (run the local SOCKS front-end), and `servers` (list servers, or
//! one server's capabilities).

use std::path::PathBuf;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Styles};
use clap::{Parser, Subcommand, ValueEnum};

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Driftlink — tunnels TCP over a shared store-and-forward medium (a folder,
/// an FTP directory, an IMAP mailbox) and exposes a SOCKS4/4a/5 proxy on top.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Silence all user-facing informational output on stdout.
    ///
    /// Diagnostic logs on stderr are unaffected; useful when scripting or
    /// piping a server's lifetime into a supervisor.
    #[arg(short = 'q', long, global = true, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: info
    ///  -vv: debug
    ///  -vvv: trace
    /// By default, only WARNING and ERROR messages are shown.
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Where to write detailed diagnostic logs: a file path, or "stderr" to
    /// skip file logging entirely. Defaults to a daily-rotating file.
    #[arg(long, global = true, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a server: publish capabilities and dispatch SOCKS4/4a and SOCKS5
    /// sessions over the chosen transport binding.
    Serve(ServeArgs),

    /// Run the local SOCKS front-end, proxying accepted TCP connections to
    /// a remote server's `socks`/`socks5` capability.
    Socks(SocksArgs),

    /// List servers currently advertising a capability record, or (with
    /// `--rid`) one server's advertised capability names.
    Servers(ServersArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct TransportArgs {
    /// Blob transport binding to carry sessions over.
    #[arg(long, value_enum, default_value_t = TransportChoice::Folder, help_heading = "Transport")]
    pub transport: TransportChoice,

    /// Root directory for the folder transport binding.
    #[arg(long, help_heading = "Transport")]
    pub root: Option<PathBuf>,

    /// IMAP/FTP host for the mailbox/ftp transport bindings.
    #[arg(long, help_heading = "Transport")]
    pub host: Option<String>,

    /// IMAP/FTP port.
    #[arg(long, help_heading = "Transport")]
    pub port: Option<u16>,

    /// IMAP/FTP username.
    #[arg(long, help_heading = "Transport")]
    pub username: Option<String>,

    /// Poll interval for this binding (e.g. "100ms", "2s"). Defaults to the
    /// binding's own default (`spec.md` §5's `LOOP_SLEEP`).
    #[arg(long, value_parser = parse_duration, help_heading = "Transport")]
    pub poll_interval: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransportChoice {
    Folder,
    Imap,
    Ftp,
}

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub transport: TransportArgs,

    /// This server's peer identifier (`rid`).
    #[arg(long)]
    pub rid: String,

    /// Time-to-live for broadcast (`recipient = ANY`) blobs before the
    /// folder transport's reaper deletes them.
    #[arg(long, value_parser = parse_duration, default_value = "24h", help_heading = "Transport")]
    pub broadcast_ttl: Duration,
}

#[derive(Parser, Debug, Clone)]
pub struct SocksArgs {
    #[command(flatten)]
    pub transport: TransportArgs,

    /// This client's peer identifier (`cid`).
    #[arg(long)]
    pub cid: String,

    /// The remote server's peer identifier to proxy through.
    #[arg(long)]
    pub rid: String,

    /// Local TCP port the SOCKS front-end listens on.
    #[arg(long, default_value_t = 1080)]
    pub listen_port: u16,

    /// Speak SOCKS5 instead of SOCKS4/4a.
    #[arg(long)]
    pub socks5: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ServersArgs {
    #[command(flatten)]
    pub transport: TransportArgs,

    /// A client identifier to discover servers under (no session is
    /// opened; only the transport's directory/capability listing is read).
    #[arg(long, default_value = "driftlink-cli")]
    pub cid: String,

    /// List this server's advertised capabilities instead of every
    /// server's `rid`.
    #[arg(long)]
    pub rid: Option<String>,
}

/// Parse duration from string (e.g., "10s", "5m", "1h").
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str.parse().map_err(|_| format!("invalid number in duration: {num_str}"))?;
    if num < 0.0 {
        return Err("duration cannot be negative".to_string());
    }

    Ok(match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("invalid duration unit: {unit}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn parses_serve_subcommand() {
        let args = Args::parse_from(["driftlink", "serve", "--rid", "server1", "--root", "/tmp/blobs"]);
        match args.command {
            Command::Serve(serve) => {
                assert_eq!(serve.rid, "server1");
                assert_eq!(serve.transport.root, Some(PathBuf::from("/tmp/blobs")));
            }
            other => panic!("expected Serve, got {other:?}"),
        }
    }

    #[test]
    fn parses_socks_subcommand_with_socks5_flag() {
        let args = Args::parse_from([
            "driftlink", "socks", "--cid", "c1", "--rid", "s1", "--root", "/tmp/blobs", "--socks5",
            "--listen-port", "1090",
        ]);
        match args.command {
            Command::Socks(socks) => {
                assert!(socks.socks5);
                assert_eq!(socks.listen_port, 1090);
            }
            other => panic!("expected Socks, got {other:?}"),
        }
    }
}
