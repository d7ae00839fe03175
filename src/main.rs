// ============================================================================
// ctnetlink - Conntrack Command Line Tool
// ============================================================================
//
// Commands:
//   update-timeout <proto> <src> <sport> <dst> <dport> <timeout_secs>
//       Replace the timeout of the IPv4 conntrack entry matching the flow
//   monitor [--config <file.json>]
//       Print conntrack NEW/UPDATE/DESTROY events as JSON lines
//
// Both commands need CAP_NET_ADMIN. Logs go to stderr and follow RUST_LOG
// (default "info"); stdout only carries event JSON.
//
// ============================================================================

use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ctnetlink::SocketConfig;

#[cfg(all(target_os = "linux", feature = "netlink"))]
use ctnetlink::{
    ConntrackError, ConntrackEvent, ConntrackMonitor, ConntrackRecord, NetlinkSocket,
    update_conntrack_timeout,
};

const USAGE: &str = "\
Usage:
  ctnetlink update-timeout <proto> <src> <sport> <dst> <dport> <timeout_secs>
  ctnetlink monitor [--config <file.json>]";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),

    #[error("Invalid {what}: {value:?}")]
    InvalidArgument { what: &'static str, value: String },

    #[error("Cannot read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transport(Box<dyn std::error::Error + Send + Sync>),

    #[error("Cannot write event: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Cannot install Ctrl-C handler: {0}")]
    Signal(String),

    #[error("Netlink transport not available on this platform")]
    Unsupported,
}

#[cfg(all(target_os = "linux", feature = "netlink"))]
impl From<ConntrackError> for CliError {
    fn from(err: ConntrackError) -> Self {
        Self::Transport(Box::new(err))
    }
}

// ============================================================================
// ARGUMENT PARSING
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Command {
    UpdateTimeout {
        proto: u8,
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        timeout_secs: u32,
    },
    Monitor {
        config: Option<PathBuf>,
    },
}

fn parse_value<T: std::str::FromStr>(what: &'static str, value: &str) -> Result<T, CliError> {
    value.parse().map_err(|_| CliError::InvalidArgument {
        what,
        value: value.to_string(),
    })
}

fn parse_args(args: &[String]) -> Result<Command, CliError> {
    let usage = || CliError::Usage(USAGE.to_string());

    match args.first().map(String::as_str) {
        Some("update-timeout") => {
            let [proto, src, sport, dst, dport, timeout] = &args[1..] else {
                return Err(usage());
            };
            Ok(Command::UpdateTimeout {
                proto: parse_value("protocol number", proto)?,
                src: parse_value("source address", src)?,
                sport: parse_value("source port", sport)?,
                dst: parse_value("destination address", dst)?,
                dport: parse_value("destination port", dport)?,
                timeout_secs: parse_value("timeout", timeout)?,
            })
        }
        Some("monitor") => match &args[1..] {
            [] => Ok(Command::Monitor { config: None }),
            [flag, path] if flag == "--config" => Ok(Command::Monitor {
                config: Some(PathBuf::from(path)),
            }),
            _ => Err(usage()),
        },
        _ => Err(usage()),
    }
}

/// Load the monitor configuration; without a file, or with an empty
/// `groups` list, all three conntrack event groups are joined
///
/// The receive timeout is at least one second: the monitor loop only
/// notices Ctrl+C between receives.
fn load_config(path: Option<&PathBuf>) -> Result<SocketConfig, CliError> {
    let Some(path) = path else {
        return Ok(SocketConfig::conntrack_events());
    };

    let text = std::fs::read_to_string(path).map_err(|source| CliError::ConfigRead {
        path: path.clone(),
        source,
    })?;
    let mut config: SocketConfig =
        serde_json::from_str(&text).map_err(|source| CliError::ConfigParse {
            path: path.clone(),
            source,
        })?;

    if config.groups.is_empty() {
        config.groups = SocketConfig::conntrack_events().groups;
    }
    if config.recv_timeout_secs == 0 {
        tracing::warn!("recv_timeout_secs = 0 would block shutdown, using 1");
        config.recv_timeout_secs = 1;
    }
    Ok(config)
}

// ============================================================================
// COMMANDS
// ============================================================================

/// One line of `monitor` output
#[cfg(all(target_os = "linux", feature = "netlink"))]
#[derive(serde::Serialize)]
struct EventLine<'a> {
    event: ConntrackEvent,
    record: &'a ConntrackRecord,
}

#[cfg(all(target_os = "linux", feature = "netlink"))]
fn run(command: Command) -> Result<(), CliError> {
    use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::io::Write;
    use std::sync::Arc;
    use tracing::info;

    match command {
        Command::UpdateTimeout {
            proto,
            src,
            sport,
            dst,
            dport,
            timeout_secs,
        } => {
            let socket =
                NetlinkSocket::new(&SocketConfig::default()).map_err(ConntrackError::from)?;
            update_conntrack_timeout(&socket, proto, src, sport, dst, dport, timeout_secs)?;
            info!("{src}:{sport} -> {dst}:{dport} (proto {proto}) timeout set to {timeout_secs}s");
            Ok(())
        }
        Command::Monitor { config } => {
            let config = load_config(config.as_ref())?;
            let mut monitor = ConntrackMonitor::subscribe(&config)?;
            info!(groups = ?config.groups, "monitoring conntrack events, Ctrl+C to stop");

            // The receive timeout bounds how long a shutdown request waits
            let running = Arc::new(AtomicBool::new(true));
            let r = Arc::clone(&running);
            ctrlc::set_handler(move || r.store(false, AtomicOrdering::SeqCst))
                .map_err(|e| CliError::Signal(e.to_string()))?;

            let stdout = std::io::stdout();
            while running.load(AtomicOrdering::SeqCst) {
                let batch = monitor.next_batch()?;
                let mut out = stdout.lock();
                for (event, record) in batch {
                    let line = EventLine {
                        event,
                        record: &record,
                    };
                    serde_json::to_writer(&mut out, &line)?;
                    // A closed pipe ends the monitor like Ctrl+C
                    if writeln!(out).and_then(|()| out.flush()).is_err() {
                        return Ok(());
                    }
                }
            }

            info!("monitor stopped");
            Ok(())
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "netlink")))]
fn run(command: Command) -> Result<(), CliError> {
    if let Command::Monitor { config } = &command {
        load_config(config.as_ref())?;
    }
    Err(CliError::Unsupported)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();

    let result = parse_args(&args).and_then(run);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(usage)) => {
            eprintln!("{usage}");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_update_timeout() {
        let command = parse_args(&args(&[
            "update-timeout",
            "6",
            "192.168.80.12",
            "62449",
            "140.112.8.116",
            "433",
            "120",
        ]))
        .expect("valid arguments");

        assert_eq!(
            command,
            Command::UpdateTimeout {
                proto: 6,
                src: Ipv4Addr::new(192, 168, 80, 12),
                sport: 62449,
                dst: Ipv4Addr::new(140, 112, 8, 116),
                dport: 433,
                timeout_secs: 120,
            }
        );
    }

    #[test]
    fn test_parse_invalid_port() {
        let result = parse_args(&args(&[
            "update-timeout",
            "17",
            "10.0.0.1",
            "70000",
            "10.0.0.2",
            "53",
            "30",
        ]));
        assert!(matches!(
            result,
            Err(CliError::InvalidArgument { what: "source port", .. })
        ));
    }

    #[test]
    fn test_parse_monitor() {
        assert_eq!(
            parse_args(&args(&["monitor"])).ok(),
            Some(Command::Monitor { config: None })
        );
        assert_eq!(
            parse_args(&args(&["monitor", "--config", "ct.json"])).ok(),
            Some(Command::Monitor {
                config: Some(PathBuf::from("ct.json"))
            })
        );
    }

    #[test]
    fn test_parse_usage_errors() {
        assert!(matches!(parse_args(&[]), Err(CliError::Usage(_))));
        assert!(matches!(
            parse_args(&args(&["update-timeout", "6"])),
            Err(CliError::Usage(_))
        ));
        assert!(matches!(
            parse_args(&args(&["monitor", "--verbose"])),
            Err(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_default_config_joins_event_groups() {
        let config = load_config(None).expect("default config");
        assert_eq!(config.group_mask(), 0b111);
    }

    #[test]
    fn test_config_zero_timeout_raised() {
        let path = env::temp_dir().join(format!("ctnetlink-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "recv_timeout_secs": 0, "groups": [3] }"#)
            .expect("write temp config");

        let config = load_config(Some(&path));
        let _ = std::fs::remove_file(&path);

        let config = config.expect("valid config");
        assert_eq!(config.recv_timeout_secs, 1);
        assert_eq!(config.groups, vec![3]);
    }

    #[test]
    fn test_missing_config_file() {
        let path = PathBuf::from("/nonexistent/ctnetlink.json");
        assert!(matches!(
            load_config(Some(&path)),
            Err(CliError::ConfigRead { .. })
        ));
    }
}
