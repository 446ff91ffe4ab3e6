//! Command-line parsing: one pass over argv producing a fully validated
//! [`Options`]. Nothing downstream re-parses or re-validates a flag.

use clap::{App, AppSettings, Arg, ArgMatches, ErrorKind};
use thiserror::Error;

const KEEPALIVE_RANGE: std::ops::RangeInclusive<u32> = 1..=30;
const MTU_RANGE: std::ops::RangeInclusive<usize> = 68..=65535;
const TTL_RANGE: std::ops::RangeInclusive<u8> = 0..=254;

const DEFAULT_KEEPALIVE: u32 = 10;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_MTU: usize = 1472;

/// Operator-specified retry counts above this multiple of the built-in
/// default are rejected rather than silently accepted.
const MAX_RETRIES: u32 = DEFAULT_RETRIES * 4;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("--keepalive must be between {} and {} seconds", KEEPALIVE_RANGE.start(), KEEPALIVE_RANGE.end())]
    InvalidKeepalive,
    #[error("--retries must be a number no greater than {MAX_RETRIES}, or \"infinite\"")]
    InvalidRetries,
    #[error("--mtu must be between {} and {} bytes", MTU_RANGE.start(), MTU_RANGE.end())]
    InvalidMtu,
    #[error("--ttl must be between {} and {}", TTL_RANGE.start(), TTL_RANGE.end())]
    InvalidTtl,
    #[error("--id must fit in 16 bits")]
    InvalidId,
    #[error("a host argument is required in client mode")]
    MissingHost,
}

/// How many unanswered timeouts a peer tolerates before the connection is
/// considered dead. `Infinite` keeps retrying forever, trading a livelier
/// NAT mapping for never noticing the other end is truly gone.
///
/// `Default` and `Finite` carry the same limit semantics but are kept apart
/// because the client's steady-state timeout ladder treats them
/// differently: hitting the limit on a `Default` budget reconnects, while
/// hitting it on an operator-specified `Finite` budget gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retries {
    Default(u32),
    Finite(u32),
    Infinite,
}

impl Retries {
    pub fn limit(&self) -> Option<u32> {
        match self {
            Retries::Default(limit) | Retries::Finite(limit) => Some(*limit),
            Retries::Infinite => None,
        }
    }

    /// Whether exhausting this budget should trigger a reconnect instead of
    /// a hard exit. Only the built-in default affords that leniency; an
    /// operator who asked for a specific count meant it.
    pub fn reconnects_on_timeout(&self) -> bool {
        matches!(self, Retries::Default(_))
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub user: Option<String>,
    pub keepalive: u32,
    pub retries: Retries,
    pub mtu: usize,
    pub emulation: bool,
    pub daemon: bool,
    pub ttl_hops: Option<u8>,
    pub id: Option<u16>,
    pub server: bool,
    pub host: Option<String>,
}

fn build_app() -> App<'static> {
    App::new("icmptunnel")
        .version(env!("CARGO_PKG_VERSION"))
        .setting(AppSettings::DisableVersionFlag)
        .about("Tunnels IP traffic through ICMP echo messages")
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .help("run in server mode"),
        )
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .takes_value(true)
                .help("drop privileges to this user once the sockets are open"),
        )
        .arg(
            Arg::new("keepalive")
                .short('k')
                .long("keepalive")
                .takes_value(true)
                .help("seconds between keepalives when the tunnel is otherwise idle"),
        )
        .arg(
            Arg::new("retries")
                .short('r')
                .long("retries")
                .takes_value(true)
                .help("timeouts tolerated before giving up on the peer, or \"infinite\""),
        )
        .arg(
            Arg::new("mtu")
                .short('m')
                .long("mtu")
                .takes_value(true)
                .help("tunnel interface mtu in bytes"),
        )
        .arg(
            Arg::new("emulation")
                .short('e')
                .long("emulation")
                .help("emulate a well-known ping client's sequence numbering"),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("daemonize once the tunnel is established"),
        )
        .arg(
            Arg::new("ttl")
                .short('t')
                .long("ttl")
                .takes_value(true)
                .help("reject peers more than this many hops further away than the first message"),
        )
        .arg(
            Arg::new("id")
                .short('i')
                .long("id")
                .takes_value(true)
                .help("fixed session id instead of a random one"),
        )
        .arg(Arg::new("host").help("server hostname or address (client mode)"))
        .arg(
            Arg::new("version")
                .short('v')
                .long("version")
                .help("print version and exit"),
        )
}

fn options_from_matches(matches: &ArgMatches) -> Result<Options, CliError> {
    let server = matches.is_present("server");

    let keepalive = match matches.value_of("keepalive") {
        Some(raw) => raw
            .parse()
            .ok()
            .filter(|v| KEEPALIVE_RANGE.contains(v))
            .ok_or(CliError::InvalidKeepalive)?,
        None => DEFAULT_KEEPALIVE,
    };

    let retries = match matches.value_of("retries") {
        Some("infinite") => Retries::Infinite,
        Some(raw) => {
            let n: u32 = raw.parse().map_err(|_| CliError::InvalidRetries)?;
            if n > MAX_RETRIES {
                return Err(CliError::InvalidRetries);
            }
            Retries::Finite(n)
        }
        None => Retries::Default(DEFAULT_RETRIES),
    };

    let mtu = match matches.value_of("mtu") {
        Some(raw) => raw
            .parse()
            .ok()
            .filter(|v| MTU_RANGE.contains(v))
            .ok_or(CliError::InvalidMtu)?,
        None => DEFAULT_MTU,
    };

    let ttl_hops = match matches.value_of("ttl") {
        Some(raw) => Some(
            raw.parse()
                .ok()
                .filter(|v| TTL_RANGE.contains(v))
                .ok_or(CliError::InvalidTtl)?,
        ),
        None => None,
    };

    let id = match matches.value_of("id") {
        Some(raw) => Some(raw.parse().map_err(|_| CliError::InvalidId)?),
        None => None,
    };

    let host = matches.value_of("host").map(str::to_string);
    if !server && host.is_none() {
        return Err(CliError::MissingHost);
    }

    Ok(Options {
        user: matches.value_of("user").map(str::to_string),
        keepalive,
        retries,
        mtu,
        emulation: matches.is_present("emulation"),
        daemon: matches.is_present("daemon"),
        ttl_hops,
        id,
        server,
        host,
    })
}

impl Options {
    /// Parses `std::env::args`, handling `-h`/`--help` and `-v`/`--version`
    /// by printing and exiting directly (0 on either), the way a hand-rolled
    /// argv parser would, rather than letting clap's own exit codes decide.
    pub fn from_args() -> Result<Options, CliError> {
        let matches = match build_app().try_get_matches() {
            Ok(matches) => matches,
            Err(err) if err.kind == ErrorKind::DisplayHelp => {
                print!("{err}");
                std::process::exit(0);
            }
            Err(err) => {
                eprint!("{err}");
                std::process::exit(1);
            }
        };

        if matches.is_present("version") {
            println!("icmptunnel {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }

        options_from_matches(&matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, CliError> {
        let mut argv = vec!["icmptunnel"];
        argv.extend_from_slice(args);
        let matches = build_app()
            .try_get_matches_from(argv)
            .expect("test argv should parse under clap's own grammar");
        options_from_matches(&matches)
    }

    #[test]
    fn client_mode_requires_a_host() {
        let err = parse(&[]).unwrap_err();
        assert!(matches!(err, CliError::MissingHost));
    }

    #[test]
    fn accepts_a_host_in_client_mode() {
        let opts = parse(&["example.com"]).unwrap();
        assert_eq!(opts.host.as_deref(), Some("example.com"));
        assert!(!opts.server);
        assert_eq!(opts.keepalive, DEFAULT_KEEPALIVE);
        assert_eq!(opts.retries, Retries::Default(DEFAULT_RETRIES));
        assert_eq!(opts.mtu, DEFAULT_MTU);
    }

    #[test]
    fn server_mode_does_not_require_a_host() {
        let opts = parse(&["--server"]).unwrap();
        assert!(opts.server);
        assert!(opts.host.is_none());
    }

    #[test]
    fn rejects_keepalive_out_of_range() {
        let err = parse(&["--server", "--keepalive", "0"]).unwrap_err();
        assert!(matches!(err, CliError::InvalidKeepalive));

        let err = parse(&["--server", "--keepalive", "31"]).unwrap_err();
        assert!(matches!(err, CliError::InvalidKeepalive));
    }

    #[test]
    fn accepts_infinite_retries() {
        let opts = parse(&["--server", "--retries", "infinite"]).unwrap();
        assert_eq!(opts.retries, Retries::Infinite);
    }

    #[test]
    fn rejects_mtu_out_of_range() {
        let err = parse(&["--server", "--mtu", "10"]).unwrap_err();
        assert!(matches!(err, CliError::InvalidMtu));
    }

    #[test]
    fn rejects_ttl_out_of_range() {
        let err = parse(&["--server", "--ttl", "255"]).unwrap_err();
        assert!(matches!(err, CliError::InvalidTtl));
    }

    #[test]
    fn accepts_an_operator_specified_retry_count_within_bounds() {
        let opts = parse(&["--server", "--retries", "12"]).unwrap();
        assert_eq!(opts.retries, Retries::Finite(12));
        assert!(!opts.retries.reconnects_on_timeout());
    }

    #[test]
    fn rejects_retries_above_four_times_the_default() {
        let err = parse(&["--server", "--retries", "13"]).unwrap_err();
        assert!(matches!(err, CliError::InvalidRetries));
    }

    #[test]
    fn default_retries_reconnect_on_timeout() {
        let opts = parse(&["--server"]).unwrap();
        assert!(opts.retries.reconnects_on_timeout());
    }

    #[test]
    fn recognizes_version_flag() {
        let matches = build_app()
            .try_get_matches_from(["icmptunnel", "-v"])
            .unwrap();
        assert!(matches.is_present("version"));
    }
}
