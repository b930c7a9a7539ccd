use clap::Parser;
use clusterd::peers::PeerDescriptor;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;
use std::{net::SocketAddr, path::PathBuf};

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// FQDN of this node, as other members know it
    #[clap(long = "id", env = "CLUSTERD_ID")]
    pub id: String,

    #[clap(long = "data-dir", default_value = "/var/lib/clusterd")]
    pub data_dir: PathBuf,

    #[clap(long = "listen", default_value = "127.0.0.1:7070")]
    pub listen: SocketAddr,

    /// Other cluster member, as `ID@HOST:PORT` (repeatable)
    #[clap(long = "peer")]
    pub peers: Vec<PeerDescriptor>,

    #[clap(long = "election-timeout", value_parser = parse_duration)]
    pub election_timeout: Option<Duration>,

    #[clap(long = "ping-interval", value_parser = parse_duration)]
    pub ping_interval: Option<Duration>,

    #[clap(long = "min-ping-interval", value_parser = parse_duration)]
    pub min_ping_interval: Option<Duration>,

    /// Take no part in consensus; answer all requests with "unwilling"
    #[clap(long = "disabled")]
    pub disabled: bool,

    /// Seed for the split-vote backoff
    #[clap(long = "seed")]
    pub seed: Option<u64>,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

/// Parse `150ms`, `3s` or plain milliseconds
fn parse_duration(s: &str) -> std::result::Result<Duration, ParseIntError> {
    let s = s.trim().to_lowercase();

    Ok(if let Some(num) = s.strip_suffix("ms") {
        Duration::from_millis(u64::from_str(num)?)
    } else if let Some(num) = s.strip_suffix('s') {
        Duration::from_secs(u64::from_str(num)?)
    } else {
        Duration::from_millis(u64::from_str(&s)?)
    })
}

#[test]
fn parse_duration_test() {
    assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
    assert_eq!(parse_duration("150"), Ok(Duration::from_millis(150)));
    assert_eq!(parse_duration("150ms"), Ok(Duration::from_millis(150)));
    assert_eq!(parse_duration("3s"), Ok(Duration::from_secs(3)));
    assert_eq!(parse_duration("3S"), Ok(Duration::from_secs(3)));
    assert!(parse_duration("ms").is_err());
    assert!(parse_duration("1m").is_err());
    assert!(parse_duration("-1").is_err());
}

#[test]
fn parse_peers_test() {
    let opts = Opts::try_parse_from([
        "clusterd",
        "--id",
        "a.local",
        "--peer",
        "b.local@10.0.0.2:7070",
        "--peer",
        "c.local@10.0.0.3:7070",
        "--election-timeout",
        "3s",
    ])
    .unwrap();
    assert_eq!(opts.peers.len(), 2);
    assert_eq!(opts.peers[1], PeerDescriptor::new("c.local", "10.0.0.3:7070"));
    assert_eq!(opts.election_timeout, Some(Duration::from_secs(3)));
    assert!(!opts.disabled);

    assert!(Opts::try_parse_from(["clusterd", "--id", "a", "--peer", "nope"]).is_err());
}
