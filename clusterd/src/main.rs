#![deny(clippy::as_conversions)]
use clusterd::config::RaftConfig;
use clusterd::peers::PeerId;
use clusterd::Parameters;
use opts::Opts;
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let raft = RaftConfig::builder()
        .election_timeout(
            opts.election_timeout
                .unwrap_or(RaftConfig::DEFAULT_ELECTION_TIMEOUT),
        )
        .ping_interval(opts.ping_interval.unwrap_or(RaftConfig::DEFAULT_PING_INTERVAL))
        .min_ping_interval(
            opts.min_ping_interval
                .unwrap_or(RaftConfig::DEFAULT_MIN_PING_INTERVAL),
        )
        .enabled(!opts.disabled)
        .build();

    let params = Parameters::builder()
        .id(PeerId::new(opts.id))
        .listen(opts.listen)
        .peers(opts.peers)
        .data_dir(opts.data_dir)
        .raft(raft)
        .rng_seed(opts.seed)
        .build();

    let node = clusterd::Node::new(params)?;

    node.get_ctrl().install_signal_handler()?;

    node.wait();

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
