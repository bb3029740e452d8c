//! Quorumcast server node executable.

use clap::Parser;

use tokio::runtime::Builder;
use tokio::sync::watch;

use quorumcast::{
    logger_init, parsed_config, pf_info, QuorumcastError, ServerConfig,
    ServerNode,
};

/// Server node executable arguments.
#[derive(Parser, Debug)]
#[command(name = "quorumcast_server")]
struct CliArgs {
    /// UDP port to bind the unicast endpoint on.
    port: u16,

    /// Config string in TOML format to override default tunables.
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> Result<(), QuorumcastError> {
    logger_init();

    let args = CliArgs::parse();
    let config = parsed_config!(args.config.as_deref() => ServerConfig;
                                mcast_group, mcast_port,
                                beacon_interval_ms, heartbeat_timeout_ms,
                                crash_settle_ms, retransmit_interval_ms,
                                election_wait_ms)?;

    // SIGINT/SIGTERM trip the fleet-wide shutdown watch; every loop
    // exits at its next poll boundary
    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })?;

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let mut node =
            ServerNode::new_and_setup(args.port, config, stop_rx).await?;
        node.run().await?;
        pf_info!("server stopped cleanly");
        Ok(())
    })
}
