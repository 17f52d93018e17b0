//! WebRTC signaling front end for one instance.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use clap::Parser;
use serde_json::Value;

use cvdhost::flags;
use cvdhost::logging::{LogOptions, init_logging, log_fatal};
use cvdhost::signaling::SignalingServer;
use cvdhost_shared::errors::{CvdResult, ErrorKind, StackTraceError};
use cvdhost_shared::{ensure, propagate};

#[derive(Parser, Debug)]
#[command(name = "signaling_server", about = "WebSocket signaling hub")]
struct Cli {
    #[arg(long, default_value_t = 8443)]
    port: u16,

    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    address: IpAddr,

    /// JSON array of ICE servers sent to every peer.
    #[arg(long, default_value = "[]")]
    ice_servers: String,
}

fn run(cli: &Cli) -> CvdResult<()> {
    let ice_servers: Value = propagate!(
        serde_json::from_str(&cli.ice_servers)
            .map_err(|err| StackTraceError::with_detail(ErrorKind::Config, err)),
        "parsing -ice_servers"
    );
    ensure!(ice_servers.is_array(), kind = ErrorKind::Config, "-ice_servers must be a JSON array");
    let server = propagate!(SignalingServer::bind(SocketAddr::new(cli.address, cli.port), ice_servers));
    propagate!(server.run());
    Ok(())
}

fn main() {
    let cli = Cli::parse_from(flags::args());
    let guard = init_logging(LogOptions::stderr_only());
    let result = run(&cli);
    if let Err(err) = &result {
        log_fatal(err);
    }
    drop(guard);
    std::process::exit(if result.is_ok() { 0 } else { 1 });
}
