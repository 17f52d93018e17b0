//! Bridges a host TCP port and a guest vsock port.
//!
//! `-server=tcp` listens on `-tcp_port` and dials `-vsock_cid:-vsock_port`;
//! `-server=vsock` listens on `-vsock_port` and dials `-tcp_host:-tcp_port`.

use clap::{Parser, ValueEnum};

use cvdhost::flags;
use cvdhost::fd::socket::VMADDR_CID_ANY;
use cvdhost::logging::{LogOptions, init_logging, log_fatal};
use cvdhost::relay::vsock_proxy::sleep_forever;
use cvdhost::relay::{ListenerAcceptor, ProxyServer};
use cvdhost_shared::Transport;
use cvdhost_shared::errors::{CvdResult, ErrorKind};
use cvdhost_shared::{ensure, propagate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Server {
    Tcp,
    Vsock,
}

#[derive(Parser, Debug)]
#[command(name = "socket_vsock_proxy", about = "TCP to vsock stream proxy")]
struct Cli {
    /// Which side listens.
    #[arg(long, value_enum)]
    server: Server,

    #[arg(long)]
    tcp_port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    tcp_host: String,

    #[arg(long)]
    vsock_port: u32,

    /// Guest cid to dial. Required with `-server=tcp`.
    #[arg(long)]
    vsock_cid: Option<u32>,
}

fn endpoints(cli: &Cli) -> CvdResult<(Transport, Transport)> {
    match cli.server {
        Server::Tcp => {
            ensure!(
                cli.vsock_cid.is_some(),
                kind = ErrorKind::Config,
                "-vsock_cid is required with -server=tcp"
            );
            let cid = cli.vsock_cid.unwrap_or_default();
            Ok((
                Transport::tcp("0.0.0.0", cli.tcp_port),
                Transport::vsock(cid, cli.vsock_port),
            ))
        }
        Server::Vsock => Ok((
            Transport::vsock(cli.vsock_cid.unwrap_or(VMADDR_CID_ANY), cli.vsock_port),
            Transport::tcp(cli.tcp_host.clone(), cli.tcp_port),
        )),
    }
}

fn run(cli: &Cli) -> CvdResult<()> {
    let (listen, dial) = propagate!(endpoints(cli));
    let acceptor = propagate!(ListenerAcceptor::bind(listen));
    let mut server = ProxyServer::new(acceptor, dial);
    propagate!(server.run());
    Ok(())
}

fn main() {
    let cli = Cli::parse_from(flags::args());
    let _guard = init_logging(LogOptions::stderr_only());
    if let Err(err) = run(&cli) {
        log_fatal(&err);
        if err.kind() == ErrorKind::Config {
            std::process::exit(1);
        }
        // A restart would fail the same way, so stay up.
        sleep_forever();
    }
}
