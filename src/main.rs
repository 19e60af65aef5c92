//! Tundra - IP-over-DNS tunnel server
//!
//! Listens for DNS queries under a delegated topdomain, multiplexes remote
//! clients over encoded query names, and bridges their IP packets into a
//! local tun device.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tundra::{Server, ServerConfig, TunChannel};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "tundrad")]
#[command(version = VERSION)]
#[command(about = "IP-over-DNS tunnel server", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Topdomain this server is delegated (e.g. t.example.com)
    #[arg(short, long)]
    topdomain: Option<String>,

    /// Tunnel password shared with clients
    #[arg(short, long, env = "TUNDRA_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// UDP listen address for DNS
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Additional IPv6 listen address
    #[arg(long)]
    listen6: Option<SocketAddr>,

    /// Server address inside the tunnel subnet
    #[arg(long)]
    tun_ip: Option<Ipv4Addr>,

    /// External nameserver address handed to clients on request
    #[arg(long)]
    ns_ip: Option<IpAddr>,

    /// Accept queries from roaming source addresses
    #[arg(long)]
    no_check_ip: bool,

    /// Relay non-tunnel queries to a resolver on 127.0.0.1:<PORT>
    #[arg(short, long)]
    bind_port: Option<u16>,

    /// Already-opened tun device file descriptor (from the launcher)
    #[arg(long)]
    tun_fd: Option<i32>,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace, -vvvv all modules trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger with multiple verbosity levels
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose >= 4 {
        logger.filter_level(log::LevelFilter::Trace);
    } else if cli.verbose >= 3 {
        logger.filter_module("tundra", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }
    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    info!("tundrad {} (built {}, git {})", VERSION, BUILD_DATE, GIT_HASH);

    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(topdomain) = cli.topdomain {
        config.topdomain = topdomain;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }
    if let Some(listen) = cli.listen {
        config.listen_v4 = listen;
    }
    if let Some(listen6) = cli.listen6 {
        config.listen_v6 = Some(listen6);
    }
    if let Some(tun_ip) = cli.tun_ip {
        config.tun_ip = tun_ip;
    }
    if let Some(ns_ip) = cli.ns_ip {
        config.ns_ip = Some(ns_ip);
    }
    if cli.no_check_ip {
        config.check_ip = false;
    }
    if let Some(port) = cli.bind_port {
        config.bind_port = Some(port);
    }

    let server = Server::new(config).context("invalid configuration")?;
    let (tun, handle) = TunChannel::pair();

    match cli.tun_fd {
        Some(fd) => bridge_tun_fd(fd, handle)?,
        None => warn!("no --tun-fd given: running without a device, tunnel data goes nowhere"),
    }

    server.run(tun).await?;
    Ok(())
}

/// Bridge an externally-opened tun file descriptor to the packet channels.
/// Two plain threads do blocking reads/writes; the loop stays async-only.
fn bridge_tun_fd(fd: i32, handle: tundra::TunHandle) -> Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::io::FromRawFd;

    // The launcher hands us exclusive ownership of the descriptor.
    let reader = unsafe { std::fs::File::from_raw_fd(fd) };
    let writer = reader.try_clone().context("duplicating tun fd")?;
    info!("bridging tun device on fd {}", fd);

    let tx = handle.tx;
    std::thread::spawn(move || {
        let mut reader = reader;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("tun read error: {}", e);
                    break;
                }
            }
        }
    });

    let mut rx = handle.rx;
    std::thread::spawn(move || {
        let mut writer = writer;
        while let Some(frame) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&frame) {
                warn!("tun write error: {}", e);
                break;
            }
        }
    });

    Ok(())
}
