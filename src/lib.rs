//! Tundra: IP-over-DNS tunnel server core
//!
//! Tundra carries IP traffic for multiple remote clients through the DNS
//! request/response channel. Clients encode packets into query names under a
//! topdomain the server owns; the server decodes them, reassembles full IP
//! packets through a sliding-window fragmentation layer, and injects them
//! into a local tun device. Downstream packets ride inside DNS answers to
//! queries the clients keep in flight.
//!
//! ## Features
//!
//! - **Session engine**: version handshake, challenge-response login, codec
//!   and option negotiation, ping/data exchange for up to 16 clients
//! - **Reliable fragmentation**: 8-bit sliding window with cumulative ACKs
//!   and retransmission over the unreliable DNS channel
//! - **Lazy mode**: pending queries are parked and answered when data is
//!   ready or their DNS timeout is about to expire
//! - **Codec negotiation**: base32/base64/base64u/base128/raw upstream,
//!   CNAME/A/MX/SRV/TXT/NULL/PRIVATE record encodings downstream
//! - **Raw-UDP fallback**: magic-header datagram transport once a client has
//!   proven DNS reachability
//! - **Forwarder**: non-tunnel queries relayed to a local resolver
//!
//! ## Architecture
//!
//! ```text
//! tun device ──▶ user table ──▶ outgoing window ──▶ session protocol ─┐
//!                                                                     ▼
//!                                                              DNS answers
//! DNS queries ──▶ command dispatch ──▶ incoming window ──▶ reassembly ──▶ tun
//! ```
//!
//! The event loop in [`server`] drives both directions from a single task;
//! the query memory decides *when* a parked DNS query is answered.

pub mod compress;
pub mod config;
pub mod dns_wire;
pub mod dnscache;
pub mod encoder;
pub mod forwarder;
pub mod protocol;
pub mod qmem;
pub mod raw_udp;
pub mod server;
pub mod tun;
pub mod users;
pub mod window;

// Re-export core types
pub use config::ServerConfig;
pub use dns_wire::{DnsQuery, QueryType};
pub use encoder::Encoder;
pub use protocol::{Command, DownstreamFrame, PROTOCOL_VERSION};
pub use server::Server;
pub use tun::{TunChannel, TunHandle};
pub use users::{UserId, UserTable, MAX_USERS};
pub use window::{Fragment, WindowBuffer};

/// Tundra error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Datagram did not parse as DNS
    #[error("malformed DNS message: {0}")]
    MalformedDns(String),

    /// Payload failed to decode under the active encoder
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Sliding window cannot take more fragments
    #[error("window buffer full")]
    WindowFull,

    /// Inflate/deflate failure on a tunneled packet
    #[error("compression error: {0}")]
    Compression(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
