//! Per-user session table
//!
//! Fixed array of 16 slots. A slot is claimed by a valid version handshake,
//! promoted by login, and reclaimed once its `last_pkt` is older than the
//! idle bound. Pending queries and routing state reference users by slot
//! index only.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::dnscache::AnswerCache;
use crate::encoder::Encoder;
use crate::protocol::DOWNSTREAM_PING_HDR;
use crate::qmem::QueryMemory;
use crate::window::{WindowBuffer, DEFAULT_WINDOW_SIZE};

/// Session slots per server.
pub const MAX_USERS: usize = 16;

/// Slot index into the user table.
pub type UserId = u8;

/// Fragsize before the client probes for a better one.
const INITIAL_FRAGSIZE: u16 = 100;

/// Default per-query DNS timeout until a ping adjusts it.
const INITIAL_DNS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Free,
    Versioned,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    None,
    DnsNull,
    RawUdp,
}

/// One tunnel client session.
#[derive(Debug)]
pub struct User {
    pub state: SessionState,
    pub conn: ConnType,
    pub authenticated_raw: bool,
    /// Source of the last accepted DNS query
    pub peer_addr: Option<SocketAddr>,
    /// Source of the peer on the raw-UDP transport
    pub raw_addr: Option<SocketAddr>,
    pub tun_ip: Ipv4Addr,
    pub seed: u32,
    pub upstream_encoder: Encoder,
    /// Downstream encoding letter: 'T','S','U','V','R'
    pub downenc: u8,
    pub downstream_bits: u32,
    pub down_compression: bool,
    pub lazy: bool,
    pub fragsize: u16,
    pub incoming: WindowBuffer,
    pub outgoing: WindowBuffer,
    /// Cumulative upstream ACK awaiting piggyback; -1 = none
    pub next_upstream_ack: i16,
    pub send_ping_next: bool,
    pub dns_timeout: Duration,
    pub last_pkt: Instant,
    pub qmem: QueryMemory,
    pub dnscache: AnswerCache,
    /// Rotating collision counter for hostname-encoded answers
    pub hostname_cmc: u16,
}

impl User {
    fn new(tun_ip: Ipv4Addr) -> Self {
        Self {
            state: SessionState::Free,
            conn: ConnType::None,
            authenticated_raw: false,
            peer_addr: None,
            raw_addr: None,
            tun_ip,
            seed: 0,
            upstream_encoder: Encoder::Base32,
            downenc: b'T',
            downstream_bits: 5,
            down_compression: false,
            lazy: true,
            fragsize: INITIAL_FRAGSIZE,
            incoming: WindowBuffer::new(DEFAULT_WINDOW_SIZE, 1),
            outgoing: WindowBuffer::new(DEFAULT_WINDOW_SIZE, 1),
            next_upstream_ack: -1,
            send_ping_next: false,
            dns_timeout: INITIAL_DNS_TIMEOUT,
            last_pkt: Instant::now(),
            qmem: QueryMemory::new(),
            dnscache: AnswerCache::new(),
            hostname_cmc: 0,
        }
    }

    /// Reinitialize the slot for a fresh handshake.
    pub fn begin_session(&mut self, seed: u32, downenc: u8, peer: SocketAddr, now: Instant) {
        self.state = SessionState::Versioned;
        self.conn = ConnType::None;
        self.authenticated_raw = false;
        self.peer_addr = Some(peer);
        self.raw_addr = None;
        self.seed = seed;
        self.upstream_encoder = Encoder::Base32;
        self.down_compression = false;
        self.lazy = true;
        self.fragsize = INITIAL_FRAGSIZE;
        self.incoming = WindowBuffer::new(DEFAULT_WINDOW_SIZE, 1);
        self.outgoing = WindowBuffer::new(DEFAULT_WINDOW_SIZE, 1);
        self.next_upstream_ack = -1;
        self.send_ping_next = false;
        self.dns_timeout = INITIAL_DNS_TIMEOUT;
        self.last_pkt = now;
        self.qmem.clear();
        self.dnscache.clear();
        self.hostname_cmc = 0;
        self.set_downenc(downenc);
    }

    pub fn release(&mut self) {
        self.state = SessionState::Free;
        self.conn = ConnType::None;
        self.authenticated_raw = false;
        self.peer_addr = None;
        self.raw_addr = None;
        self.qmem.clear();
        self.dnscache.clear();
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Free
    }

    /// Switch the downstream encoding letter and rederive the fragment
    /// split size from it.
    pub fn set_downenc(&mut self, downenc: u8) {
        self.downenc = downenc.to_ascii_uppercase();
        self.downstream_bits = match self.downenc {
            b'T' => 5,
            b'S' | b'U' => 6,
            b'V' => 7,
            _ => 8,
        };
        self.recompute_maxfraglen();
    }

    pub fn set_fragsize(&mut self, fragsize: u16) {
        self.fragsize = fragsize;
        self.recompute_maxfraglen();
    }

    fn recompute_maxfraglen(&mut self) {
        let raw = self.fragsize as usize * self.downstream_bits as usize / 8;
        self.outgoing.max_frag_len = raw.saturating_sub(DOWNSTREAM_PING_HDR).max(1);
    }

    /// Downstream content codec implied by the current downenc letter.
    pub fn downstream_encoder(&self) -> Encoder {
        Encoder::from_downenc(self.downenc).unwrap_or(Encoder::Raw)
    }
}

/// The slot array plus tunnel-subnet bookkeeping.
#[derive(Debug)]
pub struct UserTable {
    users: Vec<User>,
    server_ip: Ipv4Addr,
}

impl UserTable {
    /// Tunnel IPs are handed out sequentially after the server's own.
    pub fn new(server_ip: Ipv4Addr) -> Self {
        let base = u32::from(server_ip);
        let users = (0..MAX_USERS)
            .map(|i| User::new(Ipv4Addr::from(base + 1 + i as u32)))
            .collect();
        Self { users, server_ip }
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    pub fn get(&self, uid: UserId) -> Option<&User> {
        self.users.get(uid as usize)
    }

    pub fn get_mut(&mut self, uid: UserId) -> Option<&mut User> {
        self.users.get_mut(uid as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (UserId, &User)> {
        self.users.iter().enumerate().map(|(i, u)| (i as UserId, u))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (UserId, &mut User)> {
        self.users
            .iter_mut()
            .enumerate()
            .map(|(i, u)| (i as UserId, u))
    }

    /// Claim a slot for a fresh handshake: a free one, or the first whose
    /// owner has been silent past the idle bound.
    pub fn allocate(&mut self, now: Instant, idle_bound: Duration) -> Option<UserId> {
        for (uid, user) in self.users.iter_mut().enumerate() {
            if !user.is_active() {
                return Some(uid as UserId);
            }
            if now.duration_since(user.last_pkt) > idle_bound {
                log::info!("user {} idle, reclaiming slot", uid);
                user.release();
                return Some(uid as UserId);
            }
        }
        None
    }

    /// Sessions created (active slots).
    pub fn active_count(&self) -> usize {
        self.users.iter().filter(|u| u.is_active()).count()
    }

    /// Route lookup: which active user owns this tunnel IP?
    pub fn by_tun_ip(&self, ip: Ipv4Addr) -> Option<UserId> {
        self.users
            .iter()
            .position(|u| u.is_active() && u.tun_ip == ip)
            .map(|i| i as UserId)
    }

    /// Validate a uid-bearing command: slot in range, session live, and —
    /// when `check_ip` — the same source IP that did the handshake. Source
    /// ports are free to rotate across resolver pools.
    pub fn check_user_and_ip(&self, uid: UserId, src: SocketAddr, check_ip: bool) -> bool {
        let Some(user) = self.get(uid) else {
            return false;
        };
        if !user.is_active() {
            return false;
        }
        if check_ip {
            match user.peer_addr {
                Some(peer) => peer.ip() == src.ip(),
                None => false,
            }
        } else {
            true
        }
    }

    /// Free every session idle past `timeout`.
    pub fn reap_idle(&mut self, now: Instant, timeout: Duration) {
        for (uid, user) in self.users.iter_mut().enumerate() {
            if user.is_active() && now.duration_since(user.last_pkt) > timeout {
                log::info!("user {} timed out, clearing session", uid);
                user.release();
            }
        }
    }

    /// Most recent activity over all sessions, for server-wide idle stop.
    pub fn last_activity(&self) -> Option<Instant> {
        self.users
            .iter()
            .filter(|u| u.is_active())
            .map(|u| u.last_pkt)
            .max()
    }
}
