//! Server core and event loop
//!
//! `Server` owns the configuration, the user table, and the forwarder
//! state. Every handler is synchronous: it consumes one datagram or tun
//! frame and pushes the resulting datagrams/frames into an [`Output`]
//! queue, which the async loop drains onto the sockets. The loop itself is
//! a single task selecting over the DNS sockets, the tun bridge, the
//! forwarder socket, and a deadline derived from the query memory.

use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::compress;
use crate::config::ServerConfig;
use crate::dns_wire::{
    self, build_rcode_response, build_response, DnsQuery, QueryType, Rdata, RCODE_NXDOMAIN,
    RCODE_REFUSED,
};
use crate::encoder::Encoder;
use crate::forwarder::Forwarder;
use crate::protocol::{
    self, fragsize_probe_data, login_digest, raw_login_digest, raw_login_response_digest, Command,
    CommandError, DownstreamFrame, PingInfo, BADCODEC, BADFRAG, BADIP, BADLEN, DOWNCODEC_CHECK,
    ILLEGAL_ANSWER, LNAK, PROTOCOL_VERSION, VACK, VFUL, VNAK,
};
use crate::qmem::AppendResult;
use crate::raw_udp::{self, RawCommand};
use crate::tun::{self, TunChannel};
use crate::users::{ConnType, SessionState, UserId, UserTable, MAX_USERS};
use crate::window::{Fragment, WINDOW_BUFFER_LEN};
use crate::Result;

/// Ceiling on the loop deadline regardless of pending queries.
const MAX_QMEM_WAIT: Duration = Duration::from_secs(10);

/// Client-supplied DNS timeouts are clamped into this range.
const MIN_DNS_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_DNS_TIMEOUT: Duration = Duration::from_secs(60);

/// Valid fragsize range for the `R`/`N` commands.
const FRAGSIZE_RANGE: std::ops::RangeInclusive<u16> = 2..=2047;

/// Side effects a handler wants performed, in order.
#[derive(Debug)]
pub enum Output {
    /// Datagram out one of the UDP sockets (DNS answer or raw frame)
    Net { datagram: Vec<u8>, dst: SocketAddr },
    /// IPv4 frame (with tun header) to the device
    Tun { frame: Vec<u8> },
    /// Foreign query relayed verbatim to the local resolver
    Forward { datagram: Vec<u8> },
}

/// The tunnel engine: all session state behind the sockets.
pub struct Server {
    config: ServerConfig,
    users: UserTable,
    forwarder: Forwarder,
    /// Hostname-answer collision counter for replies without a session
    cmc: u16,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let users = UserTable::new(config.tun_ip);
        Ok(Self {
            config,
            users,
            forwarder: Forwarder::new(),
            cmc: 0,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn users(&self) -> &UserTable {
        &self.users
    }

    // --- datagram entry point ---

    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if raw_udp::is_raw(datagram) {
            self.handle_raw(datagram, src, now, out);
            return;
        }

        let query = match dns_wire::parse_query(datagram, src) {
            Ok(query) => query,
            Err(e) => {
                debug!("dropping datagram from {}: {}", src, e);
                return;
            }
        };
        if self.config.debug >= 2 {
            debug!(
                "query id {:04x} type {:?} name {} from {}",
                query.id,
                query.qtype,
                query.qname_display(),
                src
            );
            debug!(
                "raw: {}",
                hex::encode(&datagram[..datagram.len().min(128)])
            );
        }

        let topdomain = self.config.topdomain.clone();
        let parsed = Command::from_qname(&query.qname, topdomain.as_bytes(), |uid| {
            self.users
                .get(uid)
                .map(|u| u.upstream_encoder)
                .unwrap_or_default()
        });

        match parsed {
            Ok(command) => self.dispatch(command, &query, src, now, out),
            Err(CommandError::NotTunnel) => {
                self.handle_foreign(datagram, &query, topdomain.as_bytes(), src, now, out)
            }
            Err(CommandError::UnknownCommand) => {
                out.push(Output::Net {
                    datagram: build_rcode_response(&query, RCODE_REFUSED),
                    dst: src,
                });
            }
            Err(CommandError::BadLength) => self.reply_server_text(&query, BADLEN, b'T', out),
            Err(CommandError::Undecodable) => {
                debug!("undecodable tunnel query from {}, dropping", src);
            }
        }
    }

    fn dispatch(
        &mut self,
        command: Command,
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        match command {
            Command::Version { version } => self.handle_version(version, query, src, now, out),
            Command::Login { uid, digest } => self.handle_login(uid, digest, query, src, now, out),
            Command::IpRequest { uid } => self.handle_ip_request(uid, query, src, out),
            Command::CaseCheck => {
                // intentionally minimal: downenc 'T' regardless of query type
                let qname = query.qname.clone();
                self.reply_server_text(query, &qname, b'T', out);
            }
            Command::SwitchCodec { uid, codec_id } => {
                self.handle_switch_codec(uid, codec_id, query, src, now, out)
            }
            Command::Options { uid, opts } => self.handle_options(uid, &opts, query, src, now, out),
            Command::DownCodecCheck { variant, downenc } => {
                self.handle_downcodec_check(variant, downenc, query, out)
            }
            Command::FragsizeProbe { uid, req_size } => {
                self.handle_fragsize_probe(uid, req_size, query, src, out)
            }
            Command::FragsizeSet { uid, fragsize } => {
                self.handle_fragsize_set(uid, fragsize, query, src, now, out)
            }
            Command::Ping { .. } => self.handle_ping(command, query, src, now, out),
            Command::Data { uid, frame } => self.handle_data(uid, frame, query, src, now, out),
        }
    }

    // --- handshake ---

    fn handle_version(
        &mut self,
        version: u32,
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if version != PROTOCOL_VERSION {
            debug!(
                "version mismatch from {}: got {:08x}, want {:08x}",
                src, version, PROTOCOL_VERSION
            );
            let mut data = VNAK.to_vec();
            data.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
            self.reply_server_text(query, &data, b'T', out);
            return;
        }

        let Some(uid) = self.users.allocate(now, self.config.user_timeout) else {
            let mut data = VFUL.to_vec();
            data.extend_from_slice(&(MAX_USERS as u32).to_be_bytes());
            self.reply_server_text(query, &data, b'T', out);
            return;
        };

        let seed: u32 = rand::random();
        let downenc = if query.qtype.carries_raw() { b'R' } else { b'T' };
        let dns_timeout = self.config.dns_timeout;
        let user = self.users.get_mut(uid).expect("allocated slot");
        user.begin_session(seed, downenc, src, now);
        user.dns_timeout = dns_timeout;
        user.conn = ConnType::DnsNull;

        info!("user {} version handshake from {}", uid, src);
        let mut data = VACK.to_vec();
        data.extend_from_slice(&seed.to_be_bytes());
        data.push(uid);
        self.reply_user_text(uid, query, &data, out);
    }

    fn handle_login(
        &mut self,
        uid: UserId,
        digest: [u8; 16],
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if !self.users.check_user_and_ip(uid, src, self.config.check_ip) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }

        let seed = self.users.get(uid).expect("checked").seed;
        if digest != login_digest(&self.config.password, seed) {
            warn!("user {} login failed from {}", uid, src);
            self.reply_user_text(uid, query, LNAK, out);
            return;
        }

        // one session per authenticated peer address
        for (other, user) in self.users.iter_mut() {
            if other != uid
                && user.state == SessionState::Authenticated
                && user.peer_addr == Some(src)
            {
                info!("user {} superseded by new login from {}", other, src);
                user.release();
            }
        }

        let client_ip = {
            let user = self.users.get_mut(uid).expect("checked");
            user.state = SessionState::Authenticated;
            user.peer_addr = Some(src);
            user.last_pkt = now;
            user.tun_ip
        };

        info!("user {} logged in from {}, tunnel ip {}", uid, src, client_ip);
        let text = format!(
            "{}-{}-{}-{}",
            self.config.tun_ip, client_ip, self.config.mtu, self.config.netmask
        );
        self.reply_user_text(uid, query, text.as_bytes(), out);
    }

    fn handle_ip_request(
        &mut self,
        uid: UserId,
        query: &DnsQuery,
        src: SocketAddr,
        out: &mut Vec<Output>,
    ) {
        if !self.check_authenticated(uid, src) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }

        let external = self.config.ns_ip.unwrap_or_else(|| self.config.listen_v4.ip());
        let mut data = vec![b'I'];
        match external {
            IpAddr::V4(ip) => data.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => data.extend_from_slice(&ip.octets()),
        }
        self.reply_user_text(uid, query, &data, out);
    }

    // --- negotiation ---

    fn handle_switch_codec(
        &mut self,
        uid: UserId,
        codec_id: u8,
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if !self.check_authenticated(uid, src) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }

        let Some(encoder) = Encoder::from_codec_id(codec_id) else {
            self.reply_user_text(uid, query, BADCODEC, out);
            return;
        };

        let user = self.users.get_mut(uid).expect("checked");
        user.upstream_encoder = encoder;
        user.last_pkt = now;
        info!("user {} upstream codec now {}", uid, encoder.name());
        self.reply_user_text(uid, query, encoder.name().as_bytes(), out);
    }

    fn handle_options(
        &mut self,
        uid: UserId,
        opts: &[u8],
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if !self.check_authenticated(uid, src) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }

        let valid = opts
            .iter()
            .all(|&o| matches!(o.to_ascii_uppercase(), b'T' | b'S' | b'U' | b'V' | b'R' | b'L' | b'I' | b'C' | b'D'));
        if !valid || opts.is_empty() {
            self.reply_user_text(uid, query, BADCODEC, out);
            return;
        }

        let user = self.users.get_mut(uid).expect("checked");
        for &opt in opts {
            match opt.to_ascii_uppercase() {
                e @ (b'T' | b'S' | b'U' | b'V' | b'R') => user.set_downenc(e),
                b'L' => user.lazy = true,
                b'I' => user.lazy = false,
                b'C' => user.down_compression = true,
                b'D' => user.down_compression = false,
                _ => unreachable!("validated above"),
            }
        }
        user.last_pkt = now;
        debug!("user {} options {:?}", uid, String::from_utf8_lossy(opts));
        let echo = opts.to_vec();
        self.reply_user_text(uid, query, &echo, out);
    }

    fn handle_downcodec_check(
        &mut self,
        variant: u8,
        downenc: u8,
        query: &DnsQuery,
        out: &mut Vec<Output>,
    ) {
        let hostname_type = matches!(
            query.qtype,
            QueryType::Cname | QueryType::A | QueryType::Mx | QueryType::Srv
        );
        let codec_ok = Encoder::from_downenc(downenc).is_some()
            && !(hostname_type && downenc.to_ascii_uppercase() == b'R');

        if !(1..=2).contains(&variant) || !codec_ok {
            self.reply_server_text(query, BADCODEC, b'T', out);
            return;
        }

        let mut pattern = DOWNCODEC_CHECK.to_vec();
        pattern.rotate_left(16 * (variant as usize - 1));
        self.reply_server_text(query, &pattern, downenc, out);
    }

    fn handle_fragsize_probe(
        &mut self,
        uid: UserId,
        req_size: u16,
        query: &DnsQuery,
        src: SocketAddr,
        out: &mut Vec<Output>,
    ) {
        if !self.check_authenticated(uid, src) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }
        if !FRAGSIZE_RANGE.contains(&req_size) {
            self.reply_user_text(uid, query, BADFRAG, out);
            return;
        }
        let data = fragsize_probe_data(req_size);
        self.reply_user_text(uid, query, &data, out);
    }

    fn handle_fragsize_set(
        &mut self,
        uid: UserId,
        fragsize: u16,
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if !self.check_authenticated(uid, src) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }
        if !FRAGSIZE_RANGE.contains(&fragsize) {
            self.reply_user_text(uid, query, BADFRAG, out);
            return;
        }

        let user = self.users.get_mut(uid).expect("checked");
        user.set_fragsize(fragsize);
        user.last_pkt = now;
        info!(
            "user {} fragsize {} (maxfraglen {})",
            uid, fragsize, user.outgoing.max_frag_len
        );
        self.reply_user_text(uid, query, &fragsize.to_be_bytes(), out);
    }

    // --- data path ---

    fn handle_ping(
        &mut self,
        command: Command,
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        let Command::Ping {
            uid,
            dn_ack,
            up_winsize,
            dn_winsize,
            up_seq,
            dn_seq,
            timeout_ms,
            flags,
        } = command
        else {
            return;
        };

        if !self.check_authenticated(uid, src) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }
        if !self.park_query(uid, query, src, now, out) {
            return;
        }

        let lazy = {
            let user = self.users.get_mut(uid).expect("checked");
            if flags.dn_ack_valid {
                user.outgoing.ack(dn_ack);
            }
            if up_winsize > 0 {
                user.incoming.set_window_size(up_winsize);
            }
            if dn_winsize > 0 {
                user.outgoing.set_window_size(dn_winsize);
            }
            if flags.update_timeout {
                user.dns_timeout = Duration::from_millis(timeout_ms as u64)
                    .clamp(MIN_DNS_TIMEOUT, MAX_DNS_TIMEOUT);
            }
            if flags.respond {
                user.send_ping_next = true;
            }
            if up_seq != user.incoming.start_seq_id || dn_seq != user.outgoing.start_seq_id {
                debug!(
                    "user {} ping seq skew: client {}/{}, server {}/{}",
                    uid, up_seq, dn_seq, user.incoming.start_seq_id, user.outgoing.start_seq_id
                );
            }
            user.lazy
        };

        if !lazy {
            self.send_user_response(uid, now, true, out);
        }
    }

    fn handle_data(
        &mut self,
        uid: UserId,
        frame: protocol::UpstreamData,
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if !self.check_authenticated(uid, src) {
            self.reply_server_text(query, BADIP, b'T', out);
            return;
        }
        if !self.park_query(uid, query, src, now, out) {
            return;
        }

        let debug_level = self.config.debug;
        let (packets, lazy) = {
            let user = self.users.get_mut(uid).expect("checked");
            if frame.ack_other >= 0 {
                user.outgoing.ack(frame.ack_other as u8);
            }

            let fragment = Fragment::new(
                frame.seq,
                frame.body,
                frame.start,
                frame.end,
                frame.compressed,
            );
            let ack = user.incoming.process_incoming_fragment(fragment);
            user.next_upstream_ack = ack as i16;

            let mut packets = Vec::new();
            while let Some((data, compressed)) = user.incoming.reassemble() {
                if compressed {
                    match compress::inflate(&data) {
                        Ok(packet) => packets.push(packet),
                        Err(e) => {
                            if debug_level >= 2 {
                                debug!("user {} upstream inflate failed: {}", uid, e);
                            }
                        }
                    }
                } else {
                    packets.push(data);
                }
            }
            (packets, user.lazy)
        };

        for packet in packets {
            self.handle_full_packet(uid, &packet, out);
        }

        if !lazy {
            self.send_user_response(uid, now, true, out);
        }
    }

    /// Answer-cache lookup and qmem admission shared by `P` and data
    /// queries. Returns false when the query was consumed (cache re-send,
    /// duplicate, or refusal).
    fn park_query(
        &mut self,
        uid: UserId,
        query: &DnsQuery,
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) -> bool {
        let user = self.users.get_mut(uid).expect("checked");
        if let Some(answer) = user.dnscache.lookup(query) {
            debug!("user {} cache hit for id {:04x}, re-sending", uid, query.id);
            out.push(Output::Net {
                datagram: answer,
                dst: src,
            });
            return false;
        }

        match user.qmem.append(query.clone(), now) {
            AppendResult::Queued => {
                user.last_pkt = now;
                user.peer_addr = Some(src);
                user.conn = ConnType::DnsNull;
                true
            }
            AppendResult::Duplicate => {
                debug!("user {} duplicate query id {:04x}", uid, query.id);
                let topdomain = self.config.topdomain.clone();
                let user = self.users.get_mut(uid).expect("checked");
                let wire = write_dns(
                    topdomain.as_bytes(),
                    query,
                    ILLEGAL_ANSWER,
                    b'T',
                    &mut user.hostname_cmc,
                );
                out.push(Output::Net {
                    datagram: wire,
                    dst: src,
                });
                false
            }
            AppendResult::Refused => {
                debug!("user {} qmem full, dropping query id {:04x}", uid, query.id);
                false
            }
        }
    }

    /// Route a reassembled upstream packet: to another user's downstream
    /// window, or out the tun device.
    pub fn handle_full_packet(&mut self, from_uid: UserId, packet: &[u8], out: &mut Vec<Output>) {
        let Some(dest) = tun::ipv4_destination(packet) else {
            debug!("user {} sent a non-IPv4 packet, dropping", from_uid);
            return;
        };

        match self.users.by_tun_ip(dest) {
            Some(dst_uid) if dst_uid != from_uid => {
                debug!(
                    "routing {} bytes user {} -> user {} ({})",
                    packet.len(),
                    from_uid,
                    dst_uid,
                    dest
                );
                self.enqueue_to_user(dst_uid, packet, out);
            }
            Some(_) => debug!("user {} sent a self-addressed packet, dropping", from_uid),
            None => out.push(Output::Tun {
                frame: tun::add_header(packet),
            }),
        }
    }

    /// Queue a packet for a user's downstream: straight out the raw-UDP
    /// transport when that is established, otherwise into the window.
    fn enqueue_to_user(&mut self, uid: UserId, packet: &[u8], out: &mut Vec<Output>) {
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        if user.state != SessionState::Authenticated {
            return;
        }

        if user.conn == ConnType::RawUdp && user.authenticated_raw {
            if let Some(raw_addr) = user.raw_addr {
                match compress::deflate(packet) {
                    Ok(z) => out.push(Output::Net {
                        datagram: raw_udp::encode(RawCommand::Data, uid, &z),
                        dst: raw_addr,
                    }),
                    Err(e) => debug!("deflate for raw user {} failed: {}", uid, e),
                }
            }
            return;
        }

        let (data, compressed) = if user.down_compression {
            match compress::deflate(packet) {
                Ok(z) => (z, true),
                Err(e) => {
                    debug!("deflate for user {} failed: {}", uid, e);
                    return;
                }
            }
        } else {
            (packet.to_vec(), false)
        };

        match user.outgoing.add_outgoing_data(&data, compressed) {
            Ok(n) => debug!("user {} queued {} bytes in {} fragments", uid, data.len(), n),
            Err(_) => debug!("user {} downstream window full, dropping packet", uid),
        }
    }

    /// Frames read from the tun device.
    pub fn handle_tun_frame(&mut self, frame: &[u8], _now: Instant, out: &mut Vec<Output>) {
        let Some(packet) = tun::strip_header(frame) else {
            debug!("short tun frame ({} bytes), dropping", frame.len());
            return;
        };
        let Some(dest) = tun::ipv4_destination(packet) else {
            return; // non-IPv4 traffic on the device is not ours
        };
        let Some(uid) = self.users.by_tun_ip(dest) else {
            debug!("tun packet for {} matches no user, dropping", dest);
            return;
        };
        self.enqueue_to_user(uid, packet, out);
    }

    // --- deferred answering ---

    /// The qmem scan: answer every eligible pending query within budget and
    /// report how long the loop may sleep before the next deadline.
    pub fn pump(&mut self, now: Instant, out: &mut Vec<Output>) -> Duration {
        let mut wait = MAX_QMEM_WAIT;
        let mut wait_user = None;

        for uid in 0..MAX_USERS as UserId {
            let Some(user) = self.users.get(uid) else {
                continue;
            };
            if !user.is_active() || user.qmem.num_pending() == 0 {
                continue;
            }

            let windowsize = user.outgoing.window_size() as usize;
            let mut budget = user
                .outgoing
                .sending_count(now)
                .max(user.qmem.num_pending().saturating_sub(windowsize))
                .max(1);

            while budget > 0 {
                let user = self.users.get(uid).expect("slot scanned");
                let Some(received) = user.qmem.oldest_pending_received() else {
                    break;
                };
                let deadline_passed = now >= received + user.dns_timeout;
                let eligible = deadline_passed
                    || user.outgoing.sending_count(now) > 0
                    || user.next_upstream_ack >= 0
                    || user.send_ping_next
                    || user.qmem.num_pending() > user.outgoing.window_size() as usize;
                if !eligible {
                    break;
                }
                if !self.send_user_response(uid, now, !deadline_passed, out) {
                    break;
                }
                budget -= 1;
            }

            let user = self.users.get(uid).expect("slot scanned");
            if let Some(received) = user.qmem.oldest_pending_received() {
                let remaining = (received + user.dns_timeout).saturating_duration_since(now);
                if remaining < wait {
                    wait = remaining;
                    wait_user = Some(uid);
                }
            }
        }

        if let Some(uid) = wait_user {
            log::trace!("next qmem deadline in {:?} (user {})", wait, uid);
        }
        wait
    }

    /// Send one downstream response for this user's oldest pending query:
    /// a window fragment when one is due, a bare ping frame otherwise.
    fn send_user_response(
        &mut self,
        uid: UserId,
        now: Instant,
        immediate: bool,
        out: &mut Vec<Output>,
    ) -> bool {
        let topdomain = self.config.topdomain.clone();
        let Some(user) = self.users.get_mut(uid) else {
            return false;
        };
        let Some(pending) = user.qmem.next_response() else {
            return false;
        };
        let query = pending.query.clone();

        let ping_info = PingInfo {
            out_winsize: user.outgoing.window_size(),
            in_winsize: user.incoming.window_size(),
            out_start_seq: user.outgoing.start_seq_id,
            in_start_seq: user.incoming.start_seq_id,
        };
        let want_ping = user.send_ping_next;

        let frame = match user
            .outgoing
            .next_sending_fragment(now, &mut user.next_upstream_ack)
        {
            Some(frag) => DownstreamFrame {
                seq: frag.seq_id,
                ack: frag.ack_other,
                start: frag.start,
                end: frag.end,
                compressed: frag.compressed,
                immediate,
                ping: want_ping.then_some(ping_info),
                body: frag.data.clone(),
            },
            None => {
                let ack = user.next_upstream_ack;
                user.next_upstream_ack = -1;
                DownstreamFrame {
                    seq: ping_info.out_start_seq,
                    ack,
                    start: false,
                    end: false,
                    compressed: false,
                    immediate,
                    ping: Some(ping_info),
                    body: Vec::new(),
                }
            }
        };

        let downenc = user.downenc;
        let wire = write_dns(
            topdomain.as_bytes(),
            &query,
            &frame.encode(),
            downenc,
            &mut user.hostname_cmc,
        );
        user.dnscache.save(&query, wire.clone());
        user.qmem.answered();
        user.send_ping_next = false;

        out.push(Output::Net {
            datagram: wire,
            dst: query.src,
        });
        true
    }

    // --- non-tunnel queries ---

    fn handle_foreign(
        &mut self,
        datagram: &[u8],
        query: &DnsQuery,
        topdomain: &[u8],
        src: SocketAddr,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        if protocol::is_topdomain(&query.qname, topdomain) {
            if query.qtype == QueryType::Ns {
                let mut ns_name = b"ns1.".to_vec();
                ns_name.extend_from_slice(topdomain);
                let glue = match self.config.ns_ip {
                    Some(IpAddr::V4(ip)) => Some(ip),
                    _ => None,
                };
                out.push(Output::Net {
                    datagram: build_response(query, &Rdata::Ns(ns_name, glue)),
                    dst: src,
                });
            } else {
                out.push(Output::Net {
                    datagram: build_rcode_response(query, RCODE_REFUSED),
                    dst: src,
                });
            }
            return;
        }

        if self.config.bind_port.is_some() {
            self.forwarder.insert(query.id, src, now);
            out.push(Output::Forward {
                datagram: datagram.to_vec(),
            });
        } else {
            out.push(Output::Net {
                datagram: build_rcode_response(query, RCODE_NXDOMAIN),
                dst: src,
            });
        }
    }

    /// Resolver reply coming back on the forward socket.
    pub fn splice_forward_reply(&mut self, reply: &[u8], now: Instant, out: &mut Vec<Output>) {
        if reply.len() < 12 {
            return;
        }
        let id = u16::from_be_bytes([reply[0], reply[1]]);
        let Some(dst) = self.forwarder.take(id, now) else {
            debug!("forward reply id {:04x} matches no client", id);
            return;
        };
        out.push(Output::Net {
            datagram: reply.to_vec(),
            dst,
        });
    }

    // --- raw-UDP fallback ---

    fn handle_raw(&mut self, datagram: &[u8], src: SocketAddr, now: Instant, out: &mut Vec<Output>) {
        let Some(packet) = raw_udp::parse(datagram) else {
            return;
        };
        let uid = packet.uid;

        match packet.cmd {
            RawCommand::Login => {
                if packet.payload.len() < 16 {
                    return;
                }
                // raw login rides on the DNS-established session and source
                if !self.check_authenticated(uid, src) {
                    debug!("raw login for unknown/foreign user {} from {}", uid, src);
                    return;
                }
                let seed = self.users.get(uid).expect("checked").seed;
                if packet.payload[..16] != raw_login_digest(&self.config.password, seed) {
                    debug!("raw login digest mismatch for user {}", uid);
                    return;
                }

                let user = self.users.get_mut(uid).expect("checked");
                user.authenticated_raw = true;
                user.raw_addr = Some(src);
                user.conn = ConnType::RawUdp;
                user.last_pkt = now;
                info!("user {} switched to raw udp via {}", uid, src);

                let response = raw_login_response_digest(&self.config.password, seed);
                out.push(Output::Net {
                    datagram: raw_udp::encode(RawCommand::Login, uid, &response),
                    dst: src,
                });
            }
            RawCommand::Data => {
                if !self.check_raw_user(uid, src) {
                    return;
                }
                let packet = match compress::inflate(packet.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("raw data inflate failed for user {}: {}", uid, e);
                        return;
                    }
                };
                self.users.get_mut(uid).expect("checked").last_pkt = now;
                self.handle_full_packet(uid, &packet, out);
            }
            RawCommand::Ping => {
                if !self.check_raw_user(uid, src) {
                    return;
                }
                self.users.get_mut(uid).expect("checked").last_pkt = now;
                out.push(Output::Net {
                    datagram: raw_udp::encode(RawCommand::Ping, uid, &[]),
                    dst: src,
                });
            }
        }
    }

    // --- helpers ---

    fn check_authenticated(&self, uid: UserId, src: SocketAddr) -> bool {
        self.users.check_user_and_ip(uid, src, self.config.check_ip)
            && self
                .users
                .get(uid)
                .map(|u| u.state == SessionState::Authenticated)
                .unwrap_or(false)
    }

    /// Raw data/ping validate against the raw transport's own peer address.
    fn check_raw_user(&self, uid: UserId, src: SocketAddr) -> bool {
        let Some(user) = self.users.get(uid) else {
            return false;
        };
        if !user.is_active() || !user.authenticated_raw {
            return false;
        }
        if self.config.check_ip {
            match user.raw_addr {
                Some(raw) => raw.ip() == src.ip(),
                None => false,
            }
        } else {
            true
        }
    }

    /// Reply through a known session: its downenc and hostname counter.
    fn reply_user_text(&mut self, uid: UserId, query: &DnsQuery, text: &[u8], out: &mut Vec<Output>) {
        let topdomain = self.config.topdomain.clone();
        let Some(user) = self.users.get_mut(uid) else {
            return;
        };
        let wire = write_dns(
            topdomain.as_bytes(),
            query,
            text,
            user.downenc,
            &mut user.hostname_cmc,
        );
        out.push(Output::Net {
            datagram: wire,
            dst: query.src,
        });
    }

    /// Reply without a session (handshake errors, probes).
    fn reply_server_text(
        &mut self,
        query: &DnsQuery,
        text: &[u8],
        downenc: u8,
        out: &mut Vec<Output>,
    ) {
        let wire = write_dns(
            self.config.topdomain.clone().as_bytes(),
            query,
            text,
            downenc,
            &mut self.cmc,
        );
        out.push(Output::Net {
            datagram: wire,
            dst: query.src,
        });
    }

    /// Gate for tun reads: closed only while every authenticated user's
    /// downstream ring is packed full.
    pub fn tun_has_room(&self) -> bool {
        let mut any_user = false;
        for (_, user) in self.users.iter() {
            if user.state == SessionState::Authenticated {
                any_user = true;
                if user.outgoing.len() < WINDOW_BUFFER_LEN {
                    return true;
                }
            }
        }
        !any_user
    }

    // --- event loop ---

    /// Bind the sockets and drive the tunnel until shutdown.
    pub async fn run(mut self, mut tun: TunChannel) -> Result<()> {
        let sock_v4 = UdpSocket::bind(self.config.listen_v4).await?;
        info!("listening on {}/udp", self.config.listen_v4);

        let sock_v6 = match self.config.listen_v6 {
            Some(addr) => {
                let sock = UdpSocket::bind(addr).await?;
                info!("listening on {}/udp", addr);
                Some(sock)
            }
            None => None,
        };

        let (fw_sock, fw_dst) = match self.config.bind_port {
            Some(port) => {
                let sock = UdpSocket::bind("127.0.0.1:0").await?;
                let dst: SocketAddr = ([127, 0, 0, 1], port).into();
                info!("forwarding foreign queries to {}", dst);
                (Some(sock), Some(dst))
            }
            None => (None, None),
        };

        let mut buf4 = vec![0u8; 64 * 1024];
        let mut buf6 = vec![0u8; 64 * 1024];
        let mut buf_fw = vec![0u8; 64 * 1024];
        let mut out: Vec<Output> = Vec::new();
        let started = Instant::now();

        loop {
            let now = Instant::now();
            self.users.reap_idle(now, self.config.user_timeout);

            if let Some(max_idle) = self.config.max_idle_time {
                let last = self.users.last_activity().unwrap_or(started);
                if now.duration_since(last) > max_idle {
                    info!("no activity for {:?}, shutting down", max_idle);
                    break;
                }
            }

            let wait = self.pump(now, &mut out);
            flush(
                &mut out,
                &sock_v4,
                sock_v6.as_ref(),
                fw_sock.as_ref(),
                fw_dst,
                &tun.tx,
            )
            .await;

            let tun_open = self.tun_has_room();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    break;
                }
                result = sock_v4.recv_from(&mut buf4) => match result {
                    Ok((len, src)) => {
                        self.handle_datagram(&buf4[..len], src, Instant::now(), &mut out);
                    }
                    Err(e) => warn!("dns socket error: {}", e),
                },
                result = recv_some(sock_v6.as_ref(), &mut buf6), if sock_v6.is_some() => match result {
                    Ok((len, src)) => {
                        self.handle_datagram(&buf6[..len], src, Instant::now(), &mut out);
                    }
                    Err(e) => warn!("dns6 socket error: {}", e),
                },
                result = recv_some(fw_sock.as_ref(), &mut buf_fw), if fw_sock.is_some() => match result {
                    Ok((len, _)) => {
                        self.splice_forward_reply(&buf_fw[..len], Instant::now(), &mut out);
                    }
                    Err(e) => warn!("forward socket error: {}", e),
                },
                frame = tun.rx.recv(), if tun_open => match frame {
                    Some(frame) => self.handle_tun_frame(&frame, Instant::now(), &mut out),
                    None => {
                        warn!("tun bridge closed");
                        break;
                    }
                },
                _ = tokio::time::sleep(wait) => {}
            }

            flush(
                &mut out,
                &sock_v4,
                sock_v6.as_ref(),
                fw_sock.as_ref(),
                fw_dst,
                &tun.tx,
            )
            .await;
        }

        Ok(())
    }
}

async fn recv_some(
    sock: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    sock.expect("branch guarded on Some").recv_from(buf).await
}

async fn flush(
    out: &mut Vec<Output>,
    sock_v4: &UdpSocket,
    sock_v6: Option<&UdpSocket>,
    fw_sock: Option<&UdpSocket>,
    fw_dst: Option<SocketAddr>,
    tun_tx: &mpsc::Sender<Vec<u8>>,
) {
    for item in out.drain(..) {
        match item {
            Output::Net { datagram, dst } => {
                let sock = match (dst, sock_v6) {
                    (SocketAddr::V6(_), Some(v6)) => v6,
                    _ => sock_v4,
                };
                if let Err(e) = sock.send_to(&datagram, dst).await {
                    debug!("send to {} failed: {}", dst, e);
                }
            }
            Output::Tun { frame } => {
                if tun_tx.try_send(frame).is_err() {
                    debug!("tun bridge full, dropping packet");
                }
            }
            Output::Forward { datagram } => {
                if let (Some(sock), Some(dst)) = (fw_sock, fw_dst) {
                    if let Err(e) = sock.send_to(&datagram, dst).await {
                        debug!("forward to {} failed: {}", dst, e);
                    }
                }
            }
        }
    }
}

/// Render a downstream payload into the answer form the query type asks
/// for: raw rdata, a prefixed TXT string, or hostname-encoded names.
fn write_dns(
    topdomain: &[u8],
    query: &DnsQuery,
    data: &[u8],
    downenc: u8,
    cmc: &mut u16,
) -> Vec<u8> {
    let downenc = downenc.to_ascii_uppercase();
    let encoder = Encoder::from_downenc(downenc).unwrap_or(Encoder::Base32);

    let rdata = match query.qtype {
        QueryType::Null | QueryType::Private => Rdata::Raw(data.to_vec()),
        QueryType::Cname | QueryType::A => {
            // hostnames cannot carry raw bytes; base32 is the floor
            let encoder = if downenc == b'R' { Encoder::Base32 } else { encoder };
            Rdata::Name(dns_wire::encode_hostname(data, encoder, topdomain, cmc))
        }
        QueryType::Mx | QueryType::Srv => {
            let encoder = if downenc == b'R' { Encoder::Base32 } else { encoder };
            let chunk = dns_wire::max_hostname_payload(encoder, topdomain.len()).max(1);
            let names = data
                .chunks(chunk)
                .map(|part| dns_wire::encode_hostname(part, encoder, topdomain, cmc))
                .collect();
            Rdata::NameChain(names)
        }
        _ => {
            // TXT and anything else: single prefixed character-string
            let mut content = vec![downenc.to_ascii_lowercase()];
            if downenc == b'R' {
                content.extend_from_slice(data);
            } else {
                content.extend_from_slice(&encoder.encode(data));
            }
            Rdata::Txt(content)
        }
    };

    dns_wire::build_response(query, &rdata)
}
