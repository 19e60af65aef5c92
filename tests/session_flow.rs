// End-to-end session flows driven through the synchronous handler surface:
// handshake, login, codec negotiation, lazy ping/data exchange, duplicate
// handling, answer-cache behavior, and inter-user routing.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tundra::encoder::Encoder;
use tundra::protocol::{login_digest, DownstreamFrame, FLAG_END, FLAG_START, PROTOCOL_VERSION};
use tundra::server::{Output, Server};
use tundra::users::SessionState;
use tundra::{QueryType, ServerConfig};

const TOPDOMAIN: &str = "t.example.com";
const PASSWORD: &str = "hunter2";
const CLIENT: &str = "192.0.2.10:40000";

fn config() -> ServerConfig {
    ServerConfig {
        topdomain: TOPDOMAIN.into(),
        password: PASSWORD.into(),
        ..ServerConfig::default()
    }
}

fn server() -> Server {
    Server::new(config()).unwrap()
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Build a query datagram the way a tunnel client would.
fn query_datagram(qname: &[u8], qtype: QueryType, id: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    for label in qname.split(|&b| b == b'.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label);
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_wire().to_be_bytes());
    out.extend_from_slice(&[0, 1]);
    out
}

/// Command qname: leading byte, base32 payload, topdomain suffix.
fn cmd_qname(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut qname = vec![cmd];
    qname.extend_from_slice(&Encoder::Base32.encode(payload));
    qname.push(b'.');
    qname.extend_from_slice(TOPDOMAIN.as_bytes());
    qname
}

/// Data-fragment qname: hex uid nibble, then the negotiated encoder.
fn data_qname(uid: u8, encoder: Encoder, cmc: u8, seq: u8, flags: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![cmc, seq, 0, flags];
    payload.extend_from_slice(body);
    let mut qname = vec![b"0123456789abcdef"[uid as usize]];
    qname.extend_from_slice(&encoder.encode(&payload));
    qname.push(b'.');
    qname.extend_from_slice(TOPDOMAIN.as_bytes());
    qname
}

/// Pull the raw rdata out of a NULL-type answer.
fn null_rdata(datagram: &[u8]) -> Vec<u8> {
    let mut pos = 12;
    while datagram[pos] != 0 {
        pos += 1 + datagram[pos] as usize;
    }
    pos += 1 + 4; // terminator, qtype, qclass
    pos += 2 + 2 + 2 + 4; // name pointer, type, class, ttl
    let rdlen = u16::from_be_bytes([datagram[pos], datagram[pos + 1]]) as usize;
    pos += 2;
    datagram[pos..pos + rdlen].to_vec()
}

fn sent_datagram(out: &[Output]) -> &[u8] {
    match out.first().expect("expected a response") {
        Output::Net { datagram, .. } => datagram,
        other => panic!("expected Net output, got {:?}", other),
    }
}

/// A minimal IPv4 packet addressed to `dest`.
fn ipv4_packet(dest: [u8; 4], payload_len: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 20 + payload_len];
    packet[0] = 0x45;
    let total = (20 + payload_len) as u16;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[12..16].copy_from_slice(&[192, 0, 2, 99]); // source, arbitrary
    packet[16..20].copy_from_slice(&dest);
    packet
}

/// Run the version handshake; returns `(uid, seed)`.
fn handshake(server: &mut Server, src: &str, id: u16) -> (u8, u32) {
    let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
    payload.extend_from_slice(&id.to_be_bytes()); // cmc
    let datagram = query_datagram(&cmd_qname(b'v', &payload), QueryType::Null, id);

    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(src), Instant::now(), &mut out);
    let rdata = null_rdata(sent_datagram(&out));

    assert_eq!(&rdata[..4], b"VACK");
    let seed = u32::from_be_bytes([rdata[4], rdata[5], rdata[6], rdata[7]]);
    (rdata[8], seed)
}

/// Handshake plus login; returns the uid.
fn login(server: &mut Server, src: &str, id_base: u16) -> u8 {
    let (uid, seed) = handshake(server, src, id_base);

    let mut payload = vec![uid];
    payload.extend_from_slice(&login_digest(PASSWORD, seed));
    payload.extend_from_slice(&id_base.to_be_bytes()); // cmc
    let datagram = query_datagram(&cmd_qname(b'l', &payload), QueryType::Null, id_base + 1);

    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(src), Instant::now(), &mut out);
    let rdata = null_rdata(sent_datagram(&out));
    assert!(
        rdata.contains(&b'-'),
        "login reply should be the address tuple, got {:?}",
        String::from_utf8_lossy(&rdata)
    );
    uid
}

// --- scenario A ---

#[test]
fn version_handshake_allocates_slot_and_raw_downenc() {
    let mut server = server();
    let (uid, seed) = handshake(&mut server, CLIENT, 100);

    assert_eq!(uid, 0);
    assert_ne!(seed, 0); // one in four billion runs may flake here; seed is random
    let user = server.users().get(0).unwrap();
    assert_eq!(user.state, SessionState::Versioned);
    assert_eq!(user.downenc, b'R'); // NULL query promotes raw downstream
}

#[test]
fn version_mismatch_rejected_with_server_version() {
    let mut server = server();
    let payload = 0x0000_0401u32.to_be_bytes();
    let datagram = query_datagram(&cmd_qname(b'v', &payload), QueryType::Null, 1);

    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);
    let rdata = null_rdata(sent_datagram(&out));

    assert_eq!(&rdata[..4], b"VNAK");
    assert_eq!(&rdata[4..8], &PROTOCOL_VERSION.to_be_bytes());
    assert_eq!(server.users().active_count(), 0);
}

// --- scenario B ---

#[test]
fn login_returns_address_tuple() {
    let mut server = server();
    let (uid, seed) = handshake(&mut server, CLIENT, 200);

    let mut payload = vec![uid];
    payload.extend_from_slice(&login_digest(PASSWORD, seed));
    let datagram = query_datagram(&cmd_qname(b'l', &payload), QueryType::Null, 201);

    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);
    let rdata = null_rdata(sent_datagram(&out));

    assert_eq!(rdata, b"10.0.0.1-10.0.0.2-1130-27");
    assert_eq!(
        server.users().get(uid).unwrap().state,
        SessionState::Authenticated
    );
}

#[test]
fn login_with_wrong_digest_rejected() {
    let mut server = server();
    let (uid, seed) = handshake(&mut server, CLIENT, 210);

    let mut payload = vec![uid];
    payload.extend_from_slice(&login_digest("wrong password", seed));
    let datagram = query_datagram(&cmd_qname(b'l', &payload), QueryType::Null, 211);

    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);
    assert_eq!(null_rdata(sent_datagram(&out)), b"LNAK");
    assert_eq!(
        server.users().get(uid).unwrap().state,
        SessionState::Versioned
    );
}

// --- scenario C ---

#[test]
fn codec_switch_flips_upstream_decoding() {
    let mut server = server();
    let uid = login(&mut server, CLIENT, 300);

    let payload = [uid, 7, 0, 1]; // codec 7 = Base128, then cmc
    let datagram = query_datagram(&cmd_qname(b's', &payload), QueryType::Null, 310);
    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);
    assert_eq!(null_rdata(sent_datagram(&out)), b"Base128");

    // a base128-encoded data fragment now decodes and routes out the tun
    let packet = ipv4_packet([192, 0, 2, 55], 4);
    let qname = data_qname(
        uid,
        Encoder::Base128,
        1,
        0,
        FLAG_START | FLAG_END,
        &packet,
    );
    let datagram = query_datagram(&qname, QueryType::Null, 311);
    out.clear();
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);

    assert!(
        out.iter().any(|o| matches!(o, Output::Tun { .. })),
        "reassembled packet should head for the tun device"
    );
}

// --- scenario D ---

#[test]
fn ping_with_respond_flag_yields_ping_frame() {
    let mut server = server();
    let uid = login(&mut server, CLIENT, 400);
    let now = Instant::now();

    // flags: update_timeout | respond
    let payload = [uid, 0, 8, 8, 0, 0, 0x03, 0xe8, 0b011, 0, 1];
    let datagram = query_datagram(&cmd_qname(b'p', &payload), QueryType::Null, 410);
    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), now, &mut out);
    assert!(out.is_empty(), "lazy ping must be parked, not answered");

    // respond flag makes the parked query immediately eligible
    let wait = server.pump(now, &mut out);
    assert_eq!(out.len(), 1);
    let frame = DownstreamFrame::parse(&null_rdata(sent_datagram(&out))).unwrap();
    let info = frame.ping.expect("respond flag forces a ping frame");
    assert_eq!(info.out_winsize, 8);
    assert!(frame.body.is_empty());
    assert!(wait <= Duration::from_secs(10));

    // the timeout request took: 1000ms now bounds the next deferral
    let datagram = query_datagram(
        &query_payload_with_cmc(uid, 2),
        QueryType::Null,
        411,
    );
    out.clear();
    server.handle_datagram(&datagram, addr(CLIENT), now, &mut out);
    let wait = server.pump(now, &mut out);
    assert!(wait <= Duration::from_millis(1000));
}

/// A plain parked ping (no respond flag) with a distinct CMC.
fn query_payload_with_cmc(uid: u8, cmc: u8) -> Vec<u8> {
    let payload = [uid, 0, 8, 8, 0, 0, 0x03, 0xe8, 0, cmc];
    cmd_qname(b'p', &payload)
}

// --- scenario E + properties 3 and 5 ---

#[test]
fn duplicate_data_query_gets_illegal_answer() {
    let mut server = server();
    let uid = login(&mut server, CLIENT, 500);

    let packet = ipv4_packet([192, 0, 2, 55], 0);
    let qname = data_qname(uid, Encoder::Base32, 9, 0, FLAG_START | FLAG_END, &packet);
    let datagram = query_datagram(&qname, QueryType::Null, 510);

    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);
    let pending = server.users().get(uid).unwrap().qmem.num_pending();
    assert_eq!(pending, 1);

    // identical retransmit: one illegal answer, qmem untouched
    out.clear();
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);
    assert_eq!(out.len(), 1);
    assert_eq!(null_rdata(sent_datagram(&out)), b"x");
    assert_eq!(server.users().get(uid).unwrap().qmem.num_pending(), 1);
}

#[test]
fn answered_query_replays_from_cache_exactly_once() {
    let mut server = server();
    let uid = login(&mut server, CLIENT, 550);
    let now = Instant::now();

    let datagram = query_datagram(&query_payload_with_cmc(uid, 7), QueryType::Null, 560);
    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), now, &mut out);

    // deadline forces the answer out
    let later = now + Duration::from_secs(6);
    server.pump(later, &mut out);
    assert_eq!(out.len(), 1);
    let original = sent_datagram(&out).to_vec();

    // impatient resolver retransmit: same bytes replayed from the cache
    out.clear();
    server.handle_datagram(&datagram, addr(CLIENT), later, &mut out);
    assert_eq!(sent_datagram(&out), &original[..]);

    // cache entry consumed: the same query is now treated as a duplicate
    out.clear();
    server.handle_datagram(&datagram, addr(CLIENT), later, &mut out);
    assert_eq!(null_rdata(sent_datagram(&out)), b"x");
}

// --- property 4 ---

#[test]
fn excess_pending_queries_drain_past_windowsize() {
    let mut server = server();
    let uid = login(&mut server, CLIENT, 600);
    let now = Instant::now();
    let mut out = Vec::new();

    // park more pings than the downstream window holds
    for i in 0..10u16 {
        let datagram = query_datagram(
            &query_payload_with_cmc(uid, i as u8),
            QueryType::Null,
            610 + i,
        );
        server.handle_datagram(&datagram, addr(CLIENT), now, &mut out);
    }
    assert!(out.is_empty());
    assert_eq!(server.users().get(uid).unwrap().qmem.num_pending(), 10);

    // windowsize is 8: the two excess queries must be released at once
    server.pump(now, &mut out);
    assert!(out.len() >= 2, "expected excess drain, got {}", out.len());
    assert!(server.users().get(uid).unwrap().qmem.num_pending() <= 8);
}

// --- property 6 ---

#[test]
fn ip_check_rejects_foreign_source() {
    let mut server = server();
    let uid = login(&mut server, CLIENT, 700);

    let payload = [uid, 5, 0, 2];
    let datagram = query_datagram(&cmd_qname(b's', &payload), QueryType::Null, 710);
    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr("198.51.100.77:40000"), Instant::now(), &mut out);

    assert_eq!(null_rdata(sent_datagram(&out)), b"BADIP");
    // no state change
    assert_eq!(
        server.users().get(uid).unwrap().upstream_encoder,
        Encoder::Base32
    );
}

#[test]
fn roaming_allowed_with_ip_check_off() {
    let mut cfg = config();
    cfg.check_ip = false;
    let mut server = Server::new(cfg).unwrap();
    let uid = login(&mut server, CLIENT, 750);

    let payload = [uid, 7, 0, 3];
    let datagram = query_datagram(&cmd_qname(b's', &payload), QueryType::Null, 760);
    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr("198.51.100.77:40000"), Instant::now(), &mut out);

    assert_eq!(null_rdata(sent_datagram(&out)), b"Base128");
}

// --- scenario F ---

#[test]
fn inter_user_traffic_routes_through_windows_not_tun() {
    let mut server = server();
    let uid_a = login(&mut server, "192.0.2.10:40000", 800);
    let uid_b = login(&mut server, "192.0.2.20:40000", 820);
    assert_ne!(uid_a, uid_b);

    let dest_b = server.users().get(uid_b).unwrap().tun_ip.octets();
    let packet = ipv4_packet(dest_b, 16);
    let qname = data_qname(uid_a, Encoder::Base32, 1, 0, FLAG_START | FLAG_END, &packet);
    let datagram = query_datagram(&qname, QueryType::Null, 830);

    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr("192.0.2.10:40000"), Instant::now(), &mut out);

    assert!(
        !out.iter().any(|o| matches!(o, Output::Tun { .. })),
        "inter-user packet must not touch the device"
    );
    assert!(
        !server.users().get(uid_b).unwrap().outgoing.is_empty(),
        "packet should sit in user B's downstream window"
    );
}

#[test]
fn downstream_fragment_carries_piggybacked_ack() {
    let mut server = server();
    let uid = login(&mut server, CLIENT, 900);
    let now = Instant::now();

    // upstream fragment seq 0 parks a query and produces a pending ACK
    let packet = ipv4_packet([192, 0, 2, 55], 2);
    let qname = data_qname(uid, Encoder::Base32, 3, 0, FLAG_START | FLAG_END, &packet);
    let datagram = query_datagram(&qname, QueryType::Null, 910);
    let mut out = Vec::new();
    server.handle_datagram(&datagram, addr(CLIENT), now, &mut out);
    out.retain(|o| matches!(o, Output::Net { .. }));

    // pending ACK makes the parked query eligible right away
    server.pump(now, &mut out);
    assert_eq!(out.len(), 1);
    let frame = DownstreamFrame::parse(&null_rdata(sent_datagram(&out))).unwrap();
    assert_eq!(frame.ack, 0, "cumulative ack for upstream seq 0");
}

#[test]
fn upstream_ack_flag_required_for_ack_processing() {
    // a data fragment without FLAG_ACK_VALID must not ack anything
    let mut server = server();
    let uid = login(&mut server, CLIENT, 950);

    // queue downstream data so there is something to ack
    let dest = server.users().get(uid).unwrap().tun_ip.octets();
    let tun_frame = {
        let packet = ipv4_packet(dest, 8);
        let mut frame = vec![0, 0, 0x08, 0];
        frame.extend_from_slice(&packet);
        frame
    };
    let mut out = Vec::new();
    server.handle_tun_frame(&tun_frame, Instant::now(), &mut out);
    assert!(!server.users().get(uid).unwrap().outgoing.is_empty());

    let packet = ipv4_packet([192, 0, 2, 55], 0);
    let qname = data_qname(uid, Encoder::Base32, 5, 0, FLAG_START | FLAG_END, &packet);
    let datagram = query_datagram(&qname, QueryType::Null, 960);
    server.handle_datagram(&datagram, addr(CLIENT), Instant::now(), &mut out);

    // ack byte was 0 but not flagged valid: downstream window unchanged
    assert!(!server.users().get(uid).unwrap().outgoing.is_empty());
}
