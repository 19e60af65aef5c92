//! Minimal DNS wire codec for the tunnel
//!
//! Implements just enough of the DNS protocol to:
//! - Parse an incoming query datagram into `{id, type, qname, src}`
//! - Emit answer datagrams of types A/CNAME/MX/SRV/TXT/NULL/PRIVATE/NS
//! - Emit bare RCODE responses for non-tunnel traffic
//!
//! Query names are kept as raw bytes throughout: the base128 upstream
//! alphabet and the `Z` case probe both depend on seeing exactly the octets
//! that arrived on the wire.

use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use std::net::{Ipv4Addr, SocketAddr};

use crate::encoder::Encoder;
use crate::{Result, TunnelError};

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum total name length
pub const MAX_NAME_LEN: usize = 255;

/// RCODE values the server emits for non-tunnel queries
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_NULL: u16 = 10;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_SRV: u16 = 33;
/// Private-use RRtype carried by clients that can do arbitrary rdata
const TYPE_PRIVATE: u16 = 65399;

const CLASS_IN: u16 = 1;
const ANSWER_TTL: u32 = 0;

/// Question record types the tunnel understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    A,
    Ns,
    Cname,
    Null,
    Mx,
    Txt,
    Srv,
    Private,
    Other(u16),
}

impl QueryType {
    pub fn from_wire(value: u16) -> Self {
        match value {
            TYPE_A => QueryType::A,
            TYPE_NS => QueryType::Ns,
            TYPE_CNAME => QueryType::Cname,
            TYPE_NULL => QueryType::Null,
            TYPE_MX => QueryType::Mx,
            TYPE_TXT => QueryType::Txt,
            TYPE_SRV => QueryType::Srv,
            TYPE_PRIVATE => QueryType::Private,
            other => QueryType::Other(other),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            QueryType::A => TYPE_A,
            QueryType::Ns => TYPE_NS,
            QueryType::Cname => TYPE_CNAME,
            QueryType::Null => TYPE_NULL,
            QueryType::Mx => TYPE_MX,
            QueryType::Txt => TYPE_TXT,
            QueryType::Srv => TYPE_SRV,
            QueryType::Private => TYPE_PRIVATE,
            QueryType::Other(other) => other,
        }
    }

    /// Whether answers of this type carry raw bytes (no hostname encoding)
    pub fn carries_raw(self) -> bool {
        matches!(self, QueryType::Null | QueryType::Private)
    }
}

/// A parsed incoming query
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub qtype: QueryType,
    /// Raw qname octets, labels joined with '.', original case preserved
    pub qname: Vec<u8>,
    pub src: SocketAddr,
}

impl DnsQuery {
    /// Lossy printable form of the qname for logging
    pub fn qname_display(&self) -> String {
        String::from_utf8_lossy(&self.qname).into_owned()
    }
}

/// Parse a query datagram. Responses and empty-question messages are
/// rejected; the caller drops them silently.
pub fn parse_query(datagram: &[u8], src: SocketAddr) -> Result<DnsQuery> {
    let mut buf = Cursor::new(datagram);

    if buf.remaining() < 12 {
        return Err(TunnelError::MalformedDns("header too short".into()));
    }

    let id = buf.get_u16();
    let flags = buf.get_u16();
    let qdcount = buf.get_u16();
    buf.advance(6); // ancount, nscount, arcount

    if flags & 0x8000 != 0 {
        return Err(TunnelError::MalformedDns("not a query".into()));
    }
    if qdcount == 0 {
        return Err(TunnelError::MalformedDns("no question".into()));
    }

    let qname = read_name(&mut buf)?;

    if buf.remaining() < 4 {
        return Err(TunnelError::MalformedDns("question too short".into()));
    }
    let qtype = QueryType::from_wire(buf.get_u16());
    buf.get_u16(); // qclass

    Ok(DnsQuery {
        id,
        qtype,
        qname,
        src,
    })
}

/// Rdata forms the tunnel emits, selected by the query's record type.
#[derive(Debug)]
pub enum Rdata {
    /// CNAME answer carrying a hostname-encoded name
    Name(Vec<u8>),
    /// MX/SRV chain: one record per hostname-encoded chunk
    NameChain(Vec<Vec<u8>>),
    /// Single TXT character-string (content already encoder-prefixed)
    Txt(Vec<u8>),
    /// NULL/PRIVATE raw bytes
    Raw(Vec<u8>),
    /// NS referral plus an optional glue address
    Ns(Vec<u8>, Option<Ipv4Addr>),
}

/// Build a standard response echoing the question, with rdata per `answer`.
pub fn build_response(query: &DnsQuery, answer: &Rdata) -> Vec<u8> {
    let (ancount, arcount) = match answer {
        Rdata::NameChain(chunks) => (chunks.len() as u16, 0),
        Rdata::Ns(_, Some(_)) => (1, 1),
        _ => (1, 0),
    };

    let mut buf = BytesMut::with_capacity(512);
    put_header(&mut buf, query.id, 0x8180, 1, ancount, arcount);
    put_question(&mut buf, query);

    match answer {
        Rdata::Name(name) => {
            put_record_header(&mut buf, TYPE_CNAME);
            let rdata = name_to_wire(name);
            buf.put_u16(rdata.len() as u16);
            buf.put_slice(&rdata);
        }
        Rdata::NameChain(chunks) => {
            for (i, chunk) in chunks.iter().enumerate() {
                put_record_header(&mut buf, query.qtype.to_wire());
                let name = name_to_wire(chunk);
                match query.qtype {
                    QueryType::Srv => {
                        buf.put_u16((name.len() + 6) as u16);
                        buf.put_u16(10 * (i as u16 + 1)); // priority
                        buf.put_u16(5); // weight
                        buf.put_u16(5060); // port
                    }
                    _ => {
                        buf.put_u16((name.len() + 2) as u16);
                        buf.put_u16(10 * (i as u16 + 1)); // preference
                    }
                }
                buf.put_slice(&name);
            }
        }
        Rdata::Txt(content) => {
            put_record_header(&mut buf, TYPE_TXT);
            // TXT character-strings carry at most 255 bytes each
            let strings: Vec<&[u8]> = content.chunks(255).collect();
            let rdlen: usize = strings.iter().map(|s| s.len() + 1).sum();
            buf.put_u16(rdlen as u16);
            for s in strings {
                buf.put_u8(s.len() as u8);
                buf.put_slice(s);
            }
        }
        Rdata::Raw(bytes) => {
            put_record_header(&mut buf, query.qtype.to_wire());
            buf.put_u16(bytes.len() as u16);
            buf.put_slice(bytes);
        }
        Rdata::Ns(name, glue) => {
            put_record_header(&mut buf, TYPE_NS);
            let rdata = name_to_wire(name);
            buf.put_u16(rdata.len() as u16);
            buf.put_slice(&rdata);
            if let Some(ip) = glue {
                let target = name_to_wire(name);
                buf.put_slice(&target);
                buf.put_u16(TYPE_A);
                buf.put_u16(CLASS_IN);
                buf.put_u32(ANSWER_TTL);
                buf.put_u16(4);
                buf.put_slice(&ip.octets());
            }
        }
    }

    buf.to_vec()
}

/// Build an answerless response carrying only an RCODE.
pub fn build_rcode_response(query: &DnsQuery, rcode: u8) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    put_header(&mut buf, query.id, 0x8180 | rcode as u16, 1, 0, 0);
    put_question(&mut buf, query);
    buf.to_vec()
}

/// Encode tunnel bytes into a hostname under `topdomain`:
/// `<codec char><2-char counter><encoded labels>.<topdomain>`.
///
/// The 10-bit counter rotates per answer so cache-happy resolvers never
/// see the same name twice for different data.
pub fn encode_hostname(
    data: &[u8],
    encoder: Encoder,
    topdomain: &[u8],
    counter: &mut u16,
) -> Vec<u8> {
    let prefix = encoder.hostname_prefix().unwrap_or(b'h');
    *counter = (*counter + 1) & 0x3ff;
    let cmc = [
        b"abcdefghijklmnopqrstuvwxyz012345"[(*counter >> 5) as usize],
        b"abcdefghijklmnopqrstuvwxyz012345"[(*counter & 0x1f) as usize],
    ];

    let mut head = Vec::with_capacity(3 + data.len() * 2);
    head.push(prefix);
    head.extend_from_slice(&cmc);
    head.extend_from_slice(&encoder.encode(data));

    let mut name = Vec::with_capacity(head.len() + head.len() / MAX_LABEL_LEN + topdomain.len() + 2);
    for label in head.chunks(MAX_LABEL_LEN) {
        if !name.is_empty() {
            name.push(b'.');
        }
        name.extend_from_slice(label);
    }
    name.push(b'.');
    name.extend_from_slice(topdomain);
    name
}

/// Raw bytes that fit in one hostname-encoded answer under `topdomain`.
pub fn max_hostname_payload(encoder: Encoder, topdomain_len: usize) -> usize {
    // name budget minus topdomain, separator dots, codec char and counter
    let budget = MAX_NAME_LEN - topdomain_len - 1;
    let chars = budget * MAX_LABEL_LEN / (MAX_LABEL_LEN + 1);
    encoder.max_raw_len(chars.saturating_sub(3))
}

fn put_header(buf: &mut BytesMut, id: u16, flags: u16, qd: u16, an: u16, ar: u16) {
    buf.put_u16(id);
    buf.put_u16(flags);
    buf.put_u16(qd);
    buf.put_u16(an);
    buf.put_u16(0);
    buf.put_u16(ar);
}

fn put_question(buf: &mut BytesMut, query: &DnsQuery) {
    buf.put_slice(&name_to_wire(&query.qname));
    buf.put_u16(query.qtype.to_wire());
    buf.put_u16(CLASS_IN);
}

/// Answer name is always a compression pointer back to the question.
fn put_record_header(buf: &mut BytesMut, rtype: u16) {
    buf.put_slice(&[0xc0, 0x0c]);
    buf.put_u16(rtype);
    buf.put_u16(CLASS_IN);
    buf.put_u32(ANSWER_TTL);
}

/// Dotted raw name to wire labels.
fn name_to_wire(name: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split(|&b| b == b'.') {
        if label.is_empty() {
            continue;
        }
        out.push(label.len().min(MAX_LABEL_LEN) as u8);
        out.extend_from_slice(&label[..label.len().min(MAX_LABEL_LEN)]);
    }
    out.push(0);
    out
}

/// Read a wire name into dotted raw bytes. Compression pointers end the
/// name; the tunnel never emits queries that need chasing them.
fn read_name(buf: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let mut name = Vec::with_capacity(MAX_NAME_LEN);
    let mut labels = 0;

    loop {
        if labels > 127 {
            return Err(TunnelError::MalformedDns("too many labels".into()));
        }
        labels += 1;

        if !buf.has_remaining() {
            return Err(TunnelError::MalformedDns("truncated name".into()));
        }
        let len = buf.get_u8();

        if len == 0 {
            break;
        }
        if len & 0xc0 == 0xc0 {
            if buf.has_remaining() {
                buf.get_u8();
            }
            break;
        }

        let len = len as usize;
        if buf.remaining() < len {
            return Err(TunnelError::MalformedDns("truncated label".into()));
        }
        if !name.is_empty() {
            name.push(b'.');
        }
        let start = buf.position() as usize;
        name.extend_from_slice(&buf.get_ref()[start..start + len]);
        buf.advance(len);

        if name.len() > MAX_NAME_LEN {
            return Err(TunnelError::MalformedDns("name too long".into()));
        }
    }

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_src() -> SocketAddr {
        "192.0.2.7:53000".parse().unwrap()
    }

    fn query_datagram(qname: &[u8], qtype: u16, id: u16) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_header(&mut buf, id, 0x0100, 1, 0, 0);
        buf.put_slice(&name_to_wire(qname));
        buf.put_u16(qtype);
        buf.put_u16(CLASS_IN);
        buf.to_vec()
    }

    #[test]
    fn test_parse_query_roundtrip() {
        let datagram = query_datagram(b"vaabbcc.t.example.com", TYPE_NULL, 0x1234);
        let q = parse_query(&datagram, test_src()).unwrap();

        assert_eq!(q.id, 0x1234);
        assert_eq!(q.qtype, QueryType::Null);
        assert_eq!(q.qname, b"vaabbcc.t.example.com");
    }

    #[test]
    fn test_parse_rejects_response_and_truncation() {
        let mut datagram = query_datagram(b"a.t.example.com", TYPE_A, 1);
        datagram[2] |= 0x80; // QR bit
        assert!(parse_query(&datagram, test_src()).is_err());

        let datagram = query_datagram(b"a.t.example.com", TYPE_A, 1);
        assert!(parse_query(&datagram[..10], test_src()).is_err());
    }

    #[test]
    fn test_null_response_carries_raw_bytes() {
        let datagram = query_datagram(b"0abc.t.example.com", TYPE_NULL, 9);
        let q = parse_query(&datagram, test_src()).unwrap();

        let payload = vec![0x00, 0xff, 0x10, 0x80];
        let resp = build_response(&q, &Rdata::Raw(payload.clone()));

        // Header id + response flag
        assert_eq!(&resp[0..2], &[0x00, 0x09]);
        assert_eq!(resp[2] & 0x80, 0x80);
        // Raw payload is the rdata tail
        assert_eq!(&resp[resp.len() - payload.len()..], &payload[..]);
    }

    #[test]
    fn test_txt_response_splits_strings() {
        let datagram = query_datagram(b"p.t.example.com", TYPE_TXT, 2);
        let q = parse_query(&datagram, test_src()).unwrap();

        let content = vec![b'x'; 300];
        let resp = build_response(&q, &Rdata::Txt(content));

        // Two character-strings: 255 + 45
        let rdata_start = resp.len() - 302;
        assert_eq!(resp[rdata_start], 255);
        assert_eq!(resp[rdata_start + 256], 45);
    }

    #[test]
    fn test_hostname_counter_rotates() {
        let mut counter = 0u16;
        let a = encode_hostname(b"data", Encoder::Base32, b"t.example.com", &mut counter);
        let b = encode_hostname(b"data", Encoder::Base32, b"t.example.com", &mut counter);

        assert_ne!(a, b);
        assert!(a.ends_with(b".t.example.com"));
        assert_eq!(a[0], b'h');
        assert!(a.len() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_hostname_respects_label_limit() {
        let mut counter = 0u16;
        let payload = vec![0xabu8; 120];
        let name = encode_hostname(&payload, Encoder::Base128, b"t.example.com", &mut counter);

        for label in name.split(|&b| b == b'.') {
            assert!(label.len() <= MAX_LABEL_LEN);
        }
    }

    #[test]
    fn test_max_hostname_payload_fits() {
        let topdomain = b"t.example.com";
        let max = max_hostname_payload(Encoder::Base32, topdomain.len());
        let mut counter = 0;
        let name = encode_hostname(&vec![0u8; max], Encoder::Base32, topdomain, &mut counter);
        assert!(name.len() <= MAX_NAME_LEN, "{} > 255", name.len());
    }

    #[test]
    fn test_rcode_response() {
        let datagram = query_datagram(b"www.unrelated.org", TYPE_A, 77);
        let q = parse_query(&datagram, test_src()).unwrap();
        let resp = build_rcode_response(&q, RCODE_NXDOMAIN);

        assert_eq!(resp[3] & 0x0f, RCODE_NXDOMAIN);
        // no answers
        assert_eq!(&resp[6..8], &[0, 0]);
    }

    #[test]
    fn test_mx_chain() {
        let datagram = query_datagram(b"p.t.example.com", TYPE_MX, 5);
        let q = parse_query(&datagram, test_src()).unwrap();

        let chunks = vec![b"h1chunk.t.example.com".to_vec(), b"h2chunk.t.example.com".to_vec()];
        let resp = build_response(&q, &Rdata::NameChain(chunks));
        // ancount == 2
        assert_eq!(&resp[6..8], &[0, 2]);
    }
}
