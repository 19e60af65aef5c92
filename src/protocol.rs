//! Session protocol: command dispatch and frame formats
//!
//! A tunnel query's first qname byte selects a command; the rest of the
//! name (dots stripped) carries the command's parameters. Control commands
//! always travel in base32 — the user id lives *inside* the encoded payload,
//! so a negotiated per-user codec could never bootstrap — while data
//! fragments name their user with a plaintext hex nibble and encode the
//! remainder with that user's negotiated upstream codec.
//!
//! Downstream, every answer body is one `DownstreamFrame`: a 3-byte header
//! (7 with ping info) followed by the fragment payload.

use crate::encoder::Encoder;

/// Compared byte-exact during the version handshake.
pub const PROTOCOL_VERSION: u32 = 0x0000_0502;

/// Downstream header bytes without / with the ping block.
pub const DOWNSTREAM_HDR: usize = 3;
pub const DOWNSTREAM_PING_HDR: usize = 7;

/// Handshake / error reply payloads.
pub const VACK: &[u8] = b"VACK";
pub const VNAK: &[u8] = b"VNAK";
pub const VFUL: &[u8] = b"VFUL";
pub const LNAK: &[u8] = b"LNAK";
pub const BADIP: &[u8] = b"BADIP";
pub const BADLEN: &[u8] = b"BADLEN";
pub const BADCODEC: &[u8] = b"BADCODEC";
pub const BADFRAG: &[u8] = b"BADFRAG";

/// Reply to a duplicate query: clients recognize it as "retransmit with a
/// fresh CMC". Always sent under downstream encoding 'T'.
pub const ILLEGAL_ANSWER: &[u8] = b"x";

/// Byte-class probe served for the `Y` downstream codec check.
pub const DOWNCODEC_CHECK: [u8; 48] = [
    0x00, 0xff, 0x7f, 0x80, 0x01, 0xfe, 0x02, 0xfd, 0x2d, 0x2e, 0x5f, 0x2b, 0x30, 0x39, 0x41,
    0x5a, 0x61, 0x7a, 0xaa, 0x55, 0xc3, 0x3c, 0xf0, 0x0f, 0x10, 0xef, 0x20, 0xdf, 0x40, 0xbf,
    0x88, 0x77, 0x99, 0x66, 0xb4, 0x4b, 0xd2, 0x2d, 0xe1, 0x1e, 0x08, 0xf7, 0x04, 0xfb, 0xcc,
    0x33, 0x5e, 0xa1,
];

// Downstream header flag bits
pub const FLAG_END: u8 = 1 << 0;
pub const FLAG_START: u8 = 1 << 1;
pub const FLAG_COMPRESSED: u8 = 1 << 2;
pub const FLAG_ACK_VALID: u8 = 1 << 3;
pub const FLAG_PING: u8 = 1 << 4;
pub const FLAG_IMMEDIATE: u8 = 1 << 5;

// Ping request flag bits
const PING_UPDATE_TIMEOUT: u8 = 1 << 0;
const PING_RESPOND: u8 = 1 << 1;
const PING_ACK_VALID: u8 = 1 << 2;

/// Why a qname failed to parse as a tunnel command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// Name is not under the topdomain; candidate for the forwarder
    NotTunnel,
    /// Under the topdomain but no recognizable command byte
    UnknownCommand,
    /// Recognized command with a short or inconsistent payload
    BadLength,
    /// Payload failed to decode under the expected codec
    Undecodable,
}

/// Ping request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingFlags {
    pub update_timeout: bool,
    pub respond: bool,
    pub dn_ack_valid: bool,
}

impl PingFlags {
    fn from_byte(b: u8) -> Self {
        Self {
            update_timeout: b & PING_UPDATE_TIMEOUT != 0,
            respond: b & PING_RESPOND != 0,
            dn_ack_valid: b & PING_ACK_VALID != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.update_timeout {
            b |= PING_UPDATE_TIMEOUT;
        }
        if self.respond {
            b |= PING_RESPOND;
        }
        if self.dn_ack_valid {
            b |= PING_ACK_VALID;
        }
        b
    }
}

/// A decoded upstream data fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamData {
    pub cmc: u8,
    pub seq: u8,
    /// -1 when the fragment carries no ACK
    pub ack_other: i16,
    pub start: bool,
    pub end: bool,
    pub compressed: bool,
    pub body: Vec<u8>,
}

/// A parsed tunnel command with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version {
        version: u32,
    },
    Login {
        uid: u8,
        digest: [u8; 16],
    },
    IpRequest {
        uid: u8,
    },
    /// `Z` probe: the response echoes the raw qname so the client can
    /// detect case-mangling resolvers
    CaseCheck,
    SwitchCodec {
        uid: u8,
        codec_id: u8,
    },
    Options {
        uid: u8,
        opts: Vec<u8>,
    },
    DownCodecCheck {
        variant: u8,
        downenc: u8,
    },
    FragsizeProbe {
        uid: u8,
        req_size: u16,
    },
    FragsizeSet {
        uid: u8,
        fragsize: u16,
    },
    Ping {
        uid: u8,
        dn_ack: u8,
        up_winsize: u8,
        dn_winsize: u8,
        up_seq: u8,
        dn_seq: u8,
        timeout_ms: u16,
        flags: PingFlags,
    },
    Data {
        uid: u8,
        frame: UpstreamData,
    },
}

impl Command {
    /// The user slot this command claims, if any.
    pub fn uid(&self) -> Option<u8> {
        match *self {
            Command::Login { uid, .. }
            | Command::IpRequest { uid }
            | Command::SwitchCodec { uid, .. }
            | Command::Options { uid, .. }
            | Command::FragsizeProbe { uid, .. }
            | Command::FragsizeSet { uid, .. }
            | Command::Ping { uid, .. }
            | Command::Data { uid, .. } => Some(uid),
            _ => None,
        }
    }

    /// Whether this command is answered synchronously (never qmem-parked).
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Command::Version { .. }
                | Command::CaseCheck
                | Command::DownCodecCheck { .. }
                | Command::FragsizeProbe { .. }
        )
    }

    /// Parse a tunnel query name. `data_encoder` maps a user slot to its
    /// negotiated upstream codec for the data-fragment body.
    pub fn from_qname(
        qname: &[u8],
        topdomain: &[u8],
        data_encoder: impl Fn(u8) -> Encoder,
    ) -> Result<Self, CommandError> {
        let head = tunnel_payload(qname, topdomain).ok_or(CommandError::NotTunnel)?;
        let (&cmd, rest) = head.split_first().ok_or(CommandError::UnknownCommand)?;
        let rest = strip_dots(rest);

        if let Some(uid) = hex_nibble(cmd) {
            let encoder = data_encoder(uid);
            let payload = encoder
                .decode(&rest)
                .map_err(|_| CommandError::Undecodable)?;
            if payload.len() < 4 {
                return Err(CommandError::BadLength);
            }
            let flags = payload[3];
            let ack_valid = flags & FLAG_ACK_VALID != 0;
            return Ok(Command::Data {
                uid,
                frame: UpstreamData {
                    cmc: payload[0],
                    seq: payload[1],
                    ack_other: if ack_valid { payload[2] as i16 } else { -1 },
                    start: flags & FLAG_START != 0,
                    end: flags & FLAG_END != 0,
                    compressed: flags & FLAG_COMPRESSED != 0,
                    body: payload[4..].to_vec(),
                },
            });
        }

        match cmd.to_ascii_uppercase() {
            b'Z' => return Ok(Command::CaseCheck),
            b'V' | b'L' | b'I' | b'S' | b'O' | b'Y' | b'R' | b'N' | b'P' => {}
            _ => return Err(CommandError::UnknownCommand),
        }

        let payload = Encoder::Base32
            .decode(&rest)
            .map_err(|_| CommandError::Undecodable)?;

        match cmd.to_ascii_uppercase() {
            b'V' => {
                if payload.len() < 4 {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::Version {
                    version: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                })
            }
            b'L' => {
                if payload.len() < 17 {
                    return Err(CommandError::BadLength);
                }
                let mut digest = [0u8; 16];
                digest.copy_from_slice(&payload[1..17]);
                Ok(Command::Login {
                    uid: payload[0],
                    digest,
                })
            }
            b'I' => {
                if payload.is_empty() {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::IpRequest { uid: payload[0] })
            }
            b'S' => {
                if payload.len() < 2 {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::SwitchCodec {
                    uid: payload[0],
                    codec_id: payload[1],
                })
            }
            b'O' => {
                if payload.len() < 2 {
                    return Err(CommandError::BadLength);
                }
                let n = payload[1] as usize;
                if payload.len() < 2 + n {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::Options {
                    uid: payload[0],
                    opts: payload[2..2 + n].to_vec(),
                })
            }
            b'Y' => {
                if payload.len() < 2 {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::DownCodecCheck {
                    variant: payload[0],
                    downenc: payload[1],
                })
            }
            b'R' => {
                if payload.len() < 3 {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::FragsizeProbe {
                    uid: payload[0],
                    req_size: u16::from_be_bytes([payload[1], payload[2]]),
                })
            }
            b'N' => {
                if payload.len() < 3 {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::FragsizeSet {
                    uid: payload[0],
                    fragsize: u16::from_be_bytes([payload[1], payload[2]]),
                })
            }
            b'P' => {
                if payload.len() < 9 {
                    return Err(CommandError::BadLength);
                }
                Ok(Command::Ping {
                    uid: payload[0],
                    dn_ack: payload[1],
                    up_winsize: payload[2],
                    dn_winsize: payload[3],
                    up_seq: payload[4],
                    dn_seq: payload[5],
                    timeout_ms: u16::from_be_bytes([payload[6], payload[7]]),
                    flags: PingFlags::from_byte(payload[8]),
                })
            }
            _ => unreachable!("command byte filtered above"),
        }
    }
}

/// The payload portion of a tunnel qname: everything before `.topdomain`,
/// matched case-insensitively. Returns `None` for foreign names and for
/// the bare topdomain itself.
pub fn tunnel_payload<'a>(qname: &'a [u8], topdomain: &[u8]) -> Option<&'a [u8]> {
    if qname.len() <= topdomain.len() + 1 {
        return None;
    }
    let split = qname.len() - topdomain.len();
    let (head, tail) = qname.split_at(split);
    if !tail.eq_ignore_ascii_case(topdomain) || head[head.len() - 1] != b'.' {
        return None;
    }
    Some(&head[..head.len() - 1])
}

/// Is this name the topdomain itself (zone apex queries, e.g. NS)?
pub fn is_topdomain(qname: &[u8], topdomain: &[u8]) -> bool {
    qname.eq_ignore_ascii_case(topdomain)
}

fn strip_dots(text: &[u8]) -> Vec<u8> {
    text.iter().copied().filter(|&b| b != b'.').collect()
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Window descriptors carried in a downstream ping frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingInfo {
    pub out_winsize: u8,
    pub in_winsize: u8,
    pub out_start_seq: u8,
    pub in_start_seq: u8,
}

/// One downstream answer body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamFrame {
    pub seq: u8,
    /// -1 when no upstream ACK is piggybacked
    pub ack: i16,
    pub start: bool,
    pub end: bool,
    pub compressed: bool,
    /// Answered because data/ACK was ready, not because a timeout fired
    pub immediate: bool,
    pub ping: Option<PingInfo>,
    pub body: Vec<u8>,
}

impl DownstreamFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DOWNSTREAM_PING_HDR + self.body.len());
        out.push(self.seq);
        out.push(if self.ack >= 0 { self.ack as u8 } else { 0 });

        let mut flags = 0u8;
        if self.end {
            flags |= FLAG_END;
        }
        if self.start {
            flags |= FLAG_START;
        }
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.ack >= 0 {
            flags |= FLAG_ACK_VALID;
        }
        if self.ping.is_some() {
            flags |= FLAG_PING;
        }
        if self.immediate {
            flags |= FLAG_IMMEDIATE;
        }
        out.push(flags);

        if let Some(info) = self.ping {
            out.push(info.out_winsize);
            out.push(info.in_winsize);
            out.push(info.out_start_seq);
            out.push(info.in_start_seq);
        }
        out.extend_from_slice(&self.body);
        out
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DOWNSTREAM_HDR {
            return None;
        }
        let flags = bytes[2];
        let ping = flags & FLAG_PING != 0;
        let hdr = if ping {
            DOWNSTREAM_PING_HDR
        } else {
            DOWNSTREAM_HDR
        };
        if bytes.len() < hdr {
            return None;
        }
        Some(Self {
            seq: bytes[0],
            ack: if flags & FLAG_ACK_VALID != 0 {
                bytes[1] as i16
            } else {
                -1
            },
            start: flags & FLAG_START != 0,
            end: flags & FLAG_END != 0,
            compressed: flags & FLAG_COMPRESSED != 0,
            immediate: flags & FLAG_IMMEDIATE != 0,
            ping: ping.then(|| PingInfo {
                out_winsize: bytes[3],
                in_winsize: bytes[4],
                out_start_seq: bytes[5],
                in_start_seq: bytes[6],
            }),
            body: bytes[hdr..].to_vec(),
        })
    }
}

/// Challenge-response digest: `md5(pad32(password) ‖ seed_be32)`.
pub fn login_digest(password: &str, seed: u32) -> [u8; 16] {
    let mut buf = [0u8; 36];
    let pass = password.as_bytes();
    let n = pass.len().min(32);
    buf[..n].copy_from_slice(&pass[..n]);
    buf[32..].copy_from_slice(&seed.to_be_bytes());
    md5::compute(buf).0
}

/// Raw-UDP login sends `seed+1`, the server proves itself with `seed-1`.
pub fn raw_login_digest(password: &str, seed: u32) -> [u8; 16] {
    login_digest(password, seed.wrapping_add(1))
}

pub fn raw_login_response_digest(password: &str, seed: u32) -> [u8; 16] {
    login_digest(password, seed.wrapping_sub(1))
}

/// Deterministic payload for the `R` fragsize probe: the requested size
/// echoed big-endian, then the 107-step pattern.
pub fn fragsize_probe_data(req_size: u16) -> Vec<u8> {
    let len = req_size as usize;
    let mut data = vec![0u8; len];
    if len > 0 {
        data[0] = (req_size >> 8) as u8;
    }
    if len > 1 {
        data[1] = (req_size & 0xff) as u8;
    }
    for (k, byte) in data.iter_mut().enumerate().skip(2) {
        *byte = ((k - 1) * 107 % 256) as u8;
    }
    data
}
