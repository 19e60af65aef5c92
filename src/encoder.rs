//! Upstream/downstream payload codecs
//!
//! Reversible mappings between raw bytes and DNS-label-safe text for the
//! four negotiable alphabets (5/6/6/7 bits per character) plus `raw`.
//! Upstream data arrives inside query names, so every alphabet here must
//! survive a hostname label; base128 additionally leans on high-byte
//! characters that most resolvers pass through untouched.

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use data_encoding::{Encoding, Specification};
use std::sync::LazyLock;

use crate::{Result, TunnelError};

/// Lowercase base32, case-folded on decode. DNS resolvers may flip label
/// case in flight, so the 5-bit alphabet must decode either case.
static BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz012345");
    spec.translate.from.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZ");
    spec.translate.to.push_str("abcdefghijklmnopqrstuvwxyz");
    spec.check_trailing_bits = false;
    spec.encoding().expect("static base32 spec")
});

const B64_SYMBOLS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-";
const B64U_SYMBOLS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

static BASE64: LazyLock<GeneralPurpose> = LazyLock::new(|| hostname_b64(B64_SYMBOLS));
static BASE64U: LazyLock<GeneralPurpose> = LazyLock::new(|| hostname_b64(B64U_SYMBOLS));

fn hostname_b64(symbols: &str) -> GeneralPurpose {
    let alphabet = Alphabet::new(symbols).expect("static base64 alphabet");
    let config = GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true);
    GeneralPurpose::new(&alphabet, config)
}

/// 7-bit alphabet: 64 ASCII characters followed by 64 high-byte characters.
/// Case-sensitive; the `Z` probe exists to detect resolvers that break it.
static BASE128_ALPHABET: LazyLock<[u8; 128]> = LazyLock::new(|| {
    let mut table = [0u8; 128];
    let ascii = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+-";
    table[..64].copy_from_slice(ascii);
    for (i, slot) in table[64..].iter_mut().enumerate() {
        *slot = 0xbc + i as u8;
    }
    table
});

/// Reverse table for base128; 0xff marks characters outside the alphabet.
static BASE128_REVERSE: LazyLock<[u8; 256]> = LazyLock::new(|| {
    let mut rev = [0xffu8; 256];
    for (value, &ch) in BASE128_ALPHABET.iter().enumerate() {
        rev[ch as usize] = value as u8;
    }
    rev
});

/// A negotiated upstream (or hostname-downstream) payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoder {
    #[default]
    Base32,
    Base64,
    Base64u,
    Base128,
    Raw,
}

impl Encoder {
    /// Codec selected by the `S` (switch codec) command.
    pub fn from_codec_id(id: u8) -> Option<Self> {
        match id {
            5 => Some(Encoder::Base32),
            6 => Some(Encoder::Base64),
            26 => Some(Encoder::Base64u),
            7 => Some(Encoder::Base128),
            _ => None,
        }
    }

    /// Codec implied by a downstream-encoding option letter.
    pub fn from_downenc(downenc: u8) -> Option<Self> {
        match downenc.to_ascii_uppercase() {
            b'T' => Some(Encoder::Base32),
            b'S' => Some(Encoder::Base64),
            b'U' => Some(Encoder::Base64u),
            b'V' => Some(Encoder::Base128),
            b'R' => Some(Encoder::Raw),
            _ => None,
        }
    }

    /// Name echoed back to the client on a codec switch.
    pub fn name(self) -> &'static str {
        match self {
            Encoder::Base32 => "Base32",
            Encoder::Base64 => "Base64",
            Encoder::Base64u => "Base64u",
            Encoder::Base128 => "Base128",
            Encoder::Raw => "Raw",
        }
    }

    /// Payload bits carried per encoded character.
    pub fn bits_per_char(self) -> u32 {
        match self {
            Encoder::Base32 => 5,
            Encoder::Base64 | Encoder::Base64u => 6,
            Encoder::Base128 => 7,
            Encoder::Raw => 8,
        }
    }

    /// Hostname-answer prefix character identifying this codec to the client.
    pub fn hostname_prefix(self) -> Option<u8> {
        match self {
            Encoder::Base32 => Some(b'h'),
            Encoder::Base64 => Some(b'i'),
            Encoder::Base64u => Some(b'j'),
            Encoder::Base128 => Some(b'k'),
            Encoder::Raw => None,
        }
    }

    /// Raw bytes that fit in `chars` encoded characters.
    pub fn max_raw_len(self, chars: usize) -> usize {
        chars * self.bits_per_char() as usize / 8
    }

    pub fn encode(self, data: &[u8]) -> Vec<u8> {
        match self {
            Encoder::Base32 => BASE32.encode(data).into_bytes(),
            Encoder::Base64 => BASE64.encode(data).into_bytes(),
            Encoder::Base64u => BASE64U.encode(data).into_bytes(),
            Encoder::Base128 => base128_encode(data),
            Encoder::Raw => data.to_vec(),
        }
    }

    pub fn decode(self, text: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encoder::Base32 => BASE32
                .decode(text)
                .map_err(|e| TunnelError::Encoding(format!("base32: {}", e))),
            Encoder::Base64 => BASE64
                .decode(text)
                .map_err(|e| TunnelError::Encoding(format!("base64: {}", e))),
            Encoder::Base64u => BASE64U
                .decode(text)
                .map_err(|e| TunnelError::Encoding(format!("base64u: {}", e))),
            Encoder::Base128 => base128_decode(text),
            Encoder::Raw => Ok(text.to_vec()),
        }
    }
}

/// Pack bytes into 7-bit symbols, MSB first.
fn base128_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 8 / 7 + 2);
    let mut acc: u16 = 0;
    let mut nbits = 0u32;

    for &byte in data {
        acc = (acc << 8) | byte as u16;
        nbits += 8;
        while nbits >= 7 {
            nbits -= 7;
            out.push(BASE128_ALPHABET[((acc >> nbits) & 0x7f) as usize]);
        }
    }
    if nbits > 0 {
        out.push(BASE128_ALPHABET[((acc << (7 - nbits)) & 0x7f) as usize]);
    }
    out
}

fn base128_decode(text: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 7 / 8 + 1);
    let mut acc: u16 = 0;
    let mut nbits = 0u32;

    for &ch in text {
        let value = BASE128_REVERSE[ch as usize];
        if value == 0xff {
            return Err(TunnelError::Encoding(format!(
                "base128: invalid symbol 0x{:02x}",
                ch
            )));
        }
        acc = (acc << 7) | value as u16;
        nbits += 7;
        if nbits >= 8 {
            nbits -= 8;
            out.push((acc >> nbits) as u8);
        }
    }
    Ok(out)
}
