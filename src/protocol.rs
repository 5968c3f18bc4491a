use base64::{
    alphabet,
    engine::{
        general_purpose::{GeneralPurpose, GeneralPurposeConfig},
        DecodePaddingMode,
    },
    Engine as _,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::debug;

use crate::error::{BridgeError, Result};

/// Start-of-frame marker
pub const FRAME_START: u8 = 0x7B;

/// End-of-frame marker; may also appear inside a payload
pub const FRAME_END: u8 = 0x7D;

/// Standard-alphabet base64 that accepts input with or without `=` padding
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Reflected CRC16/MODBUS polynomial
pub const CRC16_MODBUS_POLY: u16 = 0xA001;

/// CRC16/MODBUS initial register value
pub const CRC16_MODBUS_INIT: u16 = 0xFFFF;

/// Run CRC16/MODBUS over `data`
///
/// A payload that already ends in its own checksum (low byte first) reduces
/// to `0x0000`.
#[must_use]
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc = CRC16_MODBUS_INIT;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_MODBUS_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checksum of `data` rendered the way the module expects it on the wire:
/// low byte then high byte, uppercase hex
#[must_use]
pub fn crc16_modbus_hex(data: &[u8]) -> String {
    let [low, high] = crc16_modbus(data).to_le_bytes();
    format!("{low:02X}{high:02X}")
}

/// Append the CRC16/MODBUS checksum (low byte first) to `payload`
#[must_use]
pub fn append_checksum(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc16_modbus(payload).to_le_bytes());
    out
}

/// Wrap `payload` in frame markers
#[must_use]
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 2);
    buf.put_u8(FRAME_START);
    buf.extend_from_slice(payload);
    buf.put_u8(FRAME_END);
    buf.freeze()
}

/// Lowercase hex rendering of `bytes`
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decode a hex string, ignoring whitespace
///
/// # Errors
///
/// Returns [`BridgeError::InvalidParameters`] for odd-length input or
/// non-hex characters.
pub fn hex_decode(input: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    if digits.len() % 2 != 0 {
        return Err(BridgeError::InvalidParameters(format!(
            "Hex string has odd length: {}",
            digits.len()
        )));
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)
                .map_err(|_| BridgeError::InvalidParameters("Non-ASCII hex digit".to_string()))?;
            u8::from_str_radix(text, 16)
                .map_err(|_| BridgeError::InvalidParameters(format!("Invalid hex byte: {text}")))
        })
        .collect()
}

/// How an outgoing payload string was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Protocol hex, decoded directly
    Hex,
    /// Base64-wrapped bytes
    Base64,
    /// Plain text sent as UTF-8
    Utf8,
}

/// Decide how `input` should be turned into bytes
#[must_use]
pub fn detect_encoding(input: &str) -> PayloadEncoding {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();

    if !compact.is_empty()
        && compact.len() % 2 == 0
        && compact.chars().all(|c| c.is_ascii_hexdigit())
    {
        return PayloadEncoding::Hex;
    }

    if looks_like_base64(&compact) {
        return PayloadEncoding::Base64;
    }

    PayloadEncoding::Utf8
}

fn looks_like_base64(candidate: &str) -> bool {
    let body = candidate.trim_end_matches('=');
    let padding = candidate.len() - body.len();

    !body.is_empty()
        && padding <= 2
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
}

/// Turn an outgoing payload string into bytes
///
/// Accepts pre-built protocol hex, base64-wrapped payloads or plain text, in
/// that order of preference. Base64 padding is optional. Base64 that fails
/// to decode is sent as text.
#[must_use]
pub fn encode_payload(input: &str) -> Vec<u8> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();

    match detect_encoding(input) {
        PayloadEncoding::Hex => hex_decode(&compact).unwrap_or_else(|_| input.as_bytes().to_vec()),
        PayloadEncoding::Base64 => match LENIENT_BASE64.decode(compact.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Base64 decode failed, sending as UTF-8: {}", e);
                input.as_bytes().to_vec()
            }
        },
        PayloadEncoding::Utf8 => input.as_bytes().to_vec(),
    }
}

/// A CRC-validated frame, markers included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    frame: Bytes,
}

impl Packet {
    fn new(frame: Bytes) -> Self {
        Self { frame }
    }

    /// The whole frame, markers included
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Bytes strictly between the markers, trailing checksum included
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.frame[1..self.frame.len() - 1]
    }

    /// Lowercase hex of the whole frame
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex_encode(&self.frame)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Reassembly buffer for one notification session
///
/// Bytes only leave the buffer once a frame ending at or after them has been
/// validated and emitted. A checksum mismatch is indistinguishable from an
/// incomplete frame, so unvalidated bytes are kept for the next push.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes and extract every complete frame
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Packet> {
        self.pending.extend_from_slice(chunk);

        let mut packets = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.pending[consumed..]
            .iter()
            .position(|&b| b == FRAME_START)
        {
            let start = consumed + offset;
            let Some(end) = find_frame_end(&self.pending, start) else {
                break;
            };

            packets.push(Packet::new(Bytes::copy_from_slice(
                &self.pending[start..=end],
            )));
            consumed = end + 1;
        }

        self.pending.advance(consumed);
        packets
    }

    /// Bytes waiting for the rest of their frame
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Number of buffered bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// First end marker after `start` whose enclosed payload checks out
fn find_frame_end(buf: &[u8], start: usize) -> Option<usize> {
    (start + 1..buf.len())
        .filter(|&idx| buf[idx] == FRAME_END)
        .find(|&idx| crc16_modbus(&buf[start + 1..idx]) == 0)
}
