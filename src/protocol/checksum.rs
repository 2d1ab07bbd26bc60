//! Checksummed fixed-point ASCII frames (thermoelectric controller).
//!
//! Command frame: `STX CC DDDD SS ETX`
//! Reply frame:   `STX DDDD SS ACK`
//!
//! `CC` is the operation code and `DDDD` a 16-bit payload, both as lowercase
//! hex. `SS` is the low byte of the sum of the ASCII values of the hex body,
//! also as two lowercase hex digits. Payloads are big-endian signed 16-bit
//! integers; negative values are sent as their two's complement.

use crate::error::DecodeError;

/// Start of every frame.
pub const STX: u8 = b'*';
/// End of a command frame.
pub const ETX: u8 = b'\r';
/// End of a reply frame.
pub const ACK: u8 = b'^';

const COMMAND_LEN: usize = 10;
const REPLY_LEN: usize = 8;

/// Operation codes understood by the controller.
pub mod op {
    /// Read input 1 (control thermistor).
    pub const INPUT1: u8 = 0x01;
    /// Read output power.
    pub const OUTPUT_POWER: u8 = 0x02;
    /// Read input 2.
    pub const INPUT2: u8 = 0x04;
    /// Write the fixed set-point temperature.
    pub const SET_POINT_WRITE: u8 = 0x1c;
    /// Write output enable.
    pub const OUTPUT_ENABLE_WRITE: u8 = 0x30;
    /// Read the fixed set-point temperature.
    pub const SET_POINT_READ: u8 = 0x50;
    /// Read output enable.
    pub const OUTPUT_ENABLE_READ: u8 = 0x64;
}

/// Pre-computed output-enable frame.
pub const OUTPUT_ON: &str = "*30000124\r";
/// Pre-computed output-disable frame.
pub const OUTPUT_OFF: &str = "*30000023\r";
/// Reply echoed by the controller after [`OUTPUT_ON`].
pub const OUTPUT_ON_ACK: &str = "*0001c1^";
/// Reply echoed by the controller after [`OUTPUT_OFF`].
pub const OUTPUT_OFF_ACK: &str = "*0000c0^";

/// Two lowercase hex digits of the modular byte sum of `body`.
pub fn checksum(body: &[u8]) -> String {
    let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    format!("{:02x}", sum)
}

/// Build a command frame.
pub fn encode_command(op: u8, payload: u16) -> String {
    let body = format!("{:02x}{:04x}", op, payload);
    let sum = checksum(body.as_bytes());
    format!("{}{}{}{}", STX as char, body, sum, ETX as char)
}

/// Split a command frame back into operation and payload.
pub fn decode_command(frame: &[u8]) -> Result<(u8, u16), DecodeError> {
    let raw = || String::from_utf8_lossy(frame).into_owned();
    if frame.len() != COMMAND_LEN {
        return Err(DecodeError::new(
            format!("expected {} bytes, got {}", COMMAND_LEN, frame.len()),
            raw(),
        ));
    }
    if frame[0] != STX || frame[COMMAND_LEN - 1] != ETX {
        return Err(DecodeError::new("bad sentinel", raw()));
    }
    let body = &frame[1..7];
    verify_checksum(body, &frame[7..9]).map_err(|reason| DecodeError::new(reason, raw()))?;
    let op = parse_hex(&body[..2]).ok_or_else(|| DecodeError::new("malformed hex", raw()))?;
    let payload = parse_hex(&body[2..]).ok_or_else(|| DecodeError::new("malformed hex", raw()))?;
    Ok((op as u8, payload))
}

/// Build a reply frame, as the controller would send it.
pub fn encode_reply(payload: u16) -> String {
    let body = format!("{:04x}", payload);
    let sum = checksum(body.as_bytes());
    format!("{}{}{}{}", STX as char, body, sum, ACK as char)
}

/// Extract the raw payload from a reply. Trailing CR/LF is ignored.
pub fn decode_reply(reply: &str) -> Result<u16, DecodeError> {
    let frame = reply.trim_end_matches(['\r', '\n']).as_bytes();
    if frame.len() != REPLY_LEN {
        return Err(DecodeError::new(
            format!("expected {} bytes, got {}", REPLY_LEN, frame.len()),
            reply,
        ));
    }
    if frame[0] != STX || frame[REPLY_LEN - 1] != ACK {
        return Err(DecodeError::new("bad sentinel", reply));
    }
    let body = &frame[1..5];
    verify_checksum(body, &frame[5..7]).map_err(|reason| DecodeError::new(reason, reply))?;
    parse_hex(body).ok_or_else(|| DecodeError::new("malformed hex", reply))
}

fn verify_checksum(body: &[u8], received: &[u8]) -> Result<(), String> {
    let expected = checksum(body);
    if expected.as_bytes() == received {
        Ok(())
    } else {
        Err(format!(
            "checksum mismatch: expected {}, got {}",
            expected,
            String::from_utf8_lossy(received)
        ))
    }
}

fn parse_hex(digits: &[u8]) -> Option<u16> {
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u16::from_str_radix(text, 16).ok()
}

// =============================================================================
// Fixed-point scales
// =============================================================================

/// How a signed 16-bit payload maps to a physical value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scale {
    /// Hundredths of a unit (temperatures).
    Hundredths,
    /// Bipolar output power: 511 is +100 %, -511 is -100 %.
    BipolarPercent,
}

impl Scale {
    /// Interpret a raw payload.
    pub fn decode(self, raw: u16) -> f64 {
        let signed = f64::from(raw as i16);
        match self {
            Scale::Hundredths => signed / 100.0,
            Scale::BipolarPercent => 100.0 + (signed - 511.0) * 200.0 / 1022.0,
        }
    }
}

/// Encode a value in hundredths, wrapping negatives modulo 65536.
pub fn encode_hundredths(value: f64) -> u16 {
    let hundredths = (value * 100.0).round() as i64;
    hundredths.rem_euclid(0x1_0000) as u16
}

/// How a write acknowledgement turned out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The exact expected echo came back.
    Matched,
    /// Nothing came back before the deadline.
    Silent,
}

/// Check an optional reply against the expected echo.
pub fn check_ack(reply: Option<&str>, expected: &str) -> Result<Acknowledgement, DecodeError> {
    match reply {
        None => Ok(Acknowledgement::Silent),
        Some(line) if line.trim_end_matches(['\r', '\n']) == expected => {
            Ok(Acknowledgement::Matched)
        }
        Some(line) => Err(DecodeError::new(
            format!("unexpected acknowledgement, wanted {}", expected),
            line,
        )),
    }
}
