//! Addressed relay-module commands (valve banks).
//!
//! Modules share one bus and are selected by a two-digit hex address.
//!
//! | Command     | Meaning                      | Reply              |
//! |-------------|------------------------------|--------------------|
//! | `#AA1Cdd\r` | set channel `C` to `dd`      | `>`                |
//! | `$AA6\r`    | read all output states       | `!<hex mask>00`    |
//! | `$AAM\r`    | read the module name         | `!AA<model>`       |

use std::fmt;

use crate::error::{AppResult, DaqError, DecodeError};

/// Acknowledgement of a channel write.
pub const SET_ACK: &str = ">";

/// Channel count per known module model.
const MODELS: &[(&str, usize)] = &[("4056", 12), ("4060", 4), ("4068", 8), ("4069", 8)];

/// Highest channel count the single-digit channel field can address.
pub const MAX_CHANNELS: usize = 16;

/// Two-digit hex address of a relay module.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleAddress(String);

impl ModuleAddress {
    /// Validate an address string.
    pub fn parse(text: &str) -> AppResult<Self> {
        if text.len() == 2 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(text.to_ascii_uppercase()))
        } else {
            Err(DaqError::Configuration(format!(
                "relay address '{}' must be two hex digits",
                text
            )))
        }
    }

    /// Address as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command that drives one channel.
pub fn set_channel(address: &ModuleAddress, channel: usize, on: bool) -> AppResult<String> {
    if channel >= MAX_CHANNELS {
        return Err(DaqError::Instrument(format!(
            "relay channel {} is not addressable",
            channel
        )));
    }
    Ok(format!("#{}1{:X}{:02}\r", address, channel, u8::from(on)))
}

/// Check a channel-write acknowledgement.
pub fn check_set_ack(reply: &str) -> Result<(), DecodeError> {
    if reply.trim() == SET_ACK {
        Ok(())
    } else {
        Err(DecodeError::new("relay did not acknowledge", reply))
    }
}

/// Command that reads every output of a module.
pub fn read_outputs(address: &ModuleAddress) -> String {
    format!("${}6\r", address)
}

/// Decode an output-state reply into one flag per channel.
pub fn decode_outputs(reply: &str, channels: usize) -> Result<Vec<bool>, DecodeError> {
    let trimmed = reply.trim();
    let digits = trimmed
        .strip_prefix('!')
        .and_then(|rest| rest.strip_suffix("00"))
        .filter(|mask| !mask.is_empty() && mask.len() <= 4)
        .ok_or_else(|| DecodeError::new("malformed output state", reply))?;
    let mask = u16::from_str_radix(digits, 16)
        .map_err(|_| DecodeError::new("malformed hex", reply))?;
    Ok((0..channels).map(|i| i < 16 && mask & (1 << i) != 0).collect())
}

/// Encode an output-state reply, as a module would send it.
pub fn encode_outputs(states: &[bool]) -> String {
    let mask = states
        .iter()
        .enumerate()
        .filter(|(i, on)| **on && *i < MAX_CHANNELS)
        .fold(0u16, |acc, (i, _)| acc | (1 << i));
    if states.len() > 8 {
        format!("!{:04X}00", mask)
    } else {
        format!("!{:02X}00", mask)
    }
}

/// Command that reads the module name.
pub fn read_module_name(address: &ModuleAddress) -> String {
    format!("${}M\r", address)
}

/// Extract the model from a module-name reply.
pub fn decode_module_name(reply: &str, address: &ModuleAddress) -> Result<String, DecodeError> {
    reply
        .trim()
        .strip_prefix('!')
        .and_then(|rest| rest.strip_prefix(address.as_str()))
        .filter(|model| !model.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DecodeError::new("malformed module name", reply))
}

/// Channel count of a known module model.
pub fn channels_for_model(model: &str) -> Option<usize> {
    MODELS
        .iter()
        .find(|(name, _)| model.starts_with(name))
        .map(|(_, count)| *count)
}
