//! Tagged free-text ASCII commands (microcontroller protocol).
//!
//! Commands are short literals such as `<q>`, `<gp>` or `<p:12.5>`. Replies
//! carry a tag and a number, `<gp:12.5>`, and are matched anywhere in the
//! received line.

use regex::Regex;
use std::fmt::Display;
use std::time::Duration;
use tracing::debug;

use crate::adapters::Transport;
use crate::error::{AppResult, DaqError, DecodeError};

/// What a command expects back from the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// A reply carrying this tag must arrive; a timeout is a failure.
    Required(String),
    /// A reply may or may not arrive; a timeout counts as success.
    Optional,
    /// Nothing is read back; the write being accepted is success.
    None,
}

/// A command literal together with its reply expectation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedCommand {
    text: String,
    reply: ReplyPolicy,
}

impl TaggedCommand {
    /// A get command whose reply carries `tag`.
    pub fn get(text: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply: ReplyPolicy::Required(tag.into()),
        }
    }

    /// A set-only command, `<key:value>\r`.
    pub fn set(key: &str, value: impl Display) -> Self {
        Self {
            text: format!("<{}:{}>\r", key, value),
            reply: ReplyPolicy::Optional,
        }
    }

    /// `<on:0>` or `<off:0>`.
    pub fn toggle(on: bool) -> Self {
        let text = if on { "<on:0>" } else { "<off:0>" };
        Self {
            text: text.to_string(),
            reply: ReplyPolicy::None,
        }
    }

    /// Bytes written to the port.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Reply expectation.
    pub fn reply(&self) -> &ReplyPolicy {
        &self.reply
    }

    /// Send the command and apply the reply policy.
    ///
    /// Returns the first reply line when one was received.
    pub async fn exchange(
        &self,
        transport: &dyn Transport,
        timeout: Duration,
    ) -> AppResult<Option<String>> {
        debug!("[{}] -> {:?}", transport.name(), self.text);
        match &self.reply {
            ReplyPolicy::Required(_) => {
                let lines = transport.send(self.text.as_bytes(), true, timeout).await?;
                let line = lines
                    .into_iter()
                    .next()
                    .ok_or_else(|| DecodeError::new("empty reply", ""))?;
                Ok(Some(line))
            }
            ReplyPolicy::Optional => {
                match transport.send(self.text.as_bytes(), true, timeout).await {
                    Ok(lines) => Ok(lines.into_iter().next()),
                    Err(DaqError::TransportTimeout { .. }) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            ReplyPolicy::None => {
                transport.send(self.text.as_bytes(), false, timeout).await?;
                Ok(None)
            }
        }
    }
}

fn tag_pattern(tag: &str, value: &str) -> Result<Regex, DecodeError> {
    Regex::new(&format!("<{}:*({})>", regex::escape(tag), value))
        .map_err(|err| DecodeError::new(format!("invalid tag pattern: {}", err), tag))
}

/// Extract the number tagged `tag` from `reply`.
pub fn parse_number(reply: &str, tag: &str) -> Result<f64, DecodeError> {
    let pattern = tag_pattern(tag, r"-?\d+\.?\d*")?;
    pattern
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| DecodeError::new(format!("no <{}:NUMBER> in reply", tag), reply))
}

/// Extract the single-digit flag tagged `tag`; anything but `0` is true.
pub fn parse_flag(reply: &str, tag: &str) -> Result<bool, DecodeError> {
    let pattern = tag_pattern(tag, r"\d")?;
    pattern
        .captures(reply)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str() != "0")
        .ok_or_else(|| DecodeError::new(format!("no <{}:FLAG> in reply", tag), reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockTransport;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("<gp:12.5>", "gp"), Ok(12.5));
        assert_eq!(parse_number("noise<data:-3>\r", "data"), Ok(-3.0));
        assert_eq!(parse_number("<d:7.>", "d"), Ok(7.0));
    }

    #[test]
    fn test_parse_number_rejects_empty_and_wrong_tag() {
        let err = parse_number("<gp:>", "gp").unwrap_err();
        assert_eq!(err.raw, "<gp:>");
        assert!(parse_number("<gd:12.5>", "gp").is_err());
        assert!(parse_number("", "gp").is_err());
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("<gS:1>", "gS"), Ok(true));
        assert_eq!(parse_flag("<gS:0>", "gS"), Ok(false));
        assert!(parse_flag("<gS:x>", "gS").is_err());
    }

    #[test]
    fn test_command_literals() {
        assert_eq!(TaggedCommand::set("p", 12.5).text(), "<p:12.5>\r");
        assert_eq!(TaggedCommand::toggle(true).text(), "<on:0>");
        assert_eq!(TaggedCommand::toggle(false).text(), "<off:0>");
        assert_eq!(
            TaggedCommand::get("<gp>", "gp").reply(),
            &ReplyPolicy::Required("gp".to_string())
        );
    }

    #[tokio::test]
    async fn test_get_timeout_is_failure() {
        let transport = MockTransport::new("ozone");
        transport.open().await.unwrap();

        let result = TaggedCommand::get("<gp>", "gp")
            .exchange(&transport, Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(DaqError::TransportTimeout { .. })));
    }

    #[tokio::test]
    async fn test_set_timeout_is_success() {
        let transport = MockTransport::new("ozone");
        transport.open().await.unwrap();

        let result = TaggedCommand::set("d", 40)
            .exchange(&transport, Duration::from_millis(20))
            .await;

        assert_eq!(result.unwrap(), None);
        assert_eq!(transport.sent(), vec!["<d:40>\r".to_string()]);
    }

    #[tokio::test]
    async fn test_toggle_does_not_wait_for_reply() {
        let transport = MockTransport::new("ozone");
        transport.open().await.unwrap();

        let result = TaggedCommand::toggle(true)
            .exchange(&transport, Duration::from_millis(20))
            .await;

        assert_eq!(result.unwrap(), None);
    }
}
