use std::num::ParseIntError;

use thiserror::Error;

use crate::topics::{TOPIC_CMD_AUTO, TOPIC_CMD_PING, TOPIC_CMD_RESTART, TOPIC_CMD_STATUS};

/// Remote instruction decoded from an inbound MQTT message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    SetOff,
    SetOn,
    Restart,
    /// Requested period in seconds, as sent. Validated by the engine.
    SetAutoInterval(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unrecognized topic `{0}`")]
    UnknownTopic(String),
    #[error("unrecognized payload on `{0}`")]
    UnsupportedPayload(&'static str),
    #[error("payload on `{topic}` is not an integer")]
    InvalidInteger {
        topic: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("payload on `{0}` is not valid utf-8")]
    NonUtf8(&'static str),
}

impl Command {
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        match topic {
            TOPIC_CMD_PING => Ok(Self::Ping),
            TOPIC_CMD_STATUS => match payload.first() {
                Some(b'0') => Ok(Self::SetOff),
                Some(b'1') => Ok(Self::SetOn),
                _ => Err(DecodeError::UnsupportedPayload(TOPIC_CMD_STATUS)),
            },
            TOPIC_CMD_RESTART => match payload.first() {
                Some(b'1') => Ok(Self::Restart),
                _ => Err(DecodeError::UnsupportedPayload(TOPIC_CMD_RESTART)),
            },
            TOPIC_CMD_AUTO => {
                let text = core::str::from_utf8(payload)
                    .map_err(|_| DecodeError::NonUtf8(TOPIC_CMD_AUTO))?;
                text.trim()
                    .parse::<i64>()
                    .map(Self::SetAutoInterval)
                    .map_err(|source| DecodeError::InvalidInteger {
                        topic: TOPIC_CMD_AUTO,
                        source,
                    })
            }
            other => Err(DecodeError::UnknownTopic(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_ignores_payload() {
        assert_eq!(Command::decode("pump/ping", b""), Ok(Command::Ping));
        assert_eq!(Command::decode("pump/ping", b"anything"), Ok(Command::Ping));
    }

    #[test]
    fn status_uses_first_byte() {
        assert_eq!(Command::decode("pump/status", b"0"), Ok(Command::SetOff));
        assert_eq!(Command::decode("pump/status", b"1"), Ok(Command::SetOn));
        assert_eq!(Command::decode("pump/status", b"10"), Ok(Command::SetOn));
        assert_eq!(
            Command::decode("pump/status", b"2"),
            Err(DecodeError::UnsupportedPayload("pump/status"))
        );
        assert_eq!(
            Command::decode("pump/status", b""),
            Err(DecodeError::UnsupportedPayload("pump/status"))
        );
    }

    #[test]
    fn restart_requires_one() {
        assert_eq!(Command::decode("pump/restart", b"1"), Ok(Command::Restart));
        assert!(Command::decode("pump/restart", b"0").is_err());
    }

    #[test]
    fn auto_parses_seconds() {
        assert_eq!(
            Command::decode("pump/auto", b"120"),
            Ok(Command::SetAutoInterval(120))
        );
        assert_eq!(
            Command::decode("pump/auto", b" 30\n"),
            Ok(Command::SetAutoInterval(30))
        );
        assert_eq!(
            Command::decode("pump/auto", b"-4"),
            Ok(Command::SetAutoInterval(-4))
        );
    }

    #[test]
    fn auto_rejects_garbage() {
        assert!(matches!(
            Command::decode("pump/auto", b"12abc"),
            Err(DecodeError::InvalidInteger { topic: "pump/auto", .. })
        ));
        assert!(matches!(
            Command::decode("pump/auto", b"30s"),
            Err(DecodeError::InvalidInteger { .. })
        ));
        assert!(matches!(
            Command::decode("pump/auto", b""),
            Err(DecodeError::InvalidInteger { .. })
        ));
        assert_eq!(
            Command::decode("pump/auto", &[0xff, 0x31]),
            Err(DecodeError::NonUtf8("pump/auto"))
        );
    }

    #[test]
    fn unknown_topics_are_rejected() {
        assert_eq!(
            Command::decode("pump/flush", b"1"),
            Err(DecodeError::UnknownTopic("pump/flush".to_string()))
        );
        assert!(Command::decode("status", b"on").is_err());
    }
}
