//! Wire vocabulary shared by nodes and the console.
//!
//! Every message is one line of text: a case-insensitive keyword followed by
//! the fields that kind needs. The same type is used for commands typed by an
//! operator (`PUT k v`) and for peer traffic (`OWNER k`, `COMMIT k|||peer`).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Key = String;
pub type Value = String;
pub type PeerId = String;

/// Largest datagram a node will send or accept.
pub const DATA_LIMIT: usize = 65_000;

/// Number of characters of a DATA_ALL dump shown on a console.
pub const DISPLAY_LIMIT: usize = 65_535;

pub const TRUNCATION_MARKER: &str = " <trimmed>...";

const LINE_ENDINGS: &[char] = &['\n', '\r'];
const COMMIT_SEPARATOR: &str = "|||";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("key/value must be specified")]
    KeyValueMissing,
    #[error("unknown message type: {0}")]
    Unknown(String),
    #[error("invalid DATA_ALL payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Get { key: Key },
    Put { key: Key, value: Value },
    Del { key: Key },
    Store,
    Exit { peer: Option<PeerId> },
    Data { key: Key, value: Value },
    DataAll { entries: BTreeMap<Key, Value> },
    Owner { key: Key },
    Ack { key: Key },
    Nak { key: Key },
    Commit { key: Key, peer: PeerId },
}

impl Message {
    pub fn keyword(&self) -> &'static str {
        match self {
            Message::Get { .. } => "GET",
            Message::Put { .. } => "PUT",
            Message::Del { .. } => "DEL",
            Message::Store => "STORE",
            Message::Exit { .. } => "EXIT",
            Message::Data { .. } => "DATA",
            Message::DataAll { .. } => "DATA_ALL",
            Message::Owner { .. } => "OWNER",
            Message::Ack { .. } => "ACK",
            Message::Nak { .. } => "NAK",
            Message::Commit { .. } => "COMMIT",
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Message::Get { key }
            | Message::Put { key, .. }
            | Message::Del { key }
            | Message::Data { key, .. }
            | Message::Owner { key }
            | Message::Ack { key }
            | Message::Nak { key }
            | Message::Commit { key, .. } => Some(key),
            Message::Store | Message::Exit { .. } | Message::DataAll { .. } => None,
        }
    }

    /// Kinds a peer answers on the same channel. Everything else is a
    /// one-way notification.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Message::Get { .. } | Message::Store | Message::Owner { .. }
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Get { key } => write!(f, "GET {key}"),
            Message::Put { key, value } => write!(f, "PUT {key} {value}"),
            Message::Del { key } => write!(f, "DEL {key}"),
            Message::Store => f.write_str("STORE"),
            Message::Exit { peer: None } => f.write_str("EXIT"),
            Message::Exit { peer: Some(peer) } => write!(f, "EXIT {peer}"),
            Message::Data { key, value } => write!(f, "DATA {key} {value}"),
            Message::DataAll { entries } => {
                let json = serde_json::to_string(entries).map_err(|_| fmt::Error)?;
                write!(f, "DATA_ALL {json}")
            }
            Message::Owner { key } => write!(f, "OWNER {key}"),
            Message::Ack { key } => write!(f, "ACK {key}"),
            Message::Nak { key } => write!(f, "NAK {key}"),
            Message::Commit { key, peer } => write!(f, "COMMIT {key}{COMMIT_SEPARATOR}{peer}"),
        }
    }
}

impl FromStr for Message {
    type Err = DecodeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let line = input.trim_end_matches(LINE_ENDINGS);
        let trimmed = line.trim_start();
        let (keyword, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));

        match keyword.to_ascii_uppercase().as_str() {
            "GET" => Ok(Message::Get {
                key: single_key(rest)?,
            }),
            "PUT" => {
                let (key, value) = key_and_value(rest)?;
                Ok(Message::Put { key, value })
            }
            "DEL" => Ok(Message::Del {
                key: single_key(rest)?,
            }),
            "STORE" => Ok(Message::Store),
            "EXIT" => {
                let peer = rest.trim();
                Ok(Message::Exit {
                    peer: (!peer.is_empty()).then(|| peer.to_string()),
                })
            }
            "DATA" => {
                let (key, value) = key_and_value(rest)?;
                Ok(Message::Data { key, value })
            }
            "DATA_ALL" => Ok(Message::DataAll {
                entries: data_all_entries(rest)?,
            }),
            "OWNER" => Ok(Message::Owner {
                key: single_key(rest)?,
            }),
            "ACK" => Ok(Message::Ack {
                key: single_key(rest)?,
            }),
            "NAK" => Ok(Message::Nak {
                key: single_key(rest)?,
            }),
            "COMMIT" => {
                // Peer ids never contain the separator; keys may.
                let (key, peer) = rest
                    .trim_start()
                    .rsplit_once(COMMIT_SEPARATOR)
                    .ok_or(DecodeError::KeyValueMissing)?;
                if key.is_empty() || peer.trim().is_empty() {
                    return Err(DecodeError::KeyValueMissing);
                }
                Ok(Message::Commit {
                    key: key.to_string(),
                    peer: peer.trim().to_string(),
                })
            }
            _ => Err(DecodeError::Unknown(line.to_string())),
        }
    }
}

fn single_key(rest: &str) -> Result<Key, DecodeError> {
    let key = rest.trim();
    if key.is_empty() {
        return Err(DecodeError::KeyValueMissing);
    }
    Ok(key.to_string())
}

fn key_and_value(rest: &str) -> Result<(Key, Value), DecodeError> {
    let (key, value) = rest
        .trim_start()
        .split_once(' ')
        .ok_or(DecodeError::KeyValueMissing)?;
    if key.is_empty() || value.is_empty() {
        return Err(DecodeError::KeyValueMissing);
    }
    Ok((key.to_string(), value.to_string()))
}

/// Peers may send any JSON value; non-string values are kept as their JSON text.
fn data_all_entries(rest: &str) -> Result<BTreeMap<Key, Value>, DecodeError> {
    let payload = rest.trim();
    if payload.is_empty() {
        return Err(DecodeError::KeyValueMissing);
    }
    let raw: BTreeMap<Key, serde_json::Value> = serde_json::from_str(payload)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(text) => (key, text),
            other => (key, other.to_string()),
        })
        .collect())
}

/// Cuts `text` down to `limit` characters and appends [`TRUNCATION_MARKER`].
pub fn truncate_for_display(text: &str, limit: usize) -> Cow<'_, str> {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => Cow::Owned(format!("{}{TRUNCATION_MARKER}", &text[..cut])),
        None => Cow::Borrowed(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Message {
        line.parse().expect("valid message")
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_eq!(parse("get foo"), Message::Get { key: "foo".into() });
        assert_eq!(parse("GeT foo"), Message::Get { key: "foo".into() });
        assert_eq!(parse("store"), Message::Store);
        assert_eq!(parse("owner k\n"), Message::Owner { key: "k".into() });
    }

    #[test]
    fn put_value_keeps_inner_spaces() {
        assert_eq!(
            parse("PUT greeting hello there world"),
            Message::Put {
                key: "greeting".into(),
                value: "hello there world".into()
            }
        );
    }

    #[test]
    fn exit_peer_is_optional() {
        assert_eq!(parse("EXIT"), Message::Exit { peer: None });
        assert_eq!(
            parse("exit 127.0.0.1:7001"),
            Message::Exit {
                peer: Some("127.0.0.1:7001".into())
            }
        );
    }

    #[test]
    fn commit_splits_on_separator() {
        assert_eq!(
            parse("COMMIT k|||127.0.0.1:7001"),
            Message::Commit {
                key: "k".into(),
                peer: "127.0.0.1:7001".into()
            }
        );
    }

    #[test]
    fn commit_key_may_contain_the_separator() {
        let line = Message::Commit {
            key: "a|||b".into(),
            peer: "127.0.0.1:7001".into(),
        }
        .to_string();
        assert_eq!(line, "COMMIT a|||b|||127.0.0.1:7001");
        assert_eq!(
            parse(&line),
            Message::Commit {
                key: "a|||b".into(),
                peer: "127.0.0.1:7001".into()
            }
        );
        assert_eq!(
            parse("PUT a|||b v"),
            Message::Put {
                key: "a|||b".into(),
                value: "v".into()
            }
        );
    }

    #[test]
    fn data_all_keeps_non_string_values_as_json() {
        let Message::DataAll { entries } = parse(r#"DATA_ALL {"a":"x","n":3,"b":true}"#) else {
            panic!("expected DATA_ALL");
        };
        assert_eq!(entries["a"], "x");
        assert_eq!(entries["n"], "3");
        assert_eq!(entries["b"], "true");
    }

    #[test]
    fn missing_fields_are_rejected() {
        let lines = [
            "GET",
            "GET   ",
            "PUT k",
            "PUT",
            "DEL",
            "DATA k",
            "OWNER",
            "COMMIT k",
            "COMMIT |||p",
            "DATA_ALL",
        ];
        for line in lines {
            let err = line.parse::<Message>().expect_err(line);
            assert!(matches!(err, DecodeError::KeyValueMissing), "{line}: {err}");
            assert_eq!(err.to_string(), "key/value must be specified");
        }
    }

    #[test]
    fn unknown_keyword_names_the_input() {
        let err = "FROB x".parse::<Message>().unwrap_err();
        assert_eq!(err.to_string(), "unknown message type: FROB x");
        assert!(matches!("".parse::<Message>(), Err(DecodeError::Unknown(_))));
    }

    #[test]
    fn malformed_data_all_is_a_payload_error() {
        assert!(matches!(
            "DATA_ALL {not json".parse::<Message>(),
            Err(DecodeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn every_kind_survives_encode_then_decode() {
        let samples = vec![
            Message::Get { key: "k".into() },
            Message::Put {
                key: "k".into(),
                value: "some value".into(),
            },
            Message::Del { key: "k".into() },
            Message::Store,
            Message::Exit { peer: None },
            Message::Exit {
                peer: Some("10.0.0.2:9000".into()),
            },
            Message::Data {
                key: "k".into(),
                value: "v".into(),
            },
            Message::DataAll {
                entries: BTreeMap::from([
                    ("a".into(), "1".into()),
                    ("b".into(), "two words".into()),
                ]),
            },
            Message::Owner { key: "k".into() },
            Message::Ack { key: "k".into() },
            Message::Nak { key: "k".into() },
            Message::Commit {
                key: "k".into(),
                peer: "10.0.0.2:9000".into(),
            },
            Message::Commit {
                key: "a|||b".into(),
                peer: "127.0.0.1:7001".into(),
            },
        ];
        for message in samples {
            let decoded: Message = message.to_string().parse().expect("decodes");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn only_queries_expect_replies() {
        assert!(Message::Owner { key: "k".into() }.expects_reply());
        assert!(Message::Store.expects_reply());
        assert!(!Message::Commit {
            key: "k".into(),
            peer: "p".into()
        }
        .expects_reply());
        assert!(!Message::Exit { peer: None }.expects_reply());
    }

    #[test]
    fn truncation_appends_marker() {
        assert_eq!(truncate_for_display("short", 10), "short");
        assert_eq!(truncate_for_display("abcdef", 3), "abc <trimmed>...");
        assert_eq!(truncate_for_display("ééé", 2), "éé <trimmed>...");
    }
}
