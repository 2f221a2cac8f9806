use serde::{Deserialize, Serialize};

use crate::channels::Channel;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check it in the `Hello` broadcast on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a remote control / front-end to the daemon.  This is
/// the entire mutating surface of the TV — nothing else touches core state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    PowerToggle,
    Next,
    Prev,
    Unmute,
    GetState,
}

/// Messages sent from the daemon to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: TvState,
    },
    State {
        data: TvState,
    },
    Power {
        on: bool,
    },
    ChannelChanged {
        name: String,
        index: usize,
    },
    /// Transition-effect hint for the presentation layer — "show static for
    /// this long".  The daemon draws nothing itself.
    Static {
        duration_ms: u64,
    },
}

/// Snapshot of the TV's observable state.  `rev` is a monotonically
/// increasing counter bumped on every change, so clients can detect missed
/// updates and resync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TvState {
    #[serde(default)]
    pub rev: u64,
    pub powered: bool,
    pub current_index: usize,
    pub channels: Vec<Channel>,
}

/// Wrapper for socket communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

/// Outcome of decoding the front of a read buffer.  An incomplete frame and
/// a corrupt one need opposite reactions — keep buffering versus drop the
/// frame — so they must not share an error path.
#[derive(Debug)]
pub enum Decoded {
    /// One complete frame; the `usize` is the number of bytes consumed.
    Frame(Message, usize),
    /// Not enough buffered bytes for a full frame yet — read more.
    Incomplete,
    /// Complete frame with an unparseable payload; skip the consumed bytes.
    Malformed(usize),
}

impl Message {
    /// Frame layout: 4-byte big-endian length prefix + JSON payload.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decodes one frame from the front of `data`.
    pub fn decode(data: &[u8]) -> Decoded {
        if data.len() < 4 {
            return Decoded::Incomplete;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            return Decoded::Incomplete;
        }
        match serde_json::from_slice(&data[4..4 + len]) {
            Ok(msg) => Decoded::Frame(msg, 4 + len),
            Err(_) => Decoded::Malformed(4 + len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encode_decode() {
        let msg = Message::Command(Command::Next);
        let encoded = msg.encode().unwrap();
        match Message::decode(&encoded) {
            Decoded::Frame(Message::Command(Command::Next), len) => {
                assert_eq!(len, encoded.len());
            }
            other => panic!("unexpected decode outcome {:?}", other),
        }
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = TvState {
            rev: 7,
            powered: true,
            current_index: 2,
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            state,
        });
        let encoded = msg.encode().unwrap();
        match Message::decode(&encoded) {
            Decoded::Frame(
                Message::Broadcast(Broadcast::Hello {
                    protocol_version,
                    state,
                }),
                _,
            ) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(state.rev, 7);
                assert_eq!(state.current_index, 2);
            }
            other => panic!("unexpected decode outcome {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_keeps_buffering() {
        let encoded = Message::Command(Command::PowerToggle).encode().unwrap();
        assert!(matches!(Message::decode(&encoded[..2]), Decoded::Incomplete));
        assert!(matches!(
            Message::decode(&encoded[..encoded.len() - 1]),
            Decoded::Incomplete
        ));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = Message::Command(Command::Prev).encode().unwrap();
        buf.extend(Message::Command(Command::Unmute).encode().unwrap());

        let Decoded::Frame(first, consumed) = Message::decode(&buf) else {
            panic!("first frame did not decode");
        };
        assert!(matches!(first, Message::Command(Command::Prev)));
        let Decoded::Frame(second, _) = Message::decode(&buf[consumed..]) else {
            panic!("second frame did not decode");
        };
        assert!(matches!(second, Message::Command(Command::Unmute)));
    }

    #[test]
    fn test_malformed_frame_is_skippable() {
        // Valid length header, garbage payload, then a good frame behind it.
        let garbage = b"{ not json";
        let mut buf = Vec::new();
        buf.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        buf.extend_from_slice(garbage);
        buf.extend(Message::Command(Command::Next).encode().unwrap());

        let Decoded::Malformed(consumed) = Message::decode(&buf) else {
            panic!("garbage payload must decode as malformed");
        };
        assert_eq!(consumed, 4 + garbage.len());
        assert!(matches!(
            Message::decode(&buf[consumed..]),
            Decoded::Frame(Message::Command(Command::Next), _)
        ));
    }
}
