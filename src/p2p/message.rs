//! Wire messages
//!
//! Every frame on a peer connection starts with a single tag byte: control
//! frames carry a small encoded [`Message`], stream frames hand the socket
//! over to the file server for a raw byte transfer.

use serde::{Deserialize, Serialize};

/// Frame tag announcing an encoded control message
pub const CONTROL_TAG: u8 = 0x1;

/// Frame tag announcing a raw byte stream
pub const STREAM_TAG: u8 = 0x2;

/// A control frame payload fits in one read of this many bytes
pub const MAX_CONTROL_FRAME: usize = 1028;

/// An inbound frame as delivered to the file server. For stream frames only
/// `from` is meaningful; the bytes stay on the socket.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: String,
    pub payload: Vec<u8>,
    pub stream: bool,
}

/// Control messages exchanged between peers. The serialized form carries the
/// variant discriminator explicitly, so decoding needs no registration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Announces an incoming raw stream of `size` bytes (IV prefix included)
    /// to be placed at `(owner_id, hashed_key)`.
    StoreFile {
        owner_id: String,
        hashed_key: String,
        size: u64,
    },
    /// Asks the receiver to stream back its copy of `(owner_id, hashed_key)`.
    GetFile { owner_id: String, hashed_key: String },
    /// Asks the receiver to drop its copy of `(owner_id, hashed_key)`.
    DeleteFile { owner_id: String, hashed_key: String },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let messages = [
            Message::StoreFile {
                owner_id: "node-1".into(),
                hashed_key: "75c2e31f7d5468c0ea90b6e5aae3ccfd".into(),
                size: 38,
            },
            Message::GetFile {
                owner_id: "node-1".into(),
                hashed_key: "75c2e31f7d5468c0ea90b6e5aae3ccfd".into(),
            },
            Message::DeleteFile {
                owner_id: "node-1".into(),
                hashed_key: "75c2e31f7d5468c0ea90b6e5aae3ccfd".into(),
            },
        ];

        for msg in &messages {
            let bytes = msg.encode().unwrap();
            assert!(bytes.len() <= MAX_CONTROL_FRAME);
            assert_eq!(&Message::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Message::decode(&[0xff; 16]).is_err());
    }
}
