//! Binary message framing for the collaboration protocol.
//!
//! Every WebSocket binary frame carries one message:
//!
//! ```text
//! ┌──────────────────────┬───────────────┬──────────────────┐
//! │ varstring(document)  │ varuint(type) │ payload          │
//! └──────────────────────┴───────────────┴──────────────────┘
//! ```
//!
//! Payloads by type:
//!
//! | Tag | Name            | Payload                               |
//! |----:|-----------------|---------------------------------------|
//! |   0 | Auth            | varstring(token) / reply: varuint(code) varstring(reason) |
//! |   1 | LoroUpdate      | varbytes(update)                      |
//! |   2 | LoroSyncRequest | varstring(version vector JSON or "")  |
//! |   3 | LoroSyncBatch   | varuint(N) then N × varbytes(update)  |
//! |   4 | LoroEphemeral   | varbytes(delta)                       |
//!
//! The `Auth` tag is direction-dependent: a client sends a token request, a
//! server sends a decision reply. [`Message::decode`] therefore takes the
//! [`Direction`] the frame travelled. A frame must consume its entire
//! input; trailing bytes, unknown tags, oversize frames, and malformed
//! names are all protocol errors fatal to the offending connection.

use std::fmt;

use crate::codec::{CodecError, Decoder, Encoder};

/// Wire type tags. Assigned as a stable contiguous block.
pub mod tag {
    pub const AUTH: u64 = 0;
    pub const UPDATE: u64 = 1;
    pub const SYNC_REQUEST: u64 = 2;
    pub const SYNC_BATCH: u64 = 3;
    pub const EPHEMERAL: u64 = 4;
}

/// Which way a frame travelled. Decides how the `Auth` payload reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Server admission decision carried in an `Auth` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthCode {
    PermissionDenied = 0,
    Authenticated = 1,
}

impl AuthCode {
    fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(AuthCode::PermissionDenied),
            1 => Some(AuthCode::Authenticated),
            _ => None,
        }
    }
}

/// Framing limits enforced on inbound frames.
#[derive(Debug, Clone)]
pub struct FrameLimits {
    /// Maximum byte length of a document name.
    pub max_name_len: usize,
    /// Maximum total frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_name_len: 1024,
            max_frame_size: 8 * 1024 * 1024, // 8 MiB
        }
    }
}

/// One protocol message, addressed to a document by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client → server: request admission to a document with a token.
    Auth { doc: String, token: String },
    /// Server → client: admission decision for a document.
    AuthReply {
        doc: String,
        code: AuthCode,
        reason: String,
    },
    /// A single incremental CRDT update, opaque to the hub.
    Update { doc: String, update: Vec<u8> },
    /// Initial-sync request carrying the sender's version vector as JSON
    /// (empty string means "I have nothing").
    SyncRequest { doc: String, version: String },
    /// Server reply to a sync request: the diffed update batch.
    SyncBatch { doc: String, updates: Vec<Vec<u8>> },
    /// Ephemeral (presence) delta, relayed but never persisted.
    Ephemeral { doc: String, delta: Vec<u8> },
}

impl Message {
    /// The document this message addresses.
    pub fn doc(&self) -> &str {
        match self {
            Message::Auth { doc, .. }
            | Message::AuthReply { doc, .. }
            | Message::Update { doc, .. }
            | Message::SyncRequest { doc, .. }
            | Message::SyncBatch { doc, .. }
            | Message::Ephemeral { doc, .. } => doc,
        }
    }

    /// The wire tag for this message.
    pub fn tag(&self) -> u64 {
        match self {
            Message::Auth { .. } | Message::AuthReply { .. } => tag::AUTH,
            Message::Update { .. } => tag::UPDATE,
            Message::SyncRequest { .. } => tag::SYNC_REQUEST,
            Message::SyncBatch { .. } => tag::SYNC_BATCH,
            Message::Ephemeral { .. } => tag::EPHEMERAL,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.doc().len() + 16);
        enc.varstring(self.doc()).varuint(self.tag());
        match self {
            Message::Auth { token, .. } => {
                enc.varstring(token);
            }
            Message::AuthReply { code, reason, .. } => {
                enc.varuint(*code as u64).varstring(reason);
            }
            Message::Update { update, .. } => {
                enc.varbytes(update);
            }
            Message::SyncRequest { version, .. } => {
                enc.varstring(version);
            }
            Message::SyncBatch { updates, .. } => {
                enc.varuint(updates.len() as u64);
                for update in updates {
                    enc.varbytes(update);
                }
            }
            Message::Ephemeral { delta, .. } => {
                enc.varbytes(delta);
            }
        }
        enc.into_bytes()
    }

    /// Parse a frame received from the given direction, enforcing `limits`.
    ///
    /// The whole slice must be consumed; trailing bytes are an error.
    pub fn decode(
        bytes: &[u8],
        direction: Direction,
        limits: &FrameLimits,
    ) -> Result<Message, ProtocolError> {
        if bytes.len() > limits.max_frame_size {
            return Err(ProtocolError::Oversize(bytes.len()));
        }

        let mut dec = Decoder::new(bytes);
        let doc = dec.varstring()?;
        if doc.is_empty() {
            return Err(ProtocolError::EmptyDocumentName);
        }
        if doc.len() > limits.max_name_len {
            return Err(ProtocolError::DocumentNameTooLong(doc.len()));
        }
        let doc = doc.to_owned();

        let tag = dec.varuint()?;
        let message = match (tag, direction) {
            (tag::AUTH, Direction::ClientToServer) => Message::Auth {
                doc,
                token: dec.varstring()?.to_owned(),
            },
            (tag::AUTH, Direction::ServerToClient) => {
                let raw = dec.varuint()?;
                let code =
                    AuthCode::from_u64(raw).ok_or(ProtocolError::UnknownAuthCode(raw))?;
                Message::AuthReply {
                    doc,
                    code,
                    reason: dec.varstring()?.to_owned(),
                }
            }
            (tag::UPDATE, _) => Message::Update {
                doc,
                update: dec.varbytes()?.to_vec(),
            },
            (tag::SYNC_REQUEST, _) => Message::SyncRequest {
                doc,
                version: dec.varstring()?.to_owned(),
            },
            (tag::SYNC_BATCH, _) => {
                let count = dec.varuint()?;
                // Each update needs at least its one-byte length prefix, so
                // the count can never exceed the bytes left.
                if count > dec.remaining() as u64 {
                    return Err(ProtocolError::BatchCountTooLarge(count));
                }
                let mut updates = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    updates.push(dec.varbytes()?.to_vec());
                }
                Message::SyncBatch { doc, updates }
            }
            (tag::EPHEMERAL, _) => Message::Ephemeral {
                doc,
                delta: dec.varbytes()?.to_vec(),
            },
            (other, _) => return Err(ProtocolError::UnknownTag(other)),
        };

        if !dec.is_empty() {
            return Err(ProtocolError::TrailingBytes(dec.remaining()));
        }
        Ok(message)
    }
}

/// Framing violations. Fatal to the offending connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Codec(CodecError),
    EmptyDocumentName,
    DocumentNameTooLong(usize),
    UnknownTag(u64),
    UnknownAuthCode(u64),
    BatchCountTooLarge(u64),
    TrailingBytes(usize),
    Oversize(usize),
}

impl From<CodecError> for ProtocolError {
    fn from(e: CodecError) -> Self {
        ProtocolError::Codec(e)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Codec(e) => write!(f, "codec error: {e}"),
            ProtocolError::EmptyDocumentName => write!(f, "empty document name"),
            ProtocolError::DocumentNameTooLong(len) => {
                write!(f, "document name too long: {len} bytes")
            }
            ProtocolError::UnknownTag(tag) => write!(f, "unknown message tag: {tag}"),
            ProtocolError::UnknownAuthCode(code) => write!(f, "unknown auth code: {code}"),
            ProtocolError::BatchCountTooLarge(count) => {
                write!(f, "sync batch count {count} exceeds frame size")
            }
            ProtocolError::TrailingBytes(n) => write!(f, "{n} trailing bytes after payload"),
            ProtocolError::Oversize(len) => write!(f, "frame of {len} bytes exceeds limit"),
        }
    }
}

impl std::error::Error for ProtocolError {}
