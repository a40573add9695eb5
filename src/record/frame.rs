//! Frame encoding and decoding for the ClawChat record layer.
//!
//! Record header layout (network byte order, 10 bytes):
//! ```text
//! +---------+--------------+----------------------+
//! | Version | Message Type | Sequence             |
//! | 1 byte  | 1 byte       | 8 bytes (BE64)       |
//! +---------+--------------+----------------------+
//! ```
//! The header doubles as the AEAD associated data; the remainder of the
//! datagram is `ciphertext || tag`.

use crate::core::{
    AEAD_NONCE_SIZE, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MIN_FRAME_SIZE, PROTOCOL_VERSION,
    RecordDrop,
};

/// Message type opcodes.
///
/// The enum is closed: transport kinds drive the session state machine,
/// application kinds are carried opaquely and dispatched by the relay
/// gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Hole-punch initiation (client to server).
    HandshakePunch = 0x01,
    /// Hole-punch acknowledgment (server to client).
    HandshakeAck = 0x02,
    /// Keepalive probe.
    KeepalivePing = 0x03,
    /// Keepalive reply.
    KeepalivePong = 0x04,
    /// Key rotation proposal carrying fresh entropy.
    KeyRotationPropose = 0x05,
    /// Key rotation acknowledgment carrying the peer's entropy.
    KeyRotationAck = 0x06,
    /// Advisory announcement of a new server endpoint.
    PortRotationNotify = 0x07,
    /// Compromise declaration; triggers teardown and key destruction.
    Compromised = 0x08,
    /// Compromise acknowledgment.
    CompromisedAck = 0x09,
    /// Error report (e.g. backend unavailable).
    Error = 0x0A,

    /// Chat request (application, relayed).
    ChatRequest = 0x20,
    /// Chat response (application, relayed).
    ChatResponse = 0x21,

    /// Directory listing request/response (application, relayed).
    FileList = 0x30,
    /// File download chunk (application, relayed).
    FileDownloadChunk = 0x31,
    /// File upload chunk (application, relayed).
    FileUploadChunk = 0x32,
    /// File deletion (application, relayed).
    FileDelete = 0x33,
    /// File rename (application, relayed).
    FileRename = 0x34,
    /// Directory creation (application, relayed).
    FileMkdir = 0x35,
    /// File metadata query (application, relayed).
    FileStat = 0x36,

    /// Scheduled-task listing (application, relayed).
    CronList = 0x40,
    /// Scheduled-task creation (application, relayed).
    CronAdd = 0x41,
    /// Scheduled-task removal (application, relayed).
    CronRemove = 0x42,
    /// Immediate scheduled-task run (application, relayed).
    CronRun = 0x43,
    /// Scheduled-task reload (application, relayed).
    CronReload = 0x44,
    /// Scheduled-task result (application, relayed).
    CronResult = 0x45,
}

impl MessageType {
    /// Parse a message type from its opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::HandshakePunch),
            0x02 => Some(Self::HandshakeAck),
            0x03 => Some(Self::KeepalivePing),
            0x04 => Some(Self::KeepalivePong),
            0x05 => Some(Self::KeyRotationPropose),
            0x06 => Some(Self::KeyRotationAck),
            0x07 => Some(Self::PortRotationNotify),
            0x08 => Some(Self::Compromised),
            0x09 => Some(Self::CompromisedAck),
            0x0A => Some(Self::Error),
            0x20 => Some(Self::ChatRequest),
            0x21 => Some(Self::ChatResponse),
            0x30 => Some(Self::FileList),
            0x31 => Some(Self::FileDownloadChunk),
            0x32 => Some(Self::FileUploadChunk),
            0x33 => Some(Self::FileDelete),
            0x34 => Some(Self::FileRename),
            0x35 => Some(Self::FileMkdir),
            0x36 => Some(Self::FileStat),
            0x40 => Some(Self::CronList),
            0x41 => Some(Self::CronAdd),
            0x42 => Some(Self::CronRemove),
            0x43 => Some(Self::CronRun),
            0x44 => Some(Self::CronReload),
            0x45 => Some(Self::CronResult),
            _ => None,
        }
    }

    /// Opcode byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this kind is relayed opaquely to the backend.
    pub fn is_application(self) -> bool {
        self.as_byte() >= 0x20
    }

    /// Whether this kind drives the session state machine.
    pub fn is_transport(self) -> bool {
        !self.is_application()
    }
}

/// The unencrypted record header, used as AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version (currently 2).
    pub version: u8,
    /// Message type opcode.
    pub message_type: MessageType,
    /// Per-direction monotonic sequence number.
    pub sequence: u64,
}

impl FrameHeader {
    /// Create a header for the current protocol version.
    pub fn new(message_type: MessageType, sequence: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            sequence,
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.message_type.as_byte();
        buf[2..10].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// Parse a header from the front of a received datagram.
    ///
    /// Verifies frame length bounds, the protocol version, and that the
    /// opcode is known.
    pub fn parse(data: &[u8]) -> Result<Self, RecordDrop> {
        if data.len() < MIN_FRAME_SIZE {
            return Err(RecordDrop::TooShort);
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(RecordDrop::Oversized);
        }
        if data[0] != PROTOCOL_VERSION {
            return Err(RecordDrop::VersionMismatch(data[0]));
        }
        let message_type = MessageType::from_byte(data[1]).ok_or(RecordDrop::UnknownType(data[1]))?;

        let mut seq = [0u8; 8];
        seq.copy_from_slice(&data[2..10]);

        Ok(Self {
            version: data[0],
            message_type,
            sequence: u64::from_be_bytes(seq),
        })
    }
}

/// Derive the 96-bit AEAD nonce from a sequence number.
///
/// The sequence is written big-endian into the low 8 bytes; the high 4
/// bytes are zero. Distinct directions use distinct keys, so this never
/// repeats a (key, nonce) pair while sequences stay monotonic.
pub fn nonce_from_sequence(sequence: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[4..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}
