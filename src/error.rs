//! Error types

use thiserror::Error;

/// RFT protocol error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid magic number: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("invalid protocol version: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("unknown opcode {opcode} for {family} message")]
    UnknownOpcode { family: &'static str, opcode: u8 },

    #[error("truncated message: need {need} bytes, got {got}")]
    TruncatedMessage { need: usize, got: usize },

    #[error("invalid range on wire: [{min}, {max}]")]
    InvalidRange { min: i64, max: i64 },

    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),

    #[error("resource hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },

    #[error("resource length mismatch: expected {expected}, reported {reported}")]
    LengthMismatch { expected: u64, reported: u64 },

    #[error("session closed")]
    SessionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error("writer failure: {0}")]
    Writer(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
