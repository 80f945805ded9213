//! Binary wire protocol — framing, request/response types, error codes.
//!
//! Every message is a 12-byte big-endian header followed by a payload:
//!
//! ```text
//! [magic: u32 = 0x4E455841 "NEXA"][version: u8 = 1][type: u8][flags: u16][payload_len: u32]
//! ```
//!
//! The payload is a codec-encoded map (see [`crate::value`]); which fields
//! it must carry depends on the type. Connections are strictly serial —
//! one request, one response, no request ids.
//!
//! A frame with the wrong magic or version means the peer is not speaking
//! this protocol; the server closes the connection without replying.
//! Payloads above [`MAX_PAYLOAD`] are likewise treated as a framing
//! violation.


use std::io::{self, Read, Write};

use thiserror::Error;

use crate::encoding::EncodingError;

/// Frame magic, `"NEXA"` big-endian.
pub const MAGIC: u32 = 0x4E45_5841;
/// Protocol version.
pub const VERSION: u8 = 1;
/// Header size in bytes.
pub const HEADER_SIZE: usize = 12;
/// Upper bound on a payload; larger frames close the connection.
pub const MAX_PAYLOAD: u32 = 32 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket I/O failure (includes timeouts and peer close).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The frame did not start with the protocol magic.
    #[error("bad magic 0x{0:08X}")]
    BadMagic(u32),

    /// The peer speaks an unsupported protocol version.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Declared payload length exceeds [`MAX_PAYLOAD`].
    #[error("payload length {0} exceeds limit")]
    PayloadTooLarge(u32),

    /// The payload bytes did not decode as the expected value shape.
    #[error("malformed payload: {0}")]
    Payload(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// Message types
// ------------------------------------------------------------------------------------------------

/// Client request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    /// Authenticate the connection.
    Connect = 0x01,
    /// Insert a document.
    Create = 0x02,
    /// Fetch a document by key.
    Read = 0x03,
    /// Shallow-merge fields into a document.
    Update = 0x04,
    /// Delete a document.
    Delete = 0x05,
    /// Filtered range query.
    Query = 0x06,
    /// k-nearest-neighbour search.
    VectorSearch = 0x07,
    /// Batched puts/deletes in one group commit.
    BatchWrite = 0x08,
    /// Liveness probe.
    Ping = 0x09,
}

impl TryFrom<u8> for RequestType {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0x01 => Ok(RequestType::Connect),
            0x02 => Ok(RequestType::Create),
            0x03 => Ok(RequestType::Read),
            0x04 => Ok(RequestType::Update),
            0x05 => Ok(RequestType::Delete),
            0x06 => Ok(RequestType::Query),
            0x07 => Ok(RequestType::VectorSearch),
            0x08 => Ok(RequestType::BatchWrite),
            0x09 => Ok(RequestType::Ping),
            other => Err(other),
        }
    }
}

/// Server response types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    /// The request succeeded; payload carries the result.
    Success = 0x81,
    /// The request failed; payload carries `{code, message}`.
    Error = 0x82,
    /// The addressed document does not exist. Not an error.
    NotFound = 0x83,
    /// Reply to [`RequestType::Ping`].
    Pong = 0x88,
}

/// Error codes carried in an ERROR payload's `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed or semantically invalid request.
    BadRequest,
    /// The connection has not authenticated.
    Unauthenticated,
    /// Referenced entity (database, collection) does not exist.
    NotFound,
    /// CREATE with an `_id` that already exists.
    AlreadyExists,
    /// Vector length disagrees with the collection dimension.
    DimensionMismatch,
    /// Persistent storage failure.
    StorageIo,
    /// Unexpected server-side failure.
    Internal,
}

impl ErrorCode {
    /// Wire spelling of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::DimensionMismatch => "DIMENSION_MISMATCH",
            ErrorCode::StorageIo => "STORAGE_IO",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Framing
// ------------------------------------------------------------------------------------------------

/// One decoded frame: type byte, flags, raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Request or response type byte.
    pub frame_type: u8,
    /// Currently unused; clients send 0.
    pub flags: u16,
    /// Codec-encoded payload bytes.
    pub payload: Vec<u8>,
}

/// Reads one frame, validating magic, version, and payload bound.
pub fn read_frame(reader: &mut impl Read) -> Result<Frame, ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let version = header[4];
    if version != VERSION {
        return Err(ProtocolError::BadVersion(version));
    }

    let frame_type = header[5];
    let flags = u16::from_be_bytes([header[6], header[7]]);
    let payload_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if payload_len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    Ok(Frame {
        frame_type,
        flags,
        payload,
    })
}

/// Writes one frame and flushes.
pub fn write_frame(
    writer: &mut impl Write,
    frame_type: u8,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    header[4] = VERSION;
    header[5] = frame_type;
    header[6..8].copy_from_slice(&0u16.to_be_bytes());
    header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}
