//! Frame codec
//!
//! Every frame is a 4-byte big-endian body length followed by a bincode
//! encoded [`Frame`]. Requests and responses share one frame type and are
//! matched by `call_id`, so many calls can be in flight on one stream.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use panpolicy_core::{CallError, MethodError};

/// Length of the frame header
pub const FRAME_HEADER_LEN: usize = 4;

// ----------------------------------------------------------------------------
// Frame Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub call_id: u64,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    Request { method: String, payload: Vec<u8> },
    Response { outcome: Result<Vec<u8>, MethodError> },
}

impl Frame {
    pub fn request(call_id: u64, method: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            call_id,
            body: FrameBody::Request {
                method: method.into(),
                payload,
            },
        }
    }

    pub fn response(call_id: u64, outcome: Result<Vec<u8>, MethodError>) -> Self {
        Self {
            call_id,
            body: FrameBody::Response { outcome },
        }
    }
}

// ----------------------------------------------------------------------------
// Payload Encoding
// ----------------------------------------------------------------------------

pub fn encode_payload<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, CallError> {
    bincode::serialize(value).map_err(|e| CallError::Encode {
        what,
        reason: e.to_string(),
    })
}

pub fn decode_payload<T: DeserializeOwned>(what: &'static str, bytes: &[u8]) -> Result<T, CallError> {
    bincode::deserialize(bytes).map_err(|e| CallError::Decode {
        what,
        reason: e.to_string(),
    })
}

// ----------------------------------------------------------------------------
// Stream I/O
// ----------------------------------------------------------------------------

/// Write one frame, rejecting bodies above `max_frame_size`
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, max_frame_size: usize) -> Result<(), CallError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_payload("frame", frame)?;
    if body.len() > max_frame_size {
        return Err(CallError::FrameTooLarge {
            size: body.len(),
            max: max_frame_size,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| CallError::FrameTooLarge {
        size: body.len(),
        max: max_frame_size,
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await.map_err(lost)?;
    writer.flush().await.map_err(lost)
}

/// Read one frame; `Ok(None)` on a clean end of stream between frames
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>, CallError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(lost(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        return Err(CallError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(lost)?;
    decode_payload("frame", &body).map(Some)
}

fn lost(e: std::io::Error) -> CallError {
    CallError::ConnectionLost {
        reason: e.to_string(),
    }
}
