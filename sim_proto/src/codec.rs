//! Length-prefixed message framing shared by every channel.
//!
//! A frame is a little-endian `u32` byte count followed by that many bytes of
//! bincode. A payload that fails to decode leaves the stream aligned on the
//! next frame, so a server can answer a malformed request and keep reading.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encode failed: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode failed: {0}")]
    Decode(#[source] bincode::Error),
    #[error("message of {0} bytes exceeds the frame limit")]
    Oversized(usize),
}

impl CodecError {
    /// The peer closed the connection or the read timed out.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            CodecError::Io(err) if matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CodecError::Io(err) if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            )
        )
    }
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(message).map_err(CodecError::Encode)?;
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(CodecError::Oversized(payload.len()));
    }
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(payload).map_err(CodecError::Decode)
}

/// Write an already framed buffer produced by [`encode_message`].
pub fn write_framed<W: Write>(writer: &mut W, framed: &[u8]) -> Result<(), CodecError> {
    writer.write_all(framed)?;
    writer.flush()?;
    Ok(())
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), CodecError> {
    let framed = encode_message(message)?;
    write_framed(writer, &framed)
}

/// Read one frame's payload without decoding it.
pub fn read_payload<R: Read>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(CodecError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, CodecError> {
    let payload = read_payload(reader)?;
    decode_message(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Request, RequestEnvelope};
    use std::io::Cursor;

    #[test]
    fn malformed_payload_leaves_stream_aligned() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&3u32.to_le_bytes());
        buffer.extend_from_slice(&[0xff, 0xff, 0xff]);
        write_message(
            &mut buffer,
            &RequestEnvelope {
                correlation_id: 7,
                request: Request::Ping,
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(buffer);
        let first: Result<RequestEnvelope, _> = read_message(&mut cursor);
        assert!(matches!(first, Err(CodecError::Decode(_))));
        let second: RequestEnvelope = read_message(&mut cursor).unwrap();
        assert_eq!(second.correlation_id, 7);
    }

    #[test]
    fn truncated_stream_reports_disconnect() {
        let mut cursor = Cursor::new(vec![1u8, 0]);
        let err = read_payload(&mut cursor).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut cursor = Cursor::new(u32::MAX.to_le_bytes().to_vec());
        assert!(matches!(
            read_payload(&mut cursor),
            Err(CodecError::Oversized(_))
        ));
    }
}
