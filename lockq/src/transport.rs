//! Framing of protocol messages over a byte stream.
//!
//! Each frame consists of a 4-byte little-endian length header followed by
//! a JSON document.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::{error::Error, fmt, io};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Receiving or sending a frame failed.
#[derive(Debug)]
pub enum TransportError {
    /// An IO error occurred on the underlying connection.
    Io(io::Error),
    /// A frame could not be encoded or decoded.
    Json(serde_json::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {}", err),
            Self::Json(err) => write!(f, "invalid frame: {}", err),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Frames the receive half of a connection.
pub fn reader<Read>(input: Read, max_frame_length: usize) -> FramedRead<Read, LengthDelimitedCodec>
where
    Read: AsyncRead,
{
    FramedRead::new(input, codec(max_frame_length))
}

/// Frames the send half of a connection.
pub fn writer<Write>(output: Write, max_frame_length: usize) -> FramedWrite<Write, LengthDelimitedCodec>
where
    Write: AsyncWrite,
{
    FramedWrite::new(output, codec(max_frame_length))
}

/// Encodes a message into a frame.
pub fn encode<T>(item: &T) -> Result<Bytes, serde_json::Error>
where
    T: Serialize,
{
    serde_json::to_vec(item).map(Bytes::from)
}

/// Decodes a message from a frame.
pub fn decode<T>(frame: &[u8]) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned,
{
    serde_json::from_slice(frame)
}

/// Encodes and sends a message.
pub async fn send<S, T>(sink: &mut S, item: &T) -> Result<(), TransportError>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
    T: Serialize,
{
    let frame = encode(item)?;
    sink.send(frame).await?;
    Ok(())
}

/// Receives the next frame.
///
/// Returns [None] when the connection has been closed.
pub async fn recv_frame<S>(stream: &mut S) -> Option<Result<Bytes, TransportError>>
where
    S: Stream<Item = Result<bytes::BytesMut, io::Error>> + Unpin,
{
    stream.next().await.map(|res| res.map(|frame| frame.freeze()).map_err(TransportError::from))
}
