//! Length-prefixed frames: `[version:1][type:1][length:2 BE][payload]`

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

pub const VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Request),
            1 => Ok(FrameType::Response),
            other => Err(Error::frame(format!("unknown frame type {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::frame(format!(
                "payload of {} bytes does not fit a frame",
                payload.len()
            )));
        }
        Ok(Self {
            frame_type,
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(VERSION);
        buf.put_u8(self.frame_type as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Validate a header and return the frame type and payload length.
    pub fn parse_header(header: [u8; HEADER_LEN]) -> Result<(FrameType, usize)> {
        if header[0] != VERSION {
            return Err(Error::frame(format!(
                "unsupported frame version {}",
                header[0]
            )));
        }
        let frame_type = FrameType::try_from(header[1])?;
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        Ok((frame_type, len))
    }
}

/// Read exactly one frame. A stream ending inside the frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (frame_type, len) = Frame::parse_header(header)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        frame_type,
        payload: payload.into(),
    })
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
