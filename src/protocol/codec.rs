use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::Error;
use super::frame::{Frame, FrameKind, HEADER_LEN};

/// Codec splitting the link byte stream into frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&length) = src.first() else {
            return Ok(None);
        };
        let length = length as usize;

        if length < HEADER_LEN {
            // No way to find the next frame boundary
            let discarded = src.len();
            src.clear();
            return Err(Error::protocol(format!(
                "frame length {} shorter than header, discarded {} bytes",
                length, discarded
            )));
        }

        if src.len() < length {
            // Need more data to read full frame
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut bytes = src.split_to(length);
        bytes.advance(1);
        let kind = FrameKind::try_from(bytes.get_u8())?;
        let operation = bytes.get_u8();
        let operand = bytes.get_u8();

        Frame::new(kind, operation, operand, bytes.freeze()).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}
