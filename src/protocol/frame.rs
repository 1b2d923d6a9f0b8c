use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::{CommandId, Error, ParamId, Result};

/// Bytes in front of every payload: length, kind, operation, operand
pub const HEADER_LEN: usize = 4;

/// Largest frame the one-byte length field can describe
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

/// Size of one parameter value on the wire
pub const VALUE_LEN: usize = 4;

/// Largest parameter table a single frame can carry
pub const MAX_TABLE_LEN: usize = MAX_PAYLOAD_LEN / VALUE_LEN;

/// Status byte of a successful Set, SetAll or Command reply
pub const STATUS_OK: u8 = 1;

/// Status byte of a refused Set, SetAll or Command reply
pub const STATUS_FAILED: u8 = 0;

/// Frame kinds carried in byte 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Parameter request expecting a Data reply
    Request = 1,
    /// Parameter data, either a reply or a pushed value
    Data = 2,
    /// Command or command reply
    Command = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Command),
            other => Err(Error::protocol(format!("unknown frame kind {}", other))),
        }
    }
}

/// Operations of Request and Data frames, carried in byte 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// Read one parameter
    Get = 1,
    /// Write one parameter
    Set = 2,
    /// Read the whole table
    GetAll = 3,
    /// Write the whole table
    SetAll = 4,
}

impl TryFrom<u8> for Operation {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Operation::Get),
            2 => Ok(Operation::Set),
            3 => Ok(Operation::GetAll),
            4 => Ok(Operation::SetAll),
            other => Err(Error::protocol(format!("unknown operation {}", other))),
        }
    }
}

/// Header fields a reply must echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    /// Frame kind
    pub kind: FrameKind,
    /// Operation or command id
    pub operation: u8,
    /// Operand id
    pub operand: u8,
}

impl Echo {
    /// Returns true if `frame` has the shape of a reply to this echo.
    ///
    /// The operand is not compared: a reply with the wrong operand is still
    /// delivered so the waiting caller can report the mismatch.
    pub fn accepts(&self, frame: &Frame) -> bool {
        if frame.kind != self.kind || frame.operation != self.operation {
            return false;
        }
        match self.kind {
            FrameKind::Command => frame.is_command_reply(),
            _ => true,
        }
    }
}

impl fmt::Display for Echo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}/{}", self.kind, self.operation, self.operand)
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    operation: u8,
    operand: u8,
    payload: Bytes,
}

impl Frame {
    /// Creates a frame, rejecting payloads that do not fit the length byte
    pub fn new(kind: FrameKind, operation: u8, operand: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::protocol(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }
        Ok(Frame { kind, operation, operand, payload })
    }

    /// Request for the value of `id`
    pub fn get(id: ParamId) -> Self {
        Frame {
            kind: FrameKind::Request,
            operation: Operation::Get as u8,
            operand: id.0,
            payload: Bytes::new(),
        }
    }

    /// Request to store `value` under `id`
    pub fn set(id: ParamId, value: i32) -> Self {
        Frame {
            kind: FrameKind::Request,
            operation: Operation::Set as u8,
            operand: id.0,
            payload: Bytes::copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// Pushed value of `id` that expects no reply
    pub fn push(id: ParamId, value: i32) -> Self {
        Frame {
            kind: FrameKind::Data,
            operation: Operation::Set as u8,
            operand: id.0,
            payload: Bytes::copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// Request for the whole parameter table
    pub fn get_all() -> Self {
        Frame {
            kind: FrameKind::Request,
            operation: Operation::GetAll as u8,
            operand: 0,
            payload: Bytes::new(),
        }
    }

    /// Request to replace the whole parameter table
    pub fn set_all(values: &[i32]) -> Result<Self> {
        Frame::new(
            FrameKind::Request,
            Operation::SetAll as u8,
            0,
            encode_table(values)?,
        )
    }

    /// Command with an empty payload
    pub fn command(command: CommandId) -> Self {
        Frame {
            kind: FrameKind::Command,
            operation: command.0,
            operand: 0,
            payload: Bytes::new(),
        }
    }

    /// Builds the reply to this frame carrying `payload`
    pub fn reply(&self, payload: impl Into<Bytes>) -> Result<Frame> {
        let echo = self
            .expected_reply()
            .ok_or_else(|| Error::protocol(format!("{} frames take no reply", self.kind_name())))?;
        Frame::new(echo.kind, echo.operation, echo.operand, payload)
    }

    /// Header a reply to this frame must carry, if it takes one
    pub fn expected_reply(&self) -> Option<Echo> {
        let kind = match self.kind {
            FrameKind::Request => FrameKind::Data,
            FrameKind::Command if self.payload.is_empty() => FrameKind::Command,
            _ => return None,
        };
        Some(Echo { kind, operation: self.operation, operand: self.operand })
    }

    /// Header fields of this frame
    pub fn echo(&self) -> Echo {
        Echo { kind: self.kind, operation: self.operation, operand: self.operand }
    }

    /// Frame kind
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Raw operation byte
    pub fn operation(&self) -> u8 {
        self.operation
    }

    /// Operand id
    pub fn operand(&self) -> u8 {
        self.operand
    }

    /// Payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns true for Command frames that carry a status
    pub fn is_command_reply(&self) -> bool {
        self.kind == FrameKind::Command && !self.payload.is_empty()
    }

    /// Total encoded length, header included
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Appends the wire form of this frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.encoded_len() as u8);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.operation);
        dst.put_u8(self.operand);
        dst.extend_from_slice(&self.payload);
    }

    /// Reads the single value carried by a Get reply or a Set frame
    pub fn value(&self) -> Result<i32> {
        decode_value(&self.payload)
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            FrameKind::Request => "Request",
            FrameKind::Data => "Data",
            FrameKind::Command if self.is_command_reply() => "Command reply",
            FrameKind::Command => "Command",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[op={} operand={} len={}]",
            self.kind_name(),
            self.operation,
            self.operand,
            self.payload.len()
        )
    }
}

/// Reads one little-endian value from the front of `bytes`
pub fn decode_value(bytes: &[u8]) -> Result<i32> {
    let raw: [u8; VALUE_LEN] = bytes
        .get(..VALUE_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::protocol(format!("expected {} value bytes, got {}", VALUE_LEN, bytes.len())))?;
    Ok(i32::from_le_bytes(raw))
}

/// Lays out a parameter table as consecutive little-endian values
pub fn encode_table(values: &[i32]) -> Result<Bytes> {
    if values.len() > MAX_TABLE_LEN {
        return Err(Error::protocol(format!(
            "table of {} entries exceeds {}",
            values.len(),
            MAX_TABLE_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(values.len() * VALUE_LEN);
    for value in values {
        buf.put_i32_le(*value);
    }
    Ok(buf.freeze())
}

/// Splits a table payload into values; trailing partial bytes are ignored
pub fn decode_table(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(VALUE_LEN)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_frame_layout() {
        let mut buf = BytesMut::new();
        Frame::set(ParamId(3), 42).encode(&mut buf);
        assert_eq!(&buf[..], &[8, 1, 2, 3, 42, 0, 0, 0]);
    }

    #[test]
    fn test_command_frame_layout() {
        let mut buf = BytesMut::new();
        Frame::command(CommandId::KEEPALIVE).encode(&mut buf);
        assert_eq!(&buf[..], &[4, 3, 1, 0]);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(Frame::new(FrameKind::Data, 1, 0, payload).is_err());
        assert!(Frame::new(FrameKind::Data, 1, 0, vec![0u8; MAX_PAYLOAD_LEN]).is_ok());
    }

    #[test]
    fn test_reply_shapes() {
        let get = Frame::get(ParamId(5));
        let reply = get.reply(42i32.to_le_bytes().to_vec()).unwrap();
        assert_eq!(reply.kind(), FrameKind::Data);
        assert_eq!(reply.operand(), 5);
        assert_eq!(reply.value().unwrap(), 42);
        assert!(get.expected_reply().unwrap().accepts(&reply));

        let probe = Frame::command(CommandId::KEEPALIVE);
        let ack = probe.reply(vec![STATUS_OK]).unwrap();
        assert!(ack.is_command_reply());
        assert!(probe.expected_reply().unwrap().accepts(&ack));
        // A peer's own probe is not a reply to ours
        assert!(!probe.expected_reply().unwrap().accepts(&probe));

        assert!(Frame::push(ParamId(1), 0).reply(vec![STATUS_OK]).is_err());
        assert!(ack.expected_reply().is_none());
    }

    #[test]
    fn test_echo_ignores_operand() {
        let expected = Frame::get(ParamId(5)).expected_reply().unwrap();
        let wrong = Frame::get(ParamId(6)).reply(vec![0, 0, 0, 0]).unwrap();
        assert!(expected.accepts(&wrong));
        assert_ne!(expected, wrong.echo());

        let set_reply = Frame::set(ParamId(5), 1).reply(vec![STATUS_OK]).unwrap();
        assert!(!expected.accepts(&set_reply));
    }

    #[test]
    fn test_table_limits() {
        let full = vec![7; MAX_TABLE_LEN];
        let frame = Frame::set_all(&full).unwrap();
        assert_eq!(frame.encoded_len(), HEADER_LEN + MAX_TABLE_LEN * VALUE_LEN);
        assert!(frame.encoded_len() <= MAX_FRAME_LEN);
        assert_eq!(decode_table(frame.payload()), full);

        assert!(Frame::set_all(&vec![0; MAX_TABLE_LEN + 1]).is_err());
    }

    #[test]
    fn test_short_value_rejected() {
        assert!(decode_value(&[1, 2]).is_err());
        assert_eq!(decode_value(&(-3i32).to_le_bytes()).unwrap(), -3);
    }
}
