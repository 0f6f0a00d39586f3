//! Mux frame encoding/decoding
//!
//! Frame format:
//! ```text
//! +--------+----------------+----------+-----------+
//! | Cmd 1B | Stream ID (4B) | Len (2B) |  Payload  |
//! +--------+----------------+----------+-----------+
//! ```

use super::MuxError;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 7;

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Open a substream
    Syn = 0x01,
    /// Close a substream
    Fin = 0x02,
    /// Substream data
    Psh = 0x03,
    /// Keepalive
    Nop = 0x04,
    /// Credit window update (payload: u32_be increment)
    Upd = 0x05,
}

impl TryFrom<u8> for Command {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Syn),
            0x02 => Ok(Command::Fin),
            0x03 => Ok(Command::Psh),
            0x04 => Ok(Command::Nop),
            0x05 => Ok(Command::Upd),
            _ => Err(MuxError::Protocol(format!("unknown command: {:#04x}", value))),
        }
    }
}

/// A mux frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: Command,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn syn(stream_id: u32) -> Self {
        Self {
            cmd: Command::Syn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self {
            cmd: Command::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn psh(stream_id: u32, payload: Bytes) -> Self {
        Self {
            cmd: Command::Psh,
            stream_id,
            payload,
        }
    }

    pub fn nop() -> Self {
        Self {
            cmd: Command::Nop,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    pub fn upd(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment);
        Self {
            cmd: Command::Upd,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Window increment carried by an UPD frame
    pub fn upd_increment(&self) -> Result<u32, MuxError> {
        if self.payload.len() < 4 {
            return Err(MuxError::Protocol("short window update".to_string()));
        }
        Ok(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> BytesMut {
        debug_assert!(self.payload.len() <= u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.cmd as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a header, returning `(command, stream_id, payload_len)`
    pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(Command, u32, usize), MuxError> {
        let cmd = Command::try_from(header[0])?;
        let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let len = u16::from_be_bytes([header[5], header[6]]) as usize;
        Ok((cmd, stream_id, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::psh(42, Bytes::from_static(b"Hello, World!"));
        let encoded = frame.encode();

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&encoded[..HEADER_SIZE]);
        let (cmd, sid, len) = Frame::parse_header(&header).unwrap();

        assert_eq!(cmd, Command::Psh);
        assert_eq!(sid, 42);
        assert_eq!(len, 13);
        assert_eq!(&encoded[HEADER_SIZE..], b"Hello, World!");
    }

    #[test]
    fn test_upd_increment() {
        let frame = Frame::upd(7, 131072);
        assert_eq!(frame.upd_increment().unwrap(), 131072);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let header = [0xEEu8, 0, 0, 0, 1, 0, 0];
        assert!(Frame::parse_header(&header).is_err());
    }

    #[test]
    fn test_control_frames_empty() {
        assert!(Frame::syn(1).payload.is_empty());
        assert!(Frame::fin(1).payload.is_empty());
        assert!(Frame::nop().payload.is_empty());
        assert_eq!(Frame::nop().stream_id, 0);
    }
}
