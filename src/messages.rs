//! Session-level message framing: the outermost header every wire message
//! carries regardless of protocol, ahead of the (possibly encrypted)
//! `ProtocolHeader` defined in `protocol.rs`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result, Write};

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub flags: u8,
    pub security_flags: u8,
    pub session_id: u16,
    pub message_counter: u32,
    pub source_node_id: Option<Vec<u8>>,
    pub destination_node_id: Option<Vec<u8>>,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;
    /// Privacy-obfuscation bit in `security_flags`. Carried on the wire but
    /// not acted on: privacy obfuscation of this header is cryptographic
    /// session state out of scope here (see `Session::encrypt`'s
    /// `privacy_flag` parameter).
    pub const SECURITY_PRIVACY: u8 = 0x80;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        if self.source_node_id.as_deref().map_or(false, |n| n.len() == 8) {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        match self.destination_node_id.as_deref().map(|n| n.len()) {
            Some(2) => flags |= Self::DSIZ_16,
            Some(8) => flags |= Self::DSIZ_64,
            _ => {}
        }
        let mut out = Vec::with_capacity(32);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if let Some(src) = &self.source_node_id {
            if src.len() == 8 {
                out.write_all(src)?;
            }
        }
        if let Some(dst) = &self.destination_node_id {
            out.write_all(dst)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let flags = cursor.read_u8()?;
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let mut source_node_id = None;
        let mut destination_node_id = None;
        if (flags & Self::FLAG_SRC_PRESENT) != 0 {
            let mut src = vec![0u8; 8];
            cursor.read_exact(&mut src)?;
            source_node_id = Some(src);
        }
        let dsiz = flags & 3;
        if dsiz != 0 {
            let dst_size = match dsiz {
                Self::DSIZ_64 => 8,
                Self::DSIZ_16 => 2,
                _ => 0,
            };
            if dst_size > 0 {
                let mut dst = vec![0u8; dst_size];
                cursor.read_exact(&mut dst)?;
                destination_node_id = Some(dst);
            }
        }
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                flags,
                security_flags,
                session_id,
                message_counter,
                source_node_id,
                destination_node_id,
            },
            rest,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_source_and_no_destination() {
        let header = MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: 0,
            message_counter: 7,
            source_node_id: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            destination_node_id: None,
        };
        let mut encoded = header.encode().unwrap();
        encoded.extend_from_slice(b"body");
        let (decoded, rest) = MessageHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.session_id, 0);
        assert_eq!(decoded.message_counter, 7);
        assert_eq!(decoded.source_node_id, header.source_node_id);
        assert_eq!(rest, b"body");
    }

    #[test]
    fn round_trips_secure_session_no_node_ids() {
        let header = MessageHeader {
            flags: 0,
            security_flags: 1,
            session_id: 42,
            message_counter: 100,
            source_node_id: None,
            destination_node_id: None,
        };
        let encoded = header.encode().unwrap();
        let (decoded, rest) = MessageHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.session_id, 42);
        assert_eq!(decoded.message_counter, 100);
        assert!(decoded.source_node_id.is_none());
        assert!(rest.is_empty());
    }
}
