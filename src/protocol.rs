//! The per-exchange protocol header (spec §6 "Wire-observable constants").
//!
//! This is the part of message framing the exchange core actually owns: the
//! exchange flags byte, the opcode/protocol-id pair, the exchange id and the
//! optional piggybacked ack counter. Everything below this (message counter,
//! session id, node ids, encryption) is the Session capability's concern and
//! is out of scope here.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Result as IoResult, Write};

/// Protocol namespace for opcodes carried on an exchange.
pub type ProtocolId = u16;

/// Secure-channel protocol id: carries the standalone-ack opcode and (out of
/// scope here) the secure-channel handshake.
pub const PROTOCOL_ID_SECURE_CHANNEL: ProtocolId = 0x0000;
/// Interaction-model protocol id, referenced only as an example namespace —
/// the interaction model itself is protocol-specific handler logic and out
/// of scope (spec §1).
pub const PROTOCOL_ID_INTERACTION: ProtocolId = 0x0001;

/// The one opcode the core itself emits: a standalone acknowledgement.
/// Carries an empty payload, the ack flag set, and the reliability flag
/// clear.
pub const OPCODE_STANDALONE_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeFlags(u8);

impl ExchangeFlags {
    pub const INITIATOR: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const RELIABILITY: u8 = 0b0000_0100;
    /// Set when a vendor id follows the protocol id on the wire, scoping
    /// `protocol_id` to a vendor-specific namespace rather than the
    /// standard one. No vendor-scoped protocol is registered by this crate,
    /// but the bit and the trailing field are part of the header shape
    /// (spec §8's round-trip law names it explicitly).
    pub const VENDOR: u8 = 0b0001_0000;

    pub fn new(initiator: bool, ack: bool, reliability: bool, vendor_present: bool) -> Self {
        let mut bits = 0u8;
        if initiator {
            bits |= Self::INITIATOR;
        }
        if ack {
            bits |= Self::ACK;
        }
        if reliability {
            bits |= Self::RELIABILITY;
        }
        if vendor_present {
            bits |= Self::VENDOR;
        }
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_initiator(self) -> bool {
        self.0 & Self::INITIATOR != 0
    }

    pub fn has_ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn is_reliable(self) -> bool {
        self.0 & Self::RELIABILITY != 0
    }

    pub fn has_vendor(self) -> bool {
        self.0 & Self::VENDOR != 0
    }
}

impl From<u8> for ExchangeFlags {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

/// A decoded/about-to-be-encoded protocol header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub flags: ExchangeFlags,
    pub opcode: u8,
    pub exchange_id: u16,
    pub protocol_id: ProtocolId,
    /// Present iff `flags.has_vendor()`: scopes `protocol_id` to a
    /// vendor-specific namespace. Carried on the wire between `protocol_id`
    /// and the ack counter; never populated by this crate's own traffic.
    pub vendor_id: Option<u16>,
    pub ack_counter: Option<u32>,
}

impl ProtocolHeader {
    pub fn encode(&self) -> IoResult<Vec<u8>> {
        let mut out = Vec::with_capacity(10);
        out.write_u8(self.flags.bits())?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if let Some(vendor_id) = self.vendor_id {
            out.write_u16::<LittleEndian>(vendor_id)?;
        }
        if let Some(ack) = self.ack_counter {
            out.write_u32::<LittleEndian>(ack)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> IoResult<(Self, Vec<u8>)> {
        let mut cursor = Cursor::new(data);
        let flags = ExchangeFlags::from(cursor.read_u8()?);
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let vendor_id = if flags.has_vendor() {
            Some(cursor.read_u16::<LittleEndian>()?)
        } else {
            None
        };
        let ack_counter = if flags.has_ack() {
            Some(cursor.read_u32::<LittleEndian>()?)
        } else {
            None
        };
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                flags,
                opcode,
                exchange_id,
                protocol_id,
                vendor_id,
                ack_counter,
            },
            rest,
        ))
    }

    /// Builds the standalone-ack message body for `exchange_id`/`ack_for`:
    /// empty payload, ack flag set, reliability flag clear (spec §4.5
    /// "Standalone ack emission").
    pub fn standalone_ack(exchange_id: u16, initiator: bool, ack_for: u32) -> Self {
        Self {
            flags: ExchangeFlags::new(initiator, true, false, false),
            opcode: OPCODE_STANDALONE_ACK,
            exchange_id,
            protocol_id: PROTOCOL_ID_SECURE_CHANNEL,
            vendor_id: None,
            ack_counter: Some(ack_for),
        }
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.protocol_id == PROTOCOL_ID_SECURE_CHANNEL && self.opcode == OPCODE_STANDALONE_ACK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_flag_combinations() {
        for initiator in [false, true] {
            for ack in [false, true] {
                for reliability in [false, true] {
                    for vendor in [false, true] {
                        let header = ProtocolHeader {
                            flags: ExchangeFlags::new(initiator, ack, reliability, vendor),
                            opcode: 0x42,
                            exchange_id: 0xbeef,
                            protocol_id: PROTOCOL_ID_INTERACTION,
                            vendor_id: if vendor { Some(0xfff1) } else { None },
                            ack_counter: if ack { Some(0x1234_5678) } else { None },
                        };
                        let encoded = header.encode().unwrap();
                        let (decoded, rest) = ProtocolHeader::decode(&encoded).unwrap();
                        assert_eq!(decoded, header);
                        assert!(rest.is_empty());
                    }
                }
            }
        }
    }

    #[test]
    fn decode_preserves_trailing_payload() {
        let header = ProtocolHeader {
            flags: ExchangeFlags::new(true, false, true, false),
            opcode: 0x01,
            exchange_id: 7,
            protocol_id: PROTOCOL_ID_INTERACTION,
            vendor_id: None,
            ack_counter: None,
        };
        let mut encoded = header.encode().unwrap();
        encoded.extend_from_slice(b"ping");
        let (decoded, rest) = ProtocolHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(rest, b"ping");
    }

    #[test]
    fn vendor_id_round_trips_independently_of_ack() {
        let header = ProtocolHeader {
            flags: ExchangeFlags::new(false, false, false, true),
            opcode: 0x05,
            exchange_id: 0x1234,
            protocol_id: PROTOCOL_ID_INTERACTION,
            vendor_id: Some(0xfff4),
            ack_counter: None,
        };
        let encoded = header.encode().unwrap();
        let (decoded, rest) = ProtocolHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
        assert!(decoded.flags.has_vendor());
    }

    #[test]
    fn standalone_ack_shape() {
        let h = ProtocolHeader::standalone_ack(5, true, 99);
        assert!(h.flags.has_ack());
        assert!(!h.flags.is_reliable());
        assert_eq!(h.ack_counter, Some(99));
        assert!(h.is_standalone_ack());
    }
}
