//! Message header: id, body attribute, BCD phone number, flow number and
//! the optional packet-segmentation fields.
//!
//! Layout (after unescaping, delimiters and checksum removed):
//!
//! ```text
//! msg_id:        2 bytes, big-endian
//! body_attr:     2 bytes, big-endian bitfield
//! phone_num:     6 bytes, BCD, left-padded to 12 digits
//! msg_flow_num:  2 bytes, big-endian
//! total_packets: 2 bytes  } only when body_attr.packet is set
//! packet_seq:    2 bytes  }
//! ```

use crate::{
    bcd,
    error::{ProtocolError, Result},
};

/// Message-body attribute bitfield.
///
/// Bits `[0..9]` carry the unescaped body length, `[10..12]` the encryption
/// mode, bit 13 the packet-segmented flag. Bits 14 and 15 are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyAttr(u16);

impl BodyAttr {
    /// Largest body length the 10-bit field can carry.
    pub const MAX_BODY_LEN: u16 = 0x03FF;

    /// Wrap a raw attribute word.
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw attribute word.
    #[must_use]
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Unescaped body byte count.
    #[must_use]
    pub fn body_len(self) -> u16 {
        self.0 & Self::MAX_BODY_LEN
    }

    /// Replace the body length, leaving the other bits untouched.
    pub fn set_body_len(&mut self, len: u16) {
        self.0 = (self.0 & !Self::MAX_BODY_LEN) | (len & Self::MAX_BODY_LEN);
    }

    /// Encryption mode bits (0 = plaintext).
    #[must_use]
    pub fn encrypt_mode(self) -> u8 {
        ((self.0 >> 10) & 0x07) as u8
    }

    /// Whether the message is split across packet segments.
    #[must_use]
    pub fn is_packet(self) -> bool {
        self.0 & (1 << 13) != 0
    }

    /// Set or clear the packet-segmented flag.
    pub fn set_packet(&mut self, packet: bool) {
        if packet {
            self.0 |= 1 << 13;
        } else {
            self.0 &= !(1 << 13);
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgHeader {
    /// Message id, e.g. `0x0200` for a location report.
    pub msg_id: u16,
    /// Body attribute bitfield.
    pub attr: BodyAttr,
    /// Terminal phone number, up to 12 decimal digits.
    pub phone: String,
    /// Per-sender monotonically increasing flow number.
    pub flow_num: u16,
    /// Total packet count; meaningful only when `attr.is_packet()`.
    pub total_packets: u16,
    /// 1-based packet sequence; meaningful only when `attr.is_packet()`.
    pub packet_seq: u16,
}

impl MsgHeader {
    /// Header length without the packet fields.
    pub const BASE_LEN: usize = 12;

    /// Header length with the packet fields.
    pub const PACKET_LEN: usize = 16;

    /// Serialized length of this header.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        if self.attr.is_packet() { Self::PACKET_LEN } else { Self::BASE_LEN }
    }

    /// Append the serialized header to `out`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidDigit` if the phone number is not decimal
    /// - `ProtocolError::InvalidBody` if the phone number exceeds 12 digits
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.phone.len() > 12 {
            return Err(ProtocolError::InvalidBody {
                msg_id: self.msg_id,
                reason: "phone number longer than 12 digits",
            });
        }

        out.extend_from_slice(&self.msg_id.to_be_bytes());
        out.extend_from_slice(&self.attr.raw().to_be_bytes());

        let padded = format!("{:0>12}", self.phone);
        out.extend_from_slice(&bcd::encode(&padded)?);

        out.extend_from_slice(&self.flow_num.to_be_bytes());
        if self.attr.is_packet() {
            out.extend_from_slice(&self.total_packets.to_be_bytes());
            out.extend_from_slice(&self.packet_seq.to_be_bytes());
        }
        Ok(())
    }

    /// Parse a header from the start of an unescaped interior region.
    ///
    /// Returns the header and the offset at which the body begins.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if the region cannot hold the header
    /// - `ProtocolError::InvalidBcd` if the phone field is not valid BCD
    pub fn decode(interior: &[u8]) -> Result<(Self, usize)> {
        if interior.len() < Self::BASE_LEN {
            return Err(ProtocolError::FrameTooShort {
                expected: Self::BASE_LEN,
                actual: interior.len(),
            });
        }

        let msg_id = u16::from_be_bytes([interior[0], interior[1]]);
        let attr = BodyAttr::from_raw(u16::from_be_bytes([interior[2], interior[3]]));
        let phone = bcd::decode(&interior[4..10])?;
        let flow_num = u16::from_be_bytes([interior[10], interior[11]]);

        let mut header = Self {
            msg_id,
            attr,
            phone,
            flow_num,
            total_packets: 0,
            packet_seq: 0,
        };

        let body_pos = if attr.is_packet() {
            if interior.len() < Self::PACKET_LEN {
                return Err(ProtocolError::FrameTooShort {
                    expected: Self::PACKET_LEN,
                    actual: interior.len(),
                });
            }
            header.total_packets = u16::from_be_bytes([interior[12], interior[13]]);
            header.packet_seq = u16::from_be_bytes([interior[14], interior[15]]);
            Self::PACKET_LEN
        } else {
            Self::BASE_LEN
        };

        Ok((header, body_pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> MsgHeader {
        MsgHeader {
            msg_id: 0x0200,
            attr: BodyAttr::from_raw(0),
            phone: "13523339527".to_owned(),
            flow_num: 0x0001,
            total_packets: 0,
            packet_seq: 0,
        }
    }

    #[test]
    fn body_attr_fields_are_independent() {
        let mut attr = BodyAttr::from_raw(0);
        attr.set_body_len(0x3FF);
        attr.set_packet(true);
        assert_eq!(attr.body_len(), 0x3FF);
        assert!(attr.is_packet());

        attr.set_body_len(28);
        assert_eq!(attr.body_len(), 28);
        assert!(attr.is_packet());

        attr.set_packet(false);
        assert!(!attr.is_packet());
        assert_eq!(attr.body_len(), 28);
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let mut wire = Vec::new();
        header.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), MsgHeader::BASE_LEN);

        let (parsed, body_pos) = MsgHeader::decode(&wire).unwrap();
        assert_eq!(body_pos, MsgHeader::BASE_LEN);
        assert_eq!(parsed, header);
    }

    #[test]
    fn odd_phone_encodes_with_leading_zero_nibble() {
        let header = sample_header();
        let mut wire = Vec::new();
        header.encode(&mut wire).unwrap();
        assert_eq!(&wire[4..10], &[0x01, 0x35, 0x23, 0x33, 0x95, 0x27]);
    }

    #[test]
    fn short_phone_pads_to_six_bcd_bytes() {
        let mut header = sample_header();
        header.phone = "123".to_owned();
        let mut wire = Vec::new();
        header.encode(&mut wire).unwrap();
        assert_eq!(&wire[4..10], &[0x00, 0x00, 0x00, 0x00, 0x01, 0x23]);
    }

    #[test]
    fn packet_header_carries_segment_fields() {
        let mut header = sample_header();
        header.attr.set_packet(true);
        header.total_packets = 5;
        header.packet_seq = 3;

        let mut wire = Vec::new();
        header.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), MsgHeader::PACKET_LEN);

        let (parsed, body_pos) = MsgHeader::decode(&wire).unwrap();
        assert_eq!(body_pos, MsgHeader::PACKET_LEN);
        assert_eq!(parsed.total_packets, 5);
        assert_eq!(parsed.packet_seq, 3);
    }

    #[test]
    fn decode_rejects_short_region() {
        assert!(matches!(
            MsgHeader::decode(&[0u8; 4]),
            Err(ProtocolError::FrameTooShort { .. })
        ));
    }

    #[test]
    fn encode_rejects_oversized_phone() {
        let mut header = sample_header();
        header.phone = "1234567890123".to_owned();
        let mut wire = Vec::new();
        assert!(matches!(
            header.encode(&mut wire),
            Err(ProtocolError::InvalidBody { .. })
        ));
    }
}
