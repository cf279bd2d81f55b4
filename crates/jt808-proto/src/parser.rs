//! Message parser: the decoder table mirroring [`crate::Packager`], plus
//! the frame orchestration — unescape, checksum, header, body dispatch.
//!
//! Decoders write exclusively into the `parse` sub-aggregate of the
//! session parameters. Each decoder reads exactly the fields its encoder
//! wrote; anything short or inconsistent is a [`ProtocolError`] and the
//! frame is dropped by the session layer.

use std::collections::BTreeMap;

use crate::{
    bcd,
    error::{ProtocolError, Result},
    frame,
    header::MsgHeader,
    location::{self, LocationBasic},
    messages::msg_id,
    params::TerminalParams,
    session::SessionParams,
};

/// Body decoder: consumes the unescaped body slice for one message id.
pub type DecodeHandler = Box<dyn Fn(&[u8], &mut SessionParams) -> Result<()> + Send + Sync>;

/// Message-id-indexed decoder table.
pub struct Parser {
    handlers: BTreeMap<u16, DecodeHandler>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Table with every stock decoder registered.
    #[must_use]
    pub fn new() -> Self {
        let mut parser = Self { handlers: BTreeMap::new() };
        parser.append(msg_id::TERMINAL_GENERAL_RESPOND, Box::new(decode_general_respond));
        parser.append(msg_id::PLATFORM_GENERAL_RESPOND, Box::new(decode_general_respond));
        parser.append(msg_id::TERMINAL_HEARTBEAT, Box::new(decode_empty));
        parser.append(msg_id::TERMINAL_LOGOUT, Box::new(decode_empty));
        parser.append(msg_id::FILL_PACKET_REQUEST, Box::new(decode_fill_packet_request));
        parser.append(msg_id::TERMINAL_REGISTER, Box::new(decode_register));
        parser.append(msg_id::REGISTER_RESPOND, Box::new(decode_register_respond));
        parser.append(msg_id::TERMINAL_AUTHENTICATION, Box::new(decode_authentication));
        parser.append(msg_id::SET_TERMINAL_PARAMS, Box::new(decode_set_params));
        parser.append(msg_id::GET_TERMINAL_PARAMS, Box::new(decode_get_params));
        parser.append(msg_id::GET_SPECIFIC_TERMINAL_PARAMS, Box::new(decode_get_specific_params));
        parser.append(msg_id::GET_TERMINAL_PARAMS_RESPOND, Box::new(decode_get_params_respond));
        parser.append(msg_id::TERMINAL_UPGRADE, Box::new(decode_upgrade));
        parser.append(msg_id::UPGRADE_RESULT_REPORT, Box::new(decode_upgrade_result));
        parser.append(msg_id::LOCATION_REPORT, Box::new(decode_location_report));
        parser.append(msg_id::GET_LOCATION, Box::new(decode_empty));
        parser.append(msg_id::GET_LOCATION_RESPOND, Box::new(decode_location_respond));
        parser.append(msg_id::TRACKING_CONTROL, Box::new(decode_tracking_control));
        parser.append(msg_id::SET_POLYGON_AREA, Box::new(decode_set_polygon));
        parser.append(msg_id::DELETE_POLYGON_AREA, Box::new(decode_delete_polygon));
        parser.append(msg_id::MULTIMEDIA_UPLOAD, Box::new(decode_multimedia_upload));
        parser.append(msg_id::MULTIMEDIA_UPLOAD_RESPOND, Box::new(decode_multimedia_ack));
        parser
    }

    /// Register a decoder for a new message id.
    ///
    /// Returns `false` without replacing anything if the id already has a
    /// decoder.
    pub fn append(&mut self, msg_id: u16, handler: DecodeHandler) -> bool {
        if self.handlers.contains_key(&msg_id) {
            return false;
        }
        self.handlers.insert(msg_id, handler);
        true
    }

    /// Register a decoder, replacing any existing one for the id.
    pub fn override_handler(&mut self, msg_id: u16, handler: DecodeHandler) {
        self.handlers.insert(msg_id, handler);
    }

    /// Whether a decoder is registered for `msg_id`.
    #[must_use]
    pub fn supports(&self, msg_id: u16) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    /// Decode one complete wire frame into `params.parse`.
    ///
    /// Returns the message id so the caller can dispatch on it. The peer's
    /// phone number is mirrored into the outbound header so responds carry
    /// it back.
    ///
    /// # Errors
    ///
    /// - frame-level: delimiters, escaping, checksum, header truncation
    /// - `ProtocolError::LengthMismatch` if the declared body length does
    ///   not match the received byte count
    /// - `ProtocolError::UnsupportedMessage` if no decoder is registered
    /// - body-level errors from the decoder itself
    pub fn decode(&self, wire: &[u8], params: &mut SessionParams) -> Result<u16> {
        let interior = frame::open(wire)?;
        let (head, body_pos) = MsgHeader::decode(&interior)?;
        let body = &interior[body_pos..];

        if usize::from(head.attr.body_len()) != body.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: head.attr.body_len(),
                actual: body.len(),
            });
        }

        let handler =
            self.handlers.get(&head.msg_id).ok_or(ProtocolError::UnsupportedMessage(head.msg_id))?;

        params.parse.msg_head = head.clone();
        params.msg_head.phone = head.phone;
        handler(body, params)?;
        Ok(params.parse.msg_head.msg_id)
    }
}

fn require(body: &[u8], needed: usize) -> Result<()> {
    if body.len() < needed {
        return Err(ProtocolError::FrameTooShort { expected: needed, actual: body.len() });
    }
    Ok(())
}

fn u16_at(body: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([body[pos], body[pos + 1]])
}

fn u32_at(body: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]])
}

fn decode_empty(_body: &[u8], _params: &mut SessionParams) -> Result<()> {
    Ok(())
}

fn decode_general_respond(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 5)?;
    params.parse.respond_flow_num = u16_at(body, 0);
    params.parse.respond_msg_id = u16_at(body, 2);
    params.parse.respond_result = body[4];
    Ok(())
}

fn decode_fill_packet_request(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 3)?;
    let count = usize::from(body[2]);
    if body.len() != 3 + count * 2 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::FILL_PACKET_REQUEST,
            reason: "id list disagrees with count",
        });
    }
    let fill = &mut params.parse.fill_packet;
    fill.first_packet_flow_num = u16_at(body, 0);
    fill.packet_ids = (0..count).map(|i| u16_at(body, 3 + i * 2)).collect();
    Ok(())
}

/// Fixed-width field, trailing NULs trimmed.
fn trim_fixed(field: &[u8]) -> Vec<u8> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    field[..end].to_vec()
}

fn decode_register(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 37)?;
    let info = &mut params.parse.register_info;
    info.province_id = u16_at(body, 0);
    info.city_id = u16_at(body, 2);
    info.manufacturer_id = body[4..9].to_vec();
    info.model = trim_fixed(&body[9..29]);
    info.terminal_id = trim_fixed(&body[29..36]);
    info.plate_color = body[36];
    info.plate_number = if info.plate_color == 0 {
        String::new()
    } else {
        String::from_utf8_lossy(&body[37..]).into_owned()
    };
    Ok(())
}

fn decode_register_respond(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 3)?;
    params.parse.respond_flow_num = u16_at(body, 0);
    params.parse.respond_result = body[2];
    // Some platforms answer "already registered" and still attach the auth
    // code, so extract whatever follows the result byte.
    params.parse.auth_code = body[3..].to_vec();
    Ok(())
}

fn decode_authentication(body: &[u8], params: &mut SessionParams) -> Result<()> {
    params.parse.auth_code = body.to_vec();
    Ok(())
}

/// Shared item-list walk for `0x8103` and `0x0104`.
fn parse_param_items(body: &[u8], count: usize, into: &mut TerminalParams) -> Result<()> {
    into.clear();
    let mut pos = 0;
    for _ in 0..count {
        require(&body[pos..], 5)?;
        let id = u32_at(body, pos);
        let len = usize::from(body[pos + 4]);
        require(&body[pos + 5..], len)?;
        into.insert(id, body[pos + 5..pos + 5 + len].to_vec());
        pos += 5 + len;
    }
    if pos != body.len() {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::SET_TERMINAL_PARAMS,
            reason: "trailing bytes after parameter items",
        });
    }
    Ok(())
}

fn decode_set_params(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 1)?;
    parse_param_items(&body[1..], usize::from(body[0]), &mut params.parse.terminal_params)
}

fn decode_get_params(_body: &[u8], params: &mut SessionParams) -> Result<()> {
    params.parse.terminal_param_ids.clear();
    Ok(())
}

fn decode_get_specific_params(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 1)?;
    let count = usize::from(body[0]);
    if body.len() != 1 + count * 4 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::GET_SPECIFIC_TERMINAL_PARAMS,
            reason: "id list disagrees with count",
        });
    }
    params.parse.terminal_param_ids = (0..count).map(|i| u32_at(body, 1 + i * 4)).collect();
    Ok(())
}

fn decode_get_params_respond(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 3)?;
    params.parse.respond_flow_num = u16_at(body, 0);
    parse_param_items(&body[3..], usize::from(body[2]), &mut params.parse.terminal_params)
}

fn decode_upgrade(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 11)?;
    let upgrade = &mut params.parse.upgrade;
    upgrade.kind = body[0];
    upgrade.manufacturer_id = body[1..6].to_vec();

    let version_len = usize::from(body[6]);
    require(body, 11 + version_len)?;
    upgrade.version = String::from_utf8_lossy(&body[7..7 + version_len]).into_owned();

    let data_len = u32_at(body, 7 + version_len) as usize;
    if body.len() != 11 + version_len + data_len {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::TERMINAL_UPGRADE,
            reason: "data length disagrees with body",
        });
    }
    upgrade.data = body[11 + version_len..].to_vec();
    Ok(())
}

fn decode_upgrade_result(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 2)?;
    params.parse.upgrade.kind = body[0];
    params.parse.upgrade.result = body[1];
    Ok(())
}

fn decode_location_report(body: &[u8], params: &mut SessionParams) -> Result<()> {
    params.parse.location = LocationBasic::decode(body)?;
    params.parse.location_extensions = location::decode_extensions(&body[LocationBasic::WIRE_LEN..])?;
    Ok(())
}

fn decode_location_respond(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 2 + LocationBasic::WIRE_LEN)?;
    params.parse.respond_flow_num = u16_at(body, 0);
    params.parse.location = LocationBasic::decode(&body[2..])?;
    params.parse.location_extensions =
        location::decode_extensions(&body[2 + LocationBasic::WIRE_LEN..])?;
    Ok(())
}

fn decode_tracking_control(body: &[u8], params: &mut SessionParams) -> Result<()> {
    if body.len() != 6 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::TRACKING_CONTROL,
            reason: "body must be six bytes",
        });
    }
    params.parse.tracking_control.interval = u16_at(body, 0);
    params.parse.tracking_control.duration = u32_at(body, 2);
    Ok(())
}

fn decode_set_polygon(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 8)?;
    let area = &mut params.parse.polygon_area;
    area.id = u32_at(body, 0);
    area.attr = crate::area::AreaAttr::from_raw(u16_at(body, 4));
    let mut pos = 6;

    if area.attr.by_time() {
        require(body, pos + 12)?;
        area.start_time = bcd::decode_padded(&body[pos..pos + 6])?;
        area.stop_time = bcd::decode_padded(&body[pos + 6..pos + 12])?;
        pos += 12;
    } else {
        area.start_time.clear();
        area.stop_time.clear();
    }

    if area.attr.speed_limit() {
        require(body, pos + 3)?;
        area.max_speed = u16_at(body, pos);
        area.overspeed_time = body[pos + 2];
        pos += 3;
    } else {
        area.max_speed = 0;
        area.overspeed_time = 0;
    }

    require(body, pos + 2)?;
    let count = usize::from(u16_at(body, pos));
    pos += 2;
    if body.len() != pos + count * 8 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::SET_POLYGON_AREA,
            reason: "vertex list disagrees with count",
        });
    }
    area.vertices = (0..count)
        .map(|i| {
            let at = pos + i * 8;
            crate::area::LatLon::from_wire(u32_at(body, at), u32_at(body, at + 4))
        })
        .collect();
    Ok(())
}

fn decode_delete_polygon(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 1)?;
    let count = usize::from(body[0]);
    if body.len() != 1 + count * 4 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::DELETE_POLYGON_AREA,
            reason: "id list disagrees with count",
        });
    }
    params.parse.polygon_area_ids = (0..count).map(|i| u32_at(body, 1 + i * 4)).collect();
    Ok(())
}

fn decode_multimedia_upload(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 36)?;
    let media = &mut params.parse.multimedia;
    media.media_id = u32_at(body, 0);
    media.media_type = body[4];
    media.format = body[5];
    media.event = body[6];
    media.channel_id = body[7];
    media.location = body[8..36].to_vec();
    media.data = body[36..].to_vec();
    Ok(())
}

fn decode_multimedia_ack(body: &[u8], params: &mut SessionParams) -> Result<()> {
    require(body, 4)?;
    let ack = &mut params.parse.multimedia_ack;
    ack.media_id = u32_at(body, 0);
    ack.retransmit_ids.clear();
    if body.len() > 4 {
        let count = usize::from(body[4]);
        if body.len() != 5 + count * 2 {
            return Err(ProtocolError::InvalidBody {
                msg_id: msg_id::MULTIMEDIA_UPLOAD_RESPOND,
                reason: "retransmit list disagrees with count",
            });
        }
        ack.retransmit_ids = (0..count).map(|i| u16_at(body, 5 + i * 2)).collect();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference vector: a platform general respond acknowledging an
    /// authentication, captured from a live exchange.
    const GENERAL_RESPOND_FRAME: [u8; 20] = [
        0x7E, 0x80, 0x01, 0x00, 0x05, 0x01, 0x38, 0x26, 0x53, 0x98, 0x49, 0x00, 0x02, 0x00, 0x02,
        0x01, 0x02, 0x00, 0x1A, 0x7E,
    ];

    #[test]
    fn reference_general_respond_parses() {
        let parser = Parser::new();
        let mut params = SessionParams::default();
        let msg = parser.decode(&GENERAL_RESPOND_FRAME, &mut params).unwrap();

        assert_eq!(msg, msg_id::PLATFORM_GENERAL_RESPOND);
        assert_eq!(params.parse.msg_head.flow_num, 0x0002);
        assert_eq!(params.parse.msg_head.phone, "13826539849");
        assert_eq!(params.parse.respond_flow_num, 0x0002);
        assert_eq!(params.parse.respond_msg_id, 0x0102);
        assert_eq!(params.parse.respond_result, 0);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut wire = GENERAL_RESPOND_FRAME;
        wire[17] ^= 0x01; // flip the result byte, checksum now stale
        let parser = Parser::new();
        let mut params = SessionParams::default();
        assert!(matches!(
            parser.decode(&wire, &mut params),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn declared_length_must_match_body() {
        // Rebuild the reference frame with a wrong length field.
        let mut interior = frame::open(&GENERAL_RESPOND_FRAME).unwrap();
        interior[3] = 0x04; // declare 4 body bytes, frame carries 5
        let wire = frame::seal(&interior);

        let parser = Parser::new();
        let mut params = SessionParams::default();
        assert!(matches!(
            parser.decode(&wire, &mut params),
            Err(ProtocolError::LengthMismatch { declared: 4, actual: 5 })
        ));
    }

    #[test]
    fn unknown_message_id_is_unsupported() {
        let mut interior = frame::open(&GENERAL_RESPOND_FRAME).unwrap();
        interior[0] = 0x7F;
        interior[1] = 0x7F;
        let wire = frame::seal(&interior);

        let parser = Parser::new();
        let mut params = SessionParams::default();
        assert!(matches!(
            parser.decode(&wire, &mut params),
            Err(ProtocolError::UnsupportedMessage(0x7F7F))
        ));
    }

    #[test]
    fn peer_phone_is_mirrored_for_responds() {
        let parser = Parser::new();
        let mut params = SessionParams::default();
        parser.decode(&GENERAL_RESPOND_FRAME, &mut params).unwrap();
        assert_eq!(params.msg_head.phone, "13826539849");
    }

    #[test]
    fn append_and_override_mirror_the_packager() {
        let mut parser = Parser::new();
        assert!(!parser.append(msg_id::TERMINAL_HEARTBEAT, Box::new(decode_empty)));
        assert!(parser.append(0x0F01, Box::new(decode_empty)));
        assert!(parser.supports(0x0F01));
        parser.override_handler(msg_id::TERMINAL_HEARTBEAT, Box::new(decode_empty));
    }
}
