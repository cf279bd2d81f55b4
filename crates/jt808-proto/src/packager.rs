//! Message packager: a message-id-indexed table of body encoders plus the
//! frame orchestration that turns a [`SessionParams`] snapshot into wire
//! bytes.
//!
//! The default table covers every supported command. Vendor messages hook
//! in at startup through [`Packager::append`]; a stock encoder can be
//! swapped out with [`Packager::override_handler`].

use std::collections::BTreeMap;

use crate::{
    bcd,
    error::{ProtocolError, Result},
    frame,
    header::BodyAttr,
    location,
    messages::{msg_id, plate_color},
    session::SessionParams,
};

/// Body encoder: appends the body for one message id.
///
/// Encoders see the whole session snapshot; respond-type encoders read the
/// request header out of `params.parse`.
pub type EncodeHandler = Box<dyn Fn(&SessionParams, &mut Vec<u8>) -> Result<()> + Send + Sync>;

/// Message-id-indexed encoder table.
pub struct Packager {
    handlers: BTreeMap<u16, EncodeHandler>,
}

impl Default for Packager {
    fn default() -> Self {
        Self::new()
    }
}

impl Packager {
    /// Table with every stock encoder registered.
    #[must_use]
    pub fn new() -> Self {
        let mut packager = Self { handlers: BTreeMap::new() };
        packager.append(msg_id::TERMINAL_GENERAL_RESPOND, Box::new(encode_general_respond));
        packager.append(msg_id::PLATFORM_GENERAL_RESPOND, Box::new(encode_general_respond));
        packager.append(msg_id::TERMINAL_HEARTBEAT, Box::new(encode_empty));
        packager.append(msg_id::TERMINAL_LOGOUT, Box::new(encode_empty));
        packager.append(msg_id::FILL_PACKET_REQUEST, Box::new(encode_fill_packet_request));
        packager.append(msg_id::TERMINAL_REGISTER, Box::new(encode_register));
        packager.append(msg_id::REGISTER_RESPOND, Box::new(encode_register_respond));
        packager.append(msg_id::TERMINAL_AUTHENTICATION, Box::new(encode_authentication));
        packager.append(msg_id::SET_TERMINAL_PARAMS, Box::new(encode_set_params));
        packager.append(msg_id::GET_TERMINAL_PARAMS, Box::new(encode_empty));
        packager.append(msg_id::GET_SPECIFIC_TERMINAL_PARAMS, Box::new(encode_get_specific_params));
        packager.append(msg_id::GET_TERMINAL_PARAMS_RESPOND, Box::new(encode_get_params_respond));
        packager.append(msg_id::TERMINAL_UPGRADE, Box::new(encode_upgrade));
        packager.append(msg_id::UPGRADE_RESULT_REPORT, Box::new(encode_upgrade_result));
        packager.append(msg_id::LOCATION_REPORT, Box::new(encode_location_report));
        packager.append(msg_id::GET_LOCATION, Box::new(encode_empty));
        packager.append(msg_id::GET_LOCATION_RESPOND, Box::new(encode_location_respond));
        packager.append(msg_id::TRACKING_CONTROL, Box::new(encode_tracking_control));
        packager.append(msg_id::SET_POLYGON_AREA, Box::new(encode_set_polygon));
        packager.append(msg_id::DELETE_POLYGON_AREA, Box::new(encode_delete_polygon));
        packager.append(msg_id::MULTIMEDIA_UPLOAD, Box::new(encode_multimedia_upload));
        packager.append(msg_id::MULTIMEDIA_UPLOAD_RESPOND, Box::new(encode_multimedia_ack));
        packager
    }

    /// Register an encoder for a new message id.
    ///
    /// Returns `false` without replacing anything if the id already has an
    /// encoder.
    pub fn append(&mut self, msg_id: u16, handler: EncodeHandler) -> bool {
        if self.handlers.contains_key(&msg_id) {
            return false;
        }
        self.handlers.insert(msg_id, handler);
        true
    }

    /// Register an encoder, replacing any existing one for the id.
    pub fn override_handler(&mut self, msg_id: u16, handler: EncodeHandler) {
        self.handlers.insert(msg_id, handler);
    }

    /// Whether an encoder is registered for `msg_id`.
    #[must_use]
    pub fn supports(&self, msg_id: u16) -> bool {
        self.handlers.contains_key(&msg_id)
    }

    /// Encode the message selected by `params.msg_head.msg_id` into a
    /// complete wire frame.
    ///
    /// The body is produced first, the header's length field patched to the
    /// unescaped body byte count, then the checksum, escaping and
    /// delimiters applied.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnsupportedMessage` if no encoder is registered
    /// - `ProtocolError::BodyTooLong` if the body exceeds the 10-bit length
    /// - any error from the body encoder itself
    pub fn encode(&self, params: &SessionParams) -> Result<Vec<u8>> {
        let msg_id = params.msg_head.msg_id;
        let handler =
            self.handlers.get(&msg_id).ok_or(ProtocolError::UnsupportedMessage(msg_id))?;

        let mut body = Vec::new();
        handler(params, &mut body)?;
        if body.len() > usize::from(BodyAttr::MAX_BODY_LEN) {
            return Err(ProtocolError::BodyTooLong(body.len()));
        }

        let mut head = params.msg_head.clone();
        head.attr.set_body_len(body.len() as u16);

        let mut interior = Vec::with_capacity(head.wire_len() + body.len());
        head.encode(&mut interior)?;
        interior.extend_from_slice(&body);
        Ok(frame::seal(&interior))
    }
}

/// Write `bytes` into a fixed-width field, NUL-padding or truncating.
fn push_fixed(out: &mut Vec<u8>, bytes: &[u8], width: usize) {
    let take = bytes.len().min(width);
    out.extend_from_slice(&bytes[..take]);
    out.resize(out.len() + (width - take), 0);
}

fn encode_empty(_params: &SessionParams, _out: &mut Vec<u8>) -> Result<()> {
    Ok(())
}

/// `0x0001` / `0x8001`: respond-flow (2), respond-msg-id (2), result (1).
fn encode_general_respond(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&params.parse.msg_head.flow_num.to_be_bytes());
    out.extend_from_slice(&params.parse.msg_head.msg_id.to_be_bytes());
    out.push(params.respond_result);
    Ok(())
}

/// `0x8003`: first-packet flow (2), count (1), missing ids (2 × count).
fn encode_fill_packet_request(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    let fill = &params.fill_packet;
    if fill.packet_ids.len() > 255 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::FILL_PACKET_REQUEST,
            reason: "more than 255 missing packets",
        });
    }
    out.extend_from_slice(&fill.first_packet_flow_num.to_be_bytes());
    out.push(fill.packet_ids.len() as u8);
    for id in &fill.packet_ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    Ok(())
}

/// `0x0100`: province, city, manufacturer (5), model (20), terminal id (7),
/// plate color, plate number (plated vehicles only).
fn encode_register(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    let info = &params.register_info;
    out.extend_from_slice(&info.province_id.to_be_bytes());
    out.extend_from_slice(&info.city_id.to_be_bytes());
    push_fixed(out, &info.manufacturer_id, 5);
    push_fixed(out, &info.model, 20);
    push_fixed(out, &info.terminal_id, 7);
    out.push(info.plate_color);
    if info.plate_color != plate_color::NONE {
        out.extend_from_slice(info.plate_number.as_bytes());
    }
    Ok(())
}

/// `0x8100`: respond-flow (2), result (1), auth code when successful.
fn encode_register_respond(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&params.parse.msg_head.flow_num.to_be_bytes());
    out.push(params.respond_result);
    if params.respond_result == 0 {
        out.extend_from_slice(&params.auth_code);
    }
    Ok(())
}

/// `0x0102`: the auth code received during registration.
fn encode_authentication(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&params.parse.auth_code);
    Ok(())
}

/// Shared item-list writer for `0x8103` and `0x0104`.
fn push_param_items<'a, I>(out: &mut Vec<u8>, items: I) -> Result<()>
where
    I: Iterator<Item = (&'a u32, &'a Vec<u8>)>,
{
    for (id, value) in items {
        if value.len() > 255 {
            return Err(ProtocolError::InvalidBody {
                msg_id: msg_id::SET_TERMINAL_PARAMS,
                reason: "parameter value longer than 255 bytes",
            });
        }
        out.extend_from_slice(&id.to_be_bytes());
        out.push(value.len() as u8);
        out.extend_from_slice(value);
    }
    Ok(())
}

/// `0x8103`: count (1), then id (4) / len (1) / bytes per item.
fn encode_set_params(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    if params.terminal_params.len() > 255 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::SET_TERMINAL_PARAMS,
            reason: "more than 255 parameter items",
        });
    }
    out.push(params.terminal_params.len() as u8);
    push_param_items(out, params.terminal_params.iter())
}

/// `0x8106`: count (1), then the requested ids.
fn encode_get_specific_params(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    if params.terminal_param_ids.len() > 255 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::GET_SPECIFIC_TERMINAL_PARAMS,
            reason: "more than 255 parameter ids",
        });
    }
    out.push(params.terminal_param_ids.len() as u8);
    for id in &params.terminal_param_ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    Ok(())
}

/// `0x0104`: respond-flow (2), then the parameter items.
///
/// With an empty id filter the whole store is emitted. With a filter, only
/// the requested ids appear and the count byte is decremented for every id
/// missing from the store.
fn encode_get_params_respond(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&params.parse.msg_head.flow_num.to_be_bytes());
    if params.terminal_param_ids.is_empty() {
        if params.terminal_params.len() > 255 {
            return Err(ProtocolError::InvalidBody {
                msg_id: msg_id::GET_TERMINAL_PARAMS_RESPOND,
                reason: "more than 255 parameter items",
            });
        }
        out.push(params.terminal_params.len() as u8);
        push_param_items(out, params.terminal_params.iter())
    } else {
        let present = params
            .terminal_param_ids
            .iter()
            .filter_map(|id| params.terminal_params.get_key_value(id));
        let count = present.clone().count();
        if count > 255 {
            return Err(ProtocolError::InvalidBody {
                msg_id: msg_id::GET_TERMINAL_PARAMS_RESPOND,
                reason: "more than 255 parameter items",
            });
        }
        out.push(count as u8);
        push_param_items(out, present)
    }
}

/// `0x8108`: type (1), manufacturer (5), version-len (1), version,
/// data-len (4), data.
fn encode_upgrade(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    let upgrade = &params.upgrade;
    if upgrade.version.len() > 255 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::TERMINAL_UPGRADE,
            reason: "version string longer than 255 bytes",
        });
    }
    out.push(upgrade.kind);
    push_fixed(out, &upgrade.manufacturer_id, 5);
    out.push(upgrade.version.len() as u8);
    out.extend_from_slice(upgrade.version.as_bytes());
    out.extend_from_slice(&(upgrade.data.len() as u32).to_be_bytes());
    out.extend_from_slice(&upgrade.data);
    Ok(())
}

/// `0x0108`: type (1), result (1).
fn encode_upgrade_result(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    out.push(params.upgrade.kind);
    out.push(params.upgrade.result);
    Ok(())
}

/// `0x0200`: 28-byte basic info followed by the extension items.
fn encode_location_report(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    params.location.encode(out)?;
    location::encode_extensions(&params.location_extensions, out);
    Ok(())
}

/// `0x0201`: respond-flow (2), then a `0x0200` body.
fn encode_location_respond(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&params.parse.msg_head.flow_num.to_be_bytes());
    encode_location_report(params, out)
}

/// `0x8202`: interval (2), tracking duration (4).
fn encode_tracking_control(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    out.extend_from_slice(&params.tracking_control.interval.to_be_bytes());
    out.extend_from_slice(&params.tracking_control.duration.to_be_bytes());
    Ok(())
}

/// `0x8604`: area id, attribute, optional times and speed cap, vertex
/// count, then (lat, lon) pairs as degrees × 10⁶.
fn encode_set_polygon(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    let area = &params.polygon_area;
    out.extend_from_slice(&area.id.to_be_bytes());
    out.extend_from_slice(&area.attr.raw().to_be_bytes());
    if area.attr.by_time() {
        if area.start_time.len() != 12 || area.stop_time.len() != 12 {
            return Err(ProtocolError::InvalidBody {
                msg_id: msg_id::SET_POLYGON_AREA,
                reason: "area times must be twelve digits",
            });
        }
        out.extend_from_slice(&bcd::encode(&area.start_time)?);
        out.extend_from_slice(&bcd::encode(&area.stop_time)?);
    }
    if area.attr.speed_limit() {
        out.extend_from_slice(&area.max_speed.to_be_bytes());
        out.push(area.overspeed_time);
    }
    out.extend_from_slice(&(area.vertices.len() as u16).to_be_bytes());
    for vertex in &area.vertices {
        let (lat, lon) = vertex.to_wire();
        out.extend_from_slice(&lat.to_be_bytes());
        out.extend_from_slice(&lon.to_be_bytes());
    }
    Ok(())
}

/// `0x8605`: count (1), then the area ids. The empty list is rejected; a
/// wire count of zero is the terminal-side "delete all" form and is not
/// produced here.
fn encode_delete_polygon(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    let ids = &params.polygon_area_ids;
    if ids.is_empty() || ids.len() > 255 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::DELETE_POLYGON_AREA,
            reason: "area id list must hold 1 to 255 ids",
        });
    }
    out.push(ids.len() as u8);
    for id in ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    Ok(())
}

/// `0x0801`: media id (4), type, format, event, channel, 28-byte location
/// basic body, then the media bytes.
fn encode_multimedia_upload(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    let media = &params.multimedia;
    if media.location.len() != 28 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::MULTIMEDIA_UPLOAD,
            reason: "location snapshot must be 28 bytes",
        });
    }
    out.extend_from_slice(&media.media_id.to_be_bytes());
    out.push(media.media_type);
    out.push(media.format);
    out.push(media.event);
    out.push(media.channel_id);
    out.extend_from_slice(&media.location);
    out.extend_from_slice(&media.data);
    Ok(())
}

/// `0x8800`: media id (4), then the retransmit list when non-empty.
fn encode_multimedia_ack(params: &SessionParams, out: &mut Vec<u8>) -> Result<()> {
    let ack = &params.multimedia_ack;
    if ack.retransmit_ids.len() > 255 {
        return Err(ProtocolError::InvalidBody {
            msg_id: msg_id::MULTIMEDIA_UPLOAD_RESPOND,
            reason: "more than 255 retransmit ids",
        });
    }
    out.extend_from_slice(&ack.media_id.to_be_bytes());
    if !ack.retransmit_ids.is_empty() {
        out.push(ack.retransmit_ids.len() as u8);
        for id in &ack.retransmit_ids {
            out.extend_from_slice(&id.to_be_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DELIMITER;

    fn heartbeat_params() -> SessionParams {
        let mut params = SessionParams::with_phone("13523339527");
        params.msg_head.msg_id = msg_id::TERMINAL_HEARTBEAT;
        params
    }

    #[test]
    fn unsupported_message_is_rejected() {
        let mut params = heartbeat_params();
        params.msg_head.msg_id = 0x7F7F;
        let packager = Packager::new();
        assert!(matches!(
            packager.encode(&params),
            Err(ProtocolError::UnsupportedMessage(0x7F7F))
        ));
    }

    #[test]
    fn heartbeat_frame_has_empty_body() {
        let packager = Packager::new();
        let wire = packager.encode(&heartbeat_params()).unwrap();
        assert_eq!(wire[0], DELIMITER);
        assert_eq!(wire[wire.len() - 1], DELIMITER);

        let interior = frame::open(&wire).unwrap();
        assert_eq!(interior.len(), 12);
        let attr = BodyAttr::from_raw(u16::from_be_bytes([interior[2], interior[3]]));
        assert_eq!(attr.body_len(), 0);
    }

    #[test]
    fn length_field_tracks_body_size() {
        let mut params = heartbeat_params();
        params.msg_head.msg_id = msg_id::TERMINAL_AUTHENTICATION;
        params.parse.auth_code = b"7061".to_vec();

        let packager = Packager::new();
        let wire = packager.encode(&params).unwrap();
        let interior = frame::open(&wire).unwrap();
        let attr = BodyAttr::from_raw(u16::from_be_bytes([interior[2], interior[3]]));
        assert_eq!(attr.body_len(), 4);
        assert_eq!(&interior[12..], b"7061");
    }

    #[test]
    fn append_refuses_existing_id_and_override_replaces() {
        let mut packager = Packager::new();
        assert!(!packager.append(msg_id::TERMINAL_HEARTBEAT, Box::new(encode_empty)));
        assert!(packager.append(0x0F01, Box::new(|_, out| {
            out.push(0xAB);
            Ok(())
        })));
        assert!(packager.supports(0x0F01));

        packager.override_handler(
            msg_id::TERMINAL_HEARTBEAT,
            Box::new(|_, out| {
                out.push(0xCD);
                Ok(())
            }),
        );
        let wire = packager.encode(&heartbeat_params()).unwrap();
        let interior = frame::open(&wire).unwrap();
        assert_eq!(&interior[12..], &[0xCD]);
    }

    #[test]
    fn delete_polygon_refuses_empty_list() {
        let mut params = heartbeat_params();
        params.msg_head.msg_id = msg_id::DELETE_POLYGON_AREA;
        let packager = Packager::new();
        assert!(matches!(packager.encode(&params), Err(ProtocolError::InvalidBody { .. })));
    }

    #[test]
    fn get_params_respond_drops_missing_requested_ids() {
        let mut params = heartbeat_params();
        params.msg_head.msg_id = msg_id::GET_TERMINAL_PARAMS_RESPOND;
        params.terminal_params.insert(0x0001, vec![0, 0, 0, 60]);
        params.terminal_param_ids = vec![0x0001, 0x0099];

        let packager = Packager::new();
        let wire = packager.encode(&params).unwrap();
        let interior = frame::open(&wire).unwrap();
        let body = &interior[12..];
        // flow (2) + count (1) + one item: id (4) + len (1) + value (4)
        assert_eq!(body[2], 1);
        assert_eq!(body.len(), 2 + 1 + 4 + 1 + 4);
    }
}
