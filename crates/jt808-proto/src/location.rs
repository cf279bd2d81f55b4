//! Location report model: alarm and status bitfields, the fixed 28-byte
//! basic region, and the tag-length-value extension map.
//!
//! Latitude and longitude travel as unsigned degrees × 10⁶. Speed is in
//! units of 0.1 km/h. The timestamp is twelve decimal digits
//! (`YYMMDDhhmmss`) packed into six BCD bytes.

use std::collections::BTreeMap;

use crate::{
    bcd,
    error::{ProtocolError, Result},
};

/// Alarm flag word of a location report.
///
/// Accessors cover the bits the sessions act on; the raw word is always
/// available for pass-through of the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmFlags(u32);

impl AlarmFlags {
    const IN_OUT_AREA: u32 = 1 << 20;

    /// Wrap a raw alarm word.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw alarm word.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Emergency (SOS) alarm, bit 0.
    #[must_use]
    pub fn sos(self) -> bool {
        self.0 & 1 != 0
    }

    /// Over-speed alarm, bit 1.
    #[must_use]
    pub fn overspeed(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    /// Entered or left a monitored area or route, bit 20.
    #[must_use]
    pub fn in_out_area(self) -> bool {
        self.0 & Self::IN_OUT_AREA != 0
    }

    /// Set or clear the in/out-area bit.
    pub fn set_in_out_area(&mut self, on: bool) {
        if on {
            self.0 |= Self::IN_OUT_AREA;
        } else {
            self.0 &= !Self::IN_OUT_AREA;
        }
    }
}

/// Status flag word of a location report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags(u32);

impl StatusFlags {
    const ACC: u32 = 1;
    const POSITIONING: u32 = 1 << 1;

    /// Wrap a raw status word.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw status word.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Ignition (ACC) on, bit 0.
    #[must_use]
    pub fn acc(self) -> bool {
        self.0 & Self::ACC != 0
    }

    /// Set or clear the ACC bit.
    pub fn set_acc(&mut self, on: bool) {
        if on {
            self.0 |= Self::ACC;
        } else {
            self.0 &= !Self::ACC;
        }
    }

    /// Valid positioning fix, bit 1.
    #[must_use]
    pub fn positioning(self) -> bool {
        self.0 & Self::POSITIONING != 0
    }

    /// Set or clear the positioning bit.
    pub fn set_positioning(&mut self, on: bool) {
        if on {
            self.0 |= Self::POSITIONING;
        } else {
            self.0 &= !Self::POSITIONING;
        }
    }

    /// Southern-hemisphere latitude, bit 2.
    #[must_use]
    pub fn south_latitude(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    /// Western-hemisphere longitude, bit 3.
    #[must_use]
    pub fn west_longitude(self) -> bool {
        self.0 & (1 << 3) != 0
    }
}

/// Fixed 28-byte region at the start of every location report body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationBasic {
    /// Alarm flag word.
    pub alarm: AlarmFlags,
    /// Status flag word.
    pub status: StatusFlags,
    /// Latitude, degrees × 10⁶.
    pub latitude: u32,
    /// Longitude, degrees × 10⁶.
    pub longitude: u32,
    /// Altitude in meters.
    pub altitude: u16,
    /// Speed in 0.1 km/h.
    pub speed: u16,
    /// Bearing, 0–359 degrees clockwise from north.
    pub bearing: u16,
    /// Timestamp, twelve digits `YYMMDDhhmmss`.
    pub time: String,
}

impl LocationBasic {
    /// Serialized length of the basic region.
    pub const WIRE_LEN: usize = 28;

    /// Append the 28-byte serialized form to `out`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidBody` if the timestamp is not twelve digits
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.time.len() != 12 {
            return Err(ProtocolError::InvalidBody {
                msg_id: 0x0200,
                reason: "timestamp must be twelve digits",
            });
        }

        out.extend_from_slice(&self.alarm.raw().to_be_bytes());
        out.extend_from_slice(&self.status.raw().to_be_bytes());
        out.extend_from_slice(&self.latitude.to_be_bytes());
        out.extend_from_slice(&self.longitude.to_be_bytes());
        out.extend_from_slice(&self.altitude.to_be_bytes());
        out.extend_from_slice(&self.speed.to_be_bytes());
        out.extend_from_slice(&self.bearing.to_be_bytes());
        out.extend_from_slice(&bcd::encode(&self.time)?);
        Ok(())
    }

    /// Parse the 28-byte basic region.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if fewer than 28 bytes remain
    /// - `ProtocolError::InvalidBcd` on a malformed timestamp
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < Self::WIRE_LEN {
            return Err(ProtocolError::FrameTooShort {
                expected: Self::WIRE_LEN,
                actual: body.len(),
            });
        }

        Ok(Self {
            alarm: AlarmFlags::from_raw(u32::from_be_bytes([body[0], body[1], body[2], body[3]])),
            status: StatusFlags::from_raw(u32::from_be_bytes([body[4], body[5], body[6], body[7]])),
            latitude: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
            longitude: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
            altitude: u16::from_be_bytes([body[16], body[17]]),
            speed: u16::from_be_bytes([body[18], body[19]]),
            bearing: u16::from_be_bytes([body[20], body[21]]),
            time: bcd::decode_padded(&body[22..28])?,
        })
    }
}

/// Ordered extension map: single-byte id → raw value bytes.
///
/// `BTreeMap` iteration supplies the mandated wire order — standard ids in
/// ascending numeric order, then the `0xE0` custom-section marker, then
/// vendor ids.
pub type LocationExtensions = BTreeMap<u8, Vec<u8>>;

/// Standard location-extension ids.
pub mod ext_id {
    /// Mileage, 0.1 km, DWORD.
    pub const MILEAGE: u8 = 0x01;
    /// Fuel level, 0.1 L, WORD.
    pub const FUEL: u8 = 0x02;
    /// Tachograph speed, 0.1 km/h, WORD.
    pub const TACHOGRAPH_SPEED: u8 = 0x03;
    /// Id of an alarm event needing manual confirmation, WORD.
    pub const ALARM_EVENT: u8 = 0x04;
    /// Over-speed alarm detail, BYTE or BYTE+DWORD.
    pub const OVERSPEED_ALARM: u8 = 0x11;
    /// In/out area or route alarm detail, BYTE+DWORD+BYTE.
    pub const ACCESS_AREA_ALARM: u8 = 0x12;
    /// Route drive-time alarm detail, DWORD+WORD+BYTE.
    pub const DRIVE_TIME_ALARM: u8 = 0x13;
    /// Extended vehicle signal word, DWORD.
    pub const VEHICLE_SIGNAL: u8 = 0x25;
    /// IO status word, WORD.
    pub const IO_STATUS: u8 = 0x2A;
    /// Analog quantity, DWORD.
    pub const ANALOG: u8 = 0x2B;
    /// Wireless signal strength, BYTE.
    pub const NETWORK_SIGNAL: u8 = 0x30;
    /// GNSS satellite count, BYTE.
    pub const SATELLITES: u8 = 0x31;
    /// Length marker preceding the vendor-extension section, BYTE.
    pub const CUSTOM_LENGTH: u8 = 0xE0;
    /// Positioning fix state, BYTE (vendor range).
    pub const POSITIONING_FIX: u8 = 0xEE;
}

/// Area geometry kinds used by the alarm detail bodies.
pub mod area_kind {
    /// Circular area.
    pub const CIRCLE: u8 = 0;
    /// Rectangular area.
    pub const RECTANGLE: u8 = 1;
    /// Polygon area.
    pub const POLYGON: u8 = 2;
    /// Route.
    pub const ROUTE: u8 = 3;
}

/// Direction values of the access-area alarm detail.
pub mod area_direction {
    /// Entered the area.
    pub const ENTER: u8 = 0;
    /// Left the area.
    pub const LEAVE: u8 = 1;
}

/// Append the extension map in wire order.
///
/// Standard ids are written as plain tag-length-value. Vendor ids (above
/// `0xE0`) are gathered into the custom section, announced by the `0xE0`
/// marker whose payload is the section length — one byte below 256, two
/// bytes from 256 up. With no vendor ids the marker is omitted entirely.
pub fn encode_extensions(extensions: &LocationExtensions, out: &mut Vec<u8>) {
    let mut custom = Vec::new();
    for (&id, value) in extensions {
        if id < ext_id::CUSTOM_LENGTH {
            out.push(id);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        } else if id > ext_id::CUSTOM_LENGTH {
            custom.push(id);
            custom.push(value.len() as u8);
            custom.extend_from_slice(value);
        }
        // The 0xE0 entry itself is a placeholder; its length is computed.
    }

    let len = custom.len();
    if len >= 256 {
        out.push(ext_id::CUSTOM_LENGTH);
        out.push(2);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else if len > 0 {
        out.push(ext_id::CUSTOM_LENGTH);
        out.push(1);
        out.push(len as u8);
    }
    out.extend_from_slice(&custom);
}

/// Walk a tag-length-value region into an extension map.
///
/// The `0xE0` marker parses as an ordinary entry whose value holds the
/// announced section length. A single trailing byte (too short to start
/// another entry) is ignored, matching permissive field receivers.
///
/// # Errors
///
/// - `ProtocolError::InvalidBody` if an entry's declared length runs past
///   the end of the region
pub fn decode_extensions(body: &[u8]) -> Result<LocationExtensions> {
    let mut extensions = LocationExtensions::new();
    let mut pos = 0;
    while pos + 2 <= body.len() {
        let id = body[pos];
        let len = body[pos + 1] as usize;
        let end = pos + 2 + len;
        if end > body.len() {
            return Err(ProtocolError::InvalidBody {
                msg_id: 0x0200,
                reason: "extension length exceeds body",
            });
        }
        extensions.insert(id, body[pos + 2..end].to_vec());
        pos = end;
    }
    Ok(extensions)
}

/// Build the access-area alarm detail body (extension `0x12`).
#[must_use]
pub fn encode_access_area_alarm(kind: u8, area_id: u32, direction: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(6);
    body.push(kind);
    body.extend_from_slice(&area_id.to_be_bytes());
    body.push(direction);
    body
}

/// Parse the access-area alarm detail body into (kind, area id, direction).
///
/// # Errors
///
/// - `ProtocolError::FrameTooShort` if the body is not six bytes
pub fn parse_access_area_alarm(body: &[u8]) -> Result<(u8, u32, u8)> {
    if body.len() < 6 {
        return Err(ProtocolError::FrameTooShort { expected: 6, actual: body.len() });
    }
    let area_id = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
    Ok((body[0], area_id, body[5]))
}

/// Build the over-speed alarm detail body (extension `0x11`).
///
/// With no area id the body is the bare location kind byte.
#[must_use]
pub fn encode_overspeed_alarm(kind: u8, area_id: Option<u32>) -> Vec<u8> {
    let mut body = Vec::with_capacity(5);
    body.push(kind);
    if let Some(id) = area_id {
        body.extend_from_slice(&id.to_be_bytes());
    }
    body
}

/// Parse the over-speed alarm detail body into (kind, optional area id).
///
/// # Errors
///
/// - `ProtocolError::FrameTooShort` on an empty body
pub fn parse_overspeed_alarm(body: &[u8]) -> Result<(u8, Option<u32>)> {
    match body {
        [] => Err(ProtocolError::FrameTooShort { expected: 1, actual: 0 }),
        [kind] => Ok((*kind, None)),
        [kind, rest @ ..] if rest.len() >= 4 => {
            Ok((*kind, Some(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]))))
        },
        _ => Err(ProtocolError::FrameTooShort { expected: 5, actual: body.len() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_basic() -> LocationBasic {
        let mut status = StatusFlags::default();
        status.set_positioning(true);
        LocationBasic {
            alarm: AlarmFlags::default(),
            status,
            latitude: 22_570_336,
            longitude: 113_937_577,
            altitude: 54,
            speed: 8,
            bearing: 0,
            time: "200702145429".to_owned(),
        }
    }

    #[test]
    fn basic_round_trip_is_28_bytes() {
        let basic = sample_basic();
        let mut wire = Vec::new();
        basic.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), LocationBasic::WIRE_LEN);

        let parsed = LocationBasic::decode(&wire).unwrap();
        assert_eq!(parsed, basic);
        assert!(parsed.status.positioning());
    }

    #[test]
    fn timestamp_bytes_are_bcd() {
        let basic = sample_basic();
        let mut wire = Vec::new();
        basic.encode(&mut wire).unwrap();
        assert_eq!(&wire[22..28], &[0x20, 0x07, 0x02, 0x14, 0x54, 0x29]);
    }

    #[test]
    fn encode_rejects_short_timestamp() {
        let mut basic = sample_basic();
        basic.time = "2007021454".to_owned();
        let mut wire = Vec::new();
        assert!(matches!(basic.encode(&mut wire), Err(ProtocolError::InvalidBody { .. })));
    }

    #[test]
    fn alarm_bit_accessors() {
        let mut alarm = AlarmFlags::from_raw(0);
        alarm.set_in_out_area(true);
        assert!(alarm.in_out_area());
        assert_eq!(alarm.raw(), 1 << 20);
        alarm.set_in_out_area(false);
        assert_eq!(alarm.raw(), 0);
    }

    #[test]
    fn standard_extension_grows_body_by_two_plus_len() {
        let mut extensions = LocationExtensions::new();
        extensions.insert(ext_id::SATELLITES, vec![0x0B]);

        let mut wire = Vec::new();
        encode_extensions(&extensions, &mut wire);
        assert_eq!(wire, [0x31, 0x01, 0x0B]);
    }

    #[test]
    fn vendor_extensions_follow_the_length_marker() {
        let mut extensions = LocationExtensions::new();
        extensions.insert(ext_id::SATELLITES, vec![0x0B]);
        extensions.insert(ext_id::CUSTOM_LENGTH, vec![]);
        extensions.insert(ext_id::POSITIONING_FIX, vec![0x02]);

        let mut wire = Vec::new();
        encode_extensions(&extensions, &mut wire);
        // 31 01 0B | E0 01 03 | EE 01 02
        assert_eq!(wire, [0x31, 0x01, 0x0B, 0xE0, 0x01, 0x03, 0xEE, 0x01, 0x02]);

        let parsed = decode_extensions(&wire).unwrap();
        assert_eq!(parsed[&ext_id::SATELLITES], vec![0x0B]);
        assert_eq!(parsed[&ext_id::POSITIONING_FIX], vec![0x02]);
        assert_eq!(parsed[&ext_id::CUSTOM_LENGTH], vec![0x03]);
    }

    #[test]
    fn marker_omitted_without_vendor_ids() {
        let mut extensions = LocationExtensions::new();
        extensions.insert(ext_id::CUSTOM_LENGTH, vec![]);
        extensions.insert(ext_id::MILEAGE, vec![0, 0, 0x30, 0x39]);

        let mut wire = Vec::new();
        encode_extensions(&extensions, &mut wire);
        assert_eq!(wire, [0x01, 0x04, 0x00, 0x00, 0x30, 0x39]);
    }

    #[test]
    fn large_vendor_section_takes_two_length_bytes() {
        let mut extensions = LocationExtensions::new();
        extensions.insert(0xF1, vec![0xAB; 200]);
        extensions.insert(0xF2, vec![0xCD; 200]);

        let mut wire = Vec::new();
        encode_extensions(&extensions, &mut wire);
        let section_len = 2 + 200 + 2 + 200;
        assert_eq!(wire[0], 0xE0);
        assert_eq!(wire[1], 2);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]) as usize, section_len);
    }

    #[test]
    fn decode_rejects_overflowing_entry() {
        assert!(matches!(
            decode_extensions(&[0x31, 0x05, 0x01]),
            Err(ProtocolError::InvalidBody { .. })
        ));
    }

    #[test]
    fn access_area_alarm_round_trip() {
        let body = encode_access_area_alarm(area_kind::POLYGON, 0x1234_5678, area_direction::LEAVE);
        assert_eq!(body.len(), 6);
        let (kind, id, direction) = parse_access_area_alarm(&body).unwrap();
        assert_eq!(kind, area_kind::POLYGON);
        assert_eq!(id, 0x1234_5678);
        assert_eq!(direction, area_direction::LEAVE);
    }

    #[test]
    fn overspeed_alarm_bare_kind() {
        let body = encode_overspeed_alarm(area_kind::CIRCLE, None);
        assert_eq!(parse_overspeed_alarm(&body).unwrap(), (area_kind::CIRCLE, None));

        let body = encode_overspeed_alarm(area_kind::POLYGON, Some(7));
        assert_eq!(parse_overspeed_alarm(&body).unwrap(), (area_kind::POLYGON, Some(7)));
    }
}
