//! Message ids, result codes and the remaining body records: registration,
//! authentication, upgrade, fill-packet, tracking control and multimedia.

/// Message ids of the supported commands.
pub mod msg_id {
    /// Terminal general respond.
    pub const TERMINAL_GENERAL_RESPOND: u16 = 0x0001;
    /// Terminal heartbeat.
    pub const TERMINAL_HEARTBEAT: u16 = 0x0002;
    /// Terminal logout.
    pub const TERMINAL_LOGOUT: u16 = 0x0003;
    /// Terminal register.
    pub const TERMINAL_REGISTER: u16 = 0x0100;
    /// Terminal authentication.
    pub const TERMINAL_AUTHENTICATION: u16 = 0x0102;
    /// Respond to a terminal-parameter query.
    pub const GET_TERMINAL_PARAMS_RESPOND: u16 = 0x0104;
    /// Upgrade result report.
    pub const UPGRADE_RESULT_REPORT: u16 = 0x0108;
    /// Location report.
    pub const LOCATION_REPORT: u16 = 0x0200;
    /// Respond to a location query.
    pub const GET_LOCATION_RESPOND: u16 = 0x0201;
    /// Multimedia data upload.
    pub const MULTIMEDIA_UPLOAD: u16 = 0x0801;
    /// Platform general respond.
    pub const PLATFORM_GENERAL_RESPOND: u16 = 0x8001;
    /// Fill-packet (gap retransmission) request.
    pub const FILL_PACKET_REQUEST: u16 = 0x8003;
    /// Register respond.
    pub const REGISTER_RESPOND: u16 = 0x8100;
    /// Set terminal parameters.
    pub const SET_TERMINAL_PARAMS: u16 = 0x8103;
    /// Query all terminal parameters.
    pub const GET_TERMINAL_PARAMS: u16 = 0x8104;
    /// Query specific terminal parameters.
    pub const GET_SPECIFIC_TERMINAL_PARAMS: u16 = 0x8106;
    /// Terminal upgrade package download.
    pub const TERMINAL_UPGRADE: u16 = 0x8108;
    /// Location query.
    pub const GET_LOCATION: u16 = 0x8201;
    /// Temporary location tracking control.
    pub const TRACKING_CONTROL: u16 = 0x8202;
    /// Set a polygon area.
    pub const SET_POLYGON_AREA: u16 = 0x8604;
    /// Delete polygon areas.
    pub const DELETE_POLYGON_AREA: u16 = 0x8605;
    /// Multimedia upload respond.
    pub const MULTIMEDIA_UPLOAD_RESPOND: u16 = 0x8800;
}

/// Ids that are themselves acknowledgements and must never be
/// auto-acknowledged.
pub const RESPOND_ONLY_IDS: [u16; 5] = [
    msg_id::TERMINAL_GENERAL_RESPOND,
    msg_id::PLATFORM_GENERAL_RESPOND,
    msg_id::REGISTER_RESPOND,
    msg_id::GET_TERMINAL_PARAMS_RESPOND,
    msg_id::GET_LOCATION_RESPOND,
];

/// Whether `msg_id` is an acknowledgement message.
#[must_use]
pub fn is_respond_only(msg_id: u16) -> bool {
    RESPOND_ONLY_IDS.contains(&msg_id)
}

/// General respond result codes.
pub mod general_result {
    /// Success or confirmation.
    pub const SUCCESS: u8 = 0;
    /// Failure.
    pub const FAILURE: u8 = 1;
    /// Malformed message.
    pub const BAD_MESSAGE: u8 = 2;
    /// Unsupported operation.
    pub const UNSUPPORTED: u8 = 3;
    /// Alarm handling confirmation (platform respond only).
    pub const ALARM_ACK: u8 = 4;
}

/// Register respond result codes.
pub mod register_result {
    /// Registered successfully.
    pub const SUCCESS: u8 = 0;
    /// Vehicle already registered.
    pub const VEHICLE_REGISTERED: u8 = 1;
    /// Vehicle missing from the database.
    pub const VEHICLE_MISSING: u8 = 2;
    /// Terminal already registered.
    pub const TERMINAL_REGISTERED: u8 = 3;
    /// Terminal missing from the database.
    pub const TERMINAL_MISSING: u8 = 4;
}

/// Vehicle plate colors; `NONE` marks an unplated vehicle.
pub mod plate_color {
    /// Not plated yet.
    pub const NONE: u8 = 0;
    /// Blue plate.
    pub const BLUE: u8 = 1;
    /// Yellow plate.
    pub const YELLOW: u8 = 2;
    /// Black plate.
    pub const BLACK: u8 = 3;
    /// White plate.
    pub const WHITE: u8 = 4;
    /// Other color.
    pub const OTHER: u8 = 5;
}

/// Upgrade target kinds.
pub mod upgrade_type {
    /// The terminal itself.
    pub const TERMINAL: u8 = 0x00;
    /// Road transport certificate IC card reader.
    pub const IC_CARD_READER: u8 = 0x0C;
    /// GNSS positioning module.
    pub const GNSS: u8 = 0x34;
}

/// Upgrade result codes.
pub mod upgrade_result {
    /// Upgrade succeeded.
    pub const SUCCESS: u8 = 0;
    /// Upgrade failed.
    pub const FAILURE: u8 = 1;
    /// Upgrade cancelled.
    pub const CANCELLED: u8 = 2;
}

/// Registration record carried by `0x0100`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterInfo {
    /// Province id.
    pub province_id: u16,
    /// City or county id.
    pub city_id: u16,
    /// Manufacturer id, five bytes on the wire.
    pub manufacturer_id: Vec<u8>,
    /// Terminal model, twenty bytes on the wire, NUL-padded.
    pub model: Vec<u8>,
    /// Terminal id, seven bytes on the wire, NUL-padded.
    pub terminal_id: Vec<u8>,
    /// Plate color; `plate_color::NONE` for an unplated vehicle.
    pub plate_color: u8,
    /// Plate number; on the wire only when the vehicle is plated.
    pub plate_number: String,
}

/// Upgrade package descriptor carried by `0x8108` and `0x0108`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeInfo {
    /// Upgrade target kind.
    pub kind: u8,
    /// Upgrade result (used by `0x0108`).
    pub result: u8,
    /// Manufacturer id, five bytes on the wire.
    pub manufacturer_id: Vec<u8>,
    /// Firmware version string.
    pub version: String,
    /// Package bytes; one fragment of them when segmented.
    pub data: Vec<u8>,
}

/// Gap-retransmission request carried by `0x8003`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillPacket {
    /// Flow number of the first packet of the segmented message.
    pub first_packet_flow_num: u16,
    /// 1-based sequence numbers of the missing packets.
    pub packet_ids: Vec<u16>,
}

/// Temporary tracking control carried by `0x8202`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationTrackingControl {
    /// Report interval in seconds; zero stops tracking.
    pub interval: u16,
    /// Tracking validity in seconds.
    pub duration: u32,
}

/// Multimedia upload carried by `0x0801`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultimediaUpload {
    /// Multimedia id, non-zero.
    pub media_id: u32,
    /// 0 image, 1 audio, 2 video.
    pub media_type: u8,
    /// 0 JPEG, 1 TIF, 2 MP3, 3 WAV, 4 WMV.
    pub format: u8,
    /// Triggering event code.
    pub event: u8,
    /// Source channel id.
    pub channel_id: u8,
    /// The 28-byte location basic body captured with the media.
    pub location: Vec<u8>,
    /// Media payload; one fragment of it when segmented.
    pub data: Vec<u8>,
}

/// Multimedia upload acknowledgement carried by `0x8800`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultimediaUploadAck {
    /// Acknowledged multimedia id.
    pub media_id: u32,
    /// Packet sequence numbers the platform wants again.
    pub retransmit_ids: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respond_only_set_matches_the_standard() {
        assert!(is_respond_only(0x0001));
        assert!(is_respond_only(0x8001));
        assert!(is_respond_only(0x8100));
        assert!(is_respond_only(0x0104));
        assert!(is_respond_only(0x0201));
        assert!(!is_respond_only(0x0200));
        assert!(!is_respond_only(0x8103));
    }
}
