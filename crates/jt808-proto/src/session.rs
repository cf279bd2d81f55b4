//! Per-peer session parameter aggregate.
//!
//! One [`SessionParams`] value exists per connection. Encoders read it as
//! an immutable snapshot; decoders write exclusively into the nested
//! [`ParsedParams`] so values being prepared for transmission and values
//! produced by parsing never mix. The session layer copies between the two
//! sides deliberately (for example, lifting a received auth code into the
//! authentication request).

use crate::{
    area::PolygonArea,
    header::MsgHeader,
    location::{LocationBasic, LocationExtensions},
    messages::{
        FillPacket, LocationTrackingControl, MultimediaUpload, MultimediaUploadAck, RegisterInfo,
        UpgradeInfo,
    },
    params::TerminalParams,
};

/// Values produced by decoding inbound frames.
///
/// Written only by [`crate::Parser`] handlers and read by dispatch code.
#[derive(Debug, Clone, Default)]
pub struct ParsedParams {
    /// Result code of the last decoded respond message.
    pub respond_result: u8,
    /// Message id the last decoded respond acknowledges.
    pub respond_msg_id: u16,
    /// Flow number the last decoded respond acknowledges.
    pub respond_flow_num: u16,
    /// Header of the last decoded frame.
    pub msg_head: MsgHeader,
    /// Registration record from `0x0100`.
    pub register_info: RegisterInfo,
    /// Authentication code from `0x8100` or `0x0102`.
    pub auth_code: Vec<u8>,
    /// Parameter items from `0x8103` or `0x0104`.
    pub terminal_params: TerminalParams,
    /// Parameter ids from `0x8106`.
    pub terminal_param_ids: Vec<u32>,
    /// Location basic info from `0x0200` or `0x0201`.
    pub location: LocationBasic,
    /// Location extensions from `0x0200` or `0x0201`.
    pub location_extensions: LocationExtensions,
    /// Tracking control from `0x8202`.
    pub tracking_control: LocationTrackingControl,
    /// Polygon area from `0x8604`.
    pub polygon_area: PolygonArea,
    /// Area ids from `0x8605`; empty means delete all.
    pub polygon_area_ids: Vec<u32>,
    /// Upgrade descriptor from `0x8108` or `0x0108`.
    pub upgrade: UpgradeInfo,
    /// Fill-packet request from `0x8003`.
    pub fill_packet: FillPacket,
    /// Multimedia upload from `0x0801`.
    pub multimedia: MultimediaUpload,
    /// Multimedia acknowledgement from `0x8800`.
    pub multimedia_ack: MultimediaUploadAck,
}

/// Everything a connection's encoders and decoders touch.
///
/// The non-`parse` fields are the outbound staging area: dispatch fills
/// them, then hands the whole aggregate to [`crate::Packager::encode`] as a
/// snapshot. The `parse` field is the inbound side.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    /// Result code for the next respond message to encode.
    pub respond_result: u8,
    /// Header template for outbound frames; `msg_id` selects the encoder.
    pub msg_head: MsgHeader,
    /// Registration record for `0x0100`.
    pub register_info: RegisterInfo,
    /// Platform-issued authentication code (platform side staging).
    pub auth_code: Vec<u8>,
    /// Local terminal parameter store.
    pub terminal_params: TerminalParams,
    /// Parameter ids for `0x8106`, and the id filter for `0x0104`.
    pub terminal_param_ids: Vec<u32>,
    /// Location basic info for `0x0200`/`0x0201`.
    pub location: LocationBasic,
    /// Location extensions for `0x0200`/`0x0201`.
    pub location_extensions: LocationExtensions,
    /// Tracking control for `0x8202`.
    pub tracking_control: LocationTrackingControl,
    /// Polygon area for `0x8604`.
    pub polygon_area: PolygonArea,
    /// Area ids for `0x8605`.
    pub polygon_area_ids: Vec<u32>,
    /// Upgrade descriptor for `0x8108`/`0x0108`.
    pub upgrade: UpgradeInfo,
    /// Fill-packet request for `0x8003`.
    pub fill_packet: FillPacket,
    /// Multimedia upload for `0x0801`.
    pub multimedia: MultimediaUpload,
    /// Multimedia acknowledgement for `0x8800`.
    pub multimedia_ack: MultimediaUploadAck,
    /// Inbound (decoded) side.
    pub parse: ParsedParams,
}

impl SessionParams {
    /// Fresh aggregate with the given terminal phone number installed.
    #[must_use]
    pub fn with_phone(phone: &str) -> Self {
        let mut params = Self::default();
        params.msg_head.phone = phone.to_owned();
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_phone_seeds_the_header() {
        let params = SessionParams::with_phone("13523339527");
        assert_eq!(params.msg_head.phone, "13523339527");
        assert_eq!(params.msg_head.flow_num, 0);
        assert!(params.parse.auth_code.is_empty());
    }
}
