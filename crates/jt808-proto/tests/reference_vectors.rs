//! Byte-exact codec scenarios against reference captures and the protocol
//! boundary cases: the bare 28-byte location body, the escape corner case
//! and segmented upgrade reassembly.

use jt808_proto::{
    AlarmFlags, LocationBasic, Packager, Parser, SessionParams, StatusFlags, frame,
    location::ext_id, msg_id,
};

fn location_params() -> SessionParams {
    let mut status = StatusFlags::default();
    status.set_positioning(true);
    status.set_acc(true);

    let mut params = SessionParams::with_phone("13523339527");
    params.msg_head.msg_id = msg_id::LOCATION_REPORT;
    params.msg_head.flow_num = 0x0001;
    params.location = LocationBasic {
        alarm: AlarmFlags::default(),
        status,
        latitude: 22_570_336,
        longitude: 113_937_577,
        altitude: 54,
        speed: 8,
        bearing: 0,
        time: "200702145429".to_owned(),
    };
    params
}

#[test]
fn location_report_reference_fields_survive() {
    let mut params = location_params();
    params.location_extensions.insert(ext_id::SATELLITES, vec![0x0B]);
    params.location_extensions.insert(ext_id::CUSTOM_LENGTH, vec![]);
    params.location_extensions.insert(ext_id::POSITIONING_FIX, vec![0x02]);

    let wire = Packager::new().encode(&params).unwrap();

    let mut peer = SessionParams::default();
    let msg = Parser::new().decode(&wire, &mut peer).unwrap();
    assert_eq!(msg, msg_id::LOCATION_REPORT);

    let basic = &peer.parse.location;
    assert!(basic.status.positioning());
    assert_eq!(basic.latitude, 22_570_336);
    assert_eq!(basic.longitude, 113_937_577);
    assert_eq!(basic.altitude, 54);
    assert_eq!(basic.speed, 8);
    assert_eq!(basic.bearing, 0);
    assert_eq!(basic.time, "200702145429");

    let extensions = &peer.parse.location_extensions;
    assert_eq!(extensions.get(&ext_id::SATELLITES), Some(&vec![0x0B]));
    assert_eq!(extensions.get(&ext_id::POSITIONING_FIX), Some(&vec![0x02]));
    assert!(extensions.contains_key(&ext_id::CUSTOM_LENGTH));

    assert_eq!(peer.parse.msg_head.phone, "13523339527");
    assert_eq!(peer.parse.msg_head.flow_num, 0x0001);
}

#[test]
fn bare_location_body_is_exactly_28_bytes() {
    let params = location_params();
    let wire = Packager::new().encode(&params).unwrap();
    let interior = frame::open(&wire).unwrap();
    assert_eq!(interior.len() - 12, 28);
}

#[test]
fn each_standard_extension_grows_body_by_two_plus_len() {
    let mut params = location_params();
    let bare = Packager::new().encode(&params).unwrap();
    let bare_len = frame::open(&bare).unwrap().len();

    params.location_extensions.insert(ext_id::IO_STATUS, vec![0x00, 0x01]);
    let grown = Packager::new().encode(&params).unwrap();
    let grown_len = frame::open(&grown).unwrap().len();
    assert_eq!(grown_len, bare_len + 2 + 2);
}

#[test]
fn body_delimiter_byte_is_escaped_on_the_wire() {
    let mut params = location_params();
    // An alarm word whose low byte is 0x7E lands the delimiter in the body.
    params.location.alarm = AlarmFlags::from_raw(0x0000_007E);

    let wire = Packager::new().encode(&params).unwrap();
    assert!(!wire[1..wire.len() - 1].contains(&0x7E));
    assert!(wire.windows(2).any(|pair| pair == [0x7D, 0x02]));

    // Reverse-escape restores the body and the checksum still verifies.
    let interior = frame::open(&wire).unwrap();
    assert_eq!(&interior[12..16], &[0x00, 0x00, 0x00, 0x7E]);

    let mut peer = SessionParams::default();
    Parser::new().decode(&wire, &mut peer).unwrap();
    assert_eq!(peer.parse.location.alarm.raw(), 0x0000_007E);
}

#[test]
fn segmented_upgrade_fragments_reproduce_the_file() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let max_fragment = 1023 - 11 - 5; // fixed overhead plus a 5-byte version
    let total = payload.len().div_ceil(max_fragment);
    assert_eq!(total, 5);

    let packager = Packager::new();
    let parser = Parser::new();

    let mut params = SessionParams::with_phone("13523339527");
    params.msg_head.msg_id = msg_id::TERMINAL_UPGRADE;
    params.msg_head.attr.set_packet(true);
    params.msg_head.total_packets = total as u16;
    params.upgrade.kind = 0x00;
    params.upgrade.manufacturer_id = b"SKOEM".to_vec();
    params.upgrade.version = "1.0.9".to_owned();

    let mut reassembled = Vec::new();
    for (seq, chunk) in payload.chunks(max_fragment).enumerate() {
        params.msg_head.packet_seq = (seq + 1) as u16;
        params.upgrade.data = chunk.to_vec();
        let wire = packager.encode(&params).unwrap();
        params.msg_head.flow_num = params.msg_head.flow_num.wrapping_add(1);

        let mut peer = SessionParams::default();
        let msg = parser.decode(&wire, &mut peer).unwrap();
        assert_eq!(msg, msg_id::TERMINAL_UPGRADE);
        assert_eq!(peer.parse.msg_head.total_packets, total as u16);
        assert_eq!(peer.parse.msg_head.packet_seq, (seq + 1) as u16);
        assert_eq!(peer.parse.upgrade.version, "1.0.9");
        reassembled.extend_from_slice(&peer.parse.upgrade.data);
    }

    assert_eq!(reassembled, payload);
}

#[test]
fn register_handshake_bodies_round_trip() {
    let packager = Packager::new();
    let parser = Parser::new();

    // Terminal register.
    let mut terminal = SessionParams::with_phone("13523339527");
    terminal.msg_head.msg_id = msg_id::TERMINAL_REGISTER;
    terminal.register_info.province_id = 0x002C;
    terminal.register_info.city_id = 0x012C;
    terminal.register_info.manufacturer_id = b"SKOEM".to_vec();
    terminal.register_info.model = b"SK9151".to_vec();
    terminal.register_info.terminal_id = b"000001".to_vec();
    terminal.register_info.plate_color = 1;
    terminal.register_info.plate_number = "\u{7ca4}B99999".to_owned();
    let register_wire = packager.encode(&terminal).unwrap();

    // Platform decodes it and responds with an auth code.
    let mut platform = SessionParams::default();
    let msg = parser.decode(&register_wire, &mut platform).unwrap();
    assert_eq!(msg, msg_id::TERMINAL_REGISTER);
    assert_eq!(platform.parse.register_info.model, b"SK9151".to_vec());
    assert_eq!(platform.parse.register_info.plate_number, "\u{7ca4}B99999");

    platform.msg_head.msg_id = msg_id::REGISTER_RESPOND;
    platform.respond_result = 0;
    platform.auth_code = b"70619".to_vec();
    let respond_wire = packager.encode(&platform).unwrap();

    // Terminal extracts the code and authenticates with it.
    let msg = parser.decode(&respond_wire, &mut terminal).unwrap();
    assert_eq!(msg, msg_id::REGISTER_RESPOND);
    assert_eq!(terminal.parse.respond_result, 0);
    assert_eq!(terminal.parse.auth_code, b"70619".to_vec());
    assert_eq!(terminal.parse.respond_flow_num, 0);

    terminal.msg_head.msg_id = msg_id::TERMINAL_AUTHENTICATION;
    let auth_wire = packager.encode(&terminal).unwrap();

    let msg = parser.decode(&auth_wire, &mut platform).unwrap();
    assert_eq!(msg, msg_id::TERMINAL_AUTHENTICATION);
    assert_eq!(platform.parse.auth_code, b"70619".to_vec());
}
