//! Terminal parameter store and the typed helper layer.
//!
//! The wire carries parameters as `u32 id → raw bytes`; the standard fixes
//! a per-id value type (byte, word, dword or string). The helpers read and
//! write those shapes; ids they do not know stay opaque byte strings.

use std::collections::BTreeMap;

/// Ordered parameter store: id → raw value bytes.
pub type TerminalParams = BTreeMap<u32, Vec<u8>>;

/// Well-known terminal parameter ids.
pub mod param_id {
    /// Heartbeat interval in seconds, DWORD.
    pub const HEARTBEAT_INTERVAL: u32 = 0x0001;
    /// TCP respond timeout in seconds, DWORD.
    pub const TCP_RESPONSE_TIMEOUT: u32 = 0x0002;
    /// TCP retransmission count, DWORD.
    pub const TCP_RETRANSMISSIONS: u32 = 0x0003;
    /// Location report strategy, DWORD.
    pub const REPORT_STRATEGY: u32 = 0x0020;
    /// Default timed report interval in seconds, DWORD.
    pub const TIMED_REPORT_INTERVAL: u32 = 0x0029;
    /// Default distance report interval in meters, DWORD.
    pub const DISTANCE_REPORT_INTERVAL: u32 = 0x002C;
    /// Alarm mask word, DWORD.
    pub const ALARM_MASK: u32 = 0x0050;
    /// Maximum speed in km/h, DWORD.
    pub const MAX_SPEED: u32 = 0x0055;
    /// GNSS positioning mode, BYTE.
    pub const GNSS_MODE: u32 = 0x0090;
    /// GNSS module baud rate selector, BYTE.
    pub const GNSS_BAUD_RATE: u32 = 0x0091;
}

/// Store a byte-typed parameter.
pub fn set_u8(params: &mut TerminalParams, id: u32, value: u8) {
    params.insert(id, vec![value]);
}

/// Store a word-typed parameter (big-endian).
pub fn set_u16(params: &mut TerminalParams, id: u32, value: u16) {
    params.insert(id, value.to_be_bytes().to_vec());
}

/// Store a dword-typed parameter (big-endian).
pub fn set_u32(params: &mut TerminalParams, id: u32, value: u32) {
    params.insert(id, value.to_be_bytes().to_vec());
}

/// Store a string-typed parameter.
pub fn set_string(params: &mut TerminalParams, id: u32, value: &str) {
    params.insert(id, value.as_bytes().to_vec());
}

/// Read a byte-typed parameter. `None` if absent or mis-sized.
#[must_use]
pub fn get_u8(params: &TerminalParams, id: u32) -> Option<u8> {
    match params.get(&id)?.as_slice() {
        [value] => Some(*value),
        _ => None,
    }
}

/// Read a word-typed parameter. `None` if absent or mis-sized.
#[must_use]
pub fn get_u16(params: &TerminalParams, id: u32) -> Option<u16> {
    match params.get(&id)?.as_slice() {
        [a, b] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

/// Read a dword-typed parameter. `None` if absent or mis-sized.
#[must_use]
pub fn get_u32(params: &TerminalParams, id: u32) -> Option<u32> {
    match params.get(&id)?.as_slice() {
        [a, b, c, d] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

/// Read a string-typed parameter. `None` if absent or not UTF-8.
#[must_use]
pub fn get_string(params: &TerminalParams, id: u32) -> Option<String> {
    String::from_utf8(params.get(&id)?.clone()).ok()
}

/// Store the heartbeat interval (parameter `0x0001`), seconds.
pub fn set_heartbeat_interval(params: &mut TerminalParams, secs: u32) {
    set_u32(params, param_id::HEARTBEAT_INTERVAL, secs);
}

/// Read the heartbeat interval (parameter `0x0001`), seconds.
#[must_use]
pub fn heartbeat_interval(params: &TerminalParams) -> Option<u32> {
    get_u32(params, param_id::HEARTBEAT_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trips() {
        let mut params = TerminalParams::new();
        set_u8(&mut params, param_id::GNSS_MODE, 0x0F);
        set_u16(&mut params, 0x0101, 30);
        set_u32(&mut params, param_id::MAX_SPEED, 120);
        set_string(&mut params, 0x0083, "ABC123");

        assert_eq!(get_u8(&params, param_id::GNSS_MODE), Some(0x0F));
        assert_eq!(get_u16(&params, 0x0101), Some(30));
        assert_eq!(get_u32(&params, param_id::MAX_SPEED), Some(120));
        assert_eq!(get_string(&params, 0x0083).as_deref(), Some("ABC123"));
    }

    #[test]
    fn wrong_width_reads_as_none() {
        let mut params = TerminalParams::new();
        set_u8(&mut params, 0x0001, 9);
        assert_eq!(get_u32(&params, 0x0001), None);
        assert_eq!(get_u16(&params, 0x0001), None);
    }

    #[test]
    fn missing_id_reads_as_none() {
        let params = TerminalParams::new();
        assert_eq!(heartbeat_interval(&params), None);
    }

    #[test]
    fn heartbeat_helper_uses_dword_0x0001() {
        let mut params = TerminalParams::new();
        set_heartbeat_interval(&mut params, 30);
        assert_eq!(params[&param_id::HEARTBEAT_INTERVAL], vec![0, 0, 0, 30]);
        assert_eq!(heartbeat_interval(&params), Some(30));
    }

    #[test]
    fn unknown_ids_stay_opaque() {
        let mut params = TerminalParams::new();
        params.insert(0xF00D, vec![1, 2, 3]);
        assert_eq!(params[&0xF00D], vec![1, 2, 3]);
        assert_eq!(get_u32(&params, 0xF00D), None);
    }
}
