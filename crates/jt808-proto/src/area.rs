//! Polygon area model.
//!
//! An area couples an id with an attribute bitfield, optional time and
//! speed constraints gated by that bitfield, and the vertex list. Vertices
//! are degrees as `f64`; the wire form is degrees × 10⁶ as unsigned 32-bit
//! big-endian pairs.

use std::collections::BTreeMap;

/// Area attribute bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AreaAttr(u16);

impl AreaAttr {
    const BY_TIME: u16 = 1;
    const SPEED_LIMIT: u16 = 1 << 1;
    const IN_ALARM_TO_DRIVER: u16 = 1 << 2;
    const IN_ALARM_TO_SERVER: u16 = 1 << 3;
    const OUT_ALARM_TO_DRIVER: u16 = 1 << 4;
    const OUT_ALARM_TO_SERVER: u16 = 1 << 5;

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

    /// Start/stop times are present, bit 0.
    #[must_use]
    pub fn by_time(self) -> bool {
        self.0 & Self::BY_TIME != 0
    }

    /// Set or clear the time-constraint bit.
    pub fn set_by_time(&mut self, on: bool) {
        self.toggle(Self::BY_TIME, on);
    }

    /// Speed limit fields are present, bit 1.
    #[must_use]
    pub fn speed_limit(self) -> bool {
        self.0 & Self::SPEED_LIMIT != 0
    }

    /// Set or clear the speed-limit bit.
    pub fn set_speed_limit(&mut self, on: bool) {
        self.toggle(Self::SPEED_LIMIT, on);
    }

    /// Alarm the driver on entry, bit 2.
    #[must_use]
    pub fn in_alarm_to_driver(self) -> bool {
        self.0 & Self::IN_ALARM_TO_DRIVER != 0
    }

    /// Alarm the platform on entry, bit 3.
    #[must_use]
    pub fn in_alarm_to_server(self) -> bool {
        self.0 & Self::IN_ALARM_TO_SERVER != 0
    }

    /// Set or clear the entry-alarm-to-platform bit.
    pub fn set_in_alarm_to_server(&mut self, on: bool) {
        self.toggle(Self::IN_ALARM_TO_SERVER, on);
    }

    /// Alarm the driver on exit, bit 4.
    #[must_use]
    pub fn out_alarm_to_driver(self) -> bool {
        self.0 & Self::OUT_ALARM_TO_DRIVER != 0
    }

    /// Alarm the platform on exit, bit 5.
    #[must_use]
    pub fn out_alarm_to_server(self) -> bool {
        self.0 & Self::OUT_ALARM_TO_SERVER != 0
    }

    /// Set or clear the exit-alarm-to-platform bit.
    pub fn set_out_alarm_to_server(&mut self, on: bool) {
        self.toggle(Self::OUT_ALARM_TO_SERVER, on);
    }

    fn toggle(&mut self, mask: u16, on: bool) {
        if on {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

/// A geographic point in decimal degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatLon {
    /// Latitude in degrees, positive north.
    pub latitude: f64,
    /// Longitude in degrees, positive east.
    pub longitude: f64,
}

impl LatLon {
    /// Construct from degrees.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Wire form: (latitude, longitude) as degrees × 10⁶.
    #[must_use]
    pub fn to_wire(self) -> (u32, u32) {
        (((self.latitude * 1e6).round()) as u32, ((self.longitude * 1e6).round()) as u32)
    }

    /// Construct from the wire form.
    #[must_use]
    pub fn from_wire(latitude: u32, longitude: u32) -> Self {
        Self { latitude: f64::from(latitude) * 1e-6, longitude: f64::from(longitude) * 1e-6 }
    }
}

/// Polygon area description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolygonArea {
    /// Area id, unique per terminal.
    pub id: u32,
    /// Attribute bitfield gating the optional fields.
    pub attr: AreaAttr,
    /// Validity start, `YYMMDDhhmmss`; on the wire only when `attr.by_time()`.
    pub start_time: String,
    /// Validity end, `YYMMDDhhmmss`; on the wire only when `attr.by_time()`.
    pub stop_time: String,
    /// Speed cap in km/h; on the wire only when `attr.speed_limit()`.
    pub max_speed: u16,
    /// Seconds of sustained over-speed before alarming.
    pub overspeed_time: u8,
    /// Polygon vertices in order.
    pub vertices: Vec<LatLon>,
}

/// Area collection keyed by id.
pub type PolygonAreaSet = BTreeMap<u32, PolygonArea>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_bits() {
        let mut attr = AreaAttr::default();
        attr.set_by_time(true);
        attr.set_in_alarm_to_server(true);
        attr.set_out_alarm_to_server(true);
        assert!(attr.by_time());
        assert!(attr.in_alarm_to_server());
        assert!(attr.out_alarm_to_server());
        assert!(!attr.speed_limit());
        assert!(!attr.in_alarm_to_driver());
        assert_eq!(attr.raw(), 0b10_1001);

        attr.set_by_time(false);
        assert!(!attr.by_time());
    }

    #[test]
    fn latlon_wire_conversion() {
        let point = LatLon::new(22.570336, 113.937577);
        let (lat, lon) = point.to_wire();
        assert_eq!(lat, 22_570_336);
        assert_eq!(lon, 113_937_577);

        let back = LatLon::from_wire(lat, lon);
        assert!((back.latitude - point.latitude).abs() < 1e-6);
        assert!((back.longitude - point.longitude).abs() < 1e-6);
    }
}
