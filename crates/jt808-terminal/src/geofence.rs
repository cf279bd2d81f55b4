//! Geofence store: polygon areas keyed by id with enter/leave tracking.
//!
//! The platform pushes areas with `0x8604`/`0x8605`; the terminal feeds
//! every location fix through [`AreaStore::evaluate`], which reports
//! boundary crossings so the session can raise the in/out-area alarm.

use std::collections::BTreeSet;

use jt808_proto::{LatLon, PolygonArea, PolygonAreaSet};

/// A boundary crossing observed between two location fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeofenceEvent {
    /// The point moved into an area.
    Entered {
        /// Area that was entered.
        area_id: u32,
        /// Whether the area wants the platform alarmed on entry.
        alarm_to_server: bool,
    },
    /// The point moved out of an area.
    Left {
        /// Area that was left.
        area_id: u32,
        /// Whether the area wants the platform alarmed on exit.
        alarm_to_server: bool,
    },
}

/// Ray-casting point-in-polygon test.
///
/// Casts a ray eastward from the point and counts edge crossings; an odd
/// count means inside. Points on an edge fall on whichever side the
/// half-open edge rule assigns them.
#[must_use]
pub fn point_in_polygon(point: LatLon, vertices: &[LatLon]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut crossings = 0u32;
    for i in 0..vertices.len() {
        let a = vertices[i];
        let b = vertices[(i + 1) % vertices.len()];
        if (a.latitude > point.latitude) == (b.latitude > point.latitude) {
            continue;
        }
        let longitude = a.longitude
            + (point.latitude - a.latitude) * (b.longitude - a.longitude)
                / (b.latitude - a.latitude);
        if longitude > point.longitude {
            crossings += 1;
        }
    }
    crossings % 2 == 1
}

/// In-memory polygon area store with membership tracking.
#[derive(Debug, Default)]
pub struct AreaStore {
    areas: PolygonAreaSet,
    inside: BTreeSet<u32>,
}

impl AreaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new area. Returns `false` if the id already exists.
    pub fn add(&mut self, area: PolygonArea) -> bool {
        if self.areas.contains_key(&area.id) {
            return false;
        }
        self.areas.insert(area.id, area);
        true
    }

    /// Insert or replace an area.
    pub fn upsert(&mut self, area: PolygonArea) {
        self.areas.insert(area.id, area);
    }

    /// Delete one area. Returns whether it existed.
    pub fn remove(&mut self, id: u32) -> bool {
        self.inside.remove(&id);
        self.areas.remove(&id).is_some()
    }

    /// Delete the listed areas; an empty list deletes everything.
    pub fn remove_many(&mut self, ids: &[u32]) {
        if ids.is_empty() {
            self.clear();
            return;
        }
        for &id in ids {
            self.remove(id);
        }
    }

    /// Delete every area.
    pub fn clear(&mut self) {
        self.areas.clear();
        self.inside.clear();
    }

    /// Look up an area by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&PolygonArea> {
        self.areas.get(&id)
    }

    /// Number of stored areas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Snapshot of the stored areas.
    #[must_use]
    pub fn areas(&self) -> PolygonAreaSet {
        self.areas.clone()
    }

    /// Feed a location fix and collect boundary crossings since the
    /// previous fix.
    pub fn evaluate(&mut self, point: LatLon) -> Vec<GeofenceEvent> {
        let mut events = Vec::new();
        for (&id, area) in &self.areas {
            let inside_now = point_in_polygon(point, &area.vertices);
            let was_inside = self.inside.contains(&id);
            if inside_now && !was_inside {
                events.push(GeofenceEvent::Entered {
                    area_id: id,
                    alarm_to_server: area.attr.in_alarm_to_server(),
                });
            } else if !inside_now && was_inside {
                events.push(GeofenceEvent::Left {
                    area_id: id,
                    alarm_to_server: area.attr.out_alarm_to_server(),
                });
            }
            if inside_now {
                self.inside.insert(id);
            } else {
                self.inside.remove(&id);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use jt808_proto::AreaAttr;

    use super::*;

    fn square_around(center: LatLon, half: f64) -> Vec<LatLon> {
        vec![
            LatLon::new(center.latitude - half, center.longitude - half),
            LatLon::new(center.latitude - half, center.longitude + half),
            LatLon::new(center.latitude + half, center.longitude + half),
            LatLon::new(center.latitude + half, center.longitude - half),
        ]
    }

    fn alarmed_area(id: u32, vertices: Vec<LatLon>) -> PolygonArea {
        let mut attr = AreaAttr::default();
        attr.set_in_alarm_to_server(true);
        attr.set_out_alarm_to_server(true);
        PolygonArea { id, attr, vertices, ..PolygonArea::default() }
    }

    #[test]
    fn point_inside_square() {
        let square = square_around(LatLon::new(22.570336, 113.937577), 0.001);
        assert!(point_in_polygon(LatLon::new(22.570336, 113.937577), &square));
        assert!(!point_in_polygon(LatLon::new(22.573, 113.937577), &square));
        assert!(!point_in_polygon(LatLon::new(22.570336, 113.941), &square));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        let line = vec![LatLon::new(0.0, 0.0), LatLon::new(1.0, 1.0)];
        assert!(!point_in_polygon(LatLon::new(0.5, 0.5), &line));
    }

    #[test]
    fn concave_polygon_notch_is_outside() {
        // A square with a notch cut into the right side.
        let polygon = vec![
            LatLon::new(0.0, 0.0),
            LatLon::new(0.0, 4.0),
            LatLon::new(2.0, 4.0),
            LatLon::new(2.0, 2.0),
            LatLon::new(3.0, 2.0),
            LatLon::new(3.0, 4.0),
            LatLon::new(5.0, 4.0),
            LatLon::new(5.0, 0.0),
        ];
        assert!(point_in_polygon(LatLon::new(1.0, 1.0), &polygon));
        assert!(!point_in_polygon(LatLon::new(2.5, 3.0), &polygon));
        assert!(point_in_polygon(LatLon::new(2.5, 1.0), &polygon));
    }

    #[test]
    fn add_is_unique_and_upsert_replaces() {
        let mut store = AreaStore::new();
        let area = alarmed_area(7, square_around(LatLon::new(10.0, 10.0), 1.0));
        assert!(store.add(area.clone()));
        assert!(!store.add(area));

        let replacement = alarmed_area(7, square_around(LatLon::new(20.0, 20.0), 1.0));
        store.upsert(replacement);
        assert_eq!(store.len(), 1);
        assert!(store.get(7).is_some());
    }

    #[test]
    fn remove_many_with_empty_list_clears_all() {
        let mut store = AreaStore::new();
        store.upsert(alarmed_area(1, square_around(LatLon::new(1.0, 1.0), 0.5)));
        store.upsert(alarmed_area(2, square_around(LatLon::new(5.0, 5.0), 0.5)));
        store.remove_many(&[]);
        assert!(store.is_empty());
    }

    #[test]
    fn remove_many_deletes_listed_ids() {
        let mut store = AreaStore::new();
        store.upsert(alarmed_area(1, square_around(LatLon::new(1.0, 1.0), 0.5)));
        store.upsert(alarmed_area(2, square_around(LatLon::new(5.0, 5.0), 0.5)));
        store.upsert(alarmed_area(3, square_around(LatLon::new(9.0, 9.0), 0.5)));
        store.remove_many(&[1, 3]);
        assert_eq!(store.len(), 1);
        assert!(store.get(2).is_some());
    }

    #[test]
    fn evaluate_reports_enter_then_leave_once() {
        let center = LatLon::new(22.570336, 113.937577);
        let mut store = AreaStore::new();
        store.upsert(alarmed_area(42, square_around(center, 0.001)));

        let outside = LatLon::new(22.575, 113.937577);

        assert!(store.evaluate(outside).is_empty());

        let events = store.evaluate(center);
        assert_eq!(events, vec![GeofenceEvent::Entered { area_id: 42, alarm_to_server: true }]);

        // Still inside: no repeated event.
        assert!(store.evaluate(center).is_empty());

        let events = store.evaluate(outside);
        assert_eq!(events, vec![GeofenceEvent::Left { area_id: 42, alarm_to_server: true }]);

        assert!(store.evaluate(outside).is_empty());
    }

    #[test]
    fn silent_area_reports_without_alarm() {
        let center = LatLon::new(1.0, 1.0);
        let mut store = AreaStore::new();
        let area =
            PolygonArea { id: 9, vertices: square_around(center, 0.5), ..PolygonArea::default() };
        store.upsert(area);

        let events = store.evaluate(center);
        assert_eq!(events, vec![GeofenceEvent::Entered { area_id: 9, alarm_to_server: false }]);
    }
}
