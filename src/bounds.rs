use serde::Serialize;

/// Axis-aligned latitude/longitude rectangle, inclusive on every edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoExtent {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

/// The metro area orders are delivered to. Anything geocoded outside it is
/// cached as out of bounds.
pub const SERVICE_AREA: GeoExtent = GeoExtent {
    south: 30.406366,
    west: -97.923777,
    north: 30.656545,
    east: -97.343905,
};

impl GeoExtent {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.south && lat <= self.north && lng >= self.west && lng <= self.east
    }
}

pub fn in_region(lat: f64, lng: f64) -> bool {
    SERVICE_AREA.contains(lat, lng)
}
