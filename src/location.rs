use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::address::{normalize, MatchKey};
use crate::errors::{AppError, AppResult};

pub const RESOLVED_TAG: &str = "resolved";
pub const NOT_FOUND_TAG: &str = "not_found";
pub const OUT_OF_BOUNDS_TAG: &str = "out_of_bounds";

/// Latitude/longitude as persisted: decimal strings with seven places.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Coordinates {
    pub lat: String,
    pub lng: String,
}

impl Coordinates {
    pub fn from_degrees(lat: f64, lng: f64) -> Self {
        Self {
            lat: format!("{lat:.7}"),
            lng: format!("{lng:.7}"),
        }
    }

    pub fn from_stored(lat: impl Into<String>, lng: impl Into<String>) -> Self {
        Self {
            lat: lat.into(),
            lng: lng.into(),
        }
    }
}

/// What the cache knows about an address. Sentinel outcomes are cached like
/// real coordinates so the address is never sent to a provider again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationFix {
    Resolved(Coordinates),
    NotFound,
    OutOfBounds,
}

impl LocationFix {
    pub fn as_tag(&self) -> &'static str {
        match self {
            LocationFix::Resolved(_) => RESOLVED_TAG,
            LocationFix::NotFound => NOT_FOUND_TAG,
            LocationFix::OutOfBounds => OUT_OF_BOUNDS_TAG,
        }
    }

    pub fn coordinates(&self) -> Option<&Coordinates> {
        match self {
            LocationFix::Resolved(coords) => Some(coords),
            _ => None,
        }
    }

    /// Rebuilds a fix from the `(resolution, lat, lng)` storage columns.
    pub fn from_columns(tag: &str, lat: Option<String>, lng: Option<String>) -> AppResult<Self> {
        match tag {
            RESOLVED_TAG => match (lat, lng) {
                (Some(lat), Some(lng)) => Ok(LocationFix::Resolved(Coordinates { lat, lng })),
                _ => Err(AppError::Parse(
                    "resolved location is missing a coordinate".into(),
                )),
            },
            NOT_FOUND_TAG => Ok(LocationFix::NotFound),
            OUT_OF_BOUNDS_TAG => Ok(LocationFix::OutOfBounds),
            other => Err(AppError::Parse(format!("unknown resolution tag: {other}"))),
        }
    }
}

/// An order that has not been associated with a cached location yet.
#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedOrder {
    pub order_id: String,
    pub address_line: String,
    pub city: String,
    pub postal_code: i64,
    pub neighborhood: String,
}

impl UnresolvedOrder {
    pub fn from_raw(
        order_id: String,
        address_line1: &str,
        address_line2: Option<&str>,
        city: &str,
        postal_code: i64,
        neighborhood: String,
    ) -> Self {
        let normalized = normalize(address_line1, address_line2, city);
        Self {
            order_id,
            address_line: normalized.address_line,
            city: normalized.city,
            postal_code,
            neighborhood,
        }
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey::new(&self.address_line, &self.city, self.postal_code)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KnownLocation {
    pub id: String,
    /// Lower-cased on load.
    pub address_line: String,
    /// Lower-cased on load.
    pub city: String,
    pub postal_code: i64,
    pub fix: LocationFix,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl KnownLocation {
    pub fn matches(&self, key: &MatchKey) -> bool {
        self.postal_code == key.postal_code
            && self.address_line == key.address_line
            && self.city == key.city
    }
}

/// Linear scan for the first cached location with the same folded address,
/// city and postal code. The key is not unique in storage, so the first row
/// wins.
pub fn find_match<'a>(
    order: &UnresolvedOrder,
    known: &'a [KnownLocation],
) -> Option<&'a KnownLocation> {
    let key = order.match_key();
    known.iter().find(|location| location.matches(&key))
}
