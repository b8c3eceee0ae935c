//! The point collection artifact, encoded as a GeoJSON `FeatureCollection`.
//!
//! Only point geometries are produced or accepted. Ordinates follow the
//! GeoJSON order, `[longitude, latitude]`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};
use crate::location::Coordinates;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
enum CollectionType {
    #[default]
    FeatureCollection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
enum FeatureType {
    #[default]
    Feature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: [f64; 2] },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    kind: FeatureType,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

impl Feature {
    pub fn point(lng_lat: [f64; 2]) -> Self {
        Self {
            kind: FeatureType::Feature,
            geometry: Geometry::Point {
                coordinates: lng_lat,
            },
            properties: None,
        }
    }

    pub fn lng_lat(&self) -> [f64; 2] {
        match self.geometry {
            Geometry::Point { coordinates } => coordinates,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    kind: CollectionType,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_feature(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn from_slice(bytes: &[u8]) -> AppResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| AppError::Parse(format!("invalid UTF-8 in feature collection: {err}")))?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_vec(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Parses stored decimal strings into a `[lng, lat]` ordinate pair.
pub fn lng_lat_from_coordinates(coords: &Coordinates) -> AppResult<[f64; 2]> {
    let lat = coords
        .lat
        .trim()
        .parse::<f64>()
        .map_err(|err| AppError::Parse(format!("latitude {:?}: {err}", coords.lat)))?;
    let lng = coords
        .lng
        .trim()
        .parse::<f64>()
        .map_err(|err| AppError::Parse(format!("longitude {:?}: {err}", coords.lng)))?;
    Ok([lng, lat])
}

pub fn coordinates_from_lng_lat(lng_lat: [f64; 2]) -> Coordinates {
    let [lng, lat] = lng_lat;
    Coordinates::from_degrees(lat, lng)
}
