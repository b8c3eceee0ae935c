use rusqlite::Connection;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::db::load_order_coordinates;
use crate::errors::AppResult;
use crate::geojson::{lng_lat_from_coordinates, Feature, FeatureCollection};
use crate::location::Coordinates;

/// Reads the current artifact. A store with no object yet yields an empty
/// collection so the first incremental run can seed it.
pub fn load_collection(store: &dyn ArtifactStore) -> AppResult<FeatureCollection> {
    match store.get()? {
        Some(bytes) => {
            let collection = FeatureCollection::from_slice(&bytes)?;
            info!(
                target: "artifacts",
                location = %store.describe(),
                features = collection.len(),
                "feature collection loaded"
            );
            Ok(collection)
        }
        None => {
            warn!(
                target: "artifacts",
                location = %store.describe(),
                "no feature collection stored yet; starting empty"
            );
            Ok(FeatureCollection::new())
        }
    }
}

pub fn save_collection(store: &dyn ArtifactStore, collection: &FeatureCollection) -> AppResult<()> {
    let body = collection.to_vec()?;
    store.put(&body)?;
    info!(
        target: "artifacts",
        location = %store.describe(),
        features = collection.len(),
        "feature collection saved"
    );
    Ok(())
}

/// Appends one point for `coords`. Unparseable coordinates are logged and
/// skipped; returns whether a feature was added.
pub fn push_point(collection: &mut FeatureCollection, coords: &Coordinates) -> bool {
    match lng_lat_from_coordinates(coords) {
        Ok(lng_lat) => {
            collection.add_feature(Feature::point(lng_lat));
            true
        }
        Err(err) => {
            warn!(
                lat = %coords.lat,
                lng = %coords.lng,
                error = %err,
                "skipping feature with unparseable coordinates"
            );
            false
        }
    }
}

pub fn build_collection(coords: &[Coordinates]) -> FeatureCollection {
    let mut collection = FeatureCollection::new();
    for entry in coords {
        push_point(&mut collection, entry);
    }
    collection
}

/// Rebuilds the artifact from every order joined to a resolved location and
/// replaces whatever was stored. Returns the number of features written.
pub fn regenerate(connection: &Connection, store: &dyn ArtifactStore) -> AppResult<usize> {
    let coords = load_order_coordinates(connection)?;
    let collection = build_collection(&coords);
    info!(
        rows = coords.len(),
        features = collection.len(),
        "regenerated feature collection from database"
    );
    save_collection(store, &collection)?;
    Ok(collection.len())
}
