use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactStore;
use crate::db::{
    associate_order, count_known_locations, insert_known_location, load_known_locations,
    load_unresolved_orders,
};
use crate::errors::AppResult;
use crate::geocoder::{build_query, GeocoderChain, ResolutionOutcome};
use crate::location::find_match;
use crate::sync::{load_collection, push_point, save_collection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Idle,
    Incremental,
    Regenerate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub candidates: usize,
    pub cache_hits: usize,
    pub geocoded: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub out_of_bounds: usize,
    pub provider_errors: usize,
    pub locations_created: usize,
    pub features_written: usize,
}

impl RunSummary {
    fn incremental(candidates: usize) -> Self {
        Self {
            mode: RunMode::Incremental,
            candidates,
            ..Self::default()
        }
    }

    fn record_outcome(&mut self, outcome: &ResolutionOutcome) {
        self.geocoded += 1;
        match outcome {
            ResolutionOutcome::Resolved(_) => self.resolved += 1,
            ResolutionOutcome::OutOfBounds => self.out_of_bounds += 1,
            ResolutionOutcome::NotFound => self.not_found += 1,
            ResolutionOutcome::ProviderError(_) => {
                self.not_found += 1;
                self.provider_errors += 1;
            }
        }
    }
}

pub struct ReconcileSettings<'a> {
    pub region_name: &'a str,
    pub out_of_area_prefix: &'a str,
}

/// Associates every unresolved order with a cached location, geocoding the
/// addresses the cache has never seen, and appends the resulting points to the
/// stored feature collection.
///
/// All inserts and associations share one transaction. The artifact is written
/// just before commit; if that write fails the transaction is rolled back. If
/// the commit itself fails after the artifact was written, the two stay out of
/// step until a later run.
pub fn update_db_locations(
    connection: &mut Connection,
    geocoder: &GeocoderChain,
    store: &dyn ArtifactStore,
    settings: &ReconcileSettings<'_>,
) -> AppResult<RunSummary> {
    let orders = load_unresolved_orders(connection, settings.out_of_area_prefix)?;
    if orders.is_empty() {
        info!(target: "reconcile", "no orders found with unknown locations");
        return Ok(RunSummary::default());
    }
    info!(
        target: "reconcile",
        count = orders.len(),
        "orders without known locations"
    );

    let mut known = load_known_locations(connection)?;
    let mut collection = load_collection(store)?;
    let mut summary = RunSummary::incremental(orders.len());

    let tx = connection.transaction()?;
    for order in &orders {
        let (location_id, fix) = match find_match(order, &known) {
            Some(existing) => {
                debug!(
                    target: "reconcile",
                    order_id = %order.order_id,
                    location_id = %existing.id,
                    "matched known location"
                );
                summary.cache_hits += 1;
                (existing.id.clone(), existing.fix.clone())
            }
            None => {
                let query = build_query(order, settings.region_name);
                let outcome = geocoder.resolve(&query);
                if let ResolutionOutcome::ProviderError(reason) = &outcome {
                    warn!(
                        target: "reconcile",
                        order_id = %order.order_id,
                        %reason,
                        "all geocoding providers failed; caching as not found"
                    );
                }
                summary.record_outcome(&outcome);

                let created = insert_known_location(&tx, order, outcome.into_fix())?;
                info!(
                    target: "reconcile",
                    order_id = %order.order_id,
                    location_id = %created.id,
                    resolution = created.fix.as_tag(),
                    %query,
                    "cached new location"
                );
                summary.locations_created += 1;
                let pair = (created.id.clone(), created.fix.clone());
                // later orders in this run reuse it instead of geocoding again
                known.push(created);
                pair
            }
        };

        if let Some(coords) = fix.coordinates() {
            if push_point(&mut collection, coords) {
                summary.features_written += 1;
            }
        }

        associate_order(&tx, &order.order_id, &location_id)?;
    }

    save_collection(store, &collection)?;

    info!(target: "reconcile", "committing location updates");
    tx.commit()?;
    info!(
        target: "reconcile",
        total_locations = count_known_locations(connection)?,
        candidates = summary.candidates,
        cache_hits = summary.cache_hits,
        geocoded = summary.geocoded,
        created = summary.locations_created,
        features = summary.features_written,
        "location update committed"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::artifacts::FileArtifactStore;
    use crate::db::bootstrap;
    use crate::errors::{AppError, AppResult};
    use crate::geocoder::{GeoPoint, Geocode};
    use crate::geojson::FeatureCollection;

    const SETTINGS: ReconcileSettings<'static> = ReconcileSettings {
        region_name: "Texas",
        out_of_area_prefix: "Out of Area",
    };

    struct ScriptedGeocoder {
        responses: Mutex<Vec<AppResult<Option<GeoPoint>>>>,
        queries: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedGeocoder {
        fn new(mut responses: Vec<AppResult<Option<GeoPoint>>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                queries: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Geocode for ScriptedGeocoder {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        fn geocode(&self, query: &str) -> AppResult<Option<GeoPoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.to_string());
            self.responses.lock().pop().unwrap_or(Ok(None))
        }
    }

    fn chain(geocoder: &Arc<ScriptedGeocoder>) -> GeocoderChain {
        GeocoderChain::new(vec![Arc::clone(geocoder) as Arc<dyn Geocode>])
    }

    fn setup(orders: &str) -> (TempDir, Connection, FileArtifactStore) {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("orders.db")).unwrap();
        ctx.connection.execute_batch(orders).unwrap();
        let store = FileArtifactStore::new(dir.path(), "orders.geojson");
        (dir, ctx.connection, store)
    }

    fn stored(store: &FileArtifactStore) -> FeatureCollection {
        load_collection(store).unwrap()
    }

    const ONE_ORDER: &str = "INSERT INTO orders (order_id, customer_addr1, customer_city,
            customer_zipcode, customer_neighborhood)
        VALUES ('A1', '123 Main St', 'Austin', 78701, 'Downtown');";

    #[test]
    fn no_candidates_is_a_no_op() {
        let (_dir, mut conn, store) = setup("");
        let geocoder = ScriptedGeocoder::new(vec![]);
        let summary = update_db_locations(&mut conn, &chain(&geocoder), &store, &SETTINGS).unwrap();
        assert_eq!(summary, RunSummary::default());
        assert!(store.get().unwrap().is_none());
    }

    #[test]
    fn geocodes_and_appends_in_bounds_point() {
        let (_dir, mut conn, store) = setup(ONE_ORDER);
        let geocoder = ScriptedGeocoder::new(vec![Ok(Some(GeoPoint {
            lat: 30.50,
            lng: -97.70,
        }))]);

        let summary = update_db_locations(&mut conn, &chain(&geocoder), &store, &SETTINGS).unwrap();
        assert_eq!(summary.geocoded, 1);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.features_written, 1);
        assert_eq!(
            geocoder.queries.lock().as_slice(),
            ["123 Main St, Austin, Texas, 78701".to_string()]
        );

        let collection = stored(&store);
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.features[0].lng_lat(), [-97.70, 30.50]);
        assert_eq!(count_known_locations(&conn).unwrap(), 1);
    }

    #[test]
    fn out_of_bounds_is_cached_without_feature() {
        let (_dir, mut conn, store) = setup(ONE_ORDER);
        let geocoder = ScriptedGeocoder::new(vec![Ok(Some(GeoPoint {
            lat: 40.0,
            lng: -100.0,
        }))]);

        let summary = update_db_locations(&mut conn, &chain(&geocoder), &store, &SETTINGS).unwrap();
        assert_eq!(summary.out_of_bounds, 1);
        assert_eq!(summary.features_written, 0);
        assert!(stored(&store).is_empty());

        let (resolution, lat): (String, Option<String>) = conn
            .query_row(
                "SELECT k.resolution, k.lat FROM orders o JOIN known_addrs k ON o.known_addr_id = k.id
                WHERE o.order_id = 'A1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(resolution, "out_of_bounds");
        assert!(lat.is_none());
    }

    #[test]
    fn provider_failure_is_cached_as_not_found() {
        let (_dir, mut conn, store) = setup(ONE_ORDER);
        let geocoder =
            ScriptedGeocoder::new(vec![Err(AppError::Config("connection refused".into()))]);

        let summary = update_db_locations(&mut conn, &chain(&geocoder), &store, &SETTINGS).unwrap();
        assert_eq!(summary.provider_errors, 1);
        assert_eq!(summary.not_found, 1);

        let resolution: String = conn
            .query_row("SELECT resolution FROM known_addrs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(resolution, "not_found");
    }

    #[test]
    fn same_address_twice_geocodes_once() {
        let (_dir, mut conn, store) = setup(
            "INSERT INTO orders (order_id, customer_addr1, customer_city, customer_zipcode,
                customer_neighborhood)
            VALUES ('A1', '123 Main St', 'Austin', 78701, 'Downtown'),
                   ('A2', '123 MAIN ST ', 'austin', 78701, 'Downtown');",
        );
        let geocoder = ScriptedGeocoder::new(vec![Ok(Some(GeoPoint {
            lat: 30.5,
            lng: -97.7,
        }))]);

        let summary = update_db_locations(&mut conn, &chain(&geocoder), &store, &SETTINGS).unwrap();
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.locations_created, 1);
        assert_eq!(summary.features_written, 2);

        let distinct: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT known_addr_id) FROM orders WHERE known_addr_id IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(distinct, 1);
    }

    #[test]
    fn failed_artifact_write_rolls_back() {
        struct ReadOnlyStore;

        impl ArtifactStore for ReadOnlyStore {
            fn get(&self) -> AppResult<Option<Vec<u8>>> {
                Ok(None)
            }

            fn put(&self, _body: &[u8]) -> AppResult<()> {
                Err(AppError::Artifact {
                    key: "orders.geojson".into(),
                    status: 403,
                })
            }

            fn describe(&self) -> String {
                "read-only".into()
            }
        }

        let (_dir, mut conn, _store) = setup(ONE_ORDER);
        let geocoder = ScriptedGeocoder::new(vec![Ok(Some(GeoPoint {
            lat: 30.5,
            lng: -97.7,
        }))]);

        let result = update_db_locations(&mut conn, &chain(&geocoder), &ReadOnlyStore, &SETTINGS);
        assert!(matches!(result, Err(AppError::Artifact { status: 403, .. })));
        assert_eq!(count_known_locations(&conn).unwrap(), 0);
        assert_eq!(
            load_unresolved_orders(&conn, "Out of Area").unwrap().len(),
            1
        );
    }
}
