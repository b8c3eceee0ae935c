mod address;
mod artifacts;
mod bounds;
mod config;
mod db;
mod errors;
mod geocoder;
mod geojson;
mod location;
mod reconcile;
mod sync;

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::address::{normalize, MatchKey, NormalizedAddress};
pub use crate::artifacts::{ArtifactStore, FileArtifactStore, HttpArtifactStore};
pub use crate::bounds::{in_region, GeoExtent, SERVICE_AREA};
pub use crate::config::{AppConfig, PublicAppConfig, UpdateGeoJsonFlags};
pub use crate::db::{bootstrap, DatabaseContext};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocoder::{
    build_query, GeoPoint, Geocode, GeocoderChain, MapboxGeocoder, NominatimGeocoder,
    ResolutionOutcome,
};
pub use crate::geojson::{
    coordinates_from_lng_lat, lng_lat_from_coordinates, Feature, FeatureCollection, Geometry,
};
pub use crate::location::{find_match, Coordinates, KnownLocation, LocationFix, UnresolvedOrder};
pub use crate::reconcile::{RunMode, RunSummary};

/// Long-lived handles for a process: the database connection, the geocoding
/// provider chain and the artifact store. Build it once with [`init`] and pass
/// it to every run; [`deinit`] closes the connection and may be called more
/// than once.
///
/// [`init`]: GeocoderContext::init
/// [`deinit`]: GeocoderContext::deinit
pub struct GeocoderContext {
    db: Mutex<Option<Connection>>,
    db_path: PathBuf,
    geocoder: GeocoderChain,
    artifacts: Box<dyn ArtifactStore>,
    config: AppConfig,
}

impl GeocoderContext {
    pub fn init(config: AppConfig) -> AppResult<Self> {
        let artifacts = artifacts::from_config(&config)?;
        let DatabaseContext { connection, path } = bootstrap(&config.database_path)?;
        let geocoder = GeocoderChain::from_config(&config)?;
        info!(
            providers = ?geocoder.provider_names(),
            artifact = %artifacts.describe(),
            "geocoder context initialized"
        );
        Ok(Self::from_parts(config, connection, path, geocoder, artifacts))
    }

    pub fn from_parts(
        config: AppConfig,
        connection: Connection,
        db_path: impl Into<PathBuf>,
        geocoder: GeocoderChain,
        artifacts: Box<dyn ArtifactStore>,
    ) -> Self {
        Self {
            db: Mutex::new(Some(connection)),
            db_path: db_path.into(),
            geocoder,
            artifacts,
            config,
        }
    }

    pub fn deinit(&self) {
        let Some(connection) = self.db.lock().take() else {
            return;
        };
        if let Err((_, err)) = connection.close() {
            warn!(?err, path = %self.db_path.display(), "database did not close cleanly");
        } else {
            info!(path = %self.db_path.display(), "database closed");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.db.lock().is_some()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn geocoder(&self) -> &GeocoderChain {
        &self.geocoder
    }

    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.artifacts.as_ref()
    }
}

/// Runs one pass. With `update_db` set, unresolved orders are matched or
/// geocoded and their points appended to the artifact. Otherwise, with
/// `do_complete_regen`, the artifact is rebuilt from the database. With
/// neither flag nothing happens.
pub fn update_geo_json(ctx: &GeocoderContext, flags: UpdateGeoJsonFlags) -> AppResult<RunSummary> {
    let mut guard = ctx.db.lock();
    let connection = guard.as_mut().ok_or(AppError::Uninitialized)?;

    if flags.update_db {
        let settings = reconcile::ReconcileSettings {
            region_name: &ctx.config.region_name,
            out_of_area_prefix: &ctx.config.out_of_area_prefix,
        };
        reconcile::update_db_locations(connection, &ctx.geocoder, ctx.artifacts(), &settings)
            .inspect_err(|err| warn!(error = %err, "failed to update database locations"))
    } else if flags.do_complete_regen {
        let features = sync::regenerate(connection, ctx.artifacts())
            .inspect_err(|err| warn!(error = %err, "failed to regenerate feature collection"))?;
        Ok(RunSummary {
            mode: RunMode::Regenerate,
            features_written: features,
            ..RunSummary::default()
        })
    } else {
        info!("no run flags set; nothing to do");
        Ok(RunSummary::default())
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,order_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
