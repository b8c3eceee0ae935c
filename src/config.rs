use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_MAPBOX_ENDPOINT: &str = "https://api.mapbox.com/geocoding/v5/mapbox.places";
const DEFAULT_GEOCODER_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: String,
    pub geojson_bucket: String,
    pub geojson_key: String,
    pub artifact_endpoint: Option<String>,
    pub artifact_token: Option<SecretString>,
    pub nominatim_endpoint: String,
    pub mapbox_endpoint: String,
    pub mapbox_api_key: Option<SecretString>,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_secs: u64,
    pub region_name: String,
    pub out_of_area_prefix: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub geojson_bucket: String,
    pub geojson_key: String,
    pub artifact_endpoint: Option<String>,
    pub nominatim_endpoint: String,
    pub mapbox_endpoint: String,
    pub geocoder_timeout_secs: u64,
    pub region_name: String,
    pub out_of_area_prefix: String,
    pub has_artifact_token: bool,
    pub has_mapbox_key: bool,
}

/// Selects what a run does. `update_db` wins when both are set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UpdateGeoJsonFlags {
    pub update_db: bool,
    pub do_complete_regen: bool,
}

impl UpdateGeoJsonFlags {
    pub fn from_env() -> Self {
        Self {
            update_db: parse_bool("UPDATE_DB", true),
            do_complete_regen: parse_bool("DO_COMPLETE_REGEN", false),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "orders.db".to_string()),
            geojson_bucket: env::var("GEOJSON_BUCKET").unwrap_or_else(|_| ".".to_string()),
            geojson_key: env::var("GEOJSON_KEY").unwrap_or_else(|_| "orders.geojson".to_string()),
            artifact_endpoint: non_empty("ARTIFACT_STORE_ENDPOINT"),
            artifact_token: non_empty("ARTIFACT_STORE_TOKEN").map(SecretString::from),
            nominatim_endpoint: env::var("NOMINATIM_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_ENDPOINT.to_string()),
            mapbox_endpoint: env::var("MAPBOX_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_MAPBOX_ENDPOINT.to_string()),
            mapbox_api_key: non_empty("MAPBOX_API_KEY").map(SecretString::from),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| format!("order-geocoder/{}", env!("CARGO_PKG_VERSION"))),
            geocoder_timeout_secs: parse_u64(
                "GEOCODER_TIMEOUT_SECS",
                DEFAULT_GEOCODER_TIMEOUT_SECS,
            )
            .max(1),
            region_name: env::var("GEOCODE_REGION_NAME").unwrap_or_else(|_| "Texas".to_string()),
            out_of_area_prefix: env::var("OUT_OF_AREA_PREFIX")
                .unwrap_or_else(|_| "Out of Area".to_string()),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.clone(),
            geojson_bucket: self.geojson_bucket.clone(),
            geojson_key: self.geojson_key.clone(),
            artifact_endpoint: self.artifact_endpoint.clone(),
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            mapbox_endpoint: self.mapbox_endpoint.clone(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            region_name: self.region_name.clone(),
            out_of_area_prefix: self.out_of_area_prefix.clone(),
            has_artifact_token: self.artifact_token.is_some(),
            has_mapbox_key: self.mapbox_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
