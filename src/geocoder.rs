use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::bounds::in_region;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::location::{Coordinates, LocationFix, UnresolvedOrder};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// A single geocoding backend. `Ok(None)` means the provider answered but had
/// nothing for the query.
pub trait Geocode: Send + Sync {
    fn provider(&self) -> &'static str;
    fn geocode(&self, query: &str) -> AppResult<Option<GeoPoint>>;
}

/// Classification of one lookup through the provider chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    Resolved(Coordinates),
    OutOfBounds,
    NotFound,
    /// Every provider failed. Cached the same way as `NotFound`.
    ProviderError(String),
}

impl ResolutionOutcome {
    pub fn classify(point: Option<GeoPoint>) -> Self {
        match point {
            Some(point) if in_region(point.lat, point.lng) => {
                ResolutionOutcome::Resolved(Coordinates::from_degrees(point.lat, point.lng))
            }
            Some(_) => ResolutionOutcome::OutOfBounds,
            None => ResolutionOutcome::NotFound,
        }
    }

    pub fn into_fix(self) -> LocationFix {
        match self {
            ResolutionOutcome::Resolved(coords) => LocationFix::Resolved(coords),
            ResolutionOutcome::OutOfBounds => LocationFix::OutOfBounds,
            ResolutionOutcome::NotFound | ResolutionOutcome::ProviderError(_) => {
                LocationFix::NotFound
            }
        }
    }
}

/// `"{address}, {city}, {region}, {postal code}"`, the free-text form every
/// provider accepts.
pub fn build_query(order: &UnresolvedOrder, region_name: &str) -> String {
    format!(
        "{}, {}, {}, {}",
        order.address_line, order.city, region_name, order.postal_code
    )
}

/// Providers tried in order; the first one with a result wins.
#[derive(Clone)]
pub struct GeocoderChain {
    providers: Vec<Arc<dyn Geocode>>,
}

impl GeocoderChain {
    pub fn new(providers: Vec<Arc<dyn Geocode>>) -> Self {
        Self { providers }
    }

    /// Nominatim first, then Mapbox when an access token is configured.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(config.geocoder_user_agent.clone())
            .timeout(Duration::from_secs(config.geocoder_timeout_secs))
            .build()?;

        let mut providers: Vec<Arc<dyn Geocode>> = vec![Arc::new(NominatimGeocoder::new(
            http.clone(),
            &config.nominatim_endpoint,
        )?)];
        if let Some(key) = config.mapbox_api_key.clone() {
            providers.push(Arc::new(MapboxGeocoder::new(
                http,
                &config.mapbox_endpoint,
                key,
            )?));
        }
        Ok(Self::new(providers))
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.provider()).collect()
    }

    /// Never fails: provider errors are logged and folded into the outcome.
    pub fn resolve(&self, query: &str) -> ResolutionOutcome {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.geocode(query) {
                Ok(Some(point)) => {
                    debug!(
                        target: "geocoder",
                        provider = provider.provider(),
                        lat = point.lat,
                        lng = point.lng,
                        "provider returned a location"
                    );
                    return ResolutionOutcome::classify(Some(point));
                }
                Ok(None) => {
                    debug!(target: "geocoder", provider = provider.provider(), "no result");
                }
                Err(err) => {
                    warn!(
                        target: "geocoder",
                        provider = provider.provider(),
                        error = %err,
                        "geocoding provider failed; trying next"
                    );
                    failures.push(format!("{}: {err}", provider.provider()));
                }
            }
        }

        if !failures.is_empty() && failures.len() == self.providers.len() {
            ResolutionOutcome::ProviderError(failures.join("; "))
        } else {
            ResolutionOutcome::NotFound
        }
    }
}

pub struct NominatimGeocoder {
    http: Client,
    endpoint: Url,
}

impl NominatimGeocoder {
    pub fn new(http: Client, endpoint: &str) -> AppResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid Nominatim endpoint: {err}")))?;
        Ok(Self { http, endpoint })
    }
}

impl Geocode for NominatimGeocoder {
    fn provider(&self) -> &'static str {
        "nominatim"
    }

    fn geocode(&self, query: &str) -> AppResult<Option<GeoPoint>> {
        #[derive(Deserialize)]
        struct SearchHit {
            lat: String,
            lon: String,
        }

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "jsonv2")
            .append_pair("limit", "1");

        let hits: Vec<SearchHit> = self.http.get(url).send()?.error_for_status()?.json()?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };

        let lat = hit
            .lat
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("nominatim latitude {:?}: {err}", hit.lat)))?;
        let lng = hit
            .lon
            .trim()
            .parse::<f64>()
            .map_err(|err| AppError::Parse(format!("nominatim longitude {:?}: {err}", hit.lon)))?;
        Ok(Some(GeoPoint { lat, lng }))
    }
}

pub struct MapboxGeocoder {
    http: Client,
    endpoint: Url,
    access_token: SecretString,
}

impl MapboxGeocoder {
    pub fn new(http: Client, endpoint: &str, access_token: SecretString) -> AppResult<Self> {
        let endpoint = Url::parse(endpoint.trim_end_matches('/'))
            .map_err(|err| AppError::Config(format!("invalid Mapbox endpoint: {err}")))?;
        Ok(Self {
            http,
            endpoint,
            access_token,
        })
    }
}

impl Geocode for MapboxGeocoder {
    fn provider(&self) -> &'static str {
        "mapbox"
    }

    fn geocode(&self, query: &str) -> AppResult<Option<GeoPoint>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            features: Vec<ResponseFeature>,
        }

        #[derive(Deserialize)]
        struct ResponseFeature {
            // [lng, lat]
            center: Option<Vec<f64>>,
        }

        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("invalid Mapbox endpoint".into()))?
            .push(&format!("{query}.json"));
        url.query_pairs_mut()
            .append_pair("access_token", self.access_token.expose_secret())
            .append_pair("limit", "1");

        let parsed: Response = self.http.get(url).send()?.error_for_status()?.json()?;
        let point = parsed
            .features
            .into_iter()
            .next()
            .and_then(|feature| feature.center)
            .and_then(|center| match center.as_slice() {
                [lng, lat, ..] => Some(GeoPoint {
                    lat: *lat,
                    lng: *lng,
                }),
                _ => None,
            });
        Ok(point)
    }
}
