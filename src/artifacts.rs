use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

/// Object storage for the feature collection artifact, addressed by a fixed
/// bucket and key. `get` returns `None` when the object does not exist yet.
pub trait ArtifactStore: Send + Sync {
    fn get(&self) -> AppResult<Option<Vec<u8>>>;
    fn put(&self, body: &[u8]) -> AppResult<()>;
    fn describe(&self) -> String;
}

pub fn from_config(config: &AppConfig) -> AppResult<Box<dyn ArtifactStore>> {
    match &config.artifact_endpoint {
        Some(endpoint) => Ok(Box::new(HttpArtifactStore::new(
            endpoint,
            &config.geojson_bucket,
            &config.geojson_key,
            config.artifact_token.clone(),
            Duration::from_secs(config.geocoder_timeout_secs),
        )?)),
        None => Ok(Box::new(FileArtifactStore::new(
            &config.geojson_bucket,
            &config.geojson_key,
        ))),
    }
}

/// Bucket maps to a directory, key to a file inside it.
pub struct FileArtifactStore {
    path: PathBuf,
}

impl FileArtifactStore {
    pub fn new<P: AsRef<Path>>(bucket: P, key: &str) -> Self {
        Self {
            path: bucket.as_ref().join(key),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArtifactStore for FileArtifactStore {
    fn get(&self) -> AppResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    fn put(&self, body: &[u8]) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // readers only ever see a complete collection
        let staging = self.path.with_extension("partial");
        fs::write(&staging, body)?;
        fs::rename(&staging, &self.path)?;
        info!(
            target: "artifacts",
            path = %self.path.display(),
            bytes = body.len(),
            "feature collection written"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Path-style object store: `GET`/`PUT {endpoint}/{bucket}/{key}`.
pub struct HttpArtifactStore {
    http: Client,
    url: Url,
    key: String,
    token: Option<SecretString>,
}

impl HttpArtifactStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        key: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let mut url = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid artifact store endpoint: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| AppError::Config("artifact store endpoint cannot be a base".into()))?
            .pop_if_empty()
            .push(bucket)
            .extend(key.split('/'));
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url,
            key: key.to_string(),
            token,
        })
    }

    fn authorize(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

impl ArtifactStore for HttpArtifactStore {
    fn get(&self) -> AppResult<Option<Vec<u8>>> {
        let response = self.authorize(self.http.get(self.url.clone())).send()?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(target: "artifacts", url = %self.url, "artifact not found");
                Ok(None)
            }
            status if status.is_success() => Ok(Some(response.bytes()?.to_vec())),
            status => Err(AppError::Artifact {
                key: self.key.clone(),
                status: status.as_u16(),
            }),
        }
    }

    fn put(&self, body: &[u8]) -> AppResult<()> {
        let response = self
            .authorize(self.http.put(self.url.clone()))
            .header(reqwest::header::CONTENT_TYPE, "application/geo+json")
            .body(body.to_vec())
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Artifact {
                key: self.key.clone(),
                status: status.as_u16(),
            });
        }
        info!(
            target: "artifacts",
            url = %self.url,
            bytes = body.len(),
            "feature collection uploaded"
        );
        Ok(())
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}
