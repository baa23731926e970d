use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::domain::AssetName;
use crate::error::ScrnaseqError;
use crate::fs_util::{fs_error, remove_dir_if_exists, symlink_file};
use crate::store::Store;
use crate::transfer::{UploadFile, UploadListing, UploadOptions, prepare_directory_upload, run_concurrently};

const MANIFEST_FILE: &str = "..manifest";
const COMPLETE_MARKER: &str = "..complete";

pub trait GypsumClient: Send + Sync {
    fn store(&self) -> &Store;

    fn save_version(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        overwrite: bool,
    ) -> Result<Utf8PathBuf, ScrnaseqError>;

    fn save_file(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        path: &str,
        overwrite: bool,
    ) -> Result<Utf8PathBuf, ScrnaseqError>;

    fn list_versions(
        &self,
        package: &AssetName,
        name: &AssetName,
    ) -> Result<Vec<String>, ScrnaseqError>;

    fn fetch_latest(&self, package: &AssetName, name: &AssetName)
    -> Result<String, ScrnaseqError>;

    fn fetch_metadata_schema(&self, overwrite: bool) -> Result<Value, ScrnaseqError>;

    fn fetch_metadata_database(&self, overwrite: bool) -> Result<Utf8PathBuf, ScrnaseqError>;

    /// Returns `false` when some files failed and the session was left open.
    fn upload_directory(
        &self,
        directory: &Path,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        options: &UploadOptions,
    ) -> Result<bool, ScrnaseqError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub md5sum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LinkTarget {
    pub project: String,
    pub asset: String,
    pub version: String,
    pub path: String,
    /// Original file when the link points at another link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor: Option<Box<LinkTarget>>,
}

impl LinkTarget {
    fn origin(&self) -> &LinkTarget {
        match &self.ancestor {
            Some(ancestor) => ancestor.origin(),
            None => self,
        }
    }
}

pub type Manifest = BTreeMap<String, ManifestEntry>;

#[derive(Debug, Deserialize)]
struct LatestVersion {
    version: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct DatabaseStamp {
    modified: i64,
    checked_at: i64,
}

#[derive(Debug, Deserialize)]
struct UploadSession {
    file_urls: Vec<FileUrl>,
    complete_url: String,
    abort_url: String,
    session_token: String,
}

#[derive(Debug, Deserialize)]
struct FileUrl {
    path: String,
    url: String,
    method: String,
}

#[derive(Debug, Deserialize)]
struct PresignedUrl {
    url: String,
}

pub struct GypsumHttpClient {
    client: Client,
    store: Store,
    rest_url: String,
    schema_url: String,
    database_url: String,
    database_modified_url: String,
    check_interval: chrono::Duration,
    token: Option<String>,
}

impl GypsumHttpClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ScrnaseqError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("scrnaseq-rs/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ScrnaseqError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| ScrnaseqError::Http(err.to_string()))?;

        let interval = i64::try_from(config.database_check_interval_secs).unwrap_or(i64::MAX);
        Ok(Self {
            client,
            store: Store::new_with_root(config.cache_root()?),
            rest_url: config.rest_url.trim_end_matches('/').to_string(),
            schema_url: config.schema_url.clone(),
            database_url: config.database_url.clone(),
            database_modified_url: config.database_modified_url.clone(),
            check_interval: chrono::Duration::try_seconds(interval)
                .unwrap_or(chrono::Duration::MAX),
            token: config.token.clone(),
        })
    }

    fn file_url(&self, key: &str) -> String {
        format!("{}/file/{}", self.rest_url, encode_key(key))
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.rest_url, url)
        }
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, ScrnaseqError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(ScrnaseqError::Http(err.to_string()));
                }
            }
        }
    }

    fn get(&self, url: &str, what: &str) -> Result<Response, ScrnaseqError> {
        let response = self.send_with_retries(|| self.client.get(url))?;
        check_status(response, what)
    }

    fn download(&self, key: &str, destination: &Utf8Path) -> Result<(), ScrnaseqError> {
        debug!(key, "downloading file");
        let mut response = self.get(&self.file_url(key), key)?;
        let parent = destination
            .parent()
            .ok_or_else(|| ScrnaseqError::Filesystem(format!("invalid destination {destination}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| fs_error(parent.as_std_path(), err))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".scrnaseq-download")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
        io::copy(&mut response, &mut temp).map_err(|err| ScrnaseqError::Http(err.to_string()))?;
        temp.persist(destination.as_std_path())
            .map_err(|err| ScrnaseqError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn manifest(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        refresh: bool,
    ) -> Result<Manifest, ScrnaseqError> {
        let cached = self
            .store
            .version_dir(package, name, version)
            .join(MANIFEST_FILE);
        if !refresh && cached.exists() {
            return Store::read_json(&cached);
        }
        let key = format!("{package}/{name}/{version}/{MANIFEST_FILE}");
        let bytes = self
            .get(&self.file_url(&key), &format!("{package}/{name}/{version}"))?
            .bytes()
            .map_err(|err| ScrnaseqError::Http(err.to_string()))?;
        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|err| ScrnaseqError::Json(err.to_string()))?;
        Store::write_bytes_atomic(&cached, &bytes)?;
        Ok(manifest)
    }

    /// Places one manifest entry at `destination`, as a symlink into the
    /// linked version when the entry is a link.
    fn materialize(
        &self,
        key: &str,
        entry: &ManifestEntry,
        destination: &Utf8Path,
    ) -> Result<(), ScrnaseqError> {
        let Some(link) = &entry.link else {
            return self.download(key, destination);
        };
        let origin = link.origin();
        let source = self.save_file(
            &origin.project.parse()?,
            &origin.asset.parse()?,
            &origin.version.parse()?,
            &origin.path,
            false,
        )?;
        debug!(key, source = %source, "linking file from another version");
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| fs_error(parent.as_std_path(), err))?;
        }
        remove_dir_if_exists(destination.as_std_path())?;
        symlink_file(source.as_std_path(), destination.as_std_path())
            .map_err(|err| fs_error(destination.as_std_path(), err))
    }

    fn fetch_database_modified(&self) -> Result<i64, ScrnaseqError> {
        let text = self
            .get(&self.database_modified_url, &self.database_modified_url)?
            .text()
            .map_err(|err| ScrnaseqError::Http(err.to_string()))?;
        text.trim().parse().map_err(|_| {
            ScrnaseqError::Http(format!("invalid modification stamp '{}'", text.trim()))
        })
    }

    fn start_upload(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        listing: &UploadListing,
        options: &UploadOptions,
        token: &str,
    ) -> Result<UploadSession, ScrnaseqError> {
        let file_type = if options.deduplicate { "dedup" } else { "simple" };
        let mut files = listing
            .files
            .iter()
            .map(|file| {
                json!({
                    "type": file_type,
                    "path": file.path,
                    "md5sum": file.md5sum,
                    "size": file.size,
                })
            })
            .collect::<Vec<_>>();
        files.extend(listing.links.iter().map(|link| {
            json!({
                "type": "link",
                "path": link.path,
                "link": {
                    "project": link.target.package,
                    "asset": link.target.name,
                    "version": link.target.version,
                    "path": link.target.path,
                },
            })
        }));

        let url = format!(
            "{}/upload/start/{}/{}/{}",
            self.rest_url,
            encode_key(package.as_str()),
            encode_key(name.as_str()),
            encode_key(version.as_str())
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "files": files, "on_probation": options.probation }))
            .send()
            .map_err(|err| ScrnaseqError::Upload(err.to_string()))?;
        check_status(response, &format!("{package}/{name}/{version}"))?
            .json()
            .map_err(|err| ScrnaseqError::Upload(err.to_string()))
    }

    fn upload_file(
        &self,
        target: &FileUrl,
        file: &UploadFile,
        session_token: &str,
    ) -> Result<(), ScrnaseqError> {
        if target.method != "presigned" {
            return Err(ScrnaseqError::Upload(format!(
                "unsupported upload method '{}' for {}",
                target.method, target.path
            )));
        }
        let response = self
            .client
            .post(self.absolute_url(&target.url))
            .bearer_auth(session_token)
            .json(&json!({ "md5sum": file.md5sum }))
            .send()
            .map_err(|err| ScrnaseqError::Upload(err.to_string()))?;
        let presigned: PresignedUrl = check_status(response, &file.path)?
            .json()
            .map_err(|err| ScrnaseqError::Upload(err.to_string()))?;

        let body = fs::read(&file.source).map_err(|err| fs_error(&file.source, err))?;
        let response = self
            .client
            .put(&presigned.url)
            .body(body)
            .send()
            .map_err(|err| ScrnaseqError::Upload(format!("{}: {err}", file.path)))?;
        check_status(response, &file.path)?;
        debug!(path = %file.path, size = file.size, "uploaded file");
        Ok(())
    }

    fn close_session(&self, url: &str, session_token: &str) -> Result<(), ScrnaseqError> {
        let response = self
            .client
            .post(self.absolute_url(url))
            .bearer_auth(session_token)
            .send()
            .map_err(|err| ScrnaseqError::Upload(err.to_string()))?;
        check_status(response, url)?;
        Ok(())
    }
}

impl GypsumClient for GypsumHttpClient {
    fn store(&self) -> &Store {
        &self.store
    }

    fn save_version(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        overwrite: bool,
    ) -> Result<Utf8PathBuf, ScrnaseqError> {
        let dir = self.store.version_dir(package, name, version);
        let marker = dir.join(COMPLETE_MARKER);
        if !overwrite && marker.exists() {
            debug!(dir = %dir, "using cached version");
            return Ok(dir);
        }

        let manifest = self.manifest(package, name, version, true)?;
        info!(
            version = %format!("{package}/{name}/{version}"),
            files = manifest.len(),
            "downloading dataset version"
        );
        for (path, entry) in &manifest {
            let destination = checked_join(&dir, path)?;
            if !overwrite && destination.exists() {
                continue;
            }
            self.materialize(&format!("{package}/{name}/{version}/{path}"), entry, &destination)?;
        }
        Store::write_bytes_atomic(&marker, b"")?;
        Ok(dir)
    }

    fn save_file(
        &self,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        path: &str,
        overwrite: bool,
    ) -> Result<Utf8PathBuf, ScrnaseqError> {
        let dir = self.store.version_dir(package, name, version);
        let destination = checked_join(&dir, path)?;
        if !overwrite && destination.exists() {
            return Ok(destination);
        }
        let manifest = self.manifest(package, name, version, overwrite)?;
        let key = format!("{package}/{name}/{version}/{path}");
        let entry = manifest
            .get(path)
            .ok_or_else(|| ScrnaseqError::NotFound(key.clone()))?;
        self.materialize(&key, entry, &destination)?;
        Ok(destination)
    }

    fn list_versions(
        &self,
        package: &AssetName,
        name: &AssetName,
    ) -> Result<Vec<String>, ScrnaseqError> {
        let prefix = format!("{package}/{name}/");
        let url = format!("{}/list", self.rest_url);
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("prefix", prefix.as_str()), ("recursive", "false")])
        })?;
        let listing: Vec<String> = check_status(response, &prefix)?
            .json()
            .map_err(|err| ScrnaseqError::Json(err.to_string()))?;
        Ok(listing
            .iter()
            .filter_map(|entry| {
                let version = entry
                    .strip_prefix(&prefix)
                    .unwrap_or(entry)
                    .trim_end_matches('/');
                (!version.is_empty() && !version.starts_with("..")).then(|| version.to_string())
            })
            .collect())
    }

    fn fetch_latest(
        &self,
        package: &AssetName,
        name: &AssetName,
    ) -> Result<String, ScrnaseqError> {
        let key = format!("{package}/{name}/..latest");
        let latest: LatestVersion = self
            .get(&self.file_url(&key), &format!("{package}/{name}"))?
            .json()
            .map_err(|err| ScrnaseqError::Json(err.to_string()))?;
        Ok(latest.version)
    }

    fn fetch_metadata_schema(&self, overwrite: bool) -> Result<Value, ScrnaseqError> {
        let path = self.store.schema_path();
        if !overwrite && path.exists() {
            return Store::read_json(&path);
        }
        info!(url = %self.schema_url, "downloading metadata schema");
        let bytes = self
            .get(&self.schema_url, &self.schema_url)?
            .bytes()
            .map_err(|err| ScrnaseqError::Http(err.to_string()))?;
        let schema: Value =
            serde_json::from_slice(&bytes).map_err(|err| ScrnaseqError::Json(err.to_string()))?;
        Store::write_bytes_atomic(&path, &bytes)?;
        Ok(schema)
    }

    fn fetch_metadata_database(&self, overwrite: bool) -> Result<Utf8PathBuf, ScrnaseqError> {
        let path = self.store.database_path();
        let stamp_path = self.store.database_stamp_path();
        let now = chrono::Utc::now();

        let stamp = if !overwrite && path.exists() && stamp_path.exists() {
            Store::read_json::<DatabaseStamp>(&stamp_path).ok()
        } else {
            None
        };

        if let Some(stamp) = &stamp {
            let checked_at = chrono::DateTime::from_timestamp(stamp.checked_at, 0);
            if checked_at.is_some_and(|checked_at| now - checked_at < self.check_interval) {
                debug!("metadata database checked recently");
                return Ok(path);
            }
        }

        let modified = self.fetch_database_modified()?;
        if let Some(stamp) = stamp
            && modified <= stamp.modified
        {
            debug!(modified, "metadata database is up to date");
            Store::write_json_atomic(
                &stamp_path,
                &DatabaseStamp {
                    modified: stamp.modified,
                    checked_at: now.timestamp(),
                },
            )?;
            return Ok(path);
        }

        info!(url = %self.database_url, "downloading metadata database");
        let bytes = self
            .get(&self.database_url, &self.database_url)?
            .bytes()
            .map_err(|err| ScrnaseqError::Http(err.to_string()))?;
        Store::write_bytes_atomic(&path, &bytes)?;
        Store::write_json_atomic(
            &stamp_path,
            &DatabaseStamp {
                modified,
                checked_at: now.timestamp(),
            },
        )?;
        Ok(path)
    }

    fn upload_directory(
        &self,
        directory: &Path,
        package: &AssetName,
        name: &AssetName,
        version: &AssetName,
        options: &UploadOptions,
    ) -> Result<bool, ScrnaseqError> {
        let token = options
            .token
            .clone()
            .or_else(|| self.token.clone())
            .ok_or_else(|| {
                ScrnaseqError::Upload("a GitHub access token is required to upload".to_string())
            })?;

        let listing = prepare_directory_upload(directory, self.store.cache_root(), options.links)?;
        info!(
            version = %format!("{package}/{name}/{version}"),
            files = listing.files.len(),
            links = listing.links.len(),
            "starting upload"
        );
        let session = self.start_upload(package, name, version, &listing, options, &token)?;

        let by_path: HashMap<&str, &UploadFile> = listing
            .files
            .iter()
            .map(|file| (file.path.as_str(), file))
            .collect();
        let failures = run_concurrently(
            &session.file_urls,
            options.concurrent,
            options.abort_failed,
            |target| {
                let file = by_path.get(target.path.as_str()).ok_or_else(|| {
                    ScrnaseqError::Upload(format!("unexpected upload target {}", target.path))
                })?;
                self.upload_file(target, file, &session.session_token)
            },
        );

        if !failures.is_empty() {
            if options.abort_failed {
                if let Err(err) = self.close_session(&session.abort_url, &session.session_token) {
                    warn!(error = %err, "failed to abort upload session");
                }
                let mut failures = failures;
                let first = failures.swap_remove(0);
                warn!(error = %first, "upload aborted");
                return Err(first);
            }
            for err in &failures {
                warn!(error = %err, "file upload failed");
            }
            warn!(
                failed = failures.len(),
                "upload session left open after failures"
            );
            return Ok(false);
        }

        self.close_session(&session.complete_url, &session.session_token)?;
        info!(version = %format!("{package}/{name}/{version}"), "upload complete");
        Ok(true)
    }
}

fn check_status(response: Response, what: &str) -> Result<Response, ScrnaseqError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ScrnaseqError::NotFound(what.to_string()));
    }
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| value.get("reason").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        return Err(ScrnaseqError::HttpStatus {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}

fn encode_key(key: &str) -> String {
    url::form_urlencoded::byte_serialize(key.as_bytes()).collect()
}

fn checked_join(dir: &Utf8Path, path: &str) -> Result<Utf8PathBuf, ScrnaseqError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(ScrnaseqError::Validation(format!("invalid file path '{path}'")));
    }
    Ok(dir.join(path))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
