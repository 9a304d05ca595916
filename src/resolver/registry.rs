//! Package registry and release source clients
//!
//! Every query answers `Option`: network failures, timeouts, non-success
//! statuses and malformed bodies are all "no data" and only logged.

use super::marker::normalize_name;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Files and metadata of one published release
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseFiles {
    /// Distribution filenames
    pub filenames: Vec<String>,
    /// Declared runtime dependencies, `None` when the registry has no metadata
    pub requires_dist: Option<Vec<String>>,
    /// Declared interpreter constraint
    pub requires_python: Option<String>,
}

/// Downloadable asset attached to a release
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReleaseAsset {
    /// Asset filename
    pub name: String,
    /// Download URL
    #[serde(rename = "browser_download_url", default)]
    pub url: String,
}

/// Primary package registry
pub trait PackageIndex {
    /// Files of `name==version`
    fn release(&self, name: &str, version: &str) -> Option<ReleaseFiles>;
}

/// Secondary release source keyed by repository and tag
pub trait ReleaseSource {
    /// Assets of release `tag`; `None` when the release does not exist
    fn assets(&self, repository: &str, tag: &str) -> Option<Vec<ReleaseAsset>>;
}

/// Raw file access to a package's source tree
pub trait SourceMetadata {
    /// Contents of `path` at `git_ref`
    fn fetch(&self, repository: &str, git_ref: &str, path: &str) -> Option<String>;
}

/// HTTP client settings shared by the registry clients
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Whole-request timeout
    pub timeout: Duration,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Bearer token for the release source API
    pub token: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            token: None,
        }
    }
}

fn build_client(settings: &HttpSettings) -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.connect_timeout)
        .user_agent(concat!("servetune/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("HTTP client setup failed ({}), using defaults", e);
            reqwest::blocking::Client::new()
        })
}

/// GET `url`, logging and swallowing any failure
fn get(request: reqwest::blocking::RequestBuilder, url: &str) -> Option<reqwest::blocking::Response> {
    match request.send() {
        Ok(response) if response.status().is_success() => Some(response),
        Ok(response) => {
            tracing::debug!("GET {} -> {}", url, response.status());
            None
        }
        Err(e) => {
            tracing::debug!("GET {} failed: {}", url, e);
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct PypiRelease {
    info: PypiInfo,
    #[serde(default)]
    urls: Vec<PypiFile>,
}

#[derive(Debug, Deserialize)]
struct PypiInfo {
    #[serde(default)]
    requires_dist: Option<Vec<String>>,
    #[serde(default)]
    requires_python: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PypiFile {
    filename: String,
}

/// PyPI JSON API client
pub struct PypiClient {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl PypiClient {
    /// Client for the JSON API rooted at `base_url` (e.g. `https://pypi.org/pypi`)
    pub fn new(base_url: impl Into<String>, settings: &HttpSettings) -> Self {
        Self {
            client: build_client(settings),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl PackageIndex for PypiClient {
    fn release(&self, name: &str, version: &str) -> Option<ReleaseFiles> {
        let url = format!("{}/{}/{}/json", self.base_url, name, version);
        let response = get(self.client.get(&url), &url)?;
        let release: PypiRelease = response
            .json()
            .map_err(|e| tracing::debug!("Malformed registry response from {}: {}", url, e))
            .ok()?;

        Some(ReleaseFiles {
            filenames: release.urls.into_iter().map(|f| f.filename).collect(),
            requires_dist: release.info.requires_dist,
            requires_python: release
                .info
                .requires_python
                .filter(|s| !s.trim().is_empty()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

/// GitHub releases API and raw content client
pub struct GithubClient {
    client: reqwest::blocking::Client,
    api_url: String,
    raw_url: String,
    token: Option<String>,
}

impl GithubClient {
    /// Client for the REST API at `api_url` and raw files at `raw_url`
    pub fn new(api_url: impl Into<String>, raw_url: impl Into<String>, settings: &HttpSettings) -> Self {
        Self {
            client: build_client(settings),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            raw_url: raw_url.into().trim_end_matches('/').to_string(),
            token: settings.token.clone(),
        }
    }

    fn request(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl ReleaseSource for GithubClient {
    fn assets(&self, repository: &str, tag: &str) -> Option<Vec<ReleaseAsset>> {
        let url = format!("{}/repos/{}/releases/tags/{}", self.api_url, repository, tag);
        let response = get(
            self.request(&url).header("Accept", "application/vnd.github+json"),
            &url,
        )?;
        let release: GithubRelease = response
            .json()
            .map_err(|e| tracing::debug!("Malformed release response from {}: {}", url, e))
            .ok()?;
        Some(release.assets)
    }
}

impl SourceMetadata for GithubClient {
    fn fetch(&self, repository: &str, git_ref: &str, path: &str) -> Option<String> {
        let url = format!("{}/{}/{}/{}", self.raw_url, repository, git_ref, path);
        let response = get(self.request(&url), &url)?;
        response
            .text()
            .map_err(|e| tracing::debug!("Unreadable body from {}: {}", url, e))
            .ok()
    }
}

/// Registry, release source and source tree held in memory.
///
/// Used by tests and benchmarks, and handy for offline dry runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    releases: HashMap<(String, String), ReleaseFiles>,
    assets: HashMap<(String, String), Vec<ReleaseAsset>>,
    files: HashMap<(String, String, String), String>,
}

impl InMemoryRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `name==version` with `filenames` and no dependency metadata
    pub fn with_release<I, S>(mut self, name: &str, version: &str, filenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.releases.insert(
            (normalize_name(name), version.to_string()),
            ReleaseFiles {
                filenames: filenames.into_iter().map(Into::into).collect(),
                ..Default::default()
            },
        );
        self
    }

    /// Attach `requires_dist` to a published release
    pub fn with_requires_dist<I, S>(mut self, name: &str, version: &str, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self
            .releases
            .entry((normalize_name(name), version.to_string()))
            .or_default();
        entry.requires_dist = Some(requires.into_iter().map(Into::into).collect());
        self
    }

    /// Attach `requires_python` to a published release
    pub fn with_requires_python(mut self, name: &str, version: &str, spec: &str) -> Self {
        let entry = self
            .releases
            .entry((normalize_name(name), version.to_string()))
            .or_default();
        entry.requires_python = Some(spec.to_string());
        self
    }

    /// Publish release `tag` of `repository` with asset names
    pub fn with_assets<I, S>(mut self, repository: &str, tag: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let assets = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                ReleaseAsset {
                    url: format!("https://example.invalid/{}/{}/{}", repository, tag, name),
                    name,
                }
            })
            .collect();
        self.assets.insert((repository.to_string(), tag.to_string()), assets);
        self
    }

    /// Place a file in the source tree of `repository` at `git_ref`
    pub fn with_file(mut self, repository: &str, git_ref: &str, path: &str, contents: &str) -> Self {
        self.files.insert(
            (repository.to_string(), git_ref.to_string(), path.to_string()),
            contents.to_string(),
        );
        self
    }
}

impl PackageIndex for InMemoryRegistry {
    fn release(&self, name: &str, version: &str) -> Option<ReleaseFiles> {
        self.releases
            .get(&(normalize_name(name), version.to_string()))
            .cloned()
    }
}

impl ReleaseSource for InMemoryRegistry {
    fn assets(&self, repository: &str, tag: &str) -> Option<Vec<ReleaseAsset>> {
        self.assets
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
    }
}

impl SourceMetadata for InMemoryRegistry {
    fn fetch(&self, repository: &str, git_ref: &str, path: &str) -> Option<String> {
        self.files
            .get(&(repository.to_string(), git_ref.to_string(), path.to_string()))
            .cloned()
    }
}
