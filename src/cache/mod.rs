//! Tiered resource cache with generation-based invalidation.
//!
//! A static tier is populated once at install time from a fixed manifest;
//! a dynamic tier is opportunistically refreshed on every successful fetch
//! (write-through).
//! Tiers are named after their generation identifier; rotating a generation
//! and activating deletes every tier that no longer matches — the sole
//! eviction path for the static tier.
//!
//! Per-request policy is a deterministic lookup, not a hierarchy:
//!
//! | request                    | policy        |
//! |----------------------------|---------------|
//! | non-GET                    | pass-through  |
//! | GET in the static manifest | cache-first   |
//! | any other GET              | network-first |
//!
//! With identical (method, URL, cache state) the outcome is fully
//! determined: no randomness, no TTL expiry beyond generation rotation.

pub mod fetcher;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use self::fetcher::{FetchedResponse, Fetcher};

/// Body served when neither network nor cache can satisfy a request.
pub const OFFLINE_BODY: &str = "离线模式 - 内容不可用";

/// Status of the synthetic unavailable response.
pub const OFFLINE_STATUS: u16 = 503;

/// Fixed manifest of statically cached resources plus the generation
/// identifiers. Both identifiers must change whenever the manifest or the
/// API contract changes, forcing a rotation.
#[derive(Debug, Clone)]
pub struct CacheManifest {
    pub static_generation: String,
    pub dynamic_generation: String,
    /// URL paths served cache-first (e.g. `/index.html`).
    pub static_assets: Vec<String>,
}

impl CacheManifest {
    /// Whether a URL path belongs to the static manifest.
    #[must_use]
    pub fn is_static_asset(&self, url: &str) -> bool {
        let path = url_path(url);
        self.static_assets.iter().any(|a| a == path)
    }
}

/// Lifecycle of a cache generation pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Static tier not yet (fully) populated; requests bypass the tiers.
    Installing,
    /// Tiers populated and serving.
    Active,
    /// Replaced by a newer generation; no longer serving.
    Superseded,
}

/// How a request class is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPolicy {
    CacheFirst,
    NetworkFirst,
    PassThrough,
}

/// Where a response came from, for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    StaticCache,
    DynamicCache,
    Network,
    Synthetic,
}

/// A response served by the cache manager.
#[derive(Debug, Clone)]
pub struct CacheResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: bytes::Bytes,
    pub served_from: ServedFrom,
}

impl CacheResponse {
    fn from_network(response: FetchedResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            served_from: ServedFrom::Network,
        }
    }

    fn synthetic_unavailable() -> Self {
        Self {
            status: OFFLINE_STATUS,
            headers: Vec::new(),
            body: bytes::Bytes::from_static(OFFLINE_BODY.as_bytes()),
            served_from: ServedFrom::Synthetic,
        }
    }

    /// Whether the response carries a success status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One cached response.
#[derive(Debug, Clone)]
struct CacheEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body: bytes::Bytes,
    #[allow(dead_code)]
    stored_at: DateTime<Utc>,
}

impl CacheEntry {
    fn from_response(response: &FetchedResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: Utc::now(),
        }
    }

    fn to_response(&self, served_from: ServedFrom) -> CacheResponse {
        CacheResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            served_from,
        }
    }
}

/// A named cache partition; the key is `GET <url-path>`.
#[derive(Default)]
struct CacheTier {
    entries: DashMap<String, CacheEntry>,
}

/// Errors raised by install/activate transitions.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A manifest resource could not be fetched; nothing was installed.
    #[error("install failed for {url}: {message}")]
    InstallFailed { url: String, message: String },
}

/// Tiered cache manager fronting all network fetches.
pub struct ResourceCache {
    manifest: CacheManifest,
    fetcher: Arc<dyn Fetcher>,
    base_url: String,
    /// Tiers keyed by generation identifier.
    generations: DashMap<String, Arc<CacheTier>>,
    /// Install/activate hold this for writing; every fetch holds it for
    /// reading, so no request is ever served from a mid-installation tier.
    state: RwLock<CacheState>,
}

impl ResourceCache {
    /// Create a cache manager in the `Installing` state.
    ///
    /// `base_url` is prepended to manifest paths when installing.
    #[must_use]
    pub fn new(manifest: CacheManifest, fetcher: Arc<dyn Fetcher>, base_url: impl Into<String>) -> Self {
        Self {
            manifest,
            fetcher,
            base_url: base_url.into(),
            generations: DashMap::new(),
            state: RwLock::new(CacheState::Installing),
        }
    }

    /// Populate the static tier from the manifest. All-or-nothing: a single
    /// failed fetch aborts the installation and leaves no partial tier.
    pub async fn install(&self) -> Result<(), CacheError> {
        let _barrier = self.state.write().await;

        let staged = CacheTier::default();
        for path in &self.manifest.static_assets {
            let url = format!("{}{}", self.base_url, path);
            match self.fetcher.fetch("GET", &url).await {
                Ok(response) if response.is_success() => {
                    staged
                        .entries
                        .insert(request_key("GET", path), CacheEntry::from_response(&response));
                }
                Ok(response) => {
                    return Err(CacheError::InstallFailed {
                        url,
                        message: format!("status {}", response.status),
                    });
                }
                Err(e) => {
                    return Err(CacheError::InstallFailed {
                        url,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            generation = %self.manifest.static_generation,
            assets = staged.entries.len(),
            "static tier installed"
        );
        self.generations
            .insert(self.manifest.static_generation.clone(), Arc::new(staged));
        self.generations
            .entry(self.manifest.dynamic_generation.clone())
            .or_default();
        Ok(())
    }

    /// Activate the current generations, deleting every tier whose name
    /// matches neither identifier. This is the only static-tier eviction.
    pub async fn activate(&self) {
        let mut state = self.state.write().await;

        self.generations.retain(|name, _| {
            let keep =
                *name == self.manifest.static_generation || *name == self.manifest.dynamic_generation;
            if !keep {
                debug!(generation = %name, "deleting superseded cache generation");
            }
            keep
        });
        *state = CacheState::Active;
    }

    /// Mark this generation pair as replaced; it stops serving from tiers.
    pub async fn retire(&self) {
        let mut state = self.state.write().await;
        *state = CacheState::Superseded;
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> CacheState {
        *self.state.read().await
    }

    /// Policy for one request. Deterministic in (method, URL).
    #[must_use]
    pub fn policy(&self, method: &str, url: &str) -> FetchPolicy {
        if !method.eq_ignore_ascii_case("GET") {
            FetchPolicy::PassThrough
        } else if self.manifest.is_static_asset(url) {
            FetchPolicy::CacheFirst
        } else {
            // API resources and everything else: freshest copy wins.
            FetchPolicy::NetworkFirst
        }
    }

    /// Serve one request according to its policy.
    ///
    /// Never returns an error: when both network and cache fail the caller
    /// receives the synthetic unavailable response and degrades gracefully.
    pub async fn fetch(&self, method: &str, url: &str) -> CacheResponse {
        let state = self.state.read().await;

        // A superseded generation no longer serves or refreshes its tiers.
        if *state == CacheState::Superseded {
            return self.pass_through(method, url).await;
        }

        match self.policy(method, url) {
            FetchPolicy::PassThrough => self.pass_through(method, url).await,
            FetchPolicy::CacheFirst => self.cache_first(url).await,
            FetchPolicy::NetworkFirst => self.network_first(url).await,
        }
    }

    async fn pass_through(&self, method: &str, url: &str) -> CacheResponse {
        match self.fetcher.fetch(method, url).await {
            Ok(response) => CacheResponse::from_network(response),
            Err(e) => {
                warn!(url = %url, error = %e, "pass-through fetch failed");
                CacheResponse::synthetic_unavailable()
            }
        }
    }

    async fn cache_first(&self, url: &str) -> CacheResponse {
        if let Some(hit) = self.lookup(url) {
            return hit;
        }

        match self.fetcher.fetch("GET", url).await {
            Ok(response) => {
                self.write_through(url, &response);
                CacheResponse::from_network(response)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "cache-first fetch failed with no cached copy");
                CacheResponse::synthetic_unavailable()
            }
        }
    }

    async fn network_first(&self, url: &str) -> CacheResponse {
        match self.fetcher.fetch("GET", url).await {
            Ok(response) => {
                self.write_through(url, &response);
                CacheResponse::from_network(response)
            }
            Err(e) => {
                debug!(url = %url, error = %e, "network-first fetch failed, trying cache");
                self.lookup(url)
                    .unwrap_or_else(CacheResponse::synthetic_unavailable)
            }
        }
    }

    /// Look a URL up across tiers, static before dynamic.
    fn lookup(&self, url: &str) -> Option<CacheResponse> {
        let key = request_key("GET", url_path(url));

        if let Some(tier) = self.generations.get(&self.manifest.static_generation)
            && let Some(entry) = tier.entries.get(&key)
        {
            return Some(entry.to_response(ServedFrom::StaticCache));
        }
        if let Some(tier) = self.generations.get(&self.manifest.dynamic_generation)
            && let Some(entry) = tier.entries.get(&key)
        {
            return Some(entry.to_response(ServedFrom::DynamicCache));
        }
        None
    }

    /// Replace the dynamic-tier copy on every successful fetch.
    fn write_through(&self, url: &str, response: &FetchedResponse) {
        if !response.is_success() {
            return;
        }
        let tier = self
            .generations
            .entry(self.manifest.dynamic_generation.clone())
            .or_default()
            .clone();
        tier.entries.insert(
            request_key("GET", url_path(url)),
            CacheEntry::from_response(response),
        );
    }
}

/// Normalized request identity: method + URL path, GET-only tiers.
fn request_key(method: &str, path: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), path)
}

/// Strip scheme and authority from a URL, leaving the path (+query).
fn url_path(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => return url,
    };
    match rest.find('/') {
        Some(pos) => &rest[pos..],
        None => "/",
    }
}
