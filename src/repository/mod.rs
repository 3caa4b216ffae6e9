// src/repository/mod.rs

//! Catalog fetching
//!
//! This module provides functionality for:
//! - Reusing the cached catalog while it is fresh
//! - Fetching the catalog from a primary and an alternate mirror in turn
//! - Decoding gzip bodies and recording permanent redirects
//! - Coalescing concurrent fetches into a single network round

pub mod transport;

use crate::catalog::Catalog;
use crate::catalog::cache::CacheStore;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use transport::{FetchedBody, HttpTransport, Transport};

/// Network attempts per fetch before giving up
pub const MAX_ATTEMPTS: u32 = 4;

/// Which configured mirror a URL belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorRole {
    Primary,
    Alternate,
}

impl std::fmt::Display for MirrorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MirrorRole::Primary => write!(f, "primary"),
            MirrorRole::Alternate => write!(f, "alternate"),
        }
    }
}

/// A catalog source URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub role: MirrorRole,
    pub url: String,
}

/// A mirror URL replaced after a permanent redirect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub role: MirrorRole,
    pub from: String,
    pub to: String,
}

/// Where a fetched catalog came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    /// Catalog already held in memory
    Memory,
    /// Catalog read from the cache file
    Cache,
    /// Fresh network fetch
    Network { mirror: MirrorRole, attempts: u32 },
    /// Result of a fetch another caller had in flight
    Shared,
}

/// Result of `CatalogFetcher::fetch`
#[derive(Debug, Clone)]
pub struct CatalogFetch {
    pub catalog: Arc<Catalog>,
    pub origin: FetchOrigin,
    /// Mirror URLs that must be persisted to settings
    pub relocations: Vec<Relocation>,
}

#[derive(Debug)]
struct FetcherConfig {
    primary: String,
    alternate: Option<String>,
    update_interval: Duration,
}

impl FetcherConfig {
    /// Ordered source list walked by the round-robin cursor
    fn sources(&self) -> Vec<Mirror> {
        let mut sources = vec![Mirror {
            role: MirrorRole::Primary,
            url: self.primary.clone(),
        }];
        if let Some(alternate) = self.alternate.as_ref().filter(|u| !u.trim().is_empty()) {
            sources.push(Mirror {
                role: MirrorRole::Alternate,
                url: alternate.clone(),
            });
        }
        sources
    }
}

/// Outcome kept for callers that waited on an in-flight fetch
type SharedOutcome = std::result::Result<Arc<Catalog>, (u32, String)>;

#[derive(Debug, Default)]
struct FetchState {
    in_flight: bool,
    current: Option<Arc<Catalog>>,
    last_outcome: Option<SharedOutcome>,
}

/// Fetches the catalog from cache or mirrors
pub struct CatalogFetcher {
    transport: Arc<dyn Transport>,
    cache: CacheStore,
    config: Mutex<FetcherConfig>,
    state: Mutex<FetchState>,
    idle: Condvar,
}

impl std::fmt::Debug for CatalogFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogFetcher")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl CatalogFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: CacheStore,
        primary: String,
        alternate: Option<String>,
        update_interval: Duration,
    ) -> Self {
        Self {
            transport,
            cache,
            config: Mutex::new(FetcherConfig {
                primary,
                alternate,
                update_interval,
            }),
            state: Mutex::new(FetchState::default()),
            idle: Condvar::new(),
        }
    }

    /// Replace mirror URLs and the cache lifetime (e.g. after settings reload)
    pub fn configure(&self, primary: String, alternate: Option<String>, update_interval: Duration) {
        let mut config = self.lock_config();
        config.primary = primary;
        config.alternate = alternate;
        config.update_interval = update_interval;
    }

    /// Current source list, primary first
    pub fn mirrors(&self) -> Vec<Mirror> {
        self.lock_config().sources()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Catalog held in memory from the last successful fetch, if any
    pub fn current(&self) -> Option<Arc<Catalog>> {
        self.lock_state().current.clone()
    }

    fn lock_config(&self) -> MutexGuard<'_, FetcherConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, FetchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the catalog, from cache when fresh and `force` is false
    ///
    /// Only one fetch runs at a time. A caller that arrives while a fetch is
    /// in flight waits for it and receives its result instead of starting
    /// another one.
    pub fn fetch(&self, force: bool) -> Result<CatalogFetch> {
        debug!("Getting available packages{}", if force { " (forced)" } else { "" });

        let mut state = self.lock_state();
        if state.in_flight {
            debug!("Catalog fetch already in flight, waiting...");
            while state.in_flight {
                state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            return match state.last_outcome.clone() {
                Some(Ok(catalog)) => Ok(CatalogFetch {
                    catalog,
                    origin: FetchOrigin::Shared,
                    relocations: Vec::new(),
                }),
                Some(Err((attempts, last_error))) => Err(Error::CatalogUnavailable {
                    attempts,
                    last_error,
                }),
                None => Err(Error::CatalogUnavailable {
                    attempts: 0,
                    last_error: "concurrent fetch produced no result".to_string(),
                }),
            };
        }
        state.in_flight = true;
        drop(state);

        let guard = InFlight { fetcher: self };
        let result = self.fetch_exclusive(force);
        guard.finish(&result);
        result
    }

    fn fetch_exclusive(&self, force: bool) -> Result<CatalogFetch> {
        let update_interval = self.lock_config().update_interval;

        if !force && self.cache.is_valid(update_interval) {
            if let Some(catalog) = self.current() {
                debug!("Using in-memory catalog '{}'", catalog.name());
                return Ok(CatalogFetch {
                    catalog,
                    origin: FetchOrigin::Memory,
                    relocations: Vec::new(),
                });
            }
            if let Some(snapshot) = self.cache.load() {
                return Ok(CatalogFetch {
                    catalog: Arc::new(snapshot.catalog),
                    origin: FetchOrigin::Cache,
                    relocations: Vec::new(),
                });
            }
        }

        self.fetch_network()
    }

    /// Walk the mirrors round-robin for up to `MAX_ATTEMPTS` tries
    fn fetch_network(&self) -> Result<CatalogFetch> {
        let sources = self.mirrors();
        let mut cursor = 0;
        let mut last_error = String::from("no mirrors configured");

        for attempt in 1..=MAX_ATTEMPTS {
            let mirror = &sources[cursor];
            info!(
                "Fetching package list from {} mirror {} (attempt {}/{})",
                mirror.role, mirror.url, attempt, MAX_ATTEMPTS
            );

            match self.fetch_from(mirror) {
                Ok((catalog, relocation)) => {
                    return Ok(self.accept(catalog, mirror, relocation, attempt));
                }
                Err(e) => {
                    warn!(
                        "Catalog fetch attempt {} from {} failed: {}",
                        attempt, mirror.url, e
                    );
                    last_error = e.to_string();
                    cursor = (cursor + 1) % sources.len();
                }
            }
        }

        Err(Error::CatalogUnavailable {
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }

    /// One GET against one mirror
    fn fetch_from(&self, mirror: &Mirror) -> Result<(Catalog, Option<Relocation>)> {
        let fetched = self.transport.get(&mirror.url)?;
        let body = decode_body(fetched.body, fetched.content_encoding.as_deref())?;

        let relocation = fetched
            .permanent_redirect
            .filter(|to| *to != mirror.url)
            .map(|to| Relocation {
                role: mirror.role,
                from: mirror.url.clone(),
                to,
            });

        let source = relocation.as_ref().map_or(mirror.url.as_str(), |r| r.to.as_str());
        let parsed = Catalog::parse(&body, source)?;
        if parsed.skipped > 0 {
            warn!("{} malformed catalog entries skipped", parsed.skipped);
        }

        Ok((parsed.catalog, relocation))
    }

    /// Record a successful network fetch
    fn accept(
        &self,
        catalog: Catalog,
        mirror: &Mirror,
        relocation: Option<Relocation>,
        attempts: u32,
    ) -> CatalogFetch {
        info!(
            "Package list loaded from '{}' ({} packages)",
            catalog.name(),
            catalog.len()
        );

        if let Some(relocation) = &relocation {
            info!(
                "Request permanently redirected. Changing {} repository url to: {}",
                relocation.role, relocation.to
            );
            let mut config = self.lock_config();
            match relocation.role {
                MirrorRole::Primary => config.primary = relocation.to.clone(),
                MirrorRole::Alternate => config.alternate = Some(relocation.to.clone()),
            }
        }

        if let Err(e) = self.cache.save(&catalog) {
            warn!("Failed to write catalog cache: {}", e);
        }

        CatalogFetch {
            catalog: Arc::new(catalog),
            origin: FetchOrigin::Network {
                mirror: mirror.role,
                attempts,
            },
            relocations: relocation.into_iter().collect(),
        }
    }
}

/// Clears the in-flight flag and wakes waiters, even on panic
struct InFlight<'a> {
    fetcher: &'a CatalogFetcher,
}

impl InFlight<'_> {
    fn finish(self, result: &Result<CatalogFetch>) {
        let outcome = match result {
            Ok(fetch) => Ok(fetch.catalog.clone()),
            Err(Error::CatalogUnavailable {
                attempts,
                last_error,
            }) => Err((*attempts, last_error.clone())),
            Err(e) => Err((0, e.to_string())),
        };

        let mut state = self.fetcher.lock_state();
        if let Ok(catalog) = &outcome {
            state.current = Some(catalog.clone());
        }
        state.last_outcome = Some(outcome);
        drop(state);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.fetcher.lock_state().in_flight = false;
        self.fetcher.idle.notify_all();
    }
}

/// Undo the declared content encoding
fn decode_body(body: Vec<u8>, encoding: Option<&str>) -> Result<Vec<u8>> {
    match encoding.map(str::trim) {
        None | Some("") => Ok(body),
        Some(enc) if enc.eq_ignore_ascii_case("identity") => Ok(body),
        Some(enc) if enc.eq_ignore_ascii_case("gzip") || enc.eq_ignore_ascii_case("x-gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(body.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|e| Error::ParseError(format!("Failed to decompress gzip body: {}", e)))?;
            Ok(decoded)
        }
        Some(enc) => Err(Error::DownloadError(format!(
            "Unsupported content encoding '{}'",
            enc
        ))),
    }
}
