// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Secret resolution and slot filling (C3).
//!
//! [`Vault::fetch_secret`] tries a remote KV v2 store first, then two
//! environment-variable fallbacks, caching whatever it finds for 30
//! seconds. [`Vault::resolve_slots`] is the entry point `eyeflow-vm` calls
//! before dispatching a `CALL_SERVICE` instruction whose operands name
//! vault slots. Grounded on this workspace's `Backend` trait
//! (`abp-backend-core/src/lib.rs`) for the async-trait shape, and on its
//! config crate's environment-override convention
//! (`abp-config/src/lib.rs`) for the env-var fallback.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyeflow_core::{EyeflowError, VaultSlot};

/// Duration a resolved secret stays in the in-memory cache before a fresh
/// fetch is required ("Caches values for 30 s").
pub const CACHE_TTL: Duration = Duration::from_secs(30);

/// A remote secret backend, e.g. a vault KV v2 mount reached over HTTP.
///
/// Implementors only need to answer "is this path present, and what is
/// its value" — caching, env fallback, and slot filling all live in
/// [`Vault`] itself so every remote implementation gets them for free.
#[async_trait]
pub trait RemoteVault: Send + Sync {
    /// Fetch `path` from the remote store. `Ok(None)` means the path is
    /// absent (not an error); `Err` means the remote call itself failed.
    async fn fetch(&self, path: &str) -> Result<Option<String>, EyeflowError>;
}

#[derive(Clone)]
struct CacheEntry {
    value: String,
    cached_at: Instant,
}

/// Resolves secrets by path, in order: remote
/// vault, then `VAULT_SECRET_<UPPER_SNAKE(path)>`, then
/// `path.to_uppercase()`.
pub struct Vault {
    remote: Option<Box<dyn RemoteVault>>,
    cache: Mutex<BTreeMap<String, CacheEntry>>,
}

impl Vault {
    /// Construct a vault with no remote backend — only the env-var
    /// fallbacks will ever resolve.
    #[must_use]
    pub fn new() -> Self {
        Self {
            remote: None,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Construct a vault backed by a remote KV store.
    #[must_use]
    pub fn with_remote(remote: Box<dyn RemoteVault>) -> Self {
        Self {
            remote: Some(remote),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// A vault with no remote backend — every resolution falls through to
    /// the env-var fallbacks. Equivalent to [`Vault::new`]; named to match
    /// the cancellation bus's own `degraded` constructor for callers
    /// assembling a VM with no reachable platform services.
    #[must_use]
    pub fn degraded() -> Self {
        Self::new()
    }

    /// Resolve `path` to a secret value.
    ///
    /// Resolution order: (1) the cache, if still fresh; (2) the remote
    /// vault, if configured; (3) `VAULT_SECRET_<UPPER_SNAKE(path)>`; (4)
    /// `path` upper-cased directly. The first source to produce a value
    /// wins and is cached.
    ///
    /// # Errors
    ///
    /// Returns [`EyeflowError::Vault`] if none of the above resolves
    /// `path`, or if the remote vault call itself errors.
    pub async fn fetch_secret(&self, path: &str) -> Result<String, EyeflowError> {
        if let Some(cached) = self.cached(path) {
            return Ok(cached);
        }

        if let Some(remote) = &self.remote {
            if let Some(value) = remote.fetch(path).await? {
                self.insert(path, &value);
                return Ok(value);
            }
        }

        let mapped_key = format!("VAULT_SECRET_{}", upper_snake(path));
        if let Ok(value) = std::env::var(&mapped_key) {
            self.insert(path, &value);
            return Ok(value);
        }

        let direct_key = path.to_uppercase();
        if let Ok(value) = std::env::var(&direct_key) {
            self.insert(path, &value);
            return Ok(value);
        }

        Err(EyeflowError::Vault {
            path: path.to_string(),
            message: "secret not found in remote vault or environment".to_string(),
        })
    }

    /// Fill every slot in `slots`, returning a map from `slot_id` to
    /// resolved secret value, ready to splice into a `CALL_SERVICE`
    /// instruction's arguments before dispatch.
    ///
    /// # Errors
    ///
    /// Returns the first [`EyeflowError::Vault`] encountered; slots are
    /// resolved in order and resolution stops at the first failure.
    pub async fn resolve_slots(
        &self,
        slots: &[VaultSlot],
    ) -> Result<BTreeMap<String, String>, EyeflowError> {
        let mut resolved = BTreeMap::new();
        for slot in slots {
            let value = self.fetch_secret(&slot.vault_path).await?;
            resolved.insert(slot.slot_id.clone(), value);
        }
        Ok(resolved)
    }

    /// Drop every cached value. Called after every execution
    /// so a secret never outlives the run that needed it.
    pub fn clear_cache(&self) {
        self.cache.lock().expect("vault cache mutex poisoned").clear();
    }

    fn cached(&self, path: &str) -> Option<String> {
        let cache = self.cache.lock().expect("vault cache mutex poisoned");
        cache.get(path).and_then(|entry| {
            if entry.cached_at.elapsed() < CACHE_TTL {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    fn insert(&self, path: &str, value: &str) {
        let mut cache = self.cache.lock().expect("vault cache mutex poisoned");
        cache.insert(
            path.to_string(),
            CacheEntry {
                value: value.to_string(),
                cached_at: Instant::now(),
            },
        );
    }
}

impl Default for Vault {
    fn default() -> Self {
        Self::new()
    }
}

/// `"some.path-here"` -> `"SOME_PATH_HERE"`: upper-case, non-alphanumeric
/// runs collapsed to a single underscore.
fn upper_snake(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_sep = false;
    for ch in path.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}
