//! Context registry with single-flight hydration
//!
//! `get_or_create` is the only way a context comes into existence. A key
//! that is already live resolves immediately; a cold key triggers exactly
//! one call to the external hydrate collaborator no matter how many sockets
//! race for it, with latecomers awaiting the same shared future. The
//! registry lock guards only the two maps and is never held across the
//! hydrate call itself.
//!
//! A hydrate result is cached only on success. `None` ("no such store") and
//! errors resolve every current waiter and then vanish, so a later lookup
//! retries hydration from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use log::{debug, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::context::{spawn_context, ContextHandle, Hooks};
use crate::keys::GenParamService;

/// Error surfaced by the hydrate collaborator.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HydrateError(pub String);

/// Asynchronous loader for a context's initial state. `Ok(None)` means the
/// key names no store.
pub type HydrateFn =
    dyn Fn(String, Option<String>) -> BoxFuture<'static, Result<Option<Value>, HydrateError>>
        + Send
        + Sync;

/// Error observed by `get_or_create` callers.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("hydration failed for '{key}': {message}")]
    Hydrate { key: String, message: String },
}

type PendingHydration = Shared<BoxFuture<'static, Result<Option<ContextHandle>, RegistryError>>>;

#[derive(Default)]
struct Tables {
    contexts: HashMap<String, ContextHandle>,
    pending: HashMap<String, PendingHydration>,
}

/// Owns every live context and coalesces concurrent creation attempts.
pub struct ContextRegistry {
    tables: Mutex<Tables>,
    hydrate: Arc<HydrateFn>,
    hooks: Arc<Hooks>,
    params: Arc<GenParamService>,
}

impl ContextRegistry {
    pub fn new(
        hydrate: Arc<HydrateFn>,
        hooks: Arc<Hooks>,
        params: Arc<GenParamService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            hydrate,
            hooks,
            params,
        })
    }

    /// Resolves `key` to its context, hydrating it first if necessary.
    ///
    /// Returns `Ok(None)` when the hydrate collaborator reports that the key
    /// names no store.
    pub async fn get_or_create(
        self: &Arc<Self>,
        key: &str,
        identity: Option<String>,
    ) -> Result<Option<ContextHandle>, RegistryError> {
        let pending = {
            let mut tables = self.tables.lock().await;
            if let Some(handle) = tables.contexts.get(key) {
                return Ok(Some(handle.clone()));
            }
            match tables.pending.get(key) {
                Some(inflight) => inflight.clone(),
                None => {
                    let hydration = Arc::clone(self)
                        .hydrate_one(key.to_string(), identity)
                        .boxed()
                        .shared();
                    tables.pending.insert(key.to_string(), hydration.clone());
                    hydration
                }
            }
        };

        pending.await
    }

    /// Number of live (successfully hydrated) contexts.
    pub async fn context_count(&self) -> usize {
        self.tables.lock().await.contexts.len()
    }

    async fn hydrate_one(
        self: Arc<Self>,
        key: String,
        identity: Option<String>,
    ) -> Result<Option<ContextHandle>, RegistryError> {
        debug!("hydrating context '{}'", key);
        let outcome = (self.hydrate)(key.clone(), identity).await;

        let mut tables = self.tables.lock().await;
        tables.pending.remove(&key);

        match outcome {
            Ok(Some(initial_state)) => {
                let handle = spawn_context(
                    key.clone(),
                    initial_state,
                    Arc::clone(&self.hooks),
                    Arc::clone(&self.params),
                );
                tables.contexts.insert(key.clone(), handle.clone());
                info!("context '{}' hydrated", key);
                Ok(Some(handle))
            }
            Ok(None) => {
                debug!("context '{}' does not exist", key);
                Ok(None)
            }
            Err(err) => {
                warn!("context '{}' failed to hydrate: {}", key, err);
                Err(RegistryError::Hydrate {
                    key,
                    message: err.to_string(),
                })
            }
        }
    }
}
