//! The A/B evaluation core: spec snapshots, the metadata refresh loop and
//! the rule engine.
//!
//! [`AbCore`] can be driven independently of the full [`crate::Client`]
//! when only evaluation is needed; the client wires it to the event
//! pipeline for exposure tracking.
pub mod models;
pub mod snapshot;
pub mod sticky;

mod conditions;
mod eval;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{normalize_endpoint, AbConfig};
use crate::error::{Error, Result};
use crate::meta_loader::{MetaLoader, SignedHttpMetaLoader};
use crate::poller_thread::{PollerThread, PollerThreadConfig};

use models::{AbSpec, SpecType};
use snapshot::{Snapshot, SnapshotStore};
use sticky::StickyHandler;

pub use models::{AbResult, MetaEnvelope};

/// Bound on `gate_pass`/`gate_fail` spec-to-spec recursion.
pub(crate) const MAX_RECURSION_DEPTH: usize = 10;

impl std::fmt::Debug for AbCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbCore").finish_non_exhaustive()
    }
}

/// The heart of the A/B evaluation engine.
pub struct AbCore {
    source_token: String,
    pub(crate) sticky_handler: Option<Arc<dyn StickyHandler>>,
    meta_loader: Arc<dyn MetaLoader>,
    meta_load_interval: Duration,
    store: SnapshotStore,
    poller: Mutex<Option<PollerThread>>,
}

impl AbCore {
    /// Create a core from an A/B configuration. When no custom loader is
    /// configured, the default signed HTTP loader is built from
    /// `meta_endpoint` (falling back to `endpoint`) and requires a project
    /// secret. A fast-boot snapshot, when supplied and decodable, is
    /// installed immediately.
    pub fn new(endpoint: &str, source_token: &str, config: &AbConfig) -> Result<AbCore> {
        let mut config = config.clone();
        config.normalize();

        let meta_loader: Arc<dyn MetaLoader> = match &config.meta_loader {
            Some(loader) => Arc::clone(loader),
            None => {
                let mut meta_endpoint = if config.meta_endpoint.is_empty() {
                    endpoint.to_owned()
                } else {
                    config.meta_endpoint.clone()
                };
                if let Ok(normalized) = normalize_endpoint(&meta_endpoint) {
                    meta_endpoint = normalized;
                }
                if config.project_secret.is_empty() {
                    return Err(Error::ProjectSecretRequired);
                }
                let loader = SignedHttpMetaLoader::new(
                    meta_endpoint,
                    config.meta_uri_path.clone(),
                    source_token.to_owned(),
                    config.project_secret.clone(),
                );
                log::info!(target: "abflow", "ab core initialized with meta loader: {loader:?}");
                Arc::new(loader)
            }
        };

        let core = AbCore {
            source_token: source_token.to_owned(),
            sticky_handler: config.sticky_handler.clone(),
            meta_loader,
            meta_load_interval: config.meta_load_interval,
            store: SnapshotStore::new(),
            poller: Mutex::new(None),
        };

        if let Some(bytes) = &config.fast_boot_snapshot {
            match Snapshot::from_json(bytes) {
                Ok(snapshot) => core.store.set(Arc::new(snapshot)),
                Err(err) => {
                    log::warn!(target: "abflow", "[{}] fast-boot snapshot ignored: {err}", core.source_token)
                }
            }
        }

        Ok(core)
    }

    /// Begin refreshing metadata. When no fast-boot snapshot is installed,
    /// one synchronous fetch attempt runs before the poller thread starts;
    /// a pre-installed snapshot inhibits the startup fetch but not the
    /// loop.
    pub fn start(self: &Arc<Self>) {
        if self.store.get().is_none() {
            if let Err(err) = self.load_remote_meta() {
                log::error!(target: "abflow", "[{}] ab core initial meta load failed: {err}", self.source_token);
            }
        }

        let mut poller = self
            .poller
            .lock()
            .expect("thread holding poller lock should not panic");
        if poller.is_none() {
            let config = PollerThreadConfig::new().with_interval(self.meta_load_interval);
            match PollerThread::start(Arc::clone(self), config) {
                Ok(thread) => *poller = Some(thread),
                Err(err) => {
                    log::error!(target: "abflow", "[{}] failed to start meta poller: {err}", self.source_token)
                }
            }
        }
    }

    /// Stop the refresh loop and wait for it to exit.
    pub fn stop(&self) {
        let thread = self
            .poller
            .lock()
            .expect("thread holding poller lock should not panic")
            .take();
        if let Some(thread) = thread {
            thread.shutdown();
        }
    }

    /// One metadata fetch attempt. A new snapshot is published only when
    /// the server indicates change (or none is installed yet) and every
    /// variant payload parses; otherwise the current snapshot stays.
    pub fn load_remote_meta(&self) -> Result<()> {
        let envelope = self.meta_loader.load_meta()?;

        let need_update = envelope.update
            || match self.store.get() {
                Some(current) => current.update_time != envelope.update_time,
                None => true,
            };
        if !need_update {
            log::debug!(target: "abflow", "[{}] ab core meta refresh without new info", self.source_token);
            return Ok(());
        }

        let snapshot = Snapshot::from_envelope(envelope)?;
        log::debug!(
            target: "abflow",
            "[{}] ab core installed snapshot with {} specs, update_time {}",
            self.source_token,
            snapshot.ab_specs.len(),
            snapshot.update_time
        );
        self.store.set(Arc::new(snapshot));
        Ok(())
    }

    /// The currently installed snapshot, or `None` before the first load.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.store.get()
    }

    pub(crate) fn set_snapshot(&self, snapshot: Snapshot) {
        self.store.set(Arc::new(snapshot));
    }

    /// Evaluate a single spec for a user. Returns an empty result when the
    /// key is unknown, no snapshot is installed, or `expected` does not
    /// match the spec's type.
    pub fn evaluate(
        &self,
        user: &crate::User,
        key: &str,
        expected: Option<SpecType>,
    ) -> Result<AbResult> {
        let Some(snapshot) = self.store.get() else {
            return Ok(AbResult::default());
        };
        let Some(spec) = snapshot.get_spec(key) else {
            return Ok(AbResult::default());
        };
        if let Some(expected) = expected {
            if !expected.matches(spec.typ) {
                return Ok(AbResult::default());
            }
        }
        self.eval_spec(&snapshot, user, spec, 0)
    }

    /// Evaluate every spec in the current snapshot for a user, returning
    /// the results that produced a populated result (variant ID may still
    /// be absent for non-passing configs and experiments).
    pub fn evaluate_all(&self, user: &crate::User) -> Result<Vec<AbResult>> {
        let mut results = Vec::new();
        let Some(snapshot) = self.store.get() else {
            return Ok(results);
        };

        for spec in snapshot.ab_specs.values() {
            let result = self.eval_spec(&snapshot, user, spec, 0)?;
            if result.id > 0 {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// The cached specs and their update time, for export.
    pub fn get_ab_specs(&self) -> Option<(Vec<AbSpec>, i64)> {
        let snapshot = self.store.get()?;
        let specs = snapshot.ab_specs.values().cloned().collect();
        Some((specs, snapshot.update_time))
    }

    /// The complete snapshot state as JSON bytes, suitable for fast-boot
    /// injection in a future session.
    pub fn storage_snapshot(&self) -> Result<Vec<u8>> {
        match self.store.get() {
            Some(snapshot) => snapshot.to_json(),
            None => Err(Error::AbNotReady),
        }
    }
}
