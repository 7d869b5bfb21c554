//! Immutable spec snapshots and the thread-safe store that swaps them.
//!
//! A [`Snapshot`] is built once (from a metadata envelope or a fast-boot
//! export) and never mutated afterwards. [`SnapshotStore`] provides
//! concurrent access for readers (evaluation) and the single writer (the
//! metadata loader); readers that dereferenced the prior snapshot keep it
//! until they release it.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::ab::models::{AbEnv, AbSpec, MetaEnvelope, VariantParams};
use crate::error::Result;

/// An immutable bundle of all specs plus environment flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Millisecond epoch of the spec set.
    #[serde(default)]
    pub update_time: i64,
    #[serde(default)]
    pub ab_env: AbEnv,
    /// Specs keyed by spec key.
    #[serde(default)]
    pub ab_specs: HashMap<String, AbSpec>,
}

impl Snapshot {
    /// Build a snapshot from a metadata envelope, parsing every variant
    /// payload. A single payload that fails to parse rejects the whole
    /// snapshot so the previously installed one stays in effect.
    pub(crate) fn from_envelope(envelope: MetaEnvelope) -> Result<Snapshot> {
        let mut ab_specs = HashMap::with_capacity(envelope.ab_specs.len());
        for mut spec in envelope.ab_specs {
            parse_variant_payloads(&mut spec)?;
            ab_specs.insert(spec.key.clone(), spec);
        }
        Ok(Snapshot {
            update_time: envelope.update_time,
            ab_env: envelope.ab_env,
            ab_specs,
        })
    }

    /// Decode a snapshot previously produced by [`Snapshot::to_json`] (or a
    /// fast-boot export). Unparsed variant payloads, if any, are parsed the
    /// same way the loader parses them.
    pub(crate) fn from_json(bytes: &[u8]) -> Result<Snapshot> {
        let mut snapshot: Snapshot = serde_json::from_slice(bytes)?;
        for spec in snapshot.ab_specs.values_mut() {
            parse_variant_payloads(spec)?;
        }
        Ok(snapshot)
    }

    /// Encode the snapshot for fast-boot export.
    pub(crate) fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn get_spec(&self, key: &str) -> Option<&AbSpec> {
        self.ab_specs.get(key)
    }
}

/// Decode each raw variant payload into its parameter table and discard the
/// raw form. A `null` payload yields an empty table.
fn parse_variant_payloads(spec: &mut AbSpec) -> Result<()> {
    for (variant_id, payload) in std::mem::take(&mut spec.variant_payloads) {
        let params: Option<VariantParams> = serde_json::from_str(payload.get())?;
        spec.variant_values
            .insert(variant_id, params.unwrap_or_default());
    }
    Ok(())
}

/// Thread-safe storage for the currently active [`Snapshot`], swapped
/// atomically by the metadata loader. The snapshot itself is immutable and
/// can only be replaced fully; no lock is held during evaluation.
#[derive(Default)]
pub struct SnapshotStore {
    snapshot: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> SnapshotStore {
        SnapshotStore::default()
    }

    /// Returns the current snapshot, or `None` before the first load.
    pub fn get(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .read()
            .expect("thread holding snapshot lock should not panic")
            .clone()
    }

    /// Publish a new snapshot.
    pub fn set(&self, snapshot: Arc<Snapshot>) {
        *self
            .snapshot
            .write()
            .expect("thread holding snapshot lock should not panic") = Some(snapshot);
    }
}
