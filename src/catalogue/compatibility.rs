//! Compatibility Resolution
//!
//! Read-through cache over drive compatibilities (drive model -> device
//! groups) and access specifications (tape model + density -> modes).
//! Entries are filled on first lookup and dropped by [`CompatibilityResolver::invalidate`]
//! whenever reference data changes.

use crate::domain::ports::VdqmStoreRef;
use crate::domain::types::{AccessMode, AccessSpecification, DriveCompatibility};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Cached compatibility lookups
pub struct CompatibilityResolver {
    store: VdqmStoreRef,
    groups_by_model: DashMap<String, Vec<String>>,
    specs_by_tape: DashMap<(String, String), Vec<AccessSpecification>>,
    /// Bumped by every invalidation; a fill started under an older
    /// generation is discarded
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CompatibilityResolver {
    pub fn new(store: VdqmStoreRef) -> Self {
        Self {
            store,
            groups_by_model: DashMap::new(),
            specs_by_tape: DashMap::new(),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Device groups a drive model may serve. Unknown models serve nothing.
    pub async fn device_groups_for_model(&self, model: &str) -> Result<Vec<String>> {
        if let Some(groups) = self.groups_by_model.get(model) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(groups.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::SeqCst);

        let mut groups: Vec<String> = self
            .store
            .drive_compatibilities()
            .await?
            .into_iter()
            .filter(|c| c.drive_model == model)
            .flat_map(|c| c.device_groups)
            .collect();
        groups.sort();
        groups.dedup();

        self.remember(&self.groups_by_model, model.to_string(), groups.clone(), generation);
        Ok(groups)
    }

    /// Whether a drive of `model` may serve `device_group`
    pub async fn drive_serves(&self, model: &str, device_group: &str) -> Result<bool> {
        Ok(self
            .device_groups_for_model(model)
            .await?
            .iter()
            .any(|g| g == device_group))
    }

    /// Valid access specifications for a tape, write before read
    pub async fn access_specifications(
        &self,
        tape_model: &str,
        density: &str,
    ) -> Result<Vec<AccessSpecification>> {
        let key = (tape_model.to_string(), density.to_string());
        if let Some(specs) = self.specs_by_tape.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(specs.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::SeqCst);

        let mut specs: Vec<AccessSpecification> = self
            .store
            .access_specifications()
            .await?
            .into_iter()
            .filter(|s| s.tape_model == tape_model && s.density == density)
            .collect();
        specs.sort_by(|a, b| b.mode.cmp(&a.mode));
        specs.dedup();

        self.remember(&self.specs_by_tape, key, specs.clone(), generation);
        Ok(specs)
    }

    /// Resolve the access specification for an admission, failing with
    /// `InvalidArgument` when the combination is not valid
    pub async fn resolve(
        &self,
        tape_model: &str,
        density: &str,
        mode: AccessMode,
    ) -> Result<AccessSpecification> {
        self.access_specifications(tape_model, density)
            .await?
            .into_iter()
            .find(|s| s.mode == mode)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "no access specification for tape model {} density {} mode {}",
                    tape_model, density, mode
                ))
            })
    }

    /// Register a drive compatibility and drop cached entries
    pub async fn add_drive_compatibility(&self, compatibility: DriveCompatibility) -> Result<()> {
        self.store.put_drive_compatibility(compatibility).await?;
        self.invalidate();
        Ok(())
    }

    /// Register an access specification and drop cached entries
    pub async fn add_access_specification(&self, spec: AccessSpecification) -> Result<()> {
        self.store.put_access_specification(spec).await?;
        self.invalidate();
        Ok(())
    }

    /// Cache a value read under `generation`. An invalidation that raced
    /// with the read either clears the entry afterwards or is seen here.
    fn remember<K, V>(&self, cache: &DashMap<K, V>, key: K, value: V, generation: u64)
    where
        K: Eq + Hash + Clone,
    {
        cache.insert(key.clone(), value);
        if self.generation.load(Ordering::SeqCst) != generation {
            cache.remove(&key);
        }
    }

    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.groups_by_model.clear();
        self.specs_by_tape.clear();
        debug!("compatibility cache invalidated");
    }

    /// (hits, misses)
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    async fn resolver() -> CompatibilityResolver {
        let resolver = CompatibilityResolver::new(Arc::new(MemoryStore::new()));
        for mode in [AccessMode::Read, AccessMode::Write] {
            resolver
                .add_access_specification(AccessSpecification {
                    tape_model: "T10000".into(),
                    density: "1000GC".into(),
                    mode,
                })
                .await
                .unwrap();
        }
        resolver
            .add_access_specification(AccessSpecification {
                tape_model: "T10000".into(),
                density: "500GC".into(),
                mode: AccessMode::Read,
            })
            .await
            .unwrap();
        resolver
            .add_drive_compatibility(DriveCompatibility {
                drive_model: "T10000C".into(),
                device_groups: vec!["T10K".into(), "T10KC".into()],
            })
            .await
            .unwrap();
        resolver
    }

    #[tokio::test]
    async fn test_write_before_read() {
        let r = resolver().await;
        let specs = r.access_specifications("T10000", "1000GC").await.unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].mode, AccessMode::Write);
        assert_eq!(specs[1].mode, AccessMode::Read);
    }

    #[tokio::test]
    async fn test_resolve_rejects_missing_mode() {
        let r = resolver().await;
        assert!(r.resolve("T10000", "500GC", AccessMode::Read).await.is_ok());
        let err = r.resolve("T10000", "500GC", AccessMode::Write).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_drive_groups_cached() {
        let r = resolver().await;
        assert!(r.drive_serves("T10000C", "T10KC").await.unwrap());
        assert!(!r.drive_serves("T10000C", "LTO5").await.unwrap());
        assert!(!r.drive_serves("LTO5-HH", "T10K").await.unwrap());
        let (hits, misses) = r.cache_stats();
        assert_eq!(misses, 2);
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn test_stale_fill_discarded_after_invalidate() {
        let r = resolver().await;
        let generation = r.generation.load(Ordering::SeqCst);
        let stale = vec!["T10K".to_string(), "T10KC".to_string()];

        // Reference data changes while a lookup is still reading
        r.add_drive_compatibility(DriveCompatibility {
            drive_model: "T10000C".into(),
            device_groups: vec!["T10KD".into()],
        })
        .await
        .unwrap();
        r.remember(&r.groups_by_model, "T10000C".to_string(), stale, generation);

        assert!(r.groups_by_model.is_empty());
        assert!(r.drive_serves("T10000C", "T10KD").await.unwrap());
    }

    #[tokio::test]
    async fn test_fill_kept_without_invalidate() {
        let r = resolver().await;
        assert!(r.drive_serves("T10000C", "T10K").await.unwrap());
        assert!(r.groups_by_model.contains_key("T10000C"));
        r.invalidate();
        assert!(r.groups_by_model.is_empty());
    }
}
