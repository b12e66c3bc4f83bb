//! Country-partitioned ruleset registry.
//!
//! Read-mostly shared state: lookups load an immutable snapshot through
//! `arc-swap` and are wait-free; the rare writers (hot reload, admin
//! endpoints) build a replacement map off the hot path and publish it
//! atomically. In-flight evaluations keep whatever snapshot they loaded, so
//! a swap never shows a reader a half-updated ruleset.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::engine::fields::FieldRegistry;
use crate::engine::ruleset::Ruleset;
use crate::storage::ArtifactLoader;

/// Fallback partition consulted when a country has no entry.
pub const GLOBAL_COUNTRY: &str = "global";

type SnapshotMap = HashMap<String, HashMap<String, Arc<Ruleset>>>;

/// Atomically swapped view of the live field registry. Same publication
/// pattern as the ruleset map: replace whole, never mutate.
pub struct FieldRegistryService {
    current: ArcSwap<FieldRegistry>,
}

impl FieldRegistryService {
    pub fn new(registry: FieldRegistry) -> Self {
        Self {
            current: ArcSwap::from_pointee(registry),
        }
    }

    pub fn current(&self) -> Arc<FieldRegistry> {
        self.current.load_full()
    }

    pub fn version(&self) -> i64 {
        self.current.load().version()
    }

    pub fn swap(&self, registry: FieldRegistry) {
        let new_version = registry.version();
        let old = self.current.swap(Arc::new(registry));
        info!(
            old_version = old.version(),
            new_version, "Field registry swapped"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HotSwapStatus {
    Swapped,
    NoChange,
    NotInstalled,
    LoadFailed,
    Incompatible,
}

impl HotSwapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HotSwapStatus::Swapped => "SWAPPED",
            HotSwapStatus::NoChange => "NO_CHANGE",
            HotSwapStatus::NotInstalled => "NOT_INSTALLED",
            HotSwapStatus::LoadFailed => "LOAD_FAILED",
            HotSwapStatus::Incompatible => "INCOMPATIBLE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HotSwapResult {
    pub success: bool,
    pub status: HotSwapStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
}

impl HotSwapResult {
    fn failure(status: HotSwapStatus, message: String) -> Self {
        Self {
            success: false,
            status,
            message,
            old_version: None,
            new_version: None,
        }
    }
}

pub struct RulesetRegistry {
    snapshot: ArcSwap<SnapshotMap>,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
    loader: Arc<ArtifactLoader>,
    fields: Arc<FieldRegistryService>,
}

impl RulesetRegistry {
    pub fn new(loader: Arc<ArtifactLoader>, fields: Arc<FieldRegistryService>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(SnapshotMap::new()),
            write_lock: Mutex::new(()),
            loader,
            fields,
        }
    }

    pub fn fields(&self) -> &FieldRegistryService {
        &self.fields
    }

    pub fn loader(&self) -> &ArtifactLoader {
        &self.loader
    }

    /// Exact-partition lookup.
    pub fn get(&self, country: &str, key: &str) -> Option<Arc<Ruleset>> {
        self.snapshot
            .load()
            .get(country)
            .and_then(|by_key| by_key.get(key))
            .cloned()
    }

    /// Country partition first, then the `global` partition, then None.
    /// Country wins even when global holds a newer version; partitioning is
    /// intentional, not a freshness race.
    pub fn get_with_fallback(&self, country: &str, key: &str) -> Option<Arc<Ruleset>> {
        let snapshot = self.snapshot.load();
        if let Some(ruleset) = snapshot.get(country).and_then(|by_key| by_key.get(key)) {
            return Some(ruleset.clone());
        }
        snapshot
            .get(GLOBAL_COUNTRY)
            .and_then(|by_key| by_key.get(key))
            .cloned()
    }

    /// Install by atomically publishing a rebuilt map. Returns the replaced
    /// version, if any.
    pub fn install(&self, country: &str, key: &str, ruleset: Arc<Ruleset>) -> Option<i64> {
        let _writer = self.write_lock.lock();

        let mut next: SnapshotMap = (**self.snapshot.load()).clone();
        let old_version = next
            .entry(country.to_string())
            .or_default()
            .insert(key.to_string(), ruleset)
            .map(|old| old.version);
        self.snapshot.store(Arc::new(next));
        old_version
    }

    /// Replace an already-installed ruleset with a freshly loaded version.
    pub async fn hot_swap(&self, country: &str, key: &str, version: i64) -> HotSwapResult {
        let Some(existing) = self.get(country, key) else {
            return HotSwapResult::failure(
                HotSwapStatus::NotInstalled,
                format!("{country}/{key} is not installed; use load"),
            );
        };

        if existing.version == version {
            return HotSwapResult {
                success: true,
                status: HotSwapStatus::NoChange,
                message: format!("{country}/{key} already at v{version}"),
                old_version: Some(existing.version),
                new_version: Some(version),
            };
        }

        self.swap_in(country, key, version, Some(existing.version))
            .await
    }

    /// Convenience form of hot-swap that also accepts a first install.
    pub async fn load_and_register(&self, country: &str, key: &str, version: i64) -> bool {
        if let Some(existing) = self.get(country, key) {
            if existing.version == version {
                return true;
            }
        }
        let old_version = self.get(country, key).map(|r| r.version);
        self.swap_in(country, key, version, old_version).await.success
    }

    async fn swap_in(
        &self,
        country: &str,
        key: &str,
        version: i64,
        old_version: Option<i64>,
    ) -> HotSwapResult {
        let field_registry = self.fields.current();

        let Some(ruleset) = self.loader.load_compiled(key, version, &field_registry).await
        else {
            return HotSwapResult::failure(
                HotSwapStatus::LoadFailed,
                format!("failed to load {key} v{version}"),
            );
        };

        if let Some(declared) = ruleset.field_registry_version {
            if declared != field_registry.version() {
                return HotSwapResult::failure(
                    HotSwapStatus::Incompatible,
                    format!(
                        "{key} v{version} was compiled against field registry v{declared}, live is v{}",
                        field_registry.version()
                    ),
                );
            }
        } else {
            // Legacy artifacts without a declared version are allowed
            // through; operators should migrate them.
            warn!(key, version, "Ruleset declares no field_registry_version");
        }

        self.install(country, key, ruleset);
        info!(country, key, version, ?old_version, "Ruleset swapped");

        HotSwapResult {
            success: true,
            status: HotSwapStatus::Swapped,
            message: format!("{country}/{key} now at v{version}"),
            old_version,
            new_version: Some(version),
        }
    }

    /// Load a batch of `(country, key, version)` entries. Failures are
    /// logged and do not abort the rest of the batch.
    pub async fn bulk_load(&self, entries: &[(String, String, i64)]) -> usize {
        let mut loaded = 0;
        for (country, key, version) in entries {
            if self.load_and_register(country, key, *version).await {
                loaded += 1;
            } else {
                warn!(country = %country, key = %key, version, "Bulk load entry failed");
            }
        }
        loaded
    }

    pub fn countries(&self) -> Vec<String> {
        let mut countries: Vec<String> = self.snapshot.load().keys().cloned().collect();
        countries.sort();
        countries
    }

    pub fn keys(&self, country: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .snapshot
            .load()
            .get(country)
            .map(|by_key| by_key.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn size(&self) -> usize {
        self.snapshot.load().values().map(HashMap::len).sum()
    }

    /// Every installed `(country, key, ruleset)`; reload compatibility
    /// checks enumerate this.
    pub fn entries(&self) -> Vec<(String, String, Arc<Ruleset>)> {
        let snapshot = self.snapshot.load();
        let mut entries: Vec<(String, String, Arc<Ruleset>)> = snapshot
            .iter()
            .flat_map(|(country, by_key)| {
                by_key
                    .iter()
                    .map(|(key, ruleset)| (country.clone(), key.clone(), ruleset.clone()))
            })
            .collect();
        entries.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{sha256_hex, MemoryBlobStore};
    use serde_json::json;

    fn seed_ruleset(blob: &MemoryBlobStore, key: &str, version: i64, registry_version: i64) {
        let artifact = json!({
            "key": key,
            "version": version,
            "evaluation_type": "MONITORING",
            "field_registry_version": registry_version,
            "rules": []
        });
        let bytes = serde_json::to_vec(&artifact).unwrap();
        let checksum = sha256_hex(&bytes);
        blob.put(
            &format!("artifacts/rulesets/prod/{key}/v{version}/ruleset.json"),
            bytes,
        );
        blob.put_json(
            &format!("artifacts/rulesets/prod/{key}/manifest.json"),
            &json!({"version": version, "checksum": checksum, "field_registry_version": registry_version}),
        );
    }

    fn registry_fixture() -> (Arc<MemoryBlobStore>, RulesetRegistry) {
        let blob = Arc::new(MemoryBlobStore::new());
        let loader = Arc::new(ArtifactLoader::new(blob.clone(), "artifacts", "prod"));
        let fields = Arc::new(FieldRegistryService::new(FieldRegistry::builtin()));
        (blob.clone(), RulesetRegistry::new(loader, fields))
    }

    #[test]
    fn fallback_prefers_country_then_global() {
        let (_blob, registry) = registry_fixture();

        registry.install("global", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 1)));
        registry.install("US", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 5)));

        let us = registry.get_with_fallback("US", "CARD_MONITORING").unwrap();
        assert_eq!(us.version, 5);

        let gb = registry.get_with_fallback("GB", "CARD_MONITORING").unwrap();
        assert_eq!(gb.version, 1);

        assert!(registry.get_with_fallback("GB", "OTHER").is_none());
    }

    #[test]
    fn country_wins_even_when_global_is_newer() {
        let (_blob, registry) = registry_fixture();
        registry.install("US", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 1)));
        registry.install("global", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 9)));

        let us = registry.get_with_fallback("US", "CARD_MONITORING").unwrap();
        assert_eq!(us.version, 1);
    }

    #[tokio::test]
    async fn load_and_register_then_hot_swap() {
        let (blob, registry) = registry_fixture();
        seed_ruleset(&blob, "CARD_MONITORING", 1, 1);

        assert!(registry.load_and_register("global", "CARD_MONITORING", 1).await);
        assert_eq!(registry.size(), 1);

        seed_ruleset(&blob, "CARD_MONITORING", 2, 1);
        let result = registry.hot_swap("global", "CARD_MONITORING", 2).await;
        assert!(result.success);
        assert_eq!(result.status, HotSwapStatus::Swapped);
        assert_eq!(result.old_version, Some(1));
        assert_eq!(result.new_version, Some(2));
    }

    #[tokio::test]
    async fn hot_swap_is_idempotent() {
        let (blob, registry) = registry_fixture();
        seed_ruleset(&blob, "CARD_MONITORING", 1, 1);
        registry.load_and_register("global", "CARD_MONITORING", 1).await;

        seed_ruleset(&blob, "CARD_MONITORING", 2, 1);
        let first = registry.hot_swap("global", "CARD_MONITORING", 2).await;
        assert_eq!(first.status, HotSwapStatus::Swapped);

        let second = registry.hot_swap("global", "CARD_MONITORING", 2).await;
        assert!(second.success);
        assert_eq!(second.status, HotSwapStatus::NoChange);
    }

    #[tokio::test]
    async fn hot_swap_requires_prior_install() {
        let (blob, registry) = registry_fixture();
        seed_ruleset(&blob, "CARD_MONITORING", 1, 1);

        let result = registry.hot_swap("global", "CARD_MONITORING", 1).await;
        assert!(!result.success);
        assert_eq!(result.status, HotSwapStatus::NotInstalled);
    }

    #[tokio::test]
    async fn incompatible_registry_version_is_refused() {
        let (blob, registry) = registry_fixture();
        // Declared against field registry v7; live registry is v1.
        seed_ruleset(&blob, "CARD_MONITORING", 1, 7);

        assert!(!registry.load_and_register("global", "CARD_MONITORING", 1).await);
        assert!(registry.get("global", "CARD_MONITORING").is_none());
    }

    #[tokio::test]
    async fn failed_load_keeps_prior_ruleset() {
        let (blob, registry) = registry_fixture();
        seed_ruleset(&blob, "CARD_MONITORING", 1, 1);
        registry.load_and_register("global", "CARD_MONITORING", 1).await;

        // v2 exists but its bytes do not match the manifest checksum.
        seed_ruleset(&blob, "CARD_MONITORING", 2, 1);
        blob.put(
            "artifacts/rulesets/prod/CARD_MONITORING/v2/ruleset.json",
            b"tampered".to_vec(),
        );

        let result = registry.hot_swap("global", "CARD_MONITORING", 2).await;
        assert!(!result.success);
        assert_eq!(result.status, HotSwapStatus::LoadFailed);

        // Pre-load state intact.
        let current = registry.get_with_fallback("US", "CARD_MONITORING").unwrap();
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn bulk_load_continues_past_failures() {
        let (blob, registry) = registry_fixture();
        seed_ruleset(&blob, "CARD_MONITORING", 1, 1);
        // ACCOUNT_MONITORING never seeded; it will fail.

        let loaded = registry
            .bulk_load(&[
                ("global".to_string(), "CARD_MONITORING".to_string(), 1),
                ("global".to_string(), "ACCOUNT_MONITORING".to_string(), 1),
            ])
            .await;

        assert_eq!(loaded, 1);
        assert_eq!(registry.keys("global"), vec!["CARD_MONITORING".to_string()]);
    }

    #[test]
    fn readers_see_old_or_new_snapshot_never_mixed() {
        let (_blob, registry) = registry_fixture();
        registry.install("global", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 1)));

        // A reader that grabbed its ruleset before the swap keeps it.
        let before = registry.get_with_fallback("US", "CARD_MONITORING").unwrap();
        registry.install("global", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 2)));

        assert_eq!(before.version, 1);
        let after = registry.get_with_fallback("US", "CARD_MONITORING").unwrap();
        assert_eq!(after.version, 2);
    }

    #[test]
    fn enumerations_are_sorted_and_counted() {
        let (_blob, registry) = registry_fixture();
        registry.install("global", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 1)));
        registry.install("US", "CARD_MONITORING", Arc::new(Ruleset::empty("CARD_MONITORING", 1)));
        registry.install("US", "ACCOUNT_MONITORING", Arc::new(Ruleset::empty("ACCOUNT_MONITORING", 1)));

        assert_eq!(registry.countries(), vec!["US".to_string(), "global".to_string()]);
        assert_eq!(
            registry.keys("US"),
            vec!["ACCOUNT_MONITORING".to_string(), "CARD_MONITORING".to_string()]
        );
        assert_eq!(registry.size(), 3);
        assert_eq!(registry.entries().len(), 3);
    }
}
