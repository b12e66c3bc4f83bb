//! Coordinated hot reload of the field registry and its dependent rulesets.
//!
//! A single background loop polls the registry manifest. When the published
//! registry version moves, every installed ruleset's manifest must declare
//! the new version before anything is installed; the whole reload is
//! validated off the hot path and then installed as one coordinated swap.
//! Any failure leaves the previous coherent state in place and the next
//! cycle retries from scratch.

use anyhow::{bail, Context};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::engine::fields::FieldRegistry;
use crate::engine::ruleset::Ruleset;
use crate::registry::{FieldRegistryService, RulesetRegistry, GLOBAL_COUNTRY};
use crate::storage::ArtifactLoader;

pub struct HotReloadCoordinator {
    loader: Arc<ArtifactLoader>,
    fields: Arc<FieldRegistryService>,
    registry: Arc<RulesetRegistry>,
    poll_interval: Duration,
    required_keys: Vec<String>,
    last_known: AtomicI64,
}

impl HotReloadCoordinator {
    pub fn new(
        loader: Arc<ArtifactLoader>,
        fields: Arc<FieldRegistryService>,
        registry: Arc<RulesetRegistry>,
        poll_interval_seconds: u64,
        required_keys: Vec<String>,
    ) -> Self {
        Self {
            loader,
            fields,
            registry,
            poll_interval: Duration::from_secs(poll_interval_seconds.max(1)),
            required_keys,
            last_known: AtomicI64::new(0),
        }
    }

    pub fn last_known_registry_version(&self) -> i64 {
        self.last_known.load(Ordering::SeqCst)
    }

    /// Fail-fast startup contract: the field-registry manifest and every
    /// required ruleset manifest must be present, and the initial coherent
    /// pair must install cleanly. A started process guarantees a usable
    /// ruleset/registry pair.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        let registry_manifest = self
            .loader
            .load_registry_manifest()
            .await
            .context("field registry manifest missing from blob storage")?;

        for key in &self.required_keys {
            if self.loader.load_ruleset_manifest(key).await.is_none() {
                bail!("required ruleset manifest missing: {key}");
            }
        }

        let field_registry = self
            .loader
            .load_field_registry(registry_manifest.version, Some(&registry_manifest.checksum))
            .await
            .with_context(|| {
                format!(
                    "field registry artifact v{} failed to load",
                    registry_manifest.version
                )
            })?;
        let registry_version = field_registry.version();
        self.fields.swap(field_registry);

        for key in &self.required_keys {
            let manifest = self
                .loader
                .load_ruleset_manifest(key)
                .await
                .with_context(|| format!("ruleset manifest vanished during startup: {key}"))?;
            if !self
                .registry
                .load_and_register(GLOBAL_COUNTRY, key, manifest.version)
                .await
            {
                bail!("required ruleset failed to load: {key} v{}", manifest.version);
            }
        }

        self.last_known.store(registry_version, Ordering::SeqCst);
        info!(
            registry_version,
            rulesets = self.registry.size(),
            "Startup artifact validation complete"
        );
        Ok(())
    }

    /// Background poll loop. Never participates in request latency.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        // The first tick fires immediately; bootstrap already covered it.
        ticker.tick().await;

        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Hot-reload loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reload_cycle().await {
                        error!(error = %e, "HOT_RELOAD_FAILED: keeping previous state");
                        metrics::increment_counter!("hot_reload_failed_total");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Hot-reload loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One reload cycle. Everything is fetched, verified, and compiled
    /// before any install; `last_known` advances only on full success.
    pub async fn reload_cycle(&self) -> anyhow::Result<()> {
        let Some(manifest) = self.loader.load_registry_manifest().await else {
            // Transient storage trouble: keep current state, try next cycle.
            warn!("Registry manifest unavailable; skipping reload cycle");
            metrics::increment_counter!("hot_reload_skipped_total");
            return Ok(());
        };

        let last_known = self.last_known.load(Ordering::SeqCst);
        if manifest.version == last_known {
            return Ok(());
        }

        info!(
            from = last_known,
            to = manifest.version,
            "Field registry version changed; starting coordinated reload"
        );

        // Compatibility gate: every installed ruleset's manifest must
        // declare the new registry version before anything moves.
        let installed = self.registry.entries();
        let mut pending: Vec<(String, String, i64)> = Vec::with_capacity(installed.len());

        for (country, key, _current) in &installed {
            let ruleset_manifest = self
                .loader
                .load_ruleset_manifest(key)
                .await
                .with_context(|| format!("manifest unavailable for installed ruleset {key}"))?;

            match ruleset_manifest.field_registry_version {
                Some(declared) if declared != manifest.version => {
                    metrics::increment_counter!("hot_reload_version_mismatch_total");
                    bail!(
                        "version mismatch: {country}/{key} declares field registry v{declared}, \
                         new registry is v{}",
                        manifest.version
                    );
                }
                Some(_) => {}
                None => {
                    warn!(
                        country = %country,
                        key = %key,
                        "Ruleset manifest declares no field_registry_version"
                    );
                }
            }

            pending.push((country.clone(), key.clone(), ruleset_manifest.version));
        }

        // Stage the new field registry and recompile every installed
        // ruleset against it before touching live state.
        let new_registry: FieldRegistry = self
            .loader
            .load_field_registry(manifest.version, Some(&manifest.checksum))
            .await
            .with_context(|| format!("field registry artifact v{} failed to load", manifest.version))?;

        let mut staged: Vec<(String, String, Arc<Ruleset>)> = Vec::with_capacity(pending.len());
        for (country, key, version) in pending {
            let ruleset = self
                .loader
                .load_compiled(&key, version, &new_registry)
                .await
                .with_context(|| format!("ruleset {key} v{version} failed to load against new registry"))?;
            staged.push((country, key, ruleset));
        }

        // Install phase: swap the registry, then each staged ruleset. All
        // artifacts are already validated, so this cannot half-fail.
        let new_version = new_registry.version();
        self.fields.swap(new_registry);
        for (country, key, ruleset) in staged {
            let version = ruleset.version;
            self.registry.install(&country, &key, ruleset);
            info!(
                country = %country,
                key = %key,
                version,
                "Ruleset reinstalled after registry reload"
            );
        }

        self.last_known.store(new_version, Ordering::SeqCst);
        metrics::increment_counter!("hot_reload_success_total");
        info!(registry_version = new_version, "Coordinated reload complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{sha256_hex, MemoryBlobStore};
    use serde_json::json;

    struct Fixture {
        blob: Arc<MemoryBlobStore>,
        loader: Arc<ArtifactLoader>,
        fields: Arc<FieldRegistryService>,
        registry: Arc<RulesetRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let blob = Arc::new(MemoryBlobStore::new());
            let loader = Arc::new(ArtifactLoader::new(blob.clone(), "artifacts", "prod"));
            let fields = Arc::new(FieldRegistryService::new(FieldRegistry::builtin()));
            let registry = Arc::new(RulesetRegistry::new(loader.clone(), fields.clone()));
            Self {
                blob,
                loader,
                fields,
                registry,
            }
        }

        fn coordinator(&self, required: &[&str]) -> HotReloadCoordinator {
            HotReloadCoordinator::new(
                self.loader.clone(),
                self.fields.clone(),
                self.registry.clone(),
                30,
                required.iter().map(|s| s.to_string()).collect(),
            )
        }

        fn seed_field_registry(&self, version: i64) {
            let artifact = json!({
                "registry_version": version,
                "created_by": "pipeline",
                "fields": [
                    {"id": 1, "key": "transaction_id", "display_name": "Transaction ID", "datatype": "STRING"},
                    {"id": 3, "key": "amount", "display_name": "Amount", "datatype": "NUMBER"},
                    {"id": 12, "key": "country_code", "display_name": "Country Code", "datatype": "STRING"}
                ]
            });
            let bytes = serde_json::to_vec(&artifact).unwrap();
            let checksum = sha256_hex(&bytes);
            self.blob
                .put(&format!("artifacts/fields/registry/v{version}/fields.json"), bytes);
            self.blob.put_json(
                "artifacts/fields/registry/manifest.json",
                &json!({"version": version, "checksum": checksum}),
            );
        }

        fn seed_ruleset(&self, key: &str, version: i64, declared_registry: Option<i64>) {
            let artifact = json!({
                "key": key,
                "version": version,
                "evaluation_type": "MONITORING",
                "field_registry_version": declared_registry,
                "rules": [{
                    "id": 1,
                    "name": "any-amount",
                    "action": "REVIEW",
                    "priority": 10,
                    "conditions": [{"field": "amount", "operator": "GTE", "value": 0}]
                }]
            });
            let bytes = serde_json::to_vec(&artifact).unwrap();
            let checksum = sha256_hex(&bytes);
            self.blob.put(
                &format!("artifacts/rulesets/prod/{key}/v{version}/ruleset.json"),
                bytes,
            );
            self.blob.put_json(
                &format!("artifacts/rulesets/prod/{key}/manifest.json"),
                &json!({
                    "version": version,
                    "checksum": checksum,
                    "field_registry_version": declared_registry
                }),
            );
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_without_registry_manifest() {
        let fx = Fixture::new();
        fx.seed_ruleset("CARD_MONITORING", 1, Some(1));
        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        assert!(coordinator.bootstrap().await.is_err());
    }

    #[tokio::test]
    async fn bootstrap_fails_without_required_ruleset_manifest() {
        let fx = Fixture::new();
        fx.seed_field_registry(1);
        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        assert!(coordinator.bootstrap().await.is_err());
    }

    #[tokio::test]
    async fn bootstrap_installs_registry_and_required_rulesets() {
        let fx = Fixture::new();
        fx.seed_field_registry(1);
        fx.seed_ruleset("CARD_MONITORING", 3, Some(1));

        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        coordinator.bootstrap().await.unwrap();

        assert_eq!(fx.fields.version(), 1);
        assert_eq!(coordinator.last_known_registry_version(), 1);
        let installed = fx.registry.get(GLOBAL_COUNTRY, "CARD_MONITORING").unwrap();
        assert_eq!(installed.version, 3);
    }

    #[tokio::test]
    async fn unchanged_registry_version_skips_cycle() {
        let fx = Fixture::new();
        fx.seed_field_registry(1);
        fx.seed_ruleset("CARD_MONITORING", 3, Some(1));

        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        coordinator.bootstrap().await.unwrap();

        coordinator.reload_cycle().await.unwrap();
        assert_eq!(coordinator.last_known_registry_version(), 1);
        assert_eq!(fx.registry.get(GLOBAL_COUNTRY, "CARD_MONITORING").unwrap().version, 3);
    }

    #[tokio::test]
    async fn version_mismatch_aborts_whole_reload() {
        let fx = Fixture::new();
        fx.seed_field_registry(1);
        fx.seed_ruleset("CARD_MONITORING", 3, Some(1));

        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        coordinator.bootstrap().await.unwrap();

        // Registry moves to v2, but the ruleset still declares v1.
        fx.seed_field_registry(2);
        assert!(coordinator.reload_cycle().await.is_err());

        // Nothing moved.
        assert_eq!(fx.fields.version(), 1);
        assert_eq!(coordinator.last_known_registry_version(), 1);
    }

    #[tokio::test]
    async fn compatible_reload_swaps_registry_and_rulesets() {
        let fx = Fixture::new();
        fx.seed_field_registry(1);
        fx.seed_ruleset("CARD_MONITORING", 3, Some(1));

        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        coordinator.bootstrap().await.unwrap();

        // Registry v2 plus a ruleset recompiled against it.
        fx.seed_field_registry(2);
        fx.seed_ruleset("CARD_MONITORING", 4, Some(2));

        coordinator.reload_cycle().await.unwrap();

        assert_eq!(fx.fields.version(), 2);
        assert_eq!(coordinator.last_known_registry_version(), 2);
        let installed = fx.registry.get(GLOBAL_COUNTRY, "CARD_MONITORING").unwrap();
        assert_eq!(installed.version, 4);
        assert_eq!(installed.field_registry_version, Some(2));
    }

    #[tokio::test]
    async fn storage_outage_skips_cycle_and_keeps_state() {
        let fx = Fixture::new();
        fx.seed_field_registry(1);
        fx.seed_ruleset("CARD_MONITORING", 3, Some(1));

        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        coordinator.bootstrap().await.unwrap();

        fx.blob.set_accessible(false);
        coordinator.reload_cycle().await.unwrap();
        assert_eq!(coordinator.last_known_registry_version(), 1);
        assert_eq!(fx.fields.version(), 1);
    }

    #[tokio::test]
    async fn missing_declared_version_warns_but_reloads() {
        let fx = Fixture::new();
        fx.seed_field_registry(1);
        fx.seed_ruleset("CARD_MONITORING", 3, None);

        let coordinator = fx.coordinator(&["CARD_MONITORING"]);
        coordinator.bootstrap().await.unwrap();

        fx.seed_field_registry(2);
        fx.seed_ruleset("CARD_MONITORING", 4, None);

        coordinator.reload_cycle().await.unwrap();
        assert_eq!(fx.fields.version(), 2);
        assert_eq!(fx.registry.get(GLOBAL_COUNTRY, "CARD_MONITORING").unwrap().version, 4);
    }
}
