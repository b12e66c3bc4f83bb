//! Artifact loader.
//!
//! Fetches manifests and compiled artifacts from blob storage, verifies
//! SHA-256 checksums, and compiles artifacts against the live field
//! registry. A checksum mismatch is an integrity barrier: the artifact is
//! rejected and never installed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, warn};

use super::blob::BlobFetch;
use crate::engine::fields::{FieldRegistry, FieldsArtifact};
use crate::engine::ruleset::{Ruleset, RulesetArtifact};

/// Manifest published next to each artifact family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: i64,
    /// Lowercase SHA-256 hex of the artifact at `version`.
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_registry_version: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct ArtifactLoader {
    blob: Arc<dyn BlobFetch>,
    prefix: String,
    env: String,
}

impl ArtifactLoader {
    pub fn new(blob: Arc<dyn BlobFetch>, prefix: &str, env: &str) -> Self {
        Self {
            blob,
            prefix: prefix.trim_matches('/').to_string(),
            env: env.to_string(),
        }
    }

    pub fn registry_manifest_key(&self) -> String {
        format!("{}/fields/registry/manifest.json", self.prefix)
    }

    pub fn registry_artifact_key(&self, version: i64) -> String {
        format!("{}/fields/registry/v{}/fields.json", self.prefix, version)
    }

    pub fn ruleset_manifest_key(&self, key: &str) -> String {
        format!("{}/rulesets/{}/{}/manifest.json", self.prefix, self.env, key)
    }

    pub fn ruleset_artifact_key(&self, key: &str, version: i64) -> String {
        format!(
            "{}/rulesets/{}/{}/v{}/ruleset.json",
            self.prefix, self.env, key, version
        )
    }

    /// Fetch and decode a manifest. Not-found and transport errors both
    /// yield `None`; transport errors warn (callers at startup re-probe and
    /// treat missing manifests as fatal).
    async fn load_manifest_at(&self, blob_key: &str) -> Option<Manifest> {
        let bytes = match self.blob.get(blob_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = blob_key, error = %e, "Manifest fetch failed");
                return None;
            }
        };

        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                error!(key = blob_key, error = %e, "Manifest is not valid JSON");
                None
            }
        }
    }

    pub async fn load_ruleset_manifest(&self, key: &str) -> Option<Manifest> {
        self.load_manifest_at(&self.ruleset_manifest_key(key)).await
    }

    pub async fn load_registry_manifest(&self) -> Option<Manifest> {
        self.load_manifest_at(&self.registry_manifest_key()).await
    }

    /// Fetch, verify, and compile a ruleset artifact at a specific version.
    ///
    /// The manifest's checksum covers the manifest's own version; when an
    /// older version is pinned explicitly there is no recorded checksum for
    /// it and the load proceeds with a warning.
    pub async fn load_compiled(
        &self,
        key: &str,
        version: i64,
        registry: &FieldRegistry,
    ) -> Option<Arc<Ruleset>> {
        let manifest = self.load_ruleset_manifest(key).await;

        let blob_key = self.ruleset_artifact_key(key, version);
        let bytes = match self.blob.get(&blob_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(key, version, "Ruleset artifact not found");
                return None;
            }
            Err(e) => {
                warn!(key, version, error = %e, "Ruleset artifact fetch failed");
                return None;
            }
        };

        match manifest {
            Some(m) if m.version == version => {
                let actual = sha256_hex(&bytes);
                if !actual.eq_ignore_ascii_case(&m.checksum) {
                    error!(
                        key,
                        version,
                        expected = %m.checksum,
                        actual = %actual,
                        "Ruleset artifact checksum mismatch; refusing to install"
                    );
                    metrics::increment_counter!("artifact_checksum_mismatch_total");
                    return None;
                }
            }
            Some(m) => {
                warn!(
                    key,
                    version,
                    manifest_version = m.version,
                    "No checksum recorded for pinned version; loading unverified"
                );
            }
            None => {
                warn!(key, version, "Ruleset manifest unavailable; loading unverified");
            }
        }

        let artifact = match serde_json::from_slice::<RulesetArtifact>(&bytes) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(key, version, error = %e, "Ruleset artifact is malformed");
                return None;
            }
        };

        match Ruleset::compile(&artifact, registry) {
            Ok(ruleset) => Some(Arc::new(ruleset)),
            Err(e) => {
                error!(key, version, error = %e, "Ruleset failed to compile");
                None
            }
        }
    }

    /// Manifest followed by the compiled artifact at the manifest's version.
    pub async fn load_latest(&self, key: &str, registry: &FieldRegistry) -> Option<Arc<Ruleset>> {
        let manifest = self.load_ruleset_manifest(key).await?;
        self.load_compiled(key, manifest.version, registry).await
    }

    /// Fetch and verify a published field registry at a specific version.
    pub async fn load_field_registry(
        &self,
        version: i64,
        expected_checksum: Option<&str>,
    ) -> Option<FieldRegistry> {
        let blob_key = self.registry_artifact_key(version);
        let bytes = match self.blob.get(&blob_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(version, "Field registry artifact not found");
                return None;
            }
            Err(e) => {
                warn!(version, error = %e, "Field registry artifact fetch failed");
                return None;
            }
        };

        if let Some(expected) = expected_checksum {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                error!(
                    version,
                    expected,
                    actual = %actual,
                    "Field registry checksum mismatch; refusing to install"
                );
                metrics::increment_counter!("artifact_checksum_mismatch_total");
                return None;
            }
        }

        let artifact = match serde_json::from_slice::<FieldsArtifact>(&bytes) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(version, error = %e, "Field registry artifact is malformed");
                return None;
            }
        };

        match FieldRegistry::from_artifact(artifact) {
            Ok(registry) => Some(registry),
            Err(e) => {
                error!(version, error = %e, "Field registry artifact is invalid");
                None
            }
        }
    }

    /// The builtin bootstrap registry. Never fails.
    pub fn load_builtin(&self) -> FieldRegistry {
        FieldRegistry::builtin()
    }

    /// Bucket probe for health and status endpoints.
    pub async fn is_storage_accessible(&self) -> bool {
        self.blob.head().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob::MemoryBlobStore;
    use serde_json::json;

    fn ruleset_json() -> serde_json::Value {
        json!({
            "key": "CARD_MONITORING",
            "version": 2,
            "evaluation_type": "MONITORING",
            "field_registry_version": 1,
            "rules": [{
                "id": 1,
                "name": "high-amount",
                "action": "REVIEW",
                "priority": 100,
                "enabled": true,
                "conditions": [{"field": "amount", "operator": "GT", "value": 100}]
            }]
        })
    }

    fn seeded() -> (Arc<MemoryBlobStore>, ArtifactLoader) {
        let blob = Arc::new(MemoryBlobStore::new());
        let loader = ArtifactLoader::new(blob.clone(), "artifacts", "prod");

        let artifact_bytes = serde_json::to_vec(&ruleset_json()).unwrap();
        let checksum = sha256_hex(&artifact_bytes);

        blob.put(
            "artifacts/rulesets/prod/CARD_MONITORING/v2/ruleset.json",
            artifact_bytes,
        );
        blob.put_json(
            "artifacts/rulesets/prod/CARD_MONITORING/manifest.json",
            &json!({
                "version": 2,
                "checksum": checksum,
                "field_registry_version": 1,
                "created_by": "pipeline"
            }),
        );

        (blob, loader)
    }

    #[tokio::test]
    async fn load_latest_verifies_checksum_and_compiles() {
        let (_blob, loader) = seeded();
        let registry = FieldRegistry::builtin();

        let ruleset = loader.load_latest("CARD_MONITORING", &registry).await.unwrap();
        assert_eq!(ruleset.version, 2);
        assert_eq!(ruleset.rule_count(), 1);
        assert_eq!(ruleset.field_registry_version, Some(1));
    }

    #[tokio::test]
    async fn checksum_mismatch_rejects_artifact() {
        let (blob, loader) = seeded();
        let registry = FieldRegistry::builtin();

        // Corrupt the artifact after the manifest recorded its checksum.
        blob.put(
            "artifacts/rulesets/prod/CARD_MONITORING/v2/ruleset.json",
            serde_json::to_vec(&json!({
                "key": "CARD_MONITORING",
                "version": 2,
                "rules": []
            }))
            .unwrap(),
        );

        assert!(loader.load_latest("CARD_MONITORING", &registry).await.is_none());
    }

    #[tokio::test]
    async fn missing_manifest_is_none_not_error() {
        let blob = Arc::new(MemoryBlobStore::new());
        let loader = ArtifactLoader::new(blob, "artifacts", "prod");
        assert!(loader.load_ruleset_manifest("NOPE").await.is_none());
    }

    #[tokio::test]
    async fn malformed_artifact_is_rejected() {
        let (blob, loader) = seeded();
        let registry = FieldRegistry::builtin();

        let bad = b"not json at all".to_vec();
        let checksum = sha256_hex(&bad);
        blob.put("artifacts/rulesets/prod/CARD_MONITORING/v2/ruleset.json", bad);
        blob.put_json(
            "artifacts/rulesets/prod/CARD_MONITORING/manifest.json",
            &json!({"version": 2, "checksum": checksum}),
        );

        assert!(loader.load_compiled("CARD_MONITORING", 2, &registry).await.is_none());
    }

    #[tokio::test]
    async fn field_registry_roundtrip_with_checksum() {
        let blob = Arc::new(MemoryBlobStore::new());
        let loader = ArtifactLoader::new(blob.clone(), "artifacts", "prod");

        let fields = json!({
            "registry_version": 3,
            "created_by": "pipeline",
            "fields": [
                {"id": 1, "key": "transaction_id", "display_name": "Transaction ID", "datatype": "STRING"},
                {"id": 3, "key": "amount", "display_name": "Amount", "datatype": "NUMBER"}
            ]
        });
        let bytes = serde_json::to_vec(&fields).unwrap();
        let checksum = sha256_hex(&bytes);
        blob.put("artifacts/fields/registry/v3/fields.json", bytes);

        let registry = loader.load_field_registry(3, Some(&checksum)).await.unwrap();
        assert_eq!(registry.version(), 3);
        assert_eq!(registry.field_count(), 2);

        assert!(loader.load_field_registry(3, Some("deadbeef")).await.is_none());
    }

    #[test]
    fn builtin_registry_is_always_available() {
        let blob = Arc::new(MemoryBlobStore::new());
        let loader = ArtifactLoader::new(blob, "artifacts", "prod");
        let registry = loader.load_builtin();
        assert_eq!(registry.version(), 1);
        assert_eq!(registry.created_by(), "builtin");
    }
}
