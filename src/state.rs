//! Application state shared across all request handlers and workers.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::middleware::AdmissionController;
use crate::models::Config;
use crate::publish::PublishQueue;
use crate::registry::{FieldRegistryService, RulesetRegistry};
use crate::service::EvalService;
use crate::storage::ArtifactLoader;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<EvalService>,
    pub fields: Arc<FieldRegistryService>,
    pub registry: Arc<RulesetRegistry>,
    pub loader: Arc<ArtifactLoader>,
    pub admission: Arc<AdmissionController>,
    pub publish: PublishQueue,
    /// Flipped off at shutdown so load balancers drain this instance.
    pub ready: Arc<AtomicBool>,
    /// Absent in tests that do not install a recorder.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}
