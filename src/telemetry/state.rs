use chrono::{DateTime, Utc};
use kube::{
    runtime::events::{Recorder, Reporter},
    Client,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::metrics::Metrics;
use crate::{
    client::executor::{CommandExecutor, ProcessExecutor},
    cluster::controller::ClusterRegistry,
    config::OperatorConfig,
    mon::config::ConfigWriter,
};

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
    /// Runs the backend tools
    pub executor: Arc<dyn CommandExecutor>,
    /// Writes connection config and keyrings under the config dir
    pub writer: ConfigWriter,
    /// Live mon managers, one per cluster namespace
    pub clusters: ClusterRegistry,
    /// Cancelled when the operator shuts down
    pub cancel: CancellationToken,
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    pub config: Arc<OperatorConfig>,
    pub clusters: ClusterRegistry,
    cancel: CancellationToken,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            diagnostics: Default::default(),
            metrics: Default::default(),
            config: Arc::new(config),
            clusters: Default::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stops long running work handed a token from this state.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// A token cancelled by [`State::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, registry) {
            tracing::warn!("failed to encode metrics: {e}");
        }
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Marks a reconcile of `controller` in the diagnostics
    pub async fn touch(diagnostics: &RwLock<Diagnostics>, controller: &str) {
        let mut d = diagnostics.write().await;
        let now = Utc::now();
        d.last_event = now;
        d.controllers.insert(controller.to_string(), now);
    }

    // Create a Controller Context that can update State
    pub async fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: self.diagnostics.read().await.recorder(client),
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            config: self.config.clone(),
            executor: Arc::new(ProcessExecutor),
            writer: ConfigWriter::new(
                self.config.config_dir.clone(),
                self.config.keyring_mirror.clone(),
            ),
            clusters: self.clusters.clone(),
            cancel: self.cancel.clone(),
        })
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// Last reconcile time per controller
    pub controllers: BTreeMap<String, DateTime<Utc>>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            controllers: BTreeMap::new(),
            reporter: "rook-operator".into(),
        }
    }
}

impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}
