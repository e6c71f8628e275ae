use std::{sync::Arc, time::Instant};

use kube::{Resource, ResourceExt};
use opentelemetry::trace::TraceId;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tracing::debug;

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub reconcile: ReconcileMetrics,
    pub storage: StorageMetrics,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("rook_operator");
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        let storage = StorageMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            reconcile,
            storage,
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ControllerLabels {
    pub controller: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ErrorLabels {
    pub controller: String,
    pub instance: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<ControllerLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Family<ControllerLabels, Histogram>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<ControllerLabels, Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60., 300.].into_iter())
            }),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("reconcile_failures", "reconciliation errors", self.failures.clone());
        r.register("reconcile_runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure<K: Resource<DynamicType = ()>>(&self, obj: &K, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                controller: K::kind(&()).to_string(),
                instance: obj.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure<K: Resource<DynamicType = ()>>(
        &self,
        _obj: &K,
        trace_id: &TraceId,
    ) -> ReconcileMeasurer {
        let labels = ControllerLabels {
            controller: K::kind(&()).to_string(),
        };
        self.runs.get_or_create(&labels).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            trace_id: *trace_id,
            metric: self.duration.get_or_create(&labels).clone(),
        }
    }
}

/// Records the reconcile duration when dropped.
pub struct ReconcileMeasurer {
    start: Instant,
    trace_id: TraceId,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        if self.trace_id != TraceId::INVALID {
            debug!(trace_id = %self.trace_id, duration, "reconcile finished");
        }
        self.metric.observe(duration);
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ClusterLabels {
    pub namespace: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct OutcomeLabels {
    pub outcome: String,
}

/// Gauges and counters describing the storage cluster itself.
#[derive(Clone, Default)]
pub struct StorageMetrics {
    pub mons_in_quorum: Family<ClusterLabels, Gauge>,
    pub mon_failovers: Family<ClusterLabels, Counter>,
    pub osd_orchestrations: Family<OutcomeLabels, Counter>,
    pub attachments: Family<OutcomeLabels, Counter>,
}

impl StorageMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("mons_in_quorum", "monitors currently in quorum", self.mons_in_quorum.clone());
        r.register("mon_failovers", "monitors replaced after leaving quorum", self.mon_failovers.clone());
        r.register(
            "osd_orchestrations",
            "per-node osd orchestrations by final status",
            self.osd_orchestrations.clone(),
        );
        r.register("volume_attachments", "attach requests by outcome", self.attachments.clone());
        self
    }

    pub fn quorum_size(&self, namespace: &str, size: usize) {
        self.mons_in_quorum
            .get_or_create(&ClusterLabels {
                namespace: namespace.to_string(),
            })
            .set(size as i64);
    }

    pub fn failover(&self, namespace: &str) {
        self.mon_failovers
            .get_or_create(&ClusterLabels {
                namespace: namespace.to_string(),
            })
            .inc();
    }

    pub fn orchestration(&self, outcome: &str) {
        self.osd_orchestrations
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn attachment(&self, outcome: &str) {
        self.attachments
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }
}
