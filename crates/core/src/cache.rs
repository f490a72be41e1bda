//! Read-only access to the current metric values, keyed by metric name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CacheError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeMetric {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl NodeMetric {
    pub fn now(value: f64) -> Self {
        Self { value, timestamp: Utc::now() }
    }
}

/// Samples of a single metric, keyed by node name.
pub type NodeMetrics = BTreeMap<String, NodeMetric>;

pub trait Reader: Send + Sync {
    fn read_metric(&self, metric_name: &str) -> Result<NodeMetrics, CacheError>;
}

#[derive(Debug, Default)]
pub struct MetricCache {
    metrics: RwLock<HashMap<String, NodeMetrics>>,
    max_age: Option<Duration>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads of a metric whose newest sample is older than `max_age` fail with
    /// [`CacheError::Stale`].
    pub fn with_max_age(max_age: Duration) -> Self {
        Self { metrics: RwLock::default(), max_age: Some(max_age) }
    }

    pub fn write_metric(&self, metric_name: impl Into<String>, samples: NodeMetrics) {
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(metric_name.into(), samples);
    }

    pub fn delete_metric(&self, metric_name: &str) -> bool {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).remove(metric_name).is_some()
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.metrics.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    fn check_freshness(&self, metric_name: &str, samples: &NodeMetrics) -> Result<(), CacheError> {
        let Some(max_age) = self.max_age else {
            return Ok(());
        };
        let Some(newest) = samples.values().map(|sample| sample.timestamp).max() else {
            return Ok(());
        };

        let age = Utc::now() - newest;
        if age > max_age {
            return Err(CacheError::Stale {
                metric: metric_name.to_owned(),
                age_secs: age.num_seconds(),
            });
        }
        Ok(())
    }
}

impl Reader for MetricCache {
    fn read_metric(&self, metric_name: &str) -> Result<NodeMetrics, CacheError> {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        let samples =
            metrics.get(metric_name).ok_or_else(|| CacheError::NotFound(metric_name.to_owned()))?;
        self.check_freshness(metric_name, samples)?;
        Ok(samples.clone())
    }
}
