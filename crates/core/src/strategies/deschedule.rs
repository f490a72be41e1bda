use std::any::Any;
use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::Reader;
use crate::cluster::ClusterClient;
use crate::errors::{ClusterError, EnforceError, EvaluationError};
use crate::strategies::{evaluate_rules, LogicalOperator, TelemetryRule};
use crate::strategy::{structurally_equal, Enforceable, Strategy, Verdict};

pub(super) const STRATEGY_TYPE: &str = "deschedule";

pub const VIOLATING_LABEL_VALUE: &str = "violating";

const LABEL_PREFIX: &str = "telemetry.aware.scheduling.";

pub fn violation_label(policy_name: &str) -> String {
    format!("{LABEL_PREFIX}{policy_name}")
}

/// Labels nodes that violate the policy so a descheduler can evict from them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescheduleStrategy {
    policy_name: String,
    rules: Vec<TelemetryRule>,
    logical_operator: LogicalOperator,
}

impl DescheduleStrategy {
    pub fn new(
        policy_name: impl Into<String>,
        rules: Vec<TelemetryRule>,
        logical_operator: LogicalOperator,
    ) -> Self {
        Self { policy_name: policy_name.into(), rules, logical_operator }
    }
}

impl Strategy for DescheduleStrategy {
    fn strategy_type(&self) -> &str {
        STRATEGY_TYPE
    }

    fn policy_name(&self) -> &str {
        &self.policy_name
    }

    fn set_policy_name(&mut self, policy_name: &str) {
        self.policy_name = policy_name.to_owned();
    }

    fn violated(&self, cache: &dyn Reader) -> Result<Verdict, EvaluationError> {
        evaluate_rules(&self.rules, self.logical_operator, cache).map(Verdict::from_details)
    }

    fn equals(&self, other: &dyn Strategy) -> bool {
        structurally_equal(self, other)
    }

    fn as_enforceable(&self) -> Option<&dyn Enforceable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl Enforceable for DescheduleStrategy {
    async fn enforce(
        &self,
        cluster: &dyn ClusterClient,
        cache: &dyn Reader,
    ) -> Result<usize, EnforceError> {
        let verdict = self.violated(cache)?;
        let violating: BTreeSet<&str> = verdict.targets().into_iter().collect();
        let label = violation_label(&self.policy_name);
        let nodes = cluster.list_nodes().await?;

        let mut labelled = 0;
        let mut first_failure: Option<ClusterError> = None;
        for node in &nodes {
            let is_violating = violating.contains(node.name.as_str());
            let carries_label = node.label(&label).is_some();

            let result = if is_violating {
                cluster.set_node_label(&node.name, &label, VIOLATING_LABEL_VALUE).await
            } else if carries_label {
                cluster.remove_node_label(&node.name, &label).await
            } else {
                continue;
            };

            match result {
                Ok(()) if is_violating => labelled += 1,
                Ok(()) => {
                    debug!(node = %node.name, label = %label, "removed stale violation label");
                }
                Err(error) => {
                    warn!(
                        node = %node.name,
                        label = %label,
                        error = %error,
                        "node label patch failed"
                    );
                    first_failure.get_or_insert(error);
                }
            }
        }

        match first_failure {
            Some(source) => Err(EnforceError::cluster(labelled, source)),
            None => Ok(labelled),
        }
    }

    async fn cleanup(
        &self,
        cluster: &dyn ClusterClient,
        policy_name: &str,
    ) -> Result<(), EnforceError> {
        let label = violation_label(policy_name);
        let nodes = cluster.list_nodes().await?;

        let mut removed = 0;
        for node in nodes.iter().filter(|node| node.label(&label).is_some()) {
            cluster
                .remove_node_label(&node.name, &label)
                .await
                .map_err(|source| EnforceError::cluster(removed, source))?;
            removed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{violation_label, DescheduleStrategy, VIOLATING_LABEL_VALUE};
    use crate::cache::{MetricCache, NodeMetric};
    use crate::cluster::InMemoryCluster;
    use crate::errors::{EnforceError, EvaluationError};
    use crate::strategies::{LogicalOperator, TelemetryRule};
    use crate::strategy::{Enforceable, Operator, Strategy};

    fn cpu_cache(values: &[(&str, f64)]) -> MetricCache {
        let cache = MetricCache::new();
        cache.write_metric(
            "node_cpu",
            values
                .iter()
                .map(|(node, value)| (node.to_string(), NodeMetric::now(*value)))
                .collect(),
        );
        cache
    }

    fn strategy() -> DescheduleStrategy {
        DescheduleStrategy::new(
            "policy-a",
            vec![TelemetryRule::new("node_cpu", Operator::GreaterThan, 80)],
            LogicalOperator::AnyOf,
        )
    }

    #[tokio::test]
    async fn enforce_labels_violating_nodes_only() {
        let cluster = InMemoryCluster::with_nodes(["node-a", "node-b", "node-c"]);
        let cache = cpu_cache(&[("node-a", 95.0), ("node-b", 20.0), ("node-c", 81.0)]);
        let strategy = strategy();
        let enforceable = strategy.as_enforceable().expect("deschedule is enforceable");

        let affected = enforceable.enforce(&cluster, &cache).await.expect("enforce succeeds");

        assert_eq!(affected, 2);
        let label = violation_label("policy-a");
        assert_eq!(
            cluster.nodes_with_label(&label).await,
            vec!["node-a".to_owned(), "node-c".to_owned()]
        );
        let node = cluster.node("node-a").await.expect("node-a exists");
        assert_eq!(node.label(&label), Some(VIOLATING_LABEL_VALUE));
    }

    #[tokio::test]
    async fn enforce_unlabels_nodes_that_recovered() {
        let cluster = InMemoryCluster::with_nodes(["node-a", "node-b"]);
        let strategy = strategy();
        let enforceable = strategy.as_enforceable().expect("deschedule is enforceable");
        enforceable
            .enforce(&cluster, &cpu_cache(&[("node-a", 95.0), ("node-b", 95.0)]))
            .await
            .expect("first enforce");

        let affected = enforceable
            .enforce(&cluster, &cpu_cache(&[("node-a", 95.0), ("node-b", 10.0)]))
            .await
            .expect("second enforce");

        assert_eq!(affected, 1);
        assert_eq!(cluster.nodes_with_label(&violation_label("policy-a")).await, vec!["node-a"]);
    }

    #[tokio::test]
    async fn partial_failure_reports_affected_count() {
        let cluster = InMemoryCluster::with_nodes(["node-a", "node-b"]);
        cluster.fail_requests_for("node-b").await;
        let strategy = strategy();

        let error = strategy
            .as_enforceable()
            .expect("deschedule is enforceable")
            .enforce(&cluster, &cpu_cache(&[("node-a", 95.0), ("node-b", 95.0)]))
            .await
            .expect_err("node-b rejects patches");

        assert_eq!(error.affected(), 1);
        assert!(matches!(error, EnforceError::Cluster { .. }));
    }

    #[tokio::test]
    async fn enforce_refuses_to_act_without_metrics() {
        let cluster = InMemoryCluster::with_nodes(["node-a"]);
        let strategy = strategy();

        let error = strategy
            .as_enforceable()
            .expect("deschedule is enforceable")
            .enforce(&cluster, &MetricCache::new())
            .await
            .expect_err("metric missing");

        assert!(matches!(error, EnforceError::Evaluation(EvaluationError::Cache(_))));
        assert_eq!(cluster.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_the_policy_label_everywhere() {
        let cluster = InMemoryCluster::with_nodes(["node-a", "node-b"]);
        let strategy = strategy();
        let enforceable = strategy.as_enforceable().expect("deschedule is enforceable");
        enforceable
            .enforce(&cluster, &cpu_cache(&[("node-a", 95.0), ("node-b", 95.0)]))
            .await
            .expect("enforce");

        enforceable.cleanup(&cluster, "policy-a").await.expect("cleanup");

        assert!(cluster.nodes_with_label(&violation_label("policy-a")).await.is_empty());
    }
}
