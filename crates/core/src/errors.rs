use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("metric `{0}` was not found in the cache")]
    NotFound(String),
    #[error("metric `{metric}` is stale (newest sample is {age_secs}s old)")]
    Stale { metric: String, age_secs: i64 },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("strategy rule cannot be evaluated: {0}")]
    InvalidRule(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("node `{0}` was not found")]
    NodeNotFound(String),
    #[error("cluster request failed: {0}")]
    Request(String),
}

/// Failure of an enforce or cleanup call.
///
/// `affected` is the number of targets that were mutated before the failure,
/// so partial success stays visible in logs.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EnforceError {
    #[error("cluster mutation failed after {affected} target(s): {source}")]
    Cluster {
        affected: usize,
        #[source]
        source: ClusterError,
    },
    #[error("violations could not be re-evaluated: {0}")]
    Evaluation(#[from] EvaluationError),
}

impl EnforceError {
    pub fn cluster(affected: usize, source: ClusterError) -> Self {
        Self::Cluster { affected, source }
    }

    pub fn affected(&self) -> usize {
        match self {
            Self::Cluster { affected, .. } => *affected,
            Self::Evaluation(_) => 0,
        }
    }
}

impl From<ClusterError> for EnforceError {
    fn from(source: ClusterError) -> Self {
        Self::Cluster { affected: 0, source }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Enforce,
    Cleanup,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enforce => f.write_str("enforce"),
            Self::Cleanup => f.write_str("cleanup"),
        }
    }
}

/// Outcome of a bounded enforce/cleanup call as seen by the enforcer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error(transparent)]
    Failed(#[from] EnforceError),
    #[error("{operation} did not finish within {timeout:?}")]
    TimedOut { operation: ActionKind, timeout: Duration },
}

impl ActionError {
    pub fn affected(&self) -> usize {
        match self {
            Self::Failed(error) => error.affected(),
            Self::TimedOut { .. } => 0,
        }
    }

    /// A timed-out call was dropped at an unknown point, so it may have
    /// mutated targets even though none were reported.
    pub fn may_have_mutated(&self) -> bool {
        match self {
            Self::Failed(error) => error.affected() > 0,
            Self::TimedOut { .. } => true,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("unsupported strategy type `{0}` (expected dontschedule|deschedule)")]
    UnknownType(String),
    #[error("strategy `{strategy_type}` for policy `{policy_name}` declares no rules")]
    NoRules { strategy_type: String, policy_name: String },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::errors::{
        ActionError, ActionKind, CacheError, ClusterError, EnforceError, EvaluationError,
    };

    #[test]
    fn enforce_error_reports_partial_progress() {
        let error = EnforceError::cluster(2, ClusterError::Request("patch rejected".to_owned()));

        assert_eq!(
            error.to_string(),
            "cluster mutation failed after 2 target(s): cluster request failed: patch rejected"
        );
        let action_error = ActionError::from(error);
        assert_eq!(action_error.affected(), 2);
        assert!(action_error.may_have_mutated());
    }

    #[test]
    fn failures_before_any_mutation_leave_nothing_behind() {
        let untouched = ActionError::from(EnforceError::from(ClusterError::Request(
            "node list unavailable".to_owned(),
        )));
        let unevaluated = ActionError::from(EnforceError::from(EvaluationError::InvalidRule(
            "no rules".to_owned(),
        )));

        assert!(!untouched.may_have_mutated());
        assert!(!unevaluated.may_have_mutated());
    }

    #[test]
    fn timeout_reports_operation_and_bound() {
        let error = ActionError::TimedOut {
            operation: ActionKind::Cleanup,
            timeout: Duration::from_secs(3),
        };

        assert_eq!(error.to_string(), "cleanup did not finish within 3s");
        assert_eq!(error.affected(), 0);
        assert!(error.may_have_mutated());
    }

    #[test]
    fn cache_errors_convert_into_evaluation_errors() {
        let error = EvaluationError::from(CacheError::NotFound("node_cpu".to_owned()));

        assert!(matches!(
            error,
            EvaluationError::Cache(CacheError::NotFound(ref metric)) if metric == "node_cpu"
        ));
        assert_eq!(error.to_string(), "metric `node_cpu` was not found in the cache");
    }
}
