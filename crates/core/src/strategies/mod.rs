//! Built-in strategy kinds.
//!
//! - `dontschedule`: reports nodes that break any rule; no corrective action.
//! - `deschedule`: labels violating nodes so workloads can be moved off them.

mod deschedule;
mod dontschedule;

pub use deschedule::{violation_label, DescheduleStrategy, VIOLATING_LABEL_VALUE};
pub use dontschedule::DontScheduleStrategy;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::Reader;
use crate::config::StrategyConfig;
use crate::errors::{EvaluationError, StrategyError};
use crate::strategy::{Operator, Strategy, ViolationDetail};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRule {
    pub metric_name: String,
    pub operator: Operator,
    pub target: i64,
}

impl TelemetryRule {
    pub fn new(metric_name: impl Into<String>, operator: Operator, target: i64) -> Self {
        Self { metric_name: metric_name.into(), operator, target }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogicalOperator {
    #[default]
    AnyOf,
    AllOf,
}

/// Violations of `rules` across all nodes reporting their metrics.
///
/// A metric that cannot be read makes the whole evaluation fail; under
/// `AllOf` a node is reported only if it breaks every rule.
pub fn evaluate_rules(
    rules: &[TelemetryRule],
    logical_operator: LogicalOperator,
    cache: &dyn Reader,
) -> Result<Vec<ViolationDetail>, EvaluationError> {
    if rules.is_empty() {
        return Err(EvaluationError::InvalidRule("no rules to evaluate".to_string()));
    }

    let mut per_node: BTreeMap<String, Vec<ViolationDetail>> = BTreeMap::new();
    for rule in rules {
        let samples = cache.read_metric(&rule.metric_name)?;
        for (node, sample) in samples {
            if !sample.value.is_finite() {
                continue;
            }
            if rule.operator.holds(sample.value, rule.target) {
                per_node.entry(node.clone()).or_default().push(ViolationDetail {
                    target: node,
                    metric: rule.metric_name.clone(),
                    observed: sample.value,
                    operator: rule.operator,
                    threshold: rule.target,
                });
            }
        }
    }

    Ok(per_node
        .into_values()
        .filter(|details| match logical_operator {
            LogicalOperator::AnyOf => true,
            LogicalOperator::AllOf => details.len() == rules.len(),
        })
        .flatten()
        .collect())
}

/// One prototype per built-in kind, for registering the types with an enforcer.
pub fn builtin_types() -> Vec<Box<dyn Strategy>> {
    vec![Box::new(DontScheduleStrategy::default()), Box::new(DescheduleStrategy::default())]
}

pub fn build_strategy(
    config: &StrategyConfig,
    policy_name: &str,
) -> Result<Box<dyn Strategy>, StrategyError> {
    if config.rules.is_empty() {
        return Err(StrategyError::NoRules {
            strategy_type: config.strategy_type.clone(),
            policy_name: policy_name.to_owned(),
        });
    }

    match config.strategy_type.as_str() {
        dontschedule::STRATEGY_TYPE => {
            Ok(Box::new(DontScheduleStrategy::new(policy_name, config.rules.clone())))
        }
        deschedule::STRATEGY_TYPE => Ok(Box::new(DescheduleStrategy::new(
            policy_name,
            config.rules.clone(),
            config.logical_operator.unwrap_or_default(),
        ))),
        other => Err(StrategyError::UnknownType(other.to_owned())),
    }
}
