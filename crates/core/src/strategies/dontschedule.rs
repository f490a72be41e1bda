use std::any::Any;

use crate::cache::Reader;
use crate::errors::EvaluationError;
use crate::strategies::{evaluate_rules, LogicalOperator, TelemetryRule};
use crate::strategy::{structurally_equal, Strategy, Verdict};

pub(super) const STRATEGY_TYPE: &str = "dontschedule";

/// Marks nodes breaking any rule as unsuitable for new workloads.
///
/// Only evaluated; the scheduler side consults the verdict when filtering.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DontScheduleStrategy {
    policy_name: String,
    rules: Vec<TelemetryRule>,
}

impl DontScheduleStrategy {
    pub fn new(policy_name: impl Into<String>, rules: Vec<TelemetryRule>) -> Self {
        Self { policy_name: policy_name.into(), rules }
    }

    pub fn rules(&self) -> &[TelemetryRule] {
        &self.rules
    }
}

impl Strategy for DontScheduleStrategy {
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
        evaluate_rules(&self.rules, LogicalOperator::AnyOf, cache).map(Verdict::from_details)
    }

    fn equals(&self, other: &dyn Strategy) -> bool {
        structurally_equal(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
