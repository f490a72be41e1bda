//! The contract every strategy kind implements to take part in enforcement.
//!
//! A strategy always reports whether its policy is violated. Strategies that
//! also take a corrective action expose it through [`Strategy::as_enforceable`].

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::Reader;
use crate::cluster::ClusterClient;
use crate::errors::{EnforceError, EvaluationError};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StrategyKey {
    pub strategy_type: String,
    pub policy_name: String,
}

impl StrategyKey {
    pub fn new(strategy_type: impl Into<String>, policy_name: impl Into<String>) -> Self {
        Self { strategy_type: strategy_type.into(), policy_name: policy_name.into() }
    }

    pub fn of(strategy: &dyn Strategy) -> Self {
        Self::new(strategy.strategy_type(), strategy.policy_name())
    }
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.strategy_type, self.policy_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    LessThan,
    GreaterThan,
    Equals,
}

impl Operator {
    pub fn holds(self, observed: f64, target: i64) -> bool {
        let target = target as f64;
        match self {
            Self::LessThan => observed < target,
            Self::GreaterThan => observed > target,
            Self::Equals => observed == target,
        }
    }
}

impl std::str::FromStr for Operator {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "LessThan" => Ok(Self::LessThan),
            "GreaterThan" => Ok(Self::GreaterThan),
            "Equals" => Ok(Self::Equals),
            other => Err(format!("unsupported operator `{other}`")),
        }
    }
}

/// One target (node) for which a rule matched.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViolationDetail {
    pub target: String,
    pub metric: String,
    pub observed: f64,
    pub operator: Operator,
    pub threshold: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub enum Verdict {
    #[default]
    Compliant,
    Violated(Vec<ViolationDetail>),
}

impl Verdict {
    pub fn from_details(details: Vec<ViolationDetail>) -> Self {
        if details.is_empty() {
            Self::Compliant
        } else {
            Self::Violated(details)
        }
    }

    pub fn is_violated(&self) -> bool {
        matches!(self, Self::Violated(details) if !details.is_empty())
    }

    pub fn details(&self) -> &[ViolationDetail] {
        match self {
            Self::Compliant => &[],
            Self::Violated(details) => details,
        }
    }

    /// Distinct violating targets, in detail order.
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        for detail in self.details() {
            if !targets.contains(&detail.target.as_str()) {
                targets.push(&detail.target);
            }
        }
        targets
    }
}

pub trait Strategy: Send + Sync + fmt::Debug {
    fn strategy_type(&self) -> &str;

    fn policy_name(&self) -> &str;

    fn set_policy_name(&mut self, policy_name: &str);

    fn violated(&self, cache: &dyn Reader) -> Result<Verdict, EvaluationError>;

    /// Value equality over type, policy name and parameters; never identity.
    fn equals(&self, other: &dyn Strategy) -> bool;

    fn as_enforceable(&self) -> Option<&dyn Enforceable> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait Enforceable: Send + Sync {
    /// Applies the corrective action and returns how many targets it touched.
    async fn enforce(
        &self,
        cluster: &dyn ClusterClient,
        cache: &dyn Reader,
    ) -> Result<usize, EnforceError>;

    async fn cleanup(&self, cluster: &dyn ClusterClient, policy_name: &str)
        -> Result<(), EnforceError>;
}

/// Shared `equals` body for strategies whose parameters derive `PartialEq`.
pub fn structurally_equal<S>(this: &S, other: &dyn Strategy) -> bool
where
    S: Strategy + PartialEq + 'static,
{
    other.as_any().downcast_ref::<S>().is_some_and(|other| other == this)
}
