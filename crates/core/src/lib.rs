pub mod cache;
pub mod cluster;
pub mod config;
pub mod enforcer;
pub mod errors;
pub mod registry;
pub mod strategies;
pub mod strategy;

pub use cache::{MetricCache, NodeMetric, NodeMetrics, Reader};
pub use cluster::{ClusterClient, InMemoryCluster, Node};
pub use config::{AppConfig, ConfigError, ConfigOverrides, EnforcerConfig, LoadOptions};
pub use enforcer::{
    AddOutcome, CleanupOutcome, EnforcerSettings, EnforcerStatus, InstanceStatus, MetricEnforcer,
    PassReport, PendingCleanupStatus, RemoveOutcome,
};
pub use errors::{
    ActionError, ActionKind, CacheError, ClusterError, EnforceError, EvaluationError,
    StrategyError,
};
pub use registry::EnforcementStatus;
pub use strategies::{
    build_strategy, builtin_types, DescheduleStrategy, DontScheduleStrategy, LogicalOperator,
    TelemetryRule,
};
pub use strategy::{Enforceable, Operator, Strategy, StrategyKey, Verdict, ViolationDetail};
