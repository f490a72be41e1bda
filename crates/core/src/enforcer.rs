//! Periodic evaluation of registered strategies and the enforce/cleanup
//! protocol around them.
//!
//! Locking discipline:
//! - the registry mutex guards the maps and is never held across `.await`;
//! - the action lock serializes every enforce/cleanup call, whether issued by
//!   a pass or by add/remove/unregister. Mutation paths take it before reading
//!   a slot's status, so the status cannot change under them;
//! - the pass lock keeps passes from interleaving with each other.
//!
//! A pass snapshots the instances, evaluates them without any lock, and then
//! reconciles each one under the action lock, discarding instances whose
//! `(key, generation)` no longer matches the registry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::Reader;
use crate::cluster::ClusterClient;
use crate::config::EnforcerConfig;
use crate::errors::{ActionError, ActionKind};
use crate::registry::{EnforcementStatus, Insertion, SnapshotEntry, StrategyRegistry};
use crate::strategy::{Enforceable, Strategy, StrategyKey, Verdict};

#[derive(Clone, Debug)]
pub struct EnforcerSettings {
    /// Upper bound for a single enforce or cleanup call.
    pub call_timeout: Duration,
}

impl Default for EnforcerSettings {
    fn default() -> Self {
        Self { call_timeout: Duration::from_secs(10) }
    }
}

impl From<&EnforcerConfig> for EnforcerSettings {
    fn from(config: &EnforcerConfig) -> Self {
        Self { call_timeout: config.call_timeout() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    NotNeeded,
    Completed,
    /// The cleanup failed and is queued for retry on later passes.
    Deferred,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Unchanged,
    Replaced { previous: CleanupOutcome },
    UnknownType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed { cleanup: CleanupOutcome },
    NotFound,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub evaluated: usize,
    pub violated: usize,
    pub inconclusive: usize,
    pub enforced: usize,
    pub enforce_failures: usize,
    pub cleaned_up: usize,
    pub cleanup_failures: usize,
    pub discarded: usize,
    pub deferred: usize,
    pub pending_cleanups: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub strategy_type: String,
    pub policy_name: String,
    pub status: EnforcementStatus,
    pub enforceable: bool,
    /// A failed enforce may have left changes that resolution or removal reverts.
    pub partially_applied: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingCleanupStatus {
    pub strategy_type: String,
    pub policy_name: String,
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EnforcerStatus {
    pub registered_types: Vec<String>,
    pub instances: Vec<InstanceStatus>,
    pub pending_cleanups: Vec<PendingCleanupStatus>,
    pub passes: u64,
    pub last_pass: Option<PassReport>,
}

impl EnforcerStatus {
    pub fn enforced_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|instance| instance.status == EnforcementStatus::Enforced)
            .count()
    }
}

#[derive(Debug, Default)]
struct PassHistory {
    passes: u64,
    last: Option<PassReport>,
}

pub struct MetricEnforcer {
    registry: Mutex<StrategyRegistry>,
    actions: AsyncMutex<()>,
    passes: AsyncMutex<()>,
    history: Mutex<PassHistory>,
    cluster: Arc<dyn ClusterClient>,
    settings: EnforcerSettings,
}

impl MetricEnforcer {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: EnforcerSettings) -> Self {
        Self {
            registry: Mutex::new(StrategyRegistry::new()),
            actions: AsyncMutex::new(()),
            passes: AsyncMutex::new(()),
            history: Mutex::new(PassHistory::default()),
            cluster,
            settings,
        }
    }

    pub fn settings(&self) -> &EnforcerSettings {
        &self.settings
    }

    pub fn register_strategy_type(&self, strategy: &dyn Strategy) {
        let strategy_type = strategy.strategy_type();
        if self.registry().register_type(strategy_type) {
            info!(
                event_name = "enforcer.type.registered",
                strategy_type,
                "strategy type registered"
            );
        } else {
            debug!(strategy_type, "strategy type already registered");
        }
    }

    /// Forgets a strategy kind. Instances of it that are enforced, or that a
    /// failed enforce left partially applied, are cleaned up first.
    pub async fn unregister_strategy_type(&self, strategy: &dyn Strategy) {
        let strategy_type = strategy.strategy_type().to_owned();
        let _actions = self.actions.lock().await;
        let removed = self.registry().unregister_type(&strategy_type);

        let instance_count = removed.len();
        for (key, slot) in removed {
            if slot.requires_cleanup() {
                self.cleanup_detached(&key, slot.strategy).await;
            }
        }

        info!(
            event_name = "enforcer.type.unregistered",
            strategy_type = %strategy_type,
            instance_count,
            "strategy type unregistered"
        );
    }

    pub fn is_registered(&self, strategy_type: &str) -> bool {
        self.registry().is_registered(strategy_type)
    }

    /// Installs `strategy` for `policy_name`, replacing a differing instance
    /// under the same key. A predecessor whose corrective action is in place,
    /// even partially, is cleaned up before this returns.
    pub async fn add_strategy(
        &self,
        mut strategy: Box<dyn Strategy>,
        policy_name: &str,
    ) -> AddOutcome {
        strategy.set_policy_name(policy_name);
        let strategy: Arc<dyn Strategy> = Arc::from(strategy);
        let key = StrategyKey::of(strategy.as_ref());

        let _actions = self.actions.lock().await;
        let insertion = self.registry().insert(strategy);

        match insertion {
            Insertion::Inserted => {
                info!(
                    event_name = "enforcer.strategy.added",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    "strategy added"
                );
                AddOutcome::Inserted
            }
            Insertion::Unchanged => {
                debug!(strategy = %key, "identical strategy already registered");
                AddOutcome::Unchanged
            }
            Insertion::UnknownType => {
                warn!(
                    event_name = "enforcer.strategy.unknown_type",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    "strategy type is not registered; ignoring strategy"
                );
                AddOutcome::UnknownType
            }
            Insertion::Replaced(previous) => {
                let cleanup = if previous.requires_cleanup() {
                    self.cleanup_detached(&key, previous.strategy).await
                } else {
                    CleanupOutcome::NotNeeded
                };
                info!(
                    event_name = "enforcer.strategy.replaced",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    previous_cleanup = ?cleanup,
                    "strategy replaced"
                );
                AddOutcome::Replaced { previous: cleanup }
            }
        }
    }

    pub async fn remove_strategy(
        &self,
        strategy: &dyn Strategy,
        policy_name: &str,
    ) -> RemoveOutcome {
        let key = StrategyKey::new(strategy.strategy_type(), policy_name);

        let _actions = self.actions.lock().await;
        let removed = self.registry().remove(&key);
        let Some(slot) = removed else {
            debug!(strategy = %key, "strategy to remove is not registered");
            return RemoveOutcome::NotFound;
        };

        let cleanup = if slot.requires_cleanup() {
            self.cleanup_detached(&key, slot.strategy).await
        } else {
            CleanupOutcome::NotNeeded
        };
        info!(
            event_name = "enforcer.strategy.removed",
            strategy_type = %key.strategy_type,
            policy_name = %key.policy_name,
            cleanup = ?cleanup,
            "strategy removed"
        );
        RemoveOutcome::Removed { cleanup }
    }

    /// Runs passes until `cancel` fires.
    ///
    /// The first tick of a tokio interval completes immediately, so a pass runs
    /// on start and then once per period. Missed ticks are skipped. A pass that
    /// has started is finished before cancellation is observed.
    pub async fn enforce_registered_strategies(
        &self,
        cache: &dyn Reader,
        mut ticker: Interval,
        cancel: CancellationToken,
    ) {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            event_name = "enforcer.loop.started",
            period_ms = ticker.period().as_millis() as u64,
            call_timeout_ms = self.settings.call_timeout.as_millis() as u64,
            "enforcement loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_pass(cache).await;
                }
            }
        }

        info!(event_name = "enforcer.loop.stopped", "enforcement loop stopped");
    }

    pub async fn run_pass(&self, cache: &dyn Reader) -> PassReport {
        let _pass = self.passes.lock().await;
        let mut report = PassReport::default();

        self.retry_pending_cleanups(&mut report).await;

        let snapshot = self.registry().snapshot();
        for entry in snapshot {
            report.evaluated += 1;
            let verdict = match entry.strategy.violated(cache) {
                Ok(verdict) => verdict,
                Err(evaluation_error) => {
                    report.inconclusive += 1;
                    warn!(
                        event_name = "enforcer.strategy.inconclusive",
                        strategy_type = %entry.key.strategy_type,
                        policy_name = %entry.key.policy_name,
                        error = %evaluation_error,
                        "violation state could not be determined; leaving enforcement unchanged"
                    );
                    continue;
                }
            };
            if verdict.is_violated() {
                report.violated += 1;
            }
            self.reconcile(&entry, &verdict, cache, &mut report).await;
        }

        report.pending_cleanups = self.registry().pending_count();
        self.record_pass(&report);
        debug!(
            event_name = "enforcer.pass.completed",
            evaluated = report.evaluated,
            violated = report.violated,
            enforced = report.enforced,
            cleaned_up = report.cleaned_up,
            failures = report.enforce_failures + report.cleanup_failures,
            "enforcement pass completed"
        );
        report
    }

    pub fn status(&self) -> EnforcerStatus {
        let (registered_types, instances, pending_cleanups) = {
            let registry = self.registry();
            let instances: Vec<InstanceStatus> = registry
                .instances()
                .map(|(key, slot)| InstanceStatus {
                    strategy_type: key.strategy_type.clone(),
                    policy_name: key.policy_name.clone(),
                    status: slot.status,
                    enforceable: slot.strategy.as_enforceable().is_some(),
                    partially_applied: slot.needs_cleanup,
                })
                .collect();
            let pending: Vec<PendingCleanupStatus> = registry
                .pending_cleanups()
                .into_iter()
                .map(|(key, pending)| PendingCleanupStatus {
                    strategy_type: key.strategy_type,
                    policy_name: key.policy_name,
                    attempts: pending.attempts,
                })
                .collect();
            (registry.registered_types(), instances, pending)
        };

        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        EnforcerStatus {
            registered_types,
            instances,
            pending_cleanups,
            passes: history.passes,
            last_pass: history.last.clone(),
        }
    }

    async fn reconcile(
        &self,
        entry: &SnapshotEntry,
        verdict: &Verdict,
        cache: &dyn Reader,
        report: &mut PassReport,
    ) {
        let key = &entry.key;
        let _actions = self.actions.lock().await;
        let (status, partially_applied, cleanup_pending) = {
            let registry = self.registry();
            match registry.current(key, entry.generation) {
                Some(slot) => (slot.status, slot.needs_cleanup, registry.has_pending_cleanup(key)),
                None => {
                    report.discarded += 1;
                    debug!(
                        strategy = %key,
                        "strategy changed during the pass; discarding evaluation"
                    );
                    return;
                }
            }
        };

        match (verdict.is_violated(), status) {
            (true, EnforcementStatus::Unenforced) => {
                let Some(enforceable) = entry.strategy.as_enforceable() else {
                    info!(
                        event_name = "enforcer.strategy.violation_reported",
                        strategy_type = %key.strategy_type,
                        policy_name = %key.policy_name,
                        targets = ?verdict.targets(),
                        "policy violated"
                    );
                    return;
                };
                if cleanup_pending {
                    report.deferred += 1;
                    warn!(
                        event_name = "enforcer.strategy.deferred",
                        strategy_type = %key.strategy_type,
                        policy_name = %key.policy_name,
                        "enforcement deferred until the previous instance is cleaned up"
                    );
                    return;
                }
                self.enforce_slot(entry, enforceable, cache, report).await;
            }
            (true, EnforcementStatus::Enforced) => {
                debug!(strategy = %key, "still violated; enforcement already in place");
            }
            (false, EnforcementStatus::Enforced) => {
                self.cleanup_slot(entry, report).await;
            }
            (false, EnforcementStatus::Unenforced) if partially_applied => {
                debug!(strategy = %key, "violation resolved; reverting a partial enforcement");
                self.cleanup_slot(entry, report).await;
            }
            (false, EnforcementStatus::Unenforced) => {}
        }
    }

    async fn enforce_slot(
        &self,
        entry: &SnapshotEntry,
        enforceable: &dyn Enforceable,
        cache: &dyn Reader,
        report: &mut PassReport,
    ) {
        let key = &entry.key;
        match self.bounded_enforce(enforceable, cache).await {
            Ok(affected) => {
                self.registry().set_status(key, entry.generation, EnforcementStatus::Enforced);
                report.enforced += 1;
                info!(
                    event_name = "enforcer.strategy.enforced",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    affected,
                    "strategy enforced"
                );
            }
            Err(action_error) => {
                report.enforce_failures += 1;
                if action_error.may_have_mutated() {
                    self.registry().mark_needs_cleanup(key, entry.generation);
                }
                warn!(
                    event_name = "enforcer.strategy.enforce_failed",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    affected = action_error.affected(),
                    error = %action_error,
                    "enforcement failed; retrying next pass"
                );
            }
        }
    }

    async fn cleanup_slot(&self, entry: &SnapshotEntry, report: &mut PassReport) {
        let key = &entry.key;
        match self.bounded_cleanup(entry.strategy.as_ref()).await {
            Ok(()) => {
                self.registry().set_status(key, entry.generation, EnforcementStatus::Unenforced);
                report.cleaned_up += 1;
                info!(
                    event_name = "enforcer.strategy.cleaned_up",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    "violation resolved; enforcement cleaned up"
                );
            }
            Err(action_error) => {
                report.cleanup_failures += 1;
                error!(
                    event_name = "enforcer.strategy.cleanup_failed",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    error = %action_error,
                    "cleanup failed; corrective action is still applied and will be retried"
                );
            }
        }
    }

    /// Cleans up after an instance that has already left the registry.
    /// Callers hold the action lock.
    async fn cleanup_detached(
        &self,
        key: &StrategyKey,
        strategy: Arc<dyn Strategy>,
    ) -> CleanupOutcome {
        if strategy.as_enforceable().is_none() {
            return CleanupOutcome::NotNeeded;
        }

        match self.bounded_cleanup(strategy.as_ref()).await {
            Ok(()) => CleanupOutcome::Completed,
            Err(action_error) => {
                error!(
                    event_name = "enforcer.strategy.cleanup_failed",
                    strategy_type = %key.strategy_type,
                    policy_name = %key.policy_name,
                    error = %action_error,
                    "cleanup of a removed strategy failed; queued for retry"
                );
                self.registry().queue_cleanup(key.clone(), strategy);
                CleanupOutcome::Deferred
            }
        }
    }

    async fn retry_pending_cleanups(&self, report: &mut PassReport) {
        let pending = self.registry().pending_cleanups();
        for (key, cleanup) in pending {
            let _actions = self.actions.lock().await;
            let attempt = {
                let mut registry = self.registry();
                if !registry.has_pending_cleanup(&key) {
                    continue;
                }
                registry.record_cleanup_attempt(&key)
            };

            match self.bounded_cleanup(cleanup.strategy.as_ref()).await {
                Ok(()) => {
                    self.registry().resolve_cleanup(&key);
                    report.cleaned_up += 1;
                    info!(
                        event_name = "enforcer.cleanup.recovered",
                        strategy_type = %key.strategy_type,
                        policy_name = %key.policy_name,
                        attempt,
                        "queued cleanup completed"
                    );
                }
                Err(action_error) => {
                    report.cleanup_failures += 1;
                    error!(
                        event_name = "enforcer.cleanup.still_failing",
                        strategy_type = %key.strategy_type,
                        policy_name = %key.policy_name,
                        attempt,
                        error = %action_error,
                        "queued cleanup failed again"
                    );
                }
            }
        }
    }

    async fn bounded_enforce(
        &self,
        enforceable: &dyn Enforceable,
        cache: &dyn Reader,
    ) -> Result<usize, ActionError> {
        let call = enforceable.enforce(self.cluster.as_ref(), cache);
        match timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(ActionError::from),
            Err(_) => Err(ActionError::TimedOut {
                operation: ActionKind::Enforce,
                timeout: self.settings.call_timeout,
            }),
        }
    }

    async fn bounded_cleanup(&self, strategy: &dyn Strategy) -> Result<(), ActionError> {
        let Some(enforceable) = strategy.as_enforceable() else {
            return Ok(());
        };
        let call = enforceable.cleanup(self.cluster.as_ref(), strategy.policy_name());
        match timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(ActionError::from),
            Err(_) => Err(ActionError::TimedOut {
                operation: ActionKind::Cleanup,
                timeout: self.settings.call_timeout,
            }),
        }
    }

    fn record_pass(&self, report: &PassReport) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.passes += 1;
        history.last = Some(report.clone());
    }

    fn registry(&self) -> MutexGuard<'_, StrategyRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
