use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::config::ClusterSettings;
use crate::message::{HealthReport, Task};
use crate::model::{ClusterPair, ClusterRole};
use crate::state::ClusterHealth;

/// Why a health report was not applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleReport {
    pub reported: String,
    pub current: Option<String>,
}

/// Periodic readiness polling for the configured clusters.
///
/// Each (re)start begins a new tick generation; ticks from an older generation are
/// ignored so at most one chain is ever live.
#[derive(Debug)]
pub struct HealthPoller {
    interval: Duration,
    generation: u64,
    pub primary: ClusterHealth,
    pub secondary: ClusterHealth,
}

impl HealthPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            generation: 0,
            primary: ClusterHealth::default(),
            secondary: ClusterHealth::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, role: ClusterRole) -> &ClusterHealth {
        match role {
            ClusterRole::Primary => &self.primary,
            ClusterRole::Secondary => &self.secondary,
        }
    }

    fn get_mut(&mut self, role: ClusterRole) -> &mut ClusterHealth {
        match role {
            ClusterRole::Primary => &mut self.primary,
            ClusterRole::Secondary => &mut self.secondary,
        }
    }

    /// Ends the current tick chain without starting another.
    pub fn pause(&mut self) {
        self.generation += 1;
    }

    /// Resets both records for `pair`, queries immediately and starts a new chain.
    pub fn restart(&mut self, pair: &ClusterPair, settings: &ClusterSettings) -> Vec<Task> {
        self.generation += 1;
        self.primary = ClusterHealth::for_cluster(pair.cluster(ClusterRole::Primary));
        self.secondary = ClusterHealth::for_cluster(pair.cluster(ClusterRole::Secondary));

        let mut tasks = self.queries(pair, settings);
        tasks.push(self.next_tick());
        tasks
    }

    /// Handles a tick. Returns `None` for a tick from a superseded chain.
    pub fn on_tick(
        &mut self,
        generation: u64,
        pair: Option<&ClusterPair>,
        settings: &ClusterSettings,
    ) -> Option<Vec<Task>> {
        if generation != self.generation {
            debug!(generation, current = self.generation, "dropping stale health tick");
            return None;
        }
        let mut tasks = pair
            .map(|pair| self.queries(pair, settings))
            .unwrap_or_default();
        tasks.push(self.next_tick());
        Some(tasks)
    }

    fn next_tick(&self) -> Task {
        Task::HealthTick {
            generation: self.generation,
            after: self.interval,
        }
    }

    /// One readiness query per configured role; marks each as loading.
    fn queries(&mut self, pair: &ClusterPair, settings: &ClusterSettings) -> Vec<Task> {
        let mut tasks = Vec::new();
        for role in [ClusterRole::Primary, ClusterRole::Secondary] {
            let Some(cluster) = pair.cluster(role) else {
                continue;
            };
            self.get_mut(role).is_loading = true;
            tasks.push(Task::QueryHealth {
                context: settings.context_for(&cluster),
                cluster,
                role,
            });
        }
        tasks
    }

    /// Applies a report if it still describes the configured cluster of its role.
    pub fn apply(
        &mut self,
        report: HealthReport,
        pair: Option<&ClusterPair>,
    ) -> Result<(), StaleReport> {
        let current = pair.and_then(|p| p.cluster(report.role));
        if current.as_deref() != Some(report.cluster.as_str()) {
            return Err(StaleReport {
                reported: report.cluster,
                current,
            });
        }

        let health = self.get_mut(report.role);
        match report.result {
            Ok(counts) => {
                health.ready_nodes = counts.ready;
                health.total_nodes = counts.total;
                health.error = None;
            }
            Err(err) => health.error = Some(err),
        }
        health.is_loading = false;
        health.last_updated = Some(SystemTime::now());
        Ok(())
    }
}
