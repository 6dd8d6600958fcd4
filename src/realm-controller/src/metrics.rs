// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Metrics for the reconciliation loop.

use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

use realm_types::{InstancePhase, RealmStatus};

#[derive(Debug, Clone)]
pub struct Metrics {
    /// The number of realms with a status record.
    pub realms: IntGauge,
    /// The number of instances, by phase.
    pub instances: IntGaugeVec,
    pub promotions: IntCounter,
    pub instance_failures: IntCounter,
    pub instances_deleted: IntCounter,
    pub reconcile_errors: IntCounter,
    pub status_write_conflicts: IntCounter,
}

impl Metrics {
    pub fn register_into(registry: &Registry) -> Result<Metrics, prometheus::Error> {
        let metrics = Metrics {
            realms: IntGauge::new("realmd_realms", "The number of realms under management.")?,
            instances: IntGaugeVec::new(
                Opts::new("realmd_instances", "The number of instances, by lifecycle phase."),
                &["phase"],
            )?,
            promotions: IntCounter::new(
                "realmd_promotions_total",
                "Total number of instances promoted to latest.",
            )?,
            instance_failures: IntCounter::new(
                "realmd_instance_failures_total",
                "Total number of instances that failed to start.",
            )?,
            instances_deleted: IntCounter::new(
                "realmd_instances_deleted_total",
                "Total number of instances torn down.",
            )?,
            reconcile_errors: IntCounter::new(
                "realmd_reconcile_errors_total",
                "Total number of reconciliation passes aborted by an error.",
            )?,
            status_write_conflicts: IntCounter::new(
                "realmd_status_write_conflicts_total",
                "Total number of status writes rejected as stale.",
            )?,
        };
        registry.register(Box::new(metrics.realms.clone()))?;
        registry.register(Box::new(metrics.instances.clone()))?;
        registry.register(Box::new(metrics.promotions.clone()))?;
        registry.register(Box::new(metrics.instance_failures.clone()))?;
        registry.register(Box::new(metrics.instances_deleted.clone()))?;
        registry.register(Box::new(metrics.reconcile_errors.clone()))?;
        registry.register(Box::new(metrics.status_write_conflicts.clone()))?;
        Ok(metrics)
    }

    /// Metrics that are not exported anywhere.
    pub fn unregistered() -> Metrics {
        Metrics::register_into(&Registry::new()).expect("metric names are valid")
    }

    /// Resets the gauges from a full listing of realm statuses.
    pub fn observe(&self, statuses: &[RealmStatus]) {
        self.realms
            .set(i64::try_from(statuses.len()).unwrap_or(i64::MAX));
        for phase in InstancePhase::ALL {
            let count = statuses
                .iter()
                .flat_map(|s| &s.instances)
                .filter(|i| i.phase == phase)
                .count();
            self.instances
                .with_label_values(&[phase.as_str()])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn observe_counts_instances_by_phase() {
        let registry = Registry::new();
        let metrics = Metrics::register_into(&registry).unwrap();
        let mut status = RealmStatus::new("r1".into(), "default");
        let a = status.allocate_instance(&"h1".into(), Utc::now());
        status.allocate_instance(&"h2".into(), Utc::now());
        status.promote(&a);

        metrics.observe(&[status]);
        assert_eq!(metrics.realms.get(), 1);
        assert_eq!(metrics.instances.with_label_values(&["latest"]).get(), 1);
        assert_eq!(metrics.instances.with_label_values(&["pending"]).get(), 1);
        assert_eq!(metrics.instances.with_label_values(&["failed"]).get(), 0);
        assert!(!registry.gather().is_empty());
    }
}
