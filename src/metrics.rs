use std::time::Instant;

use chrono::{DateTime, Utc};
use kube::runtime::events::{Recorder, Reporter};
use kube::{Client, ResourceExt};
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry,
};
use serde::Serialize;

use crate::api::managed_cluster_addon::{
    ManagedClusterAddOn, ManagedClusterAddOnStatus, RegistrationPhase,
};
use crate::Error;

const PHASES: [RegistrationPhase; 5] = [
    RegistrationPhase::Progressing,
    RegistrationPhase::AwaitingManualApproval,
    RegistrationPhase::Denied,
    RegistrationPhase::InvalidConfig,
    RegistrationPhase::Complete,
];

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub registrations: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "addon_registration_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &[],
        )?;
        let failures = IntCounterVec::new(
            opts!(
                "addon_registration_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["instance", "error"],
        )?;
        let reconciliations = IntCounter::new(
            "addon_registration_reconciliations_total",
            "reconciliations",
        )?;
        let registrations = IntGaugeVec::new(
            opts!(
                "addon_registration_registrations",
                "registrations per addon by phase",
            ),
            &["cluster", "addon", "phase"],
        )?;

        Ok(Self {
            reconciliations,
            failures,
            reconcile_duration,
            registrations,
        })
    }

    /// Register API metrics to start tracking them
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.registrations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, addon: &ManagedClusterAddOn, e: &Error) {
        self.failures
            .with_label_values(&[addon.name_any().as_str(), e.metric_label().as_str()])
            .inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }

    pub fn set_registrations(&self, addon: &ManagedClusterAddOn, status: &ManagedClusterAddOnStatus) {
        let cluster = addon.namespace().unwrap_or_default();
        let name = addon.name_any();
        for phase in PHASES {
            let count = status
                .registrations
                .iter()
                .filter(|r| r.phase == phase)
                .count();
            self.registrations
                .with_label_values(&[cluster.as_str(), name.as_str(), phase.as_str()])
                .set(count as i64);
        }
    }

    pub fn forget(&self, addon: &ManagedClusterAddOn) {
        let cluster = addon.namespace().unwrap_or_default();
        let name = addon.name_any();
        for phase in PHASES {
            // Absent series are fine
            let _ = self.registrations.remove_label_values(&[
                cluster.as_str(),
                name.as_str(),
                phase.as_str(),
            ]);
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[] as &[&str]).observe(duration);
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "addon-registration-controller".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}
