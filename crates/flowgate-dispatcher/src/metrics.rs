// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch metrics.
//!
//! OpenTelemetry instruments recorded by the scheduler, the reconciler and
//! the finalizer. Nothing is exported unless a meter provider is installed
//! (the binary installs an OTLP one when `OTEL_EXPORTER_OTLP_ENDPOINT` is
//! set).
//!
//! | Instrument | Kind | Attributes |
//! |------------|------|------------|
//! | `flowgate.dispatch.submissions` | counter | `outcome`: `success`, `fail`, `skip` |
//! | `flowgate.dispatch.queue_wait` | histogram (ms) | |
//! | `flowgate.dispatch.setup_time` | histogram (ms) | |
//! | `flowgate.dispatch.no_capacity` | counter | |
//! | `flowgate.executions.failovers` | counter | `policy`: `requeue`, `fail` |
//! | `flowgate.executions.finalized` | counter | `status` |

use std::time::Duration;

use chrono::{DateTime, Utc};
use flowgate_core::{FailoverPolicy, Status};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing::{info, warn};

/// Instrumentation scope name.
pub const METER_NAME: &str = "flowgate-dispatcher";

/// How a submission to an executor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The executor accepted the flow and it is RUNNING.
    Success,
    /// The executor rejected the flow or could not be reached.
    Fail,
    /// The dispatch was abandoned: killed or changed while in flight.
    Skip,
}

impl SubmitOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SubmitOutcome::Success => "success",
            SubmitOutcome::Fail => "fail",
            SubmitOutcome::Skip => "skip",
        }
    }
}

/// Dispatcher instruments.
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    submissions: Counter<u64>,
    queue_wait: Histogram<f64>,
    setup_time: Histogram<f64>,
    no_capacity: Counter<u64>,
    failovers: Counter<u64>,
    finalized: Counter<u64>,
}

impl DispatchMetrics {
    /// Create the instruments on `meter`.
    pub fn new(meter: &Meter) -> Self {
        Self {
            submissions: meter
                .u64_counter("flowgate.dispatch.submissions")
                .with_description("Flow submissions to executors by outcome")
                .build(),
            queue_wait: meter
                .f64_histogram("flowgate.dispatch.queue_wait")
                .with_description("Time from submission to the executor accepting the flow")
                .with_unit("ms")
                .build(),
            setup_time: meter
                .f64_histogram("flowgate.dispatch.setup_time")
                .with_description("Duration of the submit call to the executor")
                .with_unit("ms")
                .build(),
            no_capacity: meter
                .u64_counter("flowgate.dispatch.no_capacity")
                .with_description("Dispatch rounds that found no executor with capacity")
                .build(),
            failovers: meter
                .u64_counter("flowgate.executions.failovers")
                .with_description("Executions moved off a lost executor")
                .build(),
            finalized: meter
                .u64_counter("flowgate.executions.finalized")
                .with_description("Executions that reached a terminal status")
                .build(),
        }
    }

    /// Instruments on the globally installed meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    /// Count a submission outcome.
    pub fn record_submit(&self, outcome: SubmitOutcome) {
        self.submissions
            .add(1, &[KeyValue::new("outcome", outcome.as_str())]);
    }

    /// Record how long an execution waited between submission and start.
    pub fn record_queue_wait(&self, submitted: DateTime<Utc>, started: DateTime<Utc>) {
        let wait = (started - submitted).num_milliseconds().max(0);
        self.queue_wait.record(wait as f64, &[]);
    }

    /// Record the duration of a submit call.
    pub fn record_setup_time(&self, elapsed: Duration) {
        self.setup_time.record(elapsed.as_secs_f64() * 1000.0, &[]);
    }

    /// Count a dispatch round without executor capacity.
    pub fn record_no_capacity(&self) {
        self.no_capacity.add(1, &[]);
    }

    /// Count a failover.
    pub fn record_failover(&self, policy: FailoverPolicy) {
        let policy = match policy {
            FailoverPolicy::Requeue => "requeue",
            FailoverPolicy::Fail => "fail",
        };
        self.failovers.add(1, &[KeyValue::new("policy", policy)]);
    }

    /// Count a terminal transition.
    pub fn record_finalized(&self, status: Status) {
        self.finalized
            .add(1, &[KeyValue::new("status", status.as_str())]);
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::global()
    }
}

/// Install a global OTLP meter provider if `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// Returns the provider so the caller can shut it down on exit.
pub fn init_otlp() -> Option<SdkMeterProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| METER_NAME.to_string());
    let resource = Resource::builder().with_service_name(service_name).build();

    let exporter = match MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            warn!(error = %e, "Failed to create OTLP metric exporter");
            return None;
        }
    };

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_periodic_exporter(exporter)
        .build();
    opentelemetry::global::set_meter_provider(provider.clone());
    info!(endpoint = %endpoint, "OTLP metrics enabled");
    Some(provider)
}


#[cfg(test)]
mod tests {
    use super::testing::CapturedMetrics;
    use super::*;

    #[test]
    fn test_submit_outcomes_are_counted_separately() {
        let captured = CapturedMetrics::new();
        let name = "flowgate.dispatch.submissions";
        assert_eq!(captured.counter(name, None), 0);

        captured.metrics.record_submit(SubmitOutcome::Fail);
        captured.metrics.record_submit(SubmitOutcome::Skip);
        captured.metrics.record_submit(SubmitOutcome::Success);
        captured.metrics.record_submit(SubmitOutcome::Success);

        assert_eq!(captured.counter(name, Some(("outcome", "fail"))), 1);
        assert_eq!(captured.counter(name, Some(("outcome", "skip"))), 1);
        assert_eq!(captured.counter(name, Some(("outcome", "success"))), 2);
        assert_eq!(captured.counter(name, None), 4);
    }

    #[test]
    fn test_queue_wait_and_setup_time() {
        let captured = CapturedMetrics::new();
        let submitted = Utc::now();
        captured
            .metrics
            .record_queue_wait(submitted, submitted + chrono::Duration::milliseconds(500));
        captured
            .metrics
            .record_queue_wait(submitted, submitted + chrono::Duration::milliseconds(1000));
        captured.metrics.record_setup_time(Duration::from_millis(120));

        assert_eq!(captured.histogram_count("flowgate.dispatch.queue_wait"), 2);
        assert_eq!(captured.histogram_count("flowgate.dispatch.setup_time"), 1);
    }

    #[test]
    fn test_failovers_and_finalized_by_attribute() {
        let captured = CapturedMetrics::new();
        captured.metrics.record_failover(FailoverPolicy::Requeue);
        captured.metrics.record_failover(FailoverPolicy::Fail);
        captured.metrics.record_finalized(Status::Succeeded);
        captured.metrics.record_finalized(Status::Killed);
        captured.metrics.record_no_capacity();

        assert_eq!(
            captured.counter("flowgate.executions.failovers", Some(("policy", "requeue"))),
            1
        );
        assert_eq!(
            captured.counter("flowgate.executions.finalized", Some(("status", "KILLED"))),
            1
        );
        assert_eq!(captured.counter("flowgate.executions.finalized", None), 2);
        assert_eq!(captured.counter("flowgate.dispatch.no_capacity", None), 1);
    }
}
