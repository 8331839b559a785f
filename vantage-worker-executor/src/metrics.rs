// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_gauge_vec,
    CounterVec, HistogramTimer, HistogramVec, IntGaugeVec, Registry,
};

lazy_static! {
    pub static ref EXECUTIONS_STARTED: CounterVec = register_counter_vec!(
        opts!(
            "vantage_executions_started_total",
            "Containerized executions started, by job type"
        ),
        &["job_type"]
    )
    .unwrap();
    pub static ref EXECUTIONS_FINISHED: CounterVec = register_counter_vec!(
        opts!(
            "vantage_executions_finished_total",
            "Containerized executions finished, by job type and outcome"
        ),
        &["job_type", "outcome"]
    )
    .unwrap();
    pub static ref PROBES_TOTAL: CounterVec = register_counter_vec!(
        opts!(
            "vantage_probes_total",
            "Monitor probes executed, by kind and verdict"
        ),
        &["kind", "verdict"]
    )
    .unwrap();
    pub static ref PROBE_DURATION: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "vantage_probe_duration_seconds",
            "Monitor probe wall time, by kind",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        ),
        &["kind"]
    )
    .unwrap();
    pub static ref ALERTS_SENT: CounterVec = register_counter_vec!(
        opts!("vantage_alerts_sent_total", "Alerts emitted, by kind"),
        &["kind"]
    )
    .unwrap();
    pub static ref QUEUE_DEPTH: IntGaugeVec = register_int_gauge_vec!(
        opts!(
            "vantage_queue_depth",
            "Waiting plus delayed jobs per queue"
        ),
        &["queue"]
    )
    .unwrap();
}

/// Registers every metric of this process with the default registry and
/// returns it; called once at startup.
pub fn register_all() -> Registry {
    lazy_static::initialize(&EXECUTIONS_STARTED);
    lazy_static::initialize(&EXECUTIONS_FINISHED);
    lazy_static::initialize(&PROBES_TOTAL);
    lazy_static::initialize(&PROBE_DURATION);
    lazy_static::initialize(&ALERTS_SENT);
    lazy_static::initialize(&QUEUE_DEPTH);
    prometheus::default_registry().clone()
}

pub fn probe_timer(kind: &str) -> HistogramTimer {
    PROBE_DURATION.with_label_values(&[kind]).start_timer()
}

pub fn record_probe_outcome(kind: &str, is_up: bool) {
    PROBES_TOTAL
        .with_label_values(&[kind, if is_up { "up" } else { "down" }])
        .inc();
}

pub fn record_execution_finished(job_type: &str, passed: bool) {
    EXECUTIONS_FINISHED
        .with_label_values(&[job_type, if passed { "passed" } else { "failed" }])
        .inc();
}
