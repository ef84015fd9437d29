//
// Copyright 2025 The gRPC Gateway Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Prometheus instrumentation.
//!
//! Request counters and latency histograms are fed by the built-in telemetry
//! interceptor; worker gauges come from a custom collector that samples the
//! pool on every scrape. The gateway owns the registry but no exposition
//! endpoint; the host process decides how to publish it.

use std::sync::Weak;

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

use crate::pool::WorkerInfo;

const NAMESPACE: &str = "grpc_gateway";

/// Read-only view on the current worker set. Implemented by the gateway's
/// shared state; the collector never owns the pool.
pub trait WorkersSource: Send + Sync {
    fn workers(&self) -> Vec<WorkerInfo>;
}

/// Per-request metrics recorded by the telemetry interceptor.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    /// Total number of handled requests, by full method and status code.
    pub request_counter: IntCounterVec,
    /// Request latency in seconds, by full method.
    pub request_duration: HistogramVec,
    /// Requests currently inside the handler chain.
    pub queue_size: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = IntCounterVec::new(
            Opts::new("request_total", "Total number of handled requests.").namespace(NAMESPACE),
            &["method", "status"],
        )
        .unwrap();
        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Request duration in seconds.")
                .namespace(NAMESPACE),
            &["method"],
        )
        .unwrap();
        let queue_size = IntGauge::with_opts(
            Opts::new("requests_queue_size", "Number of requests currently being handled.")
                .namespace(NAMESPACE),
        )
        .unwrap();

        registry.register(Box::new(request_counter.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(queue_size.clone())).unwrap();

        GatewayMetrics {
            registry,
            request_counter,
            request_duration,
            queue_size,
        }
    }

    /// Attaches the worker gauges for the given pool observation handle.
    pub fn register_worker_collector(&self, source: Weak<dyn WorkersSource>) {
        self.registry
            .register(Box::new(WorkerCollector::new(source)))
            .unwrap();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        GatewayMetrics::new()
    }
}

/// Samples the worker set on every scrape.
pub struct WorkerCollector {
    source: Weak<dyn WorkersSource>,
    total_workers: IntGauge,
    workers_ready: IntGauge,
    workers_working: IntGauge,
    workers_invalid: IntGauge,
    workers_memory: IntGauge,
    worker_state: IntGaugeVec,
    worker_memory: IntGaugeVec,
}

impl WorkerCollector {
    pub fn new(source: Weak<dyn WorkersSource>) -> Self {
        WorkerCollector {
            source,
            total_workers: IntGauge::with_opts(
                Opts::new("total_workers", "Total number of workers used by the gateway.")
                    .namespace(NAMESPACE),
            )
            .unwrap(),
            workers_ready: IntGauge::with_opts(
                Opts::new("workers_ready", "Workers currently in ready state.")
                    .namespace(NAMESPACE),
            )
            .unwrap(),
            workers_working: IntGauge::with_opts(
                Opts::new("workers_working", "Workers currently in working state.")
                    .namespace(NAMESPACE),
            )
            .unwrap(),
            workers_invalid: IntGauge::with_opts(
                Opts::new(
                    "workers_invalid",
                    "Workers currently in invalid, killing, destroyed, errored or inactive states.",
                )
                .namespace(NAMESPACE),
            )
            .unwrap(),
            workers_memory: IntGauge::with_opts(
                Opts::new("workers_memory_bytes", "Memory usage by workers.").namespace(NAMESPACE),
            )
            .unwrap(),
            worker_state: IntGaugeVec::new(
                Opts::new("worker_state", "Worker current state.").namespace(NAMESPACE),
                &["state", "pid"],
            )
            .unwrap(),
            worker_memory: IntGaugeVec::new(
                Opts::new("worker_memory_bytes", "Worker current memory usage.")
                    .namespace(NAMESPACE),
                &["pid"],
            )
            .unwrap(),
        }
    }
}

impl Collector for WorkerCollector {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = Vec::new();
        descs.extend(self.total_workers.desc());
        descs.extend(self.workers_ready.desc());
        descs.extend(self.workers_working.desc());
        descs.extend(self.workers_invalid.desc());
        descs.extend(self.workers_memory.desc());
        descs.extend(self.worker_state.desc());
        descs.extend(self.worker_memory.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let workers = match self.source.upgrade() {
            Some(source) => source.workers(),
            // Gateway already gone; report nothing rather than stale zeros.
            None => return Vec::new(),
        };

        let mut ready = 0;
        let mut working = 0;
        let mut invalid = 0;
        let mut memory = 0u64;

        self.worker_state.reset();
        self.worker_memory.reset();

        for worker in &workers {
            match worker.state {
                crate::pool::WorkerState::Ready => ready += 1,
                crate::pool::WorkerState::Working => working += 1,
                crate::pool::WorkerState::Invalid => invalid += 1,
            }
            memory += worker.memory_bytes;

            let pid = worker.pid.to_string();
            self.worker_state
                .with_label_values(&[worker.state.as_str(), &pid])
                .set(1);
            self.worker_memory
                .with_label_values(&[&pid])
                .set(worker.memory_bytes as i64);
        }

        self.total_workers.set(workers.len() as i64);
        self.workers_ready.set(ready);
        self.workers_working.set(working);
        self.workers_invalid.set(invalid);
        self.workers_memory.set(memory as i64);

        let mut families = Vec::new();
        families.extend(self.total_workers.collect());
        families.extend(self.workers_ready.collect());
        families.extend(self.workers_working.collect());
        families.extend(self.workers_invalid.collect());
        families.extend(self.workers_memory.collect());
        families.extend(self.worker_state.collect());
        families.extend(self.worker_memory.collect());
        families
    }
}
