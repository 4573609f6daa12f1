//! The exported gauges and the scrape endpoint that serves them.
//!
//! One gauge family, `container_cpi`, keyed by namespace, pod, container,
//! container id and the event kind. Each collection pass overwrites the
//! three event kinds of every container it managed to read; because the
//! counters are reopened per pass, the exported values are per-interval
//! deltas, not monotonic totals.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use hyper::http::StatusCode;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::cgroup::CACHE_LINE_BYTES;
use crate::collector::Unit;

/// Label names of the gauge family.
const NAMESPACE: &str = "namespace";
const POD: &str = "pod";
const CONTAINER: &str = "container";
const CONTAINER_ID: &str = "containerid";
const CPI_TYPE: &str = "cpi_type";

/// Event names as they appear both in the collected value maps and in the
/// `cpi_type` label.
pub const CYCLES: &str = "cycles";
pub const INSTRUCTIONS: &str = "instructions";
pub const CACHE_MISS: &str = "LONGEST_LAT_CACHE.MISS";

type CpiFamily = Family<Vec<(String, String)>, Gauge<f64, AtomicU64>>;

/// The per-container gauges of this collector.
#[derive(Clone)]
pub struct ContainerGauges {
    cpi: CpiFamily,
}

impl ContainerGauges {
    /// Create the gauges and register them with `registry`.
    pub fn register(registry: &mut Registry) -> ContainerGauges {
        let cpi = CpiFamily::default();
        registry.register(
            "container_cpi",
            "Per-interval scaled counter deltas (cycles, instructions, cache-miss GB/s) per container",
            cpi.clone(),
        );
        ContainerGauges { cpi }
    }

    /// Publish one container's aggregated readings.
    ///
    /// `values` maps event names to the multiplexing-corrected sums
    /// across CPUs. Cycles and instructions are exported as raw counts;
    /// the cache-miss count is converted to an estimated bandwidth in
    /// GB/s by multiplying with the cache line size.
    pub fn record(&self, unit: &Unit, values: &HashMap<String, f64>) {
        if let Some(cycles) = values.get(CYCLES) {
            self.set(unit, CYCLES, *cycles);
        }
        if let Some(instructions) = values.get(INSTRUCTIONS) {
            self.set(unit, INSTRUCTIONS, *instructions);
        }
        if let Some(misses) = values.get(CACHE_MISS) {
            self.set(unit, CACHE_MISS, CACHE_LINE_BYTES * misses / 1e9);
        }
    }

    fn set(&self, unit: &Unit, kind: &str, value: f64) {
        self.cpi.get_or_create(&labels(unit, kind)).set(value);
    }

    #[cfg(test)]
    fn get(&self, unit: &Unit, kind: &str) -> f64 {
        self.cpi.get_or_create(&labels(unit, kind)).get()
    }
}

fn labels(unit: &Unit, kind: &str) -> Vec<(String, String)> {
    vec![
        (NAMESPACE.to_owned(), unit.namespace.clone()),
        (POD.to_owned(), unit.pod.clone()),
        (CONTAINER.to_owned(), unit.container.clone()),
        (CONTAINER_ID.to_owned(), unit.container_id.clone()),
        (CPI_TYPE.to_owned(), kind.to_owned()),
    ]
}

/// Serve `registry` in the scrape text format on `addr` under `/metrics`.
///
/// Runs until the process exits; meant to be spawned once at startup.
pub async fn serve(registry: Arc<Registry>, addr: SocketAddr) {
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    if req.uri().path() != "/metrics" {
                        return Ok::<Response<Body>, hyper::Error>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap(),
                        );
                    }

                    let mut buf = String::new();
                    if let Err(e) = encode(&mut buf, &registry) {
                        log::error!("failed to encode metrics: {e}");
                        return Ok(Response::builder()
                            .status(StatusCode::INTERNAL_SERVER_ERROR)
                            .body(Body::from("Internal Server Error"))
                            .unwrap());
                    }

                    Ok(Response::builder()
                        .header(
                            "Content-Type",
                            "application/openmetrics-text; version=1.0.0; charset=utf-8",
                        )
                        .body(Body::from(buf))
                        .unwrap())
                }
            }))
        }
    });

    log::info!("metrics exporter available on http://{addr}/metrics");
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        log::error!("metrics server error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> Unit {
        Unit {
            namespace: "default".to_owned(),
            pod: "nginx-1".to_owned(),
            container: "nginx".to_owned(),
            container_id: "containerd://7f7ccf05e97b".to_owned(),
        }
    }

    #[test]
    fn cache_miss_count_becomes_gigabytes_per_second() {
        let mut registry = Registry::default();
        let gauges = ContainerGauges::register(&mut registry);

        let mut values = HashMap::new();
        values.insert(CACHE_MISS.to_owned(), 15_625_000.0);
        gauges.record(&unit(), &values);

        // 64 bytes per line * 15.625e6 misses / 1e9 = 1.0 GB/s.
        assert_eq!(gauges.get(&unit(), CACHE_MISS), 1.0);
    }

    #[test]
    fn cycles_and_instructions_pass_through_unscaled() {
        let mut registry = Registry::default();
        let gauges = ContainerGauges::register(&mut registry);

        let mut values = HashMap::new();
        values.insert(CYCLES.to_owned(), 40.0);
        values.insert(INSTRUCTIONS.to_owned(), 60.0);
        gauges.record(&unit(), &values);

        assert_eq!(gauges.get(&unit(), CYCLES), 40.0);
        assert_eq!(gauges.get(&unit(), INSTRUCTIONS), 60.0);
        // No cache-miss reading this pass, so nothing was written there.
        assert_eq!(gauges.get(&unit(), CACHE_MISS), 0.0);
    }

    #[test]
    fn gauges_overwrite_between_passes() {
        let mut registry = Registry::default();
        let gauges = ContainerGauges::register(&mut registry);

        let mut values = HashMap::new();
        values.insert(CYCLES.to_owned(), 100.0);
        gauges.record(&unit(), &values);
        values.insert(CYCLES.to_owned(), 25.0);
        gauges.record(&unit(), &values);

        assert_eq!(gauges.get(&unit(), CYCLES), 25.0);
    }
}
