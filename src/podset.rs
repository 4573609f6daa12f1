//! Fan-out of collectors over every container on the node.
//!
//! A [`PodSetCollector`] is built fresh for each collection pass from the
//! current pod listing, drives every container's construction and profile
//! concurrently, and pushes the results into the gauges. Failures stay
//! local: a container that cannot be opened or read is logged and skipped
//! without affecting its siblings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tokio::task::JoinSet;

use crate::cgroup;
use crate::collector::{ContainerCollector, SimpleCollector, Unit, EVENTS};
use crate::discovery::{self, Pod};
use crate::metrics::ContainerGauges;

/// Which collector implementation measures the containers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Backend {
    /// Grouped per-CPU counters with id-tagged reads, including
    /// model-specific events. The default.
    RawGroup,
    /// Independent portable hardware counters, read one by one.
    SimpleHardware,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Backend, String> {
        match s {
            "raw-group" => Ok(Backend::RawGroup),
            "simple-hardware" => Ok(Backend::SimpleHardware),
            other => Err(format!(
                "unknown backend {other:?}, expected \"raw-group\" or \"simple-hardware\""
            )),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Backend::RawGroup => "raw-group",
            Backend::SimpleHardware => "simple-hardware",
        })
    }
}

enum AnyCollector {
    Group(ContainerCollector),
    Simple(SimpleCollector),
}

/// The collectors of every measurable container found in one pod listing.
pub struct PodSetCollector {
    collectors: HashMap<Unit, AnyCollector>,
}

impl PodSetCollector {
    /// Construct a collector for every running container of `pods`,
    /// concurrently, and keep the ones that opened successfully.
    pub async fn open(backend: Backend, pods: Vec<Pod>) -> PodSetCollector {
        let mut builds = JoinSet::new();

        for (pod, containers) in discovery::running_containers(pods) {
            for container in &containers {
                let unit = Unit::new(&pod, container);
                let path =
                    match cgroup::container_path(&pod.metadata.uid, &container.container_id) {
                        Ok(path) => path,
                        Err(err) => {
                            log::warn!("{unit}: skipping container: {err}");
                            continue;
                        }
                    };
                builds.spawn(async move {
                    let opened = match backend {
                        Backend::RawGroup => ContainerCollector::open(unit.clone(), path, &EVENTS)
                            .await
                            .map(AnyCollector::Group),
                        Backend::SimpleHardware => {
                            SimpleCollector::open(unit.clone(), path, &EVENTS)
                                .await
                                .map(AnyCollector::Simple)
                        }
                    };
                    (unit, opened)
                });
            }
        }

        let mut collectors = HashMap::new();
        while let Some(joined) = builds.join_next().await {
            match joined {
                Ok((unit, Ok(collector))) => {
                    collectors.insert(unit, collector);
                }
                Ok((unit, Err(err))) => log::warn!("{unit}: skipping container: {err}"),
                Err(err) => log::error!("collector construction task failed: {err}"),
            }
        }

        PodSetCollector { collectors }
    }

    /// Number of containers this pass will measure.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Whether there is anything to measure at all.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Profile every container concurrently and publish the results.
    ///
    /// Consumes the collector set: descriptors are closed as each
    /// container's pass finishes, and the next pass starts from a fresh
    /// pod listing.
    pub async fn profile(self, gauges: &ContainerGauges) {
        let mut passes = JoinSet::new();

        for (unit, collector) in self.collectors {
            let gauges = gauges.clone();
            passes.spawn(async move {
                let readings = match collector {
                    AnyCollector::Group(c) => c.profile().await,
                    AnyCollector::Simple(c) => c.profile().await,
                };
                match readings {
                    Ok(values) => {
                        log::debug!("{unit}: {values:?}");
                        gauges.record(&unit, &values);
                    }
                    Err(err) => log::warn!("{unit}: profile failed: {err}"),
                }
            });
        }

        while let Some(joined) = passes.join_next().await {
            if let Err(err) = joined {
                log::error!("profile task failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_round_trip() {
        for backend in [Backend::RawGroup, Backend::SimpleHardware] {
            assert_eq!(backend.to_string().parse::<Backend>(), Ok(backend));
        }
        assert!("libpfm4".parse::<Backend>().is_err());
    }

    #[tokio::test]
    async fn unreachable_cgroups_leave_an_empty_set() {
        // Pods whose container ids are malformed cannot be resolved to a
        // cgroup, so nothing is opened and nothing errors out loud.
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": { "uid": "u-1", "name": "p", "namespace": "default" },
            "status": {
                "containerStatuses": [ { "name": "c", "containerID": "oops" } ]
            }
        }))
        .unwrap();

        let set = PodSetCollector::open(Backend::RawGroup, vec![pod]).await;
        assert!(set.is_empty());
    }
}
