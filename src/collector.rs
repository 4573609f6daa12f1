//! Per-container collectors.
//!
//! A [`ContainerCollector`] owns everything needed to measure one
//! container: the cgroup directory handle, one [`CpuGroup`] per online
//! CPU, and the mapping from kernel event ids back to event names. Ids
//! flow from the opening groups through the id channel into that mapping;
//! decoded values flow from the per-CPU read tasks through the value
//! channel into one per-event sum. Each map is owned by exactly one drain
//! task, so no locking is needed: construction completes only after the
//! id channel has been drained, and a profile pass completes only after
//! the value channel has.
//!
//! Collectors live for a single collection pass. Opening the descriptors
//! zeroes the counters, so the values a pass produces are the activity
//! since the collector was built.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::cgroup;
use crate::errors::CollectError;
use crate::events::{self, Event};
use crate::flags::ReadFormat;
use crate::group::{CounterValue, CpuGroup, EventId, GroupSpec};
use crate::{discovery, Builder};

/// The events collected for every container. The first entry leads each
/// counter group; the kernel schedules the group as a unit, so all three
/// cover identical time slices.
pub const EVENTS: [&str; 3] = ["instructions", "cycles", "LONGEST_LAT_CACHE.MISS"];

/// Identity of one container, stable for the container's lifetime.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Unit {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub container_id: String,
}

impl Unit {
    /// Build the identity key of `container` within `pod`.
    pub fn new(pod: &discovery::Pod, container: &discovery::ContainerStatus) -> Unit {
        Unit {
            namespace: pod.metadata.namespace.clone(),
            pod: pod.metadata.name.clone(),
            container: container.name.clone(),
            container_id: container.container_id.clone(),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Collects one container through per-CPU counter groups.
pub struct ContainerCollector {
    unit: Unit,
    /// Keeps the perf target directory open for as long as any group
    /// might still reference it.
    _cgroup: Arc<File>,
    groups: Vec<CpuGroup>,
    /// Kernel id -> event name, filled once during open.
    names: Arc<HashMap<u64, String>>,
}

impl ContainerCollector {
    /// Open counter groups for `unit` on every online CPU.
    ///
    /// The groups of different CPUs are opened concurrently; within one
    /// group the leader strictly precedes its followers. Every opened
    /// event publishes its kernel id, and the id channel is fully drained
    /// before this returns, so a subsequent [`profile`] can resolve every
    /// id it reads back.
    ///
    /// Any single failure abandons the container for this pass: already
    /// opened descriptors are closed and the error is returned.
    ///
    /// [`profile`]: ContainerCollector::profile
    pub async fn open(
        unit: Unit,
        cgroup_path: PathBuf,
        event_names: &[&str],
    ) -> Result<ContainerCollector, CollectError> {
        let cgroup = Arc::new(cgroup::open_dir(&cgroup_path)?);
        let spec = Arc::new(GroupSpec::encode(EVENTS[0], event_names)?);

        let (id_tx, mut id_rx) = mpsc::unbounded_channel();
        let id_collector: JoinHandle<HashMap<u64, String>> = tokio::spawn(async move {
            let mut names = HashMap::new();
            while let Some(EventId { id, event }) = id_rx.recv().await {
                names.insert(id, event);
            }
            names
        });

        let mut opens = JoinSet::new();
        for cpu in cgroup::online_cpus() {
            let cgroup = Arc::clone(&cgroup);
            let spec = Arc::clone(&spec);
            let ids = id_tx.clone();
            opens.spawn_blocking(move || CpuGroup::open(&cgroup, cpu, &spec, &ids));
        }
        drop(id_tx);

        let mut groups = Vec::new();
        let mut failed = None;
        while let Some(joined) = opens.join_next().await {
            match joined? {
                Ok(group) => groups.push(group),
                Err(err) => failed = Some(failed.unwrap_or(err)),
            }
        }
        if let Some(err) = failed {
            // Dropping `groups` closes whatever descriptors were opened.
            return Err(err);
        }
        groups.sort_by_key(|group| group.cpu());

        let names = Arc::new(id_collector.await?);

        Ok(ContainerCollector {
            unit,
            _cgroup: cgroup,
            groups,
            names,
        })
    }

    /// The container this collector measures.
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Read every CPU's group once, in parallel, and return the per-event
    /// sums across CPUs.
    ///
    /// A read failure on one CPU drops that CPU's contribution and is
    /// logged; the remaining CPUs still count. All descriptors are closed
    /// by the time this returns, and the returned map is only assembled
    /// after every read task has finished and the value channel is
    /// drained.
    pub async fn profile(mut self) -> Result<HashMap<String, f64>, CollectError> {
        let (value_tx, value_rx) = mpsc::unbounded_channel();
        let aggregator = spawn_value_collector(Arc::clone(&self.names), value_rx);

        let mut reads = JoinSet::new();
        for mut group in self.groups.drain(..) {
            let values = value_tx.clone();
            let who = self.unit.clone();
            reads.spawn_blocking(move || {
                match group.read_scaled() {
                    Ok(pairs) => {
                        for pair in pairs {
                            let _ = values.send(pair);
                        }
                    }
                    Err(err) => log::warn!("{who}: dropping cpu {}: {err}", group.cpu()),
                }
                group
            });
        }
        drop(value_tx);

        // Every read has to finish before any descriptor is closed; only
        // then is the whole group torn down.
        let mut done = Vec::with_capacity(reads.len());
        while let Some(joined) = reads.join_next().await {
            done.push(joined?);
        }
        drop(done);

        Ok(aggregator.await?)
    }
}

/// Drain decoded `(id, value)` pairs into per-event-name sums.
///
/// The returned task owns the map exclusively; it finishes when every
/// sender is gone, which establishes the ordering between the last read
/// and the first use of the sums.
fn spawn_value_collector(
    names: Arc<HashMap<u64, String>>,
    mut values: mpsc::UnboundedReceiver<CounterValue>,
) -> JoinHandle<HashMap<String, f64>> {
    tokio::spawn(async move {
        let mut sums: HashMap<String, f64> = HashMap::new();
        while let Some(CounterValue { id, value }) = values.recv().await {
            match names.get(&id) {
                Some(event) => *sums.entry(event.clone()).or_default() += value as f64,
                None => log::debug!("dropping value for unknown counter id {id}"),
            }
        }
        sums
    })
}

/// Collects one container through independent hardware counters.
///
/// The simpler of the two backends: instead of one grouped read per CPU,
/// each event is an independent counter that is read and scaled on its
/// own. Without grouping the events are not scheduled together, so their
/// values cover slightly different slices of time; in exchange the
/// backend works with any number of events the PMU can multiplex, and
/// involves no grouped-format decoding at all. Only portable hardware
/// events are supported here; model-specific names are skipped.
pub struct SimpleCollector {
    unit: Unit,
    _cgroup: Arc<File>,
    cpus: Vec<SimpleCpu>,
}

struct SimpleCpu {
    cpu: usize,
    counters: Vec<(String, crate::Counter)>,
}

impl SimpleCpu {
    fn open(
        cgroup: &File,
        cpu: usize,
        kinds: &[(String, Event)],
    ) -> Result<SimpleCpu, CollectError> {
        let mut counters = Vec::with_capacity(kinds.len());
        for (name, event) in kinds {
            let mut counter = Builder::new()
                .kind(*event)
                .observe_cgroup(cgroup)
                .one_cpu(cpu)
                .inherit(true)
                .read_format(ReadFormat::TOTAL_TIME_ENABLED | ReadFormat::TOTAL_TIME_RUNNING)
                .build()
                .map_err(|source| CollectError::Open {
                    event: name.clone(),
                    cpu,
                    source,
                })?;
            counter.reset().map_err(|source| CollectError::Open {
                event: name.clone(),
                cpu,
                source,
            })?;
            counter.enable().map_err(|source| CollectError::Open {
                event: name.clone(),
                cpu,
                source,
            })?;
            counters.push((name.clone(), counter));
        }
        Ok(SimpleCpu { cpu, counters })
    }

    fn read_scaled(&mut self) -> Result<Vec<(String, u64)>, CollectError> {
        let mut readings = Vec::with_capacity(self.counters.len());
        for (name, counter) in &mut self.counters {
            let cat = counter
                .read_count_and_time()
                .map_err(|source| CollectError::Read {
                    cpu: self.cpu,
                    source,
                })?;
            if let Some(scaled) = cat.scaled_count() {
                readings.push((name.clone(), scaled));
            }
        }
        Ok(readings)
    }
}

impl SimpleCollector {
    /// Open independent counters for every portable hardware event in
    /// `event_names` on every online CPU.
    pub async fn open(
        unit: Unit,
        cgroup_path: PathBuf,
        event_names: &[&str],
    ) -> Result<SimpleCollector, CollectError> {
        let cgroup = Arc::new(cgroup::open_dir(&cgroup_path)?);

        let mut kinds = Vec::new();
        for name in event_names {
            match events::resolve(name) {
                Ok(event @ Event::Hardware(_)) => kinds.push((name.to_string(), event)),
                Ok(Event::Raw(_)) | Err(_) => {
                    log::debug!("simple backend skips non-generic event {name:?}");
                }
            }
        }
        let kinds = Arc::new(kinds);

        let mut opens = JoinSet::new();
        for cpu in cgroup::online_cpus() {
            let cgroup = Arc::clone(&cgroup);
            let kinds = Arc::clone(&kinds);
            opens.spawn_blocking(move || SimpleCpu::open(&cgroup, cpu, &kinds));
        }

        let mut cpus = Vec::new();
        let mut failed = None;
        while let Some(joined) = opens.join_next().await {
            match joined? {
                Ok(cpu) => cpus.push(cpu),
                Err(err) => failed = Some(failed.unwrap_or(err)),
            }
        }
        if let Some(err) = failed {
            return Err(err);
        }
        cpus.sort_by_key(|c| c.cpu);

        Ok(SimpleCollector {
            unit,
            _cgroup: cgroup,
            cpus,
        })
    }

    /// The container this collector measures.
    pub fn unit(&self) -> &Unit {
        &self.unit
    }

    /// Read and scale every counter once, in parallel per CPU, and return
    /// the per-event sums across CPUs.
    pub async fn profile(mut self) -> Result<HashMap<String, f64>, CollectError> {
        let mut reads = JoinSet::new();
        for mut cpu in self.cpus.drain(..) {
            let who = self.unit.clone();
            reads.spawn_blocking(move || match cpu.read_scaled() {
                Ok(readings) => readings,
                Err(err) => {
                    log::warn!("{who}: dropping cpu {}: {err}", cpu.cpu);
                    Vec::new()
                }
            });
        }

        let mut sums: HashMap<String, f64> = HashMap::new();
        while let Some(joined) = reads.join_next().await {
            for (name, value) in joined? {
                *sums.entry(name).or_default() += value as f64;
            }
        }
        Ok(sums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readings_from_all_cpus_sum_per_event() {
        let names: HashMap<u64, String> = HashMap::from([
            (1, "cycles".to_owned()),
            (2, "instructions".to_owned()),
        ]);
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = spawn_value_collector(Arc::new(names), rx);

        // Two per-CPU groups worth of decoded readings.
        for pair in [
            CounterValue { id: 1, value: 10 },
            CounterValue { id: 2, value: 20 },
        ] {
            tx.send(pair).unwrap();
        }
        for pair in [
            CounterValue { id: 1, value: 30 },
            CounterValue { id: 2, value: 40 },
        ] {
            tx.send(pair).unwrap();
        }
        drop(tx);

        let sums = aggregator.await.unwrap();
        assert_eq!(sums.get("cycles"), Some(&40.0));
        assert_eq!(sums.get("instructions"), Some(&60.0));
        // Never more entries than configured events.
        assert!(sums.len() <= EVENTS.len());
    }

    #[tokio::test]
    async fn values_with_unknown_ids_are_dropped() {
        let names: HashMap<u64, String> = HashMap::from([(1, "cycles".to_owned())]);
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = spawn_value_collector(Arc::new(names), rx);

        tx.send(CounterValue { id: 1, value: 5 }).unwrap();
        tx.send(CounterValue { id: 99, value: 1_000 }).unwrap();
        drop(tx);

        let sums = aggregator.await.unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums.get("cycles"), Some(&5.0));
    }

    #[test]
    fn unit_identity_comes_from_pod_and_container() {
        let pod: discovery::Pod = serde_json::from_value(serde_json::json!({
            "metadata": {
                "uid": "8e97aaf0-3461-45cd-902b-0922dd6af6e0",
                "name": "nginx-1",
                "namespace": "default"
            },
            "status": {
                "containerStatuses": [
                    { "name": "nginx", "containerID": "containerd://7f7c" }
                ]
            }
        }))
        .unwrap();

        let unit = Unit::new(&pod, &pod.status.container_statuses[0]);
        assert_eq!(unit.namespace, "default");
        assert_eq!(unit.pod, "nginx-1");
        assert_eq!(unit.container, "nginx");
        assert_eq!(unit.container_id, "containerd://7f7c");
        assert_eq!(unit.to_string(), "default/nginx-1/nginx");
    }
}
