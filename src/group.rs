//! Leader/follower counter groups, one per (container, CPU) pair.
//!
//! A [`CpuGroup`] owns the descriptors of one event group opened against
//! one cgroup on one CPU. The leader is opened first and disabled; every
//! follower is opened against the leader's descriptor; then the whole
//! group is reset and enabled atomically through the leader. Reading the
//! leader returns every member's value in one syscall, so all values in a
//! reading cover exactly the same slice of time.
//!
//! With grouped reads the kernel produces one contiguous payload:
//!
//! ```text
//! struct read_format {
//!     u64 nr;            /* The number of events */
//!     u64 time_enabled;  /* if PERF_FORMAT_TOTAL_TIME_ENABLED */
//!     u64 time_running;  /* if PERF_FORMAT_TOTAL_TIME_RUNNING */
//!     struct {
//!         u64 value;     /* The value of the event */
//!         u64 id;        /* if PERF_FORMAT_ID */
//!     } values[nr];
//! };
//! ```
//!
//! When more events are requested than the PMU has registers for, the
//! kernel rotates them and `time_running` falls below `time_enabled`.
//! Each raw value then covers only the fraction `time_running /
//! time_enabled` of the interval, so the decoder divides it by that
//! fraction to estimate the full-interval count. Omitting the correction
//! silently undercounts.

use std::fs::File;
use std::io;

use tokio::sync::mpsc;

use crate::errors::CollectError;
use crate::events::{self, EventSpec};
use crate::Builder;
use crate::Counter;

/// A kernel event id paired with the event name it was opened under,
/// published while a group is being opened.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EventId {
    /// The kernel-assigned unique id.
    pub id: u64,
    /// The name the event was requested under.
    pub event: String,
}

/// One decoded, multiplexing-corrected counter reading.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CounterValue {
    /// The kernel-assigned unique id of the counter that was read.
    pub id: u64,
    /// The estimated full-interval count.
    pub value: u64,
}

/// Where freshly opened groups publish their `(id, name)` pairs.
pub type IdSink = mpsc::UnboundedSender<EventId>;

/// The event layout of a group: one leader and its followers, shared by
/// every CPU's group of the same container.
pub struct GroupSpec {
    leader: EventSpec,
    followers: Vec<EventSpec>,
}

impl GroupSpec {
    /// Encode `names` into a group led by `leader`. Any occurrence of the
    /// leader's name in `names` is folded into the leader slot rather
    /// than opened twice.
    pub fn encode(leader: &str, names: &[&str]) -> Result<GroupSpec, CollectError> {
        let followers = names
            .iter()
            .filter(|name| **name != leader)
            .map(|name| events::encode(name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GroupSpec {
            leader: events::encode(leader)?,
            followers,
        })
    }

    /// Number of events in the group, leader included.
    #[allow(clippy::len_without_is_empty)] // Groups are never empty.
    pub fn len(&self) -> usize {
        1 + self.followers.len()
    }
}

/// The counter group of one (container, CPU) pair.
pub struct CpuGroup {
    cpu: usize,

    // Followers are declared before the leader so that dropping the group
    // closes them first; the leader's descriptor must outlive the members
    // that reference it.
    followers: Vec<Counter>,
    leader: Counter,

    /// Reused read buffer, sized for the full grouped payload.
    scratch: Vec<u64>,
}

impl CpuGroup {
    /// Open the group described by `spec` against `cgroup` on `cpu`.
    ///
    /// The leader is opened disabled; each follower is opened against the
    /// leader's descriptor with the enable state inherited from it. Every
    /// event's kernel id is published to `ids` as it is opened. Once the
    /// whole group is open it is reset and enabled in one atomic
    /// operation on the leader.
    ///
    /// Any failure tears down the descriptors opened so far and is fatal
    /// to the group.
    pub fn open(
        cgroup: &File,
        cpu: usize,
        spec: &GroupSpec,
        ids: &IdSink,
    ) -> Result<CpuGroup, CollectError> {
        let open_err = |event: &EventSpec| {
            let event = event.name.clone();
            move |source| CollectError::Open { event, cpu, source }
        };

        let mut leader = Builder::from_spec(&spec.leader)
            .observe_cgroup(cgroup)
            .one_cpu(cpu)
            .inherit(true)
            .build()
            .map_err(open_err(&spec.leader))?;
        let _ = ids.send(EventId {
            id: leader.id(),
            event: spec.leader.name.clone(),
        });

        let mut followers = Vec::with_capacity(spec.followers.len());
        for follower in &spec.followers {
            let counter = Builder::from_spec(follower)
                .observe_cgroup(cgroup)
                .one_cpu(cpu)
                .inherit(true)
                .group(&leader)
                .build()
                .map_err(open_err(follower))?;
            let _ = ids.send(EventId {
                id: counter.id(),
                event: follower.name.clone(),
            });
            followers.push(counter);
        }

        let ioctl_err = |source| CollectError::Open {
            event: spec.leader.name.clone(),
            cpu,
            source,
        };
        leader.reset_group().map_err(ioctl_err)?;
        leader.enable_group().map_err(ioctl_err)?;

        let scratch = vec![0_u64; 3 + 2 * spec.len()];

        Ok(CpuGroup {
            cpu,
            followers,
            leader,
            scratch,
        })
    }

    /// The CPU this group observes.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Perform one grouped read and decode it into scaled per-id values.
    ///
    /// Returns an empty vector when the group was never scheduled during
    /// the interval (`time_enabled` or `time_running` of zero).
    pub fn read_scaled(&mut self) -> Result<Vec<CounterValue>, CollectError> {
        let want = std::mem::size_of_val(&self.scratch[..]);
        let got = self
            .leader
            .read_raw(&mut self.scratch)
            .map_err(|source| CollectError::Read {
                cpu: self.cpu,
                source,
            })?;
        if got != want {
            return Err(CollectError::Read {
                cpu: self.cpu,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("grouped read returned {got} of {want} bytes"),
                ),
            });
        }

        Ok(scaled_values(&self.scratch))
    }
}

impl std::fmt::Debug for CpuGroup {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("CpuGroup")
            .field("cpu", &self.cpu)
            .field("leader", &self.leader)
            .field("followers", &self.followers)
            .finish()
    }
}

/// Decode one grouped-read payload into multiplexing-corrected values.
///
/// `words` is the payload viewed as native-endian `u64`s: the
/// `{nr, time_enabled, time_running}` header followed by `nr` pairs of
/// `{value, id}`.
pub(crate) fn scaled_values(words: &[u64]) -> Vec<CounterValue> {
    let nr = words[0] as usize;
    let (time_enabled, time_running) = (words[1], words[2]);

    // A group that was never scheduled this interval has nothing to say;
    // scaling by zero would fabricate values.
    if time_enabled == 0 || time_running == 0 {
        return Vec::new();
    }

    let scale = time_running as f64 / time_enabled as f64;
    words[3..]
        .chunks_exact(2)
        .take(nr)
        .map(|pair| CounterValue {
            id: pair[1],
            value: (pair[0] as f64 / scale) as u64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplexed_reading_is_scaled_up() {
        // nr=2, enabled=1000, running=500 -> scale 0.5, values doubled.
        let words = [2, 1000, 500, 100, 7, 200, 9];
        assert_eq!(
            scaled_values(&words),
            vec![
                CounterValue { id: 7, value: 200 },
                CounterValue { id: 9, value: 400 },
            ]
        );
    }

    #[test]
    fn unmultiplexed_reading_is_unchanged() {
        let words = [1, 1000, 1000, 42, 3];
        assert_eq!(scaled_values(&words), vec![CounterValue { id: 3, value: 42 }]);
    }

    #[test]
    fn never_scheduled_group_yields_nothing() {
        let words = [1, 0, 0, 0, 0];
        assert!(scaled_values(&words).is_empty());
    }

    #[test]
    fn zero_raw_value_stays_zero_under_scaling() {
        let words = [1, 1000, 250, 0, 11];
        assert_eq!(scaled_values(&words), vec![CounterValue { id: 11, value: 0 }]);
    }

    #[cfg(feature = "hooks")]
    mod hooked {
        use std::io::{Seek, SeekFrom, Write};
        use std::os::raw::{c_int, c_uint, c_ulong};
        use std::os::unix::io::IntoRawFd;
        use std::sync::{Arc, Mutex};

        use libc::pid_t;

        use super::super::*;
        use crate::hooks::{self, sys::bindings};

        /// A stand-in kernel: every `perf_event_open` returns a descriptor
        /// to a scratch file, the leader's file pre-filled with a synthetic
        /// grouped reading; the id ioctl hands out sequential ids.
        struct FakeKernel {
            next_id: u64,
            leader_fd: Option<c_int>,
            leader_payload: Vec<u64>,
            log: Arc<Mutex<Vec<String>>>,
        }

        impl FakeKernel {
            fn new(leader_payload: Vec<u64>, log: Arc<Mutex<Vec<String>>>) -> FakeKernel {
                FakeKernel {
                    next_id: 7,
                    leader_fd: None,
                    leader_payload,
                    log,
                }
            }
        }

        impl hooks::Hooks for FakeKernel {
            unsafe fn perf_event_open(
                &mut self,
                _attrs: *mut bindings::perf_event_attr,
                _pid: pid_t,
                cpu: c_int,
                group_fd: c_int,
                _flags: c_ulong,
            ) -> c_int {
                let mut file = tempfile::tempfile().unwrap();
                if group_fd == -1 {
                    // Leader: serve the canned grouped reading.
                    let bytes: Vec<u8> = self
                        .leader_payload
                        .iter()
                        .flat_map(|w| w.to_ne_bytes())
                        .collect();
                    file.write_all(&bytes).unwrap();
                    file.seek(SeekFrom::Start(0)).unwrap();
                } else {
                    // Followers must reference the leader's descriptor.
                    assert_eq!(Some(group_fd), self.leader_fd);
                }
                let fd = file.into_raw_fd();
                if group_fd == -1 {
                    self.leader_fd = Some(fd);
                }
                self.log.lock().unwrap().push(format!("open cpu={cpu}"));
                fd
            }

            unsafe fn ID(&mut self, _fd: c_int, arg: *mut u64) -> c_int {
                *arg = self.next_id;
                self.next_id += 2;
                0
            }

            unsafe fn RESET(&mut self, fd: c_int, _arg: c_uint) -> c_int {
                assert_eq!(Some(fd), self.leader_fd);
                self.log.lock().unwrap().push("reset".to_owned());
                0
            }

            unsafe fn ENABLE(&mut self, fd: c_int, _arg: c_uint) -> c_int {
                assert_eq!(Some(fd), self.leader_fd);
                self.log.lock().unwrap().push("enable".to_owned());
                0
            }
        }

        #[test]
        fn open_read_close_against_fake_kernel() {
            let log = Arc::new(Mutex::new(Vec::new()));
            // Ids handed out will be 7 (leader) and 9 (follower).
            let payload = vec![2, 1000, 500, 100, 7, 200, 9];
            unsafe {
                hooks::set_thread_hooks(Box::new(FakeKernel::new(payload, log.clone())));
            }

            let cgroup = tempfile::tempfile().unwrap();
            let spec = GroupSpec::encode("instructions", &["instructions", "cycles"]).unwrap();
            let (id_tx, mut id_rx) = mpsc::unbounded_channel();

            let mut group = CpuGroup::open(&cgroup, 0, &spec, &id_tx).unwrap();
            drop(id_tx);

            let mut published = Vec::new();
            while let Ok(id) = id_rx.try_recv() {
                published.push(id);
            }
            assert_eq!(
                published,
                vec![
                    EventId {
                        id: 7,
                        event: "instructions".to_owned()
                    },
                    EventId {
                        id: 9,
                        event: "cycles".to_owned()
                    },
                ]
            );

            let values = group.read_scaled().unwrap();
            // The decoded ids must be exactly the ids the open published,
            // and the values must carry the 0.5 multiplexing correction.
            assert_eq!(
                values,
                vec![
                    CounterValue { id: 7, value: 200 },
                    CounterValue { id: 9, value: 400 },
                ]
            );

            // Reset-then-enable, both on the leader, after both opens.
            let log = log.lock().unwrap().clone();
            assert_eq!(log, vec!["open cpu=0", "open cpu=0", "reset", "enable"]);

            drop(group);
            unsafe {
                hooks::clear_thread_hooks();
            }
        }
    }
}
