//! Resolution and opening of container cgroup directories.
//!
//! Perf events are attached to a container by passing an open file
//! descriptor of the container's cgroup directory to `perf_event_open`,
//! so only tasks inside that cgroup are counted.
//!
//! The path layout assumes containerd with the systemd cgroup driver,
//! which places every container under the kubepods slice:
//!
//! ```text
//! /sys/fs/cgroup/kubepods.slice/
//!     kubepods-pod<uid, dashes replaced by underscores>.slice/
//!         cri-containerd-<hash>.scope
//! ```
//!
//! where `<hash>` is the part of the container id after `<runtime>://`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::errors::CollectError;

/// Mount point of the cgroup2 filesystem.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Slice that holds every pod on a kubelet with the systemd driver.
const KUBEPODS_SLICE: &str = "kubepods.slice";

/// Resolve the cgroup directory of one container from its pod uid and
/// qualified container id (`<runtime>://<hash>`).
pub fn container_path(pod_uid: &str, container_id: &str) -> Result<PathBuf, CollectError> {
    let hash = container_id
        .split_once("://")
        .map(|(_, hash)| hash)
        .filter(|hash| !hash.is_empty())
        .ok_or_else(|| CollectError::ContainerId {
            id: container_id.to_owned(),
        })?;

    let uid = pod_uid.replace('-', "_");

    let mut path = PathBuf::from(CGROUP_ROOT);
    path.push(KUBEPODS_SLICE);
    path.push(format!("kubepods-pod{uid}.slice"));
    path.push(format!("cri-containerd-{hash}.scope"));
    Ok(path)
}

/// Open a cgroup directory read-only, for use as a perf event target.
pub fn open_dir(path: &Path) -> Result<File, CollectError> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open(path)
        .map_err(|source| CollectError::Cgroup {
            path: path.to_owned(),
            source,
        })
}

/// Whether this node exposes the kubepods cgroup hierarchy at all. Used
/// as a startup check so a misconfigured node fails fast instead of
/// skipping every container.
pub fn kubepods_present() -> bool {
    Path::new(CGROUP_ROOT).join(KUBEPODS_SLICE).is_dir()
}

/// The CPUs currently online, in ascending order.
///
/// Cgroup-scoped perf events cannot be opened with `cpu = -1`; one
/// descriptor per online CPU is required, so collectors iterate this
/// list.
pub fn online_cpus() -> Vec<usize> {
    match std::fs::read_to_string("/sys/devices/system/cpu/online") {
        Ok(list) => match parse_cpu_list(list.trim()) {
            Some(cpus) => cpus,
            None => {
                log::warn!("unparseable online cpu list {list:?}, assuming all cpus online");
                fallback_cpus()
            }
        },
        Err(err) => {
            log::warn!("cannot read online cpu list: {err}, assuming all cpus online");
            fallback_cpus()
        }
    }
}

fn fallback_cpus() -> Vec<usize> {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    (0..n.max(1) as usize).collect()
}

/// Parse the kernel's range-list syntax, e.g. `0-3,5,7-8`.
fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (lo.parse::<usize>().ok()?, hi.parse::<usize>().ok()?);
                if lo > hi {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().ok()?),
        }
    }
    if cpus.is_empty() {
        None
    } else {
        Some(cpus)
    }
}

/// Number of bytes moved per last-level cache line fill on x86 parts.
/// The cache-bandwidth gauge multiplies miss counts by this; on machines
/// with a different line size the derived bandwidth is off accordingly.
pub const CACHE_LINE_BYTES: f64 = 64.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_containerd_systemd_layout() {
        let path = container_path(
            "8e97aaf0-3461-45cd-902b-0922dd6af6e0",
            "containerd://7f7ccf05e97be2bf8fc03b91a9cca11c5b6d31149d60d11e67b7df4bf127bb52",
        )
        .unwrap();
        assert_eq!(
            path,
            PathBuf::from(
                "/sys/fs/cgroup/kubepods.slice/\
                 kubepods-pod8e97aaf0_3461_45cd_902b_0922dd6af6e0.slice/\
                 cri-containerd-7f7ccf05e97be2bf8fc03b91a9cca11c5b6d31149d60d11e67b7df4bf127bb52.scope"
            )
        );
    }

    #[test]
    fn rejects_unqualified_container_ids() {
        assert!(container_path("uid", "not-a-qualified-id").is_err());
        assert!(container_path("uid", "containerd://").is_err());
    }

    #[test]
    fn parses_cpu_range_lists() {
        assert_eq!(parse_cpu_list("0"), Some(vec![0]));
        assert_eq!(parse_cpu_list("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_cpu_list("0-1,4-5,7"), Some(vec![0, 1, 4, 5, 7]));
        assert_eq!(parse_cpu_list(""), None);
        assert_eq!(parse_cpu_list("3-1"), None);
    }

    #[test]
    fn missing_cgroup_is_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-container.scope");
        match open_dir(&missing) {
            Err(CollectError::Cgroup { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
