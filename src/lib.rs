//! Per-container hardware performance counters for Kubernetes worker nodes.
//!
//! This crate watches the pods scheduled on the local node and, for every
//! running container, opens a group of hardware counters (instructions,
//! cycles, last-level cache misses) attached to the container's cgroup on
//! each online CPU. On a fixed cadence the groups are read, the raw counts
//! are corrected for kernel multiplexing, summed across CPUs, and published
//! as Prometheus gauges labelled by namespace, pod, and container.
//!
//! The moving parts, bottom up:
//!
//! -   [`events`] turns an event name like `"instructions"` or
//!     `"LONGEST_LAT_CACHE.MISS"` into a ready-to-open
//!     `perf_event_attr`.
//!
//! -   [`group::CpuGroup`] owns one leader/follower group of descriptors
//!     for one (container, CPU) pair, and decodes the kernel's grouped
//!     read format, including the time-enabled/time-running scaling that
//!     compensates for PMU multiplexing.
//!
//! -   [`collector::ContainerCollector`] owns the cgroup handle and one
//!     `CpuGroup` per online CPU, and aggregates the per-CPU readings
//!     into a per-event total for the container.
//!
//! -   [`podset::PodSetCollector`] fans the above out over every container
//!     on the node and pushes the results into [`metrics`].
//!
//! Counters are reopened on every collection pass, so the exported values
//! are per-interval deltas rather than monotonic totals.
//!
//! This crate is built on top of the Linux [`perf_event_open`][man] system
//! call; that documentation has the authoritative explanations of exactly
//! what all the counters mean.
//!
//! [man]: http://man7.org/linux/man-pages/man2/perf_event_open.2.html

use std::io;

pub mod cgroup;
pub mod collector;
pub mod discovery;
pub mod errors;
pub mod events;
pub mod group;
pub mod metrics;
pub mod podset;

#[cfg(feature = "hooks")]
pub mod hooks;

mod builder;
mod counter;
mod flags;

// When the `"hooks"` feature is not enabled, call directly into
// `perf-event-open-sys2`.
#[cfg(not(feature = "hooks"))]
pub(crate) use perf_event_open_sys as sys;

// When the `"hooks"` feature is enabled, `sys` functions allow for
// interposed functions that provide simulated results for testing.
#[cfg(feature = "hooks")]
pub(crate) use hooks::sys;

pub use crate::builder::Builder;
pub use crate::counter::{CountAndTime, Counter};
pub use crate::errors::CollectError;
pub use crate::flags::ReadFormat;

/// View a mutable slice of `u64`s as the bytes that store them.
///
/// The kernel hands counter readings back as a packed sequence of `u64`
/// words, so reading directly into a word buffer avoids a copy.
pub(crate) fn as_byte_slice_mut(slice: &mut [u64]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(slice.as_mut_ptr() as *mut u8, std::mem::size_of_val(slice))
    }
}

/// Produce an `io::Result` from an errno-style system call.
///
/// An 'errno-style' system call is one that reports failure by returning -1
/// and setting the C `errno` value when an error occurs.
pub(crate) fn check_errno_syscall<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> R,
    R: PartialOrd + Default,
{
    let result = f();
    if result < R::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}
