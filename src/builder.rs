use std::fs::File;
use std::io;
use std::os::raw::c_int;
use std::os::raw::c_ulong;
use std::os::unix::io::{AsRawFd, FromRawFd};

use libc::pid_t;

use crate::events::{Event, EventSpec, Hardware};
use crate::flags::ReadFormat;
use crate::sys;
use crate::sys::bindings::perf_event_attr;
use crate::{check_errno_syscall, Counter};

/// A builder for [`Counter`]s.
///
/// `Builder` assembles the arguments of one `perf_event_open` call: the
/// `perf_event_attr`, the observed target, the CPU, and the group to join.
/// A freshly built counter starts out disabled unless it joins a group, in
/// which case it inherits the group's enable state and the leader enables
/// everything at once.
///
/// Counters produced here observe either the calling process (the default,
/// useful for smoke tests) or every task inside a cgroup on one specific
/// CPU, which is the shape the container collectors use. Cgroups cannot be
/// observed with `cpu = -1`; the kernel requires one descriptor per CPU.
pub struct Builder<'a> {
    attrs: perf_event_attr,
    who: EventPid<'a>,
    cpu: Option<usize>,
    group_fd: Option<c_int>,
}

impl<'a> Default for Builder<'a> {
    fn default() -> Builder<'a> {
        let mut attrs = perf_event_attr::default();

        // Setting `size` accurately will not prevent the code from working
        // on older kernels; the kernel writes back the size it expected on
        // mismatch.
        attrs.size = std::mem::size_of::<perf_event_attr>() as u32;

        attrs.set_disabled(1);
        attrs.set_exclude_kernel(1); // don't count time in kernel
        attrs.set_exclude_hv(1); // don't count time in hypervisor

        // Request data for `time_enabled` and `time_running`.
        attrs.read_format =
            (ReadFormat::TOTAL_TIME_ENABLED | ReadFormat::TOTAL_TIME_RUNNING).bits();

        let kind = Event::Hardware(Hardware::INSTRUCTIONS);
        kind.update_attrs(&mut attrs);

        Builder {
            attrs,
            who: EventPid::ThisProcess,
            cpu: None,
            group_fd: None,
        }
    }
}

impl<'a> Builder<'a> {
    /// Return a new `Builder`, with all parameters set to their defaults.
    pub fn new() -> Builder<'a> {
        Builder::default()
    }

    /// Start from a fully encoded [`EventSpec`] instead of the defaults.
    ///
    /// The spec's attribute is taken as-is (type, config, read format,
    /// sample type, privilege bits); only the enable state is reset so
    /// that the counter starts disabled like any other fresh build.
    pub fn from_spec(spec: &EventSpec) -> Builder<'a> {
        let mut attrs = spec.attr;
        attrs.set_disabled(1);

        Builder {
            attrs,
            who: EventPid::ThisProcess,
            cpu: None,
            group_fd: None,
        }
    }

    /// Count events of the given kind. The default is retired
    /// instructions.
    pub fn kind<K: Into<Event>>(mut self, kind: K) -> Builder<'a> {
        kind.into().update_attrs(&mut self.attrs);
        self
    }

    /// Observe code running in the given [cgroup][man-cgroups]. The
    /// `cgroup` argument should be a `File` referring to the cgroup's
    /// directory in the cgroupfs filesystem. Must be combined with
    /// [`one_cpu`].
    ///
    /// [`one_cpu`]: Builder::one_cpu
    /// [man-cgroups]: http://man7.org/linux/man-pages/man7/cgroups.7.html
    pub fn observe_cgroup(mut self, cgroup: &'a File) -> Builder<'a> {
        self.who = EventPid::CGroup(cgroup);
        self
    }

    /// Observe only code running on the given CPU core.
    pub fn one_cpu(mut self, cpu: usize) -> Builder<'a> {
        self.cpu = Some(cpu);
        self
    }

    /// Set whether this counter is inherited by new threads and child
    /// processes of the observed tasks. Container workloads fork, so the
    /// collectors set this on every event.
    pub fn inherit(mut self, inherit: bool) -> Builder<'a> {
        self.attrs.set_inherit(inherit.into());
        self
    }

    /// Set the fields to include when reading from the counter.
    pub fn read_format(mut self, read_format: ReadFormat) -> Builder<'a> {
        self.attrs.read_format = read_format.bits();
        self
    }

    /// Place the counter in the group led by `leader`.
    ///
    /// Group members are opened with the disabled bit clear; the whole
    /// group is enabled atomically through the leader once every member
    /// is open.
    pub fn group(mut self, leader: &Counter) -> Builder<'a> {
        self.group_fd = Some(leader.as_raw_fd());

        // man page: "Members of a group are usually initialized with
        // disabled set to zero."
        self.attrs.set_disabled(0);

        self
    }

    /// Construct a [`Counter`] according to the specifications made on
    /// this `Builder`.
    ///
    /// Problems in counter configuration are detected at this point by
    /// the kernel, not earlier when the offending request is made on the
    /// `Builder`. The kernel's returned errors are not always helpful.
    pub fn build(mut self) -> io::Result<Counter> {
        let cpu = match self.cpu {
            Some(cpu) => cpu as c_int,
            None => -1,
        };
        let (pid, flags) = self.who.as_args();
        let group_fd = self.group_fd.unwrap_or(-1);

        let file = unsafe {
            File::from_raw_fd(check_errno_syscall(|| {
                sys::perf_event_open(&mut self.attrs, pid, cpu, group_fd, flags)
            })?)
        };

        Counter::new(file)
    }
}

#[derive(Debug)]
enum EventPid<'a> {
    /// Monitor the calling process.
    ThisProcess,

    /// Monitor members of the given cgroup.
    CGroup(&'a File),
}

impl<'a> EventPid<'a> {
    // Return the `pid` arg and the `flags` bits representing `self`.
    fn as_args(&self) -> (pid_t, c_ulong) {
        match self {
            EventPid::ThisProcess => (0, sys::bindings::PERF_FLAG_FD_CLOEXEC as c_ulong),
            EventPid::CGroup(file) => (
                file.as_raw_fd(),
                (sys::bindings::PERF_FLAG_PID_CGROUP | sys::bindings::PERF_FLAG_FD_CLOEXEC)
                    as c_ulong,
            ),
        }
    }
}
