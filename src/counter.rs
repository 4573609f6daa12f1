use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::{as_byte_slice_mut, check_errno_syscall, sys};

/// One open performance counter descriptor.
///
/// A `Counter` is created by [`Builder::build`] and wraps the file
/// descriptor returned by `perf_event_open`, together with the unique id
/// the kernel assigned to the event. The id is what ties a value decoded
/// from a grouped read back to the event name it was opened under.
///
/// When a counter is dropped, its kernel resources are freed along with it.
///
/// [`Builder::build`]: crate::Builder::build
pub struct Counter {
    /// The descriptor returned by `perf_event_open`. Dropping the `File`
    /// closes it, which also removes the counter from its group.
    file: File,

    /// The unique id assigned to this counter by the kernel.
    id: u64,
}

impl Counter {
    pub(crate) fn new(file: File) -> io::Result<Counter> {
        // Retrieve the id so readers of the grouped format can find this
        // counter's value.
        let mut id = 0_u64;
        check_errno_syscall(|| unsafe { sys::ioctls::ID(file.as_raw_fd(), &mut id) })?;

        Ok(Counter { file, id })
    }

    /// Return this counter's kernel-assigned unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Zero this counter and, with it, every member of its group.
    pub fn reset_group(&mut self) -> io::Result<()> {
        self.group_ioctl(sys::ioctls::RESET)
    }

    /// Start this counter and every member of its group as one atomic
    /// operation. Used on a group leader after all followers are open, so
    /// that the whole group covers exactly the same period.
    pub fn enable_group(&mut self) -> io::Result<()> {
        self.group_ioctl(sys::ioctls::ENABLE)
    }

    /// Stop this counter and every member of its group. Counts are
    /// unaffected.
    pub fn disable_group(&mut self) -> io::Result<()> {
        self.group_ioctl(sys::ioctls::DISABLE)
    }

    /// Zero this counter alone.
    pub fn reset(&mut self) -> io::Result<()> {
        check_errno_syscall(|| unsafe { sys::ioctls::RESET(self.file.as_raw_fd(), 0) }).map(|_| ())
    }

    /// Start this counter alone. Counters that belong to a group are
    /// enabled through their leader instead.
    pub fn enable(&mut self) -> io::Result<()> {
        check_errno_syscall(|| unsafe { sys::ioctls::ENABLE(self.file.as_raw_fd(), 0) }).map(|_| ())
    }

    /// Perform some group-wide ioctl.
    ///
    /// `f` must be a syscall that sets `errno` and returns `-1` on failure.
    fn group_ioctl(
        &mut self,
        f: unsafe fn(std::os::raw::c_int, std::os::raw::c_uint) -> std::os::raw::c_int,
    ) -> io::Result<()> {
        check_errno_syscall(|| unsafe {
            f(self.file.as_raw_fd(), sys::bindings::PERF_IOC_FLAG_GROUP)
        })
        .map(|_| ())
    }

    /// Fill `words` from the descriptor and return the number of bytes the
    /// kernel produced. The layout of the words depends on the read format
    /// the counter was opened with.
    pub(crate) fn read_raw(&mut self, words: &mut [u64]) -> io::Result<usize> {
        self.file.read(as_byte_slice_mut(words))
    }

    /// Read this counter's value together with its timesharing data.
    ///
    /// Only valid for counters opened with the time-enabled/time-running
    /// read format and without grouping; group members are read through
    /// their leader instead.
    pub fn read_count_and_time(&mut self) -> io::Result<CountAndTime> {
        let mut data = [0_u64; 3];
        let bytes = self.read_raw(&mut data)?;
        if bytes != std::mem::size_of_val(&data) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from perf descriptor",
            ));
        }

        let cat = CountAndTime {
            count: data[0],
            time_enabled: data[1],
            time_running: data[2],
        };

        // Does the kernel ever return nonsense?
        debug_assert!(cat.time_running <= cat.time_enabled);

        Ok(cat)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "Counter {{ fd: {}, id: {} }}",
            self.file.as_raw_fd(),
            self.id
        )
    }
}

impl AsRawFd for Counter {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// The value of a counter, along with timesharing data.
///
/// Some counters are implemented in hardware, and the processor can run
/// only a fixed number of them at a time. If more counters are requested
/// than the hardware can support, the kernel timeshares them on the
/// hardware.
#[derive(Copy, Clone, Debug)]
pub struct CountAndTime {
    /// The counter value.
    pub count: u64,

    /// How long this counter was enabled by the program, in nanoseconds.
    pub time_enabled: u64,

    /// How long the kernel actually ran this counter, in nanoseconds.
    ///
    /// If `time_enabled == time_running`, then the counter ran for the
    /// entire period it was enabled, without interruption. Otherwise, the
    /// counter shared the underlying hardware with others, and you should
    /// prorate its value accordingly.
    pub time_running: u64,
}

impl CountAndTime {
    /// Estimate what the count would have been had the counter stayed on
    /// the PMU for the whole enabled period.
    ///
    /// Returns `None` when the counter was never scheduled at all.
    pub fn scaled_count(&self) -> Option<u64> {
        if self.time_running == 0 || self.time_enabled == 0 {
            return None;
        }
        // u128 keeps the multiply from overflowing on large counts.
        Some((self.count as u128 * self.time_enabled as u128 / self.time_running as u128) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_is_identity_when_never_multiplexed() {
        let cat = CountAndTime {
            count: 42,
            time_enabled: 1_000,
            time_running: 1_000,
        };
        assert_eq!(cat.scaled_count(), Some(42));
    }

    #[test]
    fn scaling_prorates_multiplexed_counts() {
        let cat = CountAndTime {
            count: 100,
            time_enabled: 1_000,
            time_running: 500,
        };
        assert_eq!(cat.scaled_count(), Some(200));
    }

    #[test]
    fn unscheduled_counters_have_no_estimate() {
        let cat = CountAndTime {
            count: 0,
            time_enabled: 0,
            time_running: 0,
        };
        assert_eq!(cat.scaled_count(), None);
    }
}
