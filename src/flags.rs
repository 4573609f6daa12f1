use bitflags::bitflags;

use crate::sys::bindings;

bitflags! {
    /// Specifies what fields a counter read returns.
    ///
    /// These values correspond to `PERF_FORMAT_x` values. See the
    /// [manpage] for documentation on what they mean.
    ///
    /// [manpage]: http://man7.org/linux/man-pages/man2/perf_event_open.2.html
    pub struct ReadFormat: u64 {
        /// Include how long the counter was enabled, in nanoseconds.
        const TOTAL_TIME_ENABLED = bindings::PERF_FORMAT_TOTAL_TIME_ENABLED as u64;

        /// Include how long the counter was actually scheduled on the
        /// PMU, in nanoseconds. Together with
        /// [`TOTAL_TIME_ENABLED`](Self::TOTAL_TIME_ENABLED) this is what
        /// makes multiplexing correction possible.
        const TOTAL_TIME_RUNNING = bindings::PERF_FORMAT_TOTAL_TIME_RUNNING as u64;

        /// Include the kernel-assigned unique id of each event.
        const ID = bindings::PERF_FORMAT_ID as u64;

        /// Read every member of the group in one atomic operation on the
        /// leader's descriptor.
        const GROUP = bindings::PERF_FORMAT_GROUP as u64;
    }
}

impl ReadFormat {
    /// The read format requested for every member of a counter group:
    /// one grouped read returning, per event, its value and kernel id,
    /// plus the shared time-enabled/time-running header.
    pub(crate) fn grouped() -> Self {
        ReadFormat::GROUP | ReadFormat::TOTAL_TIME_ENABLED | ReadFormat::TOTAL_TIME_RUNNING | ReadFormat::ID
    }
}
