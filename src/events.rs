//! Translation from event names to kernel event descriptors.
//!
//! Two name spaces are understood:
//!
//! -   The portable generic names exposed by every PMU ("cycles",
//!     "instructions", "cache-misses", ...). These map directly onto
//!     `PERF_TYPE_HARDWARE` ids.
//!
//! -   Model-specific names from the vendor event tables, such as
//!     `"LONGEST_LAT_CACHE.MISS"`. These are looked up in the event
//!     database for the CPU the process is running on and encoded into a
//!     `PERF_TYPE_RAW` config word.
//!
//! An encoded event carries the full `perf_event_attr` the group opener
//! needs: grouped read format with time-enabled, time-running and
//! per-event id, identifier sampling, and user-mode-only counting.

#![allow(non_camel_case_types)]

use crate::errors::CollectError;
use crate::flags::ReadFormat;
use crate::sys::bindings::{self, perf_event_attr};

/// Any event we know how to open. A sum of the portable [`Hardware`] ids
/// and model-specific raw config words.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    #[allow(missing_docs)]
    Hardware(Hardware),

    /// A raw, model-specific event, pre-encoded for the PMU of this
    /// machine.
    Raw(u64),
}

impl Event {
    pub(crate) fn update_attrs(self, attr: &mut perf_event_attr) {
        match self {
            Event::Hardware(hw) => {
                attr.type_ = bindings::PERF_TYPE_HARDWARE;
                attr.config = hw as u64;
            }
            Event::Raw(config) => {
                attr.type_ = bindings::PERF_TYPE_RAW;
                attr.config = config;
            }
        }
    }
}

impl From<Hardware> for Event {
    fn from(hw: Hardware) -> Event {
        Event::Hardware(hw)
    }
}

/// Hardware counters with portable names.
///
/// Each variant corresponds to a particular `PERF_COUNT_HW_`... value
/// supported by the [`perf_event_open`][man] system call.
///
/// [man]: http://man7.org/linux/man-pages/man2/perf_event_open.2.html
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Hardware {
    /// Total cycles. Be wary of what happens during CPU frequency scaling.
    CPU_CYCLES = bindings::PERF_COUNT_HW_CPU_CYCLES,

    /// Retired instructions.
    INSTRUCTIONS = bindings::PERF_COUNT_HW_INSTRUCTIONS,

    /// Cache accesses. Usually this indicates Last Level Cache accesses.
    CACHE_REFERENCES = bindings::PERF_COUNT_HW_CACHE_REFERENCES,

    /// Cache misses. Usually this indicates Last Level Cache misses.
    CACHE_MISSES = bindings::PERF_COUNT_HW_CACHE_MISSES,

    /// Retired branch instructions.
    BRANCH_INSTRUCTIONS = bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS,

    /// Mispredicted branch instructions.
    BRANCH_MISSES = bindings::PERF_COUNT_HW_BRANCH_MISSES,

    /// Bus cycles, which can be different from total cycles.
    BUS_CYCLES = bindings::PERF_COUNT_HW_BUS_CYCLES,

    /// Stalled cycles during issue.
    STALLED_CYCLES_FRONTEND = bindings::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND,

    /// Stalled cycles during retirement.
    STALLED_CYCLES_BACKEND = bindings::PERF_COUNT_HW_STALLED_CYCLES_BACKEND,

    /// Total cycles; not affected by CPU frequency scaling.
    REF_CPU_CYCLES = bindings::PERF_COUNT_HW_REF_CPU_CYCLES,
}

/// Map a portable event name to its generic hardware id.
fn generic(name: &str) -> Option<Hardware> {
    let hw = match name {
        "cycles" | "cpu-cycles" => Hardware::CPU_CYCLES,
        "instructions" => Hardware::INSTRUCTIONS,
        "cache-references" => Hardware::CACHE_REFERENCES,
        "cache-misses" => Hardware::CACHE_MISSES,
        "branches" | "branch-instructions" => Hardware::BRANCH_INSTRUCTIONS,
        "branch-misses" => Hardware::BRANCH_MISSES,
        "bus-cycles" => Hardware::BUS_CYCLES,
        "stalled-cycles-frontend" => Hardware::STALLED_CYCLES_FRONTEND,
        "stalled-cycles-backend" => Hardware::STALLED_CYCLES_BACKEND,
        "ref-cycles" => Hardware::REF_CPU_CYCLES,
        _ => return None,
    };
    Some(hw)
}

/// Look up a model-specific event by name in the core event table for the
/// CPU this process runs on, and pack it into a raw config word.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn model_specific(name: &str) -> Option<Event> {
    use x86::perfcnt::intel::events as core_counters;
    use x86::perfcnt::intel::Tuple;

    let desc = core_counters().and_then(|counters| counters.get(name))?;

    let mut config = 0u64;
    match desc.event_code {
        Tuple::One(code) => config |= code as u64,
        // Dual-code events need two counters and cannot be encoded as a
        // single raw event.
        Tuple::Two(_, _) => return None,
    }
    match desc.umask {
        Tuple::One(umask) => config |= (umask as u64) << 8,
        Tuple::Two(_, _) => return None,
    }
    config |= (desc.counter_mask as u64) << 24;

    if desc.edge_detect {
        config |= 1 << 18;
    }
    if desc.any_thread {
        config |= 1 << 21;
    }
    if desc.invert {
        config |= 1 << 23;
    }

    Some(Event::Raw(config))
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn model_specific(_name: &str) -> Option<Event> {
    None
}

/// Resolve an event name to something openable, or fail with the reason.
pub fn resolve(name: &str) -> Result<Event, CollectError> {
    if let Some(hw) = generic(name) {
        return Ok(Event::Hardware(hw));
    }
    model_specific(name).ok_or_else(|| CollectError::Encode {
        name: name.to_owned(),
        reason: "not a generic event and not in this CPU's event table".to_owned(),
    })
}

/// An event name together with the fully populated kernel attribute that
/// opens it as a member of a counter group.
#[derive(Clone)]
pub struct EventSpec {
    /// The name the event was requested under. Readings are aggregated
    /// and exported under this name.
    pub name: String,
    pub(crate) attr: perf_event_attr,
}

/// Encode an event name into a group-ready [`EventSpec`].
///
/// The returned attribute requests a grouped read carrying time-enabled,
/// time-running and the per-event kernel id, tags samples with the
/// identifier, and counts user-mode activity only.
pub fn encode(name: &str) -> Result<EventSpec, CollectError> {
    let event = resolve(name)?;

    let mut attr = perf_event_attr::default();
    event.update_attrs(&mut attr);
    attr.size = std::mem::size_of::<perf_event_attr>() as u32;
    attr.read_format = ReadFormat::grouped().bits();
    attr.sample_type = bindings::PERF_SAMPLE_IDENTIFIER as u64;
    attr.set_exclude_kernel(1);
    attr.set_exclude_hv(1);

    Ok(EventSpec {
        name: name.to_owned(),
        attr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_names_resolve() {
        assert_eq!(
            resolve("instructions").unwrap(),
            Event::Hardware(Hardware::INSTRUCTIONS)
        );
        assert_eq!(
            resolve("cycles").unwrap(),
            Event::Hardware(Hardware::CPU_CYCLES)
        );
        assert_eq!(
            resolve("ref-cycles").unwrap(),
            Event::Hardware(Hardware::REF_CPU_CYCLES)
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = resolve("NOT_A_REAL.EVENT").unwrap_err();
        match err {
            CollectError::Encode { name, .. } => assert_eq!(name, "NOT_A_REAL.EVENT"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn encoded_attr_requests_grouped_reads() {
        let spec = encode("instructions").unwrap();
        assert_eq!(spec.attr.type_, bindings::PERF_TYPE_HARDWARE);
        assert_eq!(spec.attr.config, bindings::PERF_COUNT_HW_INSTRUCTIONS as u64);
        assert_eq!(spec.attr.read_format, ReadFormat::grouped().bits());
        assert_eq!(
            spec.attr.sample_type,
            bindings::PERF_SAMPLE_IDENTIFIER as u64
        );
        assert_eq!(spec.attr.size, std::mem::size_of::<perf_event_attr>() as u32);
    }
}
