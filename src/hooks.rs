//! Intercepting perf-event system calls, for testing and logging.
//!
//! Note: this module is only available when the `"hooks"` feature is
//! enabled.
//!
//! Hardware counters are inherently non-deterministic, and opening them
//! against container cgroups additionally requires privileges and a
//! running container runtime, none of which are available to unit tests.
//! This module lets you interpose your own implementation of the system
//! calls and ioctls this crate uses, so the whole open/read/close cycle of
//! a counter group can run against prepared file descriptors.
//!
//! There are three main pieces:
//!
//! - The [`Hooks`] trait has a method for every system call and ioctl
//!   that this crate uses.
//!
//! - The [`set_thread_hooks`] function lets you provide a `Box<dyn Hooks>`
//!   trait object whose methods the calling thread will use for all
//!   subsequent perf operations.
//!
//! - The [`clear_thread_hooks`] function restores the thread's original
//!   state, so that subsequent operations use the real Linux system
//!   calls.

use std::cell::RefCell;
use std::os::raw::{c_int, c_uint, c_ulong};

use libc::pid_t;
use perf_event_open_sys as real;
use perf_event_open_sys::bindings;

std::thread_local! {
    static HOOKS: RefCell<Box<dyn Hooks + 'static>> = RefCell::new(Box::new(RealHooks));
}

/// Direct all perf-event system calls on this thread to `hooks`.
///
/// This affects only the calling thread. Any previously established hooks
/// on that thread are dropped.
///
/// # Safety
///
/// The specified `hooks` trait object intercepts calls provoked by
/// previously created [`Counter`] values, regardless of which hooks were
/// in effect when they were created. This could make a hash of things.
///
/// [`Counter`]: crate::Counter
pub unsafe fn set_thread_hooks(hooks: Box<dyn Hooks + 'static>) {
    HOOKS.with(|per_thread| {
        *per_thread.borrow_mut() = hooks;
    })
}

/// Direct all perf-event system calls on this thread to the real system
/// calls.
///
/// This affects only the calling thread. Any previously established hooks
/// on that thread are dropped.
///
/// # Safety
///
/// Letting values created using hooked system calls suddenly see the real
/// kernel could make a hash of things.
pub unsafe fn clear_thread_hooks() {
    HOOKS.with(|per_thread| {
        *per_thread.borrow_mut() = Box::new(RealHooks);
    })
}

/// List of ioctls we need wrappers for.
///
/// We use this macro to generate the [`Hooks`] trait's definition, the
/// [`RealHooks`] implementation, and the functions in the `sys` module
/// that are actually used by callers.
macro_rules! define_ioctls {
    ( $expand:ident ) => {
        $expand! { ENABLE, perf_event_ioctls_ENABLE, c_uint }
        $expand! { DISABLE, perf_event_ioctls_DISABLE, c_uint }
        $expand! { RESET, perf_event_ioctls_RESET, c_uint }
        $expand! { ID, perf_event_ioctls_ID, *mut u64 }
    };
}

macro_rules! expand_trait_method {
    ( $name:ident, $ioctl:ident, $arg_type:ty ) => {
        /// Wrapper for perf_event ioctl
        #[doc = stringify!($ioctl)]
        /// .
        #[allow(non_snake_case)]
        unsafe fn $name(&mut self, _fd: c_int, _arg: $arg_type) -> c_int {
            panic!(
                "unimplemented `podperf::hooks::Hooks` method: {}",
                stringify!($name)
            );
        }
    };
}

/// A trait with a method for every system call and ioctl used by this
/// crate.
///
/// Each method has a default definition that panics, so a test double
/// only needs to provide the operations its test actually exercises; if
/// the code under test touches anything else, the test fails loudly.
///
/// The [`RealHooks`] type implements this trait in terms of the real
/// Linux system calls and ioctls.
#[allow(dead_code)]
pub trait Hooks {
    /// See [`perf_event_open_sys::perf_event_open`][peo].
    ///
    /// [peo]: https://docs.rs/perf-event-open-sys2/latest/perf_event_open_sys/fn.perf_event_open.html
    #[allow(clippy::missing_safety_doc)]
    unsafe fn perf_event_open(
        &mut self,
        attrs: *mut bindings::perf_event_attr,
        pid: pid_t,
        cpu: c_int,
        group_fd: c_int,
        flags: c_ulong,
    ) -> c_int;
    define_ioctls!(expand_trait_method);
}

macro_rules! expand_realhooks_impl {
    ( $name:ident, $ioctl_:ident, $arg_type:ty ) => {
        #[allow(clippy::missing_safety_doc)]
        unsafe fn $name(&mut self, fd: c_int, arg: $arg_type) -> c_int {
            real::ioctls::$name(fd, arg)
        }
    };
}

/// An implementation of the [`Hooks`] trait in terms of the real Linux
/// system calls.
pub struct RealHooks;
impl Hooks for RealHooks {
    unsafe fn perf_event_open(
        &mut self,
        attrs: *mut bindings::perf_event_attr,
        pid: pid_t,
        cpu: c_int,
        group_fd: c_int,
        flags: c_ulong,
    ) -> c_int {
        real::perf_event_open(attrs, pid, cpu, group_fd, flags)
    }

    define_ioctls!(expand_realhooks_impl);
}

/// Wrapper around the `perf-event-open-sys2` crate that supports
/// intercepting system calls and returning simulated results, for
/// testing.
pub mod sys {
    use std::os::raw::{c_int, c_ulong};

    use libc::pid_t;

    use super::HOOKS;

    pub use perf_event_open_sys::bindings;

    /// See [`perf_event_open_sys::perf_event_open`][peo].
    ///
    /// [peo]: https://docs.rs/perf-event-open-sys2/latest/perf_event_open_sys/fn.perf_event_open.html
    #[allow(clippy::missing_safety_doc)]
    pub unsafe fn perf_event_open(
        attrs: *mut bindings::perf_event_attr,
        pid: pid_t,
        cpu: c_int,
        group_fd: c_int,
        flags: c_ulong,
    ) -> c_int {
        HOOKS.with(|hooks| {
            hooks
                .borrow_mut()
                .perf_event_open(attrs, pid, cpu, group_fd, flags)
        })
    }

    #[allow(dead_code, non_snake_case)]
    /// See the [`perf_event_open_sys::ioctls` module][peosi].
    ///
    /// [peosi]: https://docs.rs/perf-event-open-sys2/latest/perf_event_open_sys/ioctls/index.html
    pub mod ioctls {
        use std::os::raw::{c_int, c_uint};

        use super::HOOKS;

        macro_rules! expand_hooked_ioctl {
            ( $name:ident, $ioctl_:ident, $arg_type:ty ) => {
                /// See the [`perf_event_open_sys::ioctls` module][peosi].
                ///
                /// [peosi]: https://docs.rs/perf-event-open-sys2/latest/perf_event_open_sys/ioctls/index.html
                #[allow(clippy::missing_safety_doc)]
                pub unsafe fn $name(fd: c_int, arg: $arg_type) -> c_int {
                    HOOKS.with(|hooks| hooks.borrow_mut().$name(fd, arg))
                }
            };
        }

        define_ioctls!(expand_hooked_ioctl);
    }
}
