//! Error kinds for the collector.
//!
//! Failures are recovered at the smallest unit that can make progress
//! without them: a failed per-CPU read drops that CPU's contribution, a
//! failed open skips the container for the current pass, and a failed pod
//! listing skips the whole pass. Nothing inside a collection pass cancels
//! its siblings.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Any error produced while setting up or reading container counters.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The event name is not known on this CPU model. Fatal to the
    /// collector that requested it.
    #[error("unknown event {name:?}: {reason}")]
    Encode { name: String, reason: String },

    /// `perf_event_open` or a follow-up ioctl failed. Fatal to the
    /// container's construction for this pass.
    #[error("failed to open {event:?} on cpu {cpu}")]
    Open {
        event: String,
        cpu: usize,
        #[source]
        source: io::Error,
    },

    /// Reading a counter group failed. The affected CPU contributes
    /// nothing this pass; sibling CPUs proceed.
    #[error("failed to read counter group on cpu {cpu}")]
    Read {
        cpu: usize,
        #[source]
        source: io::Error,
    },

    /// The container's cgroup directory is missing or unreadable. The
    /// container is skipped this pass.
    #[error("cgroup {} is unavailable", .path.display())]
    Cgroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The container id did not have the expected `<runtime>://<hash>`
    /// shape, so no cgroup path can be derived for it.
    #[error("malformed container id {id:?}")]
    ContainerId { id: String },

    /// Listing pods from the cluster API failed. The whole pass is
    /// skipped and retried on the next tick.
    #[error("pod discovery failed")]
    Discovery(#[from] reqwest::Error),

    /// The kubeconfig could not be read or did not contain a usable
    /// cluster entry.
    #[error("unusable kubeconfig: {reason}")]
    Kubeconfig { reason: String },

    /// A background aggregation task died. This only happens if a drain
    /// task panicked, which indicates a bug rather than an I/O condition.
    #[error("collector task failed")]
    Task(#[from] tokio::task::JoinError),
}
