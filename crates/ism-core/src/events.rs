//! Events and outcomes emitted by the engine

use ism_api::ManagedIndexMetaData;
use ism_util::PolicyId;

/// Events emitted by the coordinator and management operations
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// A policy was attached to an index
    PolicyAttached {
        index: String,
        policy_id: PolicyId,
    },

    /// An index stopped being managed
    PolicyRemoved {
        index: String,
    },
}

/// What one tick of the runner did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The tick did not run
    Skipped(SkipReason),

    /// The tick ran and had nothing to write
    Unchanged,

    /// The tick wrote new metadata
    Progressed(Box<ManagedIndexMetaData>),

    /// The tick was abandoned without writing; the next tick retries
    Aborted(AbortReason),
}

impl TickOutcome {
    pub fn metadata(&self) -> Option<&ManagedIndexMetaData> {
        match self {
            TickOutcome::Progressed(metadata) => Some(metadata),
            _ => None,
        }
    }

    pub fn is_progressed(&self) -> bool {
        matches!(self, TickOutcome::Progressed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No managed index config exists
    NotManaged,
    /// The job is disabled
    Disabled,
    /// Another node holds the lease
    LockHeld,
    /// The current step is waiting for its retry backoff
    BackingOff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Someone else wrote the document since it was read
    VersionConflict,
    /// The lease expired or was taken over mid-tick
    LeaseLost,
    /// The store could not be reached
    Store(String),
    /// The cluster could not be reached
    Cluster(String),
    /// The tick task died before reporting an outcome
    Panicked(String),
}
