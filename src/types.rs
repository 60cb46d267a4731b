/// Core types shared across the broker
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Closed outcome taxonomy for broker operations.
///
/// Every public operation returns one of these through `Result<T>`; the
/// broker never panics for an ordinary failure. Codes produced by a policy
/// implementation (`TokenCreation`, `ContainerCreation`) are forwarded
/// verbatim by the broker, never reinterpreted.
#[derive(Error, Debug)]
pub enum ResultCode {
    /// Empty executable path or otherwise unusable spawn parameters.
    #[error("invalid spawn parameters")]
    BadParams,

    /// Operation called out of order, e.g. a second `init`.
    #[error("operation called out of order")]
    UnexpectedCall,

    /// A broker primitive (servicing thread, channel) could not be created.
    #[error("failed to create a broker primitive: {0}")]
    ResourceCreation(#[source] io::Error),

    /// Unclassified OS failure; the original OS error is preserved.
    #[error("operation failed: {0}")]
    Generic(#[source] io::Error),

    /// Building the launch configuration (descriptors, attributes) failed.
    #[error("launch attribute construction failed: {0}")]
    ProcThreadAttributes(String),

    /// The policy could not construct the security tokens.
    #[error("token construction failed: {0}")]
    TokenCreation(String),

    /// The policy could not construct the isolation container.
    #[error("container construction failed: {0}")]
    ContainerCreation(String),

    /// The policy refused ownership of the spawned target.
    #[error("policy refused the target: {0}")]
    PolicyRefused(String),
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, ResultCode>;

/// Distinguished exit codes recorded when the broker kills a container.
pub mod exit_code {
    /// Normal teardown of an already-empty container.
    pub const OK: i32 = 0;
    /// A container breached its memory ceiling and was hard-killed.
    pub const MEMORY_EXCEEDED: i32 = 7006;
}

/// Confinement strength requested by a policy, most restrictive first.
///
/// Targets at `Limited` or below are forbidden from creating further
/// child processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerLevel {
    Lockdown,
    Restricted,
    Limited,
    Interactive,
    /// No container is created at all; the target runs untracked.
    Unprotected,
}

impl ContainerLevel {
    /// Whether targets at this level may spawn children of their own.
    pub fn allows_child_processes(self) -> bool {
        self > ContainerLevel::Limited
    }
}

/// Exploit-mitigation flags applied to the target before exec.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Mitigations {
    /// Forbid privilege escalation through setuid/filecap execs.
    pub no_new_privileges: bool,
    /// Make the target invisible to ptrace/core dumps.
    pub non_dumpable: bool,
    /// Kill the target when the broker dies.
    pub die_with_parent: bool,
}

impl Default for Mitigations {
    fn default() -> Self {
        Self {
            no_new_privileges: true,
            non_dumpable: true,
            die_with_parent: true,
        }
    }
}

/// One credential set applied to a target process.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// The three security contexts a policy derives for one target.
///
/// `lockdown` is applied at exec; `initial` and `restricted` are carried on
/// the target handle for the collaborator that finishes target setup.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenSet {
    pub initial: Credentials,
    pub lockdown: Credentials,
    pub restricted: Credentials,
}

/// Resource ceilings enforced by an isolation container.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ContainerLimits {
    /// Memory ceiling in bytes
    pub memory_limit: Option<u64>,
    /// Maximum number of live processes in the container
    pub process_limit: Option<u32>,
}

static NEXT_CONTAINER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one isolation container.
///
/// Remains meaningful as a lookup value after the container is closed, so a
/// policy can release state keyed by it from `on_container_empty`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(u64);

impl ContainerId {
    pub fn next() -> Self {
        ContainerId(NEXT_CONTAINER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container-{}", self.0)
    }
}

/// Key tagging a container's notifications on the event channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrackerKey(u64);

impl TrackerKey {
    pub(crate) fn new(value: u64) -> Self {
        TrackerKey(value)
    }
}

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tracker-{}", self.0)
    }
}

/// What the broker reports back from a successful spawn.
///
/// The target process itself is owned by the policy; the broker keeps only
/// the identity.
#[derive(Clone, Copy, Debug)]
pub struct SpawnedTarget {
    pub pid: u32,
    /// False when the policy provided no container and the target runs
    /// without async lifecycle tracking.
    pub tracked: bool,
    pub spawned_at: chrono::DateTime<chrono::Utc>,
}
