/// Policy collaborator interface
///
/// The broker never decides what restrictions apply; it consumes a policy
/// through this narrow trait and forwards policy failure codes verbatim.
use crate::cgroup::CgroupContainer;
use crate::container::Container;
use crate::target::TargetProcess;
use crate::types::{
    ContainerId, ContainerLevel, ContainerLimits, Credentials, Mitigations, Result, TokenSet,
};
use serde::{Deserialize, Serialize};
use std::os::unix::io::RawFd;
use std::sync::Mutex;

/// What the broker needs from the policy engine for one target.
///
/// Implementations are shared between the spawning thread and the event
/// servicing thread, so everything here takes `&self`.
pub trait Policy: Send + Sync {
    /// Derive the initial/lockdown/restricted security contexts.
    fn make_tokens(&self) -> Result<TokenSet>;

    /// Build the isolation container for the target. `Ok(None)` means the
    /// policy runs this target unconfined and untracked.
    fn make_container(&self) -> Result<Option<Box<dyn Container>>>;

    fn process_mitigations(&self) -> Mitigations;

    fn container_level(&self) -> ContainerLevel;

    /// Name of an alternate session to detach the target into, if any.
    fn alternate_session(&self) -> Option<String>;

    fn stdout_handle(&self) -> Option<RawFd>;

    fn stderr_handle(&self) -> Option<RawFd>;

    /// Additional descriptors the target is allowed to inherit.
    fn shared_handles(&self) -> Vec<RawFd>;

    /// Environment variables granted to the target.
    fn environment(&self) -> Vec<(String, String)>;

    /// Take ownership of a freshly spawned (still suspended) target.
    fn add_target(&self, target: TargetProcess) -> Result<()>;

    /// The container is gone; release anything keyed by its identity.
    fn on_container_empty(&self, container: ContainerId);
}

/// Serializable configuration backing `BasicPolicy`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Confinement strength for spawned targets
    pub level: ContainerLevel,
    /// Exploit mitigations applied before exec
    pub mitigations: Mitigations,
    /// Memory ceiling in bytes
    pub memory_limit: Option<u64>,
    /// Maximum number of live processes in the container
    pub process_limit: Option<u32>,
    /// User ID targets run as
    pub uid: Option<u32>,
    /// Group ID targets run as
    pub gid: Option<u32>,
    /// Detach targets into a session of their own
    pub alternate_session: Option<String>,
    /// Let targets write to the broker's stdout/stderr
    pub inherit_stdio: bool,
    /// Extra environment variables for targets
    pub environment: Vec<(String, String)>,
    /// Fail hard when container support is unavailable
    pub strict_mode: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            level: ContainerLevel::Lockdown,
            mitigations: Mitigations::default(),
            memory_limit: Some(128 * 1024 * 1024), // 128MB default
            process_limit: Some(1),
            uid: None,
            gid: None,
            alternate_session: None,
            inherit_stdio: true,
            environment: Vec::new(),
            strict_mode: false,
        }
    }
}

/// Minimal concrete policy used by the binary and the tests.
///
/// Spawned targets are retained until the owner collects them with
/// `take_targets` to resume and await them.
pub struct BasicPolicy {
    config: PolicyConfig,
    targets: Mutex<Vec<TargetProcess>>,
}

impl BasicPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Hand the retained targets to the caller, oldest first.
    pub fn take_targets(&self) -> Vec<TargetProcess> {
        std::mem::take(&mut *self.targets.lock().unwrap())
    }
}

impl Policy for BasicPolicy {
    fn make_tokens(&self) -> Result<TokenSet> {
        let restricted = Credentials {
            uid: self.config.uid,
            gid: self.config.gid,
        };
        Ok(TokenSet {
            initial: Credentials::default(),
            lockdown: restricted,
            restricted,
        })
    }

    fn make_container(&self) -> Result<Option<Box<dyn Container>>> {
        if self.config.level == ContainerLevel::Unprotected {
            return Ok(None);
        }
        let limits = ContainerLimits {
            memory_limit: self.config.memory_limit,
            process_limit: self.config.process_limit,
        };
        let container = CgroupContainer::new(limits, self.config.strict_mode)?;
        Ok(Some(Box::new(container)))
    }

    fn process_mitigations(&self) -> Mitigations {
        self.config.mitigations
    }

    fn container_level(&self) -> ContainerLevel {
        self.config.level
    }

    fn alternate_session(&self) -> Option<String> {
        self.config.alternate_session.clone()
    }

    fn stdout_handle(&self) -> Option<RawFd> {
        self.config.inherit_stdio.then_some(libc::STDOUT_FILENO)
    }

    fn stderr_handle(&self) -> Option<RawFd> {
        self.config.inherit_stdio.then_some(libc::STDERR_FILENO)
    }

    fn shared_handles(&self) -> Vec<RawFd> {
        Vec::new()
    }

    fn environment(&self) -> Vec<(String, String)> {
        self.config.environment.clone()
    }

    fn add_target(&self, target: TargetProcess) -> Result<()> {
        log::debug!(
            "policy took ownership of target pid {} ({})",
            target.pid(),
            target.exe_path().display()
        );
        self.targets.lock().unwrap().push(target);
        Ok(())
    }

    fn on_container_empty(&self, container: ContainerId) {
        log::debug!("{} is empty, releasing policy state", container);
    }
}
