/// Broker-side record pairing one container with its owning policy
use crate::container::{Container, EventSender};
use crate::policy::Policy;
use crate::types::{exit_code, Result, TrackerKey};
use std::sync::Arc;

/// Holds exclusive ownership of one container plus the broker's share of the
/// policy that configured it. Releasing both is funneled through
/// `free_resources`, which makes a double release structurally unreachable:
/// the policy slot is taken on the first call and every release step is
/// gated on it.
pub struct ContainerTracker {
    container: Box<dyn Container>,
    policy: Option<Arc<dyn Policy>>,
}

impl ContainerTracker {
    pub fn new(container: Box<dyn Container>, policy: Arc<dyn Policy>) -> Self {
        Self {
            container,
            policy: Some(policy),
        }
    }

    pub fn associate(&mut self, events: EventSender, key: TrackerKey) -> Result<()> {
        self.container.associate(events, key)
    }

    /// Release everything this tracker holds. The second call is a no-op.
    pub fn free_resources(&mut self) {
        if let Some(policy) = self.policy.take() {
            self.container.terminate_all(exit_code::OK);
            // Closing destroys the kernel object; the identity stays usable
            // as a lookup value for the policy afterwards.
            let stale_id = self.container.id();
            self.container.close();
            policy.on_container_empty(stale_id);
        }
    }

    /// Hard-kill every process still in the container. No-op once freed.
    pub fn terminate_all(&mut self, reason_code: i32) {
        if self.policy.is_some() {
            self.container.terminate_all(reason_code);
        }
    }

    pub fn is_freed(&self) -> bool {
        self.policy.is_none()
    }
}

impl Drop for ContainerTracker {
    fn drop(&mut self) {
        self.free_resources();
    }
}
