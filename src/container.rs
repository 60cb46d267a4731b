/// Isolation container abstraction and the broker event channel
///
/// The broker and its servicing loop stay OS-agnostic behind this seam: a
/// `Container` is whatever kernel grouping construct bounds a target and its
/// descendants, and every container posts its lifecycle notifications into
/// one shared channel, tagged with the key it was associated under.
use crate::types::{ContainerId, Result, TrackerKey};
use std::sync::mpsc::{channel, Receiver, Sender};

/// Lifecycle notifications a container can deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A process entered the container.
    ProcessCreated(u32),
    /// A process left the container through a normal exit.
    ProcessExited(u32),
    /// A process left the container by crash or kill.
    AbnormalProcessExit(u32),
    /// The container no longer holds any process.
    AllProcessesExited,
    /// A member tried to create a child past the process cap. The OS does
    /// not report which one.
    ProcessLimitExceeded,
    /// The container breached its memory ceiling.
    MemoryLimitExceeded,
}

/// Commands addressed to the servicing thread itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Quit,
}

/// One message on the broker channel.
#[derive(Clone, Copy, Debug)]
pub enum Notification {
    Control(ControlCommand),
    Container {
        key: TrackerKey,
        event: ContainerEvent,
    },
}

/// Posting side of the broker channel. Cloned into every container monitor.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Notification>,
}

impl EventSender {
    /// Post a container-tagged event. Returns false once the receiving side
    /// is gone, which tells a monitor to stop.
    pub fn post_event(&self, key: TrackerKey, event: ContainerEvent) -> bool {
        self.tx.send(Notification::Container { key, event }).is_ok()
    }

    pub fn post_quit(&self) -> bool {
        self.tx
            .send(Notification::Control(ControlCommand::Quit))
            .is_ok()
    }
}

/// Draining side of the broker channel, owned by the servicing thread.
pub struct EventReceiver {
    rx: Receiver<Notification>,
}

impl EventReceiver {
    /// Block until the next notification. `None` means every sender is gone
    /// and nothing further can arrive.
    pub fn wait(&self) -> Option<Notification> {
        self.rx.recv().ok()
    }
}

/// The single notification channel all containers are associated with.
pub struct EventChannel;

impl EventChannel {
    pub fn new() -> (EventSender, EventReceiver) {
        let (tx, rx) = channel();
        (EventSender { tx }, EventReceiver { rx })
    }
}

/// An OS-level grouping construct bounding one target and its descendants.
///
/// Implementations own the kernel object; the broker only ever holds one
/// behind a tracker.
pub trait Container: Send {
    /// Stable identity. Stays valid as a value after `close`.
    fn id(&self) -> ContainerId;

    /// Place a process under this container's control.
    fn add_process(&mut self, pid: u32) -> Result<()>;

    /// Start delivering this container's lifecycle events into `events`,
    /// tagged with `key`.
    fn associate(&mut self, events: EventSender, key: TrackerKey) -> Result<()>;

    /// Number of processes currently confined.
    fn active_processes(&self) -> usize;

    /// Kill every confined process. Must be a no-op when the container is
    /// already empty. `reason_code` records why in the kill report.
    fn terminate_all(&mut self, reason_code: i32);

    /// Release the kernel-side construct. Idempotent; the identity value
    /// survives.
    fn close(&mut self);
}
