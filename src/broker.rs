/// Broker orchestrator: spawn targets and supervise their containers
///
/// The broker couples three things: privileged construction of the target's
/// security context and container, asynchronous servicing of container
/// lifecycle notifications on one dedicated thread, and release of every
/// per-target resource exactly once when its container drains.
use crate::container::{
    ContainerEvent, ControlCommand, EventChannel, EventReceiver, EventSender, Notification,
};
use crate::policy::Policy;
use crate::target::{LaunchOptions, TargetProcess};
use crate::tracker::ContainerTracker;
use crate::types::{exit_code, Result, ResultCode, SpawnedTarget, TrackerKey};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// How long teardown waits for the servicing thread before giving up.
/// Bounded on purpose: an indefinite wait here can deadlock the broker's
/// destructor against its own thread.
const TEARDOWN_WAIT: Duration = Duration::from_secs(1);

/// Manual-reset signal: stays set until explicitly reset, wakes every
/// waiter.
struct ManualResetEvent {
    state: Mutex<bool>,
    cond: Condvar,
}

impl ManualResetEvent {
    fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn reset(&self) {
        *self.state.lock().unwrap() = false;
    }

    fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !*state {
            state = self.cond.wait(state).unwrap();
        }
    }
}

/// Broker state shared with the servicing thread, guarded by one lock.
#[derive(Default)]
struct TrackedState {
    child_pids: HashSet<u32>,
    trackers: HashMap<TrackerKey, ContainerTracker>,
}

struct BrokerShared {
    state: Mutex<TrackedState>,
    no_targets: ManualResetEvent,
}

/// The façade the hosting application drives.
pub struct Broker {
    shared: Arc<BrokerShared>,
    events: Option<EventSender>,
    events_thread: Option<thread::JoinHandle<()>>,
    next_key: u64,
    spawn_thread: OnceLock<thread::ThreadId>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                state: Mutex::new(TrackedState::default()),
                no_targets: ManualResetEvent::new(),
            }),
            events: None,
            events_thread: None,
            next_key: 1,
            spawn_thread: OnceLock::new(),
        }
    }

    /// Create the event channel and start the servicing thread. A second
    /// call reports `UnexpectedCall` and changes nothing.
    pub fn init(&mut self) -> Result<()> {
        if self.events.is_some() || self.events_thread.is_some() {
            return Err(ResultCode::UnexpectedCall);
        }
        let (sender, receiver) = EventChannel::new();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("broker-events".to_string())
            .spawn(move || target_events_thread(shared, receiver))
            .map_err(ResultCode::ResourceCreation)?;
        self.events = Some(sender);
        self.events_thread = Some(handle);
        Ok(())
    }

    /// Spawn one target suspended under `policy`'s restrictions and start
    /// tracking its container.
    ///
    /// Ownership of the target passes to the policy; the broker keeps the
    /// identity and, when a container exists, its own policy share for
    /// async dispatch. Policy failure codes come back verbatim.
    pub fn spawn_target(
        &mut self,
        exe_path: &Path,
        args: &[String],
        policy: Arc<dyn Policy>,
    ) -> Result<SpawnedTarget> {
        if exe_path.as_os_str().is_empty() {
            return Err(ResultCode::BadParams);
        }
        let events = match &self.events {
            Some(events) => events.clone(),
            None => return Err(ResultCode::UnexpectedCall),
        };

        // Shared broker state is mutated below; only one spawn may run at
        // a time.
        let first_spawn_thread = *self.spawn_thread.get_or_init(|| thread::current().id());
        if first_spawn_thread != thread::current().id() {
            debug_assert!(false, "spawn_target must be driven from a single thread");
            log::warn!("spawn_target called from more than one thread");
        }

        let mut state = self.shared.state.lock().unwrap();

        let tokens = policy.make_tokens()?;
        let container = policy.make_container()?;

        let options = LaunchOptions::from_policy(policy.as_ref());
        let target = TargetProcess::spawn_suspended(exe_path, args, tokens, &options)?;
        let pid = target.pid();
        let spawned_at = target.spawned_at();

        match container {
            Some(mut container) => {
                if let Err(code) = container.add_process(pid) {
                    return Err(spawn_cleanup(target, code));
                }

                // The policy owns the target from here on; a rejected
                // target is torn down by its own drop.
                policy.add_target(target)?;

                let key = TrackerKey::new(self.next_key);
                self.next_key += 1;
                let mut tracker = ContainerTracker::new(container, Arc::clone(&policy));
                // No recovery is possible past this point without releasing
                // the target twice, so a failed association is a broken
                // invariant, not an error.
                tracker
                    .associate(events, key)
                    .expect("container association with the event channel failed");
                state.trackers.insert(key, tracker);
                state.child_pids.insert(pid);

                Ok(SpawnedTarget {
                    pid,
                    tracked: true,
                    spawned_at,
                })
            }
            None => {
                policy.add_target(target)?;

                // No container will ever report this target, so the
                // shutdown barrier has to be evaluated here instead of
                // blocking on an exit event that cannot arrive.
                if state.child_pids.is_empty() {
                    self.shared.no_targets.set();
                }

                Ok(SpawnedTarget {
                    pid,
                    tracked: false,
                    spawned_at,
                })
            }
        }
    }

    /// Block until no tracked target remains. This is the shutdown
    /// barrier: no timeout, callers layer one externally if they need it.
    pub fn wait_for_all_targets(&self) {
        self.shared.no_targets.wait();
    }

    /// Non-blocking view of the shutdown barrier state.
    pub fn has_active_targets(&self) -> bool {
        !self.shared.no_targets.is_set()
    }

    pub fn is_active_target(&self, pid: u32) -> bool {
        self.shared.state.lock().unwrap().child_pids.contains(&pid)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // Init never ran; nothing to tear down.
        let Some(events) = self.events.take() else {
            return;
        };
        events.post_quit();

        if let Some(handle) = self.events_thread.take() {
            let deadline = Instant::now() + TEARDOWN_WAIT;
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    log::error!(
                        "event servicing thread did not exit within {:?}; broker state left unreclaimed",
                        TEARDOWN_WAIT
                    );
                    debug_assert!(false, "event servicing thread failed to exit");
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
            let _ = handle.join();
        }

        let mut state = self.shared.state.lock().unwrap();
        for tracker in state.trackers.values_mut() {
            tracker.free_resources();
        }
    }
}

/// Deterministic cleanup once a process exists: kill and reap the partial
/// target, hand back the original failure unchanged.
fn spawn_cleanup(mut target: TargetProcess, code: ResultCode) -> ResultCode {
    target.terminate();
    code
}

/// The servicing loop. Drains the channel for the broker's lifetime and
/// dispatches each notification to the tracker it is tagged with.
///
/// The live-target counters stay on this thread's stack; only the pid-set
/// mutations take the broker lock, and only for the minimal section.
fn target_events_thread(shared: Arc<BrokerShared>, events: EventReceiver) {
    // The no-targets signal is created unset; it only transitions from
    // here on, so a containerless spawn can set it without racing thread
    // startup.
    let mut target_count: i64 = 0;
    let mut untracked_count: i64 = 0;

    loop {
        let notification = match events.wait() {
            Some(notification) => notification,
            // Every sender is gone; nothing further can arrive.
            None => return,
        };

        let (key, event) = match notification {
            Notification::Control(ControlCommand::Quit) => return,
            Notification::Container { key, event } => (key, event),
        };

        match event {
            ContainerEvent::AllProcessesExited => {
                // The container drained. Nothing can appear in it out of
                // thin air, so its tracker can release the policy now.
                let mut state = shared.state.lock().unwrap();
                let tracker = state
                    .trackers
                    .get_mut(&key)
                    .expect("notification for a container the broker does not track");
                tracker.free_resources();
            }
            ContainerEvent::ProcessCreated(pid) => {
                {
                    let state = shared.state.lock().unwrap();
                    if !state.child_pids.contains(&pid) {
                        // A process the target spawned itself.
                        untracked_count += 1;
                    }
                }
                target_count += 1;
                if target_count == 1 {
                    shared.no_targets.reset();
                }
            }
            ContainerEvent::ProcessExited(pid) | ContainerEvent::AbnormalProcessExit(pid) => {
                let tracked = shared.state.lock().unwrap().child_pids.remove(&pid);
                if !tracked {
                    untracked_count -= 1;
                    debug_assert!(untracked_count >= 0);
                }
                target_count -= 1;
                if target_count == 0 {
                    shared.no_targets.set();
                }
                debug_assert!(target_count >= 0);
            }
            ContainerEvent::ProcessLimitExceeded => {
                // A member failed to create a child past the process cap;
                // the OS reports no pid for it.
                untracked_count += 1;
                target_count += 1;
            }
            ContainerEvent::MemoryLimitExceeded => {
                let mut state = shared.state.lock().unwrap();
                let tracker = state
                    .trackers
                    .get_mut(&key)
                    .expect("notification for a container the broker does not track");
                tracker.terminate_all(exit_code::MEMORY_EXCEEDED);
            }
        }
    }
}
