use crate::common::{self, StubPolicy};
use sandbroker::container::ContainerEvent;
use sandbroker::types::exit_code;
use serial_test::serial;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

#[test]
#[serial]
fn exit_event_clears_tracking_and_opens_the_barrier() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();
    let spawned = common::spawn_true(&mut broker, &policy);

    policy.post(0, ContainerEvent::ProcessCreated(spawned.pid));
    policy.post(0, ContainerEvent::ProcessExited(spawned.pid));

    common::wait_until("exit to be processed", || {
        !broker.is_active_target(spawned.pid)
    });
    common::wait_until("the barrier to open", || !broker.has_active_targets());
    // The blocking wait returns once the signal is set.
    broker.wait_for_all_targets();
}

#[test]
#[serial]
fn two_targets_hold_the_barrier_until_both_exit() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();
    let a = common::spawn_true(&mut broker, &policy);
    let b = common::spawn_true(&mut broker, &policy);

    policy.post(0, ContainerEvent::ProcessCreated(a.pid));
    policy.post(1, ContainerEvent::ProcessCreated(b.pid));

    policy.post(0, ContainerEvent::ProcessExited(a.pid));
    common::wait_until("first exit to be processed", || {
        !broker.is_active_target(a.pid)
    });
    assert!(broker.is_active_target(b.pid));
    assert!(broker.has_active_targets());

    policy.post(1, ContainerEvent::AbnormalProcessExit(b.pid));
    common::wait_until("the barrier to open", || !broker.has_active_targets());
    assert!(!broker.is_active_target(b.pid));
}

#[test]
#[serial]
fn grandchildren_are_accounted_as_untracked() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();
    let spawned = common::spawn_true(&mut broker, &policy);

    policy.post(0, ContainerEvent::ProcessCreated(spawned.pid));
    // A process the target spawned itself; never in the tracked set.
    policy.post(0, ContainerEvent::ProcessCreated(424_242));
    policy.post(0, ContainerEvent::ProcessExited(424_242));
    policy.post(0, ContainerEvent::ProcessExited(spawned.pid));

    common::wait_until("the barrier to open", || !broker.has_active_targets());
}

#[test]
#[serial]
fn process_limit_hit_counts_as_an_untracked_target() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();
    let spawned = common::spawn_true(&mut broker, &policy);

    policy.post(0, ContainerEvent::ProcessCreated(spawned.pid));
    // A blocked grandchild spawn; the OS reports no pid for it.
    policy.post(0, ContainerEvent::ProcessLimitExceeded);

    policy.post(0, ContainerEvent::ProcessExited(spawned.pid));
    common::wait_until("tracked exit to be processed", || {
        !broker.is_active_target(spawned.pid)
    });
    // The phantom entry still holds the barrier.
    assert!(broker.has_active_targets());

    policy.post(0, ContainerEvent::AbnormalProcessExit(535_353));
    common::wait_until("the barrier to open", || !broker.has_active_targets());
}

#[test]
#[serial]
fn container_drain_frees_the_tracker_once() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();
    let spawned = common::spawn_true(&mut broker, &policy);

    policy.post(0, ContainerEvent::ProcessCreated(spawned.pid));
    policy.post(0, ContainerEvent::ProcessExited(spawned.pid));
    policy.post(0, ContainerEvent::AllProcessesExited);

    common::wait_until("the policy to be notified", || {
        policy.empty_notices.lock().unwrap().len() == 1
    });
    assert_eq!(policy.container_log.closes.load(Ordering::SeqCst), 1);

    // A duplicate drain notification hits an already-freed tracker.
    policy.post(0, ContainerEvent::AllProcessesExited);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(policy.container_log.closes.load(Ordering::SeqCst), 1);
    assert_eq!(policy.empty_notices.lock().unwrap().len(), 1);
}

#[test]
#[serial]
fn memory_limit_hard_kills_the_container() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();
    let spawned = common::spawn_true(&mut broker, &policy);

    policy.post(0, ContainerEvent::ProcessCreated(spawned.pid));
    policy.post(0, ContainerEvent::ProcessCreated(777_777));
    policy.post(0, ContainerEvent::MemoryLimitExceeded);

    common::wait_until("the container to be killed", || {
        policy
            .container_log
            .terminations
            .lock()
            .unwrap()
            .contains(&exit_code::MEMORY_EXCEEDED)
    });

    // The kills surface as exit events and settle the accounting.
    policy.post(0, ContainerEvent::AbnormalProcessExit(spawned.pid));
    policy.post(0, ContainerEvent::AbnormalProcessExit(777_777));
    common::wait_until("the barrier to open", || !broker.has_active_targets());
    assert!(!broker.is_active_target(spawned.pid));
}
