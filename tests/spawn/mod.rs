use crate::common::{self, StubPolicy};
use sandbroker::broker::Broker;
use sandbroker::policy::Policy;
use sandbroker::types::ResultCode;
use serial_test::serial;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[test]
fn init_twice_reports_unexpected_call() {
    let mut broker = Broker::new();
    broker.init().unwrap();
    assert!(matches!(broker.init(), Err(ResultCode::UnexpectedCall)));
}

#[test]
fn empty_path_is_bad_params_with_no_side_effects() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();
    let dyn_policy: Arc<dyn Policy> = policy.clone();

    let result = broker.spawn_target(Path::new(""), &[], dyn_policy);

    assert!(matches!(result, Err(ResultCode::BadParams)));
    assert_eq!(policy.containers_made.load(Ordering::SeqCst), 0);
    assert_eq!(policy.links_captured(), 0);
    assert!(policy.targets.lock().unwrap().is_empty());
}

#[test]
fn token_failure_propagates_verbatim() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::failing_tokens();
    let dyn_policy: Arc<dyn Policy> = policy.clone();

    let result = broker.spawn_target(Path::new("/bin/true"), &[], dyn_policy);

    assert!(matches!(result, Err(ResultCode::TokenCreation(_))));
    // No container and no process came out of the failed spawn.
    assert_eq!(policy.containers_made.load(Ordering::SeqCst), 0);
    assert!(policy.targets.lock().unwrap().is_empty());
}

#[test]
#[serial]
fn successful_spawn_is_tracked_and_active() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::confined();

    let spawned = common::spawn_true(&mut broker, &policy);

    assert!(spawned.tracked);
    assert!(broker.is_active_target(spawned.pid));
    assert!(broker.has_active_targets());
    assert_eq!(policy.targets.lock().unwrap().len(), 1);
    assert_eq!(
        policy.container_log.added.lock().unwrap().as_slice(),
        &[spawned.pid]
    );
    assert_eq!(policy.links_captured(), 1);
}

#[test]
#[serial]
fn containerless_spawn_succeeds_untracked() {
    let mut broker = common::initialized_broker();
    let policy = StubPolicy::unconfined();

    let spawned = common::spawn_true(&mut broker, &policy);

    assert!(!spawned.tracked);
    assert!(!broker.is_active_target(spawned.pid));
    assert_eq!(policy.targets.lock().unwrap().len(), 1);
    // Nothing will ever report this target's exit, so the shutdown barrier
    // opens at spawn time.
    assert!(!broker.has_active_targets());
    broker.wait_for_all_targets();
}

#[test]
#[serial]
fn teardown_releases_remaining_trackers() {
    let policy = StubPolicy::confined();
    {
        let mut broker = common::initialized_broker();
        common::spawn_true(&mut broker, &policy);
    }
    // Broker drop stops the servicing thread and force-frees the tracker.
    assert_eq!(policy.container_log.closes.load(Ordering::SeqCst), 1);
    assert_eq!(policy.empty_notices.lock().unwrap().len(), 1);
}
