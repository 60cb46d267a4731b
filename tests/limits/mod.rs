//! End-to-end lifecycle through the real cgroup-backed container.
use crate::common;
use sandbroker::broker::Broker;
use sandbroker::policy::{BasicPolicy, Policy, PolicyConfig};
use sandbroker::types::ContainerLevel;
use serial_test::serial;
use std::path::Path;
use std::sync::Arc;

fn spawn_real(
    broker: &mut Broker,
    policy: &Arc<BasicPolicy>,
    exe: &str,
    args: &[&str],
) -> sandbroker::types::SpawnedTarget {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let dyn_policy: Arc<dyn Policy> = policy.clone();
    broker
        .spawn_target(Path::new(exe), &args, dyn_policy)
        .expect("spawn failed")
}

#[test]
#[serial]
fn real_target_lifecycle_opens_the_barrier() {
    let mut broker = common::initialized_broker();
    let mut config = PolicyConfig::default();
    config.inherit_stdio = false;
    let policy = Arc::new(BasicPolicy::new(config));

    let spawned = spawn_real(&mut broker, &policy, "/bin/sleep", &["0.2"]);
    assert!(spawned.tracked);
    assert!(broker.is_active_target(spawned.pid));

    let mut target = policy.take_targets().pop().expect("target retained");
    target.resume().expect("resume failed");
    let status = target.wait().expect("wait failed");
    assert!(status.success());

    common::wait_until("the barrier to open", || !broker.has_active_targets());
    broker.wait_for_all_targets();
    assert!(!broker.is_active_target(spawned.pid));
}

#[test]
#[serial]
fn unprotected_target_runs_without_tracking() {
    let mut broker = common::initialized_broker();
    let mut config = PolicyConfig::default();
    config.level = ContainerLevel::Unprotected;
    config.inherit_stdio = false;
    let policy = Arc::new(BasicPolicy::new(config));

    let spawned = spawn_real(&mut broker, &policy, "/bin/true", &[]);
    assert!(!spawned.tracked);
    assert!(!broker.is_active_target(spawned.pid));

    let mut target = policy.take_targets().pop().expect("target retained");
    target.resume().expect("resume failed");
    assert!(target.wait().expect("wait failed").success());

    // Untracked targets never hold the shutdown barrier.
    broker.wait_for_all_targets();
}

#[test]
#[serial]
fn terminated_target_reports_the_kill() {
    let mut broker = common::initialized_broker();
    let mut config = PolicyConfig::default();
    config.inherit_stdio = false;
    let policy = Arc::new(BasicPolicy::new(config));

    spawn_real(&mut broker, &policy, "/bin/sleep", &["30"]);

    let mut target = policy.take_targets().pop().expect("target retained");
    target.resume().expect("resume failed");
    target.terminate();

    common::wait_until("the barrier to open", || !broker.has_active_targets());
}
